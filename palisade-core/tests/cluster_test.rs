//! Multi-node scenarios: convergence, membership changes, and rejection of
//! removed members.

mod common;

use std::sync::Arc;
use std::time::Duration;

use raft::prelude::{Message, MessageType};
use sha1::{Digest, Sha1};

use palisade_core::{LocalMesh, Member, PalisadeError, Server};

use common::*;

async fn three_nodes(
    dir: &tempfile::TempDir,
    mesh: &Arc<LocalMesh>,
) -> Vec<Arc<Server>> {
    let names = ["n1", "n2", "n3"];
    let spec = cluster_spec(&names);
    let mut servers = Vec::new();
    for name in names {
        servers.push(start_node(mesh, node_config(name, dir.path(), &spec, true)).await);
    }
    let refs: Vec<&Arc<Server>> = servers.iter().collect();
    wait_for_leader(&refs).await;
    servers
}

fn leader_of(servers: &[Arc<Server>]) -> Arc<Server> {
    servers
        .iter()
        .find(|s| s.is_leader())
        .cloned()
        .expect("one server is the leader")
}

fn expected_cluster_id(ids: &[u64]) -> u64 {
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    let mut hasher = Sha1::new();
    for id in sorted {
        hasher.update(id.to_be_bytes());
    }
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_writes_converge_to_one_value() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = LocalMesh::new();
    let servers = three_nodes(&dir, &mesh).await;

    // Two clients race on the same key through different members; both
    // writes serialize through the log and everyone agrees on the winner.
    let (r1, r2) = tokio::join!(
        servers[0].do_request(put("/k", "1"), REQUEST_TIMEOUT),
        servers[1].do_request(put("/k", "2"), REQUEST_TIMEOUT),
    );
    r1.unwrap();
    r2.unwrap();

    {
        let all: Vec<Arc<Server>> = servers.iter().cloned().collect();
        wait_for(
            "all nodes to agree on /k",
            Duration::from_secs(15),
            move || {
                let values: Vec<Option<String>> =
                    all.iter().map(|s| read_value(s, "/k")).collect();
                values.iter().all(|v| v.is_some() && *v == values[0])
            },
        )
        .await;
    }

    let winner = read_value(&servers[2], "/k").unwrap();
    assert!(winner == "1" || winner == "2");

    for server in servers {
        shutdown_node(&mesh, server).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_member_add_and_catch_up() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = LocalMesh::new();
    let servers = three_nodes(&dir, &mesh).await;
    let leader = leader_of(&servers);

    leader
        .do_request(put("/before-join", "kept"), REQUEST_TIMEOUT)
        .await
        .unwrap();

    // The admin derives the new member exactly the way the member itself
    // will, so every node agrees on its id.
    let new_member = Member::new("n4", vec!["http://n4:2380".to_string()], "integration-test");
    leader
        .add_member(new_member.clone(), REQUEST_TIMEOUT)
        .await
        .unwrap();

    {
        let all: Vec<Arc<Server>> = servers.iter().cloned().collect();
        let id = new_member.id;
        wait_for(
            "every node to list the new member",
            Duration::from_secs(15),
            move || all.iter().all(|s| s.cluster().member_ids().contains(&id)),
        )
        .await;
    }

    // The cluster id is recomputed deterministically from the new id set.
    let mut ids = servers[0].cluster().member_ids();
    assert!(ids.contains(&new_member.id));
    let expected = expected_cluster_id(&ids);
    for server in &servers {
        assert_eq!(server.cluster().id(), expected);
    }

    // Adding the same id again is rejected.
    let err = leader
        .add_member(new_member.clone(), REQUEST_TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, PalisadeError::MemberExists));

    // The new member starts with the full spec and catches up from the
    // leader's log.
    let spec4 = cluster_spec(&["n1", "n2", "n3", "n4"]);
    let n4 = start_node(&mesh, node_config("n4", dir.path(), &spec4, false)).await;
    assert_eq!(n4.id(), new_member.id);

    {
        let n4 = Arc::clone(&n4);
        wait_for(
            "the new member to replay the log",
            Duration::from_secs(30),
            move || read_value(&n4, "/before-join").as_deref() == Some("kept"),
        )
        .await;
    }

    ids.sort_unstable();
    assert_eq!(n4.cluster().member_ids(), ids);

    shutdown_node(&mesh, n4).await;
    for server in servers {
        shutdown_node(&mesh, server).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_removed_member_messages_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = LocalMesh::new();
    let servers = three_nodes(&dir, &mesh).await;
    let leader = leader_of(&servers);

    let survivor = servers
        .iter()
        .find(|s| s.is_leader())
        .cloned()
        .expect("leader exists");
    let removed = servers
        .iter()
        .find(|s| !s.is_leader())
        .cloned()
        .expect("a follower exists");

    leader
        .remove_member(removed.id(), REQUEST_TIMEOUT)
        .await
        .unwrap();

    {
        let survivor = Arc::clone(&survivor);
        let id = removed.id();
        wait_for(
            "the survivor to tombstone the removed member",
            Duration::from_secs(15),
            move || survivor.cluster().is_id_removed(id),
        )
        .await;
    }

    // A late message from the removed member bounces before reaching the
    // raft state machine.
    let mut msg = Message::default();
    msg.set_msg_type(MessageType::MsgHeartbeat);
    msg.from = removed.id();
    msg.to = survivor.id();
    let err = survivor.process(msg).unwrap_err();
    assert!(matches!(err, PalisadeError::MemberRemoved));

    for server in servers {
        shutdown_node(&mesh, server).await;
    }
}
