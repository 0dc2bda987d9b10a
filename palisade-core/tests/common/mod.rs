//! Shared harness for multi-node integration tests: nodes wired together
//! through the in-process channel mesh, plus polling helpers.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use palisade_core::{LocalMesh, Method, NodeConfig, Request, Server};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub fn cluster_spec(names: &[&str]) -> String {
    names
        .iter()
        .map(|n| format!("{}=http://{}:2380", n, n))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn node_config(name: &str, dir: &Path, spec: &str, new_cluster: bool) -> NodeConfig {
    NodeConfig {
        name: name.to_string(),
        data_dir: dir.join(name),
        initial_cluster: spec.to_string(),
        initial_cluster_token: "integration-test".to_string(),
        new_cluster,
        election_ticks: 10,
        tick_ms: 10,
        peer_urls: vec![format!("http://{}:2380", name)],
        client_urls: vec![format!("http://{}:2379", name)],
        ..NodeConfig::default()
    }
}

/// Boot a server on the mesh and pump its inbound messages. Retries while
/// a previous incarnation still holds the database file.
pub async fn start_node(mesh: &Arc<LocalMesh>, cfg: NodeConfig) -> Arc<Server> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let server = loop {
        match Server::new(cfg.clone(), mesh.transport()) {
            Ok(server) => break server,
            Err(e) => {
                if tokio::time::Instant::now() > deadline {
                    panic!("failed to start node {:?}: {}", cfg.name, e);
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    };

    let mut inbox = mesh.register(server.id());
    let pump = Arc::clone(&server);
    tokio::spawn(async move {
        while let Some(msg) = inbox.recv().await {
            let _ = pump.process(msg);
        }
    });

    server.start();
    server
}

/// Stop a node and detach it from the mesh, releasing its database file.
pub async fn shutdown_node(mesh: &Arc<LocalMesh>, server: Arc<Server>) {
    let id = server.id();
    server.stop().await;
    mesh.unregister(id);
    drop(server);
    // Let the spawned tasks observe shutdown and drop their handles.
    tokio::time::sleep(Duration::from_millis(200)).await;
}

pub async fn wait_for<F>(what: &str, timeout: Duration, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_for_leader(servers: &[&Arc<Server>]) {
    wait_for("a leader to be elected", Duration::from_secs(10), || {
        servers.iter().all(|s| s.leader() != 0)
    })
    .await;
}

pub fn put(path: &str, val: &str) -> Request {
    Request {
        method: Method::Put,
        path: path.to_string(),
        val: val.to_string(),
        ..Default::default()
    }
}

pub fn get(path: &str) -> Request {
    Request {
        method: Method::Get,
        path: path.to_string(),
        ..Default::default()
    }
}

/// Local read of a key's value, `None` while the node has not applied it.
pub fn read_value(server: &Arc<Server>, path: &str) -> Option<String> {
    server
        .store()
        .get(path, false, false)
        .ok()
        .and_then(|ev| ev.node.value)
}
