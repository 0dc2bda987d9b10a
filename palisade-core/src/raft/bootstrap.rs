//! Seeding and recovery of the raft log for the three bootstrap paths:
//! fresh start, join, and forced standalone restart.

use protobuf::Message as _;
use raft::prelude::{ConfChange, ConfChangeType, ConfState, Entry, EntryType, Snapshot};
use tracing::info;

use crate::cluster::{Cluster, ConfChangeContext, ConfChangeKind, Member};
use crate::error::{PalisadeError, PalisadeResult};

use super::storage::DiskStorage;

/// Key the storage to this member and, for a fresh cluster, seed the log
/// with one committed ConfChangeAddNode entry per initial member. The apply
/// engine replays those entries through the normal path, which is what
/// persists the initial membership into the store.
pub fn start_node(
    storage: &DiskStorage,
    cluster: &Cluster,
    self_id: u64,
    bootstrap_ids: Option<&[u64]>,
) -> PalisadeResult<()> {
    storage.save_metadata(self_id, cluster.id())?;

    let Some(ids) = bootstrap_ids else {
        // Joining an existing cluster: the log arrives from the leader.
        return Ok(());
    };

    let mut entries = Vec::with_capacity(ids.len());
    for (i, id) in ids.iter().enumerate() {
        let member = cluster.member(*id).unwrap_or_else(|| {
            panic!("bootstrap member {:x} should exist in the cluster", id)
        });
        entries.push(conf_change_entry(
            ConfChangeType::AddNode,
            *id,
            ConfChangeContext {
                kind: ConfChangeKind::Add,
                member: Some(member),
            },
            1,
            (i + 1) as u64,
        )?);
    }

    let commit = entries.len() as u64;
    storage.append(&entries)?;

    let mut hs = storage.hard_state()?;
    hs.term = 1;
    hs.commit = commit;
    storage.save_hard_state(&hs)?;

    let mut cs = ConfState::default();
    cs.voters = ids.to_vec();
    storage.save_conf_state(&cs)?;

    info!(
        members = ids.len(),
        "seeded log with bootstrap membership entries"
    );
    Ok(())
}

/// Forced standalone restart: discard uncommitted tail entries, then
/// force-append committed ConfChangeRemoveNode entries for every member but
/// self (and an add for self if the log somehow lost it). The apply engine
/// replays these like any other committed entries, shrinking the cluster to
/// one member without quorum.
pub fn restart_as_standalone_node(
    storage: &DiskStorage,
    self_member: &Member,
) -> PalisadeResult<()> {
    let mut hs = storage.hard_state()?;

    let dropped = storage.discard_after(hs.commit)?;
    if dropped > 0 {
        info!(count = dropped, "discarding uncommitted log entries");
    }

    let snapshot = storage.latest_snapshot()?;
    let (trunc_index, _) = storage.truncated()?;
    let entries = storage.entries_after(trunc_index)?;
    let ids = collect_ids(snapshot.as_ref(), &entries);

    let to_append = create_conf_change_entries(&ids, self_member, hs.term, hs.commit)?;
    if to_append.is_empty() {
        return Ok(());
    }
    let last = to_append.last().map(|e| e.index).unwrap_or(hs.commit);
    storage.append(&to_append)?;
    hs.commit = last;
    storage.save_hard_state(&hs)?;

    info!(
        synthesized = to_append.len(),
        commit = hs.commit,
        "forced standalone restart"
    );
    Ok(())
}

/// The ordered set of member ids carried by a snapshot plus a log suffix.
/// Add entries introduce an id, remove entries retire it; updates leave the
/// set unchanged.
pub fn collect_ids(snapshot: Option<&Snapshot>, entries: &[Entry]) -> Vec<u64> {
    let mut ids = std::collections::BTreeSet::new();
    if let Some(snapshot) = snapshot {
        for id in &snapshot.get_metadata().get_conf_state().voters {
            ids.insert(*id);
        }
    }
    for entry in entries {
        if entry.get_entry_type() != EntryType::EntryConfChange {
            continue;
        }
        let mut cc = ConfChange::default();
        if cc.merge_from_bytes(&entry.data).is_err() {
            panic!("unmarshal conf change should never fail");
        }
        match cc.get_change_type() {
            ConfChangeType::AddNode => {
                ids.insert(cc.node_id);
            }
            ConfChangeType::RemoveNode => {
                ids.remove(&cc.node_id);
            }
            ConfChangeType::AddLearnerNode => {}
        }
    }
    ids.into_iter().collect()
}

/// Entries that remove every id except `self_member.id`, plus an add for
/// self when it is missing from the set. Indices continue from `index`.
pub fn create_conf_change_entries(
    ids: &[u64],
    self_member: &Member,
    term: u64,
    index: u64,
) -> PalisadeResult<Vec<Entry>> {
    let mut entries = Vec::new();
    let mut next = index + 1;
    let mut found_self = false;

    for id in ids {
        if *id == self_member.id {
            found_self = true;
            continue;
        }
        entries.push(conf_change_entry(
            ConfChangeType::RemoveNode,
            *id,
            ConfChangeContext {
                kind: ConfChangeKind::Remove,
                member: None,
            },
            term,
            next,
        )?);
        next += 1;
    }

    if !found_self {
        entries.push(conf_change_entry(
            ConfChangeType::AddNode,
            self_member.id,
            ConfChangeContext {
                kind: ConfChangeKind::Add,
                member: Some(self_member.clone()),
            },
            term,
            next,
        )?);
    }
    Ok(entries)
}

fn conf_change_entry(
    change_type: ConfChangeType,
    node_id: u64,
    context: ConfChangeContext,
    term: u64,
    index: u64,
) -> PalisadeResult<Entry> {
    let mut cc = ConfChange::default();
    cc.set_change_type(change_type);
    cc.node_id = node_id;
    cc.context = bincode::serialize(&context)
        .map_err(|e| PalisadeError::serialization("serialize conf change context", e))?
        .into();

    let mut entry = Entry::default();
    entry.set_entry_type(EntryType::EntryConfChange);
    entry.term = term;
    entry.index = index;
    entry.data = cc
        .write_to_bytes()
        .map_err(|e| PalisadeError::serialization("serialize conf change", e))?
        .into();
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str) -> Member {
        Member::new(name, vec![format!("http://{}:2380", name)], "tok")
    }

    fn add_entry(id: u64, index: u64) -> Entry {
        conf_change_entry(
            ConfChangeType::AddNode,
            id,
            ConfChangeContext {
                kind: ConfChangeKind::Add,
                member: Some(member("x")),
            },
            1,
            index,
        )
        .unwrap()
    }

    fn remove_entry(id: u64, index: u64) -> Entry {
        conf_change_entry(
            ConfChangeType::RemoveNode,
            id,
            ConfChangeContext {
                kind: ConfChangeKind::Remove,
                member: None,
            },
            1,
            index,
        )
        .unwrap()
    }

    #[test]
    fn test_collect_ids_from_snapshot_and_entries() {
        let mut cs = ConfState::default();
        cs.voters = vec![1, 2, 3];
        let mut meta = raft::prelude::SnapshotMetadata::default();
        meta.set_conf_state(cs);
        let mut snapshot = Snapshot::default();
        snapshot.set_metadata(meta);

        let entries = vec![add_entry(4, 10), remove_entry(2, 11)];
        assert_eq!(collect_ids(Some(&snapshot), &entries), vec![1, 3, 4]);
    }

    #[test]
    fn test_collect_ids_without_snapshot() {
        let entries = vec![add_entry(5, 1), add_entry(6, 2), remove_entry(5, 3)];
        assert_eq!(collect_ids(None, &entries), vec![6]);
    }

    #[test]
    fn test_standalone_entries_remove_every_other_member() {
        let me = member("n1");
        let ids = vec![1, 2, me.id];
        let entries = create_conf_change_entries(&ids, &me, 5, 100).unwrap();

        assert_eq!(entries.len(), 2);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.index, 101 + i as u64);
            assert_eq!(entry.term, 5);
            let mut cc = ConfChange::default();
            cc.merge_from_bytes(&entry.data).unwrap();
            assert_eq!(cc.get_change_type(), ConfChangeType::RemoveNode);
            assert_ne!(cc.node_id, me.id);
        }
    }

    #[test]
    fn test_standalone_entries_add_self_when_missing() {
        let me = member("n1");
        let entries = create_conf_change_entries(&[7], &me, 2, 40).unwrap();

        assert_eq!(entries.len(), 2);
        let mut cc = ConfChange::default();
        cc.merge_from_bytes(&entries[1].data).unwrap();
        assert_eq!(cc.get_change_type(), ConfChangeType::AddNode);
        assert_eq!(cc.node_id, me.id);

        // The add carries the caller-supplied peer urls for self.
        let ctx: ConfChangeContext = bincode::deserialize(&cc.context).unwrap();
        assert_eq!(
            ctx.member.unwrap().peer_urls(),
            &["http://n1:2380".to_string()]
        );
    }

    #[test]
    fn test_start_node_seeds_committed_membership_entries() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(&dir.path().join("raft.db")).unwrap();

        let cluster =
            Cluster::from_string("tok", "n1=http://n1:2380,n2=http://n2:2380").unwrap();
        let ids = cluster.member_ids();
        let self_id = ids[0];

        start_node(&storage, &cluster, self_id, Some(&ids)).unwrap();

        assert!(storage.is_initialized().unwrap());
        assert_eq!(storage.metadata().unwrap(), Some((self_id, cluster.id())));

        let hs = storage.hard_state().unwrap();
        assert_eq!(hs.commit, 2);
        assert_eq!(hs.term, 1);
        assert_eq!(storage.conf_state().unwrap().voters, ids);

        let entries = storage.entries_after(0).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(collect_ids(None, &entries), ids);
    }
}
