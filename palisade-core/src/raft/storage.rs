//! Durable raft storage backed by a redb database.
//!
//! One database holds the entry log, hard/conf state, the truncation mark
//! left behind by compaction, snapshot records keyed by index, and a
//! metadata record identifying `{node_id, cluster_id}`. A committed redb
//! write transaction is the durability point: entries are on disk before
//! the driver hands any message referencing them to the transport.
//!
//! The log is contiguous: it holds exactly the indices
//! `(truncated.index, last_index]`; everything at or below the truncation
//! mark is only reachable through a snapshot.

use std::path::Path;
use std::sync::Arc;

use raft::prelude::{ConfState, Entry, HardState, Snapshot, SnapshotMetadata};
use raft::{GetEntriesContext, RaftState, StorageError};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::info;

use crate::error::{PalisadeError, PalisadeResult};

use super::codec;

const LOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("raft_log");
const STATE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("raft_state");
const SNAPSHOT_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("raft_snapshots");

const HARD_STATE_KEY: &str = "hard_state";
const CONF_STATE_KEY: &str = "conf_state";
const TRUNCATED_KEY: &str = "truncated";
const METADATA_KEY: &str = "metadata";

#[derive(Clone)]
pub struct DiskStorage {
    db: Arc<Database>,
}

impl DiskStorage {
    pub fn open(path: &Path) -> PalisadeResult<Self> {
        let db = Database::create(path)?;
        let storage = DiskStorage { db: Arc::new(db) };
        storage.init_tables()?;
        Ok(storage)
    }

    fn init_tables(&self) -> PalisadeResult<()> {
        let txn = self.db.begin_write()?;
        {
            let _ = txn.open_table(LOG_TABLE)?;
            let _ = txn.open_table(STATE_TABLE)?;
            let _ = txn.open_table(SNAPSHOT_TABLE)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn read_state(&self, key: &str) -> PalisadeResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(STATE_TABLE)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn write_state(&self, key: &str, value: &[u8]) -> PalisadeResult<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(STATE_TABLE)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Whether this database has been keyed to a member. The bootstrap
    /// decision table treats a keyed database as "a log exists".
    pub fn is_initialized(&self) -> PalisadeResult<bool> {
        Ok(self.read_state(METADATA_KEY)?.is_some())
    }

    /// Key the database to `{node_id, cluster_id}`.
    pub fn save_metadata(&self, node_id: u64, cluster_id: u64) -> PalisadeResult<()> {
        self.write_state(METADATA_KEY, &codec::encode_u64_pair(node_id, cluster_id))
    }

    pub fn metadata(&self) -> PalisadeResult<Option<(u64, u64)>> {
        match self.read_state(METADATA_KEY)? {
            Some(data) => Ok(Some(codec::decode_u64_pair(&data, "metadata")?)),
            None => Ok(None),
        }
    }

    pub fn hard_state(&self) -> PalisadeResult<HardState> {
        match self.read_state(HARD_STATE_KEY)? {
            Some(data) => codec::decode_hard_state(&data),
            None => Ok(HardState::default()),
        }
    }

    pub fn save_hard_state(&self, hs: &HardState) -> PalisadeResult<()> {
        self.write_state(HARD_STATE_KEY, &codec::encode_hard_state(hs))
    }

    pub fn conf_state(&self) -> PalisadeResult<ConfState> {
        match self.read_state(CONF_STATE_KEY)? {
            Some(data) => codec::decode_conf_state(&data),
            None => Ok(ConfState::default()),
        }
    }

    pub fn save_conf_state(&self, cs: &ConfState) -> PalisadeResult<()> {
        self.write_state(CONF_STATE_KEY, &codec::encode_conf_state(cs)?)
    }

    /// `(index, term)` of the last entry discarded by compaction or
    /// snapshot application. `(0, 0)` for a virgin log.
    pub fn truncated(&self) -> PalisadeResult<(u64, u64)> {
        match self.read_state(TRUNCATED_KEY)? {
            Some(data) => codec::decode_u64_pair(&data, "truncated"),
            None => Ok((0, 0)),
        }
    }

    /// Append entries. An entry index that already exists truncates the
    /// existing suffix first; a new leader may overwrite uncommitted
    /// entries from an old term.
    pub fn append(&self, entries: &[Entry]) -> PalisadeResult<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(LOG_TABLE)?;
            let stale: Vec<u64> = table
                .range(first.index..)?
                .filter_map(|r| r.ok().map(|(k, _)| k.value()))
                .collect();
            for key in stale {
                table.remove(&key)?;
            }
            for entry in entries {
                let data = codec::encode_entry(entry)?;
                table.insert(&entry.index, data.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// All entries with index greater than `after`, in order.
    pub fn entries_after(&self, after: u64) -> PalisadeResult<Vec<Entry>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LOG_TABLE)?;
        let mut entries = Vec::new();
        for item in table.range(after + 1..)? {
            let (_, value) = item?;
            entries.push(codec::decode_entry(value.value())?);
        }
        Ok(entries)
    }

    /// Drop entries past `commit`. Used by force-new-cluster recovery to
    /// discard uncommitted tail entries. Returns how many were dropped.
    pub fn discard_after(&self, commit: u64) -> PalisadeResult<usize> {
        let txn = self.db.begin_write()?;
        let dropped;
        {
            let mut table = txn.open_table(LOG_TABLE)?;
            let stale: Vec<u64> = table
                .range(commit + 1..)?
                .filter_map(|r| r.ok().map(|(k, _)| k.value()))
                .collect();
            dropped = stale.len();
            for key in stale {
                table.remove(&key)?;
            }
        }
        txn.commit()?;
        Ok(dropped)
    }

    /// Discard log entries up to and including `index`, leaving the
    /// truncation mark behind so `term(index)` keeps answering. Racing a
    /// newer compaction yields `Compacted`.
    pub fn compact(&self, index: u64) -> PalisadeResult<()> {
        let (trunc_index, _) = self.truncated()?;
        if index <= trunc_index {
            return Err(PalisadeError::Compacted);
        }
        let term = raft::Storage::term(self, index).map_err(|e| PalisadeError::Internal {
            message: format!("compact {} is out of bounds: {}", index, e),
        })?;

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(LOG_TABLE)?;
            let stale: Vec<u64> = table
                .range(..=index)?
                .filter_map(|r| r.ok().map(|(k, _)| k.value()))
                .collect();
            for key in stale {
                table.remove(&key)?;
            }
            let mut state = txn.open_table(STATE_TABLE)?;
            state.insert(TRUNCATED_KEY, codec::encode_u64_pair(index, term).as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Persist a snapshot record.
    pub fn save_snapshot(&self, snapshot: &Snapshot) -> PalisadeResult<()> {
        let data = codec::encode_snapshot(snapshot)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SNAPSHOT_TABLE)?;
            table.insert(&snapshot.get_metadata().index, data.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn latest_snapshot(&self) -> PalisadeResult<Option<Snapshot>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SNAPSHOT_TABLE)?;
        let result = match table.iter()?.rev().next() {
            Some(item) => {
                let (_, value) = item?;
                Ok(Some(codec::decode_snapshot(value.value())?))
            }
            None => Ok(None),
        };
        result
    }

    /// Build and persist a snapshot of the state machine at `index`. Racing
    /// a newer snapshot yields `SnapOutOfDate`.
    pub fn create_snapshot(
        &self,
        index: u64,
        cs: &ConfState,
        data: Vec<u8>,
    ) -> PalisadeResult<Snapshot> {
        if let Some(existing) = self.latest_snapshot()? {
            if existing.get_metadata().index >= index {
                return Err(PalisadeError::SnapOutOfDate);
            }
        }
        let term = raft::Storage::term(self, index).map_err(|_| PalisadeError::SnapOutOfDate)?;

        let mut meta = SnapshotMetadata::default();
        meta.index = index;
        meta.term = term;
        meta.set_conf_state(cs.clone());

        let mut snapshot = Snapshot::default();
        snapshot.set_metadata(meta);
        snapshot.data = data.into();
        self.save_snapshot(&snapshot)?;
        Ok(snapshot)
    }

    /// Absorb an installed snapshot into the log view: everything the
    /// snapshot covers is dropped, state catches up to its metadata. The
    /// snapshot record itself must already be saved.
    pub fn apply_snapshot(&self, snapshot: &Snapshot) -> PalisadeResult<()> {
        let meta = snapshot.get_metadata();

        let mut hs = self.hard_state()?;
        hs.commit = hs.commit.max(meta.index);
        hs.term = hs.term.max(meta.term);

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(LOG_TABLE)?;
            let stale: Vec<u64> = table
                .iter()?
                .filter_map(|r| r.ok().map(|(k, _)| k.value()))
                .collect();
            for key in stale {
                table.remove(&key)?;
            }
            let mut state = txn.open_table(STATE_TABLE)?;
            state.insert(
                TRUNCATED_KEY,
                codec::encode_u64_pair(meta.index, meta.term).as_slice(),
            )?;
            state.insert(HARD_STATE_KEY, codec::encode_hard_state(&hs).as_slice())?;
            state.insert(
                CONF_STATE_KEY,
                codec::encode_conf_state(meta.get_conf_state())?.as_slice(),
            )?;
        }
        txn.commit()?;

        info!(index = meta.index, term = meta.term, "applied snapshot to log");
        Ok(())
    }

    /// Drop all but the newest `keep` snapshot records.
    pub fn purge_snapshots(&self, keep: usize) -> PalisadeResult<usize> {
        let txn = self.db.begin_write()?;
        let purged;
        {
            let mut table = txn.open_table(SNAPSHOT_TABLE)?;
            let mut keys: Vec<u64> = table
                .iter()?
                .filter_map(|r| r.ok().map(|(k, _)| k.value()))
                .collect();
            let excess = keys.len().saturating_sub(keep);
            keys.truncate(excess);
            purged = keys.len();
            for key in keys {
                table.remove(&key)?;
            }
        }
        txn.commit()?;
        Ok(purged)
    }

    fn log_last_index(&self) -> PalisadeResult<Option<u64>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LOG_TABLE)?;
        Ok(table
            .iter()?
            .rev()
            .next()
            .and_then(|r| r.ok().map(|(k, _)| k.value())))
    }

    fn log_entry(&self, index: u64) -> PalisadeResult<Option<Entry>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LOG_TABLE)?;
        match table.get(&index)? {
            Some(value) => Ok(Some(codec::decode_entry(value.value())?)),
            None => Ok(None),
        }
    }
}

fn store_err(e: PalisadeError) -> raft::Error {
    raft::Error::Store(StorageError::Other(Box::new(e)))
}

impl raft::Storage for DiskStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let hard_state = self.hard_state().map_err(store_err)?;
        let conf_state = self.conf_state().map_err(store_err)?;
        Ok(RaftState::new(hard_state, conf_state))
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let (trunc_index, _) = self.truncated().map_err(store_err)?;
        if low <= trunc_index {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if high > raft::Storage::last_index(self)? + 1 {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }

        let max_size = max_size.into();
        let txn = self.db.begin_read().map_err(|e| store_err(e.into()))?;
        let table = txn
            .open_table(LOG_TABLE)
            .map_err(|e| store_err(e.into()))?;

        let mut entries = Vec::new();
        let mut size = 0u64;
        for item in table
            .range(low..high)
            .map_err(|e| store_err(e.into()))?
        {
            let (key, value) = item.map_err(|e| store_err(e.into()))?;
            let raw = value.value();
            if let Some(max) = max_size {
                if !entries.is_empty() && size + raw.len() as u64 > max {
                    break;
                }
            }
            // A gap in the requested range means the log does not actually
            // hold these indices.
            if key.value() != low + entries.len() as u64 {
                return Err(raft::Error::Store(StorageError::Unavailable));
            }
            size += raw.len() as u64;
            entries.push(codec::decode_entry(raw).map_err(store_err)?);
        }
        Ok(entries)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        let (trunc_index, trunc_term) = self.truncated().map_err(store_err)?;
        if idx < trunc_index {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if idx == trunc_index {
            return Ok(trunc_term);
        }
        match self.log_entry(idx).map_err(store_err)? {
            Some(entry) => Ok(entry.term),
            None => Err(raft::Error::Store(StorageError::Unavailable)),
        }
    }

    fn first_index(&self) -> raft::Result<u64> {
        let (trunc_index, _) = self.truncated().map_err(store_err)?;
        Ok(trunc_index + 1)
    }

    fn last_index(&self) -> raft::Result<u64> {
        let (trunc_index, _) = self.truncated().map_err(store_err)?;
        Ok(self
            .log_last_index()
            .map_err(store_err)?
            .unwrap_or(trunc_index)
            .max(trunc_index))
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        match self.latest_snapshot().map_err(store_err)? {
            Some(snapshot) if snapshot.get_metadata().index >= request_index => Ok(snapshot),
            _ => Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft::prelude::EntryType;
    use raft::Storage as _;

    fn entry(index: u64, term: u64) -> Entry {
        let mut e = Entry::default();
        e.set_entry_type(EntryType::EntryNormal);
        e.index = index;
        e.term = term;
        e.data = vec![index as u8].into();
        e
    }

    fn storage() -> (tempfile::TempDir, DiskStorage) {
        let dir = tempfile::tempdir().unwrap();
        let s = DiskStorage::open(&dir.path().join("raft.db")).unwrap();
        (dir, s)
    }

    #[test]
    fn test_fresh_storage_bounds() {
        let (_dir, s) = storage();
        assert_eq!(s.first_index().unwrap(), 1);
        assert_eq!(s.last_index().unwrap(), 0);
        assert_eq!(s.term(0).unwrap(), 0);
        assert!(!s.is_initialized().unwrap());
    }

    #[test]
    fn test_append_and_read_back() {
        let (_dir, s) = storage();
        s.append(&[entry(1, 1), entry(2, 1), entry(3, 2)]).unwrap();

        assert_eq!(s.last_index().unwrap(), 3);
        assert_eq!(s.term(3).unwrap(), 2);
        let got = s
            .entries(1, 4, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(got[2].index, 3);
    }

    #[test]
    fn test_append_truncates_conflicting_suffix() {
        let (_dir, s) = storage();
        s.append(&[entry(1, 1), entry(2, 1), entry(3, 1)]).unwrap();
        // A new leader rewrites index 2 onward at a later term.
        s.append(&[entry(2, 2)]).unwrap();

        assert_eq!(s.last_index().unwrap(), 2);
        assert_eq!(s.term(2).unwrap(), 2);
    }

    #[test]
    fn test_compact_moves_first_index_and_keeps_term() {
        let (_dir, s) = storage();
        s.append(&[entry(1, 1), entry(2, 1), entry(3, 1), entry(4, 2)])
            .unwrap();
        s.compact(2).unwrap();

        assert_eq!(s.first_index().unwrap(), 3);
        assert_eq!(s.term(2).unwrap(), 1);
        assert!(matches!(
            s.term(1),
            Err(raft::Error::Store(StorageError::Compacted))
        ));
        assert!(matches!(
            s.entries(2, 4, None, GetEntriesContext::empty(false)),
            Err(raft::Error::Store(StorageError::Compacted))
        ));

        // A second compaction at or below the mark reports the race.
        assert!(matches!(s.compact(2), Err(PalisadeError::Compacted)));
    }

    #[test]
    fn test_create_snapshot_and_out_of_date_race() {
        let (_dir, s) = storage();
        s.append(&[entry(1, 1), entry(2, 1), entry(3, 1)]).unwrap();

        let mut cs = ConfState::default();
        cs.voters = vec![1];
        let snap = s.create_snapshot(2, &cs, b"blob".to_vec()).unwrap();
        assert_eq!(snap.get_metadata().index, 2);
        assert_eq!(snap.get_metadata().term, 1);

        assert!(matches!(
            s.create_snapshot(2, &cs, b"blob".to_vec()),
            Err(PalisadeError::SnapOutOfDate)
        ));

        let latest = s.latest_snapshot().unwrap().unwrap();
        assert_eq!(latest.get_metadata().index, 2);
        assert_eq!(&latest.data[..], b"blob");
    }

    #[test]
    fn test_raft_snapshot_requires_fresh_enough_record() {
        let (_dir, s) = storage();
        assert!(matches!(
            s.snapshot(1, 0),
            Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable
            ))
        ));

        s.append(&[entry(1, 1), entry(2, 1)]).unwrap();
        let cs = ConfState::default();
        s.create_snapshot(2, &cs, Vec::new()).unwrap();
        assert!(s.snapshot(2, 0).is_ok());
        assert!(matches!(
            s.snapshot(3, 0),
            Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable
            ))
        ));
    }

    #[test]
    fn test_apply_snapshot_resets_log() {
        let (_dir, s) = storage();
        s.append(&[entry(1, 1), entry(2, 1)]).unwrap();

        let mut cs = ConfState::default();
        cs.voters = vec![1, 2];
        let mut meta = SnapshotMetadata::default();
        meta.index = 10;
        meta.term = 3;
        meta.set_conf_state(cs);
        let mut snapshot = Snapshot::default();
        snapshot.set_metadata(meta);
        s.save_snapshot(&snapshot).unwrap();
        s.apply_snapshot(&snapshot).unwrap();

        assert_eq!(s.first_index().unwrap(), 11);
        assert_eq!(s.last_index().unwrap(), 10);
        assert_eq!(s.term(10).unwrap(), 3);
        assert_eq!(s.hard_state().unwrap().commit, 10);
        assert_eq!(s.conf_state().unwrap().voters, vec![1, 2]);
    }

    #[test]
    fn test_discard_after_drops_uncommitted_tail() {
        let (_dir, s) = storage();
        s.append(&[entry(1, 1), entry(2, 1), entry(3, 1), entry(4, 1)])
            .unwrap();
        assert_eq!(s.discard_after(2).unwrap(), 2);
        assert_eq!(s.last_index().unwrap(), 2);
    }

    #[test]
    fn test_purge_keeps_newest_snapshots() {
        let (_dir, s) = storage();
        for i in 1..=5u64 {
            s.append(&[entry(i, 1)]).unwrap();
            s.create_snapshot(i, &ConfState::default(), Vec::new())
                .unwrap();
        }
        assert_eq!(s.purge_snapshots(2).unwrap(), 3);
        assert_eq!(s.latest_snapshot().unwrap().unwrap().get_metadata().index, 5);
    }

    #[test]
    fn test_metadata_round_trip() {
        let (_dir, s) = storage();
        s.save_metadata(7, 0xc1).unwrap();
        assert!(s.is_initialized().unwrap());
        assert_eq!(s.metadata().unwrap(), Some((7, 0xc1)));
    }
}
