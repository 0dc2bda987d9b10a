//! Serialization of raft records for the disk storage layer.
//!
//! Entries, snapshots, and conf states are protobuf messages and use their
//! wire encoding. Hard state and the small fixed records use flat
//! little-endian layouts.

use protobuf::Message as _;
use raft::prelude::{ConfState, Entry, HardState, Snapshot};

use crate::error::{PalisadeError, PalisadeResult};

pub fn encode_entry(entry: &Entry) -> PalisadeResult<Vec<u8>> {
    entry
        .write_to_bytes()
        .map_err(|e| PalisadeError::serialization("encode entry", e))
}

pub fn decode_entry(data: &[u8]) -> PalisadeResult<Entry> {
    let mut entry = Entry::default();
    entry
        .merge_from_bytes(data)
        .map_err(|e| PalisadeError::serialization("decode entry", e))?;
    Ok(entry)
}

pub fn encode_snapshot(snapshot: &Snapshot) -> PalisadeResult<Vec<u8>> {
    snapshot
        .write_to_bytes()
        .map_err(|e| PalisadeError::serialization("encode snapshot", e))
}

pub fn decode_snapshot(data: &[u8]) -> PalisadeResult<Snapshot> {
    let mut snapshot = Snapshot::default();
    snapshot
        .merge_from_bytes(data)
        .map_err(|e| PalisadeError::serialization("decode snapshot", e))?;
    Ok(snapshot)
}

pub fn encode_conf_state(cs: &ConfState) -> PalisadeResult<Vec<u8>> {
    cs.write_to_bytes()
        .map_err(|e| PalisadeError::serialization("encode conf state", e))
}

pub fn decode_conf_state(data: &[u8]) -> PalisadeResult<ConfState> {
    let mut cs = ConfState::default();
    cs.merge_from_bytes(data)
        .map_err(|e| PalisadeError::serialization("decode conf state", e))?;
    Ok(cs)
}

/// Layout: `[term:8][vote:8][commit:8]`, little endian.
pub fn encode_hard_state(hs: &HardState) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24);
    buf.extend_from_slice(&hs.term.to_le_bytes());
    buf.extend_from_slice(&hs.vote.to_le_bytes());
    buf.extend_from_slice(&hs.commit.to_le_bytes());
    buf
}

pub fn decode_hard_state(data: &[u8]) -> PalisadeResult<HardState> {
    let (term, vote, commit) = decode_u64_triple(data, "hard state")?;
    let mut hs = HardState::default();
    hs.term = term;
    hs.vote = vote;
    hs.commit = commit;
    Ok(hs)
}

/// Layout: `[a:8][b:8]`, little endian. Used for the `{node_id,
/// cluster_id}` metadata record and the `{index, term}` truncation mark.
pub fn encode_u64_pair(a: u64, b: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(&a.to_le_bytes());
    buf.extend_from_slice(&b.to_le_bytes());
    buf
}

pub fn decode_u64_pair(data: &[u8], what: &str) -> PalisadeResult<(u64, u64)> {
    if data.len() != 16 {
        return Err(PalisadeError::Internal {
            message: format!("{} record has invalid length {}", what, data.len()),
        });
    }
    let a = u64::from_le_bytes(data[0..8].try_into().expect("length checked"));
    let b = u64::from_le_bytes(data[8..16].try_into().expect("length checked"));
    Ok((a, b))
}

fn decode_u64_triple(data: &[u8], what: &str) -> PalisadeResult<(u64, u64, u64)> {
    if data.len() != 24 {
        return Err(PalisadeError::Internal {
            message: format!("{} record has invalid length {}", what, data.len()),
        });
    }
    let a = u64::from_le_bytes(data[0..8].try_into().expect("length checked"));
    let b = u64::from_le_bytes(data[8..16].try_into().expect("length checked"));
    let c = u64::from_le_bytes(data[16..24].try_into().expect("length checked"));
    Ok((a, b, c))
}
