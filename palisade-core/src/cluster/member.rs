//! Member records and their identity derivation.
//!
//! A member splits into two persisted sub-records: `raftAttributes` (the
//! peer URLs, needed by the transport before the member has announced
//! itself) and `attributes` (name and client URLs, published by the member
//! once it is running).

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::STORE_ADMIN_PREFIX;

pub const RAFT_ATTRIBUTES_SUFFIX: &str = "raftAttributes";
pub const ATTRIBUTES_SUFFIX: &str = "attributes";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftAttributes {
    #[serde(rename = "peerURLs")]
    pub peer_urls: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    pub name: String,
    #[serde(rename = "clientURLs")]
    pub client_urls: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: u64,
    #[serde(rename = "raftAttributes")]
    pub raft_attributes: RaftAttributes,
    #[serde(rename = "attributes")]
    pub attributes: Attributes,
}

impl Member {
    /// Build a member whose id is derived from its sorted peer URLs, its
    /// name, and the cluster token: the first 8 bytes of the SHA-1 digest,
    /// big-endian. Every node derives the same id for the same member, so
    /// membership agreement needs no out-of-band id exchange.
    pub fn new(name: &str, peer_urls: Vec<String>, cluster_token: &str) -> Self {
        let mut sorted = peer_urls;
        sorted.sort();

        let mut hasher = Sha1::new();
        for url in &sorted {
            hasher.update(url.as_bytes());
        }
        hasher.update(name.as_bytes());
        hasher.update(cluster_token.as_bytes());
        let digest = hasher.finalize();
        let id = u64::from_be_bytes(digest[..8].try_into().expect("sha1 digest is 20 bytes"));

        Member {
            id,
            raft_attributes: RaftAttributes { peer_urls: sorted },
            attributes: Attributes {
                name: name.to_string(),
                client_urls: Vec::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.attributes.name
    }

    pub fn peer_urls(&self) -> &[String] {
        &self.raft_attributes.peer_urls
    }
}

/// `/0/members/<hex id>`. Ids are formatted with `{:x}` (lowercase, no
/// padding) everywhere, so a given id maps to exactly one store path.
pub fn member_store_key(id: u64) -> String {
    format!("{}/members/{:x}", STORE_ADMIN_PREFIX, id)
}

pub fn removed_member_store_key(id: u64) -> String {
    format!("{}/removed_members/{:x}", STORE_ADMIN_PREFIX, id)
}

pub fn member_attributes_store_path(id: u64) -> String {
    format!("{}/{}", member_store_key(id), ATTRIBUTES_SUFFIX)
}

pub fn member_raft_attributes_store_path(id: u64) -> String {
    format!("{}/{}", member_store_key(id), RAFT_ATTRIBUTES_SUFFIX)
}

/// Parse the member id from the final segment of a store key.
pub fn member_id_from_key(key: &str) -> Option<u64> {
    let segment = key.rsplit('/').next()?;
    u64::from_str_radix(segment, 16).ok()
}
