//! Thread-safe view of cluster membership, persisted through the store.
//!
//! The store (under `/0`) is the authoritative copy; the in-memory cache
//! and the transport's peer set mirror it. Mutations always persist first
//! and only touch the cache when the driving log index is newer than what
//! the view already reflects; that guard lets a restart replay log entries
//! past an already-absorbed snapshot without double-applying cache effects.

mod member;

pub use member::{
    member_attributes_store_path, member_id_from_key, member_raft_attributes_store_path,
    member_store_key, removed_member_store_key, Attributes, Member, RaftAttributes,
    ATTRIBUTES_SUFFIX, RAFT_ATTRIBUTES_SUFFIX,
};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::{info, warn};

use crate::error::{PalisadeError, PalisadeResult};
use crate::store::Store;
use crate::transport::Transport;
use crate::STORE_ADMIN_PREFIX;

/// The kind of membership reconfiguration. Carried inside the conf-change
/// context envelope; the raft-level change type only distinguishes voter
/// additions from removals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfChangeKind {
    Add,
    Remove,
    Update,
}

/// Envelope serialized into `ConfChange::context`. `member` is present for
/// Add and Update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfChangeContext {
    pub kind: ConfChangeKind,
    pub member: Option<Member>,
}

pub struct Cluster {
    token: String,
    id: AtomicU64,
    store: Mutex<Option<Arc<Store>>>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    inner: Mutex<ClusterInner>,
}

#[derive(Default)]
struct ClusterInner {
    members: HashMap<u64, Member>,
    removed: HashSet<u64>,
    /// Log index of the last membership event this view reflects.
    index: u64,
}

impl Cluster {
    fn empty(token: &str) -> Self {
        Cluster {
            token: token.to_string(),
            id: AtomicU64::new(0),
            store: Mutex::new(None),
            transport: Mutex::new(None),
            inner: Mutex::new(ClusterInner::default()),
        }
    }

    /// Build a cluster from an initial membership spec of the form
    /// `name=url,name=url,…`. A name may repeat to give one member several
    /// peer URLs.
    pub fn from_string(token: &str, cluster: &str) -> PalisadeResult<Self> {
        let mut urls_by_name: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for pair in cluster.split(',') {
            let (name, url) = pair.split_once('=').ok_or_else(|| PalisadeError::Config {
                message: format!("invalid cluster entry {:?}, expected name=url", pair),
            })?;
            if url.is_empty() {
                return Err(PalisadeError::Config {
                    message: format!("empty url given for {:?}", name),
                });
            }
            let parsed = url::Url::parse(url).map_err(|e| PalisadeError::Config {
                message: format!("invalid peer url {:?}: {}", url, e),
            })?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(PalisadeError::Config {
                    message: format!("peer url {:?} must be http or https", url),
                });
            }
            urls_by_name
                .entry(name.to_string())
                .or_default()
                .push(url.to_string());
        }

        let c = Cluster::empty(token);
        {
            let mut inner = c.lock_inner();
            for (name, urls) in urls_by_name {
                let m = Member::new(&name, urls, token);
                if inner.members.contains_key(&m.id) {
                    return Err(PalisadeError::Config {
                        message: format!("member {:?} duplicates an existing member id", name),
                    });
                }
                inner.members.insert(m.id, m);
            }
        }
        c.gen_id();
        Ok(c)
    }

    /// Rebuild the view from the authoritative copy in the store. Used on
    /// restart, after the store has been recovered from a snapshot.
    pub fn from_store(token: &str, store: Arc<Store>) -> Self {
        let c = Cluster::empty(token);
        let (members, removed) = members_from_store(&store);
        {
            let mut inner = c.lock_inner();
            inner.members = members;
            inner.removed = removed;
        }
        *c.store.lock().unwrap_or_else(|e| e.into_inner()) = Some(store);
        c.gen_id();
        c
    }

    fn lock_inner(&self) -> MutexGuard<'_, ClusterInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn store_handle(&self) -> Arc<Store> {
        self.store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .expect("cluster store must be set before membership operations")
    }

    fn transport_handle(&self) -> Option<Arc<dyn Transport>> {
        self.transport.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn id(&self) -> u64 {
        self.id.load(Ordering::SeqCst)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn index(&self) -> u64 {
        self.lock_inner().index
    }

    /// Members sorted by id.
    pub fn members(&self) -> Vec<Member> {
        let inner = self.lock_inner();
        let mut members: Vec<Member> = inner.members.values().cloned().collect();
        members.sort_by_key(|m| m.id);
        members
    }

    pub fn member(&self, id: u64) -> Option<Member> {
        self.lock_inner().members.get(&id).cloned()
    }

    pub fn member_by_name(&self, name: &str) -> Option<Member> {
        self.lock_inner()
            .members
            .values()
            .find(|m| m.name() == name)
            .cloned()
    }

    pub fn member_ids(&self) -> Vec<u64> {
        let inner = self.lock_inner();
        let mut ids: Vec<u64> = inner.members.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_id_removed(&self, id: u64) -> bool {
        self.lock_inner().removed.contains(&id)
    }

    /// All peer addresses, ascending.
    pub fn peer_urls(&self) -> Vec<String> {
        let inner = self.lock_inner();
        let mut urls: Vec<String> = inner
            .members
            .values()
            .flat_map(|m| m.peer_urls().iter().cloned())
            .collect();
        urls.sort();
        urls
    }

    /// All client addresses, ascending.
    pub fn client_urls(&self) -> Vec<String> {
        let inner = self.lock_inner();
        let mut urls: Vec<String> = inner
            .members
            .values()
            .flat_map(|m| m.attributes.client_urls.iter().cloned())
            .collect();
        urls.sort();
        urls
    }

    /// Recompute the cluster id: SHA-1 over the ascending member ids as
    /// 64-bit big-endian values, truncated to the first 8 bytes.
    fn gen_id(&self) {
        let ids = self.member_ids();
        let mut hasher = Sha1::new();
        for id in ids {
            hasher.update(id.to_be_bytes());
        }
        let digest = hasher.finalize();
        let id = u64::from_be_bytes(digest[..8].try_into().expect("sha1 digest is 20 bytes"));
        self.id.store(id, Ordering::SeqCst);
    }

    pub fn set_id(&self, id: u64) {
        self.id.store(id, Ordering::SeqCst);
    }

    pub fn set_store(&self, store: Arc<Store>) {
        *self.store.lock().unwrap_or_else(|e| e.into_inner()) = Some(store);
    }

    pub fn update_index(&self, index: u64) {
        self.lock_inner().index = index;
    }

    /// Attach the transport and seed it with the current peer set.
    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        for m in self.members() {
            transport.add_peer(m.id, m.peer_urls());
        }
        *self.transport.lock().unwrap_or_else(|e| e.into_inner()) = Some(transport);
    }

    /// Ensure no two members share a peer URL.
    pub fn validate(&self) -> PalisadeResult<()> {
        let mut seen = HashSet::new();
        for m in self.members() {
            for url in m.peer_urls() {
                if !seen.insert(url.clone()) {
                    return Err(PalisadeError::Config {
                        message: format!("duplicate url {:?} in cluster config", url),
                    });
                }
            }
        }
        Ok(())
    }

    /// Check a proposed reconfiguration against the authoritative copy in
    /// the store, not the cache.
    pub fn validate_configuration_change(
        &self,
        kind: ConfChangeKind,
        node_id: u64,
        member: Option<&Member>,
    ) -> PalisadeResult<()> {
        let store = self.store_handle();
        let (members, removed) = members_from_store(&store);
        if removed.contains(&node_id) {
            return Err(PalisadeError::MemberRemoved);
        }
        match kind {
            ConfChangeKind::Add => {
                if members.contains_key(&node_id) {
                    return Err(PalisadeError::MemberExists);
                }
                let member = member.ok_or_else(|| PalisadeError::Internal {
                    message: "add conf change carries no member".to_string(),
                })?;
                let urls: HashSet<&str> = members
                    .values()
                    .flat_map(|m| m.peer_urls().iter().map(String::as_str))
                    .collect();
                for url in member.peer_urls() {
                    if urls.contains(url.as_str()) {
                        return Err(PalisadeError::PeerUrlExists);
                    }
                }
            }
            ConfChangeKind::Remove => {
                if !members.contains_key(&node_id) {
                    return Err(PalisadeError::MemberNotFound);
                }
            }
            ConfChangeKind::Update => {
                if !members.contains_key(&node_id) {
                    return Err(PalisadeError::MemberNotFound);
                }
                let member = member.ok_or_else(|| PalisadeError::Internal {
                    message: "update conf change carries no member".to_string(),
                })?;
                let urls: HashSet<&str> = members
                    .values()
                    .filter(|m| m.id != node_id)
                    .flat_map(|m| m.peer_urls().iter().map(String::as_str))
                    .collect();
                for url in member.peer_urls() {
                    if urls.contains(url.as_str()) {
                        return Err(PalisadeError::PeerUrlExists);
                    }
                }
            }
        }
        Ok(())
    }

    /// Persist a new member's raft attributes and, when `index` is newer
    /// than the view, absorb it into the cache and the transport.
    ///
    /// The store write is an assertion: the change was validated before it
    /// entered the log, so a failure here means replicas have diverged.
    pub fn add_member(&self, m: &Member, index: u64) {
        let store = self.store_handle();
        let record = serde_json::to_string(&m.raft_attributes)
            .expect("marshal raftAttributes should never fail");
        if let Err(e) = store.create(
            &member_raft_attributes_store_path(m.id),
            false,
            record,
            false,
            None,
        ) {
            panic!("create raftAttributes should never fail: {}", e);
        }

        let mut inner = self.lock_inner();
        if index > inner.index {
            inner.members.insert(m.id, m.clone());
            inner.index = index;
            if let Some(tr) = self.transport_handle() {
                tr.add_peer(m.id, m.peer_urls());
            }
            drop(inner);
            self.gen_id();
            info!("added member {:x} to cluster", m.id);
        }
    }

    /// Persist a removal tombstone and, when `index` is newer than the
    /// view, drop the member from the cache and the transport. A removed id
    /// is never resurrected.
    pub fn remove_member(&self, id: u64, index: u64) {
        let store = self.store_handle();
        if let Err(e) = store.delete(&member_store_key(id), true, true) {
            panic!("delete member should never fail: {}", e);
        }
        if let Err(e) = store.create(
            &removed_member_store_key(id),
            false,
            String::new(),
            false,
            None,
        ) {
            panic!("create removedMember should never fail: {}", e);
        }

        let mut inner = self.lock_inner();
        if index > inner.index {
            if inner.members.remove(&id).is_none() {
                panic!("member {:x} should exist in the cluster", id);
            }
            inner.removed.insert(id);
            inner.index = index;
            if let Some(tr) = self.transport_handle() {
                tr.remove_peer(id);
            }
            drop(inner);
            self.gen_id();
            info!("removed member {:x} from cluster", id);
        }
    }

    /// Rewrite a member's raft attributes.
    pub fn update_raft_attributes(&self, id: u64, attrs: RaftAttributes, index: u64) {
        let store = self.store_handle();
        let record =
            serde_json::to_string(&attrs).expect("marshal raftAttributes should never fail");
        if let Err(e) = store.update(&member_raft_attributes_store_path(id), record, None) {
            panic!("update raftAttributes should never fail: {}", e);
        }

        let mut inner = self.lock_inner();
        if index > inner.index {
            if let Some(m) = inner.members.get_mut(&id) {
                m.raft_attributes = attrs.clone();
            }
            inner.index = index;
            if let Some(tr) = self.transport_handle() {
                tr.update_peer(id, &attrs.peer_urls);
            }
        }
    }

    /// Update a member's announced attributes in the cache. The persistent
    /// write is the publishing member's own PUT travelling through the log,
    /// so no store write happens here.
    pub fn update_attributes(&self, id: u64, attrs: Attributes) {
        let mut inner = self.lock_inner();
        match inner.members.get_mut(&id) {
            Some(m) => m.attributes = attrs,
            None => warn!("attribute update for unknown member {:x}", id),
        }
    }

    /// Reload members and tombstones from the store and re-synchronize the
    /// transport with the refreshed peer list.
    pub fn recover(&self) {
        let store = self.store_handle();
        let (members, removed) = members_from_store(&store);
        {
            let mut inner = self.lock_inner();
            inner.members = members;
            inner.removed = removed;
        }
        self.gen_id();
        if let Some(tr) = self.transport_handle() {
            tr.remove_all_peers();
            for m in self.members() {
                tr.add_peer(m.id, m.peer_urls());
            }
        }
    }
}

/// Read the authoritative membership from the store. A missing members
/// directory means an empty (not-yet-bootstrapped) membership.
fn members_from_store(store: &Store) -> (HashMap<u64, Member>, HashSet<u64>) {
    let mut members = HashMap::new();
    let mut removed = HashSet::new();

    let members_prefix = format!("{}/members", STORE_ADMIN_PREFIX);
    match store.get(&members_prefix, true, true) {
        Ok(event) => {
            for node in &event.node.nodes {
                let id = member_id_from_key(&node.key)
                    .unwrap_or_else(|| panic!("bad member key {:?} in store", node.key));
                let mut member = Member {
                    id,
                    ..Member::default()
                };
                for attr in &node.nodes {
                    let value = attr.value.as_deref().unwrap_or_default();
                    if attr.key.ends_with(RAFT_ATTRIBUTES_SUFFIX) {
                        member.raft_attributes = serde_json::from_str(value)
                            .expect("unmarshal raftAttributes should never fail");
                    } else if attr.key.ends_with(ATTRIBUTES_SUFFIX) {
                        member.attributes = serde_json::from_str(value)
                            .expect("unmarshal attributes should never fail");
                    }
                }
                members.insert(id, member);
            }
        }
        Err(e) if e.is_key_not_found() => return (members, removed),
        Err(e) => panic!("get members from store should never fail: {}", e),
    }

    let removed_prefix = format!("{}/removed_members", STORE_ADMIN_PREFIX);
    match store.get(&removed_prefix, true, true) {
        Ok(event) => {
            for node in &event.node.nodes {
                let id = member_id_from_key(&node.key)
                    .unwrap_or_else(|| panic!("bad removed member key {:?} in store", node.key));
                removed.insert(id);
            }
        }
        Err(e) if e.is_key_not_found() => {}
        Err(e) => panic!("get removed members from store should never fail: {}", e),
    }

    (members, removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NoopTransport;

    fn test_store() -> Arc<Store> {
        Arc::new(Store::new(&["/0", "/1"]))
    }

    fn cluster_of(names: &[&str]) -> Cluster {
        let spec = names
            .iter()
            .map(|n| format!("{}=http://{}:2380", n, n))
            .collect::<Vec<_>>()
            .join(",");
        let c = Cluster::from_string("tok", &spec).unwrap();
        c.set_store(test_store());
        c.set_transport(Arc::new(NoopTransport));
        c
    }

    fn persist_members(c: &Cluster) {
        for (i, m) in c.members().into_iter().enumerate() {
            c.add_member(&m, (i + 1) as u64);
        }
    }

    #[test]
    fn test_from_string_parses_members() {
        let c = Cluster::from_string(
            "tok",
            "n1=http://n1:2380,n2=http://n2:2380,n1=http://n1:7001",
        )
        .unwrap();
        assert_eq!(c.members().len(), 2);
        let n1 = c.member_by_name("n1").unwrap();
        assert_eq!(n1.peer_urls().len(), 2);
    }

    #[test]
    fn test_from_string_rejects_garbage() {
        assert!(Cluster::from_string("tok", "n1").is_err());
        assert!(Cluster::from_string("tok", "n1=").is_err());
        assert!(Cluster::from_string("tok", "n1=ftp://n1:2380").is_err());
    }

    #[test]
    fn test_cluster_id_matches_sha1_of_sorted_ids() {
        let c = cluster_of(&["n1", "n2", "n3"]);
        let ids = c.member_ids();
        let mut hasher = Sha1::new();
        for id in &ids {
            hasher.update(id.to_be_bytes());
        }
        let digest = hasher.finalize();
        let expected = u64::from_be_bytes(digest[..8].try_into().unwrap());
        assert_eq!(c.id(), expected);
    }

    #[test]
    fn test_validate_rejects_duplicate_urls() {
        let c = Cluster::from_string("tok", "n1=http://same:2380,n2=http://same:2380").unwrap();
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_validate_conf_change_add() {
        let c = cluster_of(&["n1", "n2"]);
        persist_members(&c);

        let fresh = Member::new("n3", vec!["http://n3:2380".to_string()], "tok");
        assert!(c
            .validate_configuration_change(ConfChangeKind::Add, fresh.id, Some(&fresh))
            .is_ok());

        let existing = c.member_by_name("n1").unwrap();
        assert!(matches!(
            c.validate_configuration_change(ConfChangeKind::Add, existing.id, Some(&existing)),
            Err(PalisadeError::MemberExists)
        ));

        let colliding = Member::new("n4", vec!["http://n1:2380".to_string()], "tok");
        assert!(matches!(
            c.validate_configuration_change(ConfChangeKind::Add, colliding.id, Some(&colliding)),
            Err(PalisadeError::PeerUrlExists)
        ));
    }

    #[test]
    fn test_validate_conf_change_remove_and_update() {
        let c = cluster_of(&["n1", "n2"]);
        persist_members(&c);

        assert!(matches!(
            c.validate_configuration_change(ConfChangeKind::Remove, 0xdead, None),
            Err(PalisadeError::MemberNotFound)
        ));

        let n1 = c.member_by_name("n1").unwrap();
        assert!(c
            .validate_configuration_change(ConfChangeKind::Remove, n1.id, None)
            .is_ok());

        // An update may keep the member's own urls but not steal another's.
        let mut updated = n1.clone();
        assert!(c
            .validate_configuration_change(ConfChangeKind::Update, n1.id, Some(&updated))
            .is_ok());
        updated.raft_attributes.peer_urls = vec!["http://n2:2380".to_string()];
        assert!(matches!(
            c.validate_configuration_change(ConfChangeKind::Update, n1.id, Some(&updated)),
            Err(PalisadeError::PeerUrlExists)
        ));
    }

    #[test]
    fn test_removed_id_is_never_resurrected() {
        let c = cluster_of(&["n1", "n2"]);
        persist_members(&c);

        let n2 = c.member_by_name("n2").unwrap();
        c.remove_member(n2.id, 10);
        assert!(c.is_id_removed(n2.id));

        assert!(matches!(
            c.validate_configuration_change(ConfChangeKind::Add, n2.id, Some(&n2)),
            Err(PalisadeError::MemberRemoved)
        ));

        // Invariant: members and removed stay disjoint.
        assert!(!c.member_ids().contains(&n2.id));
    }

    #[test]
    fn test_index_guard_skips_stale_cache_updates() {
        let c = cluster_of(&["n1"]);
        persist_members(&c);
        c.update_index(100);

        // Replaying an older membership event persists (idempotently, to a
        // fresh store) but must not disturb the cache.
        let store2 = test_store();
        c.set_store(store2);
        let stale = Member::new("late", vec!["http://late:2380".to_string()], "tok");
        c.add_member(&stale, 50);
        assert!(c.member(stale.id).is_none());
        assert_eq!(c.index(), 100);
    }

    #[test]
    fn test_recover_rebuilds_view_from_store() {
        let c = cluster_of(&["n1", "n2"]);
        persist_members(&c);
        let store = c.store_handle();
        let ids = c.member_ids();

        let rebuilt = Cluster::from_store("tok", store);
        assert_eq!(rebuilt.member_ids(), ids);
        assert_eq!(rebuilt.id(), c.id());
    }

    #[test]
    fn test_update_attributes_touches_cache_only() {
        let c = cluster_of(&["n1"]);
        persist_members(&c);
        let n1 = c.member_by_name("n1").unwrap();

        c.update_attributes(
            n1.id,
            Attributes {
                name: "n1".to_string(),
                client_urls: vec!["http://n1:2379".to_string()],
            },
        );
        assert_eq!(
            c.member(n1.id).unwrap().attributes.client_urls,
            vec!["http://n1:2379".to_string()]
        );

        // The store still has no attributes record; the member's own PUT is
        // the persistent path.
        let store = c.store_handle();
        assert!(store
            .get(&member_attributes_store_path(n1.id), false, false)
            .is_err());
    }
}
