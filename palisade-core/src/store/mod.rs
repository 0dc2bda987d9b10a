//! In-memory ordered key-value store with directories, TTLs, and watchers.
//!
//! The store is the state machine the apply engine executes committed
//! entries against. Every mutation advances `current_index` by one and
//! produces an [`Event`] that is also fanned out to watchers. Mutations are
//! deterministic: they never consult the local clock, so replicas applying
//! the same entries converge byte-for-byte. TTL enforcement happens through
//! `delete_expired_keys`, driven by the leader's clock via `Sync` entries;
//! only local reads hide expired-but-unswept nodes.

mod event;
mod node;
mod watch;

pub use event::{Action, Event, NodeInfo};
pub use watch::Watcher;

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PalisadeError, PalisadeResult};

use node::{join_key, Node, NodeKind};
use watch::WatcherHub;

pub struct Store {
    inner: RwLock<StoreInner>,
}

struct StoreInner {
    root: Node,
    current_index: u64,
    hub: WatcherHub,
}

/// Serialized form produced by `save` and consumed by `recovery`.
#[derive(Serialize, Deserialize)]
struct StoreSnapshot {
    root: Node,
    index: u64,
}

impl Store {
    /// Create a store with the given top-level namespace directories
    /// pre-created at index 0.
    pub fn new(namespaces: &[&str]) -> Self {
        let mut root = Node::new_dir(0, None);
        for ns in namespaces {
            let name = ns.trim_matches('/');
            if !name.is_empty() {
                root.children_mut()
                    .expect("root is a directory")
                    .insert(name.to_string(), Node::new_dir(0, None));
            }
        }
        Store {
            inner: RwLock::new(StoreInner {
                root,
                current_index: 0,
                hub: WatcherHub::default(),
            }),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn index(&self) -> u64 {
        self.read().current_index
    }

    /// Read a node. Expired nodes that have not been swept yet are hidden;
    /// this is safe because reads do not mutate replicated state.
    pub fn get(&self, path: &str, recursive: bool, _sorted: bool) -> PalisadeResult<Event> {
        let inner = self.read();
        let path = canonical(path);
        let components = components(&path);
        let node = lookup(&inner.root, &components)
            .filter(|n| !n.is_expired(Utc::now()))
            .ok_or_else(|| PalisadeError::KeyNotFound { key: path.clone() })?;
        // Directory children are held in a BTreeMap, so listings are always
        // key-ordered; the sorted flag exists for API parity.
        let depth = if recursive { u32::MAX } else { 1 };
        Ok(Event::new(
            Action::Get,
            node.info(&path, depth),
            inner.current_index,
        ))
    }

    /// Create a node, failing if it already exists. With `unique`, a
    /// zero-padded index suffix is appended to the path first (POST
    /// semantics: in-order unique names under a directory).
    pub fn create(
        &self,
        path: &str,
        dir: bool,
        value: String,
        unique: bool,
        expiration: Option<DateTime<Utc>>,
    ) -> PalisadeResult<Event> {
        let mut inner = self.write();
        let next = inner.current_index + 1;

        let mut path = canonical(path);
        if unique {
            path = join_key(&path, &format!("{:020}", next));
        }
        let comps = owned_components(&path);
        if comps.is_empty() {
            return Err(PalisadeError::RootReadOnly);
        }

        let StoreInner {
            root,
            current_index,
            hub,
        } = &mut *inner;

        let (leaf, parents) = comps.split_last().expect("non-empty components");
        let parent = ensure_dirs(root, parents, next)?;
        if parent.contains_key(leaf) {
            return Err(PalisadeError::KeyExists { key: path });
        }
        let node = if dir {
            Node::new_dir(next, expiration)
        } else {
            Node::new_file(value, next, expiration)
        };
        let info = node.info(&path, 0);
        parent.insert(leaf.clone(), node);
        *current_index = next;

        let event = Event::new(Action::Create, info, next);
        hub.notify(&event);
        Ok(event)
    }

    /// Create or replace a file node. Replacing a directory is an error.
    pub fn set(
        &self,
        path: &str,
        dir: bool,
        value: String,
        expiration: Option<DateTime<Utc>>,
    ) -> PalisadeResult<Event> {
        let mut inner = self.write();
        let next = inner.current_index + 1;

        let path = canonical(path);
        let comps = owned_components(&path);
        if comps.is_empty() {
            return Err(PalisadeError::RootReadOnly);
        }

        let StoreInner {
            root,
            current_index,
            hub,
        } = &mut *inner;

        let (leaf, parents) = comps.split_last().expect("non-empty components");
        let parent = ensure_dirs(root, parents, next)?;

        let prev = match parent.get(leaf) {
            Some(existing) if existing.is_dir() => {
                return Err(PalisadeError::NotAFile { key: path });
            }
            Some(existing) => Some(existing.info(&path, 0)),
            None => None,
        };

        let node = if dir {
            Node::new_dir(next, expiration)
        } else {
            Node::new_file(value, next, expiration)
        };
        let info = node.info(&path, 0);
        parent.insert(leaf.clone(), node);
        *current_index = next;

        let mut event = Event::new(Action::Set, info, next);
        if let Some(prev) = prev {
            event = event.with_prev(prev);
        }
        hub.notify(&event);
        Ok(event)
    }

    /// Update an existing node in place: the value of a file, or just the
    /// expiration of a directory. The created index is preserved.
    pub fn update(
        &self,
        path: &str,
        value: String,
        expiration: Option<DateTime<Utc>>,
    ) -> PalisadeResult<Event> {
        let mut inner = self.write();
        let next = inner.current_index + 1;

        let path = canonical(path);
        let comps = components(&path);
        if comps.is_empty() {
            return Err(PalisadeError::RootReadOnly);
        }

        let StoreInner {
            root,
            current_index,
            hub,
        } = &mut *inner;

        let node = lookup_mut(root, &comps)
            .ok_or_else(|| PalisadeError::KeyNotFound { key: path.clone() })?;
        if node.is_dir() && !value.is_empty() {
            return Err(PalisadeError::NotAFile { key: path });
        }
        let prev = node.info(&path, 0);

        if let NodeKind::File { value: v } = &mut node.kind {
            *v = value;
        }
        node.modified_index = next;
        node.expiration = expiration;
        let info = node.info(&path, 0);
        *current_index = next;

        let event = Event::new(Action::Update, info, next).with_prev(prev);
        hub.notify(&event);
        Ok(event)
    }

    /// Atomically swap a file's value when the given preconditions hold.
    pub fn compare_and_swap(
        &self,
        path: &str,
        prev_value: &str,
        prev_index: u64,
        value: String,
        expiration: Option<DateTime<Utc>>,
    ) -> PalisadeResult<Event> {
        let mut inner = self.write();
        let next = inner.current_index + 1;

        let path = canonical(path);
        let comps = components(&path);
        if comps.is_empty() {
            return Err(PalisadeError::RootReadOnly);
        }

        let StoreInner {
            root,
            current_index,
            hub,
        } = &mut *inner;

        let node = lookup_mut(root, &comps)
            .ok_or_else(|| PalisadeError::KeyNotFound { key: path.clone() })?;
        if node.is_dir() {
            return Err(PalisadeError::NotAFile { key: path });
        }
        compare(node, prev_value, prev_index)?;
        let prev = node.info(&path, 0);

        node.kind = NodeKind::File { value };
        node.modified_index = next;
        node.expiration = expiration;
        let info = node.info(&path, 0);
        *current_index = next;

        let event = Event::new(Action::CompareAndSwap, info, next).with_prev(prev);
        hub.notify(&event);
        Ok(event)
    }

    /// Delete a node. Directories require `dir` or `recursive`; non-empty
    /// directories require `recursive`.
    pub fn delete(&self, path: &str, dir: bool, recursive: bool) -> PalisadeResult<Event> {
        let mut inner = self.write();
        let next = inner.current_index + 1;

        let path = canonical(path);
        let comps = owned_components(&path);
        if comps.is_empty() {
            return Err(PalisadeError::RootReadOnly);
        }

        let StoreInner {
            root,
            current_index,
            hub,
        } = &mut *inner;

        let (leaf, parents) = comps.split_last().expect("non-empty components");
        let parent_node = lookup_mut_components(root, parents)
            .ok_or_else(|| PalisadeError::KeyNotFound { key: path.clone() })?;
        let children = parent_node
            .children_mut()
            .ok_or_else(|| PalisadeError::NotADirectory { key: path.clone() })?;

        let existing = children
            .get(leaf)
            .ok_or_else(|| PalisadeError::KeyNotFound { key: path.clone() })?;
        if existing.is_dir() {
            if !dir && !recursive {
                return Err(PalisadeError::NotAFile { key: path });
            }
            let empty = existing.children().map(BTreeMap::is_empty).unwrap_or(true);
            if !empty && !recursive {
                return Err(PalisadeError::DirectoryNotEmpty { key: path });
            }
        }

        let removed = children.remove(leaf).expect("checked above");
        *current_index = next;

        let event = deletion_event(Action::Delete, &path, &removed, next);
        hub.notify(&event);
        Ok(event)
    }

    /// Atomically delete a file when the given preconditions hold.
    pub fn compare_and_delete(
        &self,
        path: &str,
        prev_value: &str,
        prev_index: u64,
    ) -> PalisadeResult<Event> {
        let mut inner = self.write();
        let next = inner.current_index + 1;

        let path = canonical(path);
        let comps = owned_components(&path);
        if comps.is_empty() {
            return Err(PalisadeError::RootReadOnly);
        }

        let StoreInner {
            root,
            current_index,
            hub,
        } = &mut *inner;

        let (leaf, parents) = comps.split_last().expect("non-empty components");
        let parent_node = lookup_mut_components(root, parents)
            .ok_or_else(|| PalisadeError::KeyNotFound { key: path.clone() })?;
        let children = parent_node
            .children_mut()
            .ok_or_else(|| PalisadeError::NotADirectory { key: path.clone() })?;

        let existing = children
            .get(leaf)
            .ok_or_else(|| PalisadeError::KeyNotFound { key: path.clone() })?;
        if existing.is_dir() {
            return Err(PalisadeError::NotAFile { key: path });
        }
        compare(existing, prev_value, prev_index)?;

        let removed = children.remove(leaf).expect("checked above");
        *current_index = next;

        let event = deletion_event(Action::CompareAndDelete, &path, &removed, next);
        hub.notify(&event);
        Ok(event)
    }

    /// Remove every node whose expiration is at or before `cutoff`,
    /// emitting an `Expire` event per removed subtree. The cutoff comes
    /// from the leader's clock through a replicated `Sync` entry, so every
    /// replica sweeps identically.
    pub fn delete_expired_keys(&self, cutoff: DateTime<Utc>) {
        let mut inner = self.write();

        let mut expired = Vec::new();
        collect_expired(&inner.root, "/", cutoff, &mut expired);

        for path in expired {
            let next = inner.current_index + 1;
            let StoreInner {
                root,
                current_index,
                hub,
            } = &mut *inner;

            let comps = owned_components(&path);
            let Some((leaf, parents)) = comps.split_last() else {
                continue;
            };
            let Some(children) =
                lookup_mut_components(root, parents).and_then(Node::children_mut)
            else {
                continue;
            };
            let Some(removed) = children.remove(leaf) else {
                continue;
            };
            *current_index = next;
            let event = deletion_event(Action::Expire, &path, &removed, next);
            hub.notify(&event);
        }
    }

    /// Open a watch on `path`. See [`WatcherHub::watch`] for `since`
    /// semantics.
    pub fn watch(
        &self,
        path: &str,
        recursive: bool,
        stream: bool,
        since: u64,
    ) -> PalisadeResult<Watcher> {
        let mut inner = self.write();
        let path = canonical(path);
        inner.hub.watch(&path, recursive, stream, since)
    }

    /// Serialize the full contents for a snapshot.
    pub fn save(&self) -> PalisadeResult<Vec<u8>> {
        let inner = self.read();
        let snapshot = StoreSnapshot {
            root: inner.root.clone(),
            index: inner.current_index,
        };
        bincode::serialize(&snapshot)
            .map_err(|e| PalisadeError::serialization("serialize store snapshot", e))
    }

    /// Replace the contents from a snapshot blob. Outstanding watchers are
    /// cancelled; they observe a closed channel and must re-watch.
    pub fn recovery(&self, data: &[u8]) -> PalisadeResult<()> {
        let snapshot: StoreSnapshot = bincode::deserialize(data)
            .map_err(|e| PalisadeError::serialization("deserialize store snapshot", e))?;
        let mut inner = self.write();
        inner.root = snapshot.root;
        inner.current_index = snapshot.index;
        inner.hub.clear();
        Ok(())
    }
}

impl Clone for Store {
    /// Structural clone of the data, without watchers. Used to take a
    /// snapshot-safe handle that a background task can serialize.
    fn clone(&self) -> Self {
        let inner = self.read();
        Store {
            inner: RwLock::new(StoreInner {
                root: inner.root.clone(),
                current_index: inner.current_index,
                hub: WatcherHub::default(),
            }),
        }
    }
}

fn canonical(path: &str) -> String {
    let joined = path
        .split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    format!("/{}", joined)
}

fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn owned_components(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn lookup<'a>(root: &'a Node, comps: &[&str]) -> Option<&'a Node> {
    let mut cur = root;
    for c in comps {
        cur = cur.children()?.get(*c)?;
    }
    Some(cur)
}

fn lookup_mut<'a>(root: &'a mut Node, comps: &[&str]) -> Option<&'a mut Node> {
    let mut cur = root;
    for c in comps {
        cur = cur.children_mut()?.get_mut(*c)?;
    }
    Some(cur)
}

fn lookup_mut_components<'a>(root: &'a mut Node, comps: &[String]) -> Option<&'a mut Node> {
    let mut cur = root;
    for c in comps {
        cur = cur.children_mut()?.get_mut(c)?;
    }
    Some(cur)
}

/// Walk to the parent directory of a path, creating intermediate
/// directories at `index` as needed.
fn ensure_dirs<'a>(
    root: &'a mut Node,
    parents: &[String],
    index: u64,
) -> PalisadeResult<&'a mut BTreeMap<String, Node>> {
    let mut cur = root;
    let mut walked = String::new();
    for c in parents {
        walked.push('/');
        walked.push_str(c);
        let children = match &mut cur.kind {
            NodeKind::Dir { children } => children,
            NodeKind::File { .. } => {
                return Err(PalisadeError::NotADirectory {
                    key: walked.clone(),
                });
            }
        };
        cur = children
            .entry(c.clone())
            .or_insert_with(|| Node::new_dir(index, None));
    }
    match &mut cur.kind {
        NodeKind::Dir { children } => Ok(children),
        NodeKind::File { .. } => Err(PalisadeError::NotADirectory { key: walked }),
    }
}

fn compare(node: &Node, prev_value: &str, prev_index: u64) -> PalisadeResult<()> {
    let current = node.value().unwrap_or_default();
    let value_ok = prev_value.is_empty() || prev_value == current;
    let index_ok = prev_index == 0 || prev_index == node.modified_index;
    if value_ok && index_ok {
        return Ok(());
    }
    Err(PalisadeError::CompareFailed {
        cause: format!(
            "[{} != {}] [{} != {}]",
            prev_value, current, prev_index, node.modified_index
        ),
    })
}

fn deletion_event(action: Action, path: &str, removed: &Node, index: u64) -> Event {
    let prev = removed.info(path, 0);
    let info = NodeInfo {
        key: path.to_string(),
        value: None,
        dir: removed.is_dir(),
        nodes: Vec::new(),
        created_index: removed.created_index,
        modified_index: index,
        expiration: None,
    };
    Event::new(action, info, index).with_prev(prev)
}

fn collect_expired(node: &Node, key: &str, cutoff: DateTime<Utc>, out: &mut Vec<String>) {
    if let Some(children) = node.children() {
        for (name, child) in children {
            let child_key = join_key(key, name);
            if matches!(child.expiration, Some(exp) if exp <= cutoff) {
                out.push(child_key);
            } else {
                collect_expired(child, &child_key, cutoff, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> Store {
        Store::new(&["/0", "/1"])
    }

    #[test]
    fn test_create_and_get_file() {
        let s = store();
        let ev = s
            .create("/1/foo", false, "bar".to_string(), false, None)
            .unwrap();
        assert_eq!(ev.action, Action::Create);
        assert_eq!(ev.node.value.as_deref(), Some("bar"));
        assert_eq!(ev.store_index, 1);

        let got = s.get("/1/foo", false, false).unwrap();
        assert_eq!(got.node.value.as_deref(), Some("bar"));
        assert_eq!(got.node.modified_index, 1);
    }

    #[test]
    fn test_create_existing_fails() {
        let s = store();
        s.create("/1/foo", false, "a".to_string(), false, None)
            .unwrap();
        let err = s
            .create("/1/foo", false, "b".to_string(), false, None)
            .unwrap_err();
        assert!(matches!(err, PalisadeError::KeyExists { .. }));
    }

    #[test]
    fn test_create_makes_intermediate_dirs() {
        let s = store();
        s.create("/1/a/b/c", false, "v".to_string(), false, None)
            .unwrap();
        let got = s.get("/1/a", false, false).unwrap();
        assert!(got.node.dir);
        assert_eq!(got.node.nodes.len(), 1);
        assert_eq!(got.node.nodes[0].key, "/1/a/b");
    }

    #[test]
    fn test_unique_create_appends_index_suffix() {
        let s = store();
        let ev1 = s
            .create("/1/queue", true, String::new(), false, None)
            .unwrap();
        assert!(ev1.node.dir);
        let ev2 = s
            .create("/1/queue", false, "job".to_string(), true, None)
            .unwrap();
        assert_eq!(ev2.node.key, format!("/1/queue/{:020}", 2));
    }

    #[test]
    fn test_dir_listing_is_key_ordered() {
        let s = store();
        for k in ["zeta", "alpha", "mid"] {
            s.create(&format!("/1/dir/{}", k), false, k.to_string(), false, None)
                .unwrap();
        }
        let got = s.get("/1/dir", false, true).unwrap();
        let keys: Vec<_> = got.node.nodes.iter().map(|n| n.key.as_str()).collect();
        assert_eq!(keys, vec!["/1/dir/alpha", "/1/dir/mid", "/1/dir/zeta"]);
    }

    #[test]
    fn test_recursive_get_includes_subtree() {
        let s = store();
        s.create("/1/a/b", false, "x".to_string(), false, None)
            .unwrap();
        let got = s.get("/1", true, false).unwrap();
        assert_eq!(got.node.nodes[0].nodes[0].key, "/1/a/b");
    }

    #[test]
    fn test_set_replaces_and_records_prev() {
        let s = store();
        s.set("/1/k", false, "one".to_string(), None).unwrap();
        let ev = s.set("/1/k", false, "two".to_string(), None).unwrap();
        assert_eq!(ev.prev_node.as_ref().unwrap().value.as_deref(), Some("one"));
        assert_eq!(ev.node.value.as_deref(), Some("two"));
    }

    #[test]
    fn test_set_on_directory_fails() {
        let s = store();
        s.create("/1/d", true, String::new(), false, None).unwrap();
        let err = s.set("/1/d", false, "v".to_string(), None).unwrap_err();
        assert!(matches!(err, PalisadeError::NotAFile { .. }));
    }

    #[test]
    fn test_update_keeps_created_index() {
        let s = store();
        let created = s
            .create("/1/k", false, "a".to_string(), false, None)
            .unwrap();
        let updated = s.update("/1/k", "b".to_string(), None).unwrap();
        assert_eq!(updated.node.created_index, created.node.created_index);
        assert!(updated.node.modified_index > created.node.modified_index);
    }

    #[test]
    fn test_update_missing_fails() {
        let s = store();
        let err = s.update("/1/none", "v".to_string(), None).unwrap_err();
        assert!(matches!(err, PalisadeError::KeyNotFound { .. }));
    }

    #[test]
    fn test_compare_and_swap() {
        let s = store();
        let ev = s
            .create("/1/k", false, "old".to_string(), false, None)
            .unwrap();

        let err = s
            .compare_and_swap("/1/k", "wrong", 0, "new".to_string(), None)
            .unwrap_err();
        assert!(matches!(err, PalisadeError::CompareFailed { .. }));

        let ok = s
            .compare_and_swap("/1/k", "old", ev.node.modified_index, "new".to_string(), None)
            .unwrap();
        assert_eq!(ok.node.value.as_deref(), Some("new"));
    }

    #[test]
    fn test_compare_and_delete() {
        let s = store();
        s.create("/1/k", false, "v".to_string(), false, None)
            .unwrap();
        let err = s.compare_and_delete("/1/k", "x", 0).unwrap_err();
        assert!(matches!(err, PalisadeError::CompareFailed { .. }));

        s.compare_and_delete("/1/k", "v", 0).unwrap();
        assert!(s.get("/1/k", false, false).is_err());
    }

    #[test]
    fn test_delete_directory_requires_recursive() {
        let s = store();
        s.create("/1/d/child", false, "v".to_string(), false, None)
            .unwrap();
        let err = s.delete("/1/d", true, false).unwrap_err();
        assert!(matches!(err, PalisadeError::DirectoryNotEmpty { .. }));

        s.delete("/1/d", true, true).unwrap();
        assert!(s.get("/1/d", false, false).is_err());
    }

    #[test]
    fn test_root_is_read_only() {
        let s = store();
        assert!(matches!(
            s.set("/", false, "v".to_string(), None),
            Err(PalisadeError::RootReadOnly)
        ));
        assert!(matches!(
            s.delete("/", true, true),
            Err(PalisadeError::RootReadOnly)
        ));
    }

    #[test]
    fn test_expired_node_hidden_from_get_until_swept() {
        let s = store();
        let past = Utc::now() - Duration::seconds(10);
        s.create("/1/ttl", false, "v".to_string(), false, Some(past))
            .unwrap();

        assert!(s.get("/1/ttl", false, false).is_err());

        s.delete_expired_keys(Utc::now());
        // The sweep produced an index bump and the node is gone for good.
        assert!(s.get("/1/ttl", false, false).is_err());
        assert_eq!(s.index(), 2);
    }

    #[test]
    fn test_sweep_ignores_live_nodes() {
        let s = store();
        let future = Utc::now() + Duration::seconds(3600);
        s.create("/1/live", false, "v".to_string(), false, Some(future))
            .unwrap();
        s.delete_expired_keys(Utc::now());
        assert!(s.get("/1/live", false, false).is_ok());
    }

    #[tokio::test]
    async fn test_watch_sees_create() {
        let s = store();
        let mut w = s.watch("/1/k", false, false, 0).unwrap();
        s.create("/1/k", false, "v".to_string(), false, None)
            .unwrap();
        let ev = w.recv().await.unwrap();
        assert_eq!(ev.action, Action::Create);
        assert_eq!(ev.node.key, "/1/k");
    }

    #[tokio::test]
    async fn test_recursive_watch_sees_descendants() {
        let s = store();
        let mut w = s.watch("/1", true, true, 0).unwrap();
        s.create("/1/a/b", false, "v".to_string(), false, None)
            .unwrap();
        let ev = w.recv().await.unwrap();
        assert_eq!(ev.node.key, "/1/a/b");
    }

    #[tokio::test]
    async fn test_watch_since_replays_history() {
        let s = store();
        s.set("/1/k", false, "one".to_string(), None).unwrap();
        s.set("/1/k", false, "two".to_string(), None).unwrap();

        let mut w = s.watch("/1/k", false, false, 1).unwrap();
        let ev = w.recv().await.unwrap();
        assert_eq!(ev.store_index, 1);
        assert_eq!(ev.node.value.as_deref(), Some("one"));
    }

    #[test]
    fn test_save_recovery_round_trip() {
        let s = store();
        s.set("/1/k", false, "v".to_string(), None).unwrap();
        s.create("/1/d/x", false, "y".to_string(), false, None)
            .unwrap();
        let blob = s.save().unwrap();

        let fresh = store();
        fresh.recovery(&blob).unwrap();
        assert_eq!(fresh.index(), s.index());
        assert_eq!(
            fresh.get("/1/d/x", false, false).unwrap().node.value.as_deref(),
            Some("y")
        );
    }

    #[test]
    fn test_clone_is_independent() {
        let s = store();
        s.set("/1/k", false, "v".to_string(), None).unwrap();
        let snap = s.clone();
        s.set("/1/k", false, "changed".to_string(), None).unwrap();
        assert_eq!(
            snap.get("/1/k", false, false).unwrap().node.value.as_deref(),
            Some("v")
        );
    }
}
