//! Internal tree node of the store. Directories hold ordered children;
//! files hold a value. Both carry the log-correlated created/modified
//! indices and an optional absolute expiration.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::NodeInfo;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum NodeKind {
    File { value: String },
    Dir { children: BTreeMap<String, Node> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Node {
    pub created_index: u64,
    pub modified_index: u64,
    pub expiration: Option<DateTime<Utc>>,
    pub kind: NodeKind,
}

impl Node {
    pub fn new_file(value: String, index: u64, expiration: Option<DateTime<Utc>>) -> Self {
        Node {
            created_index: index,
            modified_index: index,
            expiration,
            kind: NodeKind::File { value },
        }
    }

    pub fn new_dir(index: u64, expiration: Option<DateTime<Utc>>) -> Self {
        Node {
            created_index: index,
            modified_index: index,
            expiration,
            kind: NodeKind::Dir {
                children: BTreeMap::new(),
            },
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir { .. })
    }

    pub fn value(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::File { value } => Some(value),
            NodeKind::Dir { .. } => None,
        }
    }

    pub fn children(&self) -> Option<&BTreeMap<String, Node>> {
        match &self.kind {
            NodeKind::Dir { children } => Some(children),
            NodeKind::File { .. } => None,
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut BTreeMap<String, Node>> {
        match &mut self.kind {
            NodeKind::Dir { children } => Some(children),
            NodeKind::File { .. } => None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiration, Some(exp) if exp <= now)
    }

    /// Externalize this node. `depth` controls how far children are
    /// listed: 0 lists none, 1 one level, `u32::MAX` the full subtree.
    pub fn info(&self, key: &str, depth: u32) -> NodeInfo {
        let nodes = match (&self.kind, depth) {
            (NodeKind::Dir { children }, d) if d > 0 => children
                .iter()
                .map(|(name, child)| child.info(&join_key(key, name), d - 1))
                .collect(),
            _ => Vec::new(),
        };
        NodeInfo {
            key: key.to_string(),
            value: self.value().map(str::to_string),
            dir: self.is_dir(),
            nodes,
            created_index: self.created_index,
            modified_index: self.modified_index,
            expiration: self.expiration,
        }
    }
}

pub(crate) fn join_key(base: &str, name: &str) -> String {
    if base == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", base, name)
    }
}
