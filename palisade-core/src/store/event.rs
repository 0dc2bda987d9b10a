//! Store events: the externally visible result of every store operation,
//! also the unit delivered to watchers and retained in the event history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Get,
    Create,
    Set,
    Update,
    Delete,
    CompareAndSwap,
    CompareAndDelete,
    Expire,
}

/// Externalized view of a store node at the time of an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub key: String,
    /// `None` for directories and deleted nodes.
    pub value: Option<String>,
    pub dir: bool,
    /// Children, one level deep for plain directory reads, full depth for
    /// recursive reads, empty otherwise.
    pub nodes: Vec<NodeInfo>,
    pub created_index: u64,
    pub modified_index: u64,
    pub expiration: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub action: Action,
    pub node: NodeInfo,
    pub prev_node: Option<NodeInfo>,
    /// Store index at which the event was generated.
    pub store_index: u64,
}

impl Event {
    pub(crate) fn new(action: Action, node: NodeInfo, store_index: u64) -> Self {
        Event {
            action,
            node,
            prev_node: None,
            store_index,
        }
    }

    pub(crate) fn with_prev(mut self, prev: NodeInfo) -> Self {
        self.prev_node = Some(prev);
        self
    }
}
