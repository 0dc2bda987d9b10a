//! Request and response types exchanged between the gateway, the log, and
//! the apply engine.

use serde::{Deserialize, Serialize};

use crate::store::{Event, Watcher};

/// Request method. Mutating methods plus `QGet` and `Sync` are serialized
/// through the raft log; `Get` and `Head` are served from the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Post,
    Put,
    Delete,
    Get,
    QGet,
    Head,
    Sync,
}

impl Default for Method {
    fn default() -> Self {
        Method::Get
    }
}

/// A client request. Encoded with bincode when it travels through the log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: Method,
    pub path: String,
    pub val: String,
    pub dir: bool,
    pub prev_value: String,
    pub prev_index: u64,
    pub prev_exist: Option<bool>,
    /// Absolute expiration in unix nanoseconds; 0 means permanent.
    pub expiration: i64,
    pub wait: bool,
    pub since: u64,
    pub recursive: bool,
    pub sorted: bool,
    pub quorum: bool,
    pub stream: bool,
    /// Wall time of the proposing leader, unix nanoseconds. Only used by
    /// `Sync` to expire TTL keys against a single clock cluster-wide.
    pub time: i64,
}

impl Request {
    pub fn sync(id: u64, time: i64) -> Self {
        Request {
            id,
            method: Method::Sync,
            time,
            ..Default::default()
        }
    }
}

/// Result of a fulfilled request: a store event for reads and applied
/// mutations, or a live watcher handle for `Get` with `wait`.
#[derive(Debug, Default)]
pub struct Response {
    pub event: Option<Event>,
    pub watcher: Option<Watcher>,
}

impl Response {
    pub fn from_event(event: Event) -> Self {
        Response {
            event: Some(event),
            watcher: None,
        }
    }

    pub fn from_watcher(watcher: Watcher) -> Self {
        Response {
            event: None,
            watcher: Some(watcher),
        }
    }
}
