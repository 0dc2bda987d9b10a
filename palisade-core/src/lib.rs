//! palisade-core: a replicated, strongly-consistent key-value coordination
//! service for small clusters.
//!
//! The crate is organized around the replicated state machine subsystem: a
//! consensus driver pumps the raft state machine and persists its output
//! ([`raft`]), an apply engine executes committed entries against the
//! in-memory store ([`store`]) and the membership view ([`cluster`]), and
//! the request gateway ([`server::Server`]) correlates commit events back
//! to callers through the [`wait`] registry.

pub mod cluster;
pub mod config;
pub mod error;
pub mod id;
pub mod raft;
pub mod server;
pub mod store;
pub mod transport;
pub mod types;
pub mod wait;

/// Namespace holding membership bookkeeping.
pub const STORE_ADMIN_PREFIX: &str = "/0";
/// Namespace holding user keys.
pub const STORE_KEYS_PREFIX: &str = "/1";

pub use cluster::{Attributes, Cluster, Member, RaftAttributes};
pub use config::NodeConfig;
pub use error::{PalisadeError, PalisadeResult};
pub use server::Server;
pub use store::{Action, Event, Store, Watcher};
pub use transport::{ChannelTransport, LocalMesh, NoopTransport, Transport};
pub use types::{Method, Request, Response};
