//! The consensus driver: the single task that owns the `RawNode`, the
//! durable storage writes, and the transport send path.
//!
//! The loop multiplexes ticks, inbound messages/proposals, the leader-only
//! sync timer, and stop. Every ready batch is processed as one linear
//! sequence whose order is load-bearing:
//!
//! 1. absorb soft state (leader cache, sync timer arming);
//! 2. hand `{committed entries, snapshot, done}` to the apply engine
//!    before advancing, so raft cannot overwrite unapplied state;
//! 3. save an incoming snapshot to stable storage, then absorb it into the
//!    log view;
//! 4. persist hard state and unstable entries (a committed redb write);
//! 5. only then hand outbound messages to the transport: an entry is
//!    durable on this member before any peer can learn of it;
//! 6. block until the apply engine signals `done`, meanwhile servicing its
//!    `apply_conf_change` calls;
//! 7. advance, flush light-ready output, and mark the batch applied.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use raft::prelude::{ConfChange, ConfState, Entry, Message, RawNode, Snapshot};
use raft::{SnapshotStatus, StateRole};
use slog::o;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cluster::Cluster;
use crate::error::{PalisadeError, PalisadeResult};
use crate::id::Generator;
use crate::transport::Transport;
use crate::types::Request;

use super::storage::DiskStorage;

/// Leader-only cadence for proposing TTL-expiration sync requests.
const SYNC_TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Raft treats a zero-index snapshot as absent.
pub fn is_empty_snap(snapshot: &Snapshot) -> bool {
    snapshot.get_metadata().index == 0
}

/// Work the driver hands to the apply engine. The engine owns the store and
/// the cluster view; the driver blocks on `done` before advancing.
pub(crate) struct Apply {
    pub entries: Vec<Entry>,
    pub snapshot: Snapshot,
    pub done: oneshot::Sender<()>,
}

pub(crate) enum RaftMsg {
    Propose { data: Vec<u8> },
    ProposeConfChange { cc: ConfChange },
    Step(Message),
    ReportUnreachable(u64),
    ReportSnapshot { to: u64, status: SnapshotStatus },
}

/// Cheap handle for enqueuing work onto the driver. Sends never block;
/// outcomes come back through the wait registry or not at all.
#[derive(Clone)]
pub struct RaftHandle {
    msg_tx: mpsc::UnboundedSender<RaftMsg>,
}

impl RaftHandle {
    pub(crate) fn propose(&self, data: Vec<u8>) {
        let _ = self.msg_tx.send(RaftMsg::Propose { data });
    }

    pub(crate) fn propose_conf_change(&self, cc: ConfChange) {
        let _ = self.msg_tx.send(RaftMsg::ProposeConfChange { cc });
    }

    pub(crate) fn step(&self, msg: Message) {
        let _ = self.msg_tx.send(RaftMsg::Step(msg));
    }

    pub fn report_unreachable(&self, id: u64) {
        let _ = self.msg_tx.send(RaftMsg::ReportUnreachable(id));
    }

    pub fn report_snapshot(&self, to: u64, status: SnapshotStatus) {
        let _ = self.msg_tx.send(RaftMsg::ReportSnapshot { to, status });
    }
}

/// The apply engine's way to feed a committed membership change back into
/// the consensus module. The driver services these while it waits on the
/// apply barrier, mirroring how the raft library runs its own goroutine in
/// the original design.
pub(crate) struct ConfApplier {
    tx: mpsc::UnboundedSender<(ConfChange, oneshot::Sender<ConfState>)>,
}

impl ConfApplier {
    pub async fn apply(&self, cc: ConfChange) -> PalisadeResult<ConfState> {
        let (tx, rx) = oneshot::channel();
        self.tx.send((cc, tx)).map_err(|_| PalisadeError::Stopped)?;
        rx.await.map_err(|_| PalisadeError::Stopped)
    }
}

/// Narrow capability record the driver needs from the server: membership
/// tombstones for the send path, the transport, and the id generator for
/// self-issued sync requests.
pub(crate) struct RaftContext {
    pub cluster: Arc<Cluster>,
    pub transport: Arc<dyn Transport>,
    pub req_id_gen: Arc<Generator>,
    /// Cached leader id, published for lock-free reads by the gateway.
    pub lead: Arc<AtomicU64>,
}

pub(crate) struct RaftNode {
    node: RawNode<DiskStorage>,
    storage: DiskStorage,
    ctx: RaftContext,
    msg_rx: mpsc::UnboundedReceiver<RaftMsg>,
    apply_tx: mpsc::Sender<Apply>,
    conf_rx: mpsc::UnboundedReceiver<(ConfChange, oneshot::Sender<ConfState>)>,
    shutdown: watch::Receiver<bool>,
    tick_interval: Duration,
    sync_enabled: bool,
}

/// Receiving halves owned by the driver task.
pub(crate) struct DriverChannels {
    msg_rx: mpsc::UnboundedReceiver<RaftMsg>,
    conf_rx: mpsc::UnboundedReceiver<(ConfChange, oneshot::Sender<ConfState>)>,
    apply_tx: mpsc::Sender<Apply>,
}

/// Wire up the driver's channels. The handle and conf applier go to the
/// server; the apply receiver goes to the apply engine; the rest feeds the
/// driver itself.
pub(crate) fn channels() -> (RaftHandle, ConfApplier, mpsc::Receiver<Apply>, DriverChannels) {
    let (msg_tx, msg_rx) = mpsc::unbounded_channel();
    let (conf_tx, conf_rx) = mpsc::unbounded_channel();
    let (apply_tx, apply_rx) = mpsc::channel(1);
    (
        RaftHandle { msg_tx },
        ConfApplier { tx: conf_tx },
        apply_rx,
        DriverChannels {
            msg_rx,
            conf_rx,
            apply_tx,
        },
    )
}

impl RaftNode {
    pub fn new(
        raft_config: raft::Config,
        storage: DiskStorage,
        ctx: RaftContext,
        channels: DriverChannels,
        shutdown: watch::Receiver<bool>,
        tick_interval: Duration,
    ) -> PalisadeResult<Self> {
        // The raft crate insists on a slog logger; application logging goes
        // through tracing.
        let logger = slog::Logger::root(slog::Discard, o!());
        let node = RawNode::new(&raft_config, storage.clone(), &logger)
            .map_err(|e| PalisadeError::raft("create raw node", e))?;
        Ok(RaftNode {
            node,
            storage,
            ctx,
            msg_rx: channels.msg_rx,
            apply_tx: channels.apply_tx,
            conf_rx: channels.conf_rx,
            shutdown,
            tick_interval,
            sync_enabled: false,
        })
    }

    pub async fn run(mut self) {
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sync_ticker = interval(SYNC_TICK_INTERVAL);
        sync_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.clone();

        info!("raft driver started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.node.tick();
                }
                _ = sync_ticker.tick(), if self.sync_enabled => {
                    self.propose_sync();
                }
                maybe = self.msg_rx.recv() => match maybe {
                    Some(msg) => self.handle_msg(msg),
                    None => break,
                },
                _ = shutdown.wait_for(|stopped| *stopped) => break,
            }

            match self.on_ready().await {
                Ok(false) => {}
                Ok(true) => break,
                Err(e) => {
                    // A failed durable write means this member can no
                    // longer uphold the log contract.
                    error!(error = %e, "raft driver storage failure");
                    break;
                }
            }
        }

        self.ctx.transport.stop();
        info!("raft driver stopped");
    }

    fn handle_msg(&mut self, msg: RaftMsg) {
        match msg {
            RaftMsg::Propose { data } => {
                if let Err(e) = self.node.propose(vec![], data) {
                    // The proposer's wait slot times out; raft may simply
                    // have no leader yet.
                    debug!(error = %e, "proposal dropped");
                }
            }
            RaftMsg::ProposeConfChange { cc } => {
                if let Err(e) = self.node.propose_conf_change(vec![], cc) {
                    debug!(error = %e, "conf change proposal dropped");
                }
            }
            RaftMsg::Step(m) => {
                if let Err(e) = self.node.step(m) {
                    warn!(error = %e, "failed to step raft message");
                }
            }
            RaftMsg::ReportUnreachable(id) => self.node.report_unreachable(id),
            RaftMsg::ReportSnapshot { to, status } => self.node.report_snapshot(to, status),
        }
    }

    fn propose_sync(&mut self) {
        let req = Request::sync(
            self.ctx.req_id_gen.next(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        );
        match bincode::serialize(&req) {
            Ok(data) => {
                let _ = self.node.propose(vec![], data);
            }
            Err(e) => warn!(error = %e, "failed to serialize sync request"),
        }
    }

    /// Drain ready states. Returns `true` when the driver should stop.
    async fn on_ready(&mut self) -> PalisadeResult<bool> {
        while self.node.has_ready() {
            if self.process_ready().await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn process_ready(&mut self) -> PalisadeResult<bool> {
        let mut ready = self.node.ready();

        if let Some(ss) = ready.ss() {
            self.ctx.lead.store(ss.leader_id, Ordering::SeqCst);
            let is_leader = ss.raft_state == StateRole::Leader;
            if is_leader != self.sync_enabled {
                info!(leader = ss.leader_id, "leadership changed");
            }
            self.sync_enabled = is_leader;
        }

        let snapshot = ready.snapshot().clone();

        // Hand the batch over before doing anything that lets raft move on.
        let (done_tx, done_rx) = oneshot::channel();
        let apply = Apply {
            entries: ready.take_committed_entries(),
            snapshot: snapshot.clone(),
            done: done_tx,
        };
        tokio::select! {
            sent = self.apply_tx.send(apply) => {
                if sent.is_err() {
                    return Ok(true);
                }
            }
            _ = self.shutdown.wait_for(|stopped| *stopped) => return Ok(true),
        }

        if !is_empty_snap(&snapshot) {
            self.storage.save_snapshot(&snapshot)?;
            self.storage.apply_snapshot(&snapshot)?;
        }

        if let Some(hs) = ready.hs() {
            self.storage.save_hard_state(hs)?;
        }
        if !ready.entries().is_empty() {
            self.storage.append(ready.entries())?;
        }

        // Messages go out only after the entries they reference are durable
        // here: follower durability precedes leader visibility.
        let mut msgs = ready.take_messages();
        msgs.append(&mut ready.take_persisted_messages());
        self.send_messages(msgs);

        if self.wait_applied(done_rx).await {
            return Ok(true);
        }

        let mut light = self.node.advance(ready);
        if let Some(commit) = light.commit_index() {
            let mut hs = self.node.raft.hard_state();
            hs.commit = commit;
            self.storage.save_hard_state(&hs)?;
        }
        self.send_messages(light.take_messages());

        let entries = light.take_committed_entries();
        if !entries.is_empty() {
            let (done_tx, done_rx) = oneshot::channel();
            let apply = Apply {
                entries,
                snapshot: Snapshot::default(),
                done: done_tx,
            };
            tokio::select! {
                sent = self.apply_tx.send(apply) => {
                    if sent.is_err() {
                        return Ok(true);
                    }
                }
                _ = self.shutdown.wait_for(|stopped| *stopped) => return Ok(true),
            }
            if self.wait_applied(done_rx).await {
                return Ok(true);
            }
        }

        self.node.advance_apply();
        Ok(false)
    }

    /// Block until the apply engine finishes the batch, meanwhile serving
    /// its conf-change applications against the raw node. Returns `true`
    /// when the driver should stop.
    async fn wait_applied(&mut self, mut done: oneshot::Receiver<()>) -> bool {
        loop {
            tokio::select! {
                finished = &mut done => return finished.is_err(),
                maybe = self.conf_rx.recv() => {
                    if let Some((cc, tx)) = maybe {
                        let cs = match self.node.apply_conf_change(&cc) {
                            Ok(cs) => cs,
                            Err(e) => {
                                warn!(error = %e, node_id = cc.node_id, "apply conf change failed");
                                self.storage.conf_state().unwrap_or_default()
                            }
                        };
                        if let Err(e) = self.storage.save_conf_state(&cs) {
                            warn!(error = %e, "failed to persist conf state");
                        }
                        let _ = tx.send(cs);
                    }
                }
                _ = self.shutdown.wait_for(|stopped| *stopped) => return true,
            }
        }
    }

    fn send_messages(&self, msgs: Vec<Message>) {
        if msgs.is_empty() {
            return;
        }
        // Never address a removed member.
        let msgs: Vec<Message> = msgs
            .into_iter()
            .filter(|m| !self.ctx.cluster.is_id_removed(m.to))
            .collect();
        if !msgs.is_empty() {
            self.ctx.transport.send(msgs);
        }
    }
}
