//! The coordination server: bootstrap, the request gateway, and the apply
//! engine that executes committed entries against the store and the
//! cluster view.

use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use protobuf::Message as _;
use raft::prelude::{ConfChange, ConfChangeType, ConfState, Entry, EntryType, Message};
use regex::Regex;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::cluster::{
    member_attributes_store_path, member_id_from_key, Attributes, Cluster, ConfChangeContext,
    ConfChangeKind, Member,
};
use crate::config::NodeConfig;
use crate::error::{PalisadeError, PalisadeResult};
use crate::id::Generator;
use crate::raft::node::{self, Apply, ConfApplier, RaftContext, RaftNode};
use crate::raft::{bootstrap, is_empty_snap, DiskStorage, RaftHandle};
use crate::store::Store;
use crate::transport::Transport;
use crate::types::{Method, Request, Response};
use crate::wait::{WaitRegistry, WaitValue};
use crate::{STORE_ADMIN_PREFIX, STORE_KEYS_PREFIX};

/// Entries a compacted log keeps in front of the newest snapshot so a slow
/// follower can catch up without a full snapshot transfer.
const NUMBER_OF_CATCH_UP_ENTRIES: u64 = 5_000;

const MAX_SIZE_PER_MSG: u64 = 1024 * 1024;
/// Keep well under the transport's in-flight buffer of 4096.
const MAX_INFLIGHT_MSGS: usize = 4096 / 8;

const PURGE_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_PUBLISH_RETRY_INTERVAL: Duration = Duration::from_secs(5);
/// Grace period between applying our own removal and stopping, so the
/// acknowledgement can still reach the caller.
const REMOVED_SELF_STOP_DELAY: Duration = Duration::from_secs(1);

static MEMBER_ATTRIBUTES_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/0/members/[[:xdigit:]]{1,16}/attributes$").expect("static regex is valid")
});

const STATE_BOOTSTRAPPED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPING: u8 = 2;
const STATE_STOPPED: u8 = 3;

struct StartupParts {
    driver: RaftNode,
    apply_rx: mpsc::Receiver<Apply>,
    conf_applier: ConfApplier,
}

pub struct Server {
    cfg: NodeConfig,
    id: u64,
    attributes: Attributes,
    cluster: Arc<Cluster>,
    store: Arc<Store>,
    storage: DiskStorage,
    raft: RaftHandle,
    wait: Arc<WaitRegistry>,
    req_id_gen: Arc<Generator>,

    applied_index: AtomicU64,
    term: AtomicU64,
    lead: Arc<AtomicU64>,
    snap_count: u64,

    state: AtomicU8,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,

    startup: Mutex<Option<StartupParts>>,
}

impl Server {
    /// Build a server from static configuration. Decides between the three
    /// bootstrap paths (join, fresh cluster, restart) based on whether
    /// the data directory already holds a keyed log.
    pub fn new(cfg: NodeConfig, transport: Arc<dyn Transport>) -> PalisadeResult<Arc<Server>> {
        cfg.validate()?;

        ensure_private_dir(&cfg.data_dir)?;
        ensure_private_dir(&cfg.member_dir())?;
        probe_dir_writable(&cfg.data_dir)?;
        probe_dir_writable(&cfg.member_dir())?;

        let storage = DiskStorage::open(&cfg.db_path())?;
        let store = Arc::new(Store::new(&[STORE_ADMIN_PREFIX, STORE_KEYS_PREFIX]));
        let initialized = storage.is_initialized()?;

        if cfg.should_discover() && initialized {
            info!("discovery url ignored: a log already exists in the data directory");
        }

        let token = cfg.initial_cluster_token.clone();
        let (cluster, self_id, snap_index) = match (initialized, cfg.new_cluster) {
            (false, false) => {
                // Join: member ids derive deterministically from the shared
                // cluster spec, so no remote fetch is needed to agree on
                // them. The log itself arrives from the leader.
                let cluster = Arc::new(Cluster::from_string(&token, &cfg.initial_cluster)?);
                cluster.validate()?;
                let member = cluster.member_by_name(&cfg.name).ok_or_else(|| {
                    PalisadeError::ClusterJoin {
                        reason: format!("member {:?} not listed in the cluster spec", cfg.name),
                    }
                })?;
                cluster.set_store(Arc::clone(&store));
                bootstrap::start_node(&storage, &cluster, member.id, None)?;
                info!("joining existing cluster as member {:x}", member.id);
                (cluster, member.id, 0)
            }
            (false, true) => {
                let cluster = Arc::new(Cluster::from_string(&token, &cfg.initial_cluster)?);
                cluster.validate()?;
                let member = cluster.member_by_name(&cfg.name).ok_or_else(|| {
                    PalisadeError::Config {
                        message: format!(
                            "member {:?} not listed in its own cluster spec",
                            cfg.name
                        ),
                    }
                })?;
                cluster.set_store(Arc::clone(&store));
                let ids = cluster.member_ids();
                bootstrap::start_node(&storage, &cluster, member.id, Some(&ids))?;
                info!("bootstrapping new cluster {:x} as member {:x}", cluster.id(), member.id);
                (cluster, member.id, 0)
            }
            (true, _) => {
                let snapshot = storage.latest_snapshot()?;
                if let Some(s) = &snapshot {
                    store
                        .recovery(&s.data)
                        .map_err(|e| PalisadeError::Internal {
                            message: format!("recover store from snapshot: {}", e),
                        })?;
                    info!(
                        index = s.get_metadata().index,
                        "recovered store from snapshot"
                    );
                }
                let cluster = Arc::new(Cluster::from_store(&token, Arc::clone(&store)));
                let (node_id, _) = storage.metadata()?.ok_or_else(|| PalisadeError::Internal {
                    message: "initialized log has no metadata record".to_string(),
                })?;
                let snap_index = snapshot
                    .as_ref()
                    .map(|s| s.get_metadata().index)
                    .unwrap_or(0);

                if cfg.force_new_cluster {
                    // If self has dropped out of the derived id set, re-add
                    // it with the caller-supplied peer urls.
                    let self_member = cluster.member(node_id).unwrap_or_else(|| {
                        let mut m = Member::new(&cfg.name, cfg.peer_urls.clone(), &token);
                        m.id = node_id;
                        m
                    });
                    bootstrap::restart_as_standalone_node(&storage, &self_member)?;
                    info!("forcing restart of member {:x} as a standalone cluster", node_id);
                } else {
                    info!(
                        "restarting member {:x} at commit index {}",
                        node_id,
                        storage.hard_state()?.commit
                    );
                }
                (cluster, node_id, snap_index)
            }
        };

        cluster.set_transport(Arc::clone(&transport));

        let req_id_gen = Arc::new(Generator::new(self_id as u8, Utc::now()));
        let lead = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let raft_config = raft::Config {
            id: self_id,
            election_tick: cfg.election_ticks,
            heartbeat_tick: 1,
            applied: snap_index,
            max_size_per_msg: MAX_SIZE_PER_MSG,
            max_inflight_msgs: MAX_INFLIGHT_MSGS,
            ..Default::default()
        };

        let (raft_handle, conf_applier, apply_rx, driver_channels) = node::channels();
        let driver = RaftNode::new(
            raft_config,
            storage.clone(),
            RaftContext {
                cluster: Arc::clone(&cluster),
                transport,
                req_id_gen: Arc::clone(&req_id_gen),
                lead: Arc::clone(&lead),
            },
            driver_channels,
            shutdown_rx.clone(),
            cfg.tick_interval(),
        )?;

        let attributes = Attributes {
            name: cfg.name.clone(),
            client_urls: cfg.client_urls.clone(),
        };
        let snap_count = cfg.effective_snap_count();

        Ok(Arc::new(Server {
            cfg,
            id: self_id,
            attributes,
            cluster,
            store,
            storage,
            raft: raft_handle,
            wait: Arc::new(WaitRegistry::new()),
            req_id_gen,
            applied_index: AtomicU64::new(snap_index),
            term: AtomicU64::new(0),
            lead,
            snap_count,
            state: AtomicU8::new(STATE_BOOTSTRAPPED),
            shutdown_tx,
            shutdown_rx,
            done_tx,
            done_rx,
            startup: Mutex::new(Some(StartupParts {
                driver,
                apply_rx,
                conf_applier,
            })),
        }))
    }

    /// Spawn the driver, the apply engine, the publisher, and the snapshot
    /// purger. Non-blocking; idempotent calls after the first are ignored.
    pub fn start(self: &Arc<Self>) {
        let parts = self
            .startup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(parts) = parts else {
            warn!("server already started");
            return;
        };
        self.state.store(STATE_RUNNING, Ordering::SeqCst);

        tokio::spawn(parts.driver.run());
        tokio::spawn(Arc::clone(self).run(parts.apply_rx, parts.conf_applier));
        tokio::spawn(Arc::clone(self).publish(DEFAULT_PUBLISH_RETRY_INTERVAL));
        tokio::spawn(Arc::clone(self).purge_snapshots_loop());
    }

    /// Stop the server and wait for the apply engine to wind down.
    pub async fn stop(&self) {
        self.begin_stop();
        let mut done = self.done_rx.clone();
        let _ = done.wait_for(|stopped| *stopped).await;
    }

    fn begin_stop(&self) {
        let previous = self.state.swap(STATE_STOPPING, Ordering::SeqCst);
        if previous == STATE_STOPPED {
            self.state.store(STATE_STOPPED, Ordering::SeqCst);
        }
        // A server that was never started has no apply engine to signal
        // completion; it is stopped the moment its tasks are discarded.
        let never_started = self
            .startup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some();
        if never_started {
            self.state.store(STATE_STOPPED, Ordering::SeqCst);
            let _ = self.done_tx.send(true);
        }
        let _ = self.shutdown_tx.send(true);
    }

    fn stopping(&self) -> bool {
        self.state.load(Ordering::SeqCst) >= STATE_STOPPING
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn leader(&self) -> u64 {
        self.lead.load(Ordering::SeqCst)
    }

    pub fn is_leader(&self) -> bool {
        self.leader() == self.id
    }

    /// Index of the last applied entry.
    pub fn index(&self) -> u64 {
        self.applied_index.load(Ordering::SeqCst)
    }

    /// Term of the last applied entry.
    pub fn term(&self) -> u64 {
        self.term.load(Ordering::SeqCst)
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn raft_storage(&self) -> &DiskStorage {
        &self.storage
    }

    pub fn raft_handle(&self) -> RaftHandle {
        self.raft.clone()
    }

    /// Step an inbound raft message from a peer. Messages from removed
    /// members are rejected outright so a zombie cannot disturb the
    /// cluster.
    pub fn process(&self, msg: Message) -> PalisadeResult<()> {
        if self.cluster.is_id_removed(msg.from) {
            return Err(PalisadeError::MemberRemoved);
        }
        if self.stopping() {
            return Err(PalisadeError::Stopped);
        }
        self.raft.step(msg);
        Ok(())
    }

    /// Transport callback: a peer could not be reached.
    pub fn report_unreachable(&self, id: u64) {
        self.raft.report_unreachable(id);
    }

    /// Transport callback: outcome of a snapshot transfer to a peer.
    pub fn report_snapshot(&self, to: u64, status: raft::SnapshotStatus) {
        self.raft.report_snapshot(to, status);
    }

    /// Fulfill a client request. Mutations and quorum reads are serialized
    /// through the log; plain reads and watches are served locally. On
    /// timeout the wait slot is garbage-collected and the proposal, if it
    /// still commits, applies without a listener.
    pub async fn do_request(
        &self,
        mut r: Request,
        timeout: Duration,
    ) -> PalisadeResult<Response> {
        if self.stopping() {
            return Err(PalisadeError::Stopped);
        }
        r.id = self.req_id_gen.next();
        if r.method == Method::Get && r.quorum {
            r.method = Method::QGet;
        }

        match r.method {
            Method::Post | Method::Put | Method::Delete | Method::QGet => {
                let id = r.id;
                let data = bincode::serialize(&r)
                    .map_err(|e| PalisadeError::serialization("serialize request", e))?;
                let rx = self.wait.register(id);
                self.raft.propose(data);

                let mut shutdown = self.shutdown_rx.clone();
                tokio::select! {
                    value = rx => match value {
                        Ok(WaitValue::Request(result)) => result,
                        Ok(WaitValue::ConfChange(_)) => Err(PalisadeError::Internal {
                            message: "mismatched wait delivery".to_string(),
                        }),
                        Err(_) => Err(PalisadeError::Canceled),
                    },
                    _ = tokio::time::sleep(timeout) => {
                        self.wait.abandon(id);
                        Err(PalisadeError::Timeout { duration: timeout })
                    }
                    _ = shutdown.wait_for(|stopped| *stopped) => Err(PalisadeError::Stopped),
                }
            }
            Method::Get => {
                if r.wait {
                    let watcher = self.store.watch(&r.path, r.recursive, r.stream, r.since)?;
                    Ok(Response::from_watcher(watcher))
                } else {
                    self.store
                        .get(&r.path, r.recursive, r.sorted)
                        .map(Response::from_event)
                }
            }
            Method::Head => self
                .store
                .get(&r.path, r.recursive, r.sorted)
                .map(Response::from_event),
            Method::Sync => Err(PalisadeError::UnknownMethod),
        }
    }

    /// Propose adding a member. The caller learns the outcome once the
    /// change has committed and applied cluster-wide.
    pub async fn add_member(&self, member: Member, timeout: Duration) -> PalisadeResult<()> {
        let cc = build_conf_change(
            ConfChangeType::AddNode,
            member.id,
            ConfChangeContext {
                kind: ConfChangeKind::Add,
                member: Some(member),
            },
        )?;
        self.configure(cc, timeout).await
    }

    pub async fn remove_member(&self, id: u64, timeout: Duration) -> PalisadeResult<()> {
        let cc = build_conf_change(
            ConfChangeType::RemoveNode,
            id,
            ConfChangeContext {
                kind: ConfChangeKind::Remove,
                member: None,
            },
        )?;
        self.configure(cc, timeout).await
    }

    /// Rewrite an existing member's peer urls. The raft voter set is
    /// untouched; only the transport targets change.
    pub async fn update_member(&self, member: Member, timeout: Duration) -> PalisadeResult<()> {
        let cc = build_conf_change(
            ConfChangeType::AddNode,
            member.id,
            ConfChangeContext {
                kind: ConfChangeKind::Update,
                member: Some(member),
            },
        )?;
        self.configure(cc, timeout).await
    }

    /// Send a configuration change through consensus and wait for the apply
    /// engine to execute it.
    async fn configure(&self, mut cc: ConfChange, timeout: Duration) -> PalisadeResult<()> {
        if self.stopping() {
            return Err(PalisadeError::Stopped);
        }
        cc.id = self.req_id_gen.next();
        let rx = self.wait.register(cc.id);
        let id = cc.id;
        self.raft.propose_conf_change(cc);

        let mut shutdown = self.shutdown_rx.clone();
        tokio::select! {
            value = rx => match value {
                Ok(WaitValue::ConfChange(result)) => result,
                Ok(WaitValue::Request(_)) => Err(PalisadeError::Internal {
                    message: "mismatched wait delivery".to_string(),
                }),
                Err(_) => Err(PalisadeError::Canceled),
            },
            _ = tokio::time::sleep(timeout) => {
                self.wait.abandon(id);
                Err(PalisadeError::Timeout { duration: timeout })
            }
            _ = shutdown.wait_for(|stopped| *stopped) => Err(PalisadeError::Stopped),
        }
    }

    /// The apply engine: the single task that mutates the store and the
    /// cluster view from committed entries and snapshots.
    async fn run(
        self: Arc<Self>,
        mut apply_rx: mpsc::Receiver<Apply>,
        conf_applier: ConfApplier,
    ) {
        let snapshot = self.storage.latest_snapshot().ok().flatten();
        let (mut appliedi, mut confstate) = match &snapshot {
            Some(s) => (
                s.get_metadata().index,
                s.get_metadata().get_conf_state().clone(),
            ),
            None => (0, self.storage.conf_state().unwrap_or_default()),
        };
        let mut snapi = appliedi;
        self.applied_index.store(appliedi, Ordering::SeqCst);

        let mut shutdown = self.shutdown_rx.clone();
        loop {
            let maybe = tokio::select! {
                maybe = apply_rx.recv() => maybe,
                _ = shutdown.wait_for(|stopped| *stopped) => break,
            };
            let Some(apply) = maybe else { break };
            self.apply_batch(apply, &conf_applier, &mut appliedi, &mut snapi, &mut confstate)
                .await;
        }

        self.state.store(STATE_STOPPED, Ordering::SeqCst);
        let _ = self.done_tx.send(true);
        info!("apply engine stopped");
    }

    async fn apply_batch(
        self: &Arc<Self>,
        apply: Apply,
        conf_applier: &ConfApplier,
        appliedi: &mut u64,
        snapi: &mut u64,
        confstate: &mut ConfState,
    ) {
        if !is_empty_snap(&apply.snapshot) {
            let meta = apply.snapshot.get_metadata();
            if meta.index <= *appliedi {
                panic!(
                    "snapshot index [{}] should be greater than applied index [{}]",
                    meta.index, *appliedi
                );
            }
            if let Err(e) = self.store.recovery(&apply.snapshot.data) {
                panic!("recover store from snapshot should never fail: {}", e);
            }
            // A view loaded locally may already be newer than the snapshot;
            // recovering over it would break transport connectivity.
            if self.cluster.index() < meta.index {
                self.cluster.recover();
            }
            *appliedi = meta.index;
            *snapi = meta.index;
            *confstate = meta.get_conf_state().clone();
            self.applied_index.store(meta.index, Ordering::SeqCst);
            self.term.store(meta.term, Ordering::SeqCst);
            info!(index = meta.index, "recovered from incoming snapshot");
        }

        let mut shouldstop = false;
        if let Some(first) = apply.entries.first() {
            if first.index > *appliedi + 1 {
                panic!(
                    "first index of committed entry [{}] should <= applied index [{}] + 1",
                    first.index, *appliedi
                );
            }
            for entry in &apply.entries {
                if entry.index <= *appliedi {
                    // Replays past an absorbed snapshot are no-ops.
                    continue;
                }
                match entry.get_entry_type() {
                    EntryType::EntryNormal => self.apply_normal_entry(entry),
                    EntryType::EntryConfChange => {
                        if self
                            .apply_conf_change_entry(entry, confstate, conf_applier)
                            .await
                        {
                            shouldstop = true;
                        }
                    }
                    EntryType::EntryConfChangeV2 => {
                        warn!("v2 conf change entries are not proposed by this server");
                    }
                }
                *appliedi = entry.index;
                self.applied_index.store(entry.index, Ordering::SeqCst);
                self.term.store(entry.term, Ordering::SeqCst);
            }
        }

        // Let the driver advance before anything else; a snapshot taken
        // before the raft routine finished its disk writes could run ahead
        // of the log.
        let _ = apply.done.send(());

        if shouldstop {
            info!("this member has been removed from the cluster, stopping");
            let server = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(REMOVED_SELF_STOP_DELAY).await;
                server.begin_stop();
            });
        }

        if appliedi.saturating_sub(*snapi) > self.snap_count {
            info!(applied = *appliedi, last_snapshot = *snapi, "starting snapshot");
            self.trigger_snapshot(*appliedi, confstate.clone());
            *snapi = *appliedi;
        }
    }

    fn apply_normal_entry(&self, entry: &Entry) {
        if entry.data.is_empty() {
            // Empty entries mark leadership changes.
            return;
        }
        let req: Request = match bincode::deserialize(&entry.data) {
            Ok(r) => r,
            Err(e) => panic!("unmarshal request should never fail: {}", e),
        };
        let id = req.id;
        let result = self.apply_request(req);
        self.wait.trigger(id, WaitValue::Request(result));
    }

    /// Execute a committed request against the store.
    fn apply_request(&self, r: Request) -> PalisadeResult<Response> {
        let expiration = nanos_to_expiration(r.expiration);
        match r.method {
            Method::Post => self
                .store
                .create(&r.path, r.dir, r.val, true, expiration)
                .map(Response::from_event),
            Method::Put => {
                let event = match r.prev_exist {
                    Some(true) => {
                        if r.prev_index == 0 && r.prev_value.is_empty() {
                            self.store.update(&r.path, r.val, expiration)
                        } else {
                            self.store.compare_and_swap(
                                &r.path,
                                &r.prev_value,
                                r.prev_index,
                                r.val,
                                expiration,
                            )
                        }
                    }
                    Some(false) => self.store.create(&r.path, r.dir, r.val, false, expiration),
                    None if r.prev_index > 0 || !r.prev_value.is_empty() => {
                        self.store.compare_and_swap(
                            &r.path,
                            &r.prev_value,
                            r.prev_index,
                            r.val,
                            expiration,
                        )
                    }
                    None => {
                        if MEMBER_ATTRIBUTES_RE.is_match(&r.path) {
                            self.absorb_member_attributes(&r.path, &r.val);
                        }
                        self.store.set(&r.path, r.dir, r.val, expiration)
                    }
                };
                event.map(Response::from_event)
            }
            Method::Delete => {
                let event = if r.prev_index > 0 || !r.prev_value.is_empty() {
                    self.store
                        .compare_and_delete(&r.path, &r.prev_value, r.prev_index)
                } else {
                    self.store.delete(&r.path, r.dir, r.recursive)
                };
                event.map(Response::from_event)
            }
            Method::QGet => self
                .store
                .get(&r.path, r.recursive, r.sorted)
                .map(Response::from_event),
            Method::Sync => {
                self.store
                    .delete_expired_keys(Utc.timestamp_nanos(r.time));
                Ok(Response::default())
            }
            Method::Get | Method::Head => Err(PalisadeError::UnknownMethod),
        }
    }

    /// A member announced its attributes through the log; mirror them into
    /// the cluster view. The store write that follows is the persistent
    /// copy.
    fn absorb_member_attributes(&self, path: &str, val: &str) {
        let member_dir = path
            .rsplit_once('/')
            .map(|(dir, _)| dir)
            .unwrap_or_default();
        let id = member_id_from_key(member_dir)
            .unwrap_or_else(|| panic!("bad member attribute path {:?}", path));
        let attrs: Attributes = serde_json::from_str(val)
            .unwrap_or_else(|e| panic!("unmarshal attributes should never fail: {}", e));
        self.cluster.update_attributes(id, attrs);
    }

    /// Apply a committed membership change. Invalid changes never reach the
    /// consensus configuration: skipping the application leaves the voter
    /// set exactly as the validation saw it. The entry still advances
    /// the applied index so log and consensus stay aligned. Returns whether
    /// this server was removed.
    async fn apply_conf_change_entry(
        &self,
        entry: &Entry,
        confstate: &mut ConfState,
        conf_applier: &ConfApplier,
    ) -> bool {
        let mut cc = ConfChange::default();
        if let Err(e) = cc.merge_from_bytes(&entry.data) {
            panic!("unmarshal conf change should never fail: {}", e);
        }
        let ctx: ConfChangeContext = match bincode::deserialize(&cc.context) {
            Ok(ctx) => ctx,
            Err(e) => panic!("unmarshal conf change context should never fail: {}", e),
        };

        if let Err(e) =
            self.cluster
                .validate_configuration_change(ctx.kind, cc.node_id, ctx.member.as_ref())
        {
            warn!(error = %e, "rejecting conf change for member {:x}", cc.node_id);
            self.wait.trigger(cc.id, WaitValue::ConfChange(Err(e)));
            return false;
        }

        let mut shouldstop = false;
        let result = match ctx.kind {
            ConfChangeKind::Add => {
                let member = ctx.member.as_ref().expect("validated add carries a member");
                if cc.node_id != member.id {
                    panic!("conf change node id should always equal member id");
                }
                match conf_applier.apply(cc.clone()).await {
                    Ok(cs) => {
                        *confstate = cs;
                        self.cluster.add_member(member, entry.index);
                        if member.id == self.id {
                            info!("added local member {:x} to cluster", member.id);
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            ConfChangeKind::Remove => match conf_applier.apply(cc.clone()).await {
                Ok(cs) => {
                    *confstate = cs;
                    self.cluster.remove_member(cc.node_id, entry.index);
                    if cc.node_id == self.id {
                        shouldstop = true;
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            },
            ConfChangeKind::Update => {
                let member = ctx
                    .member
                    .as_ref()
                    .expect("validated update carries a member");
                if cc.node_id != member.id {
                    panic!("conf change node id should always equal member id");
                }
                self.cluster.update_raft_attributes(
                    member.id,
                    member.raft_attributes.clone(),
                    entry.index,
                );
                Ok(())
            }
        };

        self.wait.trigger(cc.id, WaitValue::ConfChange(result));
        shouldstop
    }

    /// Clone the store and snapshot it off the apply path, then compact the
    /// log down to the catch-up window. Both races with a newer snapshot
    /// resolve silently.
    fn trigger_snapshot(&self, snapi: u64, confstate: ConfState) {
        let clone = self.store.as_ref().clone();
        let storage = self.storage.clone();
        tokio::spawn(async move {
            let data = match clone.save() {
                Ok(data) => data,
                Err(e) => panic!("store save should never fail: {}", e),
            };

            let snapshot = match storage.create_snapshot(snapi, &confstate, data) {
                Ok(s) => s,
                Err(PalisadeError::SnapOutOfDate) => return,
                Err(e) => panic!("unexpected create snapshot error: {}", e),
            };
            info!(index = snapshot.get_metadata().index, "saved snapshot");

            let compacti = if snapi > NUMBER_OF_CATCH_UP_ENTRIES {
                snapi - NUMBER_OF_CATCH_UP_ENTRIES
            } else {
                1
            };
            match storage.compact(compacti) {
                Ok(()) => info!(index = compacti, "compacted raft log"),
                Err(PalisadeError::Compacted) => {}
                Err(e) => panic!("unexpected compaction error: {}", e),
            }
        });
    }

    /// Register this server's attributes under its member key, retrying
    /// until the write commits or the server stops. Makes the member
    /// discoverable to clients.
    async fn publish(self: Arc<Self>, retry_interval: Duration) {
        let value = match serde_json::to_string(&self.attributes) {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "failed to marshal member attributes");
                return;
            }
        };
        let req = Request {
            method: Method::Put,
            path: member_attributes_store_path(self.id),
            val: value,
            ..Default::default()
        };

        loop {
            match self.do_request(req.clone(), retry_interval).await {
                Ok(_) => {
                    info!(
                        "published attributes of {} to cluster {:x}",
                        self.attributes.name,
                        self.cluster.id()
                    );
                    return;
                }
                Err(PalisadeError::Stopped) => {
                    info!("aborting publish: server stopped");
                    return;
                }
                Err(e) => warn!(error = %e, "publish failed, retrying"),
            }
        }
    }

    /// Retire old snapshot records on a fixed cadence.
    async fn purge_snapshots_loop(self: Arc<Self>) {
        let mut ticker = interval(PURGE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.storage.purge_snapshots(self.cfg.max_snapshots) {
                        Ok(0) => {}
                        Ok(purged) => info!(purged, "purged old snapshot records"),
                        Err(e) => error!(error = %e, "failed to purge snapshots"),
                    }
                }
                _ = shutdown.wait_for(|stopped| *stopped) => return,
            }
        }
    }
}

fn build_conf_change(
    change_type: ConfChangeType,
    node_id: u64,
    context: ConfChangeContext,
) -> PalisadeResult<ConfChange> {
    let mut cc = ConfChange::default();
    cc.set_change_type(change_type);
    cc.node_id = node_id;
    cc.context = bincode::serialize(&context)
        .map_err(|e| PalisadeError::serialization("serialize conf change context", e))?
        .into();
    Ok(cc)
}

fn nanos_to_expiration(nanos: i64) -> Option<DateTime<Utc>> {
    if nanos == 0 {
        None
    } else {
        Some(Utc.timestamp_nanos(nanos))
    }
}

fn ensure_private_dir(path: &Path) -> PalisadeResult<()> {
    std::fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o700);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}

/// The data directory is exclusively owned; prove we can actually write to
/// it before wiring anything else up.
fn probe_dir_writable(path: &Path) -> PalisadeResult<()> {
    let probe = path.join(".touch");
    std::fs::write(&probe, b"")?;
    std::fs::remove_file(&probe)?;
    Ok(())
}
