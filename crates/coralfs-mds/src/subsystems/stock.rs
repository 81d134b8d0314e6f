//! Stock in-memory subsystems
//!
//! These implement the subsystem seams with just enough behaviour to drive
//! the control plane end to end: they persist nothing, but they follow the
//! completion discipline exactly (every asynchronous operation completes
//! through the event channel) and they emit the peer traffic the lifecycle
//! handshakes expect. The daemon wires these by default.

use super::{
    Balancer, InodeTable, Locker, MdsCtx, MetaCache, Migrator, NodeLoad, ObjectStoreClient,
    ServerSubsystem, SessionTable, Subsystems, TableClient, TableServer,
};
use crate::event::{Completer, Signal};
use bytes::Bytes;
use coralfs_common::{Epoch, Incarnation, Inst, MdsConfig, NodeState, Rank, Stamp};
use coralfs_msg::{Envelope, Message, SessionOp, TableKind};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use tracing::{debug, info, trace, warn};

/// Build a full stock subsystem set plus session table.
#[must_use]
pub fn stock_subsystems(cfg: &MdsConfig) -> (Subsystems, Box<dyn SessionTable>) {
    let subsys = Subsystems {
        cache: Box::new(StockCache::new()),
        journal: Box::new(StockJournal::new(cfg.journal_max_segments)),
        balancer: Box::new(StockBalancer::new()),
        migrator: Box::new(StockMigrator::new()),
        locker: Box::new(StockLocker::new()),
        server: Box::new(StockServer::new()),
        inotable: Box::new(StockInodeTable::new()),
        anchor_client: Box::new(StockTableClient::new(TableKind::Anchor)),
        snap_client: Box::new(StockTableClient::new(TableKind::Snap)),
        anchor_server: Box::new(StockTableServer::new(TableKind::Anchor)),
        snap_server: Box::new(StockTableServer::new(TableKind::Snap)),
        osdc: Box::new(StockObjectStore::new()),
    };
    (subsys, Box::new(StockSessionTable::new()))
}

fn client_id(name: coralfs_common::EntityName) -> Option<u64> {
    match name {
        coralfs_common::EntityName::Client(c) => Some(c),
        _ => None,
    }
}

/// In-memory metadata cache: tracks the recovery handshakes and a rough
/// item count so trim and shutdown passes have something to drain.
pub struct StockCache {
    recovery_peers: BTreeSet<Rank>,
    resolves_pending: BTreeSet<Rank>,
    rejoins_pending: BTreeSet<Rank>,
    root_open: bool,
    stray_open: bool,
    draining: bool,
    shut: bool,
    cached_items: usize,
}

impl StockCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            recovery_peers: BTreeSet::new(),
            resolves_pending: BTreeSet::new(),
            rejoins_pending: BTreeSet::new(),
            root_open: false,
            stray_open: false,
            draining: false,
            shut: false,
            cached_items: 0,
        }
    }
}

impl Default for StockCache {
    fn default() -> Self {
        Self::new()
    }
}

impl StockCache {
    /// Peers we must recover against, as seeded at replay start.
    #[must_use]
    pub fn recovery_peers(&self) -> &BTreeSet<Rank> {
        &self.recovery_peers
    }
}

impl MetaCache for StockCache {
    fn dispatch(&mut self, ctx: &mut MdsCtx<'_>, env: Envelope) {
        match &env.msg {
            Message::Resolve { .. } => {
                if let Some(from) = env.from.mds_rank() {
                    ctx.send_message_mds(Message::ResolveAck { data: Bytes::new() }, from);
                }
            }
            Message::ResolveAck { .. } => {
                if let Some(from) = env.from.mds_rank() {
                    self.resolves_pending.remove(&from);
                }
                if self.resolves_pending.is_empty() && ctx.state == NodeState::Resolve {
                    ctx.signal(Signal::ResolveDone);
                }
            }
            Message::CacheRejoin { .. } => {
                if let Some(from) = env.from.mds_rank() {
                    if self.rejoins_pending.remove(&from) {
                        if self.rejoins_pending.is_empty() && ctx.state == NodeState::Rejoin {
                            ctx.signal(Signal::RejoinDone);
                        }
                    } else {
                        // peer's opening rejoin; answer it
                        ctx.send_message_mds(Message::CacheRejoin { data: Bytes::new() }, from);
                    }
                }
            }
            Message::CacheExpire { .. } => {
                self.cached_items = self.cached_items.saturating_sub(1);
            }
            Message::Discover { .. } => {
                self.cached_items += 1;
                if let Some(from) = env.from.mds_rank() {
                    ctx.send_message_mds(Message::DiscoverReply { data: Bytes::new() }, from);
                }
            }
            Message::DiscoverReply { .. } => {
                self.cached_items += 1;
            }
            other => trace!("cache: ignoring {}", other.type_name()),
        }
    }

    fn set_recovery_peers(&mut self, peers: BTreeSet<Rank>) {
        self.recovery_peers = peers;
    }

    fn send_resolve(&mut self, ctx: &mut MdsCtx<'_>, to: Rank) {
        self.resolves_pending.insert(to);
        ctx.send_message_mds(Message::Resolve { data: Bytes::new() }, to);
    }

    fn handle_mds_failure(&mut self, _ctx: &mut MdsCtx<'_>, who: Rank) {
        debug!("cache: dropping state for failed mds.{who}");
        self.resolves_pending.remove(&who);
        self.rejoins_pending.remove(&who);
    }

    fn handle_mds_recovery(&mut self, _ctx: &mut MdsCtx<'_>, who: Rank) {
        debug!("cache: mds.{who} recovered, resuming deferred work");
    }

    fn rejoin_send_rejoins(&mut self, ctx: &mut MdsCtx<'_>) {
        let mut targets = ctx.mdsmap.get_up_mds_set();
        if let Some(me) = ctx.whoami {
            targets.remove(&me);
        }
        if targets.is_empty() {
            ctx.signal(Signal::RejoinDone);
            return;
        }
        self.rejoins_pending = targets.clone();
        for p in targets {
            ctx.send_message_mds(Message::CacheRejoin { data: Bytes::new() }, p);
        }
    }

    fn reconnect_clean_open_file_lists(&mut self) {
        debug!("cache: cleaning reconnect-derived open file lists");
    }

    fn start_recovered_purges(&mut self) {
        debug!("cache: starting deferred purges");
    }

    fn recover_files(&mut self) {
        debug!("cache: queueing file recovery");
    }

    fn create_root(&mut self, done: Completer) {
        self.root_open = true;
        done.complete(Ok(()));
    }

    fn create_stray(&mut self, done: Completer) {
        self.stray_open = true;
        done.complete(Ok(()));
    }

    fn open_root(&mut self, done: Completer) {
        self.root_open = true;
        done.complete(Ok(()));
    }

    fn open_local_stray(&mut self) {
        self.stray_open = true;
    }

    fn trim(&mut self) {
        self.cached_items = self.cached_items.saturating_sub(1);
    }

    fn trim_client_leases(&mut self) {}

    fn shutdown_start(&mut self, _ctx: &mut MdsCtx<'_>) {
        info!("cache: shutdown started, {} items to drain", self.cached_items);
        self.draining = true;
    }

    fn shutdown_pass(&mut self, _ctx: &mut MdsCtx<'_>) -> bool {
        if !self.draining {
            return false;
        }
        self.cached_items = self.cached_items.saturating_sub(16);
        self.cached_items == 0
    }

    fn shutdown(&mut self) {
        if self.shut {
            return;
        }
        self.shut = true;
    }

    fn num_subtrees(&self) -> usize {
        usize::from(self.root_open) + usize::from(self.stray_open)
    }
}

/// In-memory journal: a segment counter with the real trim policy.
pub struct StockJournal {
    open: bool,
    replayed: bool,
    segments: usize,
    expired: u64,
    max_segments: usize,
}

impl StockJournal {
    #[must_use]
    pub fn new(max_segments: usize) -> Self {
        Self {
            open: false,
            replayed: false,
            segments: 0,
            expired: 0,
            max_segments,
        }
    }

    #[must_use]
    pub fn segments(&self) -> usize {
        self.segments
    }

    #[must_use]
    pub fn expired(&self) -> u64 {
        self.expired
    }

    #[must_use]
    pub fn is_replayed(&self) -> bool {
        self.replayed
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open
    }
}

impl super::Journal for StockJournal {
    fn open(&mut self, done: Completer) {
        self.open = true;
        self.segments = self.segments.max(1);
        done.complete(Ok(()));
    }

    fn create(&mut self, done: Completer) {
        self.open = true;
        self.segments = 0;
        done.complete(Ok(()));
    }

    fn append(&mut self) {
        debug!("journal: positioned at end for append");
    }

    fn replay(&mut self, done: Completer) {
        self.replayed = true;
        done.complete(Ok(()));
    }

    fn start_new_segment(&mut self, done: Option<Completer>) {
        self.segments += 1;
        if let Some(done) = done {
            done.complete(Ok(()));
        }
    }

    fn trim(&mut self) {
        while self.segments > self.max_segments {
            self.segments -= 1;
            self.expired += 1;
        }
    }
}

/// Load accounting plus the peer heartbeat exchange.
pub struct StockBalancer {
    local_events: u64,
    peer_loads: BTreeMap<Rank, u64>,
}

impl StockBalancer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            local_events: 0,
            peer_loads: BTreeMap::new(),
        }
    }
}

impl Default for StockBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl StockBalancer {
    /// Last load reported by a peer, if we heard one.
    #[must_use]
    pub fn peer_load(&self, who: Rank) -> Option<u64> {
        self.peer_loads.get(&who).copied()
    }
}

impl Balancer for StockBalancer {
    fn dispatch(&mut self, _ctx: &mut MdsCtx<'_>, env: Envelope) {
        if let Message::Heartbeat { load, .. } = env.msg {
            if let Some(from) = env.from.mds_rank() {
                self.peer_loads.insert(from, load);
            }
        }
    }

    fn tick(&mut self, ctx: &mut MdsCtx<'_>) {
        self.local_events += 1;
        let mut peers = ctx.mdsmap.get_mds_set(NodeState::Active);
        if let Some(me) = ctx.whoami {
            peers.remove(&me);
        }
        for p in peers {
            ctx.send_message_mds(
                Message::Heartbeat {
                    load: self.local_events,
                    data: Bytes::new(),
                },
                p,
            );
        }
    }

    fn load(&self, _now: Stamp) -> NodeLoad {
        NodeLoad {
            load: self.local_events as f64,
            request_rate: 0.0,
        }
    }
}

/// Export bookkeeping; real migration is a data-plane concern.
pub struct StockMigrator {
    pending_exports: BTreeMap<Rank, u64>,
    aborted: u64,
}

impl StockMigrator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending_exports: BTreeMap::new(),
            aborted: 0,
        }
    }
}

impl Default for StockMigrator {
    fn default() -> Self {
        Self::new()
    }
}

impl StockMigrator {
    #[must_use]
    pub fn aborted(&self) -> u64 {
        self.aborted
    }
}

impl Migrator for StockMigrator {
    fn dispatch(&mut self, _ctx: &mut MdsCtx<'_>, env: Envelope) {
        if let Some(from) = env.from.mds_rank() {
            *self.pending_exports.entry(from).or_default() += 1;
        }
    }

    fn handle_peer_stop(&mut self, _ctx: &mut MdsCtx<'_>, who: Rank) {
        if let Some(n) = self.pending_exports.remove(&who) {
            self.aborted += n;
            info!("migrator: aborted {n} exports toward stopped mds.{who}");
        }
    }
}

/// Lock traffic counter.
pub struct StockLocker {
    dispatched: u64,
    scatter_ticks: u64,
}

impl StockLocker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            dispatched: 0,
            scatter_ticks: 0,
        }
    }
}

impl Default for StockLocker {
    fn default() -> Self {
        Self::new()
    }
}

impl StockLocker {
    #[must_use]
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    #[must_use]
    pub fn scatter_ticks(&self) -> u64 {
        self.scatter_ticks
    }
}

impl Locker for StockLocker {
    fn dispatch(&mut self, _ctx: &mut MdsCtx<'_>, _env: Envelope) {
        self.dispatched += 1;
    }

    fn scatter_tick(&mut self, _ctx: &mut MdsCtx<'_>) {
        self.scatter_ticks += 1;
    }
}

struct ReconnectPhase {
    started: Stamp,
    pending: BTreeSet<u64>,
}

/// Session lifecycle plus the client reconnect phase.
pub struct StockServer {
    requests_handled: u64,
    reconnect: Option<ReconnectPhase>,
}

impl StockServer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            requests_handled: 0,
            reconnect: None,
        }
    }
}

impl Default for StockServer {
    fn default() -> Self {
        Self::new()
    }
}

impl StockServer {
    #[must_use]
    pub fn requests_handled(&self) -> u64 {
        self.requests_handled
    }
}

impl ServerSubsystem for StockServer {
    fn dispatch(&mut self, ctx: &mut MdsCtx<'_>, env: Envelope) {
        let now = ctx.clock.now();
        match &env.msg {
            Message::ClientSession { op } => {
                let Some(client) = client_id(env.from) else {
                    return;
                };
                match op {
                    SessionOp::Open => {
                        ctx.sessions().open_session(client, env.inst, now);
                        ctx.send_message_client(
                            Message::ClientSession {
                                op: SessionOp::Open,
                            },
                            client,
                        );
                    }
                    SessionOp::Close => {
                        if ctx.sessions().remove_session(client) {
                            ctx.send_to_inst(
                                Message::ClientSession {
                                    op: SessionOp::Close,
                                },
                                &env.inst,
                            );
                        }
                    }
                    SessionOp::Renew => ctx.sessions().touch(client, now),
                    SessionOp::RequestReconnect => {
                        warn!("client.{client} sent a server-only session op, ignoring");
                    }
                }
            }
            Message::ClientRequest { tid, .. } => {
                self.requests_handled += 1;
                if let Some(client) = client_id(env.from) {
                    ctx.sessions().touch(client, now);
                    trace!("request tid {tid} from client.{client}");
                }
            }
            Message::ClientReconnect { .. } => {
                let Some(client) = client_id(env.from) else {
                    return;
                };
                ctx.sessions().open_session(client, env.inst, now);
                if let Some(phase) = &mut self.reconnect {
                    phase.pending.remove(&client);
                    if phase.pending.is_empty() {
                        self.reconnect = None;
                        ctx.signal(Signal::ReconnectDone);
                    }
                }
            }
            Message::PeerRequest { .. } => {
                self.requests_handled += 1;
            }
            other => trace!("server: ignoring {}", other.type_name()),
        }
    }

    fn reconnect_clients(&mut self, ctx: &mut MdsCtx<'_>) {
        let clients = ctx.sessions().client_set();
        if clients.is_empty() {
            info!("reconnect: no sessions to reopen");
            ctx.signal(Signal::ReconnectDone);
            return;
        }
        info!("reconnect: asking {} clients to reattach", clients.len());
        let mut pending = BTreeSet::new();
        for (client, inst) in clients {
            pending.insert(client);
            ctx.send_to_inst(
                Message::ClientSession {
                    op: SessionOp::RequestReconnect,
                },
                &inst,
            );
        }
        self.reconnect = Some(ReconnectPhase {
            started: ctx.clock.now(),
            pending,
        });
    }

    fn reconnect_tick(&mut self, ctx: &mut MdsCtx<'_>) {
        let timeout = ctx.cfg.reconnect_timeout();
        let now = ctx.clock.now();
        if let Some(phase) = &self.reconnect {
            if now.saturating_since(phase.started) >= timeout {
                let abandoned: Vec<u64> = phase.pending.iter().copied().collect();
                warn!("reconnect: abandoning {} absent clients", abandoned.len());
                for client in abandoned {
                    ctx.sessions().remove_session(client);
                }
                self.reconnect = None;
                ctx.signal(Signal::ReconnectDone);
            }
        }
    }

    fn find_idle_sessions(&mut self, ctx: &mut MdsCtx<'_>) {
        let cutoff = ctx.cfg.session_idle_timeout();
        let now = ctx.clock.now();
        let clients = ctx.sessions().client_set();
        let mut stale: Vec<(u64, Inst)> = Vec::new();
        for (client, inst) in clients {
            let idle = ctx
                .sessions()
                .last_seen(client)
                .map(|seen| now.saturating_since(seen) >= cutoff)
                .unwrap_or(false);
            if idle {
                stale.push((client, inst));
            }
        }
        for (client, inst) in stale {
            info!("evicting idle client.{client}");
            ctx.sessions().remove_session(client);
            ctx.send_to_inst(
                Message::ClientSession {
                    op: SessionOp::Close,
                },
                &inst,
            );
        }
    }

    fn terminate_sessions(&mut self, ctx: &mut MdsCtx<'_>) {
        let clients = ctx.sessions().client_set();
        info!("terminating {} client sessions", clients.len());
        for (_, inst) in &clients {
            ctx.send_to_inst(
                Message::ClientSession {
                    op: SessionOp::Close,
                },
                inst,
            );
        }
        ctx.sessions().clear();
    }
}

struct Session {
    inst: Inst,
    push_seq: u64,
    last_seen: Stamp,
}

/// In-memory client session table.
pub struct StockSessionTable {
    sessions: BTreeMap<u64, Session>,
}

impl StockSessionTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: BTreeMap::new(),
        }
    }
}

impl Default for StockSessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable for StockSessionTable {
    fn load(&mut self, done: Completer) {
        done.complete(Ok(()));
    }

    fn save(&mut self, done: Completer) {
        done.complete(Ok(()));
    }

    fn count(&self) -> usize {
        self.sessions.len()
    }

    fn have_session(&self, client: u64) -> bool {
        self.sessions.contains_key(&client)
    }

    fn session_inst(&self, client: u64) -> Option<Inst> {
        self.sessions.get(&client).map(|s| s.inst)
    }

    fn inc_push_seq(&mut self, client: u64) -> u64 {
        match self.sessions.get_mut(&client) {
            Some(s) => {
                s.push_seq += 1;
                s.push_seq
            }
            None => 0,
        }
    }

    fn open_session(&mut self, client: u64, inst: Inst, now: Stamp) {
        let session = self.sessions.entry(client).or_insert(Session {
            inst,
            push_seq: 0,
            last_seen: now,
        });
        session.inst = inst;
        session.last_seen = now;
    }

    fn touch(&mut self, client: u64, now: Stamp) {
        if let Some(s) = self.sessions.get_mut(&client) {
            s.last_seen = now;
        }
    }

    fn last_seen(&self, client: u64) -> Option<Stamp> {
        self.sessions.get(&client).map(|s| s.last_seen)
    }

    fn remove_session(&mut self, client: u64) -> bool {
        self.sessions.remove(&client).is_some()
    }

    fn clear(&mut self) {
        self.sessions.clear();
    }

    fn client_set(&self) -> Vec<(u64, Inst)> {
        self.sessions.iter().map(|(c, s)| (*c, s.inst)).collect()
    }
}

/// In-memory inode allocator table.
pub struct StockInodeTable {
    loaded: bool,
    saves: u64,
}

impl StockInodeTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            loaded: false,
            saves: 0,
        }
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    #[must_use]
    pub fn saves(&self) -> u64 {
        self.saves
    }
}

impl Default for StockInodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable for StockInodeTable {
    fn load(&mut self, done: Completer) {
        self.loaded = true;
        done.complete(Ok(()));
    }

    fn reset(&mut self) {
        self.loaded = true;
    }

    fn save(&mut self, done: Completer) {
        self.saves += 1;
        done.complete(Ok(()));
    }
}

/// Table client: counts in-flight commits, resends them on recovery.
pub struct StockTableClient {
    table: TableKind,
    pending_commits: u64,
}

impl StockTableClient {
    #[must_use]
    pub fn new(table: TableKind) -> Self {
        Self {
            table,
            pending_commits: 0,
        }
    }
}

impl TableClient for StockTableClient {
    fn handle_request(&mut self, _ctx: &mut MdsCtx<'_>, env: Envelope) {
        if let Message::TableRequest { op, .. } = env.msg {
            debug_assert!(op < 0);
            self.pending_commits = self.pending_commits.saturating_sub(1);
        }
    }

    fn finish_recovery(&mut self, _ctx: &mut MdsCtx<'_>) {
        if self.pending_commits > 0 {
            info!(
                "{:?} table client resending {} in-flight commits",
                self.table, self.pending_commits
            );
        }
    }

    fn handle_mds_recovery(&mut self, _ctx: &mut MdsCtx<'_>, who: Rank) {
        debug!("{:?} table client noting recovery of mds.{who}", self.table);
    }
}

/// Table server: acknowledges requests with a negative reply op.
pub struct StockTableServer {
    table: TableKind,
    loaded: bool,
    entries: u64,
    osd_checks: u64,
}

impl StockTableServer {
    #[must_use]
    pub fn new(table: TableKind) -> Self {
        Self {
            table,
            loaded: false,
            entries: 0,
            osd_checks: 0,
        }
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    #[must_use]
    pub fn entries(&self) -> u64 {
        self.entries
    }

    #[must_use]
    pub fn osd_checks(&self) -> u64 {
        self.osd_checks
    }
}

impl TableServer for StockTableServer {
    fn load(&mut self, done: Completer) {
        self.loaded = true;
        done.complete(Ok(()));
    }

    fn reset(&mut self) {
        self.loaded = true;
        self.entries = 0;
    }

    fn save(&mut self, done: Completer) {
        done.complete(Ok(()));
    }

    fn handle_request(&mut self, ctx: &mut MdsCtx<'_>, env: Envelope) {
        if let Message::TableRequest { op, .. } = &env.msg {
            debug_assert!(*op >= 0);
            self.entries += 1;
            if let Some(from) = env.from.mds_rank() {
                ctx.send_message_mds(
                    Message::TableRequest {
                        table: self.table,
                        op: -1 - *op,
                        data: Bytes::new(),
                    },
                    from,
                );
            }
        }
    }

    fn finish_recovery(&mut self, _ctx: &mut MdsCtx<'_>) {
        info!("{:?} table server resending in-flight agreements", self.table);
    }

    fn handle_mds_recovery(&mut self, _ctx: &mut MdsCtx<'_>, who: Rank) {
        debug!("{:?} table server noting recovery of mds.{who}", self.table);
    }

    fn check_osd_map(&mut self, _ctx: &mut MdsCtx<'_>, force: bool) {
        if self.table == TableKind::Snap {
            self.osd_checks += 1;
            trace!("snap table checking object-store map (force={force})");
        }
    }
}

/// Object-store client state the core cares about: the incarnation it
/// publishes and the fence epoch it honours.
pub struct StockObjectStore {
    initialized: bool,
    shut: bool,
    inc: Option<Incarnation>,
    fence: Epoch,
    map_epoch: Epoch,
    replies: u64,
    remote_resets: u64,
}

impl StockObjectStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            initialized: false,
            shut: false,
            inc: None,
            fence: Epoch::default(),
            map_epoch: Epoch::default(),
            replies: 0,
            remote_resets: 0,
        }
    }
}

impl Default for StockObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StockObjectStore {
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[must_use]
    pub fn inc_fence(&self) -> Epoch {
        self.fence
    }

    #[must_use]
    pub fn replies(&self) -> u64 {
        self.replies
    }

    #[must_use]
    pub fn remote_resets(&self) -> u64 {
        self.remote_resets
    }

    #[must_use]
    pub fn is_shut(&self) -> bool {
        self.shut
    }
}

impl ObjectStoreClient for StockObjectStore {
    fn init(&mut self) {
        self.initialized = true;
    }

    fn shutdown(&mut self) {
        self.shut = true;
    }

    fn incarnation(&self) -> Option<Incarnation> {
        self.inc
    }

    fn set_incarnation(&mut self, inc: Incarnation) {
        info!("object-store client now incarnation {inc}");
        self.inc = Some(inc);
    }

    fn set_inc_fence(&mut self, epoch: Epoch) {
        self.fence = epoch;
    }

    fn osdmap_epoch(&self) -> Epoch {
        self.map_epoch
    }

    fn handle_op_reply(&mut self, _ctx: &mut MdsCtx<'_>, _env: Envelope) {
        self.replies += 1;
    }

    fn handle_map(&mut self, _ctx: &mut MdsCtx<'_>, env: Envelope) {
        if let Message::OsdMapUpdate { epoch, .. } = env.msg {
            if epoch > self.map_epoch {
                debug!("object-store map epoch {} -> {}", self.map_epoch, epoch);
                self.map_epoch = epoch;
            }
        }
    }

    fn handle_remote_reset(&mut self, addr: SocketAddr) {
        warn!("object-store session to {addr} reset by peer");
        self.remote_resets += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Completer, Event, OpToken};
    use crate::subsystems::Journal as _;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn completer() -> (Completer, UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Completer::new(OpToken(1), tx), rx)
    }

    fn assert_completed_ok(rx: &mut UnboundedReceiver<Event>) {
        match rx.try_recv().expect("no completion posted") {
            Event::Completed(_, Ok(())) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_journal_trim_bounds_segments() {
        let mut journal = StockJournal::new(2);
        let (c, mut rx) = completer();
        journal.open(c);
        assert_completed_ok(&mut rx);
        assert!(journal.is_open());

        for _ in 0..3 {
            journal.start_new_segment(None);
        }
        assert_eq!(journal.segments(), 4);
        journal.trim();
        assert_eq!(journal.segments(), 2);
        assert_eq!(journal.expired(), 2);
    }

    #[test]
    fn test_journal_replay_completes_async() {
        let mut journal = StockJournal::new(8);
        let (c, mut rx) = completer();
        journal.replay(c);
        assert!(journal.is_replayed());
        assert_completed_ok(&mut rx);
    }

    #[test]
    fn test_session_table_push_seq() {
        let mut sessions = StockSessionTable::new();
        let inst = Inst::new("127.0.0.1:7101".parse().unwrap(), 1);
        assert_eq!(sessions.inc_push_seq(1), 0);

        sessions.open_session(1, inst, Stamp::zero());
        assert!(sessions.have_session(1));
        assert_eq!(sessions.inc_push_seq(1), 1);
        assert_eq!(sessions.inc_push_seq(1), 2);
        assert_eq!(sessions.session_inst(1), Some(inst));

        assert!(sessions.remove_session(1));
        assert!(!sessions.remove_session(1));
        assert_eq!(sessions.count(), 0);
    }

    #[test]
    fn test_session_table_touch_updates_last_seen() {
        let mut sessions = StockSessionTable::new();
        let inst = Inst::new("127.0.0.1:7101".parse().unwrap(), 1);
        sessions.open_session(1, inst, Stamp::zero());
        let later = Stamp::zero() + std::time::Duration::from_secs(9);
        sessions.touch(1, later);
        assert_eq!(sessions.last_seen(1), Some(later));
    }

    #[test]
    fn test_cache_create_completes_async() {
        let mut cache = StockCache::new();
        let (c, mut rx) = completer();
        cache.create_root(c);
        assert_completed_ok(&mut rx);
        cache.open_local_stray();
        assert_eq!(cache.num_subtrees(), 2);
    }

    #[test]
    fn test_object_store_bookkeeping() {
        let mut osdc = StockObjectStore::new();
        osdc.init();
        assert!(osdc.is_initialized());
        assert_eq!(osdc.incarnation(), None);
        osdc.set_incarnation(Incarnation::new(3));
        assert_eq!(osdc.incarnation(), Some(Incarnation::new(3)));
        osdc.set_inc_fence(Epoch::new(11));
        assert_eq!(osdc.inc_fence(), Epoch::new(11));
        osdc.shutdown();
        assert!(osdc.is_shut());
    }

    #[test]
    fn test_inode_table_reset_counts_as_loaded() {
        let mut table = StockInodeTable::new();
        assert!(!table.is_loaded());
        table.reset();
        assert!(table.is_loaded());
        let (c, mut rx) = completer();
        table.save(c);
        assert_completed_ok(&mut rx);
        assert_eq!(table.saves(), 1);
    }
}
