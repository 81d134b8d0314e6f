//! The metadata server node
//!
//! Owns identity, lifecycle state, the beacon ledger, the wait queues, and
//! every subsystem. All state changes happen on the event loop; the node
//! never self-transitions its live state, it asks the monitor via a beacon
//! and reacts to the cluster map that comes back.

use crate::event::{Completer, Event, EventSender, OpToken, Signal, TimerKind};
use crate::metrics::NodeMetrics;
use crate::subsystems::{
    Balancer, Journal, Locker, MdsCtx, MetaCache, ObjectStoreClient, ServerSubsystem,
    SessionTable, Subsystems, TableClient, TableServer,
};
use crate::timer::{TimerDriver, TimerSet};
use crate::waitq::{Continuation, Gather, GatherId, PendingOp, WaitQueue};
use bytes::Bytes;
use coralfs_common::{
    Clock, EntityName, Epoch, Error, Inst, MdsConfig, NodeState, Rank,
};
use coralfs_map::{MdsMap, MonMap};
use coralfs_msg::{Envelope, Message, Transport};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, trace, warn};

/// Beacon protocol state: the ledger of unacknowledged sequences plus the
/// liveness bookkeeping derived from it.
#[derive(Default)]
pub(crate) struct BeaconState {
    pub last_seq: coralfs_common::BeaconSeq,
    /// send stamp of every unacknowledged beacon, by sequence
    pub ledger: BTreeMap<coralfs_common::BeaconSeq, coralfs_common::Stamp>,
    pub last_acked: coralfs_common::Stamp,
    /// `last_acked` captured when the killer was armed; the killer only
    /// acts if no ack has arrived since
    pub killer_lab: coralfs_common::Stamp,
}

/// Everything a node needs at construction. Subsystem handles are never
/// rebound afterwards.
pub struct NodeDeps {
    pub cfg: MdsConfig,
    pub clock: Arc<dyn Clock>,
    pub monmap: MonMap,
    pub transport: Arc<dyn Transport>,
    pub subsys: Subsystems,
    pub sessions: Box<dyn SessionTable>,
    pub driver: Box<dyn TimerDriver>,
    pub metrics: Arc<NodeMetrics>,
    /// Rank this daemon would like; `None` to offer itself as standby
    pub want_rank: Option<Rank>,
}

/// One metadata server node.
pub struct MdsNode {
    pub(crate) cfg: MdsConfig,
    pub(crate) clock: Arc<dyn Clock>,
    tx: EventSender,
    pub(crate) timers: TimerSet,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) monmap: MonMap,
    pub(crate) mdsmap: MdsMap,

    pub(crate) whoami: Option<Rank>,
    pub(crate) want_rank: Option<Rank>,
    pub(crate) state: NodeState,
    pub(crate) want_state: NodeState,
    pub(crate) my_name: EntityName,
    pub(crate) my_inst: Inst,

    pub(crate) beacon: BeaconState,
    pub(crate) laggy: bool,
    pub(crate) peer_epochs: BTreeMap<Rank, Epoch>,
    pub(crate) last_client_map_bcast: Epoch,

    waiting_for_active: WaitQueue,
    pub(crate) waiting_for_nolaggy: WaitQueue,
    waiting_for_active_peer: BTreeMap<Rank, WaitQueue>,
    finished: Vec<Continuation>,

    pending: HashMap<OpToken, PendingOp>,
    gathers: HashMap<GatherId, Gather>,
    next_token: u64,

    pub(crate) subsys: Subsystems,
    pub(crate) sessions: Box<dyn SessionTable>,
    pub(crate) metrics: Arc<NodeMetrics>,
    dead: bool,
}

impl MdsNode {
    pub fn new(deps: NodeDeps, tx: EventSender) -> Self {
        let my_inst = deps.transport.local_inst();
        Self {
            cfg: deps.cfg,
            clock: deps.clock,
            tx,
            timers: TimerSet::new(deps.driver),
            transport: deps.transport,
            monmap: deps.monmap,
            mdsmap: MdsMap::default(),
            whoami: None,
            want_rank: deps.want_rank,
            state: NodeState::Dne,
            want_state: NodeState::Dne,
            my_name: EntityName::Mds(None),
            my_inst,
            beacon: BeaconState::default(),
            laggy: false,
            peer_epochs: BTreeMap::new(),
            last_client_map_bcast: Epoch::default(),
            waiting_for_active: WaitQueue::default(),
            waiting_for_nolaggy: WaitQueue::default(),
            waiting_for_active_peer: BTreeMap::new(),
            finished: Vec::new(),
            pending: HashMap::new(),
            gathers: HashMap::new(),
            next_token: 0,
            subsys: deps.subsys,
            sessions: deps.sessions,
            metrics: deps.metrics,
            dead: false,
        }
    }

    /// Start beaconing for a placement and schedule the first tick. The
    /// monitor answers with a cluster map that tells us who we are.
    pub fn init(&mut self) {
        info!("init: requesting boot placement, want_rank={:?}", self.want_rank);
        self.want_state = NodeState::Boot;
        self.whoami = None;
        self.my_name = EntityName::Mds(None);
        self.transport.reset_local_name(self.my_name);
        self.subsys.osdc.init();
        self.beacon_start();
        self.reset_tick();
    }

    /// Consume events until suicide.
    pub async fn run(mut self, mut rx: UnboundedReceiver<Event>) {
        while let Some(ev) = rx.recv().await {
            self.handle_event(ev);
            if self.dead {
                break;
            }
        }
        info!("event loop exited");
    }

    /// Process one event. Events are handled to completion in arrival
    /// order; nothing here suspends.
    pub fn handle_event(&mut self, ev: Event) {
        if self.dead {
            trace!("dead, ignoring event");
            return;
        }
        match ev {
            Event::Inbound(env) => self.dispatch(*env),
            Event::Timer(fire) => {
                if !self.timers.is_current(&fire) {
                    trace!("stale {:?} fire, ignoring", fire.kind);
                    return;
                }
                match fire.kind {
                    TimerKind::Tick => self.tick(),
                    TimerKind::BeaconSender => self.beacon_send(),
                    TimerKind::BeaconKiller => self.beacon_kill(),
                }
            }
            Event::Completed(token, r) => self.on_completed(token, r),
            Event::Signal(s) => self.on_signal(s),
            Event::TransportFailure { peer } => {
                warn!("delivery failure to {peer}");
            }
            Event::TransportReset { addr } => {
                debug!("connection to {addr} reset");
            }
            Event::TransportRemoteReset { addr } => {
                debug!("connection to {addr} reset by remote");
                self.subsys.osdc.handle_remote_reset(addr);
            }
            Event::Shutdown => {
                info!("shutdown requested");
                self.suicide();
            }
        }
    }

    // ----- completions and gathers -----

    /// Register a continuation and get the completer that resumes it.
    pub(crate) fn completer(&mut self, c: Continuation) -> Completer {
        self.next_token += 1;
        let token = OpToken(self.next_token);
        self.pending.insert(token, PendingOp::Single(c));
        Completer::new(token, self.tx.clone())
    }

    /// Open an all-complete barrier; fire `then` once every sub completes.
    pub(crate) fn new_gather(&mut self, then: Continuation) -> GatherId {
        self.next_token += 1;
        let id = GatherId(self.next_token);
        self.gathers.insert(id, Gather::new(then));
        id
    }

    /// Register one sub-operation under a gather.
    pub(crate) fn gather_sub(&mut self, id: GatherId) -> Completer {
        self.next_token += 1;
        let token = OpToken(self.next_token);
        self.pending.insert(token, PendingOp::GatherSub(id));
        if let Some(g) = self.gathers.get_mut(&id) {
            g.remaining += 1;
        }
        Completer::new(token, self.tx.clone())
    }

    /// Finish registering subs; fires immediately if there were none.
    pub(crate) fn arm_gather(&mut self, id: GatherId) {
        let fire_now = match self.gathers.get_mut(&id) {
            Some(g) => {
                g.armed = true;
                g.remaining == 0
            }
            None => false,
        };
        if fire_now {
            self.fire_gather(id);
        }
    }

    fn fire_gather(&mut self, id: GatherId) {
        if let Some(mut g) = self.gathers.remove(&id) {
            if let Some(then) = g.then.take() {
                let result = match g.first_err.take() {
                    Some(e) => Err(e),
                    None => Ok(()),
                };
                then(self, result);
            }
        }
    }

    fn on_completed(&mut self, token: OpToken, r: Result<(), Error>) {
        let Some(op) = self.pending.remove(&token) else {
            trace!("completion for unknown token {token:?}");
            return;
        };
        match op {
            PendingOp::Single(c) => c(self, r),
            PendingOp::GatherSub(id) => {
                let fire = match self.gathers.get_mut(&id) {
                    Some(g) => {
                        g.remaining -= 1;
                        if let Err(e) = r {
                            if g.first_err.is_none() {
                                g.first_err = Some(e);
                            }
                        }
                        g.armed && g.remaining == 0
                    }
                    None => false,
                };
                if fire {
                    self.fire_gather(id);
                }
            }
        }
    }

    fn on_signal(&mut self, s: Signal) {
        match s {
            Signal::ResolveDone => {
                if self.state == NodeState::Resolve {
                    self.resolve_done();
                }
            }
            Signal::ReconnectDone => {
                if self.state == NodeState::Reconnect {
                    self.reconnect_done();
                }
            }
            Signal::RejoinDone => {
                if self.state == NodeState::Rejoin {
                    self.rejoin_done();
                }
            }
        }
    }

    // ----- subsystem context -----

    /// Split the node into its subsystem set and the context subsystems
    /// call back through. The two borrow disjoint fields.
    pub(crate) fn split(&mut self) -> (&mut Subsystems, MdsCtx<'_>) {
        let MdsNode {
            subsys,
            sessions,
            transport,
            mdsmap,
            monmap,
            peer_epochs,
            clock,
            metrics,
            cfg,
            tx,
            whoami,
            state,
            my_name,
            my_inst,
            ..
        } = self;
        let ctx = MdsCtx {
            whoami: *whoami,
            state: *state,
            my_name: *my_name,
            my_inst: *my_inst,
            fsid: monmap.fsid,
            clock: &**clock,
            mdsmap,
            monmap,
            cfg,
            metrics: &**metrics,
            transport: &**transport,
            peer_epochs,
            sessions: sessions.as_mut(),
            tx,
        };
        (subsys, ctx)
    }

    // ----- send paths -----

    pub(crate) fn send_mon(&mut self, msg: Message, mon: usize) {
        let inst = self.monmap.get_inst(mon);
        self.transport
            .send(Envelope::new(self.my_name, self.my_inst, msg), &inst);
    }

    /// Send to a peer rank, shipping the current map first if the peer is
    /// behind.
    pub fn send_message_mds(&mut self, msg: Message, to: Rank) {
        let (_, mut ctx) = self.split();
        ctx.send_message_mds(msg, to);
    }

    /// Hand a held message to another rank (see the forwarding rules on
    /// [`MdsCtx::forward_message_mds`]).
    pub fn forward_message_mds(&mut self, env: Envelope, to: Rank) {
        let (_, mut ctx) = self.split();
        ctx.forward_message_mds(env, to);
    }

    /// Send to a client through its session.
    pub fn send_message_client(&mut self, msg: Message, client: u64) {
        let (_, mut ctx) = self.split();
        ctx.send_message_client(msg, client);
    }

    /// Share the current cluster map with every connected client.
    pub(crate) fn bcast_map_to_clients(&mut self) {
        let epoch = self.mdsmap.epoch();
        debug!("bcast_map_to_clients epoch {epoch}");
        let data = Bytes::from(self.mdsmap.encode());
        let fsid = self.monmap.fsid;
        for (_, inst) in self.sessions.client_set() {
            self.transport.send(
                Envelope::new(
                    self.my_name,
                    self.my_inst,
                    Message::MdsMap {
                        fsid,
                        epoch,
                        data: data.clone(),
                    },
                ),
                &inst,
            );
        }
        self.last_client_map_bcast = epoch;
    }

    // ----- state machine -----

    /// Ask the monitor to move us to a state. The transition becomes real
    /// only when a cluster map confirming it is applied.
    pub(crate) fn request_state(&mut self, s: NodeState) {
        info!("request_state {s}");
        self.want_state = s;
        self.beacon_send();
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state == NodeState::Active
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.state == NodeState::Stopping
    }

    pub(crate) fn is_replay(&self) -> bool {
        self.state == NodeState::Replay
    }

    pub(crate) fn is_starting(&self) -> bool {
        self.state == NodeState::Starting
    }

    fn is_reconnect(&self) -> bool {
        self.state == NodeState::Reconnect
    }

    pub(crate) fn replay_start(&mut self) {
        let mut peers = self.mdsmap.get_recovery_mds_set();
        if let Some(me) = self.whoami {
            peers.remove(&me);
        }
        info!("replay_start, recovery peers {peers:?}");
        self.subsys.cache.set_recovery_peers(peers);
        self.boot_start(crate::boot::BootStep::Open, Ok(()));
    }

    pub(crate) fn replay_done(&mut self) {
        let in_mds = self.mdsmap.num_in_mds();
        let failed = self.mdsmap.num_mds(NodeState::Failed);
        info!("replay_done in={in_mds} failed={failed}");

        if in_mds == 1 && failed == 0 {
            info!("i am alone, moving to reconnect");
            self.request_state(NodeState::Reconnect);
        } else {
            info!("i am not alone, moving to resolve");
            self.request_state(NodeState::Resolve);
        }
        self.subsys.journal.start_new_segment(None);
    }

    pub(crate) fn resolve_start(&mut self) {
        info!("resolve_start");
        let mut who = self.mdsmap.get_mds_set(NodeState::Resolve);
        who.extend(self.mdsmap.get_mds_set(NodeState::Rejoin));
        who.extend(self.mdsmap.get_mds_set(NodeState::Active));
        who.extend(self.mdsmap.get_mds_set(NodeState::Stopping));
        let me = self.whoami;
        let (subsys, mut ctx) = self.split();
        for p in who {
            if Some(p) == me {
                continue;
            }
            subsys.cache.send_resolve(&mut ctx, p);
        }
    }

    pub(crate) fn resolve_done(&mut self) {
        info!("resolve_done");
        self.request_state(NodeState::Reconnect);
    }

    pub(crate) fn reconnect_start(&mut self) {
        info!("reconnect_start");
        let (subsys, mut ctx) = self.split();
        subsys.server.reconnect_clients(&mut ctx);
    }

    pub(crate) fn reconnect_done(&mut self) {
        info!("reconnect_done");
        self.request_state(NodeState::Rejoin);
        self.subsys.cache.reconnect_clean_open_file_lists();
    }

    pub(crate) fn rejoin_joint_start(&mut self) {
        info!("rejoin_joint_start");
        let (subsys, mut ctx) = self.split();
        subsys.cache.rejoin_send_rejoins(&mut ctx);
    }

    pub(crate) fn rejoin_done(&mut self) {
        info!("rejoin_done");
        self.request_state(NodeState::Active);
    }

    /// We just finished our own recovery: ask the table tier and clients to
    /// resend what was in flight, restart deferred purges, and let waiters
    /// go.
    pub(crate) fn recovery_done(&mut self) {
        info!("recovery_done -- successful recovery!");
        debug_assert!(self.is_active());
        {
            let (subsys, mut ctx) = self.split();
            if ctx.whoami == Some(ctx.mdsmap.get_tableserver()) {
                subsys.anchor_server.finish_recovery(&mut ctx);
                subsys.snap_server.finish_recovery(&mut ctx);
            }
            subsys.anchor_client.finish_recovery(&mut ctx);
            subsys.snap_client.finish_recovery(&mut ctx);
            subsys.cache.start_recovered_purges();
            subsys.cache.recover_files();
        }
        self.bcast_map_to_clients();
        let waiters = self.waiting_for_active.take();
        self.queue_waiters(waiters);
    }

    /// A peer came back. Tell every interested subsystem exactly once and
    /// release whatever was parked on that peer.
    pub(crate) fn handle_mds_recovery(&mut self, who: Rank) {
        info!("handle_mds_recovery mds.{who}");
        {
            let (subsys, mut ctx) = self.split();
            subsys.cache.handle_mds_recovery(&mut ctx, who);
            if ctx.whoami == Some(ctx.mdsmap.get_tableserver()) {
                subsys.anchor_server.handle_mds_recovery(&mut ctx, who);
                subsys.snap_server.handle_mds_recovery(&mut ctx, who);
            }
            subsys.anchor_client.handle_mds_recovery(&mut ctx, who);
            subsys.snap_client.handle_mds_recovery(&mut ctx, who);
        }
        if let Some(q) = self.waiting_for_active_peer.remove(&who) {
            self.queue_waiters(q.into_items());
        }
    }

    pub(crate) fn stopping_start(&mut self) {
        info!("stopping_start");
        let (subsys, mut ctx) = self.split();
        subsys.cache.shutdown_start(&mut ctx);
        subsys.server.terminate_sessions(&mut ctx);
    }

    pub(crate) fn stopping_done(&mut self) {
        info!("stopping_done");
        self.request_state(NodeState::Stopped);
    }

    // ----- wait queues -----

    /// Park work until this node reaches active.
    pub fn wait_for_active(&mut self, c: Continuation) {
        self.waiting_for_active.push(c);
    }

    /// Park work until a specific peer reaches active.
    pub fn wait_for_active_peer(&mut self, who: Rank, c: Continuation) {
        self.waiting_for_active_peer.entry(who).or_default().push(c);
    }

    /// Defer continuations to the post-dispatch drain.
    pub(crate) fn queue_waiters(&mut self, waiters: Vec<Continuation>) {
        self.finished.extend(waiters);
    }

    /// Drain the waiting-for-active queue for immediate execution.
    pub(crate) fn take_waiting_for_active(&mut self) -> Vec<Continuation> {
        self.waiting_for_active.take()
    }

    #[cfg(test)]
    pub(crate) fn has_waiters_for_peer(&self, who: Rank) -> bool {
        self.waiting_for_active_peer.contains_key(&who)
    }

    /// Run everything deferred during this dispatch.
    pub(crate) fn run_finished(&mut self) {
        if self.finished.is_empty() {
            return;
        }
        let ls = std::mem::take(&mut self.finished);
        debug!("{} queued continuations", ls.len());
        for c in ls {
            if self.dead {
                return;
            }
            c(self, Ok(()));
        }
    }

    // ----- tick -----

    pub(crate) fn reset_tick(&mut self) {
        let interval = self.cfg.tick_interval();
        self.timers.arm_after(TimerKind::Tick, interval);
    }

    fn tick(&mut self) {
        self.reset_tick();

        if self.laggy {
            return;
        }

        // telemetry
        let now = self.clock.now();
        let load = self.subsys.balancer.load(now);
        self.metrics.set_load(load.load);
        self.metrics.set_subtrees(self.subsys.cache.num_subtrees());
        self.metrics.set_sessions(self.sessions.count());

        if self.is_active() || self.is_stopping() {
            let (subsys, mut ctx) = self.split();
            subsys.locker.scatter_tick(&mut ctx);
            subsys.server.find_idle_sessions(&mut ctx);
        }

        if self.is_reconnect() {
            let (subsys, mut ctx) = self.split();
            subsys.server.reconnect_tick(&mut ctx);
        }

        if self.is_active() {
            let (subsys, mut ctx) = self.split();
            subsys.balancer.tick(&mut ctx);
            subsys.snap_server.check_osd_map(&mut ctx, false);
        }
    }

    // ----- shutdown -----

    /// Terminal teardown: cancel every timer, then shut down the cache,
    /// the object-store client, and the transport, in that order. Safe to
    /// call more than once and from within any handler.
    pub fn suicide(&mut self) {
        if self.dead {
            debug!("suicide: already dead");
            return;
        }
        info!("suicide");
        self.dead = true;

        self.timers.cancel(TimerKind::BeaconKiller);
        self.timers.cancel(TimerKind::BeaconSender);
        self.timers.cancel(TimerKind::Tick);
        self.timers.cancel_all();

        self.subsys.cache.shutdown();
        self.subsys.osdc.shutdown();
        self.transport.shutdown();
    }

    // ----- observers -----

    #[must_use]
    pub fn state(&self) -> NodeState {
        self.state
    }

    #[must_use]
    pub fn want_state(&self) -> NodeState {
        self.want_state
    }

    #[must_use]
    pub fn whoami(&self) -> Option<Rank> {
        self.whoami
    }

    #[must_use]
    pub fn is_laggy(&self) -> bool {
        self.laggy
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    #[must_use]
    pub fn map_epoch(&self) -> Epoch {
        self.mdsmap.epoch()
    }

    /// Epoch of the last map shared with connected clients.
    #[must_use]
    pub fn last_client_map_bcast(&self) -> Epoch {
        self.last_client_map_bcast
    }

    #[must_use]
    pub fn config(&self) -> &MdsConfig {
        &self.cfg
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<NodeMetrics> {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use crate::event::TimerKind;
    use crate::testing::Harness;
    use coralfs_common::NodeState;
    use coralfs_msg::Message;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_suicide_is_idempotent() {
        let mut h = Harness::new();
        h.node.init();
        h.node.suicide();
        h.node.suicide();
        assert!(h.node.is_dead());
        assert_eq!(h.call_count("cache.shutdown"), 1);
        assert_eq!(h.call_count("osdc.shutdown"), 1);
        assert!(h.transport.is_down());
        // a dead node ignores everything
        h.deliver(h.mon_env(Message::MonCommand {
            cmd: "beacon_grace_ms=1".into(),
        }));
        assert_ne!(h.node.config().beacon_grace_ms, 1);
    }

    #[test]
    fn test_init_adopts_unplaced_name_and_boots() {
        let mut h = Harness::new();
        h.node.init();
        assert_eq!(h.node.want_state(), NodeState::Boot);
        assert_eq!(h.node.whoami(), None);
        assert!(h.calls_contain("osdc.init"));
        assert_eq!(h.sent_beacons().len(), 1);
        assert!(!h.armed_fires(TimerKind::Tick).is_empty());
        assert!(!h.armed_fires(TimerKind::BeaconKiller).is_empty());
    }

    #[test]
    fn test_active_tick_drives_subsystems() {
        let mut h = Harness::new();
        h.node.init();
        h.apply_map(&h.map_builder(1, &[(0, NodeState::Active)]));
        h.fire_timer(TimerKind::Tick);
        assert!(h.calls_contain("locker.scatter_tick"));
        assert!(h.calls_contain("server.find_idle_sessions"));
        assert!(h.calls_contain("balancer.tick"));
        assert!(h.calls_contain("snap_server.check_osd_map"));
        assert!(!h.calls_contain("server.reconnect_tick"));
    }

    #[test]
    fn test_reconnect_tick_drives_server() {
        let mut h = Harness::new();
        h.node.init();
        h.apply_map(&h.map_builder(1, &[(0, NodeState::Reconnect)]));
        h.fire_timer(TimerKind::Tick);
        assert!(h.calls_contain("server.reconnect_tick"));
        assert!(!h.calls_contain("balancer.tick"));
    }

    #[test]
    fn test_wait_for_active_released_on_activation() {
        let mut h = Harness::new();
        h.node.init();
        let hit = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&hit);
        h.node.wait_for_active(Box::new(move |_, _| {
            flag.store(true, Ordering::SeqCst);
        }));
        h.apply_map(&h.map_builder(1, &[(0, NodeState::Active)]));
        assert!(hit.load(Ordering::SeqCst));
    }

    #[test]
    fn test_send_message_client_requires_session() {
        let mut h = Harness::new();
        h.node.init();
        h.transport.clear();
        h.node.send_message_client(
            Message::ClientSession {
                op: coralfs_msg::SessionOp::Close,
            },
            9,
        );
        assert!(h.transport.sent_messages().is_empty());

        let inst = h.open_session(9);
        h.node.send_message_client(
            Message::ClientSession {
                op: coralfs_msg::SessionOp::Close,
            },
            9,
        );
        let sent = h.transport.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, inst);
    }

    #[test]
    fn test_signals_respect_current_state() {
        let mut h = Harness::new();
        h.node.init();
        // a stray resolve-done while not resolving must not move us
        h.node
            .handle_event(crate::event::Event::Signal(crate::event::Signal::ResolveDone));
        assert_eq!(h.node.want_state(), NodeState::Boot);
    }

    #[test]
    fn test_resolve_signal_advances_to_reconnect() {
        let mut h = Harness::new();
        h.node.init();
        h.apply_map(&h.map_builder(
            1,
            &[(0, NodeState::Resolve), (1, NodeState::Active)],
        ));
        assert!(h.calls_contain("cache.send_resolve:1"));
        h.node
            .handle_event(crate::event::Event::Signal(crate::event::Signal::ResolveDone));
        assert_eq!(h.node.want_state(), NodeState::Reconnect);
    }

    #[test]
    fn test_remote_reset_reaches_object_store_client() {
        let mut h = Harness::new();
        h.node.init();
        h.node.handle_event(crate::event::Event::TransportRemoteReset {
            addr: "127.0.0.1:7300".parse().unwrap(),
        });
        assert!(h.calls_contain("osdc.remote_reset"));
    }
}
