//! Test harness: manual clock, recording timer driver, recording
//! transport, and mock subsystems whose asynchronous operations complete
//! only when the test says so. Built for driving the node synchronously
//! through arbitrary event interleavings.

use crate::event::{Completer, Event, TimerFire, TimerKind};
use crate::metrics::NodeMetrics;
use crate::node::{MdsNode, NodeDeps};
use crate::subsystems::{
    Balancer, InodeTable, Locker, MdsCtx, MetaCache, Migrator, NodeLoad, ObjectStoreClient,
    ServerSubsystem, SessionTable, Subsystems, TableClient, TableServer,
};
use crate::timer::TimerDriver;
use bytes::Bytes;
use coralfs_common::{
    BeaconSeq, Clock, EntityName, Epoch, Error, Incarnation, Inst, MdsConfig, NodeState, Rank,
    Stamp,
};
use coralfs_map::{MdsMap, MonMap};
use coralfs_msg::{ClientOp, Envelope, Message, Transport};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use uuid::Uuid;

pub(crate) type Calls = Arc<Mutex<Vec<String>>>;
pub(crate) type Pends = Arc<Mutex<Vec<(String, Completer)>>>;

// ----- clock -----

pub(crate) struct ManualClock {
    now: Mutex<Stamp>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Stamp::zero()),
        }
    }

    pub fn advance(&self, d: Duration) {
        let mut now = self.now.lock();
        *now = *now + d;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Stamp {
        *self.now.lock()
    }
}

// ----- timer driver -----

pub(crate) struct ManualDriver {
    armed: Arc<Mutex<Vec<TimerFire>>>,
}

impl TimerDriver for ManualDriver {
    fn arm(&mut self, fire: TimerFire, _delay: Duration) {
        self.armed.lock().push(fire);
    }
    fn cancel(&mut self, _kind: TimerKind) {}
    fn cancel_all(&mut self) {}
}

// ----- transport -----

pub(crate) struct RecordingTransport {
    local: Inst,
    sent: Mutex<Vec<(Envelope, Inst)>>,
    forwarded: Mutex<Vec<(Envelope, Inst)>>,
    name: Mutex<EntityName>,
    down: AtomicBool,
}

impl RecordingTransport {
    pub fn new(local: Inst) -> Self {
        Self {
            local,
            sent: Mutex::new(Vec::new()),
            forwarded: Mutex::new(Vec::new()),
            name: Mutex::new(EntityName::Mds(None)),
            down: AtomicBool::new(false),
        }
    }

    pub fn sent_messages(&self) -> Vec<(Envelope, Inst)> {
        self.sent.lock().clone()
    }

    pub fn forwarded_messages(&self) -> Vec<(Envelope, Inst)> {
        self.forwarded.lock().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
        self.forwarded.lock().clear();
    }

    pub fn local_inst_raw(&self) -> Inst {
        self.local
    }

    pub fn local_name(&self) -> EntityName {
        *self.name.lock()
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }
}

impl Transport for RecordingTransport {
    fn send(&self, env: Envelope, to: &Inst) {
        self.sent.lock().push((env, *to));
    }

    fn forward(&self, env: Envelope, to: &Inst) {
        self.forwarded.lock().push((env, *to));
    }

    fn reset_local_name(&self, name: EntityName) {
        *self.name.lock() = name;
    }

    fn local_inst(&self) -> Inst {
        self.local
    }

    fn shutdown(&self) {
        self.down.store(true, Ordering::SeqCst);
    }
}

// ----- mock subsystems -----

fn log(calls: &Calls, entry: impl Into<String>) {
    calls.lock().push(entry.into());
}

pub(crate) struct MockCache {
    calls: Calls,
    pends: Pends,
    shutdown_ready: Arc<AtomicBool>,
}

impl MetaCache for MockCache {
    fn dispatch(&mut self, _ctx: &mut MdsCtx<'_>, env: Envelope) {
        log(&self.calls, format!("cache.dispatch:{}", env.msg.type_name()));
    }
    fn set_recovery_peers(&mut self, peers: BTreeSet<Rank>) {
        log(&self.calls, format!("cache.set_recovery_peers:{}", peers.len()));
    }
    fn send_resolve(&mut self, ctx: &mut MdsCtx<'_>, to: Rank) {
        log(&self.calls, format!("cache.send_resolve:{to}"));
        ctx.send_message_mds(Message::Resolve { data: Bytes::new() }, to);
    }
    fn handle_mds_failure(&mut self, _ctx: &mut MdsCtx<'_>, who: Rank) {
        log(&self.calls, format!("cache.handle_mds_failure:{who}"));
    }
    fn handle_mds_recovery(&mut self, _ctx: &mut MdsCtx<'_>, who: Rank) {
        log(&self.calls, format!("cache.handle_mds_recovery:{who}"));
    }
    fn rejoin_send_rejoins(&mut self, _ctx: &mut MdsCtx<'_>) {
        log(&self.calls, "cache.rejoin_send_rejoins");
    }
    fn reconnect_clean_open_file_lists(&mut self) {
        log(&self.calls, "cache.reconnect_clean");
    }
    fn start_recovered_purges(&mut self) {
        log(&self.calls, "cache.start_recovered_purges");
    }
    fn recover_files(&mut self) {
        log(&self.calls, "cache.recover_files");
    }
    fn create_root(&mut self, done: Completer) {
        self.pends.lock().push(("cache.create_root".into(), done));
    }
    fn create_stray(&mut self, done: Completer) {
        self.pends.lock().push(("cache.create_stray".into(), done));
    }
    fn open_root(&mut self, done: Completer) {
        self.pends.lock().push(("cache.open_root".into(), done));
    }
    fn open_local_stray(&mut self) {
        log(&self.calls, "cache.open_local_stray");
    }
    fn trim(&mut self) {}
    fn trim_client_leases(&mut self) {}
    fn shutdown_start(&mut self, _ctx: &mut MdsCtx<'_>) {
        log(&self.calls, "cache.shutdown_start");
    }
    fn shutdown_pass(&mut self, _ctx: &mut MdsCtx<'_>) -> bool {
        self.shutdown_ready.load(Ordering::SeqCst)
    }
    fn shutdown(&mut self) {
        log(&self.calls, "cache.shutdown");
    }
    fn num_subtrees(&self) -> usize {
        0
    }
}

pub(crate) struct MockJournal {
    calls: Calls,
    pends: Pends,
}

impl crate::subsystems::Journal for MockJournal {
    fn open(&mut self, done: Completer) {
        self.pends.lock().push(("journal.open".into(), done));
    }
    fn create(&mut self, done: Completer) {
        self.pends.lock().push(("journal.create".into(), done));
    }
    fn append(&mut self) {
        log(&self.calls, "journal.append");
    }
    fn replay(&mut self, done: Completer) {
        self.pends.lock().push(("journal.replay".into(), done));
    }
    fn start_new_segment(&mut self, done: Option<Completer>) {
        match done {
            Some(done) => self
                .pends
                .lock()
                .push(("journal.start_new_segment".into(), done)),
            None => log(&self.calls, "journal.start_new_segment"),
        }
    }
    fn trim(&mut self) {}
}

pub(crate) struct MockBalancer {
    calls: Calls,
}

impl Balancer for MockBalancer {
    fn dispatch(&mut self, _ctx: &mut MdsCtx<'_>, _env: Envelope) {
        log(&self.calls, "balancer.dispatch");
    }
    fn tick(&mut self, _ctx: &mut MdsCtx<'_>) {
        log(&self.calls, "balancer.tick");
    }
    fn load(&self, _now: Stamp) -> NodeLoad {
        NodeLoad::default()
    }
}

pub(crate) struct MockMigrator {
    calls: Calls,
}

impl Migrator for MockMigrator {
    fn dispatch(&mut self, _ctx: &mut MdsCtx<'_>, _env: Envelope) {
        log(&self.calls, "migrator.dispatch");
    }
    fn handle_peer_stop(&mut self, _ctx: &mut MdsCtx<'_>, who: Rank) {
        log(&self.calls, format!("migrator.handle_peer_stop:{who}"));
    }
}

pub(crate) struct MockLocker {
    calls: Calls,
}

impl Locker for MockLocker {
    fn dispatch(&mut self, _ctx: &mut MdsCtx<'_>, _env: Envelope) {
        log(&self.calls, "locker.dispatch");
    }
    fn scatter_tick(&mut self, _ctx: &mut MdsCtx<'_>) {
        log(&self.calls, "locker.scatter_tick");
    }
}

pub(crate) struct MockServer {
    calls: Calls,
}

impl ServerSubsystem for MockServer {
    fn dispatch(&mut self, _ctx: &mut MdsCtx<'_>, _env: Envelope) {
        log(&self.calls, "server.dispatch");
    }
    fn reconnect_clients(&mut self, _ctx: &mut MdsCtx<'_>) {
        log(&self.calls, "server.reconnect_clients");
    }
    fn reconnect_tick(&mut self, _ctx: &mut MdsCtx<'_>) {
        log(&self.calls, "server.reconnect_tick");
    }
    fn find_idle_sessions(&mut self, _ctx: &mut MdsCtx<'_>) {
        log(&self.calls, "server.find_idle_sessions");
    }
    fn terminate_sessions(&mut self, _ctx: &mut MdsCtx<'_>) {
        log(&self.calls, "server.terminate_sessions");
    }
}

pub(crate) struct MockTableClient {
    prefix: &'static str,
    calls: Calls,
}

impl TableClient for MockTableClient {
    fn handle_request(&mut self, _ctx: &mut MdsCtx<'_>, _env: Envelope) {
        log(&self.calls, format!("{}.handle_request", self.prefix));
    }
    fn finish_recovery(&mut self, _ctx: &mut MdsCtx<'_>) {
        log(&self.calls, format!("{}.finish_recovery", self.prefix));
    }
    fn handle_mds_recovery(&mut self, _ctx: &mut MdsCtx<'_>, who: Rank) {
        log(
            &self.calls,
            format!("{}.handle_mds_recovery:{who}", self.prefix),
        );
    }
}

pub(crate) struct MockTableServer {
    prefix: &'static str,
    calls: Calls,
    pends: Pends,
}

impl TableServer for MockTableServer {
    fn load(&mut self, done: Completer) {
        self.pends.lock().push((format!("{}.load", self.prefix), done));
    }
    fn reset(&mut self) {
        log(&self.calls, format!("{}.reset", self.prefix));
    }
    fn save(&mut self, done: Completer) {
        self.pends.lock().push((format!("{}.save", self.prefix), done));
    }
    fn handle_request(&mut self, _ctx: &mut MdsCtx<'_>, _env: Envelope) {
        log(&self.calls, format!("{}.handle_request", self.prefix));
    }
    fn finish_recovery(&mut self, _ctx: &mut MdsCtx<'_>) {
        log(&self.calls, format!("{}.finish_recovery", self.prefix));
    }
    fn handle_mds_recovery(&mut self, _ctx: &mut MdsCtx<'_>, who: Rank) {
        log(
            &self.calls,
            format!("{}.handle_mds_recovery:{who}", self.prefix),
        );
    }
    fn check_osd_map(&mut self, _ctx: &mut MdsCtx<'_>, _force: bool) {
        log(&self.calls, format!("{}.check_osd_map", self.prefix));
    }
}

pub(crate) struct MockInodeTable {
    calls: Calls,
    pends: Pends,
}

impl InodeTable for MockInodeTable {
    fn load(&mut self, done: Completer) {
        self.pends.lock().push(("inotable.load".into(), done));
    }
    fn reset(&mut self) {
        log(&self.calls, "inotable.reset");
    }
    fn save(&mut self, done: Completer) {
        self.pends.lock().push(("inotable.save".into(), done));
    }
}

pub(crate) struct MockOsdc {
    calls: Calls,
    inc: Arc<Mutex<Option<Incarnation>>>,
}

impl ObjectStoreClient for MockOsdc {
    fn init(&mut self) {
        log(&self.calls, "osdc.init");
    }
    fn shutdown(&mut self) {
        log(&self.calls, "osdc.shutdown");
    }
    fn incarnation(&self) -> Option<Incarnation> {
        *self.inc.lock()
    }
    fn set_incarnation(&mut self, inc: Incarnation) {
        *self.inc.lock() = Some(inc);
    }
    fn set_inc_fence(&mut self, epoch: Epoch) {
        log(&self.calls, format!("osdc.set_inc_fence:{epoch}"));
    }
    fn osdmap_epoch(&self) -> Epoch {
        Epoch::default()
    }
    fn handle_op_reply(&mut self, _ctx: &mut MdsCtx<'_>, _env: Envelope) {
        log(&self.calls, "osdc.handle_op_reply");
    }
    fn handle_map(&mut self, _ctx: &mut MdsCtx<'_>, _env: Envelope) {
        log(&self.calls, "osdc.handle_map");
    }
    fn handle_remote_reset(&mut self, _addr: SocketAddr) {
        log(&self.calls, "osdc.remote_reset");
    }
}

// ----- the harness -----

pub(crate) struct Harness {
    pub node: MdsNode,
    pub rx: UnboundedReceiver<Event>,
    pub clock: Arc<ManualClock>,
    pub transport: Arc<RecordingTransport>,
    pub calls: Calls,
    pub pends: Pends,
    pub armed: Arc<Mutex<Vec<TimerFire>>>,
    pub shutdown_ready: Arc<AtomicBool>,
    osdc_inc: Arc<Mutex<Option<Incarnation>>>,
}

impl Harness {
    pub fn new() -> Self {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let pends: Pends = Arc::new(Mutex::new(Vec::new()));
        let armed = Arc::new(Mutex::new(Vec::new()));
        let shutdown_ready = Arc::new(AtomicBool::new(false));
        let osdc_inc = Arc::new(Mutex::new(None));

        let local = Inst::new("127.0.0.1:6800".parse().unwrap(), 7);
        let transport = Arc::new(RecordingTransport::new(local));
        let clock = Arc::new(ManualClock::new());

        let mons = (0..3u16)
            .map(|i| {
                Inst::new(
                    format!("127.0.0.1:{}", 6789 + i).parse::<SocketAddr>().unwrap(),
                    1,
                )
            })
            .collect();
        let monmap = MonMap::new(Uuid::nil(), mons);

        let subsys = Subsystems {
            cache: Box::new(MockCache {
                calls: Arc::clone(&calls),
                pends: Arc::clone(&pends),
                shutdown_ready: Arc::clone(&shutdown_ready),
            }),
            journal: Box::new(MockJournal {
                calls: Arc::clone(&calls),
                pends: Arc::clone(&pends),
            }),
            balancer: Box::new(MockBalancer {
                calls: Arc::clone(&calls),
            }),
            migrator: Box::new(MockMigrator {
                calls: Arc::clone(&calls),
            }),
            locker: Box::new(MockLocker {
                calls: Arc::clone(&calls),
            }),
            server: Box::new(MockServer {
                calls: Arc::clone(&calls),
            }),
            inotable: Box::new(MockInodeTable {
                calls: Arc::clone(&calls),
                pends: Arc::clone(&pends),
            }),
            anchor_client: Box::new(MockTableClient {
                prefix: "anchor_client",
                calls: Arc::clone(&calls),
            }),
            snap_client: Box::new(MockTableClient {
                prefix: "snap_client",
                calls: Arc::clone(&calls),
            }),
            anchor_server: Box::new(MockTableServer {
                prefix: "anchor_server",
                calls: Arc::clone(&calls),
                pends: Arc::clone(&pends),
            }),
            snap_server: Box::new(MockTableServer {
                prefix: "snap_server",
                calls: Arc::clone(&calls),
                pends: Arc::clone(&pends),
            }),
            osdc: Box::new(MockOsdc {
                calls: Arc::clone(&calls),
                inc: Arc::clone(&osdc_inc),
            }),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let deps = NodeDeps {
            cfg: MdsConfig::default(),
            clock: clock.clone(),
            monmap,
            transport: transport.clone(),
            subsys,
            sessions: Box::new(crate::subsystems::stock::StockSessionTable::new()),
            driver: Box::new(ManualDriver {
                armed: Arc::clone(&armed),
            }),
            metrics: Arc::new(NodeMetrics::new()),
            want_rank: Some(Rank::new(0)),
        };
        let node = MdsNode::new(deps, tx);

        Self {
            node,
            rx,
            clock,
            transport,
            calls,
            pends,
            armed,
            shutdown_ready,
            osdc_inc,
        }
    }

    /// Drain and handle everything queued on the event channel.
    pub fn pump(&mut self) {
        while let Ok(ev) = self.rx.try_recv() {
            self.node.handle_event(ev);
        }
    }

    pub fn deliver(&mut self, env: Envelope) {
        self.node.handle_event(Event::Inbound(Box::new(env)));
        self.pump();
    }

    /// Build a map: self is always rank 0 at the transport address; other
    /// ranks get synthetic peer instances. Root and tableserver are rank 0.
    pub fn map_builder(&self, epoch: u64, entries: &[(u32, NodeState)]) -> MdsMap {
        let mut map = MdsMap::new(Epoch::new(epoch));
        map.set_root(Rank::new(0));
        map.set_tableserver(Rank::new(0));
        map.set_created(1);
        for (rank, state) in entries {
            let inst = if *rank == 0 {
                self.transport.local_inst_raw()
            } else {
                self.peer_inst(*rank)
            };
            map.set_rank(Rank::new(*rank), *state, inst, Incarnation::new(1));
        }
        map
    }

    pub fn peer_inst(&self, rank: u32) -> Inst {
        Inst::new(
            format!("127.0.0.1:{}", 6900 + rank as u16).parse().unwrap(),
            1,
        )
    }

    pub fn mon_env(&self, msg: Message) -> Envelope {
        Envelope::new(
            EntityName::Mon(0),
            Inst::new("127.0.0.1:6789".parse().unwrap(), 1),
            msg,
        )
    }

    pub fn peer_env(&self, rank: u32, msg: Message) -> Envelope {
        Envelope::new(EntityName::Mds(Some(Rank::new(rank))), self.peer_inst(rank), msg)
    }

    pub fn osd_env(&self, msg: Message) -> Envelope {
        Envelope::new(
            EntityName::Osd(3),
            Inst::new("127.0.0.1:7300".parse().unwrap(), 1),
            msg,
        )
    }

    pub fn client_request_env(&self, client: u64, tid: u64, op: ClientOp) -> Envelope {
        Envelope::new(
            EntityName::Client(client),
            self.client_inst(client),
            Message::ClientRequest {
                tid,
                op,
                num_fwd: 0,
                payload: Bytes::new(),
            },
        )
    }

    pub fn client_inst(&self, client: u64) -> Inst {
        Inst::new(
            format!("127.0.0.1:{}", 7100 + client as u16).parse().unwrap(),
            1,
        )
    }

    pub fn apply_map(&mut self, map: &MdsMap) {
        let env = self.mon_env(Message::MdsMap {
            fsid: Uuid::nil(),
            epoch: map.epoch(),
            data: Bytes::from(map.encode()),
        });
        self.deliver(env);
    }

    pub fn ack_beacon(&mut self, seq: BeaconSeq) {
        let env = self.mon_env(Message::Beacon {
            fsid: Uuid::nil(),
            map_epoch: self.node.map_epoch(),
            state: self.node.want_state(),
            seq,
            want_rank: None,
        });
        self.deliver(env);
    }

    pub fn open_session(&mut self, client: u64) -> Inst {
        let inst = self.client_inst(client);
        let now = self.clock.now();
        self.node.sessions.open_session(client, inst, now);
        inst
    }

    pub fn fire_timer(&mut self, kind: TimerKind) {
        let fire = self
            .armed
            .lock()
            .iter()
            .rev()
            .find(|f| f.kind == kind)
            .copied()
            .unwrap_or_else(|| panic!("no {kind:?} armed"));
        self.node.handle_event(Event::Timer(fire));
        self.pump();
    }

    pub fn armed_fires(&self, kind: TimerKind) -> Vec<TimerFire> {
        self.armed
            .lock()
            .iter()
            .filter(|f| f.kind == kind)
            .copied()
            .collect()
    }

    pub fn sent_beacons(&self) -> Vec<(Envelope, Inst)> {
        self.transport
            .sent_messages()
            .into_iter()
            .filter(|(env, _)| matches!(env.msg, Message::Beacon { .. }))
            .collect()
    }

    pub fn calls_contain(&self, label: &str) -> bool {
        self.calls.lock().iter().any(|c| c == label)
    }

    pub fn call_count(&self, label: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == label).count()
    }

    pub fn pends_contain(&self, label: &str) -> bool {
        self.pends.lock().iter().any(|(l, _)| l == label)
    }

    /// Complete every currently pending asynchronous operation with Ok,
    /// then pump. Operations issued as a consequence stay pending for the
    /// next round.
    pub fn complete_all(&mut self) {
        let batch: Vec<(String, Completer)> = self.pends.lock().drain(..).collect();
        for (_, done) in batch {
            done.complete(Ok(()));
        }
        self.pump();
    }

    /// Fail one pending operation by label; the rest stay pending.
    pub fn fail_pending(&mut self, label: &str, err: Error) {
        let mut pends = self.pends.lock();
        let idx = pends
            .iter()
            .position(|(l, _)| l == label)
            .unwrap_or_else(|| panic!("no pending {label}"));
        let (_, done) = pends.remove(idx);
        drop(pends);
        done.complete(Err(err));
        self.pump();
    }

    pub fn osdc_incarnation(&self) -> Option<Incarnation> {
        *self.osdc_inc.lock()
    }
}
