//! Subsystem seams
//!
//! The node owns its subsystems exclusively; each subsystem talks back to
//! the node only through [`MdsCtx`] (sends, signals, session table, clock)
//! handed into every call, never through a back-reference. Asynchronous
//! operations take a [`Completer`] and post their outcome into the node
//! loop; they must not complete inline.

pub mod stock;

use crate::event::{Completer, Event, EventSender, Signal};
use bytes::Bytes;
use coralfs_common::{
    Clock, EntityName, Epoch, FsId, Incarnation, Inst, MdsConfig, NodeState, Rank, Stamp,
};
use coralfs_map::{MdsMap, MonMap};
use coralfs_msg::{Envelope, Message, Transport};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use tracing::{debug, warn};

use crate::metrics::NodeMetrics;

/// The node-side interface a subsystem sees during a call.
pub struct MdsCtx<'a> {
    /// Our rank, if the monitor has placed us
    pub whoami: Option<Rank>,
    /// Our live lifecycle state
    pub state: NodeState,
    /// Our logical name
    pub my_name: EntityName,
    /// Our transport identity
    pub my_inst: Inst,
    /// Cluster filesystem id
    pub fsid: FsId,
    pub clock: &'a dyn Clock,
    pub mdsmap: &'a MdsMap,
    pub monmap: &'a MonMap,
    pub cfg: &'a MdsConfig,
    pub metrics: &'a NodeMetrics,
    pub(crate) transport: &'a dyn Transport,
    pub(crate) peer_epochs: &'a mut BTreeMap<Rank, Epoch>,
    pub(crate) sessions: &'a mut dyn SessionTable,
    pub(crate) tx: &'a EventSender,
}

impl MdsCtx<'_> {
    /// The client session table.
    pub fn sessions(&mut self) -> &mut dyn SessionTable {
        &mut *self.sessions
    }

    /// Report a lifecycle milestone back to the node.
    pub fn signal(&self, s: Signal) {
        let _ = self.tx.send(Event::Signal(s));
    }

    /// Send to an explicit instance, with no session or map bookkeeping.
    pub fn send_to_inst(&self, msg: Message, to: &Inst) {
        self.transport
            .send(Envelope::new(self.my_name, self.my_inst, msg), to);
    }

    /// Send to a peer rank. If the peer has not yet seen our current
    /// cluster map, the map goes first, so no message ever assumes map
    /// state the peer lacks.
    pub fn send_message_mds(&mut self, msg: Message, to: Rank) {
        let Some(inst) = self.mdsmap.get_inst(to) else {
            warn!("send_message_mds: no instance for mds.{to}, dropping {}", msg.type_name());
            return;
        };
        self.ship_map_if_stale(to, &inst);
        self.transport
            .send(Envelope::new(self.my_name, self.my_inst, msg), &inst);
    }

    /// Hand a message we hold to another rank.
    ///
    /// A client request is special: the client is told where its request
    /// went via a forward directive, and a non-idempotent request is not
    /// forwarded at all. A duplicate would be ignored by the new authority
    /// only if it still held the completed-request record, and the metadata
    /// may have migrated away from it, so the client must resend.
    pub fn forward_message_mds(&mut self, mut env: Envelope, to: Rank) {
        if env.from.is_client() {
            let must_resend = !env.msg.can_forward();
            if let Message::ClientRequest { tid, num_fwd, .. } = &mut env.msg {
                *num_fwd += 1;
                let directive = Message::ClientForward {
                    tid: *tid,
                    target: to,
                    num_fwd: *num_fwd,
                    must_resend,
                };
                let client_inst = env.inst;
                self.metrics
                    .forwards
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.send_to_inst(directive, &client_inst);
                if must_resend {
                    debug!("not forwarding non-idempotent {}, client will resend", env.msg.type_name());
                    return;
                }
            }
        }

        let Some(inst) = self.mdsmap.get_inst(to) else {
            warn!("forward_message_mds: no instance for mds.{to}");
            return;
        };
        self.ship_map_if_stale(to, &inst);
        self.transport.forward(env, &inst);
    }

    /// Send to a client through its session, bumping the per-session push
    /// sequence. Dropped with a log line when no session exists.
    pub fn send_message_client(&mut self, msg: Message, client: u64) {
        match self.sessions.session_inst(client) {
            Some(inst) => {
                let seq = self.sessions.inc_push_seq(client);
                debug!("send_message_client client.{client} seq {seq} {}", msg.type_name());
                self.metrics
                    .client_sends
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.transport
                    .send(Envelope::new(self.my_name, self.my_inst, msg), &inst);
            }
            None => {
                debug!("send_message_client: no session for client.{client}, dropping {}", msg.type_name());
            }
        }
    }

    fn ship_map_if_stale(&mut self, to: Rank, inst: &Inst) {
        let epoch = self.mdsmap.epoch();
        if self.peer_epochs.get(&to).copied().unwrap_or_default() < epoch {
            let map_msg = Message::MdsMap {
                fsid: self.fsid,
                epoch,
                data: Bytes::from(self.mdsmap.encode()),
            };
            self.transport
                .send(Envelope::new(self.my_name, self.my_inst, map_msg), inst);
            self.peer_epochs.insert(to, epoch);
        }
    }
}

/// A point-in-time load summary published by the balancer.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NodeLoad {
    pub load: f64,
    pub request_rate: f64,
}

/// The metadata cache.
pub trait MetaCache: Send {
    fn dispatch(&mut self, ctx: &mut MdsCtx<'_>, env: Envelope);
    /// Seed the set of peers we must recover against
    fn set_recovery_peers(&mut self, peers: BTreeSet<Rank>);
    /// Open the subtree-authority negotiation with one peer
    fn send_resolve(&mut self, ctx: &mut MdsCtx<'_>, to: Rank);
    fn handle_mds_failure(&mut self, ctx: &mut MdsCtx<'_>, who: Rank);
    fn handle_mds_recovery(&mut self, ctx: &mut MdsCtx<'_>, who: Rank);
    /// Broadcast rejoin state to the peer set (joint rejoin start)
    fn rejoin_send_rejoins(&mut self, ctx: &mut MdsCtx<'_>);
    fn reconnect_clean_open_file_lists(&mut self);
    fn start_recovered_purges(&mut self);
    fn recover_files(&mut self);
    fn create_root(&mut self, done: Completer);
    fn create_stray(&mut self, done: Completer);
    fn open_root(&mut self, done: Completer);
    fn open_local_stray(&mut self);
    fn trim(&mut self);
    fn trim_client_leases(&mut self);
    fn shutdown_start(&mut self, ctx: &mut MdsCtx<'_>);
    /// One drain pass; true when nothing is left to hand off
    fn shutdown_pass(&mut self, ctx: &mut MdsCtx<'_>) -> bool;
    fn shutdown(&mut self);
    fn num_subtrees(&self) -> usize;
}

/// The metadata journal.
pub trait Journal: Send {
    fn open(&mut self, done: Completer);
    fn create(&mut self, done: Completer);
    /// Position at the end of an existing journal for appending
    fn append(&mut self);
    fn replay(&mut self, done: Completer);
    fn start_new_segment(&mut self, done: Option<Completer>);
    fn trim(&mut self);
}

/// The load balancer.
pub trait Balancer: Send {
    fn dispatch(&mut self, ctx: &mut MdsCtx<'_>, env: Envelope);
    fn tick(&mut self, ctx: &mut MdsCtx<'_>);
    fn load(&self, now: Stamp) -> NodeLoad;
}

/// The subtree migrator.
pub trait Migrator: Send {
    fn dispatch(&mut self, ctx: &mut MdsCtx<'_>, env: Envelope);
    /// A peer stopped or failed; abort anything mid-flight toward it
    fn handle_peer_stop(&mut self, ctx: &mut MdsCtx<'_>, who: Rank);
}

/// The lock manager.
pub trait Locker: Send {
    fn dispatch(&mut self, ctx: &mut MdsCtx<'_>, env: Envelope);
    fn scatter_tick(&mut self, ctx: &mut MdsCtx<'_>);
}

/// The client-facing request server.
pub trait ServerSubsystem: Send {
    fn dispatch(&mut self, ctx: &mut MdsCtx<'_>, env: Envelope);
    /// Ask previously connected clients to reattach
    fn reconnect_clients(&mut self, ctx: &mut MdsCtx<'_>);
    fn reconnect_tick(&mut self, ctx: &mut MdsCtx<'_>);
    fn find_idle_sessions(&mut self, ctx: &mut MdsCtx<'_>);
    fn terminate_sessions(&mut self, ctx: &mut MdsCtx<'_>);
}

/// Client side of a replicated table.
pub trait TableClient: Send {
    fn handle_request(&mut self, ctx: &mut MdsCtx<'_>, env: Envelope);
    /// Resend in-flight commits after a recovery
    fn finish_recovery(&mut self, ctx: &mut MdsCtx<'_>);
    fn handle_mds_recovery(&mut self, ctx: &mut MdsCtx<'_>, who: Rank);
}

/// Server side of a replicated table; lives only on the tableserver rank.
pub trait TableServer: Send {
    fn load(&mut self, done: Completer);
    fn reset(&mut self);
    fn save(&mut self, done: Completer);
    fn handle_request(&mut self, ctx: &mut MdsCtx<'_>, env: Envelope);
    /// Resend in-flight agreements after a recovery
    fn finish_recovery(&mut self, ctx: &mut MdsCtx<'_>);
    fn handle_mds_recovery(&mut self, ctx: &mut MdsCtx<'_>, who: Rank);
    fn check_osd_map(&mut self, ctx: &mut MdsCtx<'_>, force: bool);
}

/// The inode number allocator table.
pub trait InodeTable: Send {
    fn load(&mut self, done: Completer);
    fn reset(&mut self);
    fn save(&mut self, done: Completer);
}

/// The client session table.
pub trait SessionTable: Send {
    fn load(&mut self, done: Completer);
    fn save(&mut self, done: Completer);
    fn count(&self) -> usize;
    fn have_session(&self, client: u64) -> bool;
    fn session_inst(&self, client: u64) -> Option<Inst>;
    /// Bump and return the per-session push sequence
    fn inc_push_seq(&mut self, client: u64) -> u64;
    fn open_session(&mut self, client: u64, inst: Inst, now: Stamp);
    fn touch(&mut self, client: u64, now: Stamp);
    fn last_seen(&self, client: u64) -> Option<Stamp>;
    fn remove_session(&mut self, client: u64) -> bool;
    fn clear(&mut self);
    fn client_set(&self) -> Vec<(u64, Inst)>;
}

/// The object-store client.
pub trait ObjectStoreClient: Send {
    fn init(&mut self);
    fn shutdown(&mut self);
    fn incarnation(&self) -> Option<Incarnation>;
    fn set_incarnation(&mut self, inc: Incarnation);
    /// Fence writes from previous incarnations at this map epoch
    fn set_inc_fence(&mut self, epoch: Epoch);
    fn osdmap_epoch(&self) -> Epoch;
    fn handle_op_reply(&mut self, ctx: &mut MdsCtx<'_>, env: Envelope);
    fn handle_map(&mut self, ctx: &mut MdsCtx<'_>, env: Envelope);
    fn handle_remote_reset(&mut self, addr: SocketAddr);
}

/// Everything the node owns, created once at construction and torn down at
/// suicide. Never rebound.
pub struct Subsystems {
    pub cache: Box<dyn MetaCache>,
    pub journal: Box<dyn Journal>,
    pub balancer: Box<dyn Balancer>,
    pub migrator: Box<dyn Migrator>,
    pub locker: Box<dyn Locker>,
    pub server: Box<dyn ServerSubsystem>,
    pub inotable: Box<dyn InodeTable>,
    pub anchor_client: Box<dyn TableClient>,
    pub snap_client: Box<dyn TableClient>,
    pub anchor_server: Box<dyn TableServer>,
    pub snap_server: Box<dyn TableServer>,
    pub osdc: Box<dyn ObjectStoreClient>,
}

impl Subsystems {
    pub fn table_client(&mut self, table: coralfs_msg::TableKind) -> &mut dyn TableClient {
        match table {
            coralfs_msg::TableKind::Anchor => self.anchor_client.as_mut(),
            coralfs_msg::TableKind::Snap => self.snap_client.as_mut(),
        }
    }

    pub fn table_server(&mut self, table: coralfs_msg::TableKind) -> &mut dyn TableServer {
        match table {
            coralfs_msg::TableKind::Anchor => self.anchor_server.as_mut(),
            coralfs_msg::TableKind::Snap => self.snap_server.as_mut(),
        }
    }
}
