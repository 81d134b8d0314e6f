//! Message and envelope definitions
//!
//! Payload details of the data plane are opaque byte blobs here; the node
//! core only needs enough structure to gate, filter, route, and forward.

use bytes::Bytes;
use coralfs_common::{BeaconSeq, EntityName, Epoch, FsId, Inst, NodeState, Rank};
use serde::{Deserialize, Serialize};

/// Protocol version spoken between metadata server peers.
pub const MDS_PROTOCOL: u8 = 3;
/// Protocol version spoken with filesystem clients; checked on every
/// message regardless of source class.
pub const CLIENT_PROTOCOL: u8 = 2;
/// Protocol version spoken with the monitor quorum.
pub const MON_PROTOCOL: u8 = 1;
/// Protocol version spoken with the object storage tier.
pub const OSD_PROTOCOL: u8 = 4;

/// Per-source-class protocol versions embedded in every message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub mds: u8,
    pub client: u8,
    pub mon: u8,
    pub osd: u8,
}

impl Header {
    /// The versions this build speaks
    #[must_use]
    pub const fn current() -> Self {
        Self {
            mds: MDS_PROTOCOL,
            client: CLIENT_PROTOCOL,
            mon: MON_PROTOCOL,
            osd: OSD_PROTOCOL,
        }
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::current()
    }
}

/// A message plus the identity of its sender.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    /// Logical name of the sender
    pub from: EntityName,
    /// Transport instance of the sender
    pub inst: Inst,
    pub msg: Message,
}

impl Envelope {
    #[must_use]
    pub fn new(from: EntityName, inst: Inst, msg: Message) -> Self {
        Self {
            header: Header::current(),
            from,
            inst,
            msg,
        }
    }
}

/// Client session control operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionOp {
    Open,
    Close,
    Renew,
    /// Server-initiated: the client must re-establish its session state
    RequestReconnect,
}

/// File system operations a client can request.
///
/// Idempotent operations may be forwarded between ranks transparently;
/// mutating operations must be resent by the client so the new authority
/// sees the original request id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientOp {
    Lookup,
    Getattr,
    Readdir,
    Open,
    Setattr,
    Mknod,
    Mkdir,
    Unlink,
    Rmdir,
    Rename,
    Symlink,
}

impl ClientOp {
    /// Whether a duplicate delivery of this op is harmless
    #[must_use]
    pub const fn is_idempotent(&self) -> bool {
        matches!(self, Self::Lookup | Self::Getattr | Self::Readdir | Self::Open)
    }
}

/// Which replicated table a table request addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableKind {
    Anchor,
    Snap,
}

/// Coarse routing class of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Port {
    /// Cluster maps, beacons, monitor commands
    Control,
    Cache,
    Locker,
    Migrator,
    Server,
    Balancer,
    Table,
    ObjectStore,
}

/// Every protocol message the metadata server sends or receives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    // control plane
    /// A new cluster map, from a monitor or piggybacked by a peer
    MdsMap {
        fsid: FsId,
        epoch: Epoch,
        data: Bytes,
    },
    /// Liveness beacon; the monitor echoes it back as the acknowledgement
    Beacon {
        fsid: FsId,
        map_epoch: Epoch,
        state: NodeState,
        seq: BeaconSeq,
        want_rank: Option<Rank>,
    },
    /// Runtime `key=value` configuration delivered by a monitor
    MonCommand { cmd: String },
    /// Request the current object-store map from a monitor
    OsdGetMap { fsid: FsId, have: Epoch },

    // cache port
    Resolve { data: Bytes },
    ResolveAck { data: Bytes },
    CacheRejoin { data: Bytes },
    CacheExpire { data: Bytes },
    Discover { data: Bytes },
    DiscoverReply { data: Bytes },

    // locker port
    LockMsg { data: Bytes },
    FileCaps { data: Bytes },

    // migrator port
    ExportDiscover { data: Bytes },
    ExportPrep { data: Bytes },
    ExportNotify { data: Bytes },

    // server
    ClientSession { op: SessionOp },
    ClientRequest {
        tid: u64,
        op: ClientOp,
        num_fwd: u32,
        payload: Bytes,
    },
    /// Directive telling a client which rank now owns its request
    ClientForward {
        tid: u64,
        target: Rank,
        num_fwd: u32,
        must_resend: bool,
    },
    ClientReconnect { data: Bytes },
    /// Request from a peer acting on a client's behalf
    PeerRequest { data: Bytes },

    // balancer
    Heartbeat { load: u64, data: Bytes },

    // tables
    /// Negative op codes are replies bound for a table client; zero and
    /// positive op codes are requests bound for the table server
    TableRequest {
        table: TableKind,
        op: i32,
        data: Bytes,
    },

    // object store
    OsdOpReply { data: Bytes },
    OsdMapUpdate { epoch: Epoch, data: Bytes },
}

impl Message {
    /// Routing class
    #[must_use]
    pub const fn port(&self) -> Port {
        match self {
            Self::MdsMap { .. }
            | Self::Beacon { .. }
            | Self::MonCommand { .. }
            | Self::OsdGetMap { .. } => Port::Control,
            Self::Resolve { .. }
            | Self::ResolveAck { .. }
            | Self::CacheRejoin { .. }
            | Self::CacheExpire { .. }
            | Self::Discover { .. }
            | Self::DiscoverReply { .. } => Port::Cache,
            Self::LockMsg { .. } | Self::FileCaps { .. } => Port::Locker,
            Self::ExportDiscover { .. } | Self::ExportPrep { .. } | Self::ExportNotify { .. } => {
                Port::Migrator
            }
            Self::ClientSession { .. }
            | Self::ClientRequest { .. }
            | Self::ClientForward { .. }
            | Self::ClientReconnect { .. }
            | Self::PeerRequest { .. } => Port::Server,
            Self::Heartbeat { .. } => Port::Balancer,
            Self::TableRequest { .. } => Port::Table,
            Self::OsdOpReply { .. } | Self::OsdMapUpdate { .. } => Port::ObjectStore,
        }
    }

    /// Short name for logs
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::MdsMap { .. } => "mds_map",
            Self::Beacon { .. } => "beacon",
            Self::MonCommand { .. } => "mon_command",
            Self::OsdGetMap { .. } => "osd_get_map",
            Self::Resolve { .. } => "resolve",
            Self::ResolveAck { .. } => "resolve_ack",
            Self::CacheRejoin { .. } => "cache_rejoin",
            Self::CacheExpire { .. } => "cache_expire",
            Self::Discover { .. } => "discover",
            Self::DiscoverReply { .. } => "discover_reply",
            Self::LockMsg { .. } => "lock",
            Self::FileCaps { .. } => "file_caps",
            Self::ExportDiscover { .. } => "export_discover",
            Self::ExportPrep { .. } => "export_prep",
            Self::ExportNotify { .. } => "export_notify",
            Self::ClientSession { .. } => "client_session",
            Self::ClientRequest { .. } => "client_request",
            Self::ClientForward { .. } => "client_forward",
            Self::ClientReconnect { .. } => "client_reconnect",
            Self::PeerRequest { .. } => "peer_request",
            Self::Heartbeat { .. } => "heartbeat",
            Self::TableRequest { .. } => "table_request",
            Self::OsdOpReply { .. } => "osd_op_reply",
            Self::OsdMapUpdate { .. } => "osd_map_update",
        }
    }

    /// Whether this client request may be forwarded transport-level
    /// instead of being resent by the client
    #[must_use]
    pub const fn can_forward(&self) -> bool {
        match self {
            Self::ClientRequest { op, .. } => op.is_idempotent(),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ports() {
        let m = Message::Resolve { data: Bytes::new() };
        assert_eq!(m.port(), Port::Cache);
        let m = Message::Heartbeat {
            load: 0,
            data: Bytes::new(),
        };
        assert_eq!(m.port(), Port::Balancer);
        let m = Message::TableRequest {
            table: TableKind::Snap,
            op: -1,
            data: Bytes::new(),
        };
        assert_eq!(m.port(), Port::Table);
    }

    #[test]
    fn test_can_forward_tracks_idempotence() {
        let read = Message::ClientRequest {
            tid: 1,
            op: ClientOp::Lookup,
            num_fwd: 0,
            payload: Bytes::new(),
        };
        assert!(read.can_forward());
        let write = Message::ClientRequest {
            tid: 2,
            op: ClientOp::Rename,
            num_fwd: 0,
            payload: Bytes::new(),
        };
        assert!(!write.can_forward());
    }

    #[test]
    fn test_header_versions() {
        let h = Header::current();
        assert_eq!(h.mds, MDS_PROTOCOL);
        assert_eq!(h.client, CLIENT_PROTOCOL);
    }
}
