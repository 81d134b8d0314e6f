//! Core identity types for the CoralFS metadata tier
//!
//! This module defines the fundamental identifiers used throughout the
//! system: ranks, incarnations, map epochs, entity names, and transport
//! instances.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

/// Cluster filesystem id, shared by every daemon in one cluster.
pub type FsId = Uuid;

/// One metadata server slot in the cluster, assigned by the monitor.
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
)]
#[display("{_0}")]
pub struct Rank(u32);

impl Rank {
    /// Create a rank from a raw slot number
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    /// Raw slot number
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rank({})", self.0)
    }
}

/// Per-rank restart counter; strictly increasing across restarts of a slot.
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
)]
#[display("{_0}")]
pub struct Incarnation(u32);

impl Incarnation {
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Incarnation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Incarnation({})", self.0)
    }
}

/// Version number of a cluster map; strictly increasing per map stream.
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
)]
#[display("{_0}")]
pub struct Epoch(u64);

impl Epoch {
    #[must_use]
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Epoch({})", self.0)
    }
}

/// Sequence number of a liveness beacon sent to the monitor quorum.
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
)]
#[display("{_0}")]
pub struct BeaconSeq(u64);

impl BeaconSeq {
    #[must_use]
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// The next sequence number
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Debug for BeaconSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BeaconSeq({})", self.0)
    }
}

/// Lifecycle state of one metadata server slot.
///
/// The live `state` of a node changes only when a new cluster map is
/// applied; the node's `desired_state` changes only on local decision and
/// travels to the monitor inside a beacon.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Slot does not exist
    #[default]
    Dne,
    /// Warm spare, not holding a rank
    Standby,
    /// Asking the monitor for a placement
    Boot,
    /// Initialising fresh on-disk state for a brand new rank
    Creating,
    /// Opening existing on-disk state for a cleanly stopped rank
    Starting,
    /// Re-applying the journal after an unclean restart
    Replay,
    /// Agreeing subtree authority with recovering peers
    Resolve,
    /// Re-attaching previously connected clients
    Reconnect,
    /// Re-synchronising cache state with the peer set
    Rejoin,
    /// Serving
    Active,
    /// Draining in preparation for clean shutdown
    Stopping,
    /// Cleanly shut down; slot may be reassigned
    Stopped,
    /// Declared dead by the monitor
    Failed,
}

impl NodeState {
    /// Short name used in logs and beacons
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Dne => "dne",
            Self::Standby => "up:standby",
            Self::Boot => "up:boot",
            Self::Creating => "up:creating",
            Self::Starting => "up:starting",
            Self::Replay => "up:replay",
            Self::Resolve => "up:resolve",
            Self::Reconnect => "up:reconnect",
            Self::Rejoin => "up:rejoin",
            Self::Active => "up:active",
            Self::Stopping => "up:stopping",
            Self::Stopped => "down:stopped",
            Self::Failed => "down:failed",
        }
    }

    /// Whether a rank in this state is up (holds a live daemon)
    #[must_use]
    pub const fn is_up(&self) -> bool {
        matches!(
            self,
            Self::Creating
                | Self::Starting
                | Self::Replay
                | Self::Resolve
                | Self::Reconnect
                | Self::Rejoin
                | Self::Active
                | Self::Stopping
        )
    }

    /// Whether this state is part of the multi-step recovery handshake
    #[must_use]
    pub const fn is_recovering(&self) -> bool {
        matches!(
            self,
            Self::Replay | Self::Resolve | Self::Reconnect | Self::Rejoin
        )
    }

    /// Whether a rank in this state still holds its slot
    #[must_use]
    pub const fn is_in(&self) -> bool {
        self.is_up() || matches!(self, Self::Failed)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Logical name of a process in the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityName {
    /// A metadata server; `None` until the monitor assigns a rank
    Mds(Option<Rank>),
    /// A filesystem client
    Client(u64),
    /// A cluster monitor
    Mon(u32),
    /// An object storage daemon
    Osd(u64),
}

impl EntityName {
    /// The rank, when this names a placed metadata server
    #[must_use]
    pub const fn mds_rank(&self) -> Option<Rank> {
        match self {
            Self::Mds(r) => *r,
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_mds(&self) -> bool {
        matches!(self, Self::Mds(_))
    }

    #[must_use]
    pub const fn is_client(&self) -> bool {
        matches!(self, Self::Client(_))
    }

    #[must_use]
    pub const fn is_mon(&self) -> bool {
        matches!(self, Self::Mon(_))
    }

    #[must_use]
    pub const fn is_osd(&self) -> bool {
        matches!(self, Self::Osd(_))
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mds(Some(r)) => write!(f, "mds.{r}"),
            Self::Mds(None) => write!(f, "mds.?"),
            Self::Client(c) => write!(f, "client.{c}"),
            Self::Mon(m) => write!(f, "mon.{m}"),
            Self::Osd(o) => write!(f, "osd.{o}"),
        }
    }
}

/// Transport identity of one process instance.
///
/// The nonce distinguishes successive daemons at the same address: a
/// restarted process comes back with a new nonce, and a mismatched nonce is
/// how stale peers are recognised.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Inst {
    /// Socket address the instance is reachable at
    pub addr: SocketAddr,
    /// Per-process random nonce
    pub nonce: u64,
}

impl Inst {
    #[must_use]
    pub const fn new(addr: SocketAddr, nonce: u64) -> Self {
        Self { addr, nonce }
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(NodeState::Active.is_up());
        assert!(NodeState::Replay.is_up());
        assert!(!NodeState::Failed.is_up());
        assert!(NodeState::Failed.is_in());
        assert!(!NodeState::Standby.is_in());
        assert!(NodeState::Rejoin.is_recovering());
        assert!(!NodeState::Active.is_recovering());
    }

    #[test]
    fn test_entity_name_display() {
        assert_eq!(EntityName::Mds(Some(Rank::new(3))).to_string(), "mds.3");
        assert_eq!(EntityName::Mds(None).to_string(), "mds.?");
        assert_eq!(EntityName::Client(42).to_string(), "client.42");
    }

    #[test]
    fn test_inst_identity() {
        let addr: SocketAddr = "127.0.0.1:6800".parse().unwrap();
        let a = Inst::new(addr, 1);
        let b = Inst::new(addr, 2);
        assert_ne!(a, b);
        assert_eq!(a, Inst::new(addr, 1));
    }
}
