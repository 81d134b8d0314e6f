//! The cluster map of the metadata tier
//!
//! The monitor quorum owns this map; nodes only decode and read it. Every
//! state transition a node makes is mediated by a new epoch of this map, so
//! the accessors here are the vocabulary of the whole lifecycle machine.

use coralfs_common::{Epoch, Error, Inst, NodeState, Rank, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

/// What the map records about one rank.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankEntry {
    /// Lifecycle state the monitor has placed this rank in
    pub state: NodeState,
    /// Transport instance of the daemon holding the rank; `None` while the
    /// rank is failed and unclaimed
    pub inst: Option<Inst>,
    /// Restart counter for the rank
    pub inc: coralfs_common::Incarnation,
}

/// The metadata cluster map.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MdsMap {
    epoch: Epoch,
    /// Cluster creation time, unix seconds
    created: u64,
    /// Epoch of the most recent rank failure, used as an incarnation fence
    /// by the object-store client
    last_failure: Epoch,
    /// Rank hosting the authoritative anchor and snap tables
    tableserver: Rank,
    /// Rank hosting the root directory
    root: Rank,
    #[serde(with = "rank_entries")]
    ranks: BTreeMap<Rank, RankEntry>,
    /// Spare daemons waiting for a slot
    standby: Vec<Inst>,
}

/// The rank table travels as a sequence of pairs; JSON object keys are
/// strings and ranks are not.
mod rank_entries {
    use super::{Rank, RankEntry};
    use serde::de::Deserialize;
    use serde::{Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<Rank, RankEntry>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<Rank, RankEntry>, D::Error> {
        let entries: Vec<(Rank, RankEntry)> = Vec::deserialize(deserializer)?;
        Ok(entries.into_iter().collect())
    }
}

impl MdsMap {
    /// An empty map at a given epoch; monitors and tests grow it from here.
    #[must_use]
    pub fn new(epoch: Epoch) -> Self {
        Self {
            epoch,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn epoch(&self) -> Epoch {
        self.epoch
    }

    #[must_use]
    pub const fn created(&self) -> u64 {
        self.created
    }

    #[must_use]
    pub const fn last_failure(&self) -> Epoch {
        self.last_failure
    }

    #[must_use]
    pub const fn get_tableserver(&self) -> Rank {
        self.tableserver
    }

    #[must_use]
    pub const fn get_root(&self) -> Rank {
        self.root
    }

    /// Rank currently bound to the given transport address, if any
    #[must_use]
    pub fn get_addr_rank(&self, addr: &SocketAddr) -> Option<Rank> {
        self.ranks
            .iter()
            .find(|(_, e)| e.inst.map(|i| i.addr == *addr).unwrap_or(false))
            .map(|(r, _)| *r)
    }

    /// Whether the given address is listed as a standby daemon
    #[must_use]
    pub fn is_standby(&self, addr: &SocketAddr) -> bool {
        self.standby.iter().any(|i| i.addr == *addr)
    }

    /// Lifecycle state of a rank; `Dne` when the map has no such slot
    #[must_use]
    pub fn state_of(&self, rank: Rank) -> NodeState {
        self.ranks
            .get(&rank)
            .map(|e| e.state)
            .unwrap_or(NodeState::Dne)
    }

    #[must_use]
    pub fn is_up(&self, rank: Rank) -> bool {
        self.ranks
            .get(&rank)
            .map(|e| e.inst.is_some() && e.state.is_up())
            .unwrap_or(false)
    }

    #[must_use]
    pub fn is_down(&self, rank: Rank) -> bool {
        !self.is_up(rank)
    }

    #[must_use]
    pub fn have_inst(&self, rank: Rank) -> bool {
        self.ranks
            .get(&rank)
            .map(|e| e.inst.is_some())
            .unwrap_or(false)
    }

    #[must_use]
    pub fn get_inst(&self, rank: Rank) -> Option<Inst> {
        self.ranks.get(&rank).and_then(|e| e.inst)
    }

    /// Incarnation of a rank; zero when the slot is unknown
    #[must_use]
    pub fn get_inc(&self, rank: Rank) -> coralfs_common::Incarnation {
        self.ranks.get(&rank).map(|e| e.inc).unwrap_or_default()
    }

    /// All ranks currently in the given state
    #[must_use]
    pub fn get_mds_set(&self, state: NodeState) -> BTreeSet<Rank> {
        self.ranks
            .iter()
            .filter(|(_, e)| e.state == state)
            .map(|(r, _)| *r)
            .collect()
    }

    /// All ranks held by a live daemon
    #[must_use]
    pub fn get_up_mds_set(&self) -> BTreeSet<Rank> {
        self.ranks
            .iter()
            .filter(|(_, e)| e.inst.is_some() && e.state.is_up())
            .map(|(r, _)| *r)
            .collect()
    }

    /// All ranks somewhere in the recovery handshake
    #[must_use]
    pub fn get_recovery_mds_set(&self) -> BTreeSet<Rank> {
        self.ranks
            .iter()
            .filter(|(_, e)| e.state.is_recovering())
            .map(|(r, _)| *r)
            .collect()
    }

    /// Count of ranks holding a slot (up or failed)
    #[must_use]
    pub fn num_in_mds(&self) -> usize {
        self.ranks.values().filter(|e| e.state.is_in()).count()
    }

    /// Count of ranks in one state
    #[must_use]
    pub fn num_mds(&self, state: NodeState) -> usize {
        self.ranks.values().filter(|e| e.state == state).count()
    }

    /// The cluster is jointly rejoining: at least one rank is in `Rejoin`
    /// and none lag behind in an earlier recovery phase.
    #[must_use]
    pub fn is_rejoining(&self) -> bool {
        self.num_mds(NodeState::Rejoin) > 0
            && self.num_mds(NodeState::Replay) == 0
            && self.num_mds(NodeState::Resolve) == 0
            && self.num_mds(NodeState::Reconnect) == 0
    }

    /// Some rank is failed or still recovering
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.ranks
            .values()
            .any(|e| e.state == NodeState::Failed || e.state.is_recovering())
    }

    /// Serialize for the wire
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("map serialization is infallible")
    }

    /// Deserialize a map received from a monitor or a peer
    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::decode(format!("bad cluster map: {e}")))
    }

    // Mutators, used by monitors and by tests building map sequences.

    pub fn set_epoch(&mut self, epoch: Epoch) {
        self.epoch = epoch;
    }

    pub fn set_created(&mut self, created: u64) {
        self.created = created;
    }

    pub fn set_last_failure(&mut self, epoch: Epoch) {
        self.last_failure = epoch;
    }

    pub fn set_tableserver(&mut self, rank: Rank) {
        self.tableserver = rank;
    }

    pub fn set_root(&mut self, rank: Rank) {
        self.root = rank;
    }

    /// Place a daemon instance in a rank with the given state
    pub fn set_rank(
        &mut self,
        rank: Rank,
        state: NodeState,
        inst: Inst,
        inc: coralfs_common::Incarnation,
    ) {
        self.ranks.insert(
            rank,
            RankEntry {
                state,
                inst: Some(inst),
                inc,
            },
        );
    }

    /// Mark a rank failed, detaching whatever instance held it
    pub fn set_failed(&mut self, rank: Rank) {
        let inc = self.get_inc(rank);
        self.ranks.insert(
            rank,
            RankEntry {
                state: NodeState::Failed,
                inst: None,
                inc,
            },
        );
    }

    /// Change only the state of an already placed rank
    pub fn set_state(&mut self, rank: Rank, state: NodeState) {
        if let Some(e) = self.ranks.get_mut(&rank) {
            e.state = state;
        }
    }

    /// Remove a rank from the map entirely
    pub fn remove_rank(&mut self, rank: Rank) {
        self.ranks.remove(&rank);
    }

    pub fn add_standby(&mut self, inst: Inst) {
        self.standby.push(inst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coralfs_common::Incarnation;

    fn inst(port: u16) -> Inst {
        Inst::new(format!("127.0.0.1:{port}").parse().unwrap(), 1)
    }

    fn map_with(ranks: &[(u32, NodeState)]) -> MdsMap {
        let mut m = MdsMap::new(Epoch::new(1));
        for (r, s) in ranks {
            m.set_rank(
                Rank::new(*r),
                *s,
                inst(6800 + *r as u16),
                Incarnation::new(1),
            );
        }
        m
    }

    #[test]
    fn test_addr_rank_lookup() {
        let m = map_with(&[(0, NodeState::Active), (1, NodeState::Replay)]);
        assert_eq!(
            m.get_addr_rank(&"127.0.0.1:6801".parse().unwrap()),
            Some(Rank::new(1))
        );
        assert_eq!(m.get_addr_rank(&"127.0.0.1:9999".parse().unwrap()), None);
    }

    #[test]
    fn test_standby() {
        let mut m = MdsMap::new(Epoch::new(2));
        m.add_standby(inst(7000));
        assert!(m.is_standby(&"127.0.0.1:7000".parse().unwrap()));
        assert!(!m.is_standby(&"127.0.0.1:7001".parse().unwrap()));
    }

    #[test]
    fn test_state_sets() {
        let m = map_with(&[
            (0, NodeState::Active),
            (1, NodeState::Resolve),
            (2, NodeState::Rejoin),
        ]);
        assert_eq!(m.get_mds_set(NodeState::Active).len(), 1);
        assert_eq!(m.get_recovery_mds_set().len(), 2);
        assert_eq!(m.get_up_mds_set().len(), 3);
        assert_eq!(m.num_in_mds(), 3);
    }

    #[test]
    fn test_failed_rank_is_down_but_in() {
        let mut m = map_with(&[(0, NodeState::Active)]);
        m.set_failed(Rank::new(1));
        assert!(m.is_down(Rank::new(1)));
        assert!(!m.have_inst(Rank::new(1)));
        assert_eq!(m.state_of(Rank::new(1)), NodeState::Failed);
        assert_eq!(m.num_in_mds(), 2);
        assert!(m.is_degraded());
    }

    #[test]
    fn test_rejoining_requires_everyone_caught_up() {
        let mut m = map_with(&[(0, NodeState::Rejoin), (1, NodeState::Resolve)]);
        assert!(!m.is_rejoining());
        m.set_state(Rank::new(1), NodeState::Rejoin);
        assert!(m.is_rejoining());
    }

    #[test]
    fn test_encode_decode() {
        let mut m = map_with(&[(0, NodeState::Active)]);
        m.set_root(Rank::new(0));
        m.set_tableserver(Rank::new(0));
        let out = MdsMap::decode(&m.encode()).unwrap();
        assert_eq!(out, m);
        assert!(MdsMap::decode(b"not a map").is_err());
    }
}
