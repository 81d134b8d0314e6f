//! The monitor map
//!
//! Names the monitor quorum. The node sticks to the last monitor that
//! answered it; when beacons go unacknowledged the outstanding count is used
//! as a spread hint to rotate retries across the quorum.

use coralfs_common::{FsId, Inst};
use serde::{Deserialize, Serialize};

/// The monitor quorum as known to this node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonMap {
    /// Cluster filesystem id
    pub fsid: FsId,
    mons: Vec<Inst>,
    last_mon: usize,
}

impl MonMap {
    /// Build a map from a non-empty monitor list.
    #[must_use]
    pub fn new(fsid: FsId, mons: Vec<Inst>) -> Self {
        assert!(!mons.is_empty(), "monitor quorum cannot be empty");
        Self {
            fsid,
            mons,
            last_mon: 0,
        }
    }

    #[must_use]
    pub fn num_mons(&self) -> usize {
        self.mons.len()
    }

    #[must_use]
    pub fn get_inst(&self, mon: usize) -> Inst {
        self.mons[mon % self.mons.len()]
    }

    /// The monitor that most recently acknowledged us
    #[must_use]
    pub const fn last_mon(&self) -> usize {
        self.last_mon
    }

    /// Record which monitor answered
    pub fn set_last_mon(&mut self, mon: usize) {
        if mon < self.mons.len() {
            self.last_mon = mon;
        }
    }

    /// Choose a monitor to talk to. A zero spread hint keeps the sticky
    /// choice; a nonzero hint (the count of outstanding unacknowledged
    /// beacons) walks the quorum so retries land on different monitors.
    #[must_use]
    pub fn pick_mon(&self, spread_hint: usize) -> usize {
        if spread_hint == 0 {
            self.last_mon
        } else {
            (self.last_mon + spread_hint) % self.mons.len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn monmap(n: u16) -> MonMap {
        let mons = (0..n)
            .map(|i| Inst::new(format!("127.0.0.1:{}", 6789 + i).parse().unwrap(), 1))
            .collect();
        MonMap::new(Uuid::nil(), mons)
    }

    #[test]
    fn test_pick_mon_sticky() {
        let mut m = monmap(3);
        assert_eq!(m.pick_mon(0), 0);
        m.set_last_mon(2);
        assert_eq!(m.pick_mon(0), 2);
    }

    #[test]
    fn test_pick_mon_spreads_retries() {
        let m = monmap(3);
        assert_eq!(m.pick_mon(1), 1);
        assert_eq!(m.pick_mon(2), 2);
        assert_eq!(m.pick_mon(3), 0);
    }

    #[test]
    fn test_set_last_mon_ignores_out_of_range() {
        let mut m = monmap(2);
        m.set_last_mon(7);
        assert_eq!(m.last_mon(), 0);
    }
}
