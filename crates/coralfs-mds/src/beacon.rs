//! Liveness beacons
//!
//! Every beacon interval the node tells a monitor what state it wants and
//! which sequence this is; the monitor echoes the sequence back as the
//! acknowledgement. Acks retire a prefix of the ledger. If the grace
//! window passes with no progress the node goes laggy: non-control work is
//! parked until an acknowledgement proves the monitors can still hear us.

use crate::event::TimerKind;
use crate::node::MdsNode;
use coralfs_common::EntityName;
use coralfs_msg::{Envelope, Message};
use std::sync::atomic::Ordering;
use tracing::{debug, info, trace, warn};

impl MdsNode {
    /// Emit the first beacon and arm the liveness deadline. A node that
    /// never hears a single ack still goes laggy once the grace expires.
    pub(crate) fn beacon_start(&mut self) {
        self.beacon_send();
        self.reset_beacon_killer();
    }

    pub(crate) fn beacon_send(&mut self) {
        self.beacon.last_seq = self.beacon.last_seq.next();
        let seq = self.beacon.last_seq;
        debug!(
            "beacon_send {} seq {seq} (currently {})",
            self.want_state, self.state
        );

        // pick a different mon when beacons are outstanding
        let mon = self.monmap.pick_mon(self.beacon.ledger.len());

        let now = self.clock.now();
        self.beacon.ledger.insert(seq, now);

        let msg = Message::Beacon {
            fsid: self.monmap.fsid,
            map_epoch: self.mdsmap.epoch(),
            state: self.want_state,
            seq,
            want_rank: self.want_rank,
        };
        self.send_mon(msg, mon);
        self.metrics.beacons_sent.fetch_add(1, Ordering::Relaxed);

        let interval = self.cfg.beacon_interval();
        self.timers.arm_after(TimerKind::BeaconSender, interval);
    }

    pub(crate) fn handle_beacon_ack(&mut self, env: Envelope) {
        let Message::Beacon { seq, state, .. } = env.msg else {
            return;
        };
        debug!("handle_beacon_ack {state} seq {seq}");

        // make note of which mon answered
        if let EntityName::Mon(mon) = env.from {
            self.monmap.set_last_mon(mon as usize);
        }

        if let Some(stamp) = self.beacon.ledger.get(&seq).copied() {
            debug_assert!(stamp >= self.beacon.last_acked);
            self.beacon.last_acked = stamp;
            // acks retire a prefix: everything at or before this sequence
            self.beacon.ledger = self.beacon.ledger.split_off(&seq.next());
            self.metrics.beacon_acks.fetch_add(1, Ordering::Relaxed);

            if self.laggy
                && self.clock.now().saturating_since(stamp) < self.cfg.beacon_grace()
            {
                info!("clearing laggy flag");
                self.laggy = false;
                let waiters = self.waiting_for_nolaggy.take();
                self.queue_waiters(waiters);
            }

            self.reset_beacon_killer();
        }
    }

    /// Re-arm the liveness deadline at `last_acked + grace`, capturing the
    /// ack stamp the deadline is relative to.
    pub(crate) fn reset_beacon_killer(&mut self) {
        let grace = self.cfg.beacon_grace();
        let when = self.beacon.last_acked + grace;
        trace!(
            "reset_beacon_killer: last_acked {:?}, laggy at {:?}",
            self.beacon.last_acked,
            when
        );
        self.beacon.killer_lab = self.beacon.last_acked;
        let delay = when.saturating_since(self.clock.now());
        self.timers.arm_after(TimerKind::BeaconKiller, delay);
    }

    /// The liveness deadline fired. Only act if no ack arrived since the
    /// deadline was armed; a concurrent ack makes this a no-op.
    pub(crate) fn beacon_kill(&mut self) {
        if self.beacon.killer_lab == self.beacon.last_acked {
            warn!(
                "no beacon acks since {:?}, setting laggy flag",
                self.beacon.killer_lab
            );
            self.laggy = true;
            self.metrics.laggy_episodes.fetch_add(1, Ordering::Relaxed);
            if self.cfg.suicide_on_laggy {
                self.suicide();
            }
        } else {
            trace!("beacon_kill: acks advanced, doing nothing");
        }
    }

    #[cfg(test)]
    pub(crate) fn ledger_snapshot(
        &self,
    ) -> Vec<(coralfs_common::BeaconSeq, coralfs_common::Stamp)> {
        self.beacon.ledger.iter().map(|(s, t)| (*s, *t)).collect()
    }

    #[cfg(test)]
    pub(crate) fn last_acked_stamp(&self) -> coralfs_common::Stamp {
        self.beacon.last_acked
    }
}

#[cfg(test)]
mod tests {
    use crate::event::TimerKind;
    use crate::testing::Harness;
    use coralfs_common::{BeaconSeq, NodeState};
    use coralfs_msg::Message;
    use std::time::Duration;

    #[test]
    fn test_beacons_go_to_spread_monitors() {
        let mut h = Harness::new();
        h.node.init();
        // no acks: each retry should rotate to a different monitor
        h.fire_timer(TimerKind::BeaconSender);
        h.fire_timer(TimerKind::BeaconSender);
        let beacons = h.sent_beacons();
        assert_eq!(beacons.len(), 3);
        let targets: std::collections::BTreeSet<_> =
            beacons.iter().map(|(_, inst)| inst.addr).collect();
        assert_eq!(targets.len(), 3, "retries should spread across the quorum");
    }

    #[test]
    fn test_ack_retires_ledger_prefix() {
        let mut h = Harness::new();
        h.node.init();
        h.fire_timer(TimerKind::BeaconSender);
        h.fire_timer(TimerKind::BeaconSender);
        assert_eq!(h.node.ledger_snapshot().len(), 3);

        h.ack_beacon(BeaconSeq::new(2));
        let ledger = h.node.ledger_snapshot();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].0, BeaconSeq::new(3));

        // an ack for an already-retired sequence changes nothing
        let acked = h.node.last_acked_stamp();
        h.ack_beacon(BeaconSeq::new(1));
        assert_eq!(h.node.last_acked_stamp(), acked);
        assert_eq!(h.node.ledger_snapshot().len(), 1);
    }

    #[test]
    fn test_unacked_beacons_set_laggy_and_ack_recovers() {
        let mut h = Harness::new();
        h.node.init();
        // four more beacons, none acknowledged
        for _ in 0..3 {
            h.fire_timer(TimerKind::BeaconSender);
        }
        let grace = h.node.config().beacon_grace();
        h.clock.advance(grace + Duration::from_secs(1));
        h.fire_timer(TimerKind::BeaconSender); // fifth beacon, sent just now
        h.fire_timer(TimerKind::BeaconKiller);
        assert!(h.node.is_laggy());

        // a client request arriving while laggy is parked, not dispatched
        let env = h.client_request_env(5, 1, coralfs_msg::ClientOp::Getattr);
        h.deliver(env);
        assert_eq!(h.node.waiting_for_nolaggy.len(), 1);
        assert!(!h.calls_contain("server.dispatch"));

        // the ack for the recent beacon is within grace: laggy clears and
        // the parked request is dispatched
        h.clock.advance(Duration::from_secs(1));
        h.ack_beacon(BeaconSeq::new(5));
        assert!(!h.node.is_laggy());
        assert_eq!(h.node.waiting_for_nolaggy.len(), 0);
        assert!(h.calls_contain("server.dispatch"));
    }

    #[test]
    fn test_stale_killer_fire_is_inert() {
        let mut h = Harness::new();
        h.node.init();
        h.ack_beacon(BeaconSeq::new(1));
        let stale = h
            .armed_fires(TimerKind::BeaconKiller)
            .first()
            .copied()
            .expect("killer armed at init");
        // the ack re-armed the killer; the original fire is stale
        h.node
            .handle_event(crate::event::Event::Timer(stale));
        assert!(!h.node.is_laggy());
    }

    #[test]
    fn test_tick_is_noop_while_laggy() {
        let mut h = Harness::new();
        h.node.init();
        let grace = h.node.config().beacon_grace();
        h.clock.advance(grace + Duration::from_secs(1));
        h.fire_timer(TimerKind::BeaconKiller);
        assert!(h.node.is_laggy());

        h.fire_timer(TimerKind::Tick);
        assert!(!h.calls_contain("locker.scatter_tick"));
        // but the tick rescheduled itself
        assert!(!h.armed_fires(TimerKind::Tick).is_empty());
    }

    #[test]
    fn test_request_state_rides_a_beacon() {
        let mut h = Harness::new();
        h.node.init();
        h.transport.clear();
        h.node.request_state(NodeState::Active);
        let beacons = h.sent_beacons();
        assert_eq!(beacons.len(), 1);
        match &beacons[0].0.msg {
            Message::Beacon { state, .. } => assert_eq!(*state, NodeState::Active),
            other => panic!("expected beacon, got {}", other.type_name()),
        }
        assert_eq!(h.node.want_state(), NodeState::Active);
    }
}
