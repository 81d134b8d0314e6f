//! Cluster-map reactor
//!
//! Every inbound map passes through here exactly once. The reactor gates
//! on freshness, re-derives our own identity from the map, applies our
//! state delta (running the entry action for any new state), and then
//! diffs the peer sets of the old and new maps to fire per-peer side
//! effects. The previous map lives only for the duration of one reaction.

use crate::node::MdsNode;
use crate::subsystems::{MetaCache, Migrator, ObjectStoreClient};
use coralfs_common::{EntityName, NodeState, Rank};
use coralfs_map::MdsMap;
use coralfs_msg::{Envelope, Message, Transport};
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

impl MdsNode {
    pub(crate) fn handle_mds_map(&mut self, env: Envelope) {
        let Message::MdsMap { epoch, data, .. } = env.msg else {
            return;
        };
        debug!("handle_mds_map epoch {epoch} from {}", env.from);

        // note the sender's map version
        if let Some(peer) = env.from.mds_rank() {
            let known = self.peer_epochs.entry(peer).or_default();
            if *known < epoch {
                *known = epoch;
            }
        }

        // freshness gate
        if epoch <= self.mdsmap.epoch() {
            debug!(
                "old map epoch {epoch} <= {}, discarding",
                self.mdsmap.epoch()
            );
            return;
        }

        let newmap = match MdsMap::decode(&data) {
            Ok(m) => m,
            Err(e) => {
                warn!("undecodable cluster map from {}: {e}", env.from);
                return;
            }
        };
        self.metrics.maps_applied.fetch_add(1, Ordering::Relaxed);

        // keep the old map for diffing, for the duration of this reaction
        let oldmap = std::mem::replace(&mut self.mdsmap, newmap);
        let oldwhoami = self.whoami;
        let oldstate = self.state;

        // identity reassessment: who am i in this map?
        let myaddr = self.my_inst.addr;
        self.whoami = self.mdsmap.get_addr_rank(&myaddr);
        let Some(whoami) = self.whoami else {
            if self.mdsmap.is_standby(&myaddr) {
                if self.state != NodeState::Standby {
                    self.state = NodeState::Standby;
                    self.want_state = NodeState::Standby;
                    self.metrics.set_state(NodeState::Standby.name());
                    info!("handle_mds_map: standby");
                }
            } else {
                warn!("i ({myaddr}) am not in the cluster map, killing myself");
                self.suicide();
            }
            return;
        };

        // adopt per-rank telemetry identity
        if self.mdsmap.is_up(whoami) && oldwhoami != Some(whoami) {
            self.metrics.set_rank(whoami, self.mdsmap.get_inc(whoami));
        }

        if oldwhoami != Some(whoami) {
            info!(
                "i am now mds.{whoami} incarnation {}",
                self.mdsmap.get_inc(whoami)
            );
            self.my_name = EntityName::Mds(Some(whoami));
            self.transport.reset_local_name(self.my_name);

            if oldwhoami.is_none() {
                // we need an object-store map too
                let mon = self.monmap.pick_mon(0);
                let fsid = self.monmap.fsid;
                let have = self.subsys.osdc.osdmap_epoch();
                self.send_mon(Message::OsdGetMap { fsid, have }, mon);
            }
        }

        // publish our incarnation to the object-store client, and fence
        // writes from previous incarnations at the last failure epoch
        if self.subsys.osdc.incarnation().is_none() && self.mdsmap.have_inst(whoami) {
            let inc = self.mdsmap.get_inc(whoami);
            debug_assert!(inc.as_u32() > 0);
            self.subsys.osdc.set_incarnation(inc);
        }
        self.subsys.osdc.set_inc_fence(self.mdsmap.last_failure());

        // state delta
        self.state = self.mdsmap.state_of(whoami);
        if oldstate != self.state {
            info!("handle_mds_map state change {oldstate} --> {}", self.state);
            self.want_state = self.state;
            self.metrics.set_state(self.state.name());

            match self.state {
                NodeState::Active => {
                    // did i just recover?
                    if oldstate == NodeState::Rejoin || oldstate == NodeState::Reconnect {
                        self.recovery_done();
                    }
                    // kick waiters
                    for c in self.take_waiting_for_active() {
                        c(self, Ok(()));
                    }
                }
                NodeState::Replay => self.replay_start(),
                NodeState::Resolve => self.resolve_start(),
                NodeState::Reconnect => self.reconnect_start(),
                NodeState::Creating => self.boot_create(),
                NodeState::Starting => self.boot_start(crate::boot::BootStep::Open, Ok(())),
                NodeState::Stopping => {
                    debug_assert_eq!(oldstate, NodeState::Active);
                    self.stopping_start();
                }
                NodeState::Stopped => {
                    debug_assert_eq!(oldstate, NodeState::Stopping);
                    self.suicide();
                    return;
                }
                _ => {}
            }
            if self.is_dead() {
                return;
            }
        }

        // is someone else newly resolving?
        if matches!(
            self.state,
            NodeState::Resolve | NodeState::Rejoin | NodeState::Active | NodeState::Stopping
        ) {
            let oldresolve = oldmap.get_mds_set(NodeState::Resolve);
            let resolve = self.mdsmap.get_mds_set(NodeState::Resolve);
            if oldresolve != resolve {
                debug!("resolve set is {resolve:?}, was {oldresolve:?}");
                let newly: Vec<Rank> = resolve.difference(&oldresolve).copied().collect();
                let me = self.whoami;
                let (subsys, mut ctx) = self.split();
                for p in newly {
                    if Some(p) != me {
                        subsys.cache.send_resolve(&mut ctx, p);
                    }
                }
            }
        }

        // is everybody finally rejoining?
        if matches!(
            self.state,
            NodeState::Rejoin | NodeState::Active | NodeState::Stopping
        ) && !oldmap.is_rejoining()
            && self.mdsmap.is_rejoining()
        {
            self.rejoin_joint_start();
        }
        if oldmap.is_degraded()
            && !self.mdsmap.is_degraded()
            && matches!(self.state, NodeState::Active | NodeState::Stopping)
        {
            info!("cluster recovered.");
        }

        // did someone go active?
        if matches!(self.state, NodeState::Active | NodeState::Stopping) {
            let oldactive = oldmap.get_mds_set(NodeState::Active);
            let active = self.mdsmap.get_mds_set(NodeState::Active);
            let newly: Vec<Rank> = active
                .difference(&oldactive)
                .copied()
                .filter(|p| Some(*p) != self.whoami)
                .collect();
            for p in newly {
                self.handle_mds_recovery(p);
            }
        }

        // did someone fail? processed in every state: a missed failure
        // would leave dangling cache state behind
        {
            let oldfailed = oldmap.get_mds_set(NodeState::Failed);
            let failed = self.mdsmap.get_mds_set(NodeState::Failed);
            let newly: Vec<Rank> = failed.difference(&oldfailed).copied().collect();

            // also: any up peer whose instance changed between maps was
            // down and came back without us noticing
            let restarted: Vec<Rank> = self
                .mdsmap
                .get_up_mds_set()
                .into_iter()
                .filter(|p| {
                    oldmap.have_inst(*p) && oldmap.get_inst(*p) != self.mdsmap.get_inst(*p)
                })
                .collect();

            let (subsys, mut ctx) = self.split();
            for p in newly {
                subsys.cache.handle_mds_failure(&mut ctx, p);
            }
            for p in restarted {
                subsys.cache.handle_mds_failure(&mut ctx, p);
            }
        }

        // did anyone stop?
        if matches!(self.state, NodeState::Active | NodeState::Stopping) {
            let oldstopped = oldmap.get_mds_set(NodeState::Stopped);
            let stopped = self.mdsmap.get_mds_set(NodeState::Stopped);
            let newly: Vec<Rank> = stopped.difference(&oldstopped).copied().collect();
            let (subsys, mut ctx) = self.split();
            for p in newly {
                subsys.migrator.handle_peer_stop(&mut ctx, p);
            }
        }
        // oldmap dropped here
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::Harness;
    use coralfs_common::{Incarnation, NodeState, Rank};
    use coralfs_msg::Message;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_stale_map_is_discarded() {
        let mut h = Harness::new();
        h.node.init();
        h.apply_map(&h.map_builder(5, &[(0, NodeState::Active)]));
        assert_eq!(h.node.state(), NodeState::Active);

        h.apply_map(&h.map_builder(4, &[(0, NodeState::Stopping)]));
        assert_eq!(h.node.state(), NodeState::Active);
        assert_eq!(h.node.metrics().maps_applied.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_standby_listing_parks_the_node() {
        let mut h = Harness::new();
        h.node.init();
        let mut map = h.map_builder(1, &[]);
        map.add_standby(h.transport.local_inst_raw());
        h.apply_map(&map);
        assert_eq!(h.node.state(), NodeState::Standby);
        assert_eq!(h.node.want_state(), NodeState::Standby);
        assert!(!h.node.is_dead());
    }

    #[test]
    fn test_eviction_from_map_is_fatal() {
        let mut h = Harness::new();
        h.node.init();
        h.apply_map(&h.map_builder(1, &[(0, NodeState::Active)]));
        // next map has neither our rank nor a standby listing for us
        h.apply_map(&h.map_builder(2, &[(1, NodeState::Active)]));
        assert!(h.node.is_dead());
        assert!(h.calls_contain("cache.shutdown"));
        assert!(h.calls_contain("osdc.shutdown"));
    }

    #[test]
    fn test_rank_adoption_requests_object_store_map() {
        let mut h = Harness::new();
        h.node.init();
        h.transport.clear();
        h.apply_map(&h.map_builder(1, &[(0, NodeState::Creating)]));

        assert_eq!(h.node.whoami(), Some(Rank::new(0)));
        assert!(h
            .transport
            .sent_messages()
            .iter()
            .any(|(env, _)| matches!(env.msg, Message::OsdGetMap { .. })));
        // incarnation published to the object-store client
        assert_eq!(h.osdc_incarnation(), Some(Incarnation::new(1)));
    }

    #[test]
    fn test_newly_resolving_peer_gets_resolve() {
        let mut h = Harness::new();
        h.node.init();
        h.apply_map(&h.map_builder(1, &[(0, NodeState::Active), (1, NodeState::Replay)]));
        h.transport.clear();
        h.apply_map(&h.map_builder(2, &[(0, NodeState::Active), (1, NodeState::Resolve)]));

        let resolves: Vec<_> = h
            .transport
            .sent_messages()
            .into_iter()
            .filter(|(env, _)| matches!(env.msg, Message::Resolve { .. }))
            .collect();
        assert_eq!(resolves.len(), 1);
        assert_eq!(resolves[0].1, h.peer_inst(1));
    }

    #[test]
    fn test_joint_rejoin_fires_once_per_recovering_peer() {
        let mut h = Harness::new();
        h.node.init();
        h.apply_map(&h.map_builder(
            1,
            &[
                (0, NodeState::Active),
                (1, NodeState::Rejoin),
                (2, NodeState::Replay),
            ],
        ));
        assert!(!h.calls_contain("cache.rejoin_send_rejoins"));

        // everyone caught up to rejoin: the joint start fires
        h.apply_map(&h.map_builder(
            2,
            &[
                (0, NodeState::Active),
                (1, NodeState::Rejoin),
                (2, NodeState::Rejoin),
            ],
        ));
        assert_eq!(h.call_count("cache.rejoin_send_rejoins"), 1);

        // park work on both peers, then watch them go active one by one
        let hit = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        for peer in [1u32, 2] {
            let hit = std::sync::Arc::clone(&hit);
            h.node.wait_for_active_peer(
                Rank::new(peer),
                Box::new(move |_, _| {
                    hit.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        h.apply_map(&h.map_builder(
            3,
            &[
                (0, NodeState::Active),
                (1, NodeState::Active),
                (2, NodeState::Rejoin),
            ],
        ));
        assert_eq!(h.call_count("cache.handle_mds_recovery:1"), 1);
        assert_eq!(hit.load(Ordering::SeqCst), 1);
        assert!(!h.node.has_waiters_for_peer(Rank::new(1)));

        h.apply_map(&h.map_builder(
            4,
            &[
                (0, NodeState::Active),
                (1, NodeState::Active),
                (2, NodeState::Active),
            ],
        ));
        assert_eq!(h.call_count("cache.handle_mds_recovery:1"), 1);
        assert_eq!(h.call_count("cache.handle_mds_recovery:2"), 1);
        assert_eq!(hit.load(Ordering::SeqCst), 2);
        assert!(!h.node.has_waiters_for_peer(Rank::new(2)));
    }

    #[test]
    fn test_peer_failure_processed_in_every_state() {
        let mut h = Harness::new();
        h.node.init();
        // we are still in replay when the peer fails
        h.apply_map(&h.map_builder(1, &[(0, NodeState::Replay), (1, NodeState::Active)]));
        let mut map = h.map_builder(2, &[(0, NodeState::Replay)]);
        map.set_failed(Rank::new(1));
        h.apply_map(&map);
        assert_eq!(h.call_count("cache.handle_mds_failure:1"), 1);
    }

    #[test]
    fn test_instance_change_counts_as_failure() {
        let mut h = Harness::new();
        h.node.init();
        h.apply_map(&h.map_builder(1, &[(0, NodeState::Active), (1, NodeState::Active)]));
        // same rank, same state, new nonce: the peer restarted behind our back
        let mut map = h.map_builder(2, &[(0, NodeState::Active)]);
        let mut inst = h.peer_inst(1);
        inst.nonce += 1;
        map.set_rank(
            Rank::new(1),
            NodeState::Active,
            inst,
            Incarnation::new(2),
        );
        h.apply_map(&map);
        assert_eq!(h.call_count("cache.handle_mds_failure:1"), 1);
    }

    #[test]
    fn test_stopped_peer_notifies_migrator() {
        let mut h = Harness::new();
        h.node.init();
        h.apply_map(&h.map_builder(1, &[(0, NodeState::Active), (1, NodeState::Stopping)]));
        h.apply_map(&h.map_builder(2, &[(0, NodeState::Active), (1, NodeState::Stopped)]));
        assert_eq!(h.call_count("migrator.handle_peer_stop:1"), 1);
    }

    #[test]
    fn test_recovery_done_broadcasts_map_to_sessions() {
        let mut h = Harness::new();
        h.node.init();
        let client_inst = h.open_session(77);
        h.apply_map(&h.map_builder(1, &[(0, NodeState::Reconnect)]));
        h.transport.clear();
        h.apply_map(&h.map_builder(2, &[(0, NodeState::Active)]));

        // reconnect -> active runs recovery_done: tables kicked, purges
        // started, clients told about the new map
        assert!(h.calls_contain("anchor_server.finish_recovery"));
        assert!(h.calls_contain("anchor_client.finish_recovery"));
        assert!(h.calls_contain("cache.start_recovered_purges"));
        let maps_to_client: Vec<_> = h
            .transport
            .sent_messages()
            .into_iter()
            .filter(|(env, to)| matches!(env.msg, Message::MdsMap { .. }) && *to == client_inst)
            .collect();
        assert_eq!(maps_to_client.len(), 1);
        assert_eq!(
            h.node.last_client_map_bcast(),
            coralfs_common::Epoch::new(2)
        );
    }

    #[test]
    fn test_stopped_placement_is_terminal() {
        let mut h = Harness::new();
        h.node.init();
        h.apply_map(&h.map_builder(1, &[(0, NodeState::Active)]));
        h.apply_map(&h.map_builder(2, &[(0, NodeState::Stopping)]));
        assert!(h.calls_contain("cache.shutdown_start"));
        h.apply_map(&h.map_builder(3, &[(0, NodeState::Stopped)]));
        assert!(h.node.is_dead());
    }
}
