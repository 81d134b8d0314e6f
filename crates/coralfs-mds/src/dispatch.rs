//! Message dispatch fabric
//!
//! Every inbound message runs the same pipeline: protocol-version gates
//! scoped by source class, the imposter filter for peer sources, laggy
//! deferral, routing by port, and the post-dispatch drain (deferred
//! continuations, journal and cache trim, shutdown passes).

use crate::node::MdsNode;
use crate::subsystems::{
    Balancer, Journal, Locker, MetaCache, Migrator, ObjectStoreClient, ServerSubsystem,
    TableClient, TableServer,
};
use coralfs_msg::{
    Envelope, Message, Port, CLIENT_PROTOCOL, MDS_PROTOCOL, MON_PROTOCOL, OSD_PROTOCOL,
};
use std::sync::atomic::Ordering;
use tracing::{debug, info, trace, warn};

impl MdsNode {
    /// Entry point for every inbound message.
    pub(crate) fn dispatch(&mut self, env: Envelope) {
        self.metrics.dispatched.fetch_add(1, Ordering::Relaxed);

        // verify protocol versions, scoped by source class
        if env.from.is_mds() && env.header.mds != MDS_PROTOCOL {
            warn!(
                "mds protocol v{} != my v{MDS_PROTOCOL} from {}, dropping {}",
                env.header.mds,
                env.from,
                env.msg.type_name()
            );
            self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if env.header.client != CLIENT_PROTOCOL {
            warn!(
                "client protocol v{} != my v{CLIENT_PROTOCOL} from {}, dropping {}",
                env.header.client,
                env.from,
                env.msg.type_name()
            );
            self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if env.from.is_mon() && env.header.mon != MON_PROTOCOL {
            warn!(
                "mon protocol v{} != my v{MON_PROTOCOL} from {}, dropping {}",
                env.header.mon,
                env.from,
                env.msg.type_name()
            );
            self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if env.from.is_osd() && env.header.osd != OSD_PROTOCOL {
            warn!(
                "osd protocol v{} != my v{OSD_PROTOCOL} from {}, dropping {}",
                env.header.osd,
                env.from,
                env.msg.type_name()
            );
            self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.dispatch_inner(env);
    }

    /// Post-gate pipeline; also the re-entry point for messages that were
    /// deferred while laggy.
    pub(crate) fn dispatch_inner(&mut self, env: Envelope) {
        // from a bad peer?
        if let Some(from) = env.from.mds_rank() {
            let inst_matches = self.mdsmap.get_inst(from) == Some(env.inst);
            let genuine = inst_matches && !self.mdsmap.is_down(from);
            if !genuine {
                match &env.msg {
                    Message::MdsMap { .. } => {
                        debug!(
                            "got map from old/imposter mds.{from}, looking at it anyway"
                        );
                    }
                    Message::CacheExpire { .. } if inst_matches => {
                        // a down peer flushing its replicas on the way out
                        debug!("got cache_expire from down mds.{from}, looking at it");
                    }
                    _ => {
                        debug!(
                            "dropping {} from down/old/imposter mds.{from}",
                            env.msg.type_name()
                        );
                        self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
            }
        }

        match &env.msg {
            Message::MdsMap { .. } => self.handle_mds_map(env),
            Message::Beacon { .. } => self.handle_beacon_ack(env),
            Message::MonCommand { cmd } => {
                let cmd = cmd.clone();
                info!("applying monitor option {cmd:?}");
                if let Err(e) = self.cfg.apply_option(&cmd) {
                    warn!("bad monitor option: {e}");
                }
            }
            _ => {
                if self.laggy {
                    debug!("laggy, deferring {}", env.msg.type_name());
                    self.metrics.deferred.fetch_add(1, Ordering::Relaxed);
                    self.waiting_for_nolaggy
                        .push(Box::new(move |n, _| n.dispatch_inner(env)));
                } else {
                    self.route(env);
                }
            }
        }

        if self.laggy || self.is_dead() {
            return;
        }

        // finish anything deferred during this dispatch
        self.run_finished();
        if self.is_dead() {
            return;
        }

        if self.is_active() || self.is_stopping() {
            let (subsys, _ctx) = self.split();
            subsys.journal.trim();
            subsys.cache.trim();
            subsys.cache.trim_client_leases();
        }

        if self.is_stopping() {
            let drained = {
                let (subsys, mut ctx) = self.split();
                subsys.cache.shutdown_pass(&mut ctx)
            };
            if drained {
                debug!("shutdown_pass complete, moving to stopped");
                self.stopping_done();
            }
        }
    }

    fn route(&mut self, env: Envelope) {
        match env.msg.port() {
            Port::Control => {
                // control messages were matched above; anything else here
                // has no business arriving inbound
                warn!("unexpected control message {}", env.msg.type_name());
            }
            Port::Cache => {
                let (subsys, mut ctx) = self.split();
                subsys.cache.dispatch(&mut ctx, env);
            }
            Port::Locker => {
                let (subsys, mut ctx) = self.split();
                subsys.locker.dispatch(&mut ctx, env);
            }
            Port::Migrator => {
                let (subsys, mut ctx) = self.split();
                subsys.migrator.dispatch(&mut ctx, env);
            }
            Port::Server => {
                let (subsys, mut ctx) = self.split();
                subsys.server.dispatch(&mut ctx, env);
            }
            Port::Balancer => {
                let (subsys, mut ctx) = self.split();
                subsys.balancer.dispatch(&mut ctx, env);
            }
            Port::Table => {
                let Message::TableRequest { table, op, .. } = &env.msg else {
                    return;
                };
                let (table, op) = (*table, *op);
                let (subsys, mut ctx) = self.split();
                if op < 0 {
                    subsys.table_client(table).handle_request(&mut ctx, env);
                } else {
                    subsys.table_server(table).handle_request(&mut ctx, env);
                }
            }
            Port::ObjectStore => {
                let is_map = matches!(env.msg, Message::OsdMapUpdate { .. });
                {
                    let (subsys, mut ctx) = self.split();
                    if is_map {
                        subsys.osdc.handle_map(&mut ctx, env);
                    } else {
                        subsys.osdc.handle_op_reply(&mut ctx, env);
                    }
                }
                if is_map && self.is_active() {
                    let (subsys, mut ctx) = self.split();
                    subsys.snap_server.check_osd_map(&mut ctx, true);
                }
            }
        }
        trace!("routed");
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::Harness;
    use bytes::Bytes;
    use coralfs_common::{NodeState, Rank};
    use coralfs_msg::{ClientOp, Message, TableKind};
    use std::sync::atomic::Ordering;
    use uuid::Uuid;

    #[test]
    fn test_protocol_mismatch_is_dropped() {
        let mut h = Harness::new();
        h.node.init();
        h.apply_map(&h.map_builder(1, &[(0, NodeState::Active), (1, NodeState::Active)]));

        let mut env = h.peer_env(
            1,
            Message::Heartbeat {
                load: 1,
                data: Bytes::new(),
            },
        );
        env.header.mds = 99;
        h.deliver(env);
        assert!(!h.calls_contain("balancer.dispatch"));

        let mut env = h.client_request_env(5, 1, ClientOp::Getattr);
        env.header.client = 0;
        h.deliver(env);
        assert!(!h.calls_contain("server.dispatch"));
        assert_eq!(h.node.metrics().dropped.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_imposter_filter() {
        let mut h = Harness::new();
        h.node.init();
        let mut map = h.map_builder(1, &[(0, NodeState::Active), (1, NodeState::Active)]);
        // rank 2 stopped cleanly; its instance stays in the map
        map.set_rank(
            Rank::new(2),
            NodeState::Stopped,
            h.peer_inst(2),
            coralfs_common::Incarnation::new(1),
        );
        h.apply_map(&map);

        // peer message with the wrong nonce: an imposter, dropped
        let mut env = h.peer_env(1, Message::Resolve { data: Bytes::new() });
        env.inst.nonce += 1;
        h.deliver(env);
        assert!(!h.calls_contain("cache.dispatch:resolve"));
        assert_eq!(h.node.metrics().dropped.load(Ordering::Relaxed), 1);

        // a map from a mismatched instance is still looked at
        let mut newer = h.map_builder(2, &[(0, NodeState::Active), (1, NodeState::Active)]);
        newer.set_rank(
            Rank::new(2),
            NodeState::Stopped,
            h.peer_inst(2),
            coralfs_common::Incarnation::new(1),
        );
        let mut env = h.peer_env(
            1,
            Message::MdsMap {
                fsid: Uuid::nil(),
                epoch: newer.epoch(),
                data: Bytes::from(newer.encode()),
            },
        );
        env.inst.nonce += 1;
        h.deliver(env);
        assert_eq!(h.node.metrics().maps_applied.load(Ordering::Relaxed), 2);

        // cache_expire from a down peer whose instance matches is let in
        let env = h.peer_env(2, Message::CacheExpire { data: Bytes::new() });
        h.deliver(env);
        assert!(h.calls_contain("cache.dispatch:cache_expire"));

        // but not from a down peer with the wrong instance
        let mut env = h.peer_env(2, Message::CacheExpire { data: Bytes::new() });
        env.inst.nonce += 1;
        h.deliver(env);
        assert_eq!(h.call_count("cache.dispatch:cache_expire"), 1);
    }

    #[test]
    fn test_routing_by_port() {
        let mut h = Harness::new();
        h.node.init();
        h.apply_map(&h.map_builder(1, &[(0, NodeState::Active), (1, NodeState::Active)]));

        h.deliver(h.peer_env(1, Message::Discover { data: Bytes::new() }));
        assert!(h.calls_contain("cache.dispatch:discover"));

        h.deliver(h.peer_env(1, Message::LockMsg { data: Bytes::new() }));
        assert!(h.calls_contain("locker.dispatch"));

        h.deliver(h.peer_env(1, Message::ExportDiscover { data: Bytes::new() }));
        assert!(h.calls_contain("migrator.dispatch"));

        h.deliver(h.client_request_env(5, 1, ClientOp::Getattr));
        assert!(h.calls_contain("server.dispatch"));

        h.deliver(h.peer_env(
            1,
            Message::Heartbeat {
                load: 1,
                data: Bytes::new(),
            },
        ));
        assert!(h.calls_contain("balancer.dispatch"));

        // positive table op goes to the server, negative to the client
        h.deliver(h.peer_env(
            1,
            Message::TableRequest {
                table: TableKind::Anchor,
                op: 1,
                data: Bytes::new(),
            },
        ));
        assert!(h.calls_contain("anchor_server.handle_request"));
        h.deliver(h.peer_env(
            1,
            Message::TableRequest {
                table: TableKind::Snap,
                op: -2,
                data: Bytes::new(),
            },
        ));
        assert!(h.calls_contain("snap_client.handle_request"));

        h.deliver(h.osd_env(Message::OsdOpReply { data: Bytes::new() }));
        assert!(h.calls_contain("osdc.handle_op_reply"));

        // an object-store map additionally re-checks the snap subsystem
        h.deliver(h.osd_env(Message::OsdMapUpdate {
            epoch: coralfs_common::Epoch::new(9),
            data: Bytes::new(),
        }));
        assert!(h.calls_contain("osdc.handle_map"));
        assert!(h.calls_contain("snap_server.check_osd_map"));
    }

    #[test]
    fn test_forward_non_idempotent_drops_local_copy() {
        let mut h = Harness::new();
        h.node.init();
        h.apply_map(&h.map_builder(1, &[(0, NodeState::Active), (2, NodeState::Active)]));
        h.transport.clear();

        let env = h.client_request_env(5, 42, ClientOp::Rename);
        h.node.forward_message_mds(env, Rank::new(2));

        let sent = h.transport.sent_messages();
        let directives: Vec<_> = sent
            .iter()
            .filter(|(env, _)| matches!(env.msg, Message::ClientForward { .. }))
            .collect();
        assert_eq!(directives.len(), 1);
        match &directives[0].0.msg {
            Message::ClientForward {
                tid,
                target,
                num_fwd,
                must_resend,
            } => {
                assert_eq!(*tid, 42);
                assert_eq!(*target, Rank::new(2));
                assert_eq!(*num_fwd, 1);
                assert!(*must_resend);
            }
            _ => unreachable!(),
        }
        assert_eq!(directives[0].1, h.client_inst(5));
        // no transport-level forward happened
        assert!(h.transport.forwarded_messages().is_empty());
    }

    #[test]
    fn test_forward_idempotent_ships_map_then_request() {
        let mut h = Harness::new();
        h.node.init();
        h.apply_map(&h.map_builder(1, &[(0, NodeState::Active), (2, NodeState::Active)]));
        h.transport.clear();

        let env = h.client_request_env(5, 43, ClientOp::Getattr);
        h.node.forward_message_mds(env, Rank::new(2));

        // the peer had never seen our map: it is shipped before the request
        let sent = h.transport.sent_messages();
        assert!(sent
            .iter()
            .any(|(env, to)| matches!(env.msg, Message::MdsMap { .. }) && *to == h.peer_inst(2)));
        let forwarded = h.transport.forwarded_messages();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].1, h.peer_inst(2));
        match &forwarded[0].0.msg {
            Message::ClientRequest { num_fwd, .. } => assert_eq!(*num_fwd, 1),
            _ => unreachable!(),
        }

        // a second send to the same peer needs no map
        h.transport.clear();
        h.node
            .send_message_mds(Message::Resolve { data: Bytes::new() }, Rank::new(2));
        let sent = h.transport.sent_messages();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].0.msg, Message::Resolve { .. }));
    }

    #[test]
    fn test_mon_command_applies_config() {
        let mut h = Harness::new();
        h.node.init();
        h.deliver(h.mon_env(Message::MonCommand {
            cmd: "beacon_grace_ms=30000".into(),
        }));
        assert_eq!(h.node.config().beacon_grace_ms, 30_000);

        // a bad option is logged and ignored
        h.deliver(h.mon_env(Message::MonCommand {
            cmd: "nonsense".into(),
        }));
        assert_eq!(h.node.config().beacon_grace_ms, 30_000);
    }

    #[test]
    fn test_stopping_drains_then_requests_stopped() {
        let mut h = Harness::new();
        h.node.init();
        h.apply_map(&h.map_builder(1, &[(0, NodeState::Active)]));
        h.apply_map(&h.map_builder(2, &[(0, NodeState::Stopping)]));
        assert!(h.calls_contain("cache.shutdown_start"));
        assert!(h.calls_contain("server.terminate_sessions"));
        assert_eq!(h.node.want_state(), NodeState::Stopping);

        // cache reports drained on the next dispatch
        h.shutdown_ready.store(true, Ordering::SeqCst);
        h.deliver(h.mon_env(Message::MonCommand {
            cmd: "tick_interval_ms=5000".into(),
        }));
        assert_eq!(h.node.want_state(), NodeState::Stopped);
    }
}
