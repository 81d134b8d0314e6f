//! Boot sequencers
//!
//! Ordered barrier steps that bring a rank's persistent state online. Each
//! step issues asynchronous subsystem operations under a gather and
//! advances only when all of them have completed; any failed sub-operation
//! kills the node immediately.

use crate::node::MdsNode;
use crate::subsystems::{InodeTable, Journal, MetaCache, SessionTable, TableServer};
use coralfs_common::{Error, NodeState, Rank};
use tracing::{debug, error, info};

/// Where the startup sequencer is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BootStep {
    /// Load the inode allocator, session map, tables, and journal
    Open,
    /// The journal is open: replay it or position for append
    JournalReady,
    /// Replay finished (or was not needed): open the root if we host it
    Replayed,
    /// Root is open (or not ours): open the stray directory and finish
    RootOpened,
}

impl MdsNode {
    /// Advance the startup sequencer. `r` is the gathered outcome of the
    /// previous step's sub-operations.
    pub(crate) fn boot_start(&mut self, step: BootStep, r: Result<(), Error>) {
        if let Err(e) = r {
            error!("boot step failed: {e}, dying");
            self.suicide();
            return;
        }

        match step {
            BootStep::Open => {
                debug!("boot_start: opening inode table, session map, journal");
                let gather =
                    self.new_gather(Box::new(|n, r| n.boot_start(BootStep::JournalReady, r)));
                let c_inodes = self.gather_sub(gather);
                let c_sessions = self.gather_sub(gather);
                let is_tableserver = self.whoami == Some(self.mdsmap.get_tableserver());
                let c_anchor = is_tableserver.then(|| self.gather_sub(gather));
                let c_snap = is_tableserver.then(|| self.gather_sub(gather));
                let c_journal = self.gather_sub(gather);
                self.arm_gather(gather);

                let (subsys, mut ctx) = self.split();
                subsys.inotable.load(c_inodes);
                ctx.sessions().load(c_sessions);
                if let Some(c) = c_anchor {
                    debug!("boot_start: opening anchor table");
                    subsys.anchor_server.load(c);
                }
                if let Some(c) = c_snap {
                    debug!("boot_start: opening snap table");
                    subsys.snap_server.load(c);
                }
                subsys.journal.open(c_journal);
            }

            BootStep::JournalReady => {
                if self.is_replay() {
                    debug!("boot_start: replaying journal");
                    let done =
                        self.completer(Box::new(|n, r| n.boot_start(BootStep::Replayed, r)));
                    self.subsys.journal.replay(done);
                } else {
                    debug!("boot_start: positioning at end of journal");
                    self.subsys.journal.append();
                    self.boot_start(BootStep::Replayed, Ok(()));
                }
            }

            BootStep::Replayed => {
                if self.is_replay() {
                    self.replay_done();
                    return;
                }
                debug_assert!(self.is_starting());
                if self.whoami == Some(self.mdsmap.get_root()) {
                    debug!("boot_start: opening root directory");
                    let done =
                        self.completer(Box::new(|n, r| n.boot_start(BootStep::RootOpened, r)));
                    self.subsys.cache.open_root(done);
                } else {
                    self.boot_start(BootStep::RootOpened, Ok(()));
                }
            }

            BootStep::RootOpened => {
                debug!("boot_start: opening local stray directory");
                self.subsys.cache.open_local_stray();
                self.starting_done();
            }
        }
    }

    fn starting_done(&mut self) {
        info!("starting_done");
        debug_assert!(self.is_starting());
        self.request_state(NodeState::Active);
        self.subsys.journal.start_new_segment(None);
    }

    /// Write fresh on-disk state for a brand new rank: empty tables, a new
    /// journal with an initial segment, and (on rank 0) a fresh root
    /// directory.
    pub(crate) fn boot_create(&mut self) {
        info!("boot_create");
        let gather = self.new_gather(Box::new(|n, r| n.creating_done(r)));

        let c_root = (self.whoami == Some(Rank::new(0))).then(|| {
            info!("boot_create: i am also mds.0, creating root directory");
            self.gather_sub(gather)
        });
        let c_stray = self.gather_sub(gather);
        let c_journal = self.gather_sub(gather);
        let c_segment = self.gather_sub(gather);
        let c_inodes = self.gather_sub(gather);
        let c_sessions = self.gather_sub(gather);
        let is_tableserver = self.whoami == Some(self.mdsmap.get_tableserver());
        let c_anchor = is_tableserver.then(|| self.gather_sub(gather));
        let c_snap = is_tableserver.then(|| self.gather_sub(gather));
        self.arm_gather(gather);

        let (subsys, mut ctx) = self.split();
        if let Some(c) = c_root {
            subsys.cache.create_root(c);
        }
        debug!("boot_create: creating local stray directory");
        subsys.cache.create_stray(c_stray);

        debug!("boot_create: creating fresh journal");
        subsys.journal.create(c_journal);
        subsys.journal.start_new_segment(Some(c_segment));

        debug!("boot_create: creating fresh inode table");
        subsys.inotable.reset();
        subsys.inotable.save(c_inodes);

        ctx.sessions().save(c_sessions);

        if let Some(c) = c_anchor {
            debug!("boot_create: creating fresh anchor table");
            subsys.anchor_server.reset();
            subsys.anchor_server.save(c);
        }
        if let Some(c) = c_snap {
            debug!("boot_create: creating fresh snap table");
            subsys.snap_server.reset();
            subsys.snap_server.save(c);
        }
    }

    fn creating_done(&mut self, r: Result<(), Error>) {
        if let Err(e) = r {
            error!("boot_create failed: {e}, dying");
            self.suicide();
            return;
        }
        info!("creating_done");
        self.request_state(NodeState::Active);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use coralfs_msg::Message;

    #[test]
    fn test_starting_sequence_runs_to_active() {
        let mut h = Harness::new();
        h.node.init();
        let map = h.map_builder(1, &[(0, NodeState::Starting)]);
        h.apply_map(&map);
        assert_eq!(h.node.state(), NodeState::Starting);

        // step 1 issued loads for the inode table, sessions, both tables
        // (we are the tableserver), and the journal
        assert!(h.pends_contain("inotable.load"));
        assert!(h.pends_contain("anchor_server.load"));
        assert!(h.pends_contain("journal.open"));

        h.complete_all();
        // sessions completed through the stock table; journal positioned
        assert!(h.calls_contain("journal.append"));
        // we host the root, so it is opened before the stray
        assert!(h.pends_contain("cache.open_root"));

        h.complete_all();
        assert!(h.calls_contain("cache.open_local_stray"));
        assert!(h.calls_contain("journal.start_new_segment"));
        assert_eq!(h.node.want_state(), NodeState::Active);
    }

    #[test]
    fn test_replay_solo_moves_to_reconnect_without_resolves() {
        let mut h = Harness::new();
        h.node.init();
        let map = h.map_builder(1, &[(0, NodeState::Replay)]);
        h.apply_map(&map);

        h.complete_all(); // table loads + journal open
        assert!(h.pends_contain("journal.replay"));
        h.complete_all(); // replay finishes

        // alone in the map with no failures: reconnect, skipping resolve
        assert_eq!(h.node.want_state(), NodeState::Reconnect);
        assert!(h
            .transport
            .sent_messages()
            .iter()
            .all(|(env, _)| !matches!(env.msg, Message::Resolve { .. })));
    }

    #[test]
    fn test_replay_with_peers_moves_to_resolve() {
        let mut h = Harness::new();
        h.node.init();
        let map = h.map_builder(1, &[(0, NodeState::Replay), (1, NodeState::Replay)]);
        h.apply_map(&map);
        h.complete_all();
        h.complete_all();
        assert_eq!(h.node.want_state(), NodeState::Resolve);
    }

    #[test]
    fn test_boot_failure_is_fatal() {
        let mut h = Harness::new();
        h.node.init();
        let map = h.map_builder(1, &[(0, NodeState::Starting)]);
        h.apply_map(&map);
        h.fail_pending("journal.open", Error::io("lost disk"));
        h.complete_all();
        assert!(h.node.is_dead());
        assert!(h.calls_contain("cache.shutdown"));
    }

    #[test]
    fn test_create_sequence_builds_fresh_state() {
        let mut h = Harness::new();
        h.node.init();
        let map = h.map_builder(1, &[(0, NodeState::Creating)]);
        h.apply_map(&map);
        assert_eq!(h.node.state(), NodeState::Creating);

        // rank 0 creates the root; everyone creates a stray and a journal
        assert!(h.pends_contain("cache.create_root"));
        assert!(h.pends_contain("cache.create_stray"));
        assert!(h.pends_contain("journal.create"));
        assert!(h.pends_contain("journal.start_new_segment"));
        assert!(h.calls_contain("inotable.reset"));
        assert!(h.pends_contain("inotable.save"));
        // we are the tableserver: fresh anchor and snap tables
        assert!(h.calls_contain("anchor_server.reset"));
        assert!(h.pends_contain("snap_server.save"));

        h.complete_all();
        assert_eq!(h.node.want_state(), NodeState::Active);
    }
}
