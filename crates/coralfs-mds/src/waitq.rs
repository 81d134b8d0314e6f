//! Deferred continuations and gather barriers
//!
//! The core never blocks. Work that must wait (for a state, for liveness,
//! for a peer, for N sub-operations) is parked as a continuation and
//! resumed by a later event. A gather is an all-complete barrier: it runs
//! its continuation exactly once, after every registered sub-operation has
//! finished, carrying the first error observed if any.

use crate::node::MdsNode;
use coralfs_common::Error;

/// A parked unit of work, resumed with the outcome of whatever it was
/// waiting on.
pub type Continuation = Box<dyn FnOnce(&mut MdsNode, Result<(), Error>) + Send>;

/// A named queue of parked continuations.
#[derive(Default)]
pub struct WaitQueue {
    items: Vec<Continuation>,
}

impl WaitQueue {
    pub fn push(&mut self, c: Continuation) {
        self.items.push(c);
    }

    /// Remove and return everything queued.
    pub fn take(&mut self) -> Vec<Continuation> {
        std::mem::take(&mut self.items)
    }

    /// Consume the queue.
    #[must_use]
    pub fn into_items(self) -> Vec<Continuation> {
        self.items
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Identifies one gather barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GatherId(pub(crate) u64);

/// What an outstanding operation token resolves to.
pub(crate) enum PendingOp {
    /// Run this continuation with the completion's result
    Single(Continuation),
    /// Count down the named gather
    GatherSub(GatherId),
}

/// An all-complete barrier over N sub-operations.
pub(crate) struct Gather {
    pub remaining: usize,
    /// Set once sub-registration is finished; a gather never fires before
    /// it is armed
    pub armed: bool,
    pub first_err: Option<Error>,
    pub then: Option<Continuation>,
}

impl Gather {
    pub fn new(then: Continuation) -> Self {
        Self {
            remaining: 0,
            armed: false,
            first_err: None,
            then: Some(then),
        }
    }
}
