//! Events consumed by the node loop
//!
//! Everything that can happen to the node arrives here: an inbound
//! envelope, a timer firing, an asynchronous subsystem operation
//! completing, a subsystem signalling a lifecycle milestone, or the
//! transport reporting a connection-level event.

use coralfs_common::{Error, Inst};
use coralfs_msg::Envelope;
use std::net::SocketAddr;
use tokio::sync::mpsc::UnboundedSender;

/// Sender half of the node's event channel.
pub type EventSender = UnboundedSender<Event>;

/// The three named single-shot timers of the core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Periodic housekeeping
    Tick,
    /// Next beacon emission
    BeaconSender,
    /// Liveness deadline: fires when the beacon grace expires
    BeaconKiller,
}

/// One scheduled firing of a named timer. The generation makes
/// cancel-on-rearm exact: a fire whose generation is stale is ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerFire {
    pub kind: TimerKind,
    pub generation: u64,
}

/// Identifies one outstanding asynchronous subsystem operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OpToken(pub(crate) u64);

/// Lifecycle milestones subsystems report back to the node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    /// Every recovering peer has answered our resolve
    ResolveDone,
    /// Every surviving client has reattached (or been abandoned)
    ReconnectDone,
    /// The joint rejoin handshake has completed
    RejoinDone,
}

/// An event for the node loop.
#[derive(Debug)]
pub enum Event {
    /// A message from the transport
    Inbound(Box<Envelope>),
    /// A named timer fired
    Timer(TimerFire),
    /// An asynchronous subsystem operation finished
    Completed(OpToken, Result<(), Error>),
    /// A subsystem reported a lifecycle milestone
    Signal(Signal),
    /// A queued send could not be delivered
    TransportFailure { peer: Inst },
    /// A peer connection closed cleanly
    TransportReset { addr: SocketAddr },
    /// A peer tore its connection down from the remote side
    TransportRemoteReset { addr: SocketAddr },
    /// External request to stop (e.g. ctrl-c)
    Shutdown,
}

/// Handed to a subsystem alongside an asynchronous operation; completing it
/// posts the result back into the node loop. Completions are never run
/// inline, so a subsystem may complete from any task without reordering the
/// core.
#[derive(Clone)]
pub struct Completer {
    token: OpToken,
    tx: EventSender,
}

impl Completer {
    pub(crate) fn new(token: OpToken, tx: EventSender) -> Self {
        Self { token, tx }
    }

    /// Report the operation's outcome.
    pub fn complete(self, r: Result<(), Error>) {
        // the node may already be gone; a dropped completion is fine then
        let _ = self.tx.send(Event::Completed(self.token, r));
    }
}

impl std::fmt::Debug for Completer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Completer({:?})", self.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_completer_posts_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let c = Completer::new(OpToken(7), tx);
        c.complete(Ok(()));
        match rx.try_recv().unwrap() {
            Event::Completed(tok, Ok(())) => assert_eq!(tok, OpToken(7)),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_completer_tolerates_closed_channel() {
        let (tx, rx) = mpsc::unbounded_channel::<Event>();
        drop(rx);
        Completer::new(OpToken(1), tx).complete(Err(Error::Canceled));
    }
}
