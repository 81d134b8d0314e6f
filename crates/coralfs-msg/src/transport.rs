//! The transport seam
//!
//! The node core sends through this trait and never sees sockets. Inbound
//! envelopes and connection-level events (failure, reset, remote reset) are
//! delivered out of band by the transport implementation, as events on the
//! node's channel.

use crate::message::Envelope;
use coralfs_common::{EntityName, Inst};

/// Outbound half of the messenger.
pub trait Transport: Send + Sync {
    /// Queue a message for delivery to an instance. Delivery is
    /// best-effort; failures surface through the transport failure hook.
    fn send(&self, env: Envelope, to: &Inst);

    /// Re-address a message on behalf of its original sender, preserving
    /// the original source identity.
    fn forward(&self, env: Envelope, to: &Inst);

    /// Adopt a new logical name, e.g. when the monitor assigns a rank.
    fn reset_local_name(&self, name: EntityName);

    /// The instance identity peers reach this daemon at.
    fn local_inst(&self) -> Inst;

    /// Stop accepting and delivering traffic. Idempotent.
    fn shutdown(&self);
}
