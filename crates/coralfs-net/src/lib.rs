//! CoralFS TCP transport
//!
//! Length-prefixed JSON frames over TCP: a 4-byte little-endian length
//! followed by one serialized [`Envelope`]. One writer task per outbound
//! peer, one reader task per accepted connection. Connection-level events
//! (delivery failure, peer reset) are surfaced through the same sink that
//! delivers inbound envelopes, so the node core sees a single ordered
//! stream.

pub mod frame;
pub mod tcp;

pub use tcp::{NetEvent, TcpTransport};
