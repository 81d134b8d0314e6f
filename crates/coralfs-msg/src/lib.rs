//! CoralFS protocol messages
//!
//! Every message travelling between daemons is one variant of [`Message`],
//! wrapped in an [`Envelope`] carrying the sender's name, transport
//! instance, and per-source-class protocol versions. The node core routes
//! by [`Port`], the coarse subsystem classification of a message.

pub mod message;
pub mod transport;

pub use message::{
    ClientOp, Envelope, Header, Message, Port, SessionOp, TableKind, CLIENT_PROTOCOL, MDS_PROTOCOL,
    MON_PROTOCOL, OSD_PROTOCOL,
};
pub use transport::Transport;
