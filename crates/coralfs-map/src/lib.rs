//! CoralFS map types
//!
//! The cluster map (`MdsMap`) names every metadata server slot, its state,
//! its transport instance, and its incarnation; the monitor map (`MonMap`)
//! names the monitor quorum. Both are produced by the monitors and consumed
//! read-only by the node core.

pub mod mdsmap;
pub mod monmap;

pub use mdsmap::{MdsMap, RankEntry};
pub use monmap::MonMap;
