//! CoralFS Common - Shared types and utilities
//!
//! This crate provides the identity types, error definitions, runtime
//! configuration, and clock abstraction used across all CoralFS metadata
//! server components.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, Stamp, SystemClock};
pub use config::MdsConfig;
pub use error::{Error, Result};
pub use types::*;
