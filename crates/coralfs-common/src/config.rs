//! Runtime configuration for the metadata server core
//!
//! The daemon binary layers a TOML file and CLI flags on top of these
//! defaults. A subset is tunable at runtime through the monitor command
//! channel, which delivers one `key=value` pair at a time.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunable options of the node core.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MdsConfig {
    /// Periodic tick interval (milliseconds)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Liveness beacon cadence (milliseconds)
    #[serde(default = "default_beacon_interval_ms")]
    pub beacon_interval_ms: u64,
    /// Grace window after which an unanswered beacon marks the node laggy
    /// (milliseconds)
    #[serde(default = "default_beacon_grace_ms")]
    pub beacon_grace_ms: u64,
    /// Terminate instead of deferring work when the beacon grace is
    /// exceeded. Off by default: a laggy node parks non-control work and
    /// recovers on the next acknowledgement.
    #[serde(default)]
    pub suicide_on_laggy: bool,
    /// Journal segments retained before trim reclaims the oldest
    #[serde(default = "default_journal_max_segments")]
    pub journal_max_segments: usize,
    /// Client sessions idle longer than this are candidates for eviction
    /// (milliseconds)
    #[serde(default = "default_session_idle_timeout_ms")]
    pub session_idle_timeout_ms: u64,
    /// How long the reconnect phase waits for absent clients before
    /// abandoning them (milliseconds)
    #[serde(default = "default_reconnect_timeout_ms")]
    pub reconnect_timeout_ms: u64,
}

fn default_tick_interval_ms() -> u64 {
    5_000
}

fn default_beacon_interval_ms() -> u64 {
    4_000
}

fn default_beacon_grace_ms() -> u64 {
    15_000
}

fn default_journal_max_segments() -> usize {
    32
}

fn default_session_idle_timeout_ms() -> u64 {
    60_000
}

fn default_reconnect_timeout_ms() -> u64 {
    45_000
}

impl Default for MdsConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            beacon_interval_ms: default_beacon_interval_ms(),
            beacon_grace_ms: default_beacon_grace_ms(),
            suicide_on_laggy: false,
            journal_max_segments: default_journal_max_segments(),
            session_idle_timeout_ms: default_session_idle_timeout_ms(),
            reconnect_timeout_ms: default_reconnect_timeout_ms(),
        }
    }
}

impl MdsConfig {
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    #[must_use]
    pub const fn beacon_interval(&self) -> Duration {
        Duration::from_millis(self.beacon_interval_ms)
    }

    #[must_use]
    pub const fn beacon_grace(&self) -> Duration {
        Duration::from_millis(self.beacon_grace_ms)
    }

    #[must_use]
    pub const fn session_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.session_idle_timeout_ms)
    }

    #[must_use]
    pub const fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    /// Apply one `key=value` option received over the monitor command
    /// channel.
    pub fn apply_option(&mut self, opt: &str) -> Result<()> {
        let (key, value) = opt
            .split_once('=')
            .ok_or_else(|| Error::invalid_argument(format!("expected key=value, got {opt:?}")))?;
        let key = key.trim();
        let value = value.trim();

        fn parse_u64(key: &str, value: &str) -> Result<u64> {
            value
                .parse()
                .map_err(|_| Error::invalid_argument(format!("bad value for {key}: {value:?}")))
        }

        match key {
            "tick_interval_ms" => self.tick_interval_ms = parse_u64(key, value)?,
            "beacon_interval_ms" => self.beacon_interval_ms = parse_u64(key, value)?,
            "beacon_grace_ms" => self.beacon_grace_ms = parse_u64(key, value)?,
            "suicide_on_laggy" => {
                self.suicide_on_laggy = value.parse().map_err(|_| {
                    Error::invalid_argument(format!("bad value for {key}: {value:?}"))
                })?;
            }
            "journal_max_segments" => {
                self.journal_max_segments = parse_u64(key, value)? as usize;
            }
            "session_idle_timeout_ms" => self.session_idle_timeout_ms = parse_u64(key, value)?,
            "reconnect_timeout_ms" => self.reconnect_timeout_ms = parse_u64(key, value)?,
            _ => return Err(Error::invalid_argument(format!("unknown option {key:?}"))),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = MdsConfig::default();
        assert_eq!(cfg.tick_interval(), Duration::from_secs(5));
        assert_eq!(cfg.beacon_grace(), Duration::from_secs(15));
        assert!(!cfg.suicide_on_laggy);
    }

    #[test]
    fn test_apply_option() {
        let mut cfg = MdsConfig::default();
        cfg.apply_option("beacon_grace_ms=30000").unwrap();
        assert_eq!(cfg.beacon_grace(), Duration::from_secs(30));

        cfg.apply_option("suicide_on_laggy=true").unwrap();
        assert!(cfg.suicide_on_laggy);

        assert!(cfg.apply_option("no_such_option=1").is_err());
        assert!(cfg.apply_option("beacon_grace_ms").is_err());
        assert!(cfg.apply_option("beacon_grace_ms=soon").is_err());
    }
}
