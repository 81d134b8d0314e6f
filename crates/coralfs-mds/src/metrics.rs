//! Node telemetry
//!
//! Counters and gauges exported in Prometheus text format by the daemon's
//! metrics endpoint. The node updates these under the loop; the HTTP
//! handler reads them from another task.

use coralfs_common::{Incarnation, Rank};
use parking_lot::Mutex;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Telemetry for one metadata server node.
pub struct NodeMetrics {
    pub beacons_sent: AtomicU64,
    pub beacon_acks: AtomicU64,
    pub laggy_episodes: AtomicU64,
    pub maps_applied: AtomicU64,
    pub dispatched: AtomicU64,
    pub deferred: AtomicU64,
    pub dropped: AtomicU64,
    pub forwards: AtomicU64,
    pub client_sends: AtomicU64,
    load_milli: AtomicU64,
    subtrees: AtomicU64,
    sessions: AtomicU64,
    ident: Mutex<String>,
    state: Mutex<&'static str>,
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            beacons_sent: AtomicU64::new(0),
            beacon_acks: AtomicU64::new(0),
            laggy_episodes: AtomicU64::new(0),
            maps_applied: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            forwards: AtomicU64::new(0),
            client_sends: AtomicU64::new(0),
            load_milli: AtomicU64::new(0),
            subtrees: AtomicU64::new(0),
            sessions: AtomicU64::new(0),
            ident: Mutex::new("mds.?".to_string()),
            state: Mutex::new("dne"),
        }
    }

    /// Adopt a per-rank telemetry identity once the monitor places us.
    pub fn set_rank(&self, rank: Rank, inc: Incarnation) {
        *self.ident.lock() = format!("mds.{rank}.{inc}");
    }

    pub fn set_state(&self, state: &'static str) {
        *self.state.lock() = state;
    }

    pub fn set_load(&self, load: f64) {
        self.load_milli
            .store((load * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn set_subtrees(&self, n: usize) {
        self.subtrees.store(n as u64, Ordering::Relaxed);
    }

    pub fn set_sessions(&self, n: usize) {
        self.sessions.store(n as u64, Ordering::Relaxed);
    }

    /// Export everything in Prometheus text format.
    #[must_use]
    pub fn export_prometheus(&self) -> String {
        let mut output = String::with_capacity(4 * 1024);
        let ident = self.ident.lock().clone();
        let state = *self.state.lock();

        writeln!(output, "# HELP coralfs_mds_info Node identity and state").unwrap();
        writeln!(output, "# TYPE coralfs_mds_info gauge").unwrap();
        writeln!(
            output,
            "coralfs_mds_info{{mds=\"{ident}\",state=\"{state}\"}} 1"
        )
        .unwrap();

        let counters = [
            ("beacons_sent", &self.beacons_sent),
            ("beacon_acks", &self.beacon_acks),
            ("laggy_episodes", &self.laggy_episodes),
            ("maps_applied", &self.maps_applied),
            ("messages_dispatched", &self.dispatched),
            ("messages_deferred", &self.deferred),
            ("messages_dropped", &self.dropped),
            ("requests_forwarded", &self.forwards),
            ("client_sends", &self.client_sends),
        ];
        for (name, counter) in counters {
            writeln!(output, "# TYPE coralfs_mds_{name}_total counter").unwrap();
            writeln!(
                output,
                "coralfs_mds_{name}_total{{mds=\"{ident}\"}} {}",
                counter.load(Ordering::Relaxed)
            )
            .unwrap();
        }

        let gauges = [
            ("load_milli", &self.load_milli),
            ("subtrees", &self.subtrees),
            ("sessions", &self.sessions),
        ];
        for (name, gauge) in gauges {
            writeln!(output, "# TYPE coralfs_mds_{name} gauge").unwrap();
            writeln!(
                output,
                "coralfs_mds_{name}{{mds=\"{ident}\"}} {}",
                gauge.load(Ordering::Relaxed)
            )
            .unwrap();
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_carries_identity() {
        let m = NodeMetrics::new();
        m.set_rank(Rank::new(2), Incarnation::new(4));
        m.set_state("up:active");
        m.beacons_sent.fetch_add(3, Ordering::Relaxed);
        let out = m.export_prometheus();
        assert!(out.contains("mds=\"mds.2.4\""));
        assert!(out.contains("state=\"up:active\""));
        assert!(out.contains("coralfs_mds_beacons_sent_total{mds=\"mds.2.4\"} 3"));
    }
}
