//! Named timers
//!
//! The core owns three named single-shot timers (tick, beacon sender,
//! beacon killer). Arming a timer that is already pending replaces it;
//! cancellation is idempotent. Generation counters guarantee that at most
//! one firing of each named timer is ever acted on: a fire from a replaced
//! or cancelled arm carries a stale generation and is dropped at the loop.

use crate::event::{Event, EventSender, TimerFire, TimerKind};
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Arms timers on behalf of the [`TimerSet`]. Production uses
/// [`TokioTimerDriver`]; tests substitute a recording driver and fire
/// manually.
pub trait TimerDriver: Send {
    fn arm(&mut self, fire: TimerFire, delay: Duration);
    fn cancel(&mut self, kind: TimerKind);
    fn cancel_all(&mut self);
}

/// Driver that sleeps on the tokio timer wheel and posts the fire as an
/// event. Must be constructed inside a runtime.
pub struct TokioTimerDriver {
    tx: EventSender,
    tasks: HashMap<TimerKind, JoinHandle<()>>,
}

impl TokioTimerDriver {
    #[must_use]
    pub fn new(tx: EventSender) -> Self {
        Self {
            tx,
            tasks: HashMap::new(),
        }
    }
}

impl TimerDriver for TokioTimerDriver {
    fn arm(&mut self, fire: TimerFire, delay: Duration) {
        if let Some(old) = self.tasks.remove(&fire.kind) {
            old.abort();
        }
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Event::Timer(fire));
        });
        self.tasks.insert(fire.kind, task);
    }

    fn cancel(&mut self, kind: TimerKind) {
        if let Some(task) = self.tasks.remove(&kind) {
            task.abort();
        }
    }

    fn cancel_all(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

/// The node's view of its timers: generation bookkeeping over a driver.
pub struct TimerSet {
    driver: Box<dyn TimerDriver>,
    generations: HashMap<TimerKind, u64>,
}

impl TimerSet {
    #[must_use]
    pub fn new(driver: Box<dyn TimerDriver>) -> Self {
        Self {
            driver,
            generations: HashMap::new(),
        }
    }

    /// Arm (or re-arm) a named timer. Returns the new generation.
    pub fn arm_after(&mut self, kind: TimerKind, delay: Duration) -> u64 {
        let generation = self.generations.entry(kind).or_insert(0);
        *generation += 1;
        let fire = TimerFire {
            kind,
            generation: *generation,
        };
        self.driver.arm(fire, delay);
        fire.generation
    }

    /// Cancel a named timer. Safe when nothing is pending.
    pub fn cancel(&mut self, kind: TimerKind) {
        *self.generations.entry(kind).or_insert(0) += 1;
        self.driver.cancel(kind);
    }

    /// Cancel every pending timer.
    pub fn cancel_all(&mut self) {
        for generation in self.generations.values_mut() {
            *generation += 1;
        }
        self.driver.cancel_all();
    }

    /// Whether a fire corresponds to the latest arm of its timer.
    #[must_use]
    pub fn is_current(&self, fire: &TimerFire) -> bool {
        self.generations.get(&fire.kind).copied().unwrap_or(0) == fire.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct RecordingDriver {
        armed: Arc<Mutex<Vec<TimerFire>>>,
    }

    impl TimerDriver for RecordingDriver {
        fn arm(&mut self, fire: TimerFire, _delay: Duration) {
            self.armed.lock().push(fire);
        }
        fn cancel(&mut self, _kind: TimerKind) {}
        fn cancel_all(&mut self) {}
    }

    fn timer_set() -> (TimerSet, Arc<Mutex<Vec<TimerFire>>>) {
        let armed = Arc::new(Mutex::new(Vec::new()));
        let driver = RecordingDriver {
            armed: Arc::clone(&armed),
        };
        (TimerSet::new(Box::new(driver)), armed)
    }

    #[test]
    fn test_rearm_invalidates_previous_fire() {
        let (mut timers, armed) = timer_set();
        timers.arm_after(TimerKind::Tick, Duration::from_secs(1));
        timers.arm_after(TimerKind::Tick, Duration::from_secs(1));
        let fires = armed.lock().clone();
        assert_eq!(fires.len(), 2);
        assert!(!timers.is_current(&fires[0]));
        assert!(timers.is_current(&fires[1]));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let (mut timers, armed) = timer_set();
        timers.arm_after(TimerKind::BeaconKiller, Duration::from_secs(1));
        let fire = armed.lock()[0];
        timers.cancel(TimerKind::BeaconKiller);
        timers.cancel(TimerKind::BeaconKiller);
        assert!(!timers.is_current(&fire));
    }

    #[test]
    fn test_cancel_all() {
        let (mut timers, armed) = timer_set();
        timers.arm_after(TimerKind::Tick, Duration::from_secs(1));
        timers.arm_after(TimerKind::BeaconSender, Duration::from_secs(1));
        timers.cancel_all();
        for fire in armed.lock().iter() {
            assert!(!timers.is_current(fire));
        }
    }
}
