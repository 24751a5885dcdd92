//! Hybrid logical clock issuing field stamps.
//!
//! Stamps track wall time when it moves forward and fall back to a counter
//! when it does not, so every stamp a device issues is strictly greater than
//! the previous one and than any remote stamp it has merged.

use crate::types::{DeviceId, Stamp};
use chrono::Utc;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Source of physical time in UTC milliseconds.
pub trait TimeSource: Send + Sync + Debug {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// A settable clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now: AtomicI64,
}

impl ManualTimeSource {
    /// Starts at `ms`.
    #[must_use]
    pub fn starting_at(ms: i64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicI64::new(ms),
        })
    }

    /// Jumps to `ms`, which may be in the past.
    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    /// Moves forward by `ms`.
    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Issues monotonically increasing [`Stamp`]s for one device.
#[derive(Debug)]
pub struct HybridClock {
    device: DeviceId,
    source: Arc<dyn TimeSource>,
    last: Mutex<(i64, u32)>,
}

impl HybridClock {
    /// Creates a clock for `device` reading physical time from `source`.
    pub fn new(device: DeviceId, source: Arc<dyn TimeSource>) -> Self {
        Self {
            device,
            source,
            last: Mutex::new((i64::MIN, 0)),
        }
    }

    /// The device stamped into every issued stamp.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Issues the next stamp.
    pub fn tick(&self) -> Stamp {
        let physical = self.source.now_ms();
        let mut last = self.last.lock();
        *last = if physical > last.0 {
            (physical, 0)
        } else if last.1 == u32::MAX {
            (last.0.saturating_add(1), 0)
        } else {
            (last.0, last.1 + 1)
        };
        Stamp {
            wall_ms: last.0,
            counter: last.1,
            device: self.device,
        }
    }

    /// Advances past `stamp` so later local writes order after it.
    pub fn observe(&self, stamp: &Stamp) {
        let mut last = self.last.lock();
        if (stamp.wall_ms, stamp.counter) > *last {
            *last = (stamp.wall_ms, stamp.counter);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_are_strictly_increasing_when_time_stalls() {
        let time = ManualTimeSource::starting_at(1_000);
        let clock = HybridClock::new(DeviceId::new(), time.clone());
        let a = clock.tick();
        let b = clock.tick();
        time.set(500);
        let c = clock.tick();
        assert!(a < b && b < c);
        assert_eq!((a.wall_ms, a.counter), (1_000, 0));
        assert_eq!((c.wall_ms, c.counter), (1_000, 2));
    }

    #[test]
    fn follows_physical_time_forward() {
        let time = ManualTimeSource::starting_at(1_000);
        let clock = HybridClock::new(DeviceId::new(), time.clone());
        clock.tick();
        time.advance(250);
        let s = clock.tick();
        assert_eq!((s.wall_ms, s.counter), (1_250, 0));
    }

    #[test]
    fn observe_moves_past_remote_stamps() {
        let time = ManualTimeSource::starting_at(1_000);
        let clock = HybridClock::new(DeviceId::new(), time);
        let remote = Stamp {
            wall_ms: 9_000,
            counter: 4,
            device: DeviceId::new(),
        };
        clock.observe(&remote);
        let next = clock.tick();
        assert!(next > remote);
        assert_eq!((next.wall_ms, next.counter), (9_000, 5));
    }

    #[test]
    fn system_time_is_recent() {
        // After 2020-01-01
        assert!(SystemTimeSource.now_ms() > 1_577_836_800_000);
    }
}
