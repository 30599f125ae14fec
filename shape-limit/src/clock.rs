use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Microsecond wall-clock timestamps backed by a monotonic `quanta` clock.
///
/// History entries written by different processes are compared with each
/// other, so timestamps are expressed relative to the Unix epoch. The epoch
/// offset is sampled once; after that the clock only moves forward.
#[derive(Debug, Clone)]
pub struct Clock {
    clock: quanta::Clock,
    anchor: quanta::Instant,
    epoch_micros: i64,
}

impl Clock {
    pub fn new() -> Self {
        let epoch_micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|since| since.as_micros() as i64)
            .unwrap_or_default();
        Self::with_clock(quanta::Clock::new(), epoch_micros)
    }

    /// Build on an existing `quanta` clock, e.g. one from `quanta::Clock::mock()`.
    pub fn with_clock(clock: quanta::Clock, epoch_micros: i64) -> Self {
        let anchor = clock.now();
        Self {
            clock,
            anchor,
            epoch_micros,
        }
    }

    /// Microseconds since the Unix epoch.
    pub fn now_micros(&self) -> i64 {
        self.epoch_micros + self.elapsed().as_micros() as i64
    }

    fn elapsed(&self) -> Duration {
        self.clock.now().duration_since(self.anchor)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
