use std::sync::{Arc, Mutex};

use chrono::{Local, NaiveDateTime};
use tokio::time::Instant;

use crate::dispatch::lock;

/// Source of local wall-clock time.
///
/// Schedules compare against local clock time, so implementations return a
/// naive local timestamp. A system clock change (DST, manual adjustment) is
/// seen as a jump; see [`crate::scheduler`] for how that affects firing.
pub trait Clock: Send + Sync + 'static {
    /// Current local wall-clock time.
    fn now(&self) -> NaiveDateTime;
}

/// The host clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Clock pinned to a start time and advanced by the tokio timer.
///
/// With a paused tokio runtime this turns virtual time into wall-clock time,
/// which lets day-long schedules run in milliseconds. [`jump`](Self::jump)
/// shifts the wall clock without moving the timer, like an operator or NTP
/// adjusting the host clock. Clones share the shift.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    base: NaiveDateTime,
    started: Instant,
    shift: Arc<Mutex<chrono::Duration>>,
}

impl VirtualClock {
    /// Start the clock at `base`, as of the current tokio instant.
    pub fn starting_at(base: NaiveDateTime) -> Self {
        Self { base, started: Instant::now(), shift: Arc::new(Mutex::new(chrono::Duration::zero())) }
    }

    /// Move the wall clock by `by` (negative goes back).
    pub fn jump(&self, by: chrono::Duration) {
        let mut shift = lock(&self.shift);
        *shift = *shift + by;
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> NaiveDateTime {
        let elapsed = Instant::now().saturating_duration_since(self.started);
        self.base
            + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
            + *lock(&self.shift)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn jumps_are_shared_by_clones() {
        let base = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap().and_hms_opt(9, 0, 0).unwrap();
        let clock = VirtualClock::starting_at(base);
        let other = clock.clone();
        tokio::time::sleep(Duration::from_secs(60)).await;
        clock.jump(chrono::Duration::hours(-2));
        assert_eq!(other.now(), base - chrono::Duration::minutes(119));
    }
}
