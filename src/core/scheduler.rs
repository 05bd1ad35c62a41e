//! Wall-clock source and drift-corrected periodic ticks.

use std::{sync::Mutex, time::Duration};

use time::OffsetDateTime;
use tokio::time::{sleep, Instant};

/// Source of wall-clock time for due-ness checks and reading timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: OffsetDateTime) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// One iteration of a fixed-period loop.
///
/// ```ignore
/// loop {
///     let tick = Ticker::start(period);
///     do_work().await;
///     tick.wait().await;
/// }
/// ```
///
/// Each iteration sleeps `max(0, period - elapsed)` measured from its own
/// start, so an overrun is not carried into the next iteration.
#[derive(Debug, Clone, Copy)]
pub struct Ticker {
    period: Duration,
    started: Instant,
}

impl Ticker {
    pub fn start(period: Duration) -> Self {
        Self {
            period,
            started: Instant::now(),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn remaining(&self) -> Duration {
        self.period.saturating_sub(self.started.elapsed())
    }

    pub async fn wait(self) {
        let remaining = self.remaining();
        if !remaining.is_zero() {
            sleep(remaining).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;
    use tokio::time::advance;

    use super::*;

    #[test]
    fn test_manual_clock_moves_only_when_told() {
        let start = datetime!(2024-06-01 12:00 UTC);
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now(), datetime!(2024-06-01 12:01:30 UTC));

        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_sleeps_for_the_rest_of_the_period() {
        let tick = Ticker::start(Duration::from_secs(5));
        advance(Duration::from_secs(2)).await;
        assert_eq!(tick.remaining(), Duration::from_secs(3));

        let before = Instant::now();
        tick.wait().await;
        assert_eq!(before.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrun_does_not_sleep() {
        let tick = Ticker::start(Duration::from_secs(1));
        advance(Duration::from_secs(3)).await;
        assert_eq!(tick.remaining(), Duration::ZERO);

        let before = Instant::now();
        tick.wait().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_accumulated_drift() {
        let origin = Instant::now();
        for _ in 0..10 {
            let tick = Ticker::start(Duration::from_secs(1));
            advance(Duration::from_millis(300)).await;
            tick.wait().await;
        }
        assert_eq!(origin.elapsed(), Duration::from_secs(10));
    }
}
