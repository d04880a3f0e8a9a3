//! Adaptive wait used when a worker is blocked on empty or full queues.

use std::time::Duration;

const START_MS: f64 = 1.0;
const FACTOR: f64 = 1.2;
const CAP_MS: f64 = 100.0;

/// Exponentially growing sleep interval.
///
/// Starts around one millisecond and grows by 20% per blocked iteration up
/// to a 100ms ceiling, so an idle worker converges to a low polling rate
/// without burning a core. Reset whenever the worker makes progress.
#[derive(Debug)]
pub struct Backoff {
    current_ms: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    /// Creates a backoff at its starting interval.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current_ms: START_MS,
        }
    }

    /// Returns the next sleep interval and advances the schedule.
    pub fn step(&mut self) -> Duration {
        let interval = Duration::from_secs_f64(self.current_ms / 1000.0);
        self.current_ms = (self.current_ms * FACTOR).min(CAP_MS);
        interval
    }

    /// Sleeps for the next interval.
    pub async fn wait(&mut self) {
        let interval = self.step();
        tokio::time::sleep(interval).await;
    }

    /// Returns to the starting interval after progress.
    pub fn reset(&mut self) {
        self.current_ms = START_MS;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grows_towards_cap() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.step(), Duration::from_millis(1));

        let mut last = Duration::ZERO;
        for _ in 0..60 {
            let next = backoff.step();
            assert!(next >= last);
            last = next;
        }
        assert_eq!(last, Duration::from_millis(100));
    }

    #[test]
    fn test_wait_advances_schedule() {
        let mut backoff = Backoff::new();
        tokio_test::block_on(backoff.wait());
        assert!(backoff.step() > Duration::from_millis(1));
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut backoff = Backoff::new();
        for _ in 0..10 {
            backoff.step();
        }
        backoff.reset();
        assert_eq!(backoff.step(), Duration::from_millis(1));
    }
}
