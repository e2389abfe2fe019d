use log::debug;
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of a throttled refresh request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    Proceed,
    /// Retry once `remaining` has elapsed.
    Defer { remaining: Duration },
}

/// Time window plus error counter guarding refreshes triggered by routing
/// errors.
///
/// A request inside the window after the last accepted refresh is deferred
/// unless `threshold` errors were already counted, so a persistent caller
/// always gets through eventually.
#[derive(Debug, Clone)]
pub struct RefreshThrottle {
    delay: Duration,
    threshold: u32,
    error_count: u32,
    last_refresh: Option<Instant>,
}

impl RefreshThrottle {
    pub fn new(delay: Duration, threshold: u32) -> Self {
        Self {
            delay,
            threshold,
            error_count: 0,
            last_refresh: None,
        }
    }

    pub fn evaluate(&mut self, now: Instant, count_error: bool) -> ThrottleDecision {
        let decision = match self.last_refresh {
            Some(last) if self.error_count < self.threshold => {
                let elapsed = now.saturating_duration_since(last);
                if elapsed < self.delay {
                    ThrottleDecision::Defer {
                        remaining: self.delay - elapsed,
                    }
                } else {
                    ThrottleDecision::Proceed
                }
            }
            _ => ThrottleDecision::Proceed,
        };
        if count_error {
            self.error_count = self.error_count.saturating_add(1);
        }
        debug!(
            "event=refresh_throttle decision={:?} errors={} threshold={}",
            decision, self.error_count, self.threshold
        );
        decision
    }

    pub fn record_refresh(&mut self, now: Instant) {
        self.last_refresh = Some(now);
    }

    pub fn reset_errors(&mut self) {
        self.error_count = 0;
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn last_refresh(&self) -> Option<Instant> {
        self.last_refresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn defers_inside_window_until_threshold() {
        let mut throttle = RefreshThrottle::new(Duration::from_millis(100), 3);
        let now = Instant::now();
        assert_eq!(throttle.evaluate(now, true), ThrottleDecision::Proceed);
        throttle.record_refresh(now);

        let later = now + Duration::from_millis(40);
        for _ in 0..2 {
            assert_eq!(
                throttle.evaluate(later, true),
                ThrottleDecision::Defer {
                    remaining: Duration::from_millis(60)
                }
            );
        }
        assert_eq!(throttle.error_count(), 3);
        assert_eq!(throttle.evaluate(later, true), ThrottleDecision::Proceed);

        throttle.reset_errors();
        assert!(matches!(
            throttle.evaluate(later, false),
            ThrottleDecision::Defer { .. }
        ));
        assert_eq!(
            throttle.evaluate(now + Duration::from_millis(100), false),
            ThrottleDecision::Proceed
        );
    }
}
