use std::time::Duration;

use tokio::time::Instant;

/// Per-task pacing of external calls.
///
/// [`Self::acquire`] returns no sooner than `interval` after the previous
/// `acquire` returned. Each task loop owns its own limiter; there is no
/// coordination across tasks.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    interval: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Build from seconds; negative or non-finite input means no pacing.
    pub fn from_secs(secs: f64) -> Self {
        Self::new(Duration::try_from_secs_f64(secs).unwrap_or_default())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for the next slot.
    pub async fn acquire(&mut self) {
        if let Some(last) = self.last {
            let next = last + self.interval;
            if next > Instant::now() {
                tokio::time::sleep_until(next).await;
            }
        }
        self.last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquires_are_spaced_by_the_interval() {
        let mut limiter = RateLimiter::from_secs(0.2);
        let started = Instant::now();
        for _ in 0..4 {
            limiter.acquire().await;
        }
        assert!(
            started.elapsed() >= Duration::from_millis(600),
            "4 acquires took {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn first_acquire_does_not_wait() {
        let mut limiter = RateLimiter::from_secs(10.0);
        let started = Instant::now();
        limiter.acquire().await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn unusable_intervals_disable_pacing() {
        assert_eq!(RateLimiter::from_secs(-1.0).interval(), Duration::ZERO);
        assert_eq!(RateLimiter::from_secs(f64::NAN).interval(), Duration::ZERO);
        assert_eq!(RateLimiter::from_secs(0.5).interval(), Duration::from_millis(500));
    }
}
