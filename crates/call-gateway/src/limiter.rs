use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::config::LimiterConfig;

/// Upper bound on a single wait, guarding against clock skew. The limiter
/// re-checks capacity after every wake-up, so a capped wait only loops.
const MAX_SLEEP: Duration = Duration::from_secs(5);

/// Right to make one downstream call.
#[derive(Debug, Clone, Copy)]
pub struct Permit {
    /// Timestamp recorded in the rate window for this call.
    pub granted_at: Instant,
    /// Time spent blocked before the permit was granted.
    pub waited: Duration,
}

/// Sliding-window rate limiter: at most `max_calls` per `window`, across all
/// callers sharing the instance.
pub struct RateLimiter {
    timestamps: Mutex<VecDeque<Instant>>,
    max_calls: usize,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(config: &LimiterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            timestamps: Mutex::new(VecDeque::new()),
            max_calls: config.max_calls.max(1),
            window: config.window,
            clock,
        }
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Block until a call may proceed, then record it.
    ///
    /// Check-and-record happens under one lock, and the lock is released
    /// before sleeping, so a cancelled caller never holds it.
    pub async fn acquire(&self) -> Permit {
        let started = self.clock.now();
        loop {
            let wait = {
                let mut ts = self.timestamps.lock().await;
                let now = self.clock.now();
                purge(&mut ts, now, self.window);

                if ts.len() < self.max_calls {
                    ts.push_back(now);
                    return Permit {
                        granted_at: now,
                        waited: now.saturating_duration_since(started),
                    };
                }

                match ts.front() {
                    Some(&oldest) => self
                        .window
                        .saturating_sub(now.saturating_duration_since(oldest))
                        .min(MAX_SLEEP),
                    None => Duration::ZERO,
                }
            };

            tracing::debug!(
                wait_ms = wait.as_millis() as u64,
                max_calls = self.max_calls,
                "Rate limiter: waiting for a slot"
            );
            self.clock.sleep(wait).await;
        }
    }

    /// Number of calls recorded in the current window.
    pub async fn in_window(&self) -> usize {
        let mut ts = self.timestamps.lock().await;
        purge(&mut ts, self.clock.now(), self.window);
        ts.len()
    }
}

/// Drop every timestamp at least `window` old.
fn purge(ts: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&front) = ts.front() {
        if now.saturating_duration_since(front) >= window {
            ts.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};

    fn limiter(max_calls: usize, window: Duration, clock: Arc<dyn Clock>) -> RateLimiter {
        RateLimiter::new(&LimiterConfig { max_calls, window }, clock)
    }

    #[tokio::test]
    async fn test_fourth_call_blocks_in_three_per_minute_window() {
        let clock = ManualClock::new();
        let limiter = limiter(3, Duration::from_secs(60), Arc::new(clock.clone()));

        let mut permits = Vec::new();
        for _ in 0..5 {
            permits.push(limiter.acquire().await);
        }

        for permit in &permits[..3] {
            assert_eq!(permit.waited, Duration::ZERO);
        }
        assert!(permits[3].waited > Duration::ZERO);
        // The 4th call may only land once the 1st has left the window.
        assert!(permits[3].granted_at.duration_since(permits[0].granted_at) >= Duration::from_secs(60));
        assert!(permits[4].granted_at.duration_since(permits[1].granted_at) >= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_waits_are_capped() {
        let clock = ManualClock::new();
        let limiter = limiter(1, Duration::from_secs(60), Arc::new(clock.clone()));

        limiter.acquire().await;
        limiter.acquire().await;

        let sleeps = clock.sleeps();
        assert!(!sleeps.is_empty());
        assert!(sleeps.iter().all(|s| *s <= MAX_SLEEP));
        assert_eq!(clock.total_slept(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_huge_limit_does_not_preallocate() {
        let clock = ManualClock::new();
        let limiter = limiter(1 << 60, Duration::from_secs(60), Arc::new(clock.clone()));

        limiter.acquire().await;
        assert_eq!(limiter.max_calls(), 1 << 60);
        assert_eq!(limiter.in_window().await, 1);
    }

    #[tokio::test]
    async fn test_expired_timestamps_are_purged() {
        let clock = ManualClock::new();
        let limiter = limiter(2, Duration::from_secs(10), Arc::new(clock.clone()));

        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(limiter.in_window().await, 2);

        clock.advance(Duration::from_secs(10));
        assert_eq!(limiter.in_window().await, 0);

        let permit = limiter.acquire().await;
        assert_eq!(permit.waited, Duration::ZERO);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rate_bound_holds_under_concurrency() {
        let clock = ManualClock::new();
        let window = Duration::from_secs(1);
        let limiter = Arc::new(limiter(3, window, Arc::new(clock.clone())));

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire().await.granted_at })
            })
            .collect();

        let mut granted = Vec::new();
        for handle in handles {
            granted.push(handle.await.unwrap());
        }
        granted.sort();

        for (i, start) in granted.iter().enumerate() {
            let in_window = granted[i..]
                .iter()
                .take_while(|t| t.duration_since(*start) < window)
                .count();
            assert!(in_window <= 3, "{} calls within one window", in_window);
        }
    }

    #[tokio::test]
    async fn test_cancelled_acquire_releases_lock() {
        let limiter = Arc::new(limiter(1, Duration::from_millis(300), Arc::new(SystemClock::new())));
        limiter.acquire().await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), limiter.acquire()).await;
        assert!(blocked.is_err());

        // The cancelled waiter must not have left the window locked.
        let permit = tokio::time::timeout(Duration::from_secs(2), limiter.acquire())
            .await
            .expect("limiter lock leaked by cancelled caller");
        assert!(permit.waited > Duration::ZERO);
    }
}
