use std::time::Duration;

use tokio::{
    sync::Mutex,
    time::{sleep, Instant},
};
use tracing::info;

pub const MIN_SPACING: Duration = Duration::from_secs(7);
pub const CALLS_PER_WINDOW: u32 = 9;
pub const WINDOW: Duration = Duration::from_secs(60);

/// Call budget for the link service: a minimum spacing between calls and a
/// cap per rolling window. Waiting callers hold the lock, so concurrent users
/// of one limiter are served one at a time.
#[derive(Debug)]
pub struct RateLimiter {
    min_spacing: Duration,
    max_calls: u32,
    window: Duration,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    last_call: Option<Instant>,
    calls: u32,
    window_start: Instant,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(MIN_SPACING, CALLS_PER_WINDOW, WINDOW)
    }
}

impl RateLimiter {
    pub fn new(min_spacing: Duration, max_calls: u32, window: Duration) -> Self {
        Self {
            min_spacing,
            max_calls,
            window,
            state: Mutex::new(State {
                last_call: None,
                calls: 0,
                window_start: Instant::now(),
            }),
        }
    }

    /// Waits until one more call fits the budget and records it.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;

        let now = Instant::now();
        if now.duration_since(state.window_start) >= self.window {
            state.calls = 0;
            state.window_start = now;
        }

        if state.calls >= self.max_calls {
            let wait = self
                .window
                .saturating_sub(now.duration_since(state.window_start));
            if !wait.is_zero() {
                info!(wait = ?wait, "Link service call cap reached, waiting for the window to reset");
                sleep(wait).await;
            }
            state.calls = 0;
            state.window_start = Instant::now();
        }

        if let Some(last) = state.last_call {
            let since = Instant::now().duration_since(last);
            if since < self.min_spacing {
                let wait = self.min_spacing - since;
                info!(wait = ?wait, "Spacing out link service calls");
                sleep(wait).await;
            }
        }

        state.last_call = Some(Instant::now());
        state.calls += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn calls_are_spaced() {
        let limiter = RateLimiter::default();
        let start = Instant::now();

        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;

        assert!(start.elapsed() >= MIN_SPACING * 2);
        assert!(start.elapsed() < MIN_SPACING * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn tenth_call_waits_for_window_reset() {
        let limiter = RateLimiter::default();
        let start = Instant::now();

        for _ in 0..10 {
            limiter.acquire().await;
        }

        assert!(start.elapsed() >= WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn cap_applies_without_spacing() {
        let limiter = RateLimiter::new(Duration::ZERO, CALLS_PER_WINDOW, WINDOW);
        let start = Instant::now();

        for _ in 0..CALLS_PER_WINDOW {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_secs(1));

        limiter.acquire().await;
        assert!(start.elapsed() >= WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn shared_limiter_serializes_concurrent_callers() {
        let limiter = Arc::new(RateLimiter::default());
        let start = Instant::now();

        let tasks = (0..3)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire().await })
            })
            .collect::<Vec<_>>();
        for t in tasks {
            t.await.expect("task panicked");
        }

        assert!(start.elapsed() >= MIN_SPACING * 2);
    }
}
