//! Cancellation-aware waiting: fixed-interval polling and capped backoff
//!
//! Every sleep in here races the shared [`CancellationToken`], so a loop
//! never outlives a shutdown request by more than the time its current check
//! takes.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Sleep for `duration` unless cancelled first.
///
/// Returns `false` if the token fired before the sleep completed.
pub async fn sleep_or_cancel(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Run `check` immediately and then every `interval` until it yields a value.
///
/// There is no retry cap. Returns `None` once the token is cancelled, which
/// is checked before every attempt and raced against every sleep.
pub async fn poll_immediate_until<F, Fut, T>(
    interval: Duration,
    token: &CancellationToken,
    mut check: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    loop {
        if token.is_cancelled() {
            return None;
        }
        if let Some(value) = check().await {
            return Some(value);
        }
        if !sleep_or_cancel(interval, token).await {
            return None;
        }
    }
}

/// Exponential backoff with jitter, capped at `max_delay`.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl Backoff {
    /// Backoff starting at `initial_delay`, doubling up to `max_delay`
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
            current: initial_delay,
        }
    }

    /// Next delay to wait; 0.5x to 1.5x jitter around the current step
    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = Duration::from_secs_f64(self.current.as_secs_f64() * jitter);
        self.current = Duration::from_secs_f64(
            (self.current.as_secs_f64() * self.multiplier).min(self.max_delay.as_secs_f64()),
        );
        delay
    }

    /// Start over from the initial delay after a success
    pub fn reset(&mut self) {
        self.current = self.initial_delay;
    }
}
