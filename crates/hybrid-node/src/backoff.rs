//! `backoff` paces repeated polls and provides the one "wait until external
//! state reaches a target" primitive used for daemon start and node readiness.
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Pacing between polls of external state.
pub trait BackoffStrategy: Send {
    /// Starts over from the shortest pause, called whenever the polled state moves.
    fn reset(&mut self);
    /// The pause before the next poll.
    fn next_duration(&mut self) -> Duration;
}

/// The same pause between every poll.
#[derive(Clone, Debug)]
pub struct FixedBackoffStrategy {
    interval: Duration,
}

impl FixedBackoffStrategy {
    /// Pauses `interval` between polls.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl BackoffStrategy for FixedBackoffStrategy {
    fn reset(&mut self) {}

    fn next_duration(&mut self) -> Duration {
        self.interval
    }
}

/// Doubles the pause after every poll, from `base` up to `cap`.
#[derive(Clone, Debug)]
pub struct ExponentialBackoffStrategy {
    base: Duration,
    cap: Duration,
    current: Option<Duration>,
}

impl Default for ExponentialBackoffStrategy {
    /// Suits polling a local service manager: starts fast, settles at two seconds.
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(2))
    }
}

impl ExponentialBackoffStrategy {
    /// Starts at `base` and doubles up to `cap`.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: None,
        }
    }
}

impl BackoffStrategy for ExponentialBackoffStrategy {
    fn reset(&mut self) {
        self.current = None;
    }

    fn next_duration(&mut self) -> Duration {
        let next = self
            .current
            .map_or(self.base, |current| current.saturating_mul(2))
            .min(self.cap);
        self.current = Some(next);
        next
    }
}

/// What a single check of external state observed.
#[derive(Debug)]
pub enum Check<T> {
    /// The target state was reached.
    Ready(T),
    /// Not there yet; keep polling.
    Pending(String),
    /// A terminal failure state; polling stops immediately.
    Failed(String),
}

/// Polls `check` until it reports [`Check::Ready`], a terminal failure, the
/// deadline passes, or `cancel` fires.
///
/// A check returning `Err` is logged and retried, never fatal on its own.
/// When a pending check reports a different state than the one before, the
/// backoff is reset so a resource that is making progress is polled closely.
pub async fn poll_until<T, F, Fut, B>(
    operation: &str,
    cancel: &CancellationToken,
    deadline: Duration,
    mut backoff: B,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Check<T>>>,
    B: BackoffStrategy,
{
    let start = Instant::now();
    let mut last_state: Option<String> = None;
    loop {
        match check().await {
            Ok(Check::Ready(value)) => return Ok(value),
            Ok(Check::Failed(state)) => {
                return Err(Error::TerminalState {
                    operation: operation.to_string(),
                    state,
                })
            }
            Ok(Check::Pending(state)) => {
                debug!(operation, %state, elapsed = ?start.elapsed(), "Still waiting");
                if last_state.as_deref().map_or(false, |last| last != state) {
                    backoff.reset();
                }
                last_state = Some(state);
            }
            Err(e) => warn!(operation, error = %e, "Check failed, retrying"),
        }

        let elapsed = start.elapsed();
        if elapsed >= deadline {
            return Err(Error::Timeout {
                operation: operation.to_string(),
                elapsed,
            });
        }
        let pause = backoff.next_duration().min(deadline - elapsed);
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = cancel.cancelled() => {
                return Err(Error::Canceled {
                    operation: operation.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn exponential_starts_at_base() {
        let mut backoff = ExponentialBackoffStrategy::default();
        assert_eq!(backoff.next_duration(), Duration::from_millis(250));
    }

    #[test]
    fn exponential_doubles_until_cap() {
        let mut backoff = ExponentialBackoffStrategy::default();
        assert_eq!(backoff.next_duration(), Duration::from_millis(250));
        assert_eq!(backoff.next_duration(), Duration::from_millis(500));
        assert_eq!(backoff.next_duration(), Duration::from_millis(1000));
    }

    #[test]
    fn reset_returns_to_base() {
        let mut backoff = ExponentialBackoffStrategy::new(Duration::from_secs(10), Duration::from_secs(300));
        assert_eq!(backoff.next_duration(), Duration::from_secs(10));
        assert_eq!(backoff.next_duration(), Duration::from_secs(20));
        backoff.reset();
        assert_eq!(backoff.next_duration(), Duration::from_secs(10));
    }

    #[test]
    fn exponential_never_exceeds_cap() {
        let mut backoff = ExponentialBackoffStrategy::default();
        for _ in 0..5 {
            backoff.next_duration();
        }
        assert_eq!(backoff.next_duration(), Duration::from_secs(2));
    }

    #[test]
    fn fixed_backoff_never_changes() {
        let mut backoff = FixedBackoffStrategy::new(Duration::from_secs(5));
        assert_eq!(backoff.next_duration(), Duration::from_secs(5));
        backoff.reset();
        assert_eq!(backoff.next_duration(), Duration::from_secs(5));
    }

    fn fast() -> FixedBackoffStrategy {
        FixedBackoffStrategy::new(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn poll_retries_errors_until_ready() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let cancel = CancellationToken::new();
        let value = poll_until("test", &cancel, Duration::from_secs(5), fast(), || async move {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 => Err(Error::Configuration("transient".into())),
                1 => Ok(Check::Pending("activating".into())),
                _ => Ok(Check::Ready(42)),
            }
        })
        .await
        .unwrap();
        assert_eq!(42, value);
        assert_eq!(3, calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn terminal_failure_short_circuits() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let cancel = CancellationToken::new();
        let result: Result<()> = poll_until("test", &cancel, Duration::from_secs(60), fast(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Check::Failed("degraded".into()))
        })
        .await;
        assert!(matches!(result, Err(Error::TerminalState { state, .. }) if state == "degraded"));
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn deadline_bounds_the_wait() {
        let cancel = CancellationToken::new();
        let result: Result<()> = poll_until(
            "test",
            &cancel,
            Duration::from_millis(20),
            fast(),
            || async { Ok(Check::Pending("inactive".into())) },
        )
        .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    /// Records how the poll loop drives its strategy.
    #[derive(Default)]
    struct Recording {
        resets: Arc<AtomicUsize>,
    }

    impl BackoffStrategy for Recording {
        fn reset(&mut self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }

        fn next_duration(&mut self) -> Duration {
            Duration::from_millis(1)
        }
    }

    #[tokio::test]
    async fn backoff_resets_when_state_moves() {
        let strategy = Recording::default();
        let resets = strategy.resets.clone();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let cancel = CancellationToken::new();
        poll_until("test", &cancel, Duration::from_secs(5), strategy, || async move {
            Ok(match calls.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Check::Pending("inactive".to_string()),
                2 | 3 => Check::Pending("activating".to_string()),
                _ => Check::Ready(()),
            })
        })
        .await
        .unwrap();
        assert_eq!(1, resets.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancellation_aborts_promptly() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = poll_until(
            "test",
            &cancel,
            Duration::from_secs(60),
            FixedBackoffStrategy::new(Duration::from_secs(30)),
            || async { Ok(Check::Pending("inactive".into())) },
        )
        .await;
        assert!(matches!(result, Err(Error::Canceled { .. })));
    }
}
