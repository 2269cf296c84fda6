//! RetryEngine — bounded retry loop with pluggable backoff and
//! error-category-driven adaptation (spec.md §4.3).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::types::ErrorCategory;

/// A cooperative cancellation signal shared between the coordinator and
/// every in-flight task. Cheap to clone; cancelling is a one-way latch.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<CancellationState>,
}

#[derive(Default)]
struct CancellationState {
    cancelled: std::sync::atomic::AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner
            .cancelled
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Resolves immediately if already cancelled, otherwise waits for
    /// `cancel()` to be called.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// Backoff formula selection (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    Linear,
    Exponential,
    Constant,
}

impl BackoffStrategy {
    /// Delay before attempt `k` (k >= 2), before any category multiplier.
    fn base_delay(self, base: Duration, k: u32) -> Duration {
        debug_assert!(k >= 2);
        match self {
            BackoffStrategy::Linear => base.mul_f64(k as f64),
            BackoffStrategy::Exponential => base.mul_f64(2f64.powi(k as i32 - 2)),
            BackoffStrategy::Constant => base,
        }
    }
}

/// Tunable policy parameters, defaulting to spec.md §4.3's values.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub strategy: BackoffStrategy,
    pub adaptive: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(5000),
            strategy: BackoffStrategy::Linear,
            adaptive: true,
        }
    }
}

/// State visible to the wrapped operation on each attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub attempt: u32,
    pub max_attempts: u32,
    pub previous_error_category: Option<ErrorCategory>,
    pub use_http1_fallback: bool,
}

/// Terminal failure surfaced once the retry loop gives up or short-circuits.
#[derive(Debug, Clone)]
pub struct ExhaustedError {
    pub attempts: u32,
    pub final_message: String,
    pub final_category: ErrorCategory,
    pub categories_seen: Vec<ErrorCategory>,
}

impl std::fmt::Display for ExhaustedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "failed after {} attempt(s): {} ({:?})",
            self.attempts, self.final_message, self.final_category
        )
    }
}

impl std::error::Error for ExhaustedError {}

/// An operation's failure, described as a message RetryEngine classifies.
pub struct AttemptError {
    pub message: String,
    pub during_clone: bool,
}

impl AttemptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            during_clone: false,
        }
    }

    /// Marks this failure as having occurred during a clone attempt, so
    /// `classify` applies priority 4's "repository not found" exception.
    pub fn during_clone(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            during_clone: true,
        }
    }
}

/// Classify a textual error message per spec.md §4.3.1's ordered table.
///
/// `during_clone` excludes "repository not found" from the AUTH rule
/// (priority 4's stated exception) when the failing attempt was a clone
/// rather than an update, letting the message fall through to later rules
/// instead of short-circuiting as a non-retryable auth failure.
pub fn classify(message: &str, during_clone: bool) -> ErrorCategory {
    let lower = message.to_lowercase();
    let any = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if any(&["http/2", "http2", "curl 92", "curl 16"]) || (lower.contains("stream") && lower.contains("cancel")) {
        return ErrorCategory::Http2;
    }
    if any(&["timeout", "timed out"]) {
        return ErrorCategory::Timeout;
    }
    if any(&[
        "connection reset",
        "connection refused",
        "connection timed out",
        "network is unreachable",
        "host is unreachable",
        "recv failure",
        "could not resolve host",
        "name or service not known",
        "temporary failure in name resolution",
    ]) {
        return ErrorCategory::Network;
    }
    let mut auth_patterns = vec![
        "authentication failed",
        "permission denied",
        "access denied",
        "invalid credentials",
        "bad credentials",
    ];
    if !during_clone {
        auth_patterns.push("repository not found");
    }
    if any(&auth_patterns) {
        return ErrorCategory::Auth;
    }
    if any(&[
        "ssl certificate",
        "certificate problem",
        "certificate verify",
        "local issuer certificate",
        "tls",
    ]) {
        return ErrorCategory::Ssl;
    }
    if any(&[
        "no space left",
        "disk quota",
        "cannot allocate",
        "out of memory",
    ]) {
        return ErrorCategory::Storage;
    }
    if any(&[
        "repository is empty",
        "remote head",
        "nonexistent ref",
        "invalid ref",
    ]) {
        return ErrorCategory::Repository;
    }
    if any(&["early eof", "unexpected disconnect", "fetch-pack"]) {
        return ErrorCategory::Http2;
    }
    ErrorCategory::Unknown
}

/// Wraps a fallible async operation with a bounded, category-adaptive
/// retry loop.
pub struct RetryEngine {
    policy: RetryPolicy,
}

impl RetryEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Run `operation` until it succeeds, is cancelled, exhausts
    /// `max_attempts`, or fails with a non-retryable category.
    pub async fn execute<T, Fut, F>(
        &self,
        description: &str,
        cancellation: &CancellationToken,
        mut operation: F,
    ) -> Result<T, ExhaustedError>
    where
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let mut ctx = RetryContext {
            attempt: 1,
            max_attempts: self.policy.max_attempts,
            previous_error_category: None,
            use_http1_fallback: false,
        };
        let mut categories_seen: Vec<ErrorCategory> = Vec::new();
        let mut next_delay = self.policy.base_delay;

        loop {
            if cancellation.is_cancelled() {
                return Err(ExhaustedError {
                    attempts: ctx.attempt.saturating_sub(1),
                    final_message: "cancelled".into(),
                    final_category: ErrorCategory::Unknown,
                    categories_seen,
                });
            }

            debug!(description, attempt = ctx.attempt, "executing attempt");
            match operation(ctx.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let category = classify(&err.message, err.during_clone);
                    if !categories_seen.contains(&category) {
                        categories_seen.push(category);
                    }
                    let attrs = category.attributes();

                    if self.policy.adaptive {
                        if attrs.suggests_http1_fallback && !ctx.use_http1_fallback {
                            ctx.use_http1_fallback = true;
                            info!(description, "engaging HTTP/1.1 fallback after {:?}", category);
                        }
                        if !attrs.retryable {
                            warn!(description, category = ?category, "non-retryable failure, short-circuiting");
                            return Err(ExhaustedError {
                                attempts: ctx.attempt,
                                final_message: err.message,
                                final_category: category,
                                categories_seen,
                            });
                        }
                    }

                    ctx.previous_error_category = Some(category);

                    if ctx.attempt >= self.policy.max_attempts {
                        return Err(ExhaustedError {
                            attempts: ctx.attempt,
                            final_message: err.message,
                            final_category: category,
                            categories_seen,
                        });
                    }

                    let k = ctx.attempt + 1;
                    let mut delay = self.policy.strategy.base_delay(self.policy.base_delay, k);
                    if self.policy.adaptive {
                        delay = delay.mul_f64(attrs.delay_multiplier.max(0.0));
                    }
                    next_delay = delay;

                    tokio::select! {
                        _ = tokio::time::sleep(next_delay) => {}
                        _ = cancellation.cancelled() => {
                            return Err(ExhaustedError {
                                attempts: ctx.attempt,
                                final_message: "cancelled during retry delay".into(),
                                final_category: category,
                                categories_seen,
                            });
                        }
                    }

                    ctx.attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn classify_http2_stream_cancel() {
        let msg = "curl 92 HTTP/2 stream 5 was not closed cleanly: CANCEL";
        assert_eq!(classify(msg, false), ErrorCategory::Http2);
    }

    #[test]
    fn classify_auth_failure() {
        assert_eq!(classify("Authentication failed for 'https://...'", false), ErrorCategory::Auth);
    }

    #[test]
    fn classify_network_reset() {
        assert_eq!(classify("Connection reset by peer", false), ErrorCategory::Network);
    }

    #[test]
    fn classify_unmatched_falls_through_to_unknown() {
        assert_eq!(classify("something bizarre happened", false), ErrorCategory::Unknown);
    }

    #[test]
    fn classify_repository_not_found_is_auth_outside_clone() {
        assert_eq!(classify("remote: Repository not found.", false), ErrorCategory::Auth);
    }

    #[test]
    fn classify_repository_not_found_is_not_auth_during_clone() {
        assert_eq!(classify("remote: Repository not found.", true), ErrorCategory::Unknown);
    }

    #[test]
    fn linear_strategy_matches_spec_schedule() {
        let base = Duration::from_millis(5000);
        let s = BackoffStrategy::Linear;
        assert_eq!(s.base_delay(base, 2), Duration::from_millis(10_000));
        assert_eq!(s.base_delay(base, 6), Duration::from_millis(30_000));
    }

    #[test]
    fn exponential_strategy_matches_spec_schedule() {
        let base = Duration::from_millis(5000);
        let s = BackoffStrategy::Exponential;
        assert_eq!(s.base_delay(base, 2), Duration::from_millis(5_000));
        assert_eq!(s.base_delay(base, 3), Duration::from_millis(10_000));
        assert_eq!(s.base_delay(base, 4), Duration::from_millis(20_000));
    }

    #[tokio::test]
    async fn auth_error_short_circuits_after_one_attempt() {
        let engine = RetryEngine::new(RetryPolicy::default());
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();

        let result = engine
            .execute("auth-test", &token, |_ctx| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(AttemptError::new("Authentication failed")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let err = result.err().unwrap();
        assert_eq!(err.attempts, 1);
        assert_eq!(err.final_category, ErrorCategory::Auth);
    }

    #[tokio::test]
    async fn http2_failure_latches_fallback_for_next_attempt() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let engine = RetryEngine::new(policy);
        let token = CancellationToken::new();
        let attempt_count = AtomicU32::new(0);

        let result = engine
            .execute("http2-fallback-test", &token, |ctx| {
                let n = attempt_count.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(AttemptError::new(
                            "curl 92 HTTP/2 stream was not closed cleanly: CANCEL",
                        ))
                    } else {
                        assert!(ctx.use_http1_fallback);
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(attempt_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn succeeds_eventually_counts_attempts_correctly() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let engine = RetryEngine::new(policy);
        let token = CancellationToken::new();
        let attempt_count = AtomicU32::new(0);

        let result = engine
            .execute("eventual-success", &token, |_ctx| {
                let n = attempt_count.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(AttemptError::new("Connection reset by peer"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_stops_further_attempts() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(60),
            ..RetryPolicy::default()
        };
        let engine = RetryEngine::new(policy);
        let token = CancellationToken::new();
        let attempt_count = Arc::new(AtomicU32::new(0));

        let token_clone = token.clone();
        let attempt_count_clone = attempt_count.clone();
        let handle = tokio::spawn(async move {
            engine
                .execute("cancel-test", &token_clone, |_ctx| {
                    attempt_count_clone.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(AttemptError::new("Connection reset by peer")) }
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        let result = handle.await.unwrap();

        assert!(result.is_err());
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }
}
