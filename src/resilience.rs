use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::{CircuitBreakerConfig, RetryConfig, SourceKind};
use crate::GatewayError;

/// Sliding window consulted for adaptive source avoidance.
pub const AVOIDANCE_WINDOW: Duration = Duration::from_secs(300);

/// Failures within the window before a source is avoided.
pub const AVOIDANCE_THRESHOLD: usize = 5;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
    reset_after: Option<Instant>,
}

/// Per-target circuit breaker.
///
/// `closed` passes calls through and counts failures; at the failure
/// threshold it opens for `reset_timeout`. An open breaker rejects
/// immediately until the timeout elapses, then admits trial calls in
/// `half-open`; the configured number of consecutive successes closes it
/// again, any failure re-opens with a fresh timer.
pub struct CircuitBreaker {
    name: String,
    settings: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                consecutive_successes: 0,
                last_failure: None,
                reset_after: None,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().unwrap();
        self.refresh(&mut inner);
        inner.state
    }

    /// True when a call may proceed right now. Handles the open →
    /// half-open transition when the reset timeout has elapsed.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        self.refresh(&mut inner);
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => false,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.settings.success_threshold {
                    tracing::info!(breaker = %self.name, "circuit closed after trial successes");
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                    inner.consecutive_successes = 0;
                    inner.reset_after = None;
                }
            }
            BreakerState::Closed => {
                inner.failure_count = 0;
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            BreakerState::HalfOpen => {
                tracing::warn!(breaker = %self.name, "trial call failed; circuit re-opened");
                self.open(&mut inner);
            }
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.settings.failure_threshold {
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "failure threshold reached; circuit opened"
                    );
                    self.open(&mut inner);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn open(&self, inner: &mut BreakerInner) {
        inner.state = BreakerState::Open;
        inner.consecutive_successes = 0;
        inner.reset_after =
            Some(Instant::now() + Duration::from_millis(self.settings.reset_timeout_ms));
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state == BreakerState::Open {
            if let Some(reset_after) = inner.reset_after {
                if Instant::now() >= reset_after {
                    tracing::info!(breaker = %self.name, "reset timeout elapsed; circuit half-open");
                    inner.state = BreakerState::HalfOpen;
                    inner.consecutive_successes = 0;
                }
            }
        }
    }
}

struct FailureEntry {
    at: Instant,
    code: &'static str,
    source: SourceKind,
}

/// Adaptive failure log: a 5-minute sliding window of classified
/// failures per source. A source with at least five entries in the
/// window is skipped during priority selection regardless of breaker
/// state.
pub struct FailureLog {
    window: Duration,
    threshold: usize,
    entries: Mutex<VecDeque<FailureEntry>>,
}

impl Default for FailureLog {
    fn default() -> Self {
        Self::new(AVOIDANCE_WINDOW, AVOIDANCE_THRESHOLD)
    }
}

impl FailureLog {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            window,
            threshold,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, source: SourceKind, code: &'static str) {
        let mut entries = self.entries.lock().unwrap();
        Self::prune(&mut entries, self.window);
        entries.push_back(FailureEntry {
            at: Instant::now(),
            code,
            source,
        });
        tracing::debug!(source = %source, code, total = entries.len(), "origin failure recorded");
    }

    pub fn count_for(&self, source: SourceKind) -> usize {
        let mut entries = self.entries.lock().unwrap();
        Self::prune(&mut entries, self.window);
        entries.iter().filter(|e| e.source == source).count()
    }

    pub fn is_avoided(&self, source: SourceKind) -> bool {
        self.count_for(source) >= self.threshold
    }

    /// Classified error codes currently in the window for one source.
    pub fn codes_for(&self, source: SourceKind) -> Vec<&'static str> {
        let mut entries = self.entries.lock().unwrap();
        Self::prune(&mut entries, self.window);
        entries
            .iter()
            .filter(|e| e.source == source)
            .map(|e| e.code)
            .collect()
    }

    fn prune(entries: &mut VecDeque<FailureEntry>, window: Duration) {
        let now = Instant::now();
        while let Some(front) = entries.front() {
            if now.duration_since(front.at) > window {
                entries.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Exponential backoff with deterministic jitter: attempt `k` waits
/// `min(initial · 2^(k−1), max)` plus up to 25% derived from a hash of
/// target and attempt number.
pub fn backoff_delay(policy: &RetryConfig, target: &str, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let base = policy
        .initial_delay_ms
        .saturating_mul(1u64 << exp)
        .min(policy.max_delay_ms);

    let mut hasher = Sha256::new();
    hasher.update(target.as_bytes());
    hasher.update(attempt.to_le_bytes());
    let digest = hasher.finalize();
    let seed = u64::from_le_bytes(digest[..8].try_into().unwrap());
    let jitter = base.saturating_mul(seed % 256) / 1024;

    Duration::from_millis(base + jitter)
}

/// Run `op` under retry-with-backoff and the target's circuit breaker.
///
/// The breaker is consulted once up front; an open circuit rejects the
/// whole call without touching the origin. Each attempt records success
/// or failure on the breaker. Retries stop at `max_attempts` or on the
/// first non-retryable error.
pub async fn with_resilience<T, F, Fut>(
    target: &str,
    policy: &RetryConfig,
    breaker: &CircuitBreaker,
    mut op: F,
) -> Result<T, GatewayError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    if !breaker.try_acquire() {
        return Err(GatewayError::CircuitOpen(target.to_string()));
    }

    let mut attempt = 1u32;
    loop {
        match op(attempt).await {
            Ok(value) => {
                breaker.record_success();
                return Ok(value);
            }
            Err(err) => {
                breaker.record_failure();
                let retryable = err.is_retryable() && attempt < policy.max_attempts;
                if !retryable {
                    return Err(err);
                }
                let delay = backoff_delay(policy, target, attempt);
                tracing::debug!(
                    target = target,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                if !breaker.try_acquire() {
                    return Err(GatewayError::CircuitOpen(target.to_string()));
                }
            }
        }
    }
}
