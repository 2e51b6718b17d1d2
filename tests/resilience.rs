use imagegate::config::{CircuitBreakerConfig, RetryConfig, SourceKind};
use imagegate::resilience::{
    backoff_delay, with_resilience, BreakerState, CircuitBreaker, FailureLog,
};
use imagegate::GatewayError;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn breaker(failure_threshold: u32, reset_timeout_ms: u64, success_threshold: u32) -> CircuitBreaker {
    CircuitBreaker::new(
        "test",
        CircuitBreakerConfig {
            failure_threshold,
            reset_timeout_ms,
            success_threshold,
        },
    )
}

fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay_ms: 1,
        max_delay_ms: 4,
    }
}

#[test]
fn breaker_opens_at_exactly_the_failure_threshold() {
    let breaker = breaker(3, 60_000, 1);
    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Closed);
    assert!(breaker.try_acquire());

    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Open);
    assert!(!breaker.try_acquire());
}

#[test]
fn closed_breaker_resets_failure_count_on_success() {
    let breaker = breaker(3, 60_000, 1);
    breaker.record_failure();
    breaker.record_failure();
    breaker.record_success();
    breaker.record_failure();
    breaker.record_failure();
    // Two failures after the reset: still below the threshold.
    assert_eq!(breaker.state(), BreakerState::Closed);
}

#[tokio::test]
async fn breaker_half_opens_after_reset_timeout() {
    let breaker = breaker(1, 30, 2);
    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Open);
    assert!(!breaker.try_acquire());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(breaker.state(), BreakerState::HalfOpen);
    assert!(breaker.try_acquire());

    // One success is not enough with success_threshold = 2.
    breaker.record_success();
    assert_eq!(breaker.state(), BreakerState::HalfOpen);
    breaker.record_success();
    assert_eq!(breaker.state(), BreakerState::Closed);
}

#[tokio::test]
async fn half_open_failure_reopens_with_fresh_timer() {
    let breaker = breaker(1, 30, 1);
    breaker.record_failure();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(breaker.state(), BreakerState::HalfOpen);

    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Open);
    assert!(!breaker.try_acquire());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(breaker.state(), BreakerState::HalfOpen);
}

#[tokio::test]
async fn open_breaker_rejects_without_touching_the_operation() {
    let breaker = breaker(1, 60_000, 1);
    breaker.record_failure();

    let calls = AtomicU32::new(0);
    let result: Result<(), _> = with_resilience("test", &fast_retry(3), &breaker, |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
    })
    .await;

    assert!(matches!(result, Err(GatewayError::CircuitOpen(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn retry_stops_after_max_attempts() {
    let breaker = breaker(100, 60_000, 1);
    let calls = AtomicU32::new(0);
    let result: Result<(), _> = with_resilience("test", &fast_retry(3), &breaker, |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(GatewayError::Timeout("origin".into())) }
    })
    .await;

    assert!(matches!(result, Err(GatewayError::Timeout(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn non_retryable_error_stops_immediately() {
    let breaker = breaker(100, 60_000, 1);
    let calls = AtomicU32::new(0);
    let result: Result<(), _> = with_resilience("test", &fast_retry(5), &breaker, |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(GatewayError::AuthError("401".into())) }
    })
    .await;

    assert!(matches!(result, Err(GatewayError::AuthError(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn later_attempt_succeeds_after_transient_failures() {
    let breaker = breaker(100, 60_000, 1);
    let calls = AtomicU32::new(0);
    let result = with_resilience("test", &fast_retry(5), &breaker, |attempt| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt < 3 {
                Err(GatewayError::OriginError("503".into()))
            } else {
                Ok(attempt)
            }
        }
    })
    .await;

    assert_eq!(result.unwrap(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn backoff_grows_exponentially_and_caps_at_max_delay() {
    let policy = RetryConfig {
        max_attempts: 10,
        initial_delay_ms: 100,
        max_delay_ms: 1_000,
    };
    let first = backoff_delay(&policy, "origin", 1);
    let second = backoff_delay(&policy, "origin", 2);
    let tenth = backoff_delay(&policy, "origin", 10);

    // Base plus at most 25% jitter.
    assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(125));
    assert!(second >= Duration::from_millis(200) && second < Duration::from_millis(250));
    assert!(tenth >= Duration::from_millis(1_000) && tenth < Duration::from_millis(1_250));
}

#[test]
fn backoff_jitter_is_deterministic_per_target_and_attempt() {
    let policy = RetryConfig::default();
    assert_eq!(
        backoff_delay(&policy, "remote", 2),
        backoff_delay(&policy, "remote", 2)
    );
}

#[test]
fn failure_log_avoids_source_at_threshold() {
    let log = FailureLog::new(Duration::from_secs(300), 5);
    for _ in 0..4 {
        log.record(SourceKind::R2, "TIMEOUT");
    }
    assert!(!log.is_avoided(SourceKind::R2));

    log.record(SourceKind::R2, "TIMEOUT");
    assert!(log.is_avoided(SourceKind::R2));
    assert!(!log.is_avoided(SourceKind::Remote));
    assert_eq!(log.count_for(SourceKind::R2), 5);
    assert_eq!(log.codes_for(SourceKind::R2), vec!["TIMEOUT"; 5]);
}

#[tokio::test]
async fn failure_log_entries_expire_with_the_window() {
    let log = FailureLog::new(Duration::from_millis(40), 5);
    for _ in 0..5 {
        log.record(SourceKind::Fallback, "ORIGIN_ERROR");
    }
    assert!(log.is_avoided(SourceKind::Fallback));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!log.is_avoided(SourceKind::Fallback));
    assert_eq!(log.count_for(SourceKind::Fallback), 0);
}
