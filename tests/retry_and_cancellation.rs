//! Seed scenarios 3 and 4: bounded retry on a transient failure, and cancellation short-circuiting
//! before a sleep, exercised through the public `retry` engine rather than a real HTTP stack.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cloudllm::cloudllm::retry::{retry, BackoffStrategy, RetryConfig, RetryOutcome};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn retries_twice_on_429_then_succeeds_on_third_attempt() {
    let config = RetryConfig::new(3, Duration::from_millis(1));
    let cancel = CancellationToken::new();
    let attempts = Arc::new(AtomicU32::new(0));

    let result: Result<&str, RetryOutcome<u16>> = retry(
        &config,
        &cancel,
        |status: &u16| *status == 429,
        |attempt| {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err(429u16)
                } else {
                    Ok("stream opened")
                }
            }
        },
    )
    .await;

    assert!(matches!(result, Ok("stream opened")));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exponential_backoff_is_available_for_anthropic_and_gemini_style_configs() {
    let config = RetryConfig::new(3, Duration::from_millis(1)).exponential();
    assert_eq!(config.delay_for_attempt(1), Duration::from_millis(1));
    assert_eq!(config.delay_for_attempt(2), Duration::from_millis(2));
    assert!(matches!(config.strategy, BackoffStrategy::Exponential));
}

#[tokio::test]
async fn cancelling_mid_backoff_short_circuits_without_a_further_attempt() {
    let config = RetryConfig::new(5, Duration::from_secs(30));
    let cancel = CancellationToken::new();
    let attempts = Arc::new(AtomicU32::new(0));

    let cancel_clone = cancel.clone();
    let attempts_clone = attempts.clone();
    let handle = tokio::spawn(async move {
        retry::<(), u16, _, _, _>(
            &config,
            &cancel_clone,
            |_| true,
            move |_attempt| {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(429u16)
                }
            },
        )
        .await
    });

    tokio::time::sleep(Duration::from_millis(5)).await;
    cancel.cancel();
    let result = handle.await.unwrap();

    assert!(matches!(result, Err(RetryOutcome::Cancelled)));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}
