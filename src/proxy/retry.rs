use crate::config::RetryConfig;
use crate::upstream::UpstreamFailure;
use std::time::Duration;

/// Whether a failed attempt number `attempt` (1-based) gets another try.
pub fn should_retry(failure: &UpstreamFailure, attempt: usize, config: &RetryConfig) -> bool {
    if !failure.is_retryable() {
        tracing::debug!(error = %failure, "Error is not retryable");
        return false;
    }

    if attempt >= config.max_attempts {
        tracing::warn!(
            attempts = attempt,
            max_attempts = config.max_attempts,
            "Max retry attempts exceeded"
        );
        return false;
    }

    true
}

/// Delay before the attempt following failed attempt `attempt` (1-based):
/// `backoff_ms × 2^(attempt−1)`, capped at `max_backoff_ms`.
pub fn calculate_backoff(attempt: usize, config: &RetryConfig) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32) as u32;
    let base_delay = config.backoff_ms.saturating_mul(2_u64.saturating_pow(exponent));
    let delay = base_delay.min(config.max_backoff_ms.max(config.backoff_ms));

    if !config.jitter {
        return Duration::from_millis(delay);
    }

    // ±25%
    let jitter = (delay as f64) * 0.25;
    let jitter_range = rand::random::<f64>() * jitter * 2.0 - jitter;
    let final_delay = (delay as f64 + jitter_range).max(0.0) as u64;

    Duration::from_millis(final_delay)
}
