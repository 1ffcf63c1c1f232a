//! Retry backoff policy
//!
//! Pure decision logic: given a platform's retry tuning, the error that was
//! observed, and the attempts already made, produce a retry plan. No clocks,
//! no persistence; the retry controller turns plans into delayed queue
//! entries.

use rand::Rng;
use std::time::Duration;

use crate::config::PlatformRetryConfig;
use crate::error::PlatformError;
use crate::types::RetryPlan;

/// Jitter applied to exponential delays, as a fraction of the delay.
const JITTER_FRACTION: f64 = 0.10;

pub struct BackoffPolicy;

impl BackoffPolicy {
    /// Decide whether and when to retry after a failed platform attempt.
    ///
    /// `attempts_made` is the number of attempts already performed,
    /// including the one that just failed.
    pub fn decide(
        config: &PlatformRetryConfig,
        error: &PlatformError,
        attempts_made: i64,
    ) -> RetryPlan {
        if error.is_permanent() {
            return RetryPlan {
                should_retry: false,
                delay: Duration::ZERO,
                reason: format!("permanent error: {}", error),
            };
        }

        if attempts_made >= config.max_retries {
            return RetryPlan {
                should_retry: false,
                delay: Duration::ZERO,
                reason: format!(
                    "retry budget exhausted after {} attempts",
                    attempts_made
                ),
            };
        }

        // Rate limits ignore the exponential curve: honor the platform's
        // retry-after hint when given, otherwise back off for the
        // configured cooldown.
        if let PlatformError::RateLimited { retry_after, .. } = error {
            let delay_secs = retry_after.unwrap_or(config.rate_limit_cooldown_secs);
            let reason = match retry_after {
                Some(secs) => format!("rate limited, platform asked for {}s", secs),
                None => format!(
                    "rate limited, cooling down {}s",
                    config.rate_limit_cooldown_secs
                ),
            };
            return RetryPlan {
                should_retry: true,
                delay: Duration::from_secs(delay_secs),
                reason,
            };
        }

        let delay = Self::exponential_delay(config, attempts_made);
        RetryPlan {
            should_retry: true,
            delay,
            reason: format!("transient error, attempt {} backing off", attempts_made),
        }
    }

    /// base * 2^(attempt - 1), capped at the ceiling, with +/-10% jitter.
    fn exponential_delay(config: &PlatformRetryConfig, attempts_made: i64) -> Duration {
        let exponent = (attempts_made - 1).clamp(0, 32) as u32;
        let raw = config
            .base_delay_secs
            .saturating_mul(1u64 << exponent)
            .min(config.max_delay_secs);

        let jitter_span = (raw as f64 * JITTER_FRACTION).round() as i64;
        let jitter = if jitter_span > 0 {
            rand::thread_rng().gen_range(-jitter_span..=jitter_span)
        } else {
            0
        };

        Duration::from_secs((raw as i64 + jitter).max(1) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PlatformRetryConfig {
        PlatformRetryConfig {
            max_retries: 3,
            base_delay_secs: 60,
            max_delay_secs: 3600,
            rate_limit_cooldown_secs: 900,
        }
    }

    fn transient() -> PlatformError {
        PlatformError::Network("connection reset".to_string())
    }

    #[test]
    fn test_permanent_errors_never_retry() {
        let errors = [
            PlatformError::Authentication("bad token".to_string()),
            PlatformError::Forbidden("suspended".to_string()),
            PlatformError::Duplicate("already posted".to_string()),
            PlatformError::Malformed("too long".to_string()),
        ];
        for error in errors {
            let plan = BackoffPolicy::decide(&config(), &error, 1);
            assert!(!plan.should_retry, "{:?} should not retry", error);
        }
    }

    #[test]
    fn test_budget_exhaustion() {
        let plan = BackoffPolicy::decide(&config(), &transient(), 3);
        assert!(!plan.should_retry);
        assert!(plan.reason.contains("exhausted"));

        let plan = BackoffPolicy::decide(&config(), &transient(), 2);
        assert!(plan.should_retry);
    }

    #[test]
    fn test_exponential_delay_within_jitter_bounds() {
        let cfg = config();
        for (attempt, expected) in [(1i64, 60u64), (2, 120), (3, 240)] {
            let plan = BackoffPolicy::decide(
                &PlatformRetryConfig {
                    max_retries: 10,
                    ..cfg.clone()
                },
                &transient(),
                attempt,
            );
            assert!(plan.should_retry);
            let secs = plan.delay.as_secs();
            let lo = expected - expected / 10;
            let hi = expected + expected / 10;
            assert!(
                (lo..=hi).contains(&secs),
                "attempt {}: {}s outside [{}, {}]",
                attempt,
                secs,
                lo,
                hi
            );
        }
    }

    #[test]
    fn test_delay_capped_at_ceiling() {
        let cfg = PlatformRetryConfig {
            max_retries: 20,
            base_delay_secs: 60,
            max_delay_secs: 300,
            rate_limit_cooldown_secs: 900,
        };
        let plan = BackoffPolicy::decide(&cfg, &transient(), 10);
        // 60 * 2^9 would be huge; the cap plus jitter bounds it.
        assert!(plan.delay.as_secs() <= 330);
        assert!(plan.delay.as_secs() >= 270);
    }

    #[test]
    fn test_delays_monotonic_before_cap() {
        let cfg = PlatformRetryConfig {
            max_retries: 10,
            base_delay_secs: 60,
            max_delay_secs: 100_000,
            rate_limit_cooldown_secs: 900,
        };
        // Doubling dominates the 10% jitter, so successive delays grow.
        let mut previous = 0u64;
        for attempt in 1..=6 {
            let plan = BackoffPolicy::decide(&cfg, &transient(), attempt);
            assert!(
                plan.delay.as_secs() > previous,
                "attempt {} did not grow: {} <= {}",
                attempt,
                plan.delay.as_secs(),
                previous
            );
            previous = plan.delay.as_secs();
        }
    }

    #[test]
    fn test_rate_limit_honors_hint() {
        let error = PlatformError::RateLimited {
            message: "slow down".to_string(),
            retry_after: Some(42),
        };
        let plan = BackoffPolicy::decide(&config(), &error, 1);
        assert!(plan.should_retry);
        assert_eq!(plan.delay, Duration::from_secs(42));
    }

    #[test]
    fn test_rate_limit_cooldown_without_hint() {
        let error = PlatformError::RateLimited {
            message: "slow down".to_string(),
            retry_after: None,
        };
        let plan = BackoffPolicy::decide(&config(), &error, 1);
        assert!(plan.should_retry);
        assert_eq!(plan.delay, Duration::from_secs(900));
    }

    #[test]
    fn test_rate_limit_still_bounded_by_budget() {
        let error = PlatformError::RateLimited {
            message: "slow down".to_string(),
            retry_after: Some(10),
        };
        let plan = BackoffPolicy::decide(&config(), &error, 3);
        assert!(!plan.should_retry);
    }

    #[test]
    fn test_timeout_is_retryable() {
        let plan = BackoffPolicy::decide(
            &config(),
            &PlatformError::Timeout("deadline exceeded".to_string()),
            1,
        );
        assert!(plan.should_retry);
    }
}
