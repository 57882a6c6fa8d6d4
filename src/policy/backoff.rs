//! Retry backoff for failed jobs.

use rand::{Rng, thread_rng};

use crate::config::RetryPolicyConfig;
use crate::types::ErrorCategory;

/// Seconds to wait before the next attempt.
///
/// `base * 2^prior_failures` capped at `max`, stretched for rate limits and
/// timeouts, never shorter than an upstream `retry_after`, plus up to
/// `jitter_factor` of random jitter. Instance overrides replace base, max and
/// jitter.
pub fn retry_backoff(
    category: ErrorCategory,
    prior_failures: u32,
    retry_after_seconds: Option<f64>,
    policy: &RetryPolicyConfig,
    instance: Option<&str>,
) -> f64 {
    let overrides = policy.override_for(instance);

    let base_seconds = overrides
        .and_then(|o| o.base_seconds)
        .unwrap_or(policy.base_seconds) as f64;
    let max_seconds = overrides
        .and_then(|o| o.max_seconds)
        .unwrap_or(policy.max_seconds) as f64;
    let jitter_factor = overrides
        .and_then(|o| o.jitter_factor)
        .unwrap_or(policy.jitter_factor);

    let exponent = prior_failures.min(30) as i32;
    let mut backoff = (base_seconds * 2_f64.powi(exponent)).min(max_seconds);

    match category {
        ErrorCategory::RateLimited => backoff *= policy.rate_limit_multiplier,
        ErrorCategory::Timeout => backoff *= policy.timeout_multiplier,
        _ => {}
    }

    if let Some(retry_after) = retry_after_seconds.filter(|value| value.is_finite()) {
        backoff = backoff.max(retry_after);
    }

    let jitter_ceiling = jitter_factor * backoff;
    if jitter_ceiling <= 0.0 {
        return backoff;
    }

    backoff + thread_rng().gen_range(0.0..jitter_ceiling)
}
