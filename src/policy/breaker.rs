//! Circuit breaker state machine.
//!
//! Everything here is a pure function of its inputs. Callers load the stored
//! [`BreakerSnapshot`] and recent [`OutcomeSample`]s, apply an event, and
//! persist the result.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::{BreakerScope, CircuitBreakerConfig};
use crate::types::{BreakerState, DiffMode, ErrorCategory, JobType};

/// Key shared by every instance when the breaker scope is global.
pub const GLOBAL_BREAKER_KEY: &str = "global";

/// Key of the breaker guarding work for `instance` under `scope`.
///
/// Jobs without an instance fall back to the global breaker.
pub fn breaker_key(scope: BreakerScope, instance: Option<&str>) -> String {
    match (scope, instance.map(str::trim).filter(|name| !name.is_empty())) {
        (BreakerScope::Instance, Some(name)) => format!("instance:{}", name.to_ascii_lowercase()),
        _ => GLOBAL_BREAKER_KEY.to_string(),
    }
}

/// One finished run as seen by the breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeSample {
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub category: Option<ErrorCategory>,
}

impl OutcomeSample {
    fn counts(&self) -> bool {
        self.category
            .map(|category| category.counts_toward_breaker())
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WindowStats {
    pub samples: usize,
    pub failures: usize,
    pub rate_limited: usize,
    pub timeouts: usize,
}

impl WindowStats {
    fn ratio(count: usize, total: usize) -> f64 {
        if total == 0 {
            0.0
        } else {
            count as f64 / total as f64
        }
    }

    pub fn rates(&self) -> Rates {
        Rates {
            failure_rate: Self::ratio(self.failures, self.samples),
            rate_limit_rate: Self::ratio(self.rate_limited, self.samples),
            timeout_rate: Self::ratio(self.timeouts, self.samples),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Rates {
    pub failure_rate: f64,
    pub rate_limit_rate: f64,
    pub timeout_rate: f64,
}

impl Rates {
    fn smooth(self, previous: Rates, alpha: f64) -> Rates {
        let blend = |current: f64, prior: f64| alpha * current + (1.0 - alpha) * prior;
        Rates {
            failure_rate: blend(self.failure_rate, previous.failure_rate),
            rate_limit_rate: blend(self.rate_limit_rate, previous.rate_limit_rate),
            timeout_rate: blend(self.timeout_rate, previous.timeout_rate),
        }
    }

    /// First threshold these rates cross, as a human-readable reason.
    pub fn breach(&self, config: &CircuitBreakerConfig) -> Option<String> {
        if self.failure_rate >= config.failure_rate_threshold {
            return Some(format!(
                "failure_rate {:.2} >= {:.2}",
                self.failure_rate, config.failure_rate_threshold
            ));
        }
        if self.rate_limit_rate >= config.rate_limit_threshold {
            return Some(format!(
                "rate_limit_rate {:.2} >= {:.2}",
                self.rate_limit_rate, config.rate_limit_threshold
            ));
        }
        if self.timeout_rate >= config.timeout_threshold {
            return Some(format!(
                "timeout_rate {:.2} >= {:.2}",
                self.timeout_rate, config.timeout_threshold
            ));
        }
        None
    }
}

/// Counts over the most recent `window_runs` counted samples that finished
/// within `window_minutes` of `now`.
pub fn window_stats(
    samples: &[OutcomeSample],
    config: &CircuitBreakerConfig,
    now: DateTime<Utc>,
) -> WindowStats {
    let horizon = now - Duration::minutes(config.window_minutes as i64);

    let mut in_window: Vec<&OutcomeSample> = samples
        .iter()
        .filter(|sample| sample.finished_at >= horizon && sample.finished_at <= now)
        .filter(|sample| sample.counts())
        .collect();
    in_window.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
    in_window.truncate(config.window_runs);

    let mut stats = WindowStats {
        samples: in_window.len(),
        ..WindowStats::default()
    };
    for sample in in_window.iter().filter(|sample| !sample.success) {
        stats.failures += 1;
        match sample.category {
            Some(ErrorCategory::RateLimited) => stats.rate_limited += 1,
            Some(ErrorCategory::Timeout) => stats.timeouts += 1,
            _ => {}
        }
    }
    stats
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub should_open: bool,
    pub reason: Option<String>,
    pub rates: Rates,
    pub stats: WindowStats,
}

pub fn evaluate(
    samples: &[OutcomeSample],
    config: &CircuitBreakerConfig,
    previous: Option<Rates>,
    now: DateTime<Utc>,
) -> Evaluation {
    let stats = window_stats(samples, config, now);
    let current = stats.rates();
    let rates = match (config.ema_alpha, previous) {
        (Some(alpha), Some(previous)) => current.smooth(previous, alpha),
        _ => current,
    };

    let reason = if stats.samples >= config.min_samples {
        rates.breach(config)
    } else {
        None
    };

    Evaluation {
        should_open: reason.is_some(),
        reason,
        rates,
        stats,
    }
}

/// Stored breaker record in its pure form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: BreakerState,
    pub opened_at: Option<DateTime<Utc>>,
    /// Last entry into half-open. Kept after recovery so evaluations can
    /// ignore samples from before the breaker closed again.
    pub half_opened_at: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<String>,
    pub rates: Rates,
    pub consecutive_successes: u32,
    pub probes_issued: u32,
    pub probe_window_started_at: Option<DateTime<Utc>>,
}

impl BreakerSnapshot {
    pub fn closed<S: Into<String>>(key: S) -> Self {
        Self {
            key: key.into(),
            state: BreakerState::Closed,
            opened_at: None,
            half_opened_at: None,
            last_failure_reason: None,
            rates: Rates::default(),
            consecutive_successes: 0,
            probes_issued: 0,
            probe_window_started_at: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == BreakerState::Closed
    }

    fn open(mut self, reason: Option<String>, now: DateTime<Utc>) -> Self {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.half_opened_at = None;
        self.consecutive_successes = 0;
        self.probes_issued = 0;
        self.probe_window_started_at = None;
        if reason.is_some() {
            self.last_failure_reason = reason;
        }
        self
    }
}

/// Earliest finish time of samples that should feed an evaluation of
/// `snapshot`: the configured window, cut at the last recovery.
pub fn sample_window_start(
    snapshot: &BreakerSnapshot,
    config: &CircuitBreakerConfig,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let window = now - Duration::minutes(config.window_minutes as i64);
    match snapshot.half_opened_at {
        Some(recovered) if recovered > window => recovered,
        _ => window,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BreakerEvent {
    Tick,
    Outcome { success: bool, counted: bool },
    Evaluated(Evaluation),
}

pub fn transition(
    snapshot: &BreakerSnapshot,
    event: &BreakerEvent,
    config: &CircuitBreakerConfig,
    now: DateTime<Utc>,
) -> BreakerSnapshot {
    let mut next = snapshot.clone();

    match event {
        BreakerEvent::Tick => {
            if next.state == BreakerState::Open {
                let Some(opened_at) = next.opened_at else {
                    // an open record without a timestamp restarts its cool-down
                    next.opened_at = Some(now);
                    return next;
                };
                if now - opened_at >= Duration::seconds(config.open_duration_seconds as i64) {
                    next.state = BreakerState::HalfOpen;
                    next.half_opened_at = Some(now);
                    next.consecutive_successes = 0;
                    next.probes_issued = 0;
                    next.probe_window_started_at = None;
                }
            }
        }
        BreakerEvent::Outcome { counted: false, .. } => {}
        BreakerEvent::Outcome {
            success,
            counted: true,
        } => {
            if next.state != BreakerState::HalfOpen {
                return next;
            }
            if *success {
                next.consecutive_successes += 1;
                if next.consecutive_successes >= config.recovery_success_count {
                    next.state = BreakerState::Closed;
                    // half_opened_at stays as the recovery point for later windows
                    next.opened_at = None;
                    next.consecutive_successes = 0;
                    next.probes_issued = 0;
                    next.probe_window_started_at = None;
                }
            } else {
                next = next.open(Some("probe failed while half-open".to_string()), now);
            }
        }
        BreakerEvent::Evaluated(evaluation) => {
            next.rates = evaluation.rates;
            if next.state == BreakerState::Closed && evaluation.should_open {
                next = next.open(evaluation.reason.clone(), now);
            }
        }
    }

    next
}

/// How work guarded by a breaker should run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionParams {
    pub batch_size: u32,
    /// `None` means every job type is allowed.
    pub allowed_job_types: Option<Vec<JobType>>,
    pub probe_budget: u32,
    pub diff_mode: DiffMode,
}

impl ExecutionParams {
    pub fn allows(&self, job_type: JobType) -> bool {
        self.allowed_job_types
            .as_ref()
            .is_none_or(|types| types.contains(&job_type))
    }
}

pub fn execution_params(
    snapshot: &BreakerSnapshot,
    config: &CircuitBreakerConfig,
    default_batch: u32,
) -> ExecutionParams {
    match snapshot.state {
        BreakerState::Closed => ExecutionParams {
            batch_size: default_batch,
            allowed_job_types: None,
            probe_budget: 0,
            diff_mode: DiffMode::Full,
        },
        state => ExecutionParams {
            batch_size: config.degraded_batch_size.min(default_batch).max(1),
            allowed_job_types: Some(config.probe_job_types.clone()),
            probe_budget: config
                .probe_budget_per_interval
                .saturating_sub(snapshot.probes_issued),
            diff_mode: if state == BreakerState::HalfOpen {
                DiffMode::Stat
            } else {
                DiffMode::Off
            },
        },
    }
}

/// Grants up to `requested` probes from the current probe window, starting a
/// fresh window once `probe_interval_seconds` have passed. A closed breaker
/// grants everything without accounting.
pub fn take_probes(
    snapshot: &BreakerSnapshot,
    requested: u32,
    config: &CircuitBreakerConfig,
    now: DateTime<Utc>,
) -> (BreakerSnapshot, u32) {
    let mut next = snapshot.clone();
    if next.is_closed() {
        return (next, requested);
    }

    let window_expired = next.probe_window_started_at.is_none_or(|started| {
        now - started >= Duration::seconds(config.probe_interval_seconds as i64)
    });
    if window_expired {
        next.probes_issued = 0;
        next.probe_window_started_at = Some(now);
    }

    let remaining = config
        .probe_budget_per_interval
        .saturating_sub(next.probes_issued);
    let granted = requested.min(remaining);
    next.probes_issued += granted;
    (next, granted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            min_samples: 10,
            failure_rate_threshold: 0.5,
            rate_limit_threshold: 0.3,
            timeout_threshold: 0.3,
            window_runs: 50,
            window_minutes: 30,
            ema_alpha: None,
            open_duration_seconds: 300,
            recovery_success_count: 3,
            probe_budget_per_interval: 2,
            probe_interval_seconds: 300,
            ..CircuitBreakerConfig::default()
        }
    }

    fn now() -> DateTime<Utc> {
        "2025-06-01T12:00:00Z".parse().unwrap()
    }

    fn samples(successes: usize, failures: usize, category: ErrorCategory) -> Vec<OutcomeSample> {
        let mut out = Vec::new();
        for i in 0..successes {
            out.push(OutcomeSample {
                finished_at: now() - Duration::seconds(i as i64 + 1),
                success: true,
                category: None,
            });
        }
        for i in 0..failures {
            out.push(OutcomeSample {
                finished_at: now() - Duration::seconds((successes + i) as i64 + 1),
                success: false,
                category: Some(category),
            });
        }
        out
    }

    #[test]
    fn opens_above_threshold_with_enough_samples() {
        let evaluation = evaluate(&samples(4, 6, ErrorCategory::Transient), &config(), None, now());
        assert!(evaluation.should_open);
        assert_eq!(evaluation.stats.samples, 10);
        assert!((evaluation.rates.failure_rate - 0.6).abs() < 1e-9);
        assert!(evaluation.reason.unwrap().starts_with("failure_rate"));
    }

    #[test]
    fn never_opens_below_threshold() {
        let evaluation = evaluate(&samples(8, 2, ErrorCategory::Transient), &config(), None, now());
        assert!(!evaluation.should_open);
        assert!(evaluation.reason.is_none());
    }

    #[test]
    fn min_samples_guard_blocks_opening() {
        let evaluation = evaluate(&samples(0, 9, ErrorCategory::Transient), &config(), None, now());
        assert!(!evaluation.should_open);
        assert_eq!(evaluation.stats.samples, 9);
    }

    #[test]
    fn rate_limits_trip_their_own_threshold() {
        let evaluation = evaluate(&samples(7, 3, ErrorCategory::RateLimited), &config(), None, now());
        assert!(evaluation.should_open);
        assert!(evaluation.reason.unwrap().starts_with("rate_limit_rate"));
    }

    #[test]
    fn contention_and_stale_samples_are_excluded() {
        let mut all = samples(10, 0, ErrorCategory::Transient);
        all.extend(samples(0, 20, ErrorCategory::Contention));
        all.push(OutcomeSample {
            finished_at: now() - Duration::hours(2),
            success: false,
            category: Some(ErrorCategory::Transient),
        });
        let stats = window_stats(&all, &config(), now());
        assert_eq!(stats.samples, 10);
        assert_eq!(stats.failures, 0);
    }

    #[test]
    fn window_keeps_most_recent_runs() {
        let cfg = CircuitBreakerConfig {
            window_runs: 5,
            ..config()
        };
        // five recent successes, older failures fall outside the run window
        let stats = window_stats(&samples(5, 5, ErrorCategory::Transient), &cfg, now());
        assert_eq!(stats.samples, 5);
        assert_eq!(stats.failures, 0);
    }

    #[test]
    fn ema_smooths_towards_previous_rates() {
        let cfg = CircuitBreakerConfig {
            ema_alpha: Some(0.5),
            ..config()
        };
        let evaluation = evaluate(
            &samples(4, 6, ErrorCategory::Transient),
            &cfg,
            Some(Rates::default()),
            now(),
        );
        assert!((evaluation.rates.failure_rate - 0.3).abs() < 1e-9);
        assert!(!evaluation.should_open);
    }

    #[test]
    fn open_half_open_closed_cycle() {
        let cfg = config();
        let closed = BreakerSnapshot::closed("instance:gitlab.example.com");
        let evaluation = evaluate(&samples(0, 10, ErrorCategory::Timeout), &cfg, None, now());
        let open = transition(&closed, &BreakerEvent::Evaluated(evaluation), &cfg, now());
        assert_eq!(open.state, BreakerState::Open);
        assert_eq!(open.opened_at, Some(now()));

        let still_open = transition(&open, &BreakerEvent::Tick, &cfg, now() + Duration::seconds(299));
        assert_eq!(still_open.state, BreakerState::Open);

        let later = now() + Duration::seconds(300);
        let half_open = transition(&open, &BreakerEvent::Tick, &cfg, later);
        assert_eq!(half_open.state, BreakerState::HalfOpen);
        assert_eq!(half_open.half_opened_at, Some(later));

        let success = BreakerEvent::Outcome {
            success: true,
            counted: true,
        };
        let one = transition(&half_open, &success, &cfg, later);
        let two = transition(&one, &success, &cfg, later);
        assert_eq!(two.state, BreakerState::HalfOpen);
        let three = transition(&two, &success, &cfg, later);
        assert_eq!(three.state, BreakerState::Closed);
        assert!(three.opened_at.is_none());
        assert_eq!(sample_window_start(&three, &cfg, later), later);
    }

    #[test]
    fn single_probe_failure_reopens() {
        let cfg = config();
        let mut half_open = BreakerSnapshot::closed("global");
        half_open.state = BreakerState::HalfOpen;
        half_open.consecutive_successes = 2;

        let failed = transition(
            &half_open,
            &BreakerEvent::Outcome {
                success: false,
                counted: true,
            },
            &cfg,
            now(),
        );
        assert_eq!(failed.state, BreakerState::Open);
        assert_eq!(failed.consecutive_successes, 0);
        assert_eq!(failed.opened_at, Some(now()));
    }

    #[test]
    fn uncounted_outcomes_never_move_the_machine() {
        let cfg = config();
        let mut half_open = BreakerSnapshot::closed("global");
        half_open.state = BreakerState::HalfOpen;
        let after = transition(
            &half_open,
            &BreakerEvent::Outcome {
                success: false,
                counted: false,
            },
            &cfg,
            now(),
        );
        assert_eq!(after, half_open);
    }

    #[test]
    fn degraded_params_restrict_job_types() {
        let cfg = config();
        let mut open = BreakerSnapshot::closed("global");
        open.state = BreakerState::Open;
        let params = execution_params(&open, &cfg, 100);
        assert_eq!(params.batch_size, cfg.degraded_batch_size);
        assert!(params.allows(JobType::Commits));
        assert!(!params.allows(JobType::MergeRequests));
        assert_eq!(params.diff_mode, DiffMode::Off);

        let closed = execution_params(&BreakerSnapshot::closed("global"), &cfg, 100);
        assert_eq!(closed.batch_size, 100);
        assert!(closed.allows(JobType::ReviewEvents));
    }

    #[test]
    fn probe_budget_refills_per_interval() {
        let cfg = config();
        let mut open = BreakerSnapshot::closed("global");
        open.state = BreakerState::Open;

        let (after_first, granted) = take_probes(&open, 5, &cfg, now());
        assert_eq!(granted, 2);
        let (after_second, granted) = take_probes(&after_first, 1, &cfg, now());
        assert_eq!(granted, 0);

        let refill_at = now() + Duration::seconds(300);
        let (_, granted) = take_probes(&after_second, 1, &cfg, refill_at);
        assert_eq!(granted, 1);
    }

    #[test]
    fn breaker_keys_follow_scope() {
        assert_eq!(
            breaker_key(BreakerScope::Instance, Some("GitLab.Example.com")),
            "instance:gitlab.example.com"
        );
        assert_eq!(breaker_key(BreakerScope::Instance, None), "global");
        assert_eq!(
            breaker_key(BreakerScope::Global, Some("gitlab.example.com")),
            "global"
        );
    }
}
