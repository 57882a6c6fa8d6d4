//! Pure decision logic: circuit breaking and retry backoff. No I/O.

pub mod backoff;
pub mod breaker;

pub use backoff::retry_backoff;
pub use breaker::{
    BreakerEvent, BreakerSnapshot, Evaluation, ExecutionParams, GLOBAL_BREAKER_KEY, OutcomeSample,
    Rates, WindowStats, breaker_key, evaluate, execution_params, sample_window_start, take_probes,
    transition, window_stats,
};
