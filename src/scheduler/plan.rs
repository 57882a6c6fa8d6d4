//! Tick planning.
//!
//! [`plan_tick`] is a pure function of a [`PlanningSnapshot`] loaded by the
//! scheduler: it decides which repository/job type keys get a job this tick,
//! in which mode, with which priority and payload, and records why every
//! other candidate was passed over.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::{CircuitBreakerConfig, SchedulerConfig};
use crate::policy::{
    BreakerSnapshot, ExecutionParams, breaker_key, execution_params, take_probes,
};
use crate::repositories::{RepoFailureRates, bucket_key};
use crate::types::{BreakerState, JobMode, JobPayload, JobType, SourceKind, Watermark};

/// Priority given to a key that has never been synced.
const BACKFILL_PRIORITY: i32 = 100;
/// Cap on the staleness component of an incremental job's priority, in hours.
const MAX_STALENESS_HOURS: u64 = 99;
const FAILURE_RATE_WEIGHT: f64 = 50.0;

#[derive(Debug, Clone)]
pub struct RepoCandidate {
    pub repo_id: i64,
    pub repo_key: String,
    pub source_kind: SourceKind,
    pub gitlab_instance: Option<String>,
    pub tenant_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CursorState {
    pub watermark: Option<Watermark>,
    pub updated_at: DateTime<Utc>,
}

/// Active jobs counted against the concurrency budgets.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    pub total: usize,
    pub by_instance: HashMap<String, usize>,
    pub by_tenant: HashMap<String, usize>,
}

impl InFlight {
    pub fn add(&mut self, instance: Option<&str>, tenant: Option<&str>) {
        self.total += 1;
        if let Some(instance) = instance {
            *self.by_instance.entry(instance.to_string()).or_default() += 1;
        }
        if let Some(tenant) = tenant {
            *self.by_tenant.entry(tenant.to_string()).or_default() += 1;
        }
    }

    fn instance(&self, instance: Option<&str>) -> usize {
        instance
            .and_then(|name| self.by_instance.get(name).copied())
            .unwrap_or(0)
    }

    fn tenant(&self, tenant: Option<&str>) -> usize {
        tenant
            .and_then(|name| self.by_tenant.get(name).copied())
            .unwrap_or(0)
    }
}

/// Everything one tick needs, loaded up front.
#[derive(Debug, Clone, Default)]
pub struct PlanningSnapshot {
    pub now: DateTime<Utc>,
    /// Enabled repositories in catalog order.
    pub repositories: Vec<RepoCandidate>,
    pub cursors: HashMap<(i64, JobType), CursorState>,
    pub active_keys: HashSet<(i64, JobType)>,
    /// Keys parked on a dead job until an operator resets it.
    pub dead_keys: HashSet<(i64, JobType)>,
    pub in_flight: InFlight,
    pub paused_keys: HashSet<(i64, JobType)>,
    /// Bucket keys of rate-limit buckets still paused at `now`.
    pub paused_buckets: HashSet<String>,
    /// Breaker states with time-based transitions already applied.
    pub breakers: HashMap<String, BreakerSnapshot>,
    pub failure_rates: HashMap<(i64, JobType), RepoFailureRates>,
    /// Keys with a run that finished within `min_cursor_age_seconds`.
    pub recently_synced: HashSet<(i64, JobType)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyQueued,
    DeadLettered,
    Paused,
    RateLimited,
    CircuitOpen,
    ProbeBudget,
    RecentlySynced,
    GlobalBudget,
    InstanceBudget,
    TenantBudget,
    ScanLimit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedCandidate {
    pub repo_id: i64,
    pub job_type: JobType,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedJob {
    pub repo_id: i64,
    pub repo_key: String,
    pub job_type: JobType,
    pub mode: JobMode,
    pub priority: i32,
    pub breaker_key: String,
    pub payload: JobPayload,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickPlan {
    pub jobs: Vec<PlannedJob>,
    pub skipped: Vec<SkippedCandidate>,
    /// Breakers whose probe accounting changed while planning.
    pub breakers: Vec<BreakerSnapshot>,
}

impl TickPlan {
    pub fn skip_counts(&self) -> BTreeMap<SkipReason, usize> {
        let mut counts = BTreeMap::new();
        for skipped in &self.skipped {
            *counts.entry(skipped.reason).or_default() += 1;
        }
        counts
    }
}

struct Candidate<'a> {
    repo: &'a RepoCandidate,
    job_type: JobType,
    mode: JobMode,
    priority: i32,
    breaker_key: String,
    breaker_state: BreakerState,
    params: ExecutionParams,
}

/// Job types planned for a repository of `kind`.
pub fn planned_job_types(kind: SourceKind, configured: &[JobType]) -> Vec<JobType> {
    kind.job_types()
        .iter()
        .copied()
        .filter(|job_type| configured.is_empty() || configured.contains(job_type))
        .collect()
}

/// Older cursors and keys that have been failing or rate limited sort first.
pub fn priority(mode: JobMode, cursor_age: Option<Duration>, rates: RepoFailureRates) -> i32 {
    let staleness = match (mode, cursor_age) {
        (JobMode::Backfill, _) => BACKFILL_PRIORITY,
        (JobMode::Incremental, Some(age)) => {
            (age.num_hours().max(0) as u64).min(MAX_STALENESS_HOURS) as i32
        }
        (JobMode::Incremental, None) => 0,
    };
    let trouble = (rates.failure_rate + rates.rate_limit_rate) * FAILURE_RATE_WEIGHT;
    staleness + trouble.round() as i32
}

pub fn plan_tick(
    snapshot: &PlanningSnapshot,
    scheduler: &SchedulerConfig,
    breaker: &CircuitBreakerConfig,
) -> TickPlan {
    let now = snapshot.now;
    let min_age = Duration::seconds(scheduler.min_cursor_age_seconds as i64);
    let mut plan = TickPlan::default();
    let mut candidates = Vec::new();

    for repo in &snapshot.repositories {
        for job_type in planned_job_types(repo.source_kind, &scheduler.job_types) {
            let key = (repo.repo_id, job_type);
            let skip = |reason| SkippedCandidate {
                repo_id: repo.repo_id,
                job_type,
                reason,
            };

            if snapshot.active_keys.contains(&key) {
                plan.skipped.push(skip(SkipReason::AlreadyQueued));
                continue;
            }
            if snapshot.dead_keys.contains(&key) {
                plan.skipped.push(skip(SkipReason::DeadLettered));
                continue;
            }
            if snapshot.paused_keys.contains(&key) {
                plan.skipped.push(skip(SkipReason::Paused));
                continue;
            }
            if repo
                .gitlab_instance
                .as_deref()
                .is_some_and(|instance| snapshot.paused_buckets.contains(&bucket_key(instance)))
            {
                plan.skipped.push(skip(SkipReason::RateLimited));
                continue;
            }

            let breaker_key = breaker_key(breaker.scope, repo.gitlab_instance.as_deref());
            let state = snapshot
                .breakers
                .get(&breaker_key)
                .cloned()
                .unwrap_or_else(|| BreakerSnapshot::closed(&breaker_key));
            let params = execution_params(&state, breaker, scheduler.default_batch_size);
            if !params.allows(job_type) {
                plan.skipped.push(skip(SkipReason::CircuitOpen));
                continue;
            }

            if snapshot.recently_synced.contains(&key) {
                plan.skipped.push(skip(SkipReason::RecentlySynced));
                continue;
            }
            let cursor = snapshot
                .cursors
                .get(&key)
                .filter(|cursor| cursor.watermark.is_some());
            let (mode, cursor_age) = match cursor {
                None => (JobMode::Backfill, None),
                Some(cursor) => {
                    let age = now - cursor.updated_at;
                    if age < min_age {
                        plan.skipped.push(skip(SkipReason::RecentlySynced));
                        continue;
                    }
                    (JobMode::Incremental, Some(age))
                }
            };

            let rates = snapshot.failure_rates.get(&key).copied().unwrap_or_default();
            candidates.push(Candidate {
                repo,
                job_type,
                mode,
                priority: priority(mode, cursor_age, rates),
                breaker_key,
                breaker_state: state.state,
                params,
            });
        }
    }

    candidates.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.repo.created_at.cmp(&b.repo.created_at))
            .then(a.repo.repo_id.cmp(&b.repo.repo_id))
            .then(a.job_type.cmp(&b.job_type))
    });
    let ordered = if scheduler.tenant_fair_share_per_tick > 0 {
        round_robin_by_tenant(candidates, scheduler.tenant_fair_share_per_tick)
    } else {
        candidates
    };

    let mut in_flight = snapshot.in_flight.clone();
    let mut breakers: HashMap<String, BreakerSnapshot> = HashMap::new();
    for candidate in ordered {
        let instance = candidate.repo.gitlab_instance.as_deref();
        let tenant = candidate.repo.tenant_id.as_deref();
        let skip = |reason| SkippedCandidate {
            repo_id: candidate.repo.repo_id,
            job_type: candidate.job_type,
            reason,
        };

        let reason = if plan.jobs.len() >= scheduler.max_enqueue_per_scan {
            Some(SkipReason::ScanLimit)
        } else if in_flight.total >= scheduler.global_concurrency {
            Some(SkipReason::GlobalBudget)
        } else if instance.is_some()
            && in_flight.instance(instance) >= scheduler.per_instance_concurrency
        {
            Some(SkipReason::InstanceBudget)
        } else if tenant.is_some() && in_flight.tenant(tenant) >= scheduler.per_tenant_concurrency
        {
            Some(SkipReason::TenantBudget)
        } else {
            None
        };
        if let Some(reason) = reason {
            plan.skipped.push(skip(reason));
            continue;
        }

        let is_probe = candidate.breaker_state != BreakerState::Closed;
        if is_probe {
            let current = breakers
                .get(&candidate.breaker_key)
                .or_else(|| snapshot.breakers.get(&candidate.breaker_key))
                .cloned()
                .unwrap_or_else(|| BreakerSnapshot::closed(&candidate.breaker_key));
            let (next, granted) = take_probes(&current, 1, breaker, now);
            if granted == 0 {
                plan.skipped.push(skip(SkipReason::ProbeBudget));
                continue;
            }
            breakers.insert(candidate.breaker_key.clone(), next);
        }

        in_flight.add(instance, tenant);
        plan.jobs.push(PlannedJob {
            repo_id: candidate.repo.repo_id,
            repo_key: candidate.repo.repo_key.clone(),
            job_type: candidate.job_type,
            mode: candidate.mode,
            priority: candidate.priority,
            payload: payload_for(&candidate, is_probe, scheduler, now),
            breaker_key: candidate.breaker_key,
        });
    }

    let mut changed: Vec<BreakerSnapshot> = breakers.into_values().collect();
    changed.sort_by(|a, b| a.key.cmp(&b.key));
    plan.breakers = changed;
    plan
}

fn payload_for(
    candidate: &Candidate<'_>,
    is_probe: bool,
    scheduler: &SchedulerConfig,
    now: DateTime<Utc>,
) -> JobPayload {
    let mut payload = JobPayload {
        gitlab_instance: candidate.repo.gitlab_instance.clone(),
        tenant_id: candidate.repo.tenant_id.clone(),
        is_probe,
        ..JobPayload::default()
    };
    if is_probe {
        payload.circuit_state = Some(candidate.breaker_state);
        payload.suggested_batch_size = Some(candidate.params.batch_size);
        payload.suggested_diff_mode = Some(candidate.params.diff_mode);
    }
    if candidate.mode == JobMode::Backfill && !candidate.repo.source_kind.uses_revisions() {
        payload.since = Some(now - Duration::days(i64::from(scheduler.initial_backfill_days)));
        payload.until = Some(now);
    }
    payload
}

/// Interleaves candidates so each tenant gets up to `share` slots per pass,
/// keeping priority order within a tenant. Tenants are visited in the order
/// of their best candidate.
fn round_robin_by_tenant(candidates: Vec<Candidate<'_>>, share: usize) -> Vec<Candidate<'_>> {
    let mut order: Vec<Option<String>> = Vec::new();
    let mut queues: HashMap<Option<String>, VecDeque<Candidate<'_>>> = HashMap::new();
    for candidate in candidates {
        let tenant = candidate.repo.tenant_id.clone();
        if !queues.contains_key(&tenant) {
            order.push(tenant.clone());
        }
        queues.entry(tenant).or_default().push_back(candidate);
    }

    let mut ordered = Vec::new();
    loop {
        let mut progressed = false;
        for tenant in &order {
            let Some(queue) = queues.get_mut(tenant) else {
                continue;
            };
            for _ in 0..share {
                match queue.pop_front() {
                    Some(candidate) => {
                        ordered.push(candidate);
                        progressed = true;
                    }
                    None => break,
                }
            }
        }
        if !progressed {
            break;
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        "2025-06-01T12:00:00Z".parse().unwrap()
    }

    fn scheduler() -> SchedulerConfig {
        SchedulerConfig {
            min_cursor_age_seconds: 900,
            max_enqueue_per_scan: 100,
            global_concurrency: 100,
            per_instance_concurrency: 100,
            per_tenant_concurrency: 100,
            tenant_fair_share_per_tick: 0,
            job_types: vec![JobType::Commits],
            ..SchedulerConfig::default()
        }
    }

    fn repo(repo_id: i64, instance: &str, tenant: &str) -> RepoCandidate {
        RepoCandidate {
            repo_id,
            repo_key: format!("{instance}/group/project-{repo_id}"),
            source_kind: SourceKind::GitLab,
            gitlab_instance: Some(instance.to_string()),
            tenant_id: Some(tenant.to_string()),
            created_at: now() - Duration::days(30) + Duration::seconds(repo_id),
        }
    }

    fn cursor(age: Duration) -> CursorState {
        CursorState {
            watermark: Some(Watermark::Timestamp(now() - age)),
            updated_at: now() - age,
        }
    }

    fn snapshot(repositories: Vec<RepoCandidate>) -> PlanningSnapshot {
        PlanningSnapshot {
            now: now(),
            repositories,
            ..PlanningSnapshot::default()
        }
    }

    #[test]
    fn missing_cursor_plans_backfill_with_window() {
        let plan = plan_tick(
            &snapshot(vec![repo(1, "gitlab.example.com", "acme")]),
            &scheduler(),
            &CircuitBreakerConfig::default(),
        );
        assert_eq!(plan.jobs.len(), 1);
        let job = &plan.jobs[0];
        assert_eq!(job.mode, JobMode::Backfill);
        assert_eq!(job.priority, BACKFILL_PRIORITY);
        assert_eq!(job.payload.until, Some(now()));
        assert_eq!(
            job.payload.since,
            Some(now() - Duration::days(i64::from(scheduler().initial_backfill_days)))
        );
        assert_eq!(job.payload.gitlab_instance.as_deref(), Some("gitlab.example.com"));
    }

    #[test]
    fn fresh_cursor_and_active_keys_are_skipped() {
        let mut snap = snapshot(vec![
            repo(1, "gitlab.example.com", "acme"),
            repo(2, "gitlab.example.com", "acme"),
            repo(3, "gitlab.example.com", "acme"),
        ]);
        snap.cursors
            .insert((1, JobType::Commits), cursor(Duration::minutes(5)));
        snap.cursors
            .insert((2, JobType::Commits), cursor(Duration::hours(3)));
        snap.active_keys.insert((3, JobType::Commits));

        let plan = plan_tick(&snap, &scheduler(), &CircuitBreakerConfig::default());
        assert_eq!(plan.jobs.len(), 1);
        assert_eq!(plan.jobs[0].repo_id, 2);
        assert_eq!(plan.jobs[0].mode, JobMode::Incremental);
        assert_eq!(plan.jobs[0].priority, 3);

        let counts = plan.skip_counts();
        assert_eq!(counts.get(&SkipReason::RecentlySynced), Some(&1));
        assert_eq!(counts.get(&SkipReason::AlreadyQueued), Some(&1));
    }

    #[test]
    fn dead_lettered_keys_wait_for_an_operator() {
        let mut snap = snapshot(vec![
            repo(1, "gitlab.example.com", "acme"),
            repo(2, "gitlab.example.com", "acme"),
        ]);
        snap.cursors
            .insert((1, JobType::Commits), cursor(Duration::hours(6)));
        snap.dead_keys.insert((1, JobType::Commits));

        let plan = plan_tick(&snap, &scheduler(), &CircuitBreakerConfig::default());
        let planned: Vec<i64> = plan.jobs.iter().map(|job| job.repo_id).collect();
        assert_eq!(planned, vec![2]);
        assert_eq!(plan.skip_counts().get(&SkipReason::DeadLettered), Some(&1));
    }

    #[test]
    fn pauses_and_rate_limited_instances_are_skipped() {
        let mut snap = snapshot(vec![
            repo(1, "gitlab.example.com", "acme"),
            repo(2, "GitLab.Other.com", "acme"),
        ]);
        snap.paused_keys.insert((1, JobType::Commits));
        snap.paused_buckets.insert("gitlab.other.com".to_string());

        let plan = plan_tick(&snap, &scheduler(), &CircuitBreakerConfig::default());
        assert!(plan.jobs.is_empty());
        let counts = plan.skip_counts();
        assert_eq!(counts.get(&SkipReason::Paused), Some(&1));
        assert_eq!(counts.get(&SkipReason::RateLimited), Some(&1));
    }

    #[test]
    fn older_cursors_and_failing_keys_sort_first() {
        let mut snap = snapshot(vec![
            repo(1, "gitlab.example.com", "acme"),
            repo(2, "gitlab.example.com", "acme"),
            repo(3, "gitlab.example.com", "acme"),
        ]);
        snap.cursors
            .insert((1, JobType::Commits), cursor(Duration::hours(2)));
        snap.cursors
            .insert((2, JobType::Commits), cursor(Duration::hours(10)));
        snap.cursors
            .insert((3, JobType::Commits), cursor(Duration::hours(2)));
        snap.failure_rates.insert(
            (3, JobType::Commits),
            RepoFailureRates {
                runs: 10,
                failure_rate: 0.5,
                rate_limit_rate: 0.2,
            },
        );

        let plan = plan_tick(&snap, &scheduler(), &CircuitBreakerConfig::default());
        let order: Vec<i64> = plan.jobs.iter().map(|job| job.repo_id).collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[test]
    fn ties_break_on_repository_creation() {
        let plan = plan_tick(
            &snapshot(vec![
                repo(7, "gitlab.example.com", "acme"),
                repo(4, "gitlab.example.com", "acme"),
            ]),
            &scheduler(),
            &CircuitBreakerConfig::default(),
        );
        let order: Vec<i64> = plan.jobs.iter().map(|job| job.repo_id).collect();
        assert_eq!(order, vec![4, 7]);
    }

    #[test]
    fn concurrency_budgets_apply() {
        let mut snap = snapshot(vec![
            repo(1, "gitlab.a.com", "acme"),
            repo(2, "gitlab.a.com", "acme"),
            repo(3, "gitlab.b.com", "acme"),
            repo(4, "gitlab.b.com", "globex"),
        ]);
        snap.in_flight.add(Some("gitlab.a.com"), Some("acme"));
        let config = SchedulerConfig {
            per_instance_concurrency: 2,
            per_tenant_concurrency: 2,
            global_concurrency: 4,
            ..scheduler()
        };

        let plan = plan_tick(&snap, &config, &CircuitBreakerConfig::default());
        let planned: Vec<i64> = plan.jobs.iter().map(|job| job.repo_id).collect();
        assert_eq!(planned, vec![1, 4]);
        let counts = plan.skip_counts();
        assert_eq!(counts.get(&SkipReason::InstanceBudget), Some(&1));
        assert_eq!(counts.get(&SkipReason::TenantBudget), Some(&1));
    }

    #[test]
    fn scan_limit_caps_enqueues() {
        let repos = (1..=5).map(|id| repo(id, "gitlab.example.com", "acme")).collect();
        let config = SchedulerConfig {
            max_enqueue_per_scan: 2,
            ..scheduler()
        };
        let plan = plan_tick(&snapshot(repos), &config, &CircuitBreakerConfig::default());
        assert_eq!(plan.jobs.len(), 2);
        assert_eq!(plan.skip_counts().get(&SkipReason::ScanLimit), Some(&3));
    }

    #[test]
    fn tenant_fair_share_interleaves() {
        let repos = vec![
            repo(1, "gitlab.example.com", "acme"),
            repo(2, "gitlab.example.com", "acme"),
            repo(3, "gitlab.example.com", "acme"),
            repo(4, "gitlab.example.com", "globex"),
        ];
        let config = SchedulerConfig {
            tenant_fair_share_per_tick: 1,
            max_enqueue_per_scan: 2,
            ..scheduler()
        };
        let plan = plan_tick(&snapshot(repos), &config, &CircuitBreakerConfig::default());
        let planned: Vec<i64> = plan.jobs.iter().map(|job| job.repo_id).collect();
        assert_eq!(planned, vec![1, 4]);
    }

    #[test]
    fn open_breaker_allows_probes_within_budget() {
        let breaker = CircuitBreakerConfig {
            probe_job_types: vec![JobType::Commits],
            probe_budget_per_interval: 1,
            degraded_batch_size: 10,
            ..CircuitBreakerConfig::default()
        };
        let key = breaker_key(breaker.scope, Some("gitlab.example.com"));
        let mut half_open = BreakerSnapshot::closed(&key);
        half_open.state = BreakerState::HalfOpen;

        let mut snap = snapshot(vec![
            repo(1, "gitlab.example.com", "acme"),
            repo(2, "gitlab.example.com", "acme"),
        ]);
        snap.breakers.insert(key.clone(), half_open);

        let plan = plan_tick(&snap, &scheduler(), &breaker);
        assert_eq!(plan.jobs.len(), 1);
        let probe = &plan.jobs[0].payload;
        assert!(probe.is_probe);
        assert_eq!(probe.circuit_state, Some(BreakerState::HalfOpen));
        assert_eq!(probe.suggested_batch_size, Some(10));
        assert_eq!(plan.skip_counts().get(&SkipReason::ProbeBudget), Some(&1));
        assert_eq!(plan.breakers.len(), 1);
        assert_eq!(plan.breakers[0].probes_issued, 1);
    }

    #[test]
    fn open_breaker_blocks_non_probe_job_types() {
        let breaker = CircuitBreakerConfig {
            probe_job_types: vec![JobType::Commits],
            ..CircuitBreakerConfig::default()
        };
        let key = breaker_key(breaker.scope, Some("gitlab.example.com"));
        let mut open = BreakerSnapshot::closed(&key);
        open.state = BreakerState::Open;
        open.opened_at = Some(now());

        let mut snap = snapshot(vec![repo(1, "gitlab.example.com", "acme")]);
        snap.breakers.insert(key, open);
        let config = SchedulerConfig {
            job_types: vec![JobType::MergeRequests],
            ..scheduler()
        };

        let plan = plan_tick(&snap, &config, &breaker);
        assert!(plan.jobs.is_empty());
        assert_eq!(plan.skip_counts().get(&SkipReason::CircuitOpen), Some(&1));
    }

    #[test]
    fn svn_repositories_only_plan_commits() {
        assert_eq!(planned_job_types(SourceKind::Svn, &[]), vec![JobType::Commits]);
        assert_eq!(
            planned_job_types(SourceKind::GitLab, &[JobType::ReviewEvents]),
            vec![JobType::ReviewEvents]
        );
    }
}
