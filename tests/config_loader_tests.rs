use scm_sync::config::{BreakerScope, ConfigError, ConfigLoader};
use scm_sync::types::JobType;
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    let keys: Vec<String> = env::vars()
        .map(|(key, _)| key)
        .filter(|key| key.starts_with("SCM_SYNC_"))
        .collect();
    unsafe {
        for key in keys {
            env::remove_var(key);
        }
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

fn loader_for(dir: &TempDir) -> ConfigLoader {
    ConfigLoader::with_base_dir(PathBuf::from(dir.path()))
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    let cfg = loader_for(&temp_dir).load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.log_format, "json");
    assert_eq!(cfg.source, "example");
    assert!(cfg.metrics_bind_addr.is_none());
    assert_eq!(cfg.queue.lease_seconds, 300);
    assert_eq!(cfg.queue.max_attempts, 3);
    assert_eq!(cfg.queue.contention_cap, 20);
    assert_eq!(cfg.retry.base_seconds, 5);
    assert_eq!(cfg.retry.max_seconds, 900);
    assert_eq!(cfg.scheduler.min_cursor_age_seconds, 900);
    assert_eq!(cfg.scheduler.initial_backfill_days, 30);
    assert_eq!(cfg.reaper.grace_seconds, 60);
    assert_eq!(cfg.breaker.scope, BreakerScope::Instance);
    assert_eq!(cfg.breaker.probe_job_types, vec![JobType::Commits]);
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "SCM_SYNC_QUEUE_LEASE_SECONDS=120\nSCM_SYNC_LOG_LEVEL=warn\n",
    );
    write_env_file(&temp_dir, ".env.staging", "SCM_SYNC_QUEUE_LEASE_SECONDS=240\n");
    write_env_file(
        &temp_dir,
        ".env.staging.local",
        "SCM_SYNC_QUEUE_LEASE_SECONDS=600\n",
    );

    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        "SCM_SYNC_PROFILE=staging\nSCM_SYNC_QUEUE_LEASE_SECONDS=180\nUNRELATED_KEY=ignored\n",
    );

    let cfg = loader_for(&temp_dir)
        .load()
        .expect("config loads with layered env files");

    assert_eq!(cfg.profile, "staging");
    assert_eq!(cfg.queue.lease_seconds, 600);
    assert_eq!(cfg.log_level, "warn");
    clear_env();
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "SCM_SYNC_WORKER_CONCURRENCY=2\nSCM_SYNC_SCHEDULER_JOB_TYPES=commits\n",
    );

    unsafe {
        env::set_var("SCM_SYNC_WORKER_CONCURRENCY", "16");
        env::set_var("SCM_SYNC_BREAKER_SCOPE", "GLOBAL");
    }

    let cfg = loader_for(&temp_dir)
        .load()
        .expect("config loads with env override");
    assert_eq!(cfg.worker.concurrency, 16);
    assert_eq!(cfg.breaker.scope, BreakerScope::Global);
    assert_eq!(cfg.scheduler.job_types, vec![JobType::Commits]);

    clear_env();
}

#[test]
fn retry_overrides_are_keyed_by_instance() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "SCM_SYNC_RETRY_OVERRIDE_GITLAB_EXAMPLE_COM__BASE_SECONDS=30\n\
         SCM_SYNC_RETRY_OVERRIDE_GITLAB_EXAMPLE_COM__MAX_SECONDS=1800\n\
         SCM_SYNC_RETRY_OVERRIDE_GITLAB_EXAMPLE_COM__JITTER_FACTOR=0.25\n",
    );

    let cfg = loader_for(&temp_dir).load().expect("overrides load");
    let over = cfg
        .retry
        .override_for(Some("gitlab.example.com"))
        .expect("override present");
    assert_eq!(over.base_seconds, Some(30));
    assert_eq!(over.max_seconds, Some(1800));
    assert_eq!(over.jitter_factor, Some(0.25));
    assert!(cfg.retry.override_for(Some("gitlab.com")).is_none());
    assert!(cfg.retry.override_for(None).is_none());

    clear_env();
}

#[test]
fn invalid_numbers_name_the_variable() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("SCM_SYNC_QUEUE_MAX_ATTEMPTS", "three");
    }
    let temp_dir = TempDir::new().unwrap();
    let err = loader_for(&temp_dir)
        .load()
        .expect_err("non-numeric attempts should fail");
    match err {
        ConfigError::InvalidValue { key, value } => {
            assert_eq!(key, "SCM_SYNC_QUEUE_MAX_ATTEMPTS");
            assert_eq!(value, "three");
        }
        other => panic!("unexpected error: {other}"),
    }

    clear_env();
}

#[test]
fn validation_rejects_inconsistent_settings() {
    let _guard = env_guard();
    clear_env();
    let temp_dir = TempDir::new().unwrap();

    unsafe {
        env::set_var("SCM_SYNC_QUEUE_LEASE_SECONDS", "5");
    }
    assert!(matches!(
        loader_for(&temp_dir).load(),
        Err(ConfigError::InvalidLeaseSeconds { value: 5 })
    ));
    clear_env();

    unsafe {
        env::set_var("SCM_SYNC_QUEUE_LEASE_SECONDS", "60");
        env::set_var("SCM_SYNC_WORKER_RENEW_INTERVAL_SECONDS", "90");
    }
    assert!(matches!(
        loader_for(&temp_dir).load(),
        Err(ConfigError::InvalidRenewInterval { .. })
    ));
    clear_env();

    unsafe {
        env::set_var("SCM_SYNC_METRICS_BIND_ADDR", "not-an-addr");
    }
    let err = loader_for(&temp_dir)
        .load()
        .expect_err("invalid bind addr should fail");
    assert!(format!("{err}").contains("invalid metrics bind address"));
    clear_env();
}

#[test]
fn unknown_source_is_rejected() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("SCM_SYNC_SOURCE", "Perforce");
    }
    let temp_dir = TempDir::new().unwrap();
    match loader_for(&temp_dir).load() {
        Err(ConfigError::UnknownSource { value }) => assert_eq!(value, "perforce"),
        other => panic!("expected UnknownSource, got {other:?}"),
    }

    unsafe {
        env::set_var("SCM_SYNC_SOURCE", "none");
    }
    let cfg = loader_for(&temp_dir).load().expect("none is accepted");
    assert_eq!(cfg.source, "none");
    clear_env();
}
