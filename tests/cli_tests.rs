//! Drives the `scm-sync` binary against a throwaway SQLite file.

use assert_cmd::Command;
use tempfile::TempDir;

struct Sandbox {
    dir: TempDir,
    database_url: String,
}

impl Sandbox {
    fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let database_url = format!("sqlite://{}?mode=rwc", dir.path().join("sync.db").display());
        Self { dir, database_url }
    }

    /// Runs in the sandbox directory so no `.env` files leak in.
    fn cmd(&self) -> Command {
        let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("scm-sync"));
        cmd.current_dir(self.dir.path())
            .env("SCM_SYNC_DATABASE_URL", &self.database_url)
            .env("SCM_SYNC_LOG_LEVEL", "error")
            .env("SCM_SYNC_DB_MAX_CONNECTIONS", "1");
        cmd
    }

    fn migrated() -> Self {
        let sandbox = Self::new();
        sandbox.cmd().arg("migrate").assert().success();
        sandbox
    }
}

fn stdout_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn help_lists_every_role() {
    let output = Command::new(assert_cmd::cargo::cargo_bin!("scm-sync"))
        .arg("--help")
        .output()
        .expect("run --help");
    assert!(output.status.success());
    let help = stdout_of(&output);
    for role in [
        "scheduler",
        "worker",
        "reaper",
        "status",
        "admin",
        "runner",
        "migrate",
    ] {
        assert!(help.contains(role), "missing {role} in help:\n{help}");
    }
}

#[test]
fn status_on_fresh_database_is_healthy() {
    let sandbox = Sandbox::migrated();

    let output = sandbox
        .cmd()
        .args(["status", "--health"])
        .output()
        .expect("run status");
    assert_eq!(output.status.code(), Some(0));
    assert!(stdout_of(&output).contains("health: healthy"));

    let output = sandbox
        .cmd()
        .args(["status", "--prometheus"])
        .output()
        .expect("run status --prometheus");
    assert!(output.status.success());
    assert!(stdout_of(&output).contains("scm_sync_jobs{status=\"dead\"} 0"));
}

#[test]
fn status_json_is_parseable() {
    let sandbox = Sandbox::migrated();
    let output = sandbox
        .cmd()
        .args(["status", "--json", "--health"])
        .output()
        .expect("run status --json");
    assert!(output.status.success());
    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("status output is json");
    assert_eq!(value["health"]["status"], "healthy");
    assert!(value["job_counts"].is_object());
}

#[test]
fn one_shot_roles_run_against_empty_store() {
    let sandbox = Sandbox::migrated();

    let output = sandbox
        .cmd()
        .args(["scheduler", "--once", "--json"])
        .output()
        .expect("run scheduler");
    assert!(output.status.success());
    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("scheduler output is json");
    assert_eq!(report["planned"].as_array().map(Vec::len), Some(0));

    sandbox
        .cmd()
        .args(["worker", "--once", "--worker-id", "cli-test"])
        .assert()
        .success();
    sandbox
        .cmd()
        .args(["reaper", "--once", "--dry-run"])
        .assert()
        .success();
}

#[test]
fn unfiltered_reset_dead_requires_all() {
    let sandbox = Sandbox::migrated();
    sandbox
        .cmd()
        .args(["admin", "jobs", "reset-dead"])
        .assert()
        .code(2);
    sandbox
        .cmd()
        .args(["admin", "jobs", "reset-dead", "--all", "--dry-run"])
        .assert()
        .success();
}

#[test]
fn runner_rejects_unknown_repository() {
    let sandbox = Sandbox::migrated();
    sandbox
        .cmd()
        .args(["runner", "incremental", "--repo", "nobody/nothing"])
        .assert()
        .code(2);
}
