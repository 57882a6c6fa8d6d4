//! Database migrations for the SCM sync engine.
//!
//! Every table the engine coordinates through is created here so the same
//! schema runs against Postgres in production and SQLite in tests.

pub use sea_orm_migration::prelude::*;

mod m2026_01_05_000001_create_sync_repositories;
mod m2026_01_05_000002_create_sync_jobs;
mod m2026_01_05_000003_create_sync_locks;
mod m2026_01_05_000004_create_sync_runs;
mod m2026_01_05_000005_create_sync_cursors;
mod m2026_01_05_000006_create_sync_circuit_breakers;
mod m2026_01_05_000007_create_sync_rate_limit_buckets;
mod m2026_01_05_000008_create_sync_pauses;
mod m2026_01_05_000009_create_sync_leader_leases;
mod m2026_01_05_000010_create_sync_admin_audit;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_01_05_000001_create_sync_repositories::Migration),
            Box::new(m2026_01_05_000002_create_sync_jobs::Migration),
            Box::new(m2026_01_05_000003_create_sync_locks::Migration),
            Box::new(m2026_01_05_000004_create_sync_runs::Migration),
            Box::new(m2026_01_05_000005_create_sync_cursors::Migration),
            Box::new(m2026_01_05_000006_create_sync_circuit_breakers::Migration),
            Box::new(m2026_01_05_000007_create_sync_rate_limit_buckets::Migration),
            Box::new(m2026_01_05_000008_create_sync_pauses::Migration),
            Box::new(m2026_01_05_000009_create_sync_leader_leases::Migration),
            Box::new(m2026_01_05_000010_create_sync_admin_audit::Migration),
        ]
    }
}
