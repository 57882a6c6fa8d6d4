//! # Data Models
//!
//! SeaORM entities for every table the engine coordinates through.

pub mod admin_audit;
pub mod circuit_breaker;
pub mod leader_lease;
pub mod rate_limit_bucket;
pub mod sync_cursor;
pub mod sync_job;
pub mod sync_lock;
pub mod sync_pause;
pub mod sync_repository;
pub mod sync_run;

pub use admin_audit::Entity as AdminAudit;
pub use circuit_breaker::Entity as CircuitBreaker;
pub use leader_lease::Entity as LeaderLease;
pub use rate_limit_bucket::Entity as RateLimitBucket;
pub use sync_cursor::Entity as SyncCursor;
pub use sync_job::Entity as SyncJob;
pub use sync_lock::Entity as SyncLock;
pub use sync_pause::Entity as SyncPause;
pub use sync_repository::Entity as SyncRepository;
pub use sync_run::Entity as SyncRun;
