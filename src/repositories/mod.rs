//! # Repository Layer
//!
//! SeaORM access for the engine's supporting tables. Job and lock state live
//! in [`crate::queue`] and [`crate::lock`].

pub mod audit;
pub mod catalog;
pub mod circuit_breaker;
pub mod cursor;
pub mod pause;
pub mod rate_limit;
pub mod run;

pub use audit::AuditRepository;
pub use catalog::{NewRepository, RepositoryCatalog};
pub use circuit_breaker::CircuitBreakerRepository;
pub use cursor::CursorRepository;
pub use pause::PauseRepository;
pub use rate_limit::{RateLimitRepository, bucket_key};
pub use run::{RepoFailureRates, RunRepository};
