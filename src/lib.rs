//! # SCM Sync
//!
//! Orchestration engine that keeps mirrored SCM history (commits, merge
//! requests, review events) in sync. A singleton scheduler plans work, a pool
//! of workers claims and executes it against pluggable sources, and a reaper
//! cleans up after crashes. All coordination goes through the database.

pub mod admin;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod lock;
pub mod models;
pub mod policy;
pub mod queue;
pub mod reaper;
pub mod repositories;
pub mod run_finish;
pub mod runner;
pub mod scheduler;
pub mod server;
pub mod sources;
pub mod status;
pub mod telemetry;
pub mod types;
pub mod worker;
pub use migration;
