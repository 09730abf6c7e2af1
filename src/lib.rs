//! # Repository Updater Library
//!
//! Keeps a fleet of repositories mirrored locally: a scheduler decides which
//! repository to sync when, per-family strategies perform the sync, a job
//! store records every attempt and a purge worker reclaims storage for
//! repositories that are no longer tracked.

pub mod backoff;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod job_store;
pub mod models;
pub mod observability;
pub mod purge;
pub mod scheduler;
pub mod service;
pub mod sources;
pub mod storage;
pub mod strategy;
pub mod sync_executor;
pub mod telemetry;
pub mod types;
pub mod update_queue;
pub use migration;
