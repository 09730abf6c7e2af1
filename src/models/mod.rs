//! # Data Models
//!
//! SeaORM entities backing the SQL job store.

pub mod sync_job;

pub use sync_job::Entity as SyncJob;
