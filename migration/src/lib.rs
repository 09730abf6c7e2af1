//! Database migrations for the repository updater.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_01_05_090000_create_sync_jobs;
mod m2026_01_05_090100_add_sync_job_in_flight_guard;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_01_05_090000_create_sync_jobs::Migration),
            Box::new(m2026_01_05_090100_add_sync_job_in_flight_guard::Migration),
        ]
    }
}
