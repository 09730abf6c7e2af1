//! Migration to create the sync_jobs table.
//!
//! One row per synchronization attempt of a repository. Rows are appended by
//! the scheduler and only ever move forward through
//! `queued -> running -> completed | errored`.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncJobs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(SyncJobs::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(SyncJobs::RepoId).big_integer().not_null())
                    .col(ColumnDef::new(SyncJobs::Attempt).big_integer().not_null())
                    .col(ColumnDef::new(SyncJobs::Trigger).text().not_null())
                    .col(
                        ColumnDef::new(SyncJobs::State)
                            .text()
                            .not_null()
                            .default("queued"),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::RequestedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(SyncJobs::Changes).big_integer().null())
                    .col(ColumnDef::new(SyncJobs::Error).json_binary().null())
                    .col(
                        ColumnDef::new(SyncJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Attempts are numbered per repository; history walks them newest first
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_jobs_repo_attempt ON sync_jobs (repo_id, attempt DESC)".to_string(),
            ))
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_sync_jobs_repo_attempt").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(SyncJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncJobs {
    Table,
    Id,
    RepoId,
    Attempt,
    Trigger,
    State,
    RequestedAt,
    StartedAt,
    FinishedAt,
    Changes,
    Error,
    CreatedAt,
}
