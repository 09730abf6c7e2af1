//! SyncJob entity model
//!
//! SeaORM entity for the `sync_jobs` table: one row per synchronization
//! attempt of a tracked repository.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// A persisted sync job record
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_jobs")]
pub struct Model {
    /// Unique identifier for the sync job (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Repository the job synchronizes
    pub repo_id: i64,

    /// Per-repository sequence number, starting at 1
    pub attempt: i64,

    /// `manual` or `auto`
    pub trigger: String,

    /// `queued`, `running`, `completed` or `errored`
    pub state: String,

    pub requested_at: DateTimeWithTimeZone,

    pub started_at: Option<DateTimeWithTimeZone>,

    pub finished_at: Option<DateTimeWithTimeZone>,

    /// Refs or files changed by a successful run
    pub changes: Option<i64>,

    /// Serialized `SyncError` for errored runs
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub error: Option<JsonValue>,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
