//! BeaconTask entity for work queued for a beacon's next check-in

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Lifecycle of a queued task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum TaskState {
    /// Waiting for the next check-in
    #[sea_orm(string_value = "pending")]
    Pending,

    /// Handed to the beacon, no response yet
    #[sea_orm(string_value = "sent")]
    Sent,

    #[sea_orm(string_value = "completed")]
    Completed,

    #[sea_orm(string_value = "canceled")]
    Canceled,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "beacon_tasks")]
pub struct Model {
    /// Task UUID (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub beacon_id: Uuid,

    pub state: TaskState,

    /// Operator-facing summary (e.g. "ls /tmp")
    #[sea_orm(column_type = "Text")]
    pub description: String,

    pub created_at: ChronoDateTimeUtc,

    pub sent_at: Option<ChronoDateTimeUtc>,

    pub completed_at: Option<ChronoDateTimeUtc>,

    /// Serialized request envelope
    #[sea_orm(column_type = "Blob")]
    pub request: Vec<u8>,

    /// Serialized response envelope, once completed
    #[sea_orm(column_type = "Blob", nullable)]
    pub response: Option<Vec<u8>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::beacon::Entity",
        from = "Column::BeaconId",
        to = "super::beacon::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Beacon,
}

impl Related<super::beacon::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Beacon.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
