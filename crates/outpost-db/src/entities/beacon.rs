//! Beacon entity for polling-mode agents

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "beacons")]
pub struct Model {
    /// Beacon UUID (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub name: String,
    pub hostname: String,
    pub username: String,
    pub os: String,
    pub arch: String,
    pub remote_address: String,

    /// Transport the beacon polls over (e.g. "http", "dns")
    #[sea_orm(column_type = "String(StringLen::N(16))")]
    pub transport: String,

    /// Seconds between check-ins
    pub interval_secs: i64,

    /// Maximum random delay added to each interval
    pub jitter_secs: i64,

    pub last_checkin: ChronoDateTimeUtc,

    pub next_checkin: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Beacon owns queued tasks
    #[sea_orm(has_many = "super::beacon_task::Entity")]
    Tasks,
}

impl Related<super::beacon_task::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tasks.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
