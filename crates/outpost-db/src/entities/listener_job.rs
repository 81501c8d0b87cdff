//! ListenerJob entity for listeners that should survive a controller restart

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "listener_jobs")]
pub struct Model {
    /// Job id assigned by the job manager
    #[sea_orm(primary_key, auto_increment = false)]
    pub job_id: i32,

    /// "session" or "stager"
    #[sea_orm(column_type = "String(StringLen::N(16))")]
    pub kind: String,

    /// "tcp" or "tls"
    #[sea_orm(column_type = "String(StringLen::N(16))")]
    pub protocol: String,

    /// Bind host after interface validation
    pub host: String,

    pub port: i32,

    /// Implant profile served by this listener
    pub profile: String,

    /// Stage bytes delivered by stager listeners
    #[sea_orm(column_type = "Blob", nullable)]
    pub stage_data: Option<Vec<u8>>,

    pub tls_cert_path: Option<String>,

    pub tls_key_path: Option<String>,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
