//! Pluggable persistence for listeners and beacons
//!
//! The job manager and the management service only see the traits below.
//! `InMemoryStorage` keeps everything in process (lost on restart) and
//! `DatabaseStorage` writes through to the `outpost-db` tables.

use crate::jobs::{JobKind, ListenerProtocol};
use chrono::{DateTime, Utc};
use outpost_db::entities::{beacon, beacon_task, listener_job};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use uuid::Uuid;

pub use outpost_db::entities::beacon_task::TaskState;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Backend(String),

    #[error("Database error: {0}")]
    Database(#[from] DbErr),
}

/// A listener that should come back when the controller restarts
#[derive(Clone, Debug, PartialEq)]
pub struct ListenerRecord {
    pub job_id: u32,
    pub kind: JobKind,
    pub protocol: ListenerProtocol,
    pub host: String,
    pub port: u16,
    pub profile: String,
    pub stage_data: Option<Vec<u8>>,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BeaconRecord {
    pub id: Uuid,
    pub name: String,
    pub hostname: String,
    pub username: String,
    pub os: String,
    pub arch: String,
    pub remote_address: String,
    pub transport: String,
    pub interval_secs: i64,
    pub jitter_secs: i64,
    pub last_checkin: DateTime<Utc>,
    pub next_checkin: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BeaconTaskRecord {
    pub id: Uuid,
    pub beacon_id: Uuid,
    pub state: TaskState,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub request: Vec<u8>,
    pub response: Option<Vec<u8>>,
}

/// Persists listener jobs
#[async_trait::async_trait]
pub trait ListenerStorage: Send + Sync {
    /// Save or replace the record for `record.job_id`
    async fn save(&self, record: ListenerRecord) -> Result<(), StorageError>;

    /// Forget a listener. Deleting an unknown id is not an error.
    async fn delete(&self, job_id: u32) -> Result<(), StorageError>;

    /// All persisted listeners ordered by job id
    async fn list(&self) -> Result<Vec<ListenerRecord>, StorageError>;
}

/// Persists beacons and their task queues
#[async_trait::async_trait]
pub trait BeaconStorage: Send + Sync {
    async fn save_beacon(&self, beacon: BeaconRecord) -> Result<(), StorageError>;

    async fn list_beacons(&self) -> Result<Vec<BeaconRecord>, StorageError>;

    async fn get_beacon(&self, id: Uuid) -> Result<Option<BeaconRecord>, StorageError>;

    async fn save_task(&self, task: BeaconTaskRecord) -> Result<(), StorageError>;

    /// Tasks for one beacon, oldest first
    async fn list_tasks(&self, beacon_id: Uuid) -> Result<Vec<BeaconTaskRecord>, StorageError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<BeaconTaskRecord>, StorageError>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Default)]
struct MemoryTables {
    listeners: HashMap<u32, ListenerRecord>,
    beacons: HashMap<Uuid, BeaconRecord>,
    tasks: HashMap<Uuid, BeaconTaskRecord>,
}

/// In-memory storage. All data is lost when the controller exits.
#[derive(Default)]
pub struct InMemoryStorage {
    tables: Mutex<MemoryTables>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, MemoryTables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl ListenerStorage for InMemoryStorage {
    async fn save(&self, record: ListenerRecord) -> Result<(), StorageError> {
        self.tables().listeners.insert(record.job_id, record);
        Ok(())
    }

    async fn delete(&self, job_id: u32) -> Result<(), StorageError> {
        self.tables().listeners.remove(&job_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ListenerRecord>, StorageError> {
        let mut records: Vec<ListenerRecord> =
            self.tables().listeners.values().cloned().collect();
        records.sort_by_key(|r| r.job_id);
        Ok(records)
    }
}

#[async_trait::async_trait]
impl BeaconStorage for InMemoryStorage {
    async fn save_beacon(&self, beacon: BeaconRecord) -> Result<(), StorageError> {
        self.tables().beacons.insert(beacon.id, beacon);
        Ok(())
    }

    async fn list_beacons(&self) -> Result<Vec<BeaconRecord>, StorageError> {
        let mut beacons: Vec<BeaconRecord> = self.tables().beacons.values().cloned().collect();
        beacons.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(beacons)
    }

    async fn get_beacon(&self, id: Uuid) -> Result<Option<BeaconRecord>, StorageError> {
        Ok(self.tables().beacons.get(&id).cloned())
    }

    async fn save_task(&self, task: BeaconTaskRecord) -> Result<(), StorageError> {
        let mut tables = self.tables();
        if !tables.beacons.contains_key(&task.beacon_id) {
            return Err(StorageError::NotFound(format!("beacon {}", task.beacon_id)));
        }
        tables.tasks.insert(task.id, task);
        Ok(())
    }

    async fn list_tasks(&self, beacon_id: Uuid) -> Result<Vec<BeaconTaskRecord>, StorageError> {
        let mut tasks: Vec<BeaconTaskRecord> = self
            .tables()
            .tasks
            .values()
            .filter(|t| t.beacon_id == beacon_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<BeaconTaskRecord>, StorageError> {
        Ok(self.tables().tasks.get(&id).cloned())
    }
}

// ============================================================================
// Database implementation
// ============================================================================

/// Storage backed by the `outpost-db` tables
#[derive(Clone)]
pub struct DatabaseStorage {
    db: DatabaseConnection,
}

impl DatabaseStorage {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    fn to_listener(model: listener_job::Model) -> Result<ListenerRecord, StorageError> {
        Ok(ListenerRecord {
            job_id: u32::try_from(model.job_id)
                .map_err(|_| StorageError::Backend(format!("invalid job id {}", model.job_id)))?,
            kind: model.kind.parse().map_err(StorageError::Backend)?,
            protocol: model.protocol.parse().map_err(StorageError::Backend)?,
            host: model.host,
            port: u16::try_from(model.port)
                .map_err(|_| StorageError::Backend(format!("invalid port {}", model.port)))?,
            profile: model.profile,
            stage_data: model.stage_data,
            tls_cert_path: model.tls_cert_path,
            tls_key_path: model.tls_key_path,
            created_at: model.created_at,
        })
    }

    fn to_beacon(model: beacon::Model) -> BeaconRecord {
        BeaconRecord {
            id: model.id,
            name: model.name,
            hostname: model.hostname,
            username: model.username,
            os: model.os,
            arch: model.arch,
            remote_address: model.remote_address,
            transport: model.transport,
            interval_secs: model.interval_secs,
            jitter_secs: model.jitter_secs,
            last_checkin: model.last_checkin,
            next_checkin: model.next_checkin,
        }
    }

    fn to_task(model: beacon_task::Model) -> BeaconTaskRecord {
        BeaconTaskRecord {
            id: model.id,
            beacon_id: model.beacon_id,
            state: model.state,
            description: model.description,
            created_at: model.created_at,
            sent_at: model.sent_at,
            completed_at: model.completed_at,
            request: model.request,
            response: model.response,
        }
    }
}

#[async_trait::async_trait]
impl ListenerStorage for DatabaseStorage {
    async fn save(&self, record: ListenerRecord) -> Result<(), StorageError> {
        let model = listener_job::ActiveModel {
            job_id: Set(record.job_id as i32),
            kind: Set(record.kind.to_string()),
            protocol: Set(record.protocol.to_string()),
            host: Set(record.host),
            port: Set(record.port as i32),
            profile: Set(record.profile),
            stage_data: Set(record.stage_data),
            tls_cert_path: Set(record.tls_cert_path),
            tls_key_path: Set(record.tls_key_path),
            created_at: Set(record.created_at),
        };

        let exists = listener_job::Entity::find_by_id(record.job_id as i32)
            .one(&self.db)
            .await?
            .is_some();
        if exists {
            model.update(&self.db).await?;
        } else {
            model.insert(&self.db).await?;
        }
        Ok(())
    }

    async fn delete(&self, job_id: u32) -> Result<(), StorageError> {
        listener_job::Entity::delete_by_id(job_id as i32)
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ListenerRecord>, StorageError> {
        listener_job::Entity::find()
            .order_by_asc(listener_job::Column::JobId)
            .all(&self.db)
            .await?
            .into_iter()
            .map(Self::to_listener)
            .collect()
    }
}

#[async_trait::async_trait]
impl BeaconStorage for DatabaseStorage {
    async fn save_beacon(&self, record: BeaconRecord) -> Result<(), StorageError> {
        let model = beacon::ActiveModel {
            id: Set(record.id),
            name: Set(record.name),
            hostname: Set(record.hostname),
            username: Set(record.username),
            os: Set(record.os),
            arch: Set(record.arch),
            remote_address: Set(record.remote_address),
            transport: Set(record.transport),
            interval_secs: Set(record.interval_secs),
            jitter_secs: Set(record.jitter_secs),
            last_checkin: Set(record.last_checkin),
            next_checkin: Set(record.next_checkin),
        };

        if beacon::Entity::find_by_id(record.id)
            .one(&self.db)
            .await?
            .is_some()
        {
            model.update(&self.db).await?;
        } else {
            model.insert(&self.db).await?;
        }
        Ok(())
    }

    async fn list_beacons(&self) -> Result<Vec<BeaconRecord>, StorageError> {
        Ok(beacon::Entity::find()
            .order_by_asc(beacon::Column::Name)
            .all(&self.db)
            .await?
            .into_iter()
            .map(Self::to_beacon)
            .collect())
    }

    async fn get_beacon(&self, id: Uuid) -> Result<Option<BeaconRecord>, StorageError> {
        Ok(beacon::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .map(Self::to_beacon))
    }

    async fn save_task(&self, task: BeaconTaskRecord) -> Result<(), StorageError> {
        if beacon::Entity::find_by_id(task.beacon_id)
            .one(&self.db)
            .await?
            .is_none()
        {
            return Err(StorageError::NotFound(format!("beacon {}", task.beacon_id)));
        }

        let model = beacon_task::ActiveModel {
            id: Set(task.id),
            beacon_id: Set(task.beacon_id),
            state: Set(task.state),
            description: Set(task.description),
            created_at: Set(task.created_at),
            sent_at: Set(task.sent_at),
            completed_at: Set(task.completed_at),
            request: Set(task.request),
            response: Set(task.response),
        };

        if beacon_task::Entity::find_by_id(task.id)
            .one(&self.db)
            .await?
            .is_some()
        {
            model.update(&self.db).await?;
        } else {
            model.insert(&self.db).await?;
        }
        Ok(())
    }

    async fn list_tasks(&self, beacon_id: Uuid) -> Result<Vec<BeaconTaskRecord>, StorageError> {
        Ok(beacon_task::Entity::find()
            .filter(beacon_task::Column::BeaconId.eq(beacon_id))
            .order_by_asc(beacon_task::Column::CreatedAt)
            .all(&self.db)
            .await?
            .into_iter()
            .map(Self::to_task)
            .collect())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<BeaconTaskRecord>, StorageError> {
        Ok(beacon_task::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .map(Self::to_task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener(job_id: u32, port: u16) -> ListenerRecord {
        ListenerRecord {
            job_id,
            kind: JobKind::Stager,
            protocol: ListenerProtocol::Tcp,
            host: "0.0.0.0".to_string(),
            port,
            profile: "win-x64".to_string(),
            stage_data: Some(vec![0x4d, 0x5a]),
            tls_cert_path: None,
            tls_key_path: None,
            created_at: Utc::now(),
        }
    }

    fn beacon(name: &str) -> BeaconRecord {
        let now = Utc::now();
        BeaconRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            hostname: "fin-ws-7".to_string(),
            username: "svc".to_string(),
            os: "windows".to_string(),
            arch: "amd64".to_string(),
            remote_address: "198.51.100.4:50123".to_string(),
            transport: "http".to_string(),
            interval_secs: 60,
            jitter_secs: 10,
            last_checkin: now,
            next_checkin: now + chrono::Duration::seconds(60),
        }
    }

    fn task(beacon_id: Uuid, description: &str, offset_secs: i64) -> BeaconTaskRecord {
        BeaconTaskRecord {
            id: Uuid::new_v4(),
            beacon_id,
            state: TaskState::Pending,
            description: description.to_string(),
            created_at: Utc::now() + chrono::Duration::seconds(offset_secs),
            sent_at: None,
            completed_at: None,
            request: vec![1, 2, 3],
            response: None,
        }
    }

    #[tokio::test]
    async fn test_memory_listeners() {
        let storage = InMemoryStorage::new();

        storage.save(listener(3, 9000)).await.unwrap();
        storage.save(listener(1, 8443)).await.unwrap();
        storage.save(listener(3, 9001)).await.unwrap();

        let records = storage.list().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].job_id, 1);
        assert_eq!(records[1].port, 9001);

        storage.delete(1).await.unwrap();
        storage.delete(42).await.unwrap();
        assert_eq!(storage.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_tasks_ordered() {
        let storage = InMemoryStorage::new();
        let b = beacon("QUIET_HERON");
        storage.save_beacon(b.clone()).await.unwrap();

        let later = task(b.id, "ls C:\\", 5);
        let earlier = task(b.id, "ps", 0);
        storage.save_task(later.clone()).await.unwrap();
        storage.save_task(earlier.clone()).await.unwrap();

        let tasks = storage.list_tasks(b.id).await.unwrap();
        assert_eq!(tasks, vec![earlier, later.clone()]);
        assert_eq!(storage.get_task(later.id).await.unwrap(), Some(later));
        assert!(storage.list_tasks(Uuid::new_v4()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_task_needs_beacon() {
        let storage = InMemoryStorage::new();
        let result = storage.save_task(task(Uuid::new_v4(), "pwd", 0)).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_database_listeners() {
        let db = outpost_db::connect("sqlite::memory:").await.unwrap();
        outpost_db::migrate(&db).await.unwrap();
        let storage = DatabaseStorage::new(db);

        let mut record = listener(2, 4444);
        record.kind = JobKind::Session;
        record.protocol = ListenerProtocol::Tls;
        record.tls_cert_path = Some("/etc/outpost/cert.pem".to_string());
        record.tls_key_path = Some("/etc/outpost/key.pem".to_string());
        storage.save(record.clone()).await.unwrap();

        record.port = 4445;
        storage.save(record.clone()).await.unwrap();

        let records = storage.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, JobKind::Session);
        assert_eq!(records[0].protocol, ListenerProtocol::Tls);
        assert_eq!(records[0].port, 4445);
        assert_eq!(records[0].stage_data, Some(vec![0x4d, 0x5a]));

        storage.delete(2).await.unwrap();
        assert!(storage.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_database_beacon_tasks() {
        let db = outpost_db::connect("sqlite::memory:").await.unwrap();
        outpost_db::migrate(&db).await.unwrap();
        let storage = DatabaseStorage::new(db);

        let b = beacon("SLOW_LYNX");
        storage.save_beacon(b.clone()).await.unwrap();
        assert_eq!(storage.list_beacons().await.unwrap().len(), 1);

        let mut t = task(b.id, "download /etc/hosts", 0);
        storage.save_task(t.clone()).await.unwrap();

        t.state = TaskState::Completed;
        t.response = Some(vec![9, 9]);
        storage.save_task(t.clone()).await.unwrap();

        let stored = storage.get_task(t.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Completed);
        assert_eq!(stored.response, Some(vec![9, 9]));
        assert_eq!(storage.list_tasks(b.id).await.unwrap().len(), 1);

        assert!(storage.get_beacon(Uuid::new_v4()).await.unwrap().is_none());
    }
}
