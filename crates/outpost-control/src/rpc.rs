//! Management operations exposed to operator clients

use crate::hive::Hive;
use crate::jobs::{Job, JobError, JobManager, ListenerSpec, TlsFiles};
use crate::session::SessionInfo;
use crate::storage::{BeaconRecord, BeaconStorage, BeaconTaskRecord, StorageError, TaskState};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Controller state queries and listener control
pub struct ManagementService {
    hive: Arc<Hive>,
    jobs: Arc<JobManager>,
    beacons: Arc<dyn BeaconStorage>,
}

impl ManagementService {
    pub fn new(hive: Arc<Hive>, jobs: Arc<JobManager>, beacons: Arc<dyn BeaconStorage>) -> Self {
        Self {
            hive,
            jobs,
            beacons,
        }
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.hive.list()
    }

    pub async fn list_beacons(&self) -> Result<Vec<BeaconRecord>, RpcError> {
        Ok(self.beacons.list_beacons().await?)
    }

    /// Task history for a beacon with request and response bodies left out
    pub async fn get_beacon_tasks(&self, beacon_id: Uuid) -> Result<Vec<BeaconTaskRecord>, RpcError> {
        if self.beacons.get_beacon(beacon_id).await?.is_none() {
            return Err(RpcError::NotFound(format!("beacon {}", beacon_id)));
        }

        let tasks = self.beacons.list_tasks(beacon_id).await?;
        Ok(tasks
            .into_iter()
            .map(|task| BeaconTaskRecord {
                request: Vec::new(),
                response: None,
                ..task
            })
            .collect())
    }

    /// One task including its bodies
    pub async fn get_beacon_task_content(&self, task_id: Uuid) -> Result<BeaconTaskRecord, RpcError> {
        self.beacons
            .get_task(task_id)
            .await?
            .ok_or_else(|| RpcError::NotFound(format!("task {}", task_id)))
    }

    /// Queue work for a beacon's next check-in
    pub async fn queue_beacon_task(
        &self,
        beacon_id: Uuid,
        description: impl Into<String>,
        request: Vec<u8>,
    ) -> Result<BeaconTaskRecord, RpcError> {
        if self.beacons.get_beacon(beacon_id).await?.is_none() {
            return Err(RpcError::NotFound(format!("beacon {}", beacon_id)));
        }

        let task = BeaconTaskRecord {
            id: Uuid::new_v4(),
            beacon_id,
            state: TaskState::Pending,
            description: description.into(),
            created_at: Utc::now(),
            sent_at: None,
            completed_at: None,
            request,
            response: None,
        };
        self.beacons.save_task(task.clone()).await?;

        info!(beacon_id = %beacon_id, task_id = %task.id, "Beacon task queued");
        Ok(task)
    }

    pub async fn start_tcp_stager_listener(
        &self,
        host: &str,
        port: u16,
        profile: &str,
        stage_data: Vec<u8>,
    ) -> Result<u32, RpcError> {
        let job = self
            .jobs
            .start(ListenerSpec::stager(host, port, profile, stage_data))
            .await?;
        Ok(job.id)
    }

    pub async fn start_session_listener(
        &self,
        host: &str,
        port: u16,
        tls: Option<TlsFiles>,
    ) -> Result<u32, RpcError> {
        let mut spec = ListenerSpec::session(host, port);
        if let Some(tls) = tls {
            spec = spec.with_tls(tls);
        }

        let job = self.jobs.start(spec).await?;
        Ok(job.id)
    }

    pub async fn stop_job(&self, job_id: u32) -> Result<Job, RpcError> {
        Ok(self.jobs.stop(job_id).await?)
    }

    pub fn list_jobs(&self) -> Vec<Job> {
        self.jobs.list()
    }
}
