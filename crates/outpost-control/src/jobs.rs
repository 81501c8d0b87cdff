//! Listener jobs
//!
//! A job is a bound TCP listener plus the task accepting on it. Session
//! listeners turn each accepted socket into a registered [`Session`]; stager
//! listeners hand every client a length-prefixed stage and hang up.
//!
//! [`Session`]: crate::session::Session

use crate::dispatch::{spawn_dispatcher, UnsolicitedHandler};
use crate::handshake::register_session;
use crate::hive::Hive;
use crate::interfaces::{resolve_bind_host, InterfaceAddrs};
use crate::session::NewSession;
use crate::storage::{ListenerRecord, ListenerStorage, StorageError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use outpost_transport::tls::build_tls_acceptor;
use outpost_transport::{Connection, ConnectionConfig, TlsError};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Address already in use: {0}")]
    AddressInUse(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Job {0} not found")]
    NotFound(u32),

    #[error("Failed to persist listener: {0}")]
    Storage(#[from] StorageError),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("TLS listener requires a certificate and key")]
    MissingTlsFiles,

    #[error("Stager listener requires stage data")]
    MissingStage,

    #[error("Stage too large: {0} bytes")]
    StageTooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Session,
    Stager,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Session => f.write_str("session"),
            JobKind::Stager => f.write_str("stager"),
        }
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "session" => Ok(JobKind::Session),
            "stager" => Ok(JobKind::Stager),
            other => Err(format!("unknown job kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerProtocol {
    Tcp,
    Tls,
}

impl fmt::Display for ListenerProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerProtocol::Tcp => f.write_str("tcp"),
            ListenerProtocol::Tls => f.write_str("tls"),
        }
    }
}

impl FromStr for ListenerProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(ListenerProtocol::Tcp),
            "tls" => Ok(ListenerProtocol::Tls),
            other => Err(format!("unknown listener protocol: {}", other)),
        }
    }
}

/// PEM certificate chain and private key for a TLS listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// What to listen for and where
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerSpec {
    pub kind: JobKind,
    pub protocol: ListenerProtocol,
    pub host: String,
    /// 0 picks an ephemeral port
    pub port: u16,
    pub profile: String,
    pub stage_data: Option<Vec<u8>>,
    pub tls: Option<TlsFiles>,
}

impl ListenerSpec {
    /// Plain TCP session listener
    pub fn session(host: impl Into<String>, port: u16) -> Self {
        Self {
            kind: JobKind::Session,
            protocol: ListenerProtocol::Tcp,
            host: host.into(),
            port,
            profile: String::new(),
            stage_data: None,
            tls: None,
        }
    }

    /// TCP stager serving `stage_data` to every client
    pub fn stager(
        host: impl Into<String>,
        port: u16,
        profile: impl Into<String>,
        stage_data: Vec<u8>,
    ) -> Self {
        Self {
            kind: JobKind::Stager,
            protocol: ListenerProtocol::Tcp,
            host: host.into(),
            port,
            profile: profile.into(),
            stage_data: Some(stage_data),
            tls: None,
        }
    }

    pub fn with_tls(mut self, tls: TlsFiles) -> Self {
        self.protocol = ListenerProtocol::Tls;
        self.tls = Some(tls);
        self
    }

    fn from_record(record: ListenerRecord) -> Self {
        let tls = match (record.tls_cert_path, record.tls_key_path) {
            (Some(cert), Some(key)) => Some(TlsFiles {
                cert_path: PathBuf::from(cert),
                key_path: PathBuf::from(key),
            }),
            _ => None,
        };

        Self {
            kind: record.kind,
            protocol: record.protocol,
            host: record.host,
            port: record.port,
            profile: record.profile,
            stage_data: record.stage_data,
            tls,
        }
    }
}

/// A running listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub id: u32,
    pub kind: JobKind,
    pub protocol: ListenerProtocol,
    /// Host actually bound, after interface validation
    pub host: String,
    /// Port actually bound
    pub port: u16,
    pub profile: String,
    pub started_at: DateTime<Utc>,
}

impl Job {
    /// "tcp://0.0.0.0:8888"-style address for display
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("{}://[{}]:{}", self.protocol, self.host, self.port)
        } else {
            format!("{}://{}:{}", self.protocol, self.host, self.port)
        }
    }
}

/// Settings applied to every connection a session listener accepts
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub connection: ConnectionConfig,
    /// How long a new agent has to send its registration
    pub handshake_timeout: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

struct RunningJob {
    job: Job,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Everything a session accept loop needs to register agents
struct SessionAcceptor {
    hive: Arc<Hive>,
    tls: Option<TlsAcceptor>,
    config: JobConfig,
    unsolicited: Option<Arc<dyn UnsolicitedHandler>>,
}

enum Acceptor {
    Session(Arc<SessionAcceptor>),
    Stager { tls: Option<TlsAcceptor>, stage: Bytes },
}

/// Starts, tracks and stops listener jobs
pub struct JobManager {
    hive: Arc<Hive>,
    storage: Arc<dyn ListenerStorage>,
    interfaces: Arc<dyn InterfaceAddrs>,
    config: JobConfig,
    unsolicited: Option<Arc<dyn UnsolicitedHandler>>,
    jobs: Mutex<HashMap<u32, RunningJob>>,
    next_id: AtomicU32,
}

impl JobManager {
    pub fn new(
        hive: Arc<Hive>,
        storage: Arc<dyn ListenerStorage>,
        interfaces: Arc<dyn InterfaceAddrs>,
        config: JobConfig,
    ) -> Self {
        Self {
            hive,
            storage,
            interfaces,
            config,
            unsolicited: None,
            jobs: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Route envelopes agents send unprompted to `handler`
    pub fn with_unsolicited_handler(mut self, handler: Arc<dyn UnsolicitedHandler>) -> Self {
        self.unsolicited = Some(handler);
        self
    }

    pub fn hive(&self) -> &Arc<Hive> {
        &self.hive
    }

    /// Bind and start a listener, then persist it so it survives a restart
    pub async fn start(&self, spec: ListenerSpec) -> Result<Job, JobError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.launch(id, spec).await
    }

    async fn launch(&self, id: u32, spec: ListenerSpec) -> Result<Job, JobError> {
        let host = resolve_bind_host(&spec.host, self.interfaces.as_ref());

        let tls = match spec.protocol {
            ListenerProtocol::Tcp => None,
            ListenerProtocol::Tls => {
                let files = spec.tls.as_ref().ok_or(JobError::MissingTlsFiles)?;
                Some(build_tls_acceptor(&files.cert_path, &files.key_path)?)
            }
        };

        let acceptor = match spec.kind {
            JobKind::Session => Acceptor::Session(Arc::new(SessionAcceptor {
                hive: self.hive.clone(),
                tls,
                config: self.config.clone(),
                unsolicited: self.unsolicited.clone(),
            })),
            JobKind::Stager => {
                let stage = match &spec.stage_data {
                    Some(data) if !data.is_empty() => data.clone(),
                    _ => return Err(JobError::MissingStage),
                };
                if u32::try_from(stage.len()).is_err() {
                    return Err(JobError::StageTooLarge(stage.len()));
                }
                Acceptor::Stager {
                    tls,
                    stage: Bytes::from(stage),
                }
            }
        };

        let listener = bind(&host, spec.port).await?;
        let port = listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(spec.port);

        let job = Job {
            id,
            kind: spec.kind,
            protocol: spec.protocol,
            host: host.clone(),
            port,
            profile: spec.profile.clone(),
            started_at: Utc::now(),
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(id, listener, acceptor, cancel.clone()));

        let record = ListenerRecord {
            job_id: id,
            kind: spec.kind,
            protocol: spec.protocol,
            host,
            port,
            profile: spec.profile,
            stage_data: spec.stage_data,
            tls_cert_path: spec
                .tls
                .as_ref()
                .map(|t| t.cert_path.to_string_lossy().into_owned()),
            tls_key_path: spec
                .tls
                .as_ref()
                .map(|t| t.key_path.to_string_lossy().into_owned()),
            created_at: job.started_at,
        };

        if let Err(e) = self.storage.save(record).await {
            error!(job_id = id, "Failed to persist listener, stopping it: {}", e);
            cancel.cancel();
            let _ = task.await;
            return Err(JobError::Storage(e));
        }

        info!(
            job_id = id,
            kind = %job.kind,
            address = %job.address(),
            "Listener started"
        );

        self.jobs().insert(
            id,
            RunningJob {
                job: job.clone(),
                cancel,
                task,
            },
        );

        Ok(job)
    }

    /// Stop a listener and forget its persisted record.
    ///
    /// Sessions it accepted stay connected.
    pub async fn stop(&self, id: u32) -> Result<Job, JobError> {
        let running = self.jobs().remove(&id).ok_or(JobError::NotFound(id))?;

        running.cancel.cancel();
        if let Err(e) = running.task.await {
            warn!(job_id = id, "Listener task ended abnormally: {}", e);
        }

        self.storage.delete(id).await?;
        info!(job_id = id, "Listener stopped");
        Ok(running.job)
    }

    /// Running jobs ordered by id
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs().values().map(|r| r.job.clone()).collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    pub fn get(&self, id: u32) -> Option<Job> {
        self.jobs().get(&id).map(|r| r.job.clone())
    }

    /// Stop every listener. Persisted records are kept for the next start.
    pub async fn shutdown(&self) {
        let running: Vec<RunningJob> = self.jobs().drain().map(|(_, r)| r).collect();

        for job in &running {
            job.cancel.cancel();
        }
        for job in running {
            let _ = job.task.await;
        }
    }

    /// Restart every persisted listener, keeping their ids.
    ///
    /// A listener that fails to come back is logged and skipped.
    pub async fn restore(&self) -> Result<Vec<Job>, JobError> {
        let records = self.storage.list().await?;
        let mut restored = Vec::with_capacity(records.len());

        for record in records {
            let id = record.job_id;
            self.next_id.fetch_max(id.saturating_add(1), Ordering::SeqCst);

            match self.launch(id, ListenerSpec::from_record(record)).await {
                Ok(job) => restored.push(job),
                Err(e) => warn!(job_id = id, "Failed to restore listener: {}", e),
            }
        }

        Ok(restored)
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<u32, RunningJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn bind(host: &str, port: u16) -> Result<TcpListener, JobError> {
    TcpListener::bind((host, port)).await.map_err(|e| {
        let addr = if host.contains(':') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };

        if e.kind() == std::io::ErrorKind::AddrInUse {
            JobError::AddressInUse(addr)
        } else {
            JobError::Bind { addr, source: e }
        }
    })
}

async fn accept_loop(
    job_id: u32,
    listener: TcpListener,
    acceptor: Acceptor,
    cancel: CancellationToken,
) {
    loop {
        let (socket, peer_addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(job_id, "Failed to accept connection: {}", e);
                    continue;
                }
            },
        };

        debug!(job_id, peer_addr = %peer_addr, "Accepted connection");

        match &acceptor {
            Acceptor::Session(ctx) => {
                tokio::spawn(accept_session(socket, peer_addr, ctx.clone()));
            }
            Acceptor::Stager { tls, stage } => {
                tokio::spawn(accept_stager(socket, peer_addr, tls.clone(), stage.clone()));
            }
        }
    }

    debug!(job_id, "Accept loop stopped");
}

async fn accept_session(socket: TcpStream, peer_addr: SocketAddr, ctx: Arc<SessionAcceptor>) {
    match &ctx.tls {
        Some(tls) => match tls.accept(socket).await {
            Ok(stream) => register_agent(stream, peer_addr, "tls", &ctx).await,
            Err(e) => warn!(peer_addr = %peer_addr, "TLS handshake failed: {}", e),
        },
        None => register_agent(socket, peer_addr, "tcp", &ctx).await,
    }
}

async fn register_agent<S>(stream: S, peer_addr: SocketAddr, transport: &str, ctx: &SessionAcceptor)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let remote_address = peer_addr.to_string();
    let connection = Connection::start(stream, remote_address.clone(), ctx.config.connection.clone());

    let register = match register_session(&connection, ctx.config.handshake_timeout).await {
        Ok(register) => register,
        Err(e) => {
            warn!(peer_addr = %peer_addr, "Rejecting agent: {}", e);
            connection.close();
            return;
        }
    };

    let session = ctx.hive.insert(
        NewSession::from_register(register, remote_address, transport),
        connection,
    );

    ctx.hive.remove_on_close(&session);

    spawn_dispatcher(session, ctx.unsolicited.clone());
}

async fn accept_stager(
    socket: TcpStream,
    peer_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    stage: Bytes,
) {
    let result = match tls {
        Some(tls) => match tls.accept(socket).await {
            Ok(stream) => send_stage(stream, &stage).await,
            Err(e) => Err(e),
        },
        None => send_stage(socket, &stage).await,
    };

    match result {
        Ok(()) => info!(peer_addr = %peer_addr, bytes = stage.len(), "Stage delivered"),
        Err(e) => warn!(peer_addr = %peer_addr, "Failed to deliver stage: {}", e),
    }
}

/// `[u32 LE length][stage]`, then close
async fn send_stage<S>(mut stream: S, stage: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&(stage.len() as u32).to_le_bytes())
        .await?;
    stream.write_all(stage).await?;
    stream.flush().await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::MockInterfaceAddrs;
    use crate::storage::InMemoryStorage;
    use tokio::io::AsyncReadExt;

    fn manager_with(interfaces: MockInterfaceAddrs) -> (JobManager, Arc<InMemoryStorage>) {
        let storage = Arc::new(InMemoryStorage::new());
        let manager = JobManager::new(
            Arc::new(Hive::new()),
            storage.clone(),
            Arc::new(interfaces),
            JobConfig::default(),
        );
        (manager, storage)
    }

    fn local_interfaces() -> MockInterfaceAddrs {
        let mut interfaces = MockInterfaceAddrs::new();
        interfaces.expect_contains().return_const(true);
        interfaces
    }

    #[test]
    fn test_kind_and_protocol_strings() {
        assert_eq!("Stager".parse::<JobKind>().unwrap(), JobKind::Stager);
        assert_eq!(JobKind::Session.to_string(), "session");
        assert_eq!("TLS".parse::<ListenerProtocol>().unwrap(), ListenerProtocol::Tls);
        assert!("quic".parse::<ListenerProtocol>().is_err());
    }

    #[tokio::test]
    async fn test_stager_non_local_host_binds_wildcard() {
        let mut interfaces = MockInterfaceAddrs::new();
        interfaces.expect_contains().return_const(false);
        let (manager, storage) = manager_with(interfaces);

        let job = manager
            .start(ListenerSpec::stager("203.0.113.9", 0, "linux-x64", vec![7; 32]))
            .await
            .unwrap();

        assert_eq!(job.host, "0.0.0.0");
        assert_ne!(job.port, 0);

        let records = storage.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].host, "0.0.0.0");
        assert_eq!(records[0].port, job.port);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_stager_delivers_length_prefixed_stage() {
        let (manager, _storage) = manager_with(local_interfaces());
        let stage = b"\x7fELF-stage-bytes".to_vec();

        let job = manager
            .start(ListenerSpec::stager("127.0.0.1", 0, "linux-x64", stage.clone()))
            .await
            .unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", job.port)).await.unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();

        assert_eq!(&received[..4], &(stage.len() as u32).to_le_bytes());
        assert_eq!(&received[4..], &stage[..]);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_stager_requires_stage() {
        let (manager, storage) = manager_with(local_interfaces());

        let mut spec = ListenerSpec::stager("127.0.0.1", 0, "", Vec::new());
        assert!(matches!(
            manager.start(spec.clone()).await,
            Err(JobError::MissingStage)
        ));

        spec.stage_data = None;
        assert!(matches!(manager.start(spec).await, Err(JobError::MissingStage)));
        assert!(storage.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tls_requires_files() {
        let (manager, _storage) = manager_with(local_interfaces());

        let mut spec = ListenerSpec::session("127.0.0.1", 0);
        spec.protocol = ListenerProtocol::Tls;

        assert!(matches!(
            manager.start(spec).await,
            Err(JobError::MissingTlsFiles)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_bind_is_address_in_use() {
        let (manager, _storage) = manager_with(local_interfaces());

        let first = manager
            .start(ListenerSpec::session("127.0.0.1", 0))
            .await
            .unwrap();
        let second = manager
            .start(ListenerSpec::session("127.0.0.1", first.port))
            .await;

        assert!(matches!(second, Err(JobError::AddressInUse(_))));
        assert_eq!(manager.list().len(), 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_removes_record() {
        let (manager, storage) = manager_with(local_interfaces());

        let a = manager
            .start(ListenerSpec::session("127.0.0.1", 0))
            .await
            .unwrap();
        let b = manager
            .start(ListenerSpec::stager("127.0.0.1", 0, "p", vec![1]))
            .await
            .unwrap();
        assert_eq!(
            manager.list().iter().map(|j| j.id).collect::<Vec<_>>(),
            vec![a.id, b.id]
        );

        let stopped = manager.stop(a.id).await.unwrap();
        assert_eq!(stopped.id, a.id);

        let records = storage.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].job_id, b.id);

        assert!(matches!(manager.stop(a.id).await, Err(JobError::NotFound(id)) if id == a.id));

        // Port is free again once the accept loop is gone
        TcpListener::bind(("127.0.0.1", a.port)).await.unwrap();

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_restore_keeps_ids() {
        let (manager, storage) = manager_with(local_interfaces());
        let job = manager
            .start(ListenerSpec::stager("127.0.0.1", 0, "p", vec![1, 2]))
            .await
            .unwrap();
        manager.shutdown().await;
        assert!(manager.list().is_empty());

        let restored = JobManager::new(
            Arc::new(Hive::new()),
            storage.clone(),
            Arc::new(local_interfaces()),
            JobConfig::default(),
        );
        let jobs = restored.restore().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, job.id);
        assert_eq!(jobs[0].port, job.port);

        let next = restored
            .start(ListenerSpec::session("127.0.0.1", 0))
            .await
            .unwrap();
        assert!(next.id > job.id);

        restored.shutdown().await;
    }
}
