//! Controller-side session and listener management
//!
//! This crate tracks live agent sessions ([`Hive`]), turns envelope exchanges
//! into request/response calls ([`Correlator`]), runs network listeners as
//! cancellable jobs ([`JobManager`]) and exposes the management operations
//! used by operators ([`ManagementService`]).

pub mod correlator;
pub mod dispatch;
pub mod handshake;
pub mod hive;
pub mod interfaces;
pub mod jobs;
pub mod pending_requests;
pub mod rpc;
pub mod session;
pub mod storage;

pub use correlator::{Correlator, RequestError, DEFAULT_REQUEST_TIMEOUT};
pub use dispatch::{spawn_dispatcher, UnsolicitedHandler};
pub use handshake::{register_session, HandshakeError};
pub use hive::{Hive, HiveEvent};
pub use interfaces::{InterfaceAddrs, SystemInterfaces};
pub use jobs::{Job, JobConfig, JobError, JobKind, JobManager, ListenerProtocol, ListenerSpec, TlsFiles};
pub use pending_requests::PendingRequests;
pub use rpc::{ManagementService, RpcError};
pub use session::{NewSession, Session, SessionInfo};
pub use storage::{
    BeaconRecord, BeaconStorage, BeaconTaskRecord, DatabaseStorage, InMemoryStorage,
    ListenerRecord, ListenerStorage, StorageError, TaskState,
};
