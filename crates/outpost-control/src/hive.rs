//! Session registry
//!
//! The hive maps session ids to live sessions. Lookups are frequent and
//! structural changes are rare, so a single `RwLock` guards the whole map and
//! is never held across an await point.

use crate::session::{NewSession, Session, SessionInfo};
use outpost_transport::Connection;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Session lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HiveEvent {
    Connected(SessionInfo),
    Disconnected(SessionInfo),
}

struct HiveState {
    sessions: HashMap<u32, Arc<Session>>,
    next_id: u32,
}

/// Registry of live sessions
pub struct Hive {
    state: RwLock<HiveState>,
    events_tx: mpsc::UnboundedSender<HiveEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<HiveEvent>>>,
}

impl Hive {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            state: RwLock::new(HiveState {
                sessions: HashMap::new(),
                next_id: 1,
            }),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Register a session and assign it the next id.
    ///
    /// Ids are never reused. A name already taken by a live session
    /// (ignoring case) gets the new id appended, plus a counter if that is
    /// taken too.
    pub fn insert(&self, new: NewSession, connection: Arc<Connection>) -> Arc<Session> {
        let mut state = self.write();

        let id = state.next_id;
        state.next_id += 1;

        let base = if new.name.is_empty() {
            format!("session-{}", id)
        } else {
            new.name.clone()
        };
        let taken = |name: &str| {
            state
                .sessions
                .values()
                .any(|s| s.name().eq_ignore_ascii_case(name))
        };

        // The suffixed name can itself belong to a live session
        let mut name = base.clone();
        let mut attempt = 0u32;
        while taken(&name) {
            attempt += 1;
            name = match attempt {
                1 => format!("{}-{}", base, id),
                n => format!("{}-{}-{}", base, id, n),
            };
        }

        let session = Arc::new(Session::new(id, name, new, connection));
        state.sessions.insert(id, session.clone());

        // Published under the lock so a racing removal can't overtake it
        let _ = self
            .events_tx
            .send(HiveEvent::Connected(session.info().clone()));

        info!(
            session_id = id,
            name = %session.name(),
            remote_address = %session.info().remote_address,
            "Session registered"
        );

        session
    }

    /// Remove a session. Returns None if it was already gone.
    pub fn remove(&self, id: u32) -> Option<Arc<Session>> {
        let mut state = self.write();
        let session = state.sessions.remove(&id)?;

        let _ = self
            .events_tx
            .send(HiveEvent::Disconnected(session.info().clone()));

        info!(session_id = id, name = %session.name(), "Session removed");
        Some(session)
    }

    /// Remove `session` once its connection closes. The hook holds only a
    /// weak reference to the hive.
    pub fn remove_on_close(self: &Arc<Self>, session: &Session) {
        let hive = Arc::downgrade(self);
        let session_id = session.id();
        session.connection().on_close(move || {
            if let Some(hive) = hive.upgrade() {
                hive.remove(session_id);
            }
        });
    }

    pub fn get(&self, id: u32) -> Option<Arc<Session>> {
        self.read().sessions.get(&id).cloned()
    }

    /// Case-insensitive exact name match
    pub fn get_by_name(&self, name: &str) -> Option<Arc<Session>> {
        self.read()
            .sessions
            .values()
            .find(|s| s.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Look a session up by numeric id or by name
    pub fn resolve(&self, target: &str) -> Option<Arc<Session>> {
        let target = target.trim();
        if let Ok(id) = target.parse::<u32>() {
            if let Some(session) = self.get(id) {
                return Some(session);
            }
        }

        self.get_by_name(target)
    }

    /// All sessions ordered by id
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> = self.read().sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.id());
        sessions
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.snapshot().iter().map(|s| s.info().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().sessions.is_empty()
    }

    /// Hand out the event stream. Only the first caller gets it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<HiveEvent>> {
        let events = self
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if events.is_none() {
            debug!("Hive event stream already taken");
        }
        events
    }

    fn read(&self) -> RwLockReadGuard<'_, HiveState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HiveState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Hive {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_transport::{CloseReason, ConnectionConfig};

    fn new_session(name: &str) -> NewSession {
        NewSession {
            name: name.to_string(),
            hostname: "ws-01".to_string(),
            os: "linux".to_string(),
            arch: "amd64".to_string(),
            remote_address: "10.0.0.5:40000".to_string(),
            transport: "tcp".to_string(),
            ..Default::default()
        }
    }

    fn connection() -> Arc<Connection> {
        let (local, _remote) = tokio::io::duplex(1024);
        Connection::start(local, "test", ConnectionConfig::default())
    }

    #[tokio::test]
    async fn test_ids_increase_and_are_never_reused() {
        let hive = Hive::new();

        let first = hive.insert(new_session("A"), connection());
        let second = hive.insert(new_session("B"), connection());
        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 2);

        hive.remove(second.id());
        let third = hive.insert(new_session("C"), connection());
        assert_eq!(third.id(), 3);
    }

    #[tokio::test]
    async fn test_lookup_by_name_is_case_insensitive() {
        let hive = Hive::new();
        let session = hive.insert(new_session("VIOLET_OTTER"), connection());

        assert_eq!(hive.get_by_name("violet_otter").unwrap().id(), session.id());
        assert_eq!(hive.resolve("Violet_Otter").unwrap().id(), session.id());
        assert_eq!(hive.resolve("1").unwrap().id(), session.id());
        assert!(hive.resolve("nobody").is_none());
    }

    #[tokio::test]
    async fn test_name_collision_gets_suffix() {
        let hive = Hive::new();
        hive.insert(new_session("OTTER"), connection());
        let second = hive.insert(new_session("otter"), connection());

        assert_eq!(second.name(), "otter-2");
    }

    #[tokio::test]
    async fn test_suffixed_name_already_taken() {
        let hive = Hive::new();
        hive.insert(new_session("otter"), connection());
        hive.insert(new_session("OTTER-3"), connection());
        let third = hive.insert(new_session("otter"), connection());

        assert_eq!(third.id(), 3);
        assert_eq!(third.name(), "otter-3-2");

        let mut names: Vec<String> = hive
            .snapshot()
            .iter()
            .map(|s| s.name().to_ascii_lowercase())
            .collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 3);
        assert_eq!(hive.resolve("otter-3").unwrap().id(), 2);
    }

    #[tokio::test]
    async fn test_generated_name_already_taken() {
        let hive = Hive::new();
        hive.insert(new_session("session-2"), connection());
        let second = hive.insert(new_session(""), connection());

        assert_eq!(second.name(), "session-2-2");
    }

    #[tokio::test]
    async fn test_snapshot_sorted_by_id() {
        let hive = Hive::new();
        for name in ["a", "b", "c", "d"] {
            hive.insert(new_session(name), connection());
        }
        hive.remove(2);

        let ids: Vec<u32> = hive.snapshot().iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![1, 3, 4]);
        assert_eq!(hive.len(), 3);
    }

    #[tokio::test]
    async fn test_events() {
        let hive = Hive::new();
        let mut events = hive.take_events().unwrap();
        assert!(hive.take_events().is_none());

        let session = hive.insert(new_session("A"), connection());
        assert!(hive.remove(session.id()).is_some());
        assert!(hive.remove(session.id()).is_none());

        assert!(matches!(events.recv().await, Some(HiveEvent::Connected(info)) if info.id == 1));
        assert!(matches!(events.recv().await, Some(HiveEvent::Disconnected(info)) if info.id == 1));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_cleanup_removes_session_once() {
        let hive = Arc::new(Hive::new());
        let mut events = hive.take_events().unwrap();

        let (local, _remote) = tokio::io::duplex(1024);
        let conn = Connection::start(local, "test", ConnectionConfig::default());
        let session = hive.insert(new_session("RACE"), conn.clone());
        hive.remove_on_close(&session);
        assert!(matches!(events.recv().await, Some(HiveEvent::Connected(_))));

        let mut handles = Vec::new();
        for i in 0..8 {
            let conn = conn.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    conn.close()
                } else {
                    conn.cleanup(CloseReason::Transport("simulated".to_string()))
                }
            }));
        }

        let mut performed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                performed += 1;
            }
        }
        assert_eq!(performed, 1);

        assert!(
            matches!(events.recv().await, Some(HiveEvent::Disconnected(info)) if info.id == session.id())
        );
        assert!(events.try_recv().is_err());
        assert!(hive.get(session.id()).is_none());
        assert!(hive.is_empty());
    }

    #[tokio::test]
    async fn test_remove_on_close_outlived_by_connection() {
        let hive = Arc::new(Hive::new());
        let (local, _remote) = tokio::io::duplex(1024);
        let conn = Connection::start(local, "test", ConnectionConfig::default());
        let session = hive.insert(new_session("ORPHAN"), conn.clone());
        hive.remove_on_close(&session);

        drop(session);
        drop(hive);
        assert!(conn.close());
    }
}
