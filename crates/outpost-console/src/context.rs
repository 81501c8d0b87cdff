//! Per-operator console state

use outpost_control::{Hive, Session};
use std::sync::Arc;

/// The operator's current selection and callback defaults
#[derive(Debug, Clone)]
pub struct ConsoleContext {
    active: Option<Arc<Session>>,
    /// Default callback host for `generate` and `listen`
    pub lhost: String,
    /// Default callback port for `generate` and `listen`
    pub lport: u16,
}

impl ConsoleContext {
    pub fn new(lhost: impl Into<String>, lport: u16) -> Self {
        Self {
            active: None,
            lhost: lhost.into(),
            lport,
        }
    }

    pub fn active(&self) -> Option<&Arc<Session>> {
        self.active.as_ref()
    }

    pub fn select(&mut self, session: Arc<Session>) {
        self.active = Some(session);
    }

    /// Drop the selection, returning what was selected
    pub fn background(&mut self) -> Option<Arc<Session>> {
        self.active.take()
    }

    /// Deselect `session_id` if it is the active session
    pub fn clear_if_active(&mut self, session_id: u32) -> bool {
        if self.active.as_ref().map(|s| s.id()) == Some(session_id) {
            self.active = None;
            return true;
        }
        false
    }

    /// An explicit target if given, otherwise the active session
    pub fn target(&self, hive: &Hive, target: Option<&str>) -> Option<Arc<Session>> {
        match target {
            Some(target) => hive.resolve(target),
            None => self.active.clone(),
        }
    }

    pub fn prompt(&self) -> String {
        match &self.active {
            Some(session) => format!("outpost ({}) > ", session.name()),
            None => "outpost > ".to_string(),
        }
    }
}

impl Default for ConsoleContext {
    fn default() -> Self {
        Self::new("", 8888)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_control::NewSession;
    use outpost_transport::{Connection, ConnectionConfig};

    fn session(hive: &Hive, name: &str) -> Arc<Session> {
        let (local, _remote) = tokio::io::duplex(1024);
        let connection = Connection::start(local, "pipe", ConnectionConfig::default());
        hive.insert(
            NewSession {
                name: name.to_string(),
                ..Default::default()
            },
            connection,
        )
    }

    #[tokio::test]
    async fn test_selection() {
        let hive = Hive::new();
        let first = session(&hive, "RED_FERN");
        let second = session(&hive, "BLUE_MOSS");

        let mut ctx = ConsoleContext::default();
        assert_eq!(ctx.prompt(), "outpost > ");
        assert!(ctx.target(&hive, None).is_none());

        ctx.select(first.clone());
        assert_eq!(ctx.prompt(), "outpost (RED_FERN) > ");
        assert_eq!(ctx.target(&hive, None).unwrap().id(), first.id());
        assert_eq!(ctx.target(&hive, Some("blue_moss")).unwrap().id(), second.id());

        assert!(!ctx.clear_if_active(second.id()));
        assert!(ctx.clear_if_active(first.id()));
        assert!(ctx.active().is_none());

        ctx.select(second.clone());
        assert_eq!(ctx.background().unwrap().id(), second.id());
        assert!(ctx.active().is_none());
    }
}
