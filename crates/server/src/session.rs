use roster_mcp::protocol::OutboundFrame;
use roster_mcp::{CapabilityRegistry, McpConnection};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

/// Maps session identifiers to their live protocol connections
///
/// One entry per open event stream; entries are removed when the stream
/// closes. Scoped to the server process, held in `AppState` and passed to
/// the handlers that need it.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<McpConnection>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new session and hand back its id plus the frame receiver
    /// the event stream drains
    pub fn open(
        &self,
        capabilities: Arc<CapabilityRegistry>,
        sampling_timeout: Duration,
    ) -> (String, mpsc::Receiver<OutboundFrame>) {
        let session_id = uuid::Uuid::new_v4().to_string();
        let (connection, frames) = McpConnection::new(capabilities, sampling_timeout);

        self.sessions
            .write()
            .unwrap()
            .insert(session_id.clone(), connection);

        tracing::info!("Session {} opened", session_id);
        (session_id, frames)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<McpConnection>> {
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    /// Remove a session; closing one that is already gone is a no-op
    pub fn close(&self, session_id: &str) {
        if self.sessions.write().unwrap().remove(session_id).is_some() {
            tracing::info!("Session {} closed", session_id);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().unwrap().is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the session when its event stream is dropped
pub struct SessionGuard {
    session_id: String,
    sessions: Arc<SessionRegistry>,
}

impl SessionGuard {
    pub fn new(session_id: String, sessions: Arc<SessionRegistry>) -> Self {
        Self {
            session_id,
            sessions,
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.close(&self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new()
    }

    fn capabilities() -> Arc<CapabilityRegistry> {
        Arc::new(CapabilityRegistry::new())
    }

    #[tokio::test]
    async fn test_open_get_close_lifecycle() {
        let sessions = registry();
        let (id, _frames) = sessions.open(capabilities(), Duration::from_secs(1));

        assert!(sessions.get(&id).is_some());
        assert_eq!(sessions.len(), 1);

        sessions.close(&id);
        assert!(sessions.get(&id).is_none());
        assert!(sessions.is_empty());

        // Idempotent
        sessions.close(&id);
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn test_session_ids_are_distinct() {
        let sessions = registry();
        let (a, _fa) = sessions.open(capabilities(), Duration::from_secs(1));
        let (b, _fb) = sessions.open(capabilities(), Duration::from_secs(1));

        assert_ne!(a, b);
        assert_eq!(sessions.len(), 2);
    }

    #[tokio::test]
    async fn test_guard_drop_closes_session() {
        let sessions = Arc::new(registry());
        let (id, _frames) = sessions.open(capabilities(), Duration::from_secs(1));

        {
            let _guard = SessionGuard::new(id.clone(), sessions.clone());
        }
        assert!(sessions.get(&id).is_none());
    }
}
