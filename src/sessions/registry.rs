//! In-process table of live sessions.
//!
//! The registry is authoritative for "is the session runtime actually up
//! right now"; the persistent lease is authoritative for "should it be
//! up". One mutex guards the map; readers take cloned snapshots so no I/O
//! ever happens under the lock.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::sessions::SessionEvent;
use crate::ssh::ControlChannel;

/// Runtime state of one session. Cheap to clone: the channel handles are
/// reference-counted.
#[derive(Clone)]
pub struct LiveSession {
    pub session_id: Uuid,
    pub account_id: Uuid,
    pub connection_id: Uuid,
    pub control: Arc<dyn ControlChannel>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub peers: usize,
    /// Fan-out channel WebSocket peers subscribe to.
    pub events: broadcast::Sender<SessionEvent>,
    /// Inbound chat lines, consumed by the session's message pump.
    pub inbound: mpsc::Sender<String>,
}

impl LiveSession {
    pub fn control_socket_path(&self) -> PathBuf {
        self.control.socket_path().to_path_buf()
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, LiveSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly launched session. Refuses duplicates; the caller
    /// treats that as a launch failure.
    pub fn create(&self, live: LiveSession) -> Result<(), ()> {
        let mut sessions = self.sessions.lock().expect("registry poisoned");
        if sessions.contains_key(&live.session_id) {
            return Err(());
        }
        sessions.insert(live.session_id, live);
        Ok(())
    }

    pub fn get(&self, session_id: Uuid) -> Option<LiveSession> {
        self.sessions
            .lock()
            .expect("registry poisoned")
            .get(&session_id)
            .cloned()
    }

    pub fn remove(&self, session_id: Uuid) -> Option<LiveSession> {
        self.sessions
            .lock()
            .expect("registry poisoned")
            .remove(&session_id)
    }

    /// Snapshot of every live session.
    pub fn list(&self) -> Vec<LiveSession> {
        self.sessions
            .lock()
            .expect("registry poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record activity on a session (each WebSocket frame).
    pub fn touch(&self, session_id: Uuid, now: DateTime<Utc>) {
        if let Some(live) = self
            .sessions
            .lock()
            .expect("registry poisoned")
            .get_mut(&session_id)
        {
            live.last_activity = now;
        }
    }

    /// Attach a chat peer: bumps the peer count and returns a receiver on
    /// the session's fan-out channel.
    pub fn add_peer(&self, session_id: Uuid) -> Option<broadcast::Receiver<SessionEvent>> {
        let mut sessions = self.sessions.lock().expect("registry poisoned");
        let live = sessions.get_mut(&session_id)?;
        live.peers += 1;
        Some(live.events.subscribe())
    }

    pub fn remove_peer(&self, session_id: Uuid) {
        if let Some(live) = self
            .sessions
            .lock()
            .expect("registry poisoned")
            .get_mut(&session_id)
        {
            live.peers = live.peers.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;

    struct NullChannel {
        path: PathBuf,
    }

    #[async_trait]
    impl ControlChannel for NullChannel {
        fn socket_path(&self) -> &Path {
            &self.path
        }

        async fn check(&self) -> bool {
            true
        }

        async fn run(&self, _command: &str, _timeout: Duration) -> crate::error::Result<String> {
            Ok(String::new())
        }

        async fn stop(&self, _grace: Duration) {}
    }

    fn live(session_id: Uuid) -> LiveSession {
        let (events, _) = broadcast::channel(16);
        let (inbound, _rx) = mpsc::channel(16);
        let now = Utc::now();
        LiveSession {
            session_id,
            account_id: Uuid::new_v4(),
            connection_id: Uuid::new_v4(),
            control: Arc::new(NullChannel {
                path: PathBuf::from(format!("/tmp/clawdfather/{session_id}.sock")),
            }),
            started_at: now,
            last_activity: now,
            peers: 0,
            events,
            inbound,
        }
    }

    #[test]
    fn create_get_remove_roundtrip() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        registry.create(live(id)).unwrap();
        assert!(registry.get(id).is_some());
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(id).is_some());
        assert!(registry.get(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn duplicate_session_ids_are_refused() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        registry.create(live(id)).unwrap();
        assert!(registry.create(live(id)).is_err());
    }

    #[test]
    fn touch_updates_last_activity() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        registry.create(live(id)).unwrap();
        let later = Utc::now() + chrono::Duration::minutes(5);
        registry.touch(id, later);
        assert_eq!(registry.get(id).unwrap().last_activity, later);
    }

    #[test]
    fn peers_attach_and_detach() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        registry.create(live(id)).unwrap();
        let _rx = registry.add_peer(id).unwrap();
        assert_eq!(registry.get(id).unwrap().peers, 1);
        registry.remove_peer(id);
        assert_eq!(registry.get(id).unwrap().peers, 0);
        assert!(registry.add_peer(Uuid::new_v4()).is_none());
    }
}
