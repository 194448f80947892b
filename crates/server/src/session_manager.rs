use crate::session::Session;
use oscard_proto::canonical_screen_name;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Process-wide screen name → live session index, canonically keyed.
///
/// The registry only looks sessions up for delivery; it never drives
/// reads and never closes a session on its own. Displaced predecessors
/// are handed back to the caller to disconnect.
#[derive(Default)]
pub struct SessionManager {
    inner: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a screen name to a session. At most one session per screen
    /// name may exist, so any previous binding is returned for the
    /// caller to disconnect (single-login invariant).
    pub fn set(&self, screen_name: &str, session: Arc<Session>) -> Option<Arc<Session>> {
        let key = canonical_screen_name(screen_name);
        let mut inner = self.inner.lock().expect("session registry lock");
        inner.insert(key, session)
    }

    pub fn get(&self, screen_name: &str) -> Option<Arc<Session>> {
        let key = canonical_screen_name(screen_name);
        let inner = self.inner.lock().expect("session registry lock");
        inner.get(&key).cloned()
    }

    /// Unbinds only if the name still maps to `session`. A superseded
    /// connection finishing its close cannot evict the login that
    /// replaced it.
    pub fn remove(&self, screen_name: &str, session: &Arc<Session>) -> bool {
        let key = canonical_screen_name(screen_name);
        let mut inner = self.inner.lock().expect("session registry lock");
        if let Some(current) = inner.get(&key) {
            if Arc::ptr_eq(current, session) {
                inner.remove(&key);
                return true;
            }
        }
        false
    }

    /// Empties the registry at shutdown, yielding every live session.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        let mut inner = self.inner.lock().expect("session registry lock");
        inner.drain().map(|(_, session)| session).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("session registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use tokio::net::{TcpListener, TcpStream};

    async fn session() -> Arc<Session> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let (_read, write) = stream.into_split();
        Session::new(write, peer, Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn lookup_is_case_and_space_insensitive() {
        let manager = SessionManager::new();
        let first = session().await;
        assert!(manager.set("Running Man 83", first.clone()).is_none());
        let found = manager.get("runningman83").unwrap();
        assert!(Arc::ptr_eq(&found, &first));
        assert!(manager.get("RUNNING man 83").is_some());
        assert!(manager.get("someone else").is_none());
    }

    #[tokio::test]
    async fn set_returns_displaced_session() {
        let manager = SessionManager::new();
        let first = session().await;
        let second = session().await;
        assert!(manager.set("alice", first.clone()).is_none());
        let displaced = manager.set("Alice", second.clone()).unwrap();
        assert!(Arc::ptr_eq(&displaced, &first));
        assert!(Arc::ptr_eq(&manager.get("alice").unwrap(), &second));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn remove_guards_on_identity() {
        let manager = SessionManager::new();
        let first = session().await;
        let second = session().await;
        manager.set("alice", first.clone());
        manager.set("alice", second.clone());
        // The displaced session's close must not evict its replacement.
        assert!(!manager.remove("alice", &first));
        assert!(manager.get("alice").is_some());
        assert!(manager.remove("alice", &second));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn drain_empties_registry() {
        let manager = SessionManager::new();
        manager.set("alice", session().await);
        manager.set("bob", session().await);
        let drained = manager.drain();
        assert_eq!(drained.len(), 2);
        assert!(manager.is_empty());
    }
}
