//! # Connection Registry
//!
//! Live connections, their lifecycle state and the names they registered under.
//!
//! ## Invariants
//!
//! - **Bijective names**: A name maps to at most one connection and a
//!   connection holds at most one name. Re-registering a name moves it to the
//!   newer connection.
//! - **Observable state**: Each entry carries a `watch` channel, so tasks can
//!   wait for a connection to become `Ready` or `Closed` without polling.
//! - **Removal closes**: Removing an entry publishes `Closed` before the entry
//!   disappears.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::error::Error;
use crate::error::Result;
use crate::transport::Connection;

/// Identifies one connection for the lifetime of the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Connected,
    /// Waiting for the registration call.
    Authenticating,
    Ready,
    Closed,
}

struct Entry {
    conn: Arc<dyn Connection>,
    name: Option<String>,
    state: watch::Sender<ConnState>,
}

#[derive(Default)]
pub struct Registry {
    entries: DashMap<ConnId, Entry>,
    names: DashMap<String, ConnId>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: Arc<dyn Connection>, state: ConnState) -> ConnId {
        let id = ConnId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (state, _) = watch::channel(state);
        self.entries.insert(id, Entry { conn, name: None, state });
        id
    }

    pub fn connection(&self, id: ConnId) -> Option<Arc<dyn Connection>> {
        self.entries.get(&id).map(|e| e.conn.clone())
    }

    /// Binds `name` to `id`, releasing whatever either held before.
    pub fn register_name(&self, id: ConnId, name: &str) -> Result<()> {
        let previous = {
            let mut entry = self.entries.get_mut(&id).ok_or(Error::ConnectionClosed)?;
            entry.name.replace(name.to_string())
        };

        if let Some(previous) = previous {
            self.names.remove_if(&previous, |_, owner| *owner == id);
        }
        if let Some(displaced) = self.names.insert(name.to_string(), id) {
            if displaced != id {
                if let Some(mut entry) = self.entries.get_mut(&displaced) {
                    entry.name = None;
                }
            }
        }
        Ok(())
    }

    pub fn lookup_name(&self, name: &str) -> Option<ConnId> {
        self.names.get(name).map(|id| *id)
    }

    pub fn name_of(&self, id: ConnId) -> Option<String> {
        self.entries.get(&id).and_then(|e| e.name.clone())
    }

    pub fn state(&self, id: ConnId) -> Option<ConnState> {
        self.entries.get(&id).map(|e| *e.state.borrow())
    }

    pub fn set_state(&self, id: ConnId, state: ConnState) {
        if let Some(entry) = self.entries.get(&id) {
            entry.state.send_replace(state);
        }
    }

    pub fn watch_state(&self, id: ConnId) -> Option<watch::Receiver<ConnState>> {
        self.entries.get(&id).map(|e| e.state.subscribe())
    }

    /// Drops the entry and its name. Returns the connection if it was present.
    pub fn remove(&self, id: ConnId) -> Option<Arc<dyn Connection>> {
        let (_, entry) = self.entries.remove(&id)?;
        entry.state.send_replace(ConnState::Closed);
        if let Some(name) = &entry.name {
            self.names.remove_if(name, |_, owner| *owner == id);
        }
        Some(entry.conn)
    }

    pub fn ids(&self) -> Vec<ConnId> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnection;

    fn conn() -> Arc<dyn Connection> {
        Arc::new(MemoryConnection::pair().0)
    }

    #[test]
    fn test_names_are_bijective() {
        let registry = Registry::new();
        let a = registry.insert(conn(), ConnState::Authenticating);
        let b = registry.insert(conn(), ConnState::Authenticating);
        assert_eq!(a.to_string(), "conn-1");

        registry.register_name(a, "alice").unwrap();
        assert_eq!(registry.lookup_name("alice"), Some(a));

        // Newer connection takes the name over.
        registry.register_name(b, "alice").unwrap();
        assert_eq!(registry.lookup_name("alice"), Some(b));
        assert_eq!(registry.name_of(a), None);

        // Renaming releases the old name.
        registry.register_name(b, "bob").unwrap();
        assert_eq!(registry.lookup_name("alice"), None);
        assert_eq!(registry.name_of(b).as_deref(), Some("bob"));
    }

    #[test]
    fn test_remove_publishes_closed() {
        let registry = Registry::new();
        let id = registry.insert(conn(), ConnState::Authenticating);
        registry.register_name(id, "alice").unwrap();
        let state = registry.watch_state(id).unwrap();

        registry.set_state(id, ConnState::Ready);
        assert_eq!(*state.borrow(), ConnState::Ready);

        assert!(registry.remove(id).is_some());
        assert_eq!(*state.borrow(), ConnState::Closed);
        assert_eq!(registry.lookup_name("alice"), None);
        assert_eq!(registry.state(id), None);
        assert!(registry.register_name(id, "again").is_err());
    }
}
