use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::session::Identity;

#[derive(Debug)]
struct SessionEntry {
    identity: Identity,
    peer: Option<SocketAddr>,
    connected_at: Instant,
    cancelled: AtomicBool,
}

/// Shared view of one live session. Clones point at the same session;
/// `cancel` asks its loop to wind down.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inner: Arc<SessionEntry>,
}

impl SessionHandle {
    pub fn new(identity: Identity, peer: Option<SocketAddr>) -> Self {
        Self {
            inner: Arc::new(SessionEntry {
                identity,
                peer,
                connected_at: Instant::now(),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    pub fn connected_at(&self) -> Instant {
        self.inner.connected_at
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn same_session(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Characters currently in the game. One lock guards the whole map, so
/// every operation is a single atomic step.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionHandle>> {
        // The map holds no invariant a panicking holder could break halfway.
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `handle` unless its character already has a session.
    pub fn try_add(&self, handle: SessionHandle) -> bool {
        let mut sessions = self.lock();
        let key = handle.identity().key().to_string();
        if sessions.contains_key(&key) {
            return false;
        }
        sessions.insert(key, handle);
        true
    }

    pub fn try_remove(&self, identity: &Identity) -> bool {
        self.lock().remove(identity.key()).is_some()
    }

    /// Removes the entry only while it still belongs to `handle`.
    pub fn remove_if_same(&self, handle: &SessionHandle) -> bool {
        let mut sessions = self.lock();
        let key = handle.identity().key();
        match sessions.get(key) {
            Some(current) if current.same_session(handle) => {
                sessions.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn is_online(&self, identity: &Identity) -> bool {
        self.lock().contains_key(identity.key())
    }

    pub fn get(&self, identity: &Identity) -> Option<SessionHandle> {
        self.lock().get(identity.key()).cloned()
    }

    /// Snapshot of the live sessions; iterating it never blocks the registry.
    pub fn sessions(&self) -> Vec<SessionHandle> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Flags the character's session for shutdown. The entry stays until the
    /// session's own cleanup removes it.
    pub fn kick(&self, identity: &Identity) -> bool {
        match self.lock().get(identity.key()) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn handle(name: &str) -> SessionHandle {
        SessionHandle::new(Identity::new(name), None)
    }

    #[test]
    fn add_remove_and_lookup() {
        let registry = SessionRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.try_add(handle("Alice")));
        assert!(registry.is_online(&Identity::new("alice")));
        assert!(!registry.try_add(handle("ALICE")));
        assert_eq!(registry.len(), 1);

        assert!(registry.try_remove(&Identity::new("Alice")));
        assert!(!registry.try_remove(&Identity::new("Alice")));
        assert!(!registry.is_online(&Identity::new("Alice")));
    }

    #[test]
    fn concurrent_adds_admit_exactly_one() {
        const THREADS: usize = 16;
        for _ in 0..20 {
            let registry = Arc::new(SessionRegistry::new());
            let barrier = Arc::new(Barrier::new(THREADS));
            let workers: Vec<_> = (0..THREADS)
                .map(|_| {
                    let registry = Arc::clone(&registry);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        registry.try_add(handle("Sir Tibius"))
                    })
                })
                .collect();
            let winners = workers
                .into_iter()
                .map(|worker| worker.join().expect("worker"))
                .filter(|won| *won)
                .count();
            assert_eq!(winners, 1);
            assert_eq!(registry.len(), 1);
        }
    }

    #[test]
    fn stale_cleanup_leaves_newer_session_alone() {
        let registry = SessionRegistry::new();
        let old = handle("Bob");
        assert!(registry.try_add(old.clone()));
        assert!(registry.remove_if_same(&old));

        let newer = handle("Bob");
        assert!(registry.try_add(newer.clone()));
        assert!(!registry.remove_if_same(&old));
        assert!(registry.is_online(&Identity::new("Bob")));
        assert!(registry.remove_if_same(&newer));
    }

    #[test]
    fn kick_flags_the_live_session() {
        let registry = SessionRegistry::new();
        let session = handle("Carol");
        registry.try_add(session.clone());
        assert!(!session.is_cancelled());
        assert!(registry.kick(&Identity::new("carol")));
        assert!(session.is_cancelled());
        assert!(registry.is_online(&Identity::new("Carol")));
        assert!(!registry.kick(&Identity::new("Dave")));
    }

    #[test]
    fn snapshot_survives_concurrent_mutation() {
        let registry = SessionRegistry::new();
        for name in ["a", "b", "c"] {
            registry.try_add(handle(name));
        }
        let snapshot = registry.sessions();
        registry.try_remove(&Identity::new("a"));
        registry.try_add(handle("d"));
        assert_eq!(snapshot.len(), 3);
        assert_eq!(registry.len(), 3);
        let mut names: Vec<_> = snapshot
            .iter()
            .map(|handle| handle.identity().as_str().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
