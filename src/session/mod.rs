//! Per-session serialization.
//!
//! All work for one session runs under that session's lock, so two turns
//! racing on a brand-new session cannot each attach a different remote
//! handle: the second one finds the handle the first one stored. Different
//! sessions never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;

type SessionMutex = Arc<tokio::sync::Mutex<()>>;

struct Entry {
    mutex: SessionMutex,
    /// Holders plus waiters. The entry goes away when this reaches zero.
    users: usize,
}

/// Lazily created async locks keyed by session id.
#[derive(Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<String, Entry>>,
}

/// Counts one holder or waiter against a session's entry until dropped,
/// whether or not the lock was ever acquired.
struct Registration<'a> {
    locks: &'a SessionLocks,
    session_id: String,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let mut table = self.locks.table();
        if let Some(entry) = table.get_mut(&self.session_id) {
            entry.users -= 1;
            if entry.users == 0 {
                table.remove(&self.session_id);
            }
        }
    }
}

/// Held for the duration of one session's turn.
pub struct SessionGuard<'a> {
    _guard: OwnedMutexGuard<()>,
    registration: Registration<'a>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the session's lock. Dropping the returned future before it
    /// resolves gives up the place in line.
    pub async fn lock(&self, session_id: &str) -> SessionGuard<'_> {
        let (registration, mutex) = self.register(session_id);
        let guard = mutex.lock_owned().await;
        SessionGuard {
            _guard: guard,
            registration,
        }
    }

    /// Number of sessions with a holder or waiter.
    pub fn active(&self) -> usize {
        self.table().len()
    }

    fn register(&self, session_id: &str) -> (Registration<'_>, SessionMutex) {
        let mut table = self.table();
        let entry = table.entry(session_id.to_string()).or_insert_with(|| Entry {
            mutex: SessionMutex::default(),
            users: 0,
        });
        entry.users += 1;
        let mutex = entry.mutex.clone();
        let registration = Registration {
            locks: self,
            session_id: session_id.to_string(),
        };
        (registration, mutex)
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionGuard<'_> {
    pub fn session_id(&self) -> &str {
        &self.registration.session_id
    }
}
