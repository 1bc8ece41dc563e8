//! Registry of live terminal sessions.
//!
//! This module provides a thread-safe table from session id to [`Session`],
//! enforces the concurrent session limit, sweeps idle sessions, and fans
//! shutdown out to every session.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::lifecycle::{Session, SessionInfo};
use super::pty::SessionId;
use super::state::{CloseReason, SessionState};

/// Errors returned when admitting a session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The concurrent session limit has been reached.
    #[error("session limit of {limit} reached")]
    LimitReached {
        /// Configured limit.
        limit: usize,
    },

    /// A session with this id is already registered.
    #[error("session already registered: {0}")]
    Duplicate(SessionId),
}

/// Longest pause between idle sweeps.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Shortest pause between idle sweeps.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Thread-safe session registry using DashMap.
pub struct SessionRegistry {
    /// Map of session ID to session.
    sessions: DashMap<SessionId, Arc<Session>>,

    /// Maximum concurrent sessions, if limited.
    limit: Option<usize>,

    /// Admitted sessions, counted before insertion so the limit is exact.
    admitted: AtomicUsize,

    /// Signalled whenever a session is removed.
    removed: Notify,
}

impl SessionRegistry {
    /// Creates a registry. `None` means no session limit.
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            sessions: DashMap::new(),
            limit,
            admitted: AtomicUsize::new(0),
            removed: Notify::new(),
        }
    }

    /// Admit a session, failing if the registry is full.
    pub fn try_register(&self, session: Arc<Session>) -> Result<(), RegistryError> {
        let previous = self.admitted.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.limit {
            if previous >= limit {
                self.admitted.fetch_sub(1, Ordering::SeqCst);
                return Err(RegistryError::LimitReached { limit });
            }
        }

        match self.sessions.entry(session.id().clone()) {
            Entry::Occupied(entry) => {
                self.admitted.fetch_sub(1, Ordering::SeqCst);
                Err(RegistryError::Duplicate(entry.key().clone()))
            }
            Entry::Vacant(entry) => {
                tracing::debug!(session_id = %session.id(), "Registered session");
                entry.insert(session);
                Ok(())
            }
        }
    }

    /// Remove a session, returning it if it was registered.
    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(session_id).map(|(_, session)| session);
        if removed.is_some() {
            self.admitted.fetch_sub(1, Ordering::SeqCst);
            self.removed.notify_waiters();
            tracing::debug!(session_id = %session_id, "Removed session");
        }
        removed
    }

    /// Look up a session.
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Number of registered sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true when no sessions are registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Configured session limit.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Snapshots of all registered sessions.
    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| entry.value().info())
            .collect()
    }

    /// Begin closing every session. Returns how many teardowns this started.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        self.snapshot()
            .iter()
            .filter(|session| session.begin_close(reason))
            .count()
    }

    /// Close active sessions that have been idle for at least `timeout`.
    pub fn sweep_idle(&self, timeout: Duration) -> Vec<SessionId> {
        let mut closed = Vec::new();
        for session in self.snapshot() {
            if session.state() != SessionState::Active || session.idle_for() < timeout {
                continue;
            }
            if session.begin_close(CloseReason::IdleTimeout) {
                tracing::info!(
                    session_id = %session.id(),
                    idle_secs = session.idle_for().as_secs(),
                    "Closed idle session"
                );
                closed.push(session.id().clone());
            }
        }
        closed
    }

    /// Starts a background task that closes idle sessions until `shutdown`.
    pub fn start_idle_reaper(
        self: &Arc<Self>,
        timeout: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let period = (timeout / 2).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(period) => {
                        registry.sweep_idle(timeout);
                    }
                }
            }
            tracing::debug!("Idle reaper stopped");
        })
    }

    /// Resolves once every session has been removed.
    pub async fn wait_until_empty(&self) {
        loop {
            let removed = self.removed.notified();
            if self.sessions.is_empty() {
                return;
            }
            removed.await;
        }
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::Principal;
    use crate::session::fake::FakeProcess;
    use nix::sys::signal::Signal;
    use protocol::Role;

    fn active_session() -> Arc<Session> {
        let session = Arc::new(Session::new(None, Signal::SIGHUP));
        session.begin_authentication().unwrap();
        session.activate(Principal { role: Role::Admin }).unwrap();
        session
    }

    #[test]
    fn test_register_and_get() {
        let registry = SessionRegistry::default();
        let session = active_session();
        registry.try_register(Arc::clone(&session)).unwrap();

        assert_eq!(registry.count(), 1);
        assert!(registry.get(session.id()).is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_duplicate_rejected() {
        let registry = SessionRegistry::default();
        let session = active_session();
        registry.try_register(Arc::clone(&session)).unwrap();

        assert_eq!(
            registry.try_register(Arc::clone(&session)),
            Err(RegistryError::Duplicate(session.id().clone()))
        );
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_limit_enforced() {
        let registry = SessionRegistry::new(Some(2));
        registry.try_register(active_session()).unwrap();
        registry.try_register(active_session()).unwrap();

        assert_eq!(
            registry.try_register(active_session()),
            Err(RegistryError::LimitReached { limit: 2 })
        );
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn test_remove_frees_slot() {
        let registry = SessionRegistry::new(Some(1));
        let session = active_session();
        registry.try_register(Arc::clone(&session)).unwrap();
        assert!(registry.try_register(active_session()).is_err());

        assert!(registry.remove(session.id()).is_some());
        assert!(registry.remove(session.id()).is_none());
        assert!(registry.is_empty());

        registry.try_register(active_session()).unwrap();
    }

    #[test]
    fn test_list() {
        let registry = SessionRegistry::default();
        let session = active_session();
        session.attach_process(FakeProcess::new()).unwrap();
        registry.try_register(Arc::clone(&session)).unwrap();

        let infos = registry.list();
        assert_eq!(infos.len(), 1);
        assert_eq!(&infos[0].id, session.id());
        assert_eq!(infos[0].pid, Some(FakeProcess::PID));
    }

    #[test]
    fn test_close_all() {
        let registry = SessionRegistry::default();
        let processes: Vec<_> = (0..3)
            .map(|_| {
                let session = active_session();
                let process = FakeProcess::new();
                session.attach_process(process.clone()).unwrap();
                registry.try_register(session).unwrap();
                process
            })
            .collect();

        assert_eq!(registry.close_all(CloseReason::Shutdown), 3);
        // Already closing: nothing new to start
        assert_eq!(registry.close_all(CloseReason::Shutdown), 0);

        for process in processes {
            assert_eq!(process.kills(), vec![Signal::SIGHUP]);
        }
    }

    #[tokio::test]
    async fn test_sweep_idle() {
        let registry = SessionRegistry::default();
        let idle = active_session();
        let busy = active_session();
        registry.try_register(Arc::clone(&idle)).unwrap();
        registry.try_register(Arc::clone(&busy)).unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        busy.touch();

        let closed = registry.sweep_idle(Duration::from_millis(50));
        assert_eq!(closed, vec![idle.id().clone()]);
        assert_eq!(idle.close_reason(), Some(CloseReason::IdleTimeout));
        assert_eq!(busy.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_idle_reaper_task() {
        let registry = Arc::new(SessionRegistry::default());
        let session = active_session();
        registry.try_register(Arc::clone(&session)).unwrap();

        let shutdown = CancellationToken::new();
        let reaper = registry.start_idle_reaper(Duration::from_millis(100), shutdown.clone());

        tokio::time::timeout(Duration::from_secs(2), session.cancel_token().cancelled())
            .await
            .expect("idle session was not closed");
        assert_eq!(session.close_reason(), Some(CloseReason::IdleTimeout));

        shutdown.cancel();
        reaper.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_until_empty() {
        let registry = Arc::new(SessionRegistry::default());
        let session = active_session();
        registry.try_register(Arc::clone(&session)).unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.wait_until_empty().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        registry.remove(session.id());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter did not finish")
            .unwrap();
    }
}
