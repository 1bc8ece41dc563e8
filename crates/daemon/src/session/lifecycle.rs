//! Session lifecycle controller.
//!
//! A [`Session`] is created when a client's transport handshake arrives and
//! walks `Connecting → Authenticating → Active → Closing → Closed`. It owns
//! the session's shell once authenticated and guarantees the shell is
//! signalled exactly once, however many close triggers race.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use protocol::Geometry;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::pty::{ExitInfo, ProcessHandle, SessionId};
use super::state::{CloseReason, SessionState};
use crate::gate::Principal;

/// How long to wait for the shell to die after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Errors from invalid lifecycle operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    /// The requested state change is not allowed.
    #[error("invalid session transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: SessionState,
        /// Requested state.
        to: SessionState,
    },

    /// A shell can only be attached to an active session.
    #[error("session is {0}, cannot attach a process")]
    NotActive(SessionState),

    /// The session already owns a shell.
    #[error("session already has a process")]
    ProcessAlreadyAttached,
}

/// Snapshot of a session for listing and logging.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Current state.
    pub state: SessionState,
    /// Remote address of the client.
    pub peer: Option<SocketAddr>,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Process ID of the shell.
    pub pid: Option<u32>,
    /// Current terminal size.
    pub geometry: Option<Geometry>,
    /// Why the session ended, once it has.
    pub close_reason: Option<CloseReason>,
}

struct Inner {
    state: SessionState,
    principal: Option<Principal>,
    process: Option<Arc<dyn ProcessHandle>>,
    close_reason: Option<CloseReason>,
    kills_issued: usize,
}

/// One client's terminal session.
pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    created_at: DateTime<Utc>,
    kill_signal: Signal,
    inner: Mutex<Inner>,
    cancel: CancellationToken,
    started: Instant,
    /// Milliseconds since `started` at the last observed traffic.
    last_activity_ms: AtomicU64,
}

impl Session {
    /// Create a session in the `Connecting` state.
    ///
    /// `kill_signal` is sent to the shell when the session starts closing.
    pub fn new(peer: Option<SocketAddr>, kill_signal: Signal) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            peer,
            created_at: Utc::now(),
            kill_signal,
            inner: Mutex::new(Inner {
                state: SessionState::Connecting,
                principal: None,
                process: None,
                close_reason: None,
                kills_issued: 0,
            }),
            cancel: CancellationToken::new(),
            started: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the client's address.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Returns the creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Returns the authenticated principal, once active.
    pub fn principal(&self) -> Option<Principal> {
        self.lock().principal.clone()
    }

    /// Returns the owned shell, if one is attached.
    pub fn process(&self) -> Option<Arc<dyn ProcessHandle>> {
        self.lock().process.clone()
    }

    /// Returns why the session ended, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lock().close_reason
    }

    /// Number of times the shell has been signalled by teardown.
    pub fn kills_issued(&self) -> usize {
        self.lock().kills_issued
    }

    /// Token cancelled when the session starts closing.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Record traffic on the session.
    pub fn touch(&self) {
        self.last_activity_ms
            .store(self.started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Time since the last recorded traffic.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    /// Handshake metadata received; start checking the credential.
    pub fn begin_authentication(&self) -> Result<(), LifecycleError> {
        let mut inner = self.lock();
        transition(&mut inner, SessionState::Authenticating)
    }

    /// Credential accepted.
    pub fn activate(&self, principal: Principal) -> Result<(), LifecycleError> {
        let mut inner = self.lock();
        transition(&mut inner, SessionState::Active)?;
        inner.principal = Some(principal);
        drop(inner);

        self.touch();
        tracing::debug!(session_id = %self.id, "Session active");
        Ok(())
    }

    /// Credential rejected. The session closes without ever owning a shell.
    pub fn reject(&self, reason: CloseReason) -> Result<(), LifecycleError> {
        let mut inner = self.lock();
        transition(&mut inner, SessionState::Closed)?;
        inner.close_reason = Some(reason);
        drop(inner);

        self.cancel.cancel();
        tracing::debug!(session_id = %self.id, reason = %reason, "Session rejected");
        Ok(())
    }

    /// Hand the session its shell.
    ///
    /// Fails if the session is no longer active or already owns a shell; the
    /// caller then still owns `process` and must terminate it.
    pub fn attach_process(&self, process: Arc<dyn ProcessHandle>) -> Result<(), LifecycleError> {
        let mut inner = self.lock();
        if inner.state != SessionState::Active {
            return Err(LifecycleError::NotActive(inner.state));
        }
        if inner.process.is_some() {
            return Err(LifecycleError::ProcessAlreadyAttached);
        }
        inner.process = Some(process);
        Ok(())
    }

    /// Start tearing the session down.
    ///
    /// On the first call from `Active` this moves to `Closing`, signals the
    /// shell before returning, and cancels the session token. Every other call
    /// is a no-op. Returns true if this call started the teardown.
    pub fn begin_close(&self, reason: CloseReason) -> bool {
        let process = {
            let mut inner = self.lock();
            if inner.state != SessionState::Active {
                return false;
            }
            inner.state = SessionState::Closing;
            inner.close_reason = Some(reason);
            if inner.process.is_some() {
                inner.kills_issued += 1;
            }
            inner.process.clone()
        };

        if let Some(process) = &process {
            if let Err(e) = process.kill(self.kill_signal) {
                tracing::warn!(
                    session_id = %self.id,
                    error = %e,
                    "Failed to signal shell"
                );
            }
        }
        self.cancel.cancel();

        tracing::info!(
            session_id = %self.id,
            reason = %reason,
            pid = ?process.as_ref().and_then(|p| p.pid()),
            "Session closing"
        );
        true
    }

    /// Wait for the shell to exit and move to `Closed`.
    ///
    /// With a grace period, a shell still alive when it expires is sent
    /// SIGKILL. Returns the shell's exit status if it was observed. Calling
    /// this on a session that is already closed is a no-op.
    pub async fn finish_close(
        &self,
        grace: Option<Duration>,
    ) -> Result<Option<ExitInfo>, LifecycleError> {
        let process = {
            let inner = self.lock();
            match inner.state {
                SessionState::Closed => return Ok(None),
                SessionState::Closing => inner.process.clone(),
                from => {
                    return Err(LifecycleError::InvalidTransition {
                        from,
                        to: SessionState::Closed,
                    })
                }
            }
        };

        let exit = match process {
            Some(process) => self.wait_for_exit(process.as_ref(), grace).await,
            None => None,
        };

        let mut inner = self.lock();
        if inner.state == SessionState::Closing {
            inner.state = SessionState::Closed;
        }
        drop(inner);

        tracing::debug!(session_id = %self.id, exit = ?exit, "Session closed");
        Ok(exit)
    }

    async fn wait_for_exit(
        &self,
        process: &dyn ProcessHandle,
        grace: Option<Duration>,
    ) -> Option<ExitInfo> {
        let mut status = process.exit_status();

        let Some(grace) = grace else {
            return wait_exited(&mut status).await;
        };

        if let Ok(exit) = tokio::time::timeout(grace, wait_exited(&mut status)).await {
            return exit;
        }

        tracing::warn!(
            session_id = %self.id,
            pid = ?process.pid(),
            "Shell ignored {:?} for {:?}, sending SIGKILL",
            self.kill_signal,
            grace
        );
        if let Err(e) = process.kill(Signal::SIGKILL) {
            tracing::error!(session_id = %self.id, error = %e, "Failed to kill shell");
        }

        match tokio::time::timeout(KILL_WAIT, wait_exited(&mut status)).await {
            Ok(exit) => exit,
            Err(_) => {
                tracing::error!(
                    session_id = %self.id,
                    pid = ?process.pid(),
                    "Shell still running after SIGKILL"
                );
                None
            }
        }
    }

    /// Snapshot for listing and logging.
    pub fn info(&self) -> SessionInfo {
        let inner = self.lock();
        SessionInfo {
            id: self.id.clone(),
            state: inner.state,
            peer: self.peer,
            created_at: self.created_at,
            pid: inner.process.as_ref().and_then(|p| p.pid()),
            geometry: inner.process.as_ref().map(|p| p.geometry()),
            close_reason: inner.close_reason,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Resolves once the exit status is published.
async fn wait_exited(status: &mut watch::Receiver<Option<ExitInfo>>) -> Option<ExitInfo> {
    status.wait_for(|s| s.is_some()).await.map(|s| *s).ok().flatten()
}

fn transition(inner: &mut Inner, next: SessionState) -> Result<(), LifecycleError> {
    if !inner.state.can_transition_to(next) {
        return Err(LifecycleError::InvalidTransition {
            from: inner.state,
            to: next,
        });
    }
    inner.state = next;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fake::FakeProcess;
    use protocol::Role;

    fn admin() -> Principal {
        Principal { role: Role::Admin }
    }

    fn active_session() -> Session {
        let session = Session::new(None, Signal::SIGHUP);
        session.begin_authentication().unwrap();
        session.activate(admin()).unwrap();
        session
    }

    #[test]
    fn test_new_session() {
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let session = Session::new(Some(peer), Signal::SIGHUP);
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.peer(), Some(peer));
        assert_eq!(session.id().len(), 36);
        assert!(session.principal().is_none());
        assert!(session.process().is_none());
        assert!(!session.cancel_token().is_cancelled());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Session::new(None, Signal::SIGHUP);
        let b = Session::new(None, Signal::SIGHUP);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_happy_path_to_active() {
        let session = active_session();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.principal(), Some(admin()));
    }

    #[test]
    fn test_cannot_activate_without_authenticating() {
        let session = Session::new(None, Signal::SIGHUP);
        assert_eq!(
            session.activate(admin()),
            Err(LifecycleError::InvalidTransition {
                from: SessionState::Connecting,
                to: SessionState::Active
            })
        );
    }

    #[test]
    fn test_reject_closes_without_process() {
        let session = Session::new(None, Signal::SIGHUP);
        session.begin_authentication().unwrap();
        session.reject(CloseReason::AuthRejected).unwrap();

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.close_reason(), Some(CloseReason::AuthRejected));
        assert!(session.cancel_token().is_cancelled());
        assert!(session.process().is_none());

        // A rejected session can never become active
        assert!(session.activate(admin()).is_err());
        assert!(!session.begin_close(CloseReason::Disconnected));
    }

    #[test]
    fn test_attach_requires_active() {
        let session = Session::new(None, Signal::SIGHUP);
        let process = FakeProcess::new();
        assert_eq!(
            session.attach_process(process),
            Err(LifecycleError::NotActive(SessionState::Connecting))
        );

        session.begin_authentication().unwrap();
        assert_eq!(
            session.attach_process(FakeProcess::new()),
            Err(LifecycleError::NotActive(SessionState::Authenticating))
        );
    }

    #[test]
    fn test_only_one_process() {
        let session = active_session();
        session.attach_process(FakeProcess::new()).unwrap();
        assert_eq!(
            session.attach_process(FakeProcess::new()),
            Err(LifecycleError::ProcessAlreadyAttached)
        );
    }

    #[test]
    fn test_attach_after_close_fails() {
        let session = active_session();
        assert!(session.begin_close(CloseReason::Shutdown));

        let process = FakeProcess::new();
        assert_eq!(
            session.attach_process(process.clone()),
            Err(LifecycleError::NotActive(SessionState::Closing))
        );
        assert!(process.kills().is_empty());
    }

    #[test]
    fn test_begin_close_kills_synchronously() {
        let session = active_session();
        let process = FakeProcess::new();
        process.set_exit_on_kill(false);
        session.attach_process(process.clone()).unwrap();

        assert!(session.begin_close(CloseReason::Disconnected));

        // Signalled before begin_close returned
        assert_eq!(process.kills(), vec![Signal::SIGHUP]);
        assert_eq!(session.state(), SessionState::Closing);
        assert_eq!(session.close_reason(), Some(CloseReason::Disconnected));
        assert!(session.cancel_token().is_cancelled());
    }

    #[test]
    fn test_close_is_idempotent() {
        let session = active_session();
        let process = FakeProcess::new();
        session.attach_process(process.clone()).unwrap();

        assert!(session.begin_close(CloseReason::Disconnected));
        assert!(!session.begin_close(CloseReason::ClientClosed));
        assert!(!session.begin_close(CloseReason::ProcessExited));

        assert_eq!(session.kills_issued(), 1);
        assert_eq!(process.kills().len(), 1);
        // First reason wins
        assert_eq!(session.close_reason(), Some(CloseReason::Disconnected));
    }

    #[test]
    fn test_concurrent_close_signals_once() {
        let session = Arc::new(active_session());
        let process = FakeProcess::new();
        session.attach_process(process.clone()).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = Arc::clone(&session);
                std::thread::spawn(move || session.begin_close(CloseReason::Disconnected))
            })
            .collect();
        let started = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|started| *started)
            .count();

        assert_eq!(started, 1);
        assert_eq!(process.kills().len(), 1);
    }

    #[test]
    fn test_close_without_process() {
        let session = active_session();
        assert!(session.begin_close(CloseReason::SessionLimit));
        assert_eq!(session.kills_issued(), 0);
    }

    #[tokio::test]
    async fn test_finish_close_waits_for_exit() {
        let session = active_session();
        let process = FakeProcess::new();
        session.attach_process(process.clone()).unwrap();

        session.begin_close(CloseReason::ClientClosed);
        let exit = session
            .finish_close(Some(Duration::from_secs(1)))
            .await
            .unwrap();

        assert!(exit.is_some());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_finish_close_escalates_to_sigkill() {
        let session = active_session();
        let process = FakeProcess::new();
        process.set_exit_on_kill(false);
        session.attach_process(process.clone()).unwrap();

        session.begin_close(CloseReason::Disconnected);
        let exit = session
            .finish_close(Some(Duration::from_millis(50)))
            .await
            .unwrap();

        assert_eq!(process.kills(), vec![Signal::SIGHUP, Signal::SIGKILL]);
        assert!(exit.is_some());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_finish_close_twice_is_noop() {
        let session = active_session();
        session.attach_process(FakeProcess::new()).unwrap();
        session.begin_close(CloseReason::Disconnected);

        session.finish_close(None).await.unwrap();
        assert_eq!(session.finish_close(None).await.unwrap(), None);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_finish_close_requires_closing() {
        let session = active_session();
        assert_eq!(
            session.finish_close(None).await,
            Err(LifecycleError::InvalidTransition {
                from: SessionState::Active,
                to: SessionState::Closed
            })
        );
    }

    #[tokio::test]
    async fn test_process_already_exited_is_not_an_error() {
        let session = active_session();
        let process = FakeProcess::new();
        session.attach_process(process.clone()).unwrap();
        process.exit(Some(0));

        assert!(session.begin_close(CloseReason::ProcessExited));
        // Fake reports the kill as not delivered once exited
        assert!(process.kills().is_empty());
        assert_eq!(session.kills_issued(), 1);

        let exit = session.finish_close(None).await.unwrap();
        assert_eq!(exit, Some(ExitInfo { code: Some(0) }));
    }

    #[tokio::test]
    async fn test_idle_tracking() {
        let session = active_session();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(session.idle_for() >= Duration::from_millis(50));

        session.touch();
        assert!(session.idle_for() < Duration::from_millis(50));
    }

    #[test]
    fn test_info_snapshot() {
        let session = active_session();
        session.attach_process(FakeProcess::new()).unwrap();

        let info = session.info();
        assert_eq!(&info.id, session.id());
        assert_eq!(info.state, SessionState::Active);
        assert_eq!(info.pid, Some(FakeProcess::PID));
        assert_eq!(info.geometry, Some(Geometry::default()));
        assert!(info.close_reason.is_none());
    }
}
