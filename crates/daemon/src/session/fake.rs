//! In-memory process used by unit tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nix::sys::signal::Signal;
use protocol::Geometry;
use tokio::sync::watch;

use super::pty::{ExitInfo, ProcessHandle, PtyError};

/// Records every call and exits when told to.
pub(crate) struct FakeProcess {
    writes: Mutex<Vec<Vec<u8>>>,
    resizes: Mutex<Vec<Geometry>>,
    kills: Mutex<Vec<Signal>>,
    geometry: Mutex<Geometry>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    exit_on_kill: AtomicBool,
    fail_writes: AtomicBool,
}

impl FakeProcess {
    pub(crate) const PID: u32 = 4242;

    pub(crate) fn new() -> Arc<Self> {
        let (exit_tx, _) = watch::channel(None);
        Arc::new(Self {
            writes: Mutex::new(Vec::new()),
            resizes: Mutex::new(Vec::new()),
            kills: Mutex::new(Vec::new()),
            geometry: Mutex::new(Geometry::default()),
            exit_tx,
            exit_on_kill: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
        })
    }

    /// Whether a graceful signal makes the fake exit. SIGKILL always does.
    pub(crate) fn set_exit_on_kill(&self, exit: bool) {
        self.exit_on_kill.store(exit, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn exit(&self, code: Option<u32>) {
        self.exit_tx.send_replace(Some(ExitInfo { code }));
    }

    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub(crate) fn resizes(&self) -> Vec<Geometry> {
        self.resizes.lock().unwrap().clone()
    }

    pub(crate) fn kills(&self) -> Vec<Signal> {
        self.kills.lock().unwrap().clone()
    }
}

impl ProcessHandle for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(Self::PID)
    }

    fn geometry(&self) -> Geometry {
        *self.geometry.lock().unwrap()
    }

    fn write(&self, data: Vec<u8>) -> Pin<Box<dyn Future<Output = Result<(), PtyError>> + Send + '_>> {
        Box::pin(async move {
            if self.has_exited() {
                return Err(PtyError::AlreadyExited);
            }
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(PtyError::WriteFailed("broken pipe".to_string()));
            }
            self.writes.lock().unwrap().push(data);
            Ok(())
        })
    }

    fn resize(&self, geometry: Geometry) -> Result<(), PtyError> {
        *self.geometry.lock().unwrap() = geometry;
        self.resizes.lock().unwrap().push(geometry);
        Ok(())
    }

    fn kill(&self, signal: Signal) -> Result<bool, PtyError> {
        if self.has_exited() {
            return Ok(false);
        }
        self.kills.lock().unwrap().push(signal);
        if signal == Signal::SIGKILL || self.exit_on_kill.load(Ordering::SeqCst) {
            self.exit(None);
        }
        Ok(true)
    }

    fn exit_status(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_tx.subscribe()
    }

    fn has_exited(&self) -> bool {
        self.exit_tx.borrow().is_some()
    }
}
