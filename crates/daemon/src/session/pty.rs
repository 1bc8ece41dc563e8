//! PTY process spawning and I/O.
//!
//! A [`PtyProcess`] is one shell bound to a pseudo-terminal. Output is read
//! on the blocking pool one chunk at a time and delivered through a bounded
//! channel, input writes are serialized through the pty writer, and an async
//! monitor reaps the child and publishes its exit status.

use std::future::Future;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use protocol::Geometry;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::config::{resolve_shell, ConfigError, SessionConfig};

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during PTY operations.
#[derive(Error, Debug)]
pub enum PtyError {
    /// The configured shell could not be resolved to an executable.
    #[error("shell not found: {0}")]
    ShellNotFound(String),

    /// Failed to open the PTY or start the shell.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// The process has already exited.
    #[error("process already exited")]
    AlreadyExited,

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to signal the process.
    #[error("failed to kill process: {0}")]
    KillFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PtyError {
    /// Returns true if the error happened while starting the shell.
    pub fn is_spawn_error(&self) -> bool {
        matches!(self, PtyError::ShellNotFound(_) | PtyError::SpawnFailed(_))
    }
}

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the output channel, in chunks.
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// How often the exit monitor polls the child.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Exit status of a reaped process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, when the platform reported one.
    pub code: Option<u32>,
}

/// Parameters for starting a shell.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnOptions {
    /// Shell executable, absolute or looked up on `PATH`.
    pub shell: String,
    /// Arguments passed to the shell.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Variables set on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Value of `TERM`.
    pub term: String,
    /// Initial terminal size.
    pub geometry: Geometry,
}

impl SpawnOptions {
    /// Options for `shell` with the standard defaults.
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            args: Vec::new(),
            cwd: dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")),
            env: Vec::new(),
            term: "xterm-color".to_string(),
            geometry: Geometry::default(),
        }
    }

    /// Build options from the session configuration.
    pub fn from_config(config: &SessionConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            shell: config.default_shell.clone(),
            args: Vec::new(),
            cwd: config.working_dir(),
            env: Vec::new(),
            term: config.term.clone(),
            geometry: config.geometry()?,
        })
    }

    /// Set shell arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the working directory.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the initial terminal size.
    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = geometry;
        self
    }
}

/// Control surface of a running shell.
pub trait ProcessHandle: Send + Sync {
    /// OS process id, if known.
    fn pid(&self) -> Option<u32>;

    /// Current terminal size.
    fn geometry(&self) -> Geometry;

    /// Write bytes to the process stdin.
    fn write(&self, data: Vec<u8>) -> Pin<Box<dyn Future<Output = Result<(), PtyError>> + Send + '_>>;

    /// Change the terminal size.
    fn resize(&self, geometry: Geometry) -> Result<(), PtyError>;

    /// Send `signal` to the process.
    ///
    /// Returns `Ok(false)` without error when the process has already exited.
    fn kill(&self, signal: Signal) -> Result<bool, PtyError>;

    /// Watch that becomes `Some` once the process has been reaped.
    fn exit_status(&self) -> watch::Receiver<Option<ExitInfo>>;

    /// Returns true once the process has been reaped.
    fn has_exited(&self) -> bool {
        self.exit_status().borrow().is_some()
    }
}

/// A spawned shell and its output stream.
pub struct SpawnedProcess {
    /// Control handle.
    pub handle: Arc<dyn ProcessHandle>,
    /// Output chunks, one per pty read. Closed on EOF.
    pub output: mpsc::Receiver<Vec<u8>>,
}

/// Creates shells for sessions.
pub trait Spawner: Send + Sync {
    /// Start a shell for `session_id`.
    fn spawn(&self, session_id: &str, options: &SpawnOptions) -> Result<SpawnedProcess, PtyError>;
}

/// Spawner backed by the native PTY system.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtySpawner;

impl PtySpawner {
    /// Create a new PTY spawner.
    pub fn new() -> Self {
        Self
    }
}

impl Spawner for PtySpawner {
    fn spawn(&self, session_id: &str, options: &SpawnOptions) -> Result<SpawnedProcess, PtyError> {
        let (process, output) = PtyProcess::spawn(session_id.to_string(), options)?;
        Ok(SpawnedProcess {
            handle: Arc::new(process),
            output,
        })
    }
}

/// A shell process attached to a pseudo-terminal.
pub struct PtyProcess {
    /// Owning session, for logging.
    session_id: SessionId,

    /// Process ID.
    pid: Option<u32>,

    /// The PTY master handle.
    master: Mutex<Box<dyn MasterPty + Send>>,

    /// The writer for the PTY.
    writer: Arc<Mutex<Box<dyn Write + Send>>>,

    /// Fallback used when the platform reports no pid.
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,

    /// Current terminal size.
    geometry: Mutex<Geometry>,

    /// Exit status published by the monitor task.
    exit_rx: watch::Receiver<Option<ExitInfo>>,

    /// Set once any signal has been sent.
    kill_requested: AtomicBool,
}

impl PtyProcess {
    /// Spawns a shell in a new PTY and starts its reader and exit monitor.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        session_id: SessionId,
        options: &SpawnOptions,
    ) -> Result<(Self, mpsc::Receiver<Vec<u8>>), PtyError> {
        let shell = resolve_shell(&options.shell)
            .ok_or_else(|| PtyError::ShellNotFound(options.shell.clone()))?;

        let pair = native_pty_system()
            .openpty(pty_size(options.geometry))
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&shell);
        cmd.args(&options.args);
        cmd.cwd(&options.cwd);
        cmd.env("TERM", &options.term);
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        // The master only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let pid = child.process_id();
        let master = pair.master;

        let io = master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, master.take_writer()?)));
        let (reader, writer) = match io {
            Ok(io) => io,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PtyError::SpawnFailed(e.to_string()));
            }
        };

        let killer = child.clone_killer();
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);

        start_read_loop(session_id.clone(), reader, output_tx);
        start_exit_monitor(session_id.clone(), child, exit_tx);

        tracing::info!(
            session_id = %session_id,
            pid = ?pid,
            shell = %shell.display(),
            cwd = %options.cwd.display(),
            size = %options.geometry,
            "Spawned shell"
        );

        let process = PtyProcess {
            session_id,
            pid,
            master: Mutex::new(master),
            writer: Arc::new(Mutex::new(writer)),
            killer: Mutex::new(killer),
            geometry: Mutex::new(options.geometry),
            exit_rx,
            kill_requested: AtomicBool::new(false),
        };

        Ok((process, output_rx))
    }

    /// Returns the owning session ID.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl ProcessHandle for PtyProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn geometry(&self) -> Geometry {
        self.geometry
            .lock()
            .map(|g| *g)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }

    fn write(&self, data: Vec<u8>) -> Pin<Box<dyn Future<Output = Result<(), PtyError>> + Send + '_>> {
        Box::pin(async move {
            if self.has_exited() {
                return Err(PtyError::AlreadyExited);
            }

            let writer = Arc::clone(&self.writer);
            tokio::task::spawn_blocking(move || {
                let mut writer = writer
                    .lock()
                    .map_err(|_| PtyError::WriteFailed("writer lock poisoned".to_string()))?;
                writer
                    .write_all(&data)
                    .and_then(|_| writer.flush())
                    .map_err(|e| PtyError::WriteFailed(e.to_string()))
            })
            .await
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?
        })
    }

    fn resize(&self, geometry: Geometry) -> Result<(), PtyError> {
        if self.has_exited() {
            return Err(PtyError::AlreadyExited);
        }

        let master = self
            .master
            .lock()
            .map_err(|_| PtyError::ResizeFailed("master lock poisoned".to_string()))?;
        master
            .resize(pty_size(geometry))
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))?;
        drop(master);

        if let Ok(mut current) = self.geometry.lock() {
            *current = geometry;
        }

        tracing::debug!(
            session_id = %self.session_id,
            cols = geometry.cols,
            rows = geometry.rows,
            "Resized PTY"
        );

        Ok(())
    }

    fn kill(&self, signal: Signal) -> Result<bool, PtyError> {
        if self.has_exited() {
            return Ok(false);
        }
        self.kill_requested.store(true, Ordering::SeqCst);

        let delivered = match self.pid {
            Some(pid) => match signal::kill(Pid::from_raw(pid as i32), signal) {
                Ok(()) => true,
                Err(Errno::ESRCH) => false,
                Err(e) => return Err(PtyError::KillFailed(e.to_string())),
            },
            None => {
                let mut killer = self
                    .killer
                    .lock()
                    .map_err(|_| PtyError::KillFailed("killer lock poisoned".to_string()))?;
                killer
                    .kill()
                    .map_err(|e| PtyError::KillFailed(e.to_string()))?;
                true
            }
        };

        tracing::debug!(
            session_id = %self.session_id,
            pid = ?self.pid,
            signal = ?signal,
            delivered,
            "Signalled shell"
        );

        Ok(delivered)
    }

    fn exit_status(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_rx.clone()
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if self.kill_requested.load(Ordering::SeqCst) || self.has_exited() {
            return;
        }
        tracing::warn!(
            session_id = %self.session_id,
            pid = ?self.pid,
            "PTY process dropped while running, sending SIGHUP"
        );
        let _ = self.kill(Signal::SIGHUP);
    }
}

fn pty_size(geometry: Geometry) -> PtySize {
    PtySize {
        rows: geometry.rows,
        cols: geometry.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Reads PTY output on the blocking pool and forwards each chunk.
///
/// Stops on EOF, on a read error (Linux reports EIO once the shell is gone),
/// or when the receiver is dropped.
fn start_read_loop(
    session_id: SessionId,
    reader: Box<dyn Read + Send>,
    output_tx: mpsc::Sender<Vec<u8>>,
) {
    tokio::spawn(async move {
        let reader = Arc::new(Mutex::new(reader));

        loop {
            let reader_clone = Arc::clone(&reader);

            let result = tokio::task::spawn_blocking(move || {
                let mut buffer = vec![0u8; READ_BUFFER_SIZE];
                let mut reader = reader_clone
                    .lock()
                    .map_err(|_| std::io::Error::other("reader lock poisoned"))?;
                match reader.read(&mut buffer) {
                    Ok(0) => Ok(None), // EOF
                    Ok(n) => {
                        buffer.truncate(n);
                        Ok(Some(buffer))
                    }
                    Err(e) => Err(e),
                }
            })
            .await;

            match result {
                Ok(Ok(Some(data))) => {
                    if output_tx.send(data).await.is_err() {
                        tracing::debug!(session_id = %session_id, "Output receiver closed");
                        break;
                    }
                }
                Ok(Ok(None)) => {
                    tracing::debug!(session_id = %session_id, "PTY EOF");
                    break;
                }
                Ok(Err(e)) if e.raw_os_error() == Some(Errno::EIO as i32) => {
                    tracing::debug!(session_id = %session_id, "PTY closed");
                    break;
                }
                Ok(Err(e)) => {
                    tracing::error!(
                        session_id = %session_id,
                        error = %e,
                        "Error reading from PTY"
                    );
                    break;
                }
                Err(e) => {
                    tracing::error!(
                        session_id = %session_id,
                        error = %e,
                        "Read task panicked"
                    );
                    break;
                }
            }
        }
    });
}

/// Polls the child until it exits, then publishes its status.
///
/// Polling keeps the wait off the blocking pool and reaps the child so no
/// zombie is left behind.
fn start_exit_monitor(
    session_id: SessionId,
    mut child: Box<dyn Child + Send + Sync>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(EXIT_POLL_INTERVAL);
        loop {
            interval.tick().await;
            match child.try_wait() {
                Ok(Some(status)) => {
                    let info = ExitInfo {
                        code: Some(status.exit_code()),
                    };
                    tracing::info!(
                        session_id = %session_id,
                        code = ?info.code,
                        "Shell exited"
                    );
                    exit_tx.send_replace(Some(info));
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        session_id = %session_id,
                        error = %e,
                        "Failed to poll shell status"
                    );
                    exit_tx.send_replace(Some(ExitInfo { code: None }));
                    break;
                }
            }
        }
    });
}
