//! Terminal WebSocket server.
//!
//! Accepts TCP connections, performs the WebSocket upgrade while capturing the
//! handshake for the [`SessionGate`], and drives each admitted connection
//! through its session lifecycle:
//!
//! ```text
//! accept ─► upgrade ─► gate ─► register ─► spawn ─► ready ─► relay ─► close
//!                        │         │          │
//!                        └─ error ─┴── error ─┘
//! ```
//!
//! A connection the gate rejects never reaches the spawner.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use nix::sys::signal::Signal;
use protocol::{ErrorCode, ServerMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditAction, AuditLog};
use crate::config::{Config, ConfigError};
use crate::gate::{HandshakeMetadata, SessionGate};
use crate::relay::{pump_outbound, Outbound, Relay, OUTBOUND_CAPACITY};
use crate::session::{
    CloseReason, Session, SessionRegistry, SpawnOptions, SpawnedProcess, Spawner,
};

/// How long shutdown waits for sessions to finish closing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a finished session waits for queued frames to flush.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Serves terminal sessions over WebSocket.
pub struct DashServer {
    config: Config,
    gate: SessionGate,
    spawner: Arc<dyn Spawner>,
    registry: Arc<SessionRegistry>,
    audit: Arc<AuditLog>,
    kill_signal: Signal,
    shutdown: CancellationToken,
}

impl DashServer {
    /// Create a server. Fails if `config` does not validate.
    pub fn new(
        config: Config,
        gate: SessionGate,
        spawner: Arc<dyn Spawner>,
        audit: Arc<AuditLog>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let kill_signal = config.session.kill_signal()?;
        let registry = Arc::new(SessionRegistry::new(config.session.session_limit()));

        Ok(Self {
            config,
            gate,
            spawner,
            registry,
            audit,
            kill_signal,
            shutdown: CancellationToken::new(),
        })
    }

    /// Server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Live sessions.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(&self.config.server.bind_address).await
    }

    /// Accept connections on `listener` until [`shutdown`](Self::shutdown).
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!(
            addr = %local_addr,
            path = %self.config.server.ws_path,
            "Terminal server listening"
        );

        let reaper = self
            .config
            .session
            .idle_timeout()
            .map(|timeout| self.registry.start_idle_reaper(timeout, self.shutdown.clone()));

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            server.handle_connection(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        if let Some(reaper) = reaper {
            let _ = reaper.await;
        }
        tracing::info!("Terminal server stopped accepting connections");
        Ok(())
    }

    /// Stop accepting connections and close every session.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let closing = self.registry.close_all(CloseReason::Shutdown);
        tracing::info!(sessions = closing, "Closing terminal sessions");

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.registry.wait_until_empty())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.registry.count(),
                "Timed out waiting for sessions to close"
            );
        }
    }

    fn ws_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.config.server.max_message_size);
        config.max_frame_size = Some(self.config.server.max_message_size);
        config
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);

        let ws_path = self.config.server.ws_path.as_str();
        let mut metadata = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            if request.uri().path() != ws_path {
                return Err(not_found());
            }
            metadata = Some(HandshakeMetadata::from_request(request, Some(peer)));
            Ok(response)
        };

        let handshake = accept_hdr_async_with_config(stream, callback, Some(self.ws_config()));
        let ws_stream =
            match tokio::time::timeout(self.config.server.handshake_timeout(), handshake).await {
                Ok(Ok(ws_stream)) => ws_stream,
                Ok(Err(e)) => {
                    tracing::debug!(peer = %peer, error = %e, "WebSocket handshake failed");
                    return;
                }
                Err(_) => {
                    tracing::debug!(peer = %peer, "WebSocket handshake timed out");
                    return;
                }
            };
        let Some(metadata) = metadata else {
            return;
        };

        let (ws_sink, ws_stream) = ws_stream.split();
        let session = Arc::new(Session::new(Some(peer), self.kill_signal));
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let mut writer = tokio::spawn(pump_outbound(ws_sink, outbound_rx, Arc::clone(&session)));

        let close = self
            .drive_session(&session, &metadata, ws_stream, &outbound_tx)
            .await;
        enqueue(&outbound_tx, close).await;
        drop(outbound_tx);

        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
            tracing::debug!(session_id = %session.id(), "WebSocket writer did not drain");
            writer.abort();
        }

        if self.registry.remove(session.id()).is_some() {
            self.audit
                .record(
                    AuditAction::TerminalClose,
                    &format!("session {}", session.id()),
                    &metadata.client_ip(),
                    true,
                )
                .await;
        }
    }

    /// Run one connection from authentication to `Closed`, returning the
    /// close frame to finish with.
    async fn drive_session<St>(
        &self,
        session: &Arc<Session>,
        metadata: &HandshakeMetadata,
        inbound: St,
        outbound: &mpsc::Sender<Outbound>,
    ) -> Outbound
    where
        St: futures_util::Stream<Item = Result<Message, WsError>> + Unpin,
    {
        let ip = metadata.client_ip();
        if let Err(e) = session.begin_authentication() {
            tracing::error!(session_id = %session.id(), error = %e, "Session in unexpected state");
            return Outbound::close(CloseCode::Error, "internal error");
        }

        let principal = match self.gate.check(metadata) {
            Ok(principal) => principal,
            Err(e) => {
                tracing::warn!(
                    session_id = %session.id(),
                    peer = %ip,
                    error = %e,
                    "Terminal authentication rejected"
                );
                let _ = session.reject(CloseReason::AuthRejected);
                self.audit
                    .record(AuditAction::TerminalAuth, e.code().as_str(), &ip, false)
                    .await;
                send_error(outbound, e.code(), e.to_string()).await;
                return Outbound::close(CloseCode::Policy, "authentication failed");
            }
        };

        let role = principal.role;
        if let Err(e) = session.activate(principal) {
            tracing::error!(session_id = %session.id(), error = %e, "Failed to activate session");
            return Outbound::close(CloseCode::Error, "internal error");
        }
        self.audit
            .record(AuditAction::TerminalAuth, &role.to_string(), &ip, true)
            .await;

        if let Err(e) = self.registry.try_register(Arc::clone(session)) {
            tracing::warn!(session_id = %session.id(), error = %e, "Session not admitted");
            send_error(outbound, ErrorCode::SessionLimit, e.to_string()).await;
            self.abandon(session, CloseReason::SessionLimit).await;
            return Outbound::close(CloseCode::Again, "session limit reached");
        }

        let spawned = SpawnOptions::from_config(&self.config.session)
            .map_err(|e| e.to_string())
            .and_then(|options| {
                self.spawner
                    .spawn(session.id(), &options)
                    .map_err(|e| e.to_string())
            });
        let SpawnedProcess { handle, output } = match spawned {
            Ok(spawned) => spawned,
            Err(message) => {
                tracing::error!(session_id = %session.id(), error = %message, "Failed to start shell");
                send_error(outbound, ErrorCode::SpawnFailed, message).await;
                self.abandon(session, CloseReason::SpawnFailed).await;
                return Outbound::close(CloseCode::Error, "failed to start shell");
            }
        };

        if let Err(e) = session.attach_process(Arc::clone(&handle)) {
            tracing::debug!(session_id = %session.id(), error = %e, "Session closed while spawning");
            let _ = handle.kill(Signal::SIGKILL);
            let _ = session.finish_close(None).await;
            return Outbound::close(CloseCode::Away, "session closed");
        }

        let geometry = handle.geometry();
        let ready = ServerMessage::Ready {
            session_id: session.id().clone(),
            pid: handle.pid(),
            columns: geometry.cols,
            rows: geometry.rows,
        };
        enqueue(outbound, Outbound::Message(ready)).await;

        tracing::info!(
            session_id = %session.id(),
            peer = %ip,
            pid = ?handle.pid(),
            geometry = %geometry,
            "Terminal session started"
        );
        self.audit
            .record(
                AuditAction::TerminalOpen,
                &format!("session {}", session.id()),
                &ip,
                true,
            )
            .await;

        let outcome = Relay::new(Arc::clone(session), handle, outbound.clone())
            .run(inbound, output)
            .await;
        if let Some(reason) = outcome.close_reason() {
            session.begin_close(reason);
        }

        let exit = match session.finish_close(self.config.session.kill_grace()).await {
            Ok(exit) => exit,
            Err(e) => {
                tracing::warn!(session_id = %session.id(), error = %e, "Failed to finish closing session");
                None
            }
        };

        if session.close_reason() == Some(CloseReason::ProcessExited) {
            let code = exit.and_then(|exit| exit.code);
            enqueue(outbound, Outbound::Message(ServerMessage::Exit { code })).await;
        }

        tracing::info!(
            session_id = %session.id(),
            reason = ?session.close_reason(),
            exit = ?exit,
            "Terminal session ended"
        );

        match session.close_reason() {
            Some(CloseReason::Shutdown) => Outbound::close(CloseCode::Away, "server shutting down"),
            Some(CloseReason::IdleTimeout) => Outbound::close(CloseCode::Normal, "idle timeout"),
            _ => Outbound::close(CloseCode::Normal, "session closed"),
        }
    }

    /// Close an active session that never got a shell.
    async fn abandon(&self, session: &Session, reason: CloseReason) {
        session.begin_close(reason);
        if let Err(e) = session.finish_close(None).await {
            tracing::warn!(session_id = %session.id(), error = %e, "Failed to close session");
        }
    }
}

async fn send_error(outbound: &mpsc::Sender<Outbound>, code: ErrorCode, message: String) {
    enqueue(outbound, Outbound::Message(ServerMessage::error(code, message))).await;
}

/// Queue `item` for the writer. Gives up if the queue stays full for
/// [`WRITER_DRAIN_TIMEOUT`], since a client that stopped reading must not
/// keep the connection task alive.
async fn enqueue(outbound: &mpsc::Sender<Outbound>, item: Outbound) {
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, outbound.send(item))
        .await
        .is_err()
    {
        tracing::debug!("Outbound queue full, dropping message");
    }
}

fn not_found() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("Not Found".to_string()));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}
