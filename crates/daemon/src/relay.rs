//! Duplex relay between a session's shell and its WebSocket.
//!
//! Two pumps run side by side for the life of an active session. The output
//! pump turns every chunk read from the pty into one `output` message; the
//! input pump turns every `input` message (or binary frame) into one write
//! and every well-formed `resize` into one resize. A third pump owns the
//! socket's write half and drains a bounded outbound queue.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use protocol::{ClientMessage, Geometry, ServerMessage};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::session::{CloseReason, ProcessHandle, PtyError, Session};

/// Capacity of the outbound message queue.
pub const OUTBOUND_CAPACITY: usize = 256;

/// How long output already read from the pty may still be forwarded after
/// the shell exits.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// How long the writer keeps trying to send once the session is closing.
pub const CLOSING_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Items queued for the socket writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A protocol message, sent as a JSON text frame.
    Message(ServerMessage),
    /// A close frame. The writer stops after sending it.
    Close(Option<CloseFrame<'static>>),
}

impl Outbound {
    /// Close frame with `code` and a static reason.
    pub fn close(code: CloseCode, reason: &'static str) -> Self {
        Outbound::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        }))
    }
}

/// How a relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The shell exited or its output stream ended.
    ProcessExited,
    /// The client closed the socket or it dropped.
    TransportClosed,
    /// The client sent a `close` message.
    ClientClosed,
    /// Reading from the socket failed.
    TransportError,
    /// Writing to the shell failed.
    WriteFailed,
    /// The session was closed from elsewhere.
    Cancelled,
}

impl RelayOutcome {
    /// Close reason to record, or `None` if the session is already closing.
    pub fn close_reason(self) -> Option<CloseReason> {
        match self {
            RelayOutcome::ProcessExited => Some(CloseReason::ProcessExited),
            RelayOutcome::TransportClosed => Some(CloseReason::Disconnected),
            RelayOutcome::ClientClosed => Some(CloseReason::ClientClosed),
            RelayOutcome::TransportError => Some(CloseReason::TransportError),
            RelayOutcome::WriteFailed => Some(CloseReason::WriteFailed),
            RelayOutcome::Cancelled => None,
        }
    }
}

/// Incremental UTF-8 decoder for pty output.
///
/// A multi-byte sequence split across reads is held back and prefixed to the
/// next chunk. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    /// Decode `chunk`, returning `None` if it held only an incomplete sequence.
    pub fn push(&mut self, chunk: &[u8]) -> Option<String> {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let keep = incomplete_tail_len(&bytes);
        self.pending = bytes.split_off(bytes.len() - keep);

        if bytes.is_empty() {
            return None;
        }
        Some(decode_lossy(bytes))
    }

    /// Flush any held-back bytes.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        Some(decode_lossy(std::mem::take(&mut self.pending)))
    }
}

fn decode_lossy(bytes: Vec<u8>) -> String {
    String::from_utf8(bytes)
        .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

/// Length of a trailing lead byte plus continuations that could still be
/// completed by later input.
fn incomplete_tail_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let byte = bytes[len - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            b if b & 0xE0 == 0xC0 => 2,
            b if b & 0xF0 == 0xE0 => 3,
            b if b & 0xF8 == 0xF0 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

/// Drains the outbound queue into the socket's write half.
///
/// A send failure closes the session. Returns once a close frame has been
/// sent, the queue is closed, or sending fails. Once the session is closing
/// the writer gives up after [`CLOSING_SEND_TIMEOUT`], so a client that
/// stopped reading cannot hold the session open.
pub async fn pump_outbound<S>(mut sink: S, mut outbound: mpsc::Receiver<Outbound>, session: Arc<Session>)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let cancel = session.cancel_token();
    let closing_deadline = async {
        cancel.cancelled().await;
        tokio::time::sleep(CLOSING_SEND_TIMEOUT).await;
    };
    tokio::pin!(closing_deadline);

    while let Some(item) = outbound.recv().await {
        let (message, last) = match item {
            Outbound::Message(message) => match message.to_json() {
                Ok(json) => (Message::Text(json), false),
                Err(e) => {
                    tracing::error!(session_id = %session.id(), error = %e, "Failed to encode message");
                    continue;
                }
            },
            Outbound::Close(frame) => (Message::Close(frame), true),
        };

        let sent = tokio::select! {
            biased;
            sent = sink.send(message) => sent,
            _ = &mut closing_deadline => {
                tracing::debug!(session_id = %session.id(), "Abandoning stalled WebSocket send");
                return;
            }
        };
        if let Err(e) = sent {
            tracing::debug!(session_id = %session.id(), error = %e, "WebSocket send failed");
            session.begin_close(CloseReason::TransportError);
            return;
        }
        if last {
            break;
        }
    }

    let _ = sink.close().await;
}

/// Bridges one active session's shell and socket.
pub struct Relay {
    session: Arc<Session>,
    process: Arc<dyn ProcessHandle>,
    outbound: mpsc::Sender<Outbound>,
}

impl Relay {
    /// Create a relay for `session`'s `process`, sending through `outbound`.
    pub fn new(
        session: Arc<Session>,
        process: Arc<dyn ProcessHandle>,
        outbound: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            session,
            process,
            outbound,
        }
    }

    /// Run both pumps until either ends or the session is cancelled.
    pub async fn run<St>(self, inbound: St, output: mpsc::Receiver<Vec<u8>>) -> RelayOutcome
    where
        St: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        let cancel = self.session.cancel_token();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => RelayOutcome::Cancelled,
            outcome = self.pump_output(output) => outcome,
            outcome = self.pump_input(inbound) => outcome,
        };

        tracing::debug!(
            session_id = %self.session.id(),
            outcome = ?outcome,
            "Relay finished"
        );
        outcome
    }

    /// Forward pty output until EOF or until the shell exits.
    ///
    /// A background job can keep the pty open after the shell is gone, so
    /// the exit status is watched as well as the stream.
    async fn pump_output(&self, mut output: mpsc::Receiver<Vec<u8>>) -> RelayOutcome {
        let mut decoder = Utf8Chunker::default();
        let exited = shell_exited(self.process.as_ref());
        tokio::pin!(exited);

        loop {
            let chunk = tokio::select! {
                chunk = output.recv() => chunk,
                _ = &mut exited => {
                    let drain = self.drain_output(&mut output, &mut decoder);
                    match tokio::time::timeout(EXIT_DRAIN_TIMEOUT, drain).await {
                        Ok(false) => return RelayOutcome::TransportClosed,
                        Ok(true) | Err(_) => break,
                    }
                }
            };
            let Some(chunk) = chunk else {
                break;
            };
            if !self.forward(&mut decoder, &chunk).await {
                return RelayOutcome::TransportClosed;
            }
        }

        if let Some(text) = decoder.finish() {
            let _ = self.send(ServerMessage::output(text)).await;
        }
        RelayOutcome::ProcessExited
    }

    /// Forward whatever the pty reader still delivers after exit.
    async fn drain_output(
        &self,
        output: &mut mpsc::Receiver<Vec<u8>>,
        decoder: &mut Utf8Chunker,
    ) -> bool {
        while let Some(chunk) = output.recv().await {
            if !self.forward(decoder, &chunk).await {
                return false;
            }
        }
        true
    }

    async fn forward(&self, decoder: &mut Utf8Chunker, chunk: &[u8]) -> bool {
        self.session.touch();
        match decoder.push(chunk) {
            Some(text) => self.send(ServerMessage::output(text)).await,
            None => true,
        }
    }

    async fn pump_input<St>(&self, mut inbound: St) -> RelayOutcome
    where
        St: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        while let Some(frame) = inbound.next().await {
            let message = match frame {
                Ok(message) => message,
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {
                    return RelayOutcome::TransportClosed;
                }
                Err(e) => {
                    tracing::debug!(session_id = %self.session.id(), error = %e, "WebSocket read failed");
                    return RelayOutcome::TransportError;
                }
            };
            self.session.touch();

            match message {
                Message::Text(text) => match ClientMessage::from_json(&text) {
                    Ok(ClientMessage::Input { data }) => {
                        if let Some(outcome) = self.write(data.into_bytes()).await {
                            return outcome;
                        }
                    }
                    Ok(ClientMessage::Resize { columns, rows }) => self.resize(columns, rows),
                    Ok(ClientMessage::Close) => return RelayOutcome::ClientClosed,
                    Err(e) => {
                        tracing::debug!(
                            session_id = %self.session.id(),
                            error = %e,
                            "Ignoring unparseable client message"
                        );
                    }
                },
                Message::Binary(data) => {
                    if let Some(outcome) = self.write(data).await {
                        return outcome;
                    }
                }
                Message::Close(_) => return RelayOutcome::TransportClosed,
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }

        RelayOutcome::TransportClosed
    }

    /// Write to the shell. Returns an outcome if the relay must stop.
    async fn write(&self, data: Vec<u8>) -> Option<RelayOutcome> {
        match self.process.write(data).await {
            Ok(()) => None,
            Err(PtyError::AlreadyExited) => Some(RelayOutcome::ProcessExited),
            Err(e) => {
                tracing::warn!(session_id = %self.session.id(), error = %e, "Failed to write to shell");
                Some(RelayOutcome::WriteFailed)
            }
        }
    }

    fn resize(&self, columns: Option<i64>, rows: Option<i64>) {
        let Some(geometry) = Geometry::from_raw(columns, rows) else {
            tracing::debug!(
                session_id = %self.session.id(),
                columns = ?columns,
                rows = ?rows,
                "Ignoring malformed resize"
            );
            return;
        };

        match self.process.resize(geometry) {
            Ok(()) | Err(PtyError::AlreadyExited) => {}
            Err(e) => {
                tracing::warn!(session_id = %self.session.id(), error = %e, "Failed to resize shell");
            }
        }
    }

    async fn send(&self, message: ServerMessage) -> bool {
        self.outbound.send(Outbound::Message(message)).await.is_ok()
    }
}

/// Resolves once `process` has exited.
async fn shell_exited(process: &dyn ProcessHandle) {
    let mut status = process.exit_status();
    let unknown = status.wait_for(|s| s.is_some()).await.is_err();
    if unknown {
        // Status publisher gone without a result; rely on output EOF.
        std::future::pending::<()>().await;
    }
}
