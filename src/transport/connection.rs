//! WebSocket connection and event loop.
//!
//! This module owns one established STOMP session over WebSocket.
//!
//! # Event Loop
//!
//! The connection spawns a tokio task that handles:
//!
//! - Incoming frames from the broker (MESSAGE, RECEIPT, ERROR, heart-beats)
//! - Outgoing frames from the client (SUBSCRIBE, UNSUBSCRIBE, SEND)
//! - Outgoing heart-beats and the incoming liveness check
//! - Graceful DISCONNECT on shutdown
//!
//! When the loop ends for any reason other than [`Connection::shutdown`],
//! the close handler is called once with the [`CloseReason`]. A panic inside
//! the loop counts as a transport failure.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::client::NegotiatedHeartbeat;
use crate::client::registry::panic_message;
use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::protocol::{Command, Frame};

// ============================================================================
// Constants
// ============================================================================

/// Silence tolerated before the connection is declared dead, as a multiple
/// of the negotiated incoming heart-beat.
const LIVENESS_GRACE_FACTOR: u32 = 2;

/// Tick period used for a disabled timer branch.
const IDLE_TICK: Duration = Duration::from_secs(3600);

/// Heart-beat payload.
const HEARTBEAT_EOL: &str = "\n";

// ============================================================================
// Types
// ============================================================================

/// Client-side WebSocket stream.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Frame handler callback type.
///
/// Called on the event loop task for each MESSAGE frame.
pub type FrameHandler = Arc<dyn Fn(Frame) + Send + Sync>;

/// Close handler callback type.
///
/// Called at most once, when the connection ends without `shutdown()`.
pub type CloseHandler = Box<dyn FnOnce(CloseReason) + Send>;

// ============================================================================
// CloseReason
// ============================================================================

/// Why a connection ended unexpectedly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The broker sent a WebSocket close frame.
    ClosedByRemote,
    /// The broker sent a STOMP ERROR frame.
    ServerError(String),
    /// Nothing received within the liveness window.
    HeartbeatTimeout,
    /// Socket read or write failed.
    Transport(String),
    /// The stream ended without a close frame.
    StreamEnded,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClosedByRemote => f.write_str("closed by remote"),
            Self::ServerError(message) => write!(f, "server error: {message}"),
            Self::HeartbeatTimeout => f.write_str("heart-beat timeout"),
            Self::Transport(message) => write!(f, "transport error: {message}"),
            Self::StreamEnded => f.write_str("stream ended"),
        }
    }
}

// ============================================================================
// CloseGuard
// ============================================================================

/// Owns the close handler for the event loop.
///
/// Fires on drop if the loop task unwinds before reporting an outcome.
struct CloseGuard {
    id: ConnectionId,
    handler: Option<CloseHandler>,
}

impl CloseGuard {
    fn new(id: ConnectionId, handler: CloseHandler) -> Self {
        Self {
            id,
            handler: Some(handler),
        }
    }

    /// Reports an unexpected close.
    fn fire(mut self, reason: CloseReason) {
        if let Some(handler) = self.handler.take() {
            handler(reason);
        }
    }

    /// Ends without reporting.
    fn disarm(mut self) {
        self.handler = None;
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            return;
        }
        if let Some(handler) = self.handler.take() {
            let id = self.id;
            error!(%id, "Event loop panicked");
            handler(CloseReason::Transport("event loop panicked".into()));
        }
    }
}

// ============================================================================
// ConnectionCommand
// ============================================================================

/// Internal commands for the event loop.
enum ConnectionCommand {
    /// Write a frame.
    Send(Frame),
    /// Send DISCONNECT, close the socket and stop.
    Shutdown,
}

// ============================================================================
// Connection
// ============================================================================

/// Handle to an established STOMP session.
///
/// Cloning is cheap; all clones drive the same event loop.
#[derive(Clone)]
pub struct Connection {
    /// Connection identity.
    id: ConnectionId,
    /// Channel for sending commands to the event loop.
    command_tx: mpsc::UnboundedSender<ConnectionCommand>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("open", &!self.command_tx.is_closed())
            .finish()
    }
}

impl Connection {
    /// Wraps an already-handshaken stream and spawns the event loop.
    pub(crate) fn spawn(
        id: ConnectionId,
        ws_stream: WsStream,
        heartbeat: NegotiatedHeartbeat,
        on_frame: FrameHandler,
        on_close: CloseHandler,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::run_event_loop(
            id, ws_stream, command_rx, heartbeat, on_frame, on_close,
        ));

        Self { id, command_tx }
    }

    /// Returns the connection id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns `true` while the event loop is running.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.command_tx.is_closed()
    }

    /// Queues a frame for sending.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the event loop has stopped.
    pub fn send(&self, frame: Frame) -> Result<()> {
        self.command_tx
            .send(ConnectionCommand::Send(frame))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Shuts the connection down gracefully.
    ///
    /// The close handler is not invoked.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(ConnectionCommand::Shutdown);
    }

    /// Event loop that handles WebSocket I/O.
    async fn run_event_loop(
        id: ConnectionId,
        ws_stream: WsStream,
        mut command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
        heartbeat: NegotiatedHeartbeat,
        on_frame: FrameHandler,
        on_close: CloseHandler,
    ) {
        let close_guard = CloseGuard::new(id, on_close);
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let mut ping = interval(heartbeat.outgoing.unwrap_or(IDLE_TICK));
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let liveness_window = heartbeat
            .incoming
            .map(|incoming| incoming * LIVENESS_GRACE_FACTOR);
        let mut liveness = interval(heartbeat.incoming.unwrap_or(IDLE_TICK));
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_received = Instant::now();

        debug!(%id, ?heartbeat, "Event loop started");

        let outcome = loop {
            tokio::select! {
                // Incoming frames from the broker
                message = ws_read.next() => {
                    last_received = Instant::now();
                    let handled = panic::catch_unwind(AssertUnwindSafe(|| {
                        Self::handle_incoming(id, message, &on_frame)
                    }));
                    match handled {
                        Ok(None) => {}
                        Ok(Some(reason)) => break Some(reason),
                        Err(payload) => {
                            error!(
                                %id,
                                panic = panic_message(payload.as_ref()),
                                "Panic while handling incoming message"
                            );
                            break Some(CloseReason::Transport("event loop panicked".into()));
                        }
                    }
                }

                // Commands from the client
                command = command_rx.recv() => {
                    match command {
                        Some(ConnectionCommand::Send(frame)) => {
                            if let Err(reason) = Self::write_frame(&mut ws_write, &frame).await {
                                break Some(reason);
                            }
                            trace!(%id, command = %frame.command, "Frame sent");
                        }

                        Some(ConnectionCommand::Shutdown) => {
                            debug!(%id, "Shutdown command received");
                            Self::close_gracefully(&mut ws_write, &mut ws_read).await;
                            break None;
                        }

                        None => {
                            debug!(%id, "Command channel closed");
                            let _ = ws_write.close().await;
                            break None;
                        }
                    }
                }

                // Outgoing heart-beat
                _ = ping.tick(), if heartbeat.outgoing.is_some() => {
                    if let Err(e) = ws_write.send(Message::Text(HEARTBEAT_EOL.into())).await {
                        break Some(CloseReason::Transport(e.to_string()));
                    }
                    trace!(%id, "Heart-beat sent");
                }

                // Incoming liveness check
                _ = liveness.tick(), if liveness_window.is_some() => {
                    if let Some(window) = liveness_window
                        && last_received.elapsed() > window
                    {
                        warn!(%id, window_ms = window.as_millis() as u64, "No traffic from broker");
                        break Some(CloseReason::HeartbeatTimeout);
                    }
                }
            }
        };

        drop(command_rx);

        match outcome {
            Some(reason) => {
                warn!(%id, %reason, "Connection lost");
                close_guard.fire(reason);
            }
            None => {
                debug!(%id, "Event loop terminated");
                close_guard.disarm();
            }
        }
    }

    /// Handles one item from the WebSocket stream.
    ///
    /// Returns a close reason if the loop must stop.
    fn handle_incoming(
        id: ConnectionId,
        message: Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>,
        on_frame: &FrameHandler,
    ) -> Option<CloseReason> {
        match message {
            Some(Ok(Message::Text(text))) => Self::handle_text(id, &text, on_frame),

            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => Self::handle_text(id, text, on_frame),
                Err(_) => {
                    warn!(%id, len = bytes.len(), "Dropping non UTF-8 binary message");
                    None
                }
            },

            Some(Ok(Message::Close(frame))) => {
                debug!(%id, ?frame, "WebSocket closed by remote");
                Some(CloseReason::ClosedByRemote)
            }

            Some(Err(e)) => {
                error!(%id, error = %e, "WebSocket error");
                Some(CloseReason::Transport(e.to_string()))
            }

            None => {
                debug!(%id, "WebSocket stream ended");
                Some(CloseReason::StreamEnded)
            }

            // Ping, Pong, raw frames only count as traffic
            Some(Ok(_)) => None,
        }
    }

    /// Parses a text message and routes its frames.
    fn handle_text(id: ConnectionId, text: &str, on_frame: &FrameHandler) -> Option<CloseReason> {
        let frames = match Frame::parse_all(text) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(%id, error = %e, "Dropping malformed frame");
                return None;
            }
        };

        if frames.is_empty() {
            trace!(%id, "Heart-beat received");
        }

        for frame in frames {
            match frame.command {
                Command::Message => on_frame(frame),

                Command::Error => {
                    let message = frame.error_message();
                    error!(%id, %message, "Broker sent ERROR");
                    return Some(CloseReason::ServerError(message));
                }

                Command::Receipt => {
                    debug!(%id, receipt = ?frame.header("receipt-id"), "Receipt received");
                }

                other => {
                    debug!(%id, command = %other, "Ignoring unexpected frame");
                }
            }
        }

        None
    }

    /// Writes one frame.
    async fn write_frame(
        ws_write: &mut WsWrite,
        frame: &Frame,
    ) -> std::result::Result<(), CloseReason> {
        ws_write
            .send(Message::Text(frame.encode().into()))
            .await
            .map_err(|e| {
                error!(command = %frame.command, error = %e, "Failed to send frame");
                CloseReason::Transport(e.to_string())
            })
    }

    /// Sends DISCONNECT, waits briefly for the receipt, then closes.
    async fn close_gracefully(ws_write: &mut WsWrite, ws_read: &mut WsRead) {
        let receipt = Uuid::new_v4().simple().to_string();
        let frame = Frame::disconnect(&receipt);

        if ws_write
            .send(Message::Text(frame.encode().into()))
            .await
            .is_ok()
        {
            let wait_receipt = async {
                while let Some(Ok(message)) = ws_read.next().await {
                    if let Message::Text(text) = message
                        && Frame::parse_all(&text).is_ok_and(|frames| {
                            frames.iter().any(|f| {
                                f.command == Command::Receipt
                                    && f.header("receipt-id") == Some(receipt.as_str())
                            })
                        })
                    {
                        break;
                    }
                }
            };
            let _ = tokio::time::timeout(Duration::from_millis(500), wait_receipt).await;
        }

        let _ = ws_write.close().await;
    }
}

// ============================================================================
// Tests
// ============================================================================
