//! Dialing and STOMP handshake.
//!
//! # Connection Flow
//!
//! 1. Dial the endpoint (token attached as a query parameter)
//! 2. Send CONNECT with the heart-beat offer
//! 3. Wait for CONNECTED (or ERROR) from the broker
//! 4. Negotiate heart-beats and spawn the [`Connection`] event loop
//!
//! Steps 1–3 share one timeout.

// ============================================================================
// Imports
// ============================================================================

use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{debug, info, trace};

use crate::client::ClientOptions;
use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::protocol::{Command, Frame};

use super::connection::{CloseHandler, Connection, FrameHandler, WsStream};

// ============================================================================
// connect
// ============================================================================

/// Dials the broker and completes the STOMP handshake.
///
/// # Errors
///
/// - [`Error::ConnectionTimeout`] if dial + handshake exceed the timeout
/// - [`Error::Connection`] / [`Error::WebSocket`] if the socket fails
/// - [`Error::Handshake`] if the broker answers with ERROR
/// - [`Error::ConnectionClosed`] if the socket closes during the handshake
pub async fn connect(
    options: &ClientOptions,
    id: ConnectionId,
    on_frame: FrameHandler,
    on_close: CloseHandler,
) -> Result<Connection> {
    let connect_timeout = options.connect_timeout;

    let (ws_stream, server_heart_beat) = timeout(connect_timeout, dial_and_handshake(options, id))
        .await
        .map_err(|_| Error::connection_timeout(connect_timeout.as_millis() as u64))??;

    let heartbeat = options.heartbeat.negotiate(server_heart_beat);
    info!(%id, endpoint = %options.endpoint, ?heartbeat, "STOMP session established");

    Ok(Connection::spawn(id, ws_stream, heartbeat, on_frame, on_close))
}

/// Opens the socket and exchanges CONNECT/CONNECTED.
async fn dial_and_handshake(
    options: &ClientOptions,
    id: ConnectionId,
) -> Result<(WsStream, Option<(u64, u64)>)> {
    let url = options.connect_url();
    let request = url.as_str().into_client_request()?;

    debug!(%id, endpoint = %options.endpoint, "Dialing broker");

    let (mut ws_stream, _response) = connect_async(request)
        .await
        .map_err(|e| Error::connection(format!("WebSocket connect failed: {e}")))?;

    let connect = Frame::connect(&options.host_header(), options.heartbeat.as_millis_pair());
    ws_stream
        .send(Message::Text(connect.encode().into()))
        .await?;

    let connected = read_handshake(&mut ws_stream).await?;
    debug!(%id, version = ?connected.header("version"), "CONNECTED received");

    Ok((ws_stream, connected.heart_beat()))
}

/// Reads until the broker answers the CONNECT.
async fn read_handshake(ws_stream: &mut WsStream) -> Result<Frame> {
    while let Some(message) = ws_stream.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Close(frame) => {
                debug!(?frame, "Socket closed during handshake");
                return Err(Error::ConnectionClosed);
            }
            _ => continue,
        };

        for frame in Frame::parse_all(&text)? {
            match frame.command {
                Command::Connected => return Ok(frame),
                Command::Error => return Err(Error::handshake(frame.error_message())),
                other => trace!(command = %other, "Ignoring frame before CONNECTED"),
            }
        }
    }

    Err(Error::ConnectionClosed)
}
