//! In-process STOMP broker for integration tests.
//!
//! Binds `127.0.0.1:0`, speaks just enough STOMP 1.2 over WebSocket to
//! drive a [`RealtimeClient`](realtime_relay::RealtimeClient), and records
//! what clients send so tests can assert on it.

#![allow(dead_code)]

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use realtime_relay::protocol::{Command, Frame};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::debug;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Setup
// ============================================================================

/// Installs a test subscriber honoring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `condition` every 10ms until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Runs `future` with a 5s ceiling.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("test step timed out")
}

// ============================================================================
// FakeBroker
// ============================================================================

/// Outgoing instruction for one session task.
enum Outbound {
    Frame(Frame),
    Raw(String),
    Drop,
}

/// One accepted client session.
struct Session {
    tx: mpsc::UnboundedSender<Outbound>,
    /// Live subscriptions: (id, destination).
    subscriptions: Arc<Mutex<Vec<(String, String)>>>,
}

#[derive(Default)]
struct BrokerState {
    connects: AtomicUsize,
    subscribes: Mutex<Vec<(String, String)>>,
    unsubscribes: Mutex<Vec<String>>,
    sends: Mutex<Vec<(String, String)>>,
    request_uris: Mutex<Vec<String>>,
    sessions: Mutex<Vec<Session>>,
    reject: AtomicBool,
    handshake_delay: Mutex<Duration>,
    message_seq: AtomicUsize,
    /// `heart-beat` header for the next CONNECTED only.
    next_heart_beat: Mutex<Option<String>>,
    heartbeats: AtomicUsize,
}

/// Minimal STOMP broker.
pub struct FakeBroker {
    port: u16,
    state: Arc<BrokerState>,
    accept_task: JoinHandle<()>,
}

impl FakeBroker {
    /// Binds to a random port and starts accepting.
    pub async fn start() -> Self {
        let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
            .await
            .expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let state = Arc::new(BrokerState::default());

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, Arc::clone(&accept_state)));
            }
        });

        debug!(port, "Fake broker listening");

        Self {
            port,
            state,
            accept_task,
        }
    }

    /// Endpoint URL for clients.
    pub fn endpoint(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.port)
    }

    /// Number of CONNECT frames received.
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Every SUBSCRIBE ever received: (id, destination).
    pub fn subscribes(&self) -> Vec<(String, String)> {
        self.state.subscribes.lock().clone()
    }

    /// Every UNSUBSCRIBE id ever received.
    pub fn unsubscribes(&self) -> Vec<String> {
        self.state.unsubscribes.lock().clone()
    }

    /// Every SEND received: (destination, body).
    pub fn sends(&self) -> Vec<(String, String)> {
        self.state.sends.lock().clone()
    }

    /// Request URIs of accepted upgrades.
    pub fn request_uris(&self) -> Vec<String> {
        self.state.request_uris.lock().clone()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        let mut sessions = self.state.sessions.lock();
        sessions.retain(|session| !session.tx.is_closed());
        sessions.len()
    }

    /// Live subscriptions across all sessions.
    pub fn live_subscriptions(&self) -> Vec<(String, String)> {
        let sessions = self.state.sessions.lock();
        sessions
            .iter()
            .filter(|session| !session.tx.is_closed())
            .flat_map(|session| session.subscriptions.lock().clone())
            .collect()
    }

    /// Answers future CONNECTs with ERROR.
    pub fn set_reject(&self, reject: bool) {
        self.state.reject.store(reject, Ordering::SeqCst);
    }

    /// Delays future CONNECTED replies.
    pub fn set_handshake_delay(&self, delay: Duration) {
        *self.state.handshake_delay.lock() = delay;
    }

    /// Advertises `heart-beat` on the next CONNECTED, then never sends one.
    pub fn set_silent_heart_beat(&self, heart_beat: &str) {
        *self.state.next_heart_beat.lock() = Some(heart_beat.to_string());
    }

    /// Number of EOL heart-beats received from clients.
    pub fn heartbeats_received(&self) -> usize {
        self.state.heartbeats.load(Ordering::SeqCst)
    }

    /// Writes `text` verbatim to every live session.
    pub fn push_raw(&self, text: &str) -> usize {
        let sessions = self.state.sessions.lock();
        sessions
            .iter()
            .filter(|session| session.tx.send(Outbound::Raw(text.to_string())).is_ok())
            .count()
    }

    /// Pushes a MESSAGE to every live subscription on `destination`.
    ///
    /// Returns the number of frames sent.
    pub fn publish(&self, destination: &str, body: &str) -> usize {
        publish_to_sessions(&self.state, destination, body)
    }

    /// Drops every session without a close handshake.
    pub fn drop_connections(&self) {
        let sessions = std::mem::take(&mut *self.state.sessions.lock());
        for session in sessions {
            let _ = session.tx.send(Outbound::Drop);
        }
    }

    /// Stops accepting and drops every session.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        self.drop_connections();
    }

    /// Waits until `count` live subscriptions exist.
    pub async fn wait_for_subscriptions(&self, count: usize) -> bool {
        eventually(Duration::from_secs(5), || {
            self.live_subscriptions().len() == count
        })
        .await
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Session Task
// ============================================================================

fn publish_to_sessions(state: &BrokerState, destination: &str, body: &str) -> usize {
    let sessions = state.sessions.lock();
    let mut sent = 0;

    for session in sessions.iter() {
        let targets: Vec<String> = session
            .subscriptions
            .lock()
            .iter()
            .filter(|(_, dest)| dest == destination)
            .map(|(id, _)| id.clone())
            .collect();

        for id in targets {
            let seq = state.message_seq.fetch_add(1, Ordering::SeqCst);
            let frame = Frame::new(Command::Message)
                .with_header("destination", destination)
                .with_header("subscription", id)
                .with_header("message-id", format!("m-{seq}"))
                .with_header("content-type", "application/json")
                .with_body(body);
            if session.tx.send(Outbound::Frame(frame)).is_ok() {
                sent += 1;
            }
        }
    }

    sent
}

async fn serve(stream: TcpStream, state: Arc<BrokerState>) {
    let uris = Arc::clone(&state);
    let callback = move |request: &Request, response: Response| {
        uris.request_uris.lock().push(request.uri().to_string());
        Ok::<_, ErrorResponse>(response)
    };

    let Ok(mut ws) = accept_hdr_async(stream, callback).await else {
        return;
    };

    // Handshake
    let connect = loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let Ok(frames) = Frame::parse_all(&text) else {
                    return;
                };
                if let Some(frame) = frames.into_iter().find(|f| {
                    matches!(f.command, Command::Connect | Command::Stomp)
                }) {
                    break frame;
                }
            }
            Some(Ok(_)) => continue,
            _ => return,
        }
    };
    state.connects.fetch_add(1, Ordering::SeqCst);
    debug!(host = ?connect.header("host"), "Fake broker got CONNECT");

    let delay = *state.handshake_delay.lock();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    if state.reject.load(Ordering::SeqCst) {
        let error = Frame::new(Command::Error).with_header("message", "access denied");
        let _ = ws.send(Message::Text(error.encode().into())).await;
        let _ = ws.close(None).await;
        return;
    }

    let heart_beat = state
        .next_heart_beat
        .lock()
        .take()
        .unwrap_or_else(|| "0,0".to_string());
    let connected = Frame::new(Command::Connected)
        .with_header("version", "1.2")
        .with_header("heart-beat", heart_beat);
    if ws.send(Message::Text(connected.encode().into())).await.is_err() {
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscriptions = Arc::new(Mutex::new(Vec::new()));
    state.sessions.lock().push(Session {
        tx,
        subscriptions: Arc::clone(&subscriptions),
    });

    // Session loop
    loop {
        tokio::select! {
            message = ws.next() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                if text.trim_matches(['\r', '\n']).is_empty() {
                    state.heartbeats.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
                let Ok(frames) = Frame::parse_all(&text) else { continue };

                for frame in frames {
                    match frame.command {
                        Command::Subscribe => {
                            let id = frame.header("id").unwrap_or_default().to_string();
                            let dest = frame.destination().unwrap_or_default().to_string();
                            state.subscribes.lock().push((id.clone(), dest.clone()));
                            subscriptions.lock().push((id, dest));
                        }
                        Command::Unsubscribe => {
                            let id = frame.header("id").unwrap_or_default().to_string();
                            subscriptions.lock().retain(|(sub, _)| *sub != id);
                            state.unsubscribes.lock().push(id);
                        }
                        Command::Send => {
                            let dest = frame.destination().unwrap_or_default().to_string();
                            state.sends.lock().push((dest.clone(), frame.body.clone()));
                            publish_to_sessions(&state, &dest, &frame.body);
                        }
                        Command::Disconnect => {
                            if let Some(receipt) = frame.header("receipt") {
                                let reply = Frame::new(Command::Receipt)
                                    .with_header("receipt-id", receipt);
                                let _ = ws.send(Message::Text(reply.encode().into())).await;
                            }
                            let _ = ws.close(None).await;
                            subscriptions.lock().clear();
                            return;
                        }
                        _ => {}
                    }
                }
            }

            outbound = rx.recv() => {
                match outbound {
                    Some(Outbound::Frame(frame)) => {
                        if ws.send(Message::Text(frame.encode().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Raw(text)) => {
                        if ws.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    // Drop the socket without a close frame
                    Some(Outbound::Drop) | None => break,
                }
            }
        }
    }

    subscriptions.lock().clear();
}
