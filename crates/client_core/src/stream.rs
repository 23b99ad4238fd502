//! Reconnecting client for the backend's live event feed.
//!
//! [`StreamClient`] owns one logical streaming connection, demultiplexes
//! inbound frames into log and status callbacks, and recovers from
//! transport loss with a fixed-delay, bounded retry policy. Explicit
//! [`StreamClient::disconnect`] never triggers a reconnect: every
//! `connect()`/`disconnect()` call bumps a connection generation, and only
//! tasks holding the current generation may mutate state or schedule
//! retries, so a stale reconnect timer cannot resurrect a connection.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use shared::protocol::{LogEntry, StatusPayload, StreamFrame};

use crate::lock;

/// Well-known path of the event feed on the backend host.
pub const STREAM_PATH: &str = "/api/ws/logs";

const RECONNECT_DELAY: Duration = Duration::from_millis(2000);
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

pub type LogCallback = Box<dyn Fn(LogEntry) + Send + Sync>;
pub type StatusCallback = Box<dyn Fn(StatusPayload) + Send + Sync>;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("unsupported server url '{0}': must start with http:// or https://")]
    UnsupportedScheme(String),
    #[error("failed to open stream: {0}")]
    Connect(String),
    #[error("stream transport failed: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Sequential reader over one established transport connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Next text frame. `Ok(None)` means the peer closed the stream;
    /// `Err` means the transport failed mid-stream. Both end the
    /// connection and enter the reconnect path.
    async fn next_frame(&mut self) -> Result<Option<String>, StreamError>;
}

/// Seam between the stream client and the wire, so tests can script
/// connection outcomes without a live server.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn FrameSource>, StreamError>;
}

/// Production transport over tokio-tungstenite.
pub struct WsTransport;

#[async_trait]
impl StreamTransport for WsTransport {
    async fn open(&self, url: &str) -> Result<Box<dyn FrameSource>, StreamError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;
        Ok(Box::new(WsFrameSource { inner: ws_stream }))
    }
}

struct WsFrameSource {
    inner: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

#[async_trait]
impl FrameSource for WsFrameSource {
    async fn next_frame(&mut self) -> Result<Option<String>, StreamError> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Close(_))) => return Ok(None),
                // Ping/pong handled by tungstenite; binary frames are not
                // part of this protocol.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(StreamError::Transport(e.to_string())),
                None => return Ok(None),
            }
        }
    }
}

/// Retry policy knobs; production values match the backend's expectations,
/// tests shrink the delay.
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: RECONNECT_DELAY,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

struct StreamState {
    connection: ConnectionState,
    reconnect_attempts: u32,
    generation: u64,
}

pub struct StreamClient {
    transport: Arc<dyn StreamTransport>,
    url: String,
    reconnect_delay: Duration,
    max_reconnect_attempts: u32,
    state: Mutex<StreamState>,
    generation_tx: watch::Sender<u64>,
    on_log: Mutex<Option<LogCallback>>,
    on_status: Mutex<Option<StatusCallback>>,
}

impl StreamClient {
    pub fn new(server_url: &str) -> Result<Arc<Self>, StreamError> {
        Self::with_transport(server_url, Arc::new(WsTransport))
    }

    pub fn with_transport(
        server_url: &str,
        transport: Arc<dyn StreamTransport>,
    ) -> Result<Arc<Self>, StreamError> {
        Self::with_options(server_url, transport, StreamOptions::default())
    }

    pub fn with_options(
        server_url: &str,
        transport: Arc<dyn StreamTransport>,
        options: StreamOptions,
    ) -> Result<Arc<Self>, StreamError> {
        let url = stream_url(server_url)?;
        let (generation_tx, _) = watch::channel(0);
        Ok(Arc::new(Self {
            transport,
            url,
            reconnect_delay: options.reconnect_delay,
            max_reconnect_attempts: options.max_reconnect_attempts,
            state: Mutex::new(StreamState {
                connection: ConnectionState::Disconnected,
                reconnect_attempts: 0,
                generation: 0,
            }),
            generation_tx,
            on_log: Mutex::new(None),
            on_status: Mutex::new(None),
        }))
    }

    /// Register the log observer. Last registration wins.
    pub fn on_log(&self, callback: impl Fn(LogEntry) + Send + Sync + 'static) {
        *lock(&self.on_log) = Some(Box::new(callback));
    }

    /// Register the status observer. Last registration wins.
    pub fn on_status(&self, callback: impl Fn(StatusPayload) + Send + Sync + 'static) {
        *lock(&self.on_status) = Some(Box::new(callback));
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connection == ConnectionState::Connected
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.state).connection
    }

    pub fn reconnect_attempts(&self) -> u32 {
        lock(&self.state).reconnect_attempts
    }

    /// Open the streaming connection under a fresh generation.
    ///
    /// Returns immediately; connection progress is observable through
    /// [`Self::connection_state`] and the registered callbacks. Calling
    /// this while a connection is live supersedes it.
    pub fn connect(self: &Arc<Self>) {
        let generation = {
            let mut state = lock(&self.state);
            state.generation += 1;
            state.connection = ConnectionState::Connecting;
            state.reconnect_attempts = 0;
            self.generation_tx.send_replace(state.generation);
            state.generation
        };

        let client = Arc::clone(self);
        tokio::spawn(async move { client.run(generation).await });
    }

    /// Close the connection deliberately. Cancels any pending reconnect
    /// timer; no reconnect is ever scheduled from here.
    pub fn disconnect(&self) {
        let mut state = lock(&self.state);
        state.generation += 1;
        state.connection = ConnectionState::Disconnected;
        self.generation_tx.send_replace(state.generation);
        info!("stream disconnected by caller");
    }

    async fn run(self: Arc<Self>, generation: u64) {
        let mut generation_rx = self.generation_tx.subscribe();

        loop {
            match self.transport.open(&self.url).await {
                Ok(mut source) => {
                    if !self.enter_connected(generation) {
                        return;
                    }
                    info!(url = %self.url, "stream connected");

                    loop {
                        tokio::select! {
                            _ = generation_rx.changed() => {
                                // Superseded by a newer connect() or an
                                // explicit disconnect(); state belongs to
                                // the new generation now.
                                return;
                            }
                            frame = source.next_frame() => match frame {
                                Ok(Some(text)) => self.dispatch_frame(&text),
                                Ok(None) => {
                                    info!("stream closed by server");
                                    break;
                                }
                                Err(err) => {
                                    warn!("stream transport error: {err}");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(url = %self.url, "stream connect failed: {err}");
                }
            }

            if !self.mark_disconnected(generation) {
                return;
            }

            let attempts = lock(&self.state).reconnect_attempts;
            if attempts >= self.max_reconnect_attempts {
                warn!(
                    attempts,
                    "stream reconnect budget exhausted; staying disconnected"
                );
                return;
            }

            tokio::select! {
                _ = generation_rx.changed() => return,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }

            if !self.begin_reconnect(generation) {
                return;
            }
        }
    }

    fn enter_connected(&self, generation: u64) -> bool {
        let mut state = lock(&self.state);
        if state.generation != generation {
            return false;
        }
        state.connection = ConnectionState::Connected;
        state.reconnect_attempts = 0;
        true
    }

    fn mark_disconnected(&self, generation: u64) -> bool {
        let mut state = lock(&self.state);
        if state.generation != generation {
            return false;
        }
        state.connection = ConnectionState::Disconnected;
        true
    }

    fn begin_reconnect(&self, generation: u64) -> bool {
        let mut state = lock(&self.state);
        if state.generation != generation {
            return false;
        }
        state.reconnect_attempts += 1;
        state.connection = ConnectionState::Connecting;
        info!(
            attempt = state.reconnect_attempts,
            max = self.max_reconnect_attempts,
            "stream reconnecting"
        );
        true
    }

    fn dispatch_frame(&self, text: &str) {
        match serde_json::from_str::<StreamFrame>(text) {
            Ok(StreamFrame::Log(entry)) => {
                if let Some(callback) = lock(&self.on_log).as_ref() {
                    callback(entry);
                }
            }
            Ok(StreamFrame::Status(payload)) => {
                if let Some(callback) = lock(&self.on_status).as_ref() {
                    callback(payload);
                }
            }
            Err(err) => {
                warn!("dropping undecodable stream frame: {err}");
            }
        }
    }
}

fn stream_url(server_url: &str) -> Result<String, StreamError> {
    let base = if server_url.starts_with("https://") {
        server_url.replacen("https://", "wss://", 1)
    } else if server_url.starts_with("http://") {
        server_url.replacen("http://", "ws://", 1)
    } else {
        return Err(StreamError::UnsupportedScheme(server_url.to_string()));
    };
    Ok(format!("{}{STREAM_PATH}", base.trim_end_matches('/')))
}

#[cfg(test)]
#[path = "tests/stream_tests.rs"]
mod tests;
