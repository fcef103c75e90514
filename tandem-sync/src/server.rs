//! WebSocket sync server with a single hub task.
//!
//! Architecture:
//! ```text
//! Client A ── conn task ──┐                         ┌── outbound A ──► Client A
//!                         ├─► HubEvent (mpsc) ─► hub ┤
//! Client B ── conn task ──┘      SyncHandler         └── outbound B ──► Client B
//!                 │
//!                 └── run ──► CodeExecutor (spawned) ──► outbound of requester
//! ```
//!
//! Connection tasks decode frames and forward them to the hub in arrival
//! order. The hub owns all room state and applies events one at a time.
//! Each connection drains its own bounded outbound queue into the socket.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::broadcast::Frame;
use crate::exec::{CodeExecutor, ExecutionOutput, ExecutionRequest, UnconfiguredExecutor};
use crate::handler::SyncHandler;
use crate::protocol::{
    ClientMessage, ConnectionId, MessageKind, ProtocolError, ServerMessage, DEFAULT_ROOM_TEXT,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Text a room starts with
    pub default_room_text: String,
    /// Frames buffered per connection before new ones are dropped
    pub outbound_capacity: usize,
    /// Events buffered between connection tasks and the hub
    pub event_capacity: usize,
    /// Largest WebSocket message accepted
    pub max_message_bytes: usize,
    /// Largest edit text accepted (None = unbounded)
    pub max_text_bytes: Option<usize>,
    /// Evict rooms that stay memberless this long (None = never)
    pub room_ttl: Option<Duration>,
    /// How often idle rooms are looked for
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            default_room_text: DEFAULT_ROOM_TEXT.to_string(),
            outbound_capacity: 256,
            event_capacity: 1024,
            max_message_bytes: 16 << 20,
            max_text_bytes: None,
            room_ttl: None,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub active_rooms: usize,
    pub messages_received: u64,
    pub messages_rejected: u64,
    pub broadcasts: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub rooms_evicted: u64,
}

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("sync hub has shut down")]
    HubClosed,
}

/// Events from connection tasks to the hub.
#[derive(Debug)]
enum HubEvent {
    Connect {
        conn: ConnectionId,
        outbound: mpsc::Sender<Frame>,
    },
    Message {
        conn: ConnectionId,
        message: ClientMessage,
    },
    Rejected {
        conn: ConnectionId,
        error: ProtocolError,
    },
    Disconnect {
        conn: ConnectionId,
    },
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    executor: Arc<dyn CodeExecutor>,
    /// Snapshot of hub counters, refreshed after every event
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            executor: Arc::new(UnconfiguredExecutor),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Use `executor` for `run` requests.
    pub fn with_executor(mut self, executor: Arc<dyn CodeExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.bind_addr.clone(),
                source,
            })?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        match self.config.room_ttl {
            Some(ttl) => log::info!("Idle rooms are evicted after {ttl:?}"),
            None => log::warn!(
                "Room eviction disabled: every room stays in memory until the process exits"
            ),
        }

        let (events_tx, events_rx) = mpsc::channel(self.config.event_capacity.max(1));
        let handler = SyncHandler::new(self.config.default_room_text.clone())
            .with_text_limit(self.config.max_text_bytes);
        tokio::spawn(run_hub(
            handler,
            events_rx,
            self.stats.clone(),
            self.config.room_ttl,
            self.config.sweep_interval,
        ));

        loop {
            let (stream, addr) = listener.accept().await.map_err(ServerError::Accept)?;
            log::debug!("New TCP connection from {addr}");

            let events = events_tx.clone();
            let executor = self.executor.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, events, executor, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// The single event loop that owns all room state.
async fn run_hub(
    mut handler: SyncHandler,
    mut events: mpsc::Receiver<HubEvent>,
    stats: Arc<RwLock<ServerStats>>,
    room_ttl: Option<Duration>,
    sweep_interval: Duration,
) {
    let mut sweep = tokio::time::interval(sweep_interval.max(Duration::from_millis(10)));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    HubEvent::Connect { conn, outbound } => handler.connect(conn, outbound),
                    HubEvent::Message { conn, message } => handler.handle(conn, message),
                    HubEvent::Rejected { conn, error } => handler.reject(conn, &error),
                    HubEvent::Disconnect { conn } => {
                        handler.disconnect(conn);
                    }
                }
            }
            _ = sweep.tick(), if room_ttl.is_some() => {
                if let Some(ttl) = room_ttl {
                    handler.sweep_idle(Instant::now(), ttl);
                }
            }
        }

        *stats.write().await = handler.stats();
    }

    log::info!("Sync hub stopped");
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    events: mpsc::Sender<HubEvent>,
    executor: Arc<dyn CodeExecutor>,
    config: ServerConfig,
) -> Result<(), ServerError> {
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(config.max_message_bytes))
        .max_frame_size(Some(config.max_message_bytes));
    let ws_stream = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await?;

    let conn = ConnectionId::new();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Frame>(config.outbound_capacity.max(1));
    events
        .send(HubEvent::Connect { conn, outbound: outbound_tx.clone() })
        .await
        .map_err(|_| ServerError::HubClosed)?;

    log::info!("Connection {conn} established from {addr}");

    let result = pump(ws_stream, conn, &events, outbound_tx, outbound_rx, executor).await;

    // Disconnect exactly once, however the pump ended
    let _ = events.send(HubEvent::Disconnect { conn }).await;
    log::info!("Connection {conn} closed from {addr}");
    result
}

/// Shuttle frames between the socket, the hub and the outbound queue.
async fn pump(
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    conn: ConnectionId,
    events: &mpsc::Sender<HubEvent>,
    outbound_tx: mpsc::Sender<Frame>,
    mut outbound_rx: mpsc::Receiver<Frame>,
    executor: Arc<dyn CodeExecutor>,
) -> Result<(), ServerError> {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                let decoded = match msg {
                    Some(Ok(Message::Text(text))) => ClientMessage::decode(text.as_str()),
                    Some(Ok(Message::Binary(data))) => ClientMessage::decode_bytes(&data),
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                    // Pings are answered by tungstenite while the stream is polled
                    Some(Ok(_)) => continue,
                };

                let event = match decoded {
                    Ok(ClientMessage::Run(request)) => {
                        spawn_execution(conn, executor.clone(), request, outbound_tx.clone());
                        None
                    }
                    Ok(message) => Some(HubEvent::Message { conn, message }),
                    Err(error) => {
                        if error.kind() == Some(MessageKind::Run) {
                            // Only this loop drains the queue, so never wait on it here
                            queue_reply(conn, &outbound_tx, ExecutionOutput::rejected());
                        }
                        Some(HubEvent::Rejected { conn, error })
                    }
                };

                if let Some(event) = event {
                    events.send(event).await.map_err(|_| ServerError::HubClosed)?;
                }
            }

            frame = outbound_rx.recv() => {
                // The pump holds a sender itself, so the queue never closes here
                let Some(frame) = frame else { return Ok(()) };
                ws_sender.send(Message::text(frame.to_string())).await?;
            }
        }
    }
}

/// Run `request` off the hub and queue the result for the requester only.
fn spawn_execution(
    conn: ConnectionId,
    executor: Arc<dyn CodeExecutor>,
    request: ExecutionRequest,
    outbound: mpsc::Sender<Frame>,
) {
    log::info!(
        "Connection {conn} running {} bytes of source (language {})",
        request.source.len(),
        request.language_id
    );
    tokio::spawn(async move {
        let output = executor.execute(request).await;
        reply_run(&outbound, output).await;
    });
}

/// Queue a run result without waiting. A full queue drops it.
fn queue_reply(conn: ConnectionId, outbound: &mpsc::Sender<Frame>, output: ExecutionOutput) {
    let encoded = match ServerMessage::RunResult(output).encode() {
        Ok(encoded) => encoded,
        Err(e) => {
            log::error!("Failed to encode run result: {e}");
            return;
        }
    };
    match outbound.try_send(Frame::from(encoded)) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            log::warn!("Outbound queue full for connection {conn}, dropping run result");
        }
        Err(TrySendError::Closed(_)) => {
            log::debug!("Outbound queue closed for connection {conn}");
        }
    }
}

async fn reply_run(outbound: &mpsc::Sender<Frame>, output: ExecutionOutput) {
    match ServerMessage::RunResult(output).encode() {
        Ok(encoded) => {
            if outbound.send(Frame::from(encoded)).await.is_err() {
                log::debug!("Requester went away before its run result was ready");
            }
        }
        Err(e) => log::error!("Failed to encode run result: {e}"),
    }
}
