//! WebSocket sync client for connecting to the room server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect detection)
//! - Join / edit sending and init / update reception as [`SyncEvent`]s
//! - Run and status requests
//! - Offline buffering: joined rooms are remembered and only the newest
//!   unsent edit per room is kept, then replayed on connect

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::exec::{ExecutionOutput, ExecutionRequest};
use crate::protocol::{ClientMessage, ProtocolError, RoomKey, ServerMessage, StatusReport};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Text of a room that existed before we joined it
    Snapshot(String),
    /// Text another member of a joined room wrote
    RemoteEdit(String),
    /// Outcome of a run request
    RunResult(ExecutionOutput),
    /// Server health report
    Status(StatusReport),
}

impl From<ServerMessage> for SyncEvent {
    fn from(msg: ServerMessage) -> Self {
        match msg {
            ServerMessage::Init { text } => Self::Snapshot(text),
            ServerMessage::Update { text } => Self::RemoteEdit(text),
            ServerMessage::RunResult(output) => Self::RunResult(output),
            ServerMessage::Status(report) => Self::Status(report),
        }
    }
}

/// Rooms to rejoin and edits not yet delivered.
///
/// Edits are whole-document snapshots, so a newer pending edit for a room
/// replaces the older one.
#[derive(Debug, Default)]
pub struct PendingEdits {
    rooms: BTreeSet<RoomKey>,
    edits: BTreeMap<RoomKey, String>,
}

impl PendingEdits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a joined room. Rooms are kept across reconnects.
    pub fn remember_room(&mut self, room_key: RoomKey) {
        self.rooms.insert(room_key);
    }

    /// Keep `text` as the edit to send for `room_key`, replacing any older one.
    pub fn stash(&mut self, room_key: RoomKey, text: String) {
        self.edits.insert(room_key, text);
    }

    /// Messages to send after (re)connecting: every join, then the pending edits.
    pub fn replay(&mut self) -> Vec<ClientMessage> {
        let joins = self
            .rooms
            .iter()
            .cloned()
            .map(|room_key| ClientMessage::Join { room_key });
        let edits = std::mem::take(&mut self.edits)
            .into_iter()
            .map(|(room_key, text)| ClientMessage::Edit { room_key, text });
        joins.chain(edits).collect()
    }

    /// Number of pending edits.
    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }
}

/// The sync client.
pub struct SyncClient {
    /// Server URL (ws://host:port)
    server_url: String,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Joined rooms and undelivered edits
    pending: Arc<Mutex<PendingEdits>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    /// Create a new sync client.
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            pending: Arc::new(Mutex::new(PendingEdits::new())),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading and writing WebSocket messages,
    /// then replays remembered joins and pending edits.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        {
            let mut state = self.state.write().await;
            if *state == ConnectionState::Connected {
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(Message::text(frame)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Queue the replay before anything else can be sent
        let replay = self.pending.lock().await.replay();
        if !replay.is_empty() {
            log::info!("Replaying {} buffered messages", replay.len());
        }
        for msg in &replay {
            out_tx
                .send(msg.encode()?)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        self.outgoing_tx = Some(out_tx);

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: process incoming WebSocket messages
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let decoded = match msg {
                    Ok(Message::Text(text)) => ServerMessage::decode(text.as_str()),
                    Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                        Ok(text) => ServerMessage::decode(text),
                        Err(e) => Err(ProtocolError::Malformed(e.to_string())),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };

                match decoded {
                    Ok(server_msg) => {
                        let _ = event_tx.send(server_msg.into()).await;
                    }
                    Err(e) => log::debug!("Ignoring undecodable server frame: {e}"),
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Join a room. Remembered for replay on reconnect.
    pub async fn join(&self, room_key: impl Into<RoomKey>) -> Result<(), ProtocolError> {
        let room_key = room_key.into();
        self.pending.lock().await.remember_room(room_key.clone());

        if self.connection_state().await != ConnectionState::Connected {
            return Ok(());
        }
        self.send(&ClientMessage::Join { room_key }).await
    }

    /// Send the full text of a room.
    ///
    /// If disconnected, keeps it as the room's pending edit.
    pub async fn send_edit(
        &self,
        room_key: impl Into<RoomKey>,
        text: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        let room_key = room_key.into();
        let text = text.into();

        if self.connection_state().await != ConnectionState::Connected {
            self.pending.lock().await.stash(room_key, text);
            return Ok(());
        }
        self.send(&ClientMessage::Edit { room_key, text }).await
    }

    /// Ask the server to run `source`. The answer arrives as [`SyncEvent::RunResult`].
    pub async fn run(&self, source: impl Into<String>, language_id: u32) -> Result<(), ProtocolError> {
        let request = ExecutionRequest { source: source.into(), language_id };
        self.send(&ClientMessage::Run(request)).await
    }

    /// Ask for a health report. The answer arrives as [`SyncEvent::Status`].
    pub async fn request_status(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Status).await
    }

    async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(encoded)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Number of edits waiting for a connection.
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }
}
