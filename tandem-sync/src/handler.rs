//! Sync protocol handler: the join / edit / disconnect state machine.
//!
//! Per connection:
//! ```text
//!            join(room)              join(other room)
//!  Unbound ─────────────► Bound ◄──────────────────┐
//!     │                     │  edit (no change) ────┘
//!     │  disconnect         │  disconnect
//!     └────────────────►  Closed ◄─┘
//! ```
//!
//! The handler exclusively owns the [`SessionStore`], the
//! [`ConnectionRegistry`] and the [`Dispatcher`]. Every transition runs to
//! completion without awaiting, so the hub task that drives it is the only
//! writer of room state and needs no locks.
//!
//! Concurrent edits to one room resolve by processing order: the edit
//! handled last is the room's text. Nothing is merged.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::broadcast::{Dispatcher, Frame};
use crate::protocol::{
    ClientMessage, ConnectionId, ProtocolError, RoomKey, ServerMessage, StatusReport,
    DEFAULT_ROOM_TEXT,
};
use crate::registry::ConnectionRegistry;
use crate::server::ServerStats;
use crate::store::{Ensured, SessionStore};

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Connected, no room joined yet
    Unbound,
    /// Member of one or more rooms
    Bound(Vec<RoomKey>),
    /// Disconnected, or never connected
    Closed,
}

/// What a join did to the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Room was new and seeded with the default text; no snapshot sent.
    Seeded,
    /// Room existed; its text was sent to the joiner.
    Snapshot,
    /// The connection is not attached; nothing happened.
    Ignored,
}

#[derive(Debug, Default)]
struct Counters {
    total_connections: u64,
    messages_received: u64,
    messages_rejected: u64,
    rooms_evicted: u64,
}

/// The sync state machine.
pub struct SyncHandler {
    store: SessionStore,
    registry: ConnectionRegistry,
    dispatcher: Dispatcher,
    default_text: String,
    max_text_bytes: Option<usize>,
    /// Rooms without members, and since when
    vacant_since: HashMap<RoomKey, Instant>,
    counters: Counters,
}

impl Default for SyncHandler {
    fn default() -> Self {
        Self::new(DEFAULT_ROOM_TEXT)
    }
}

impl SyncHandler {
    pub fn new(default_text: impl Into<String>) -> Self {
        Self {
            store: SessionStore::new(),
            registry: ConnectionRegistry::new(),
            dispatcher: Dispatcher::new(),
            default_text: default_text.into(),
            max_text_bytes: None,
            vacant_since: HashMap::new(),
            counters: Counters::default(),
        }
    }

    /// Reject edits whose text exceeds `limit` bytes.
    pub fn with_text_limit(mut self, limit: Option<usize>) -> Self {
        self.max_text_bytes = limit;
        self
    }

    /// A transport connection was accepted.
    pub fn connect(&mut self, conn: ConnectionId, outbound: mpsc::Sender<Frame>) {
        self.dispatcher.attach(conn, outbound);
        self.counters.total_connections += 1;
        log::debug!("Connection {conn} attached");
    }

    /// Route a validated client message to its transition.
    ///
    /// `run` requests are served outside the hub and are ignored here.
    pub fn handle(&mut self, conn: ConnectionId, msg: ClientMessage) {
        self.counters.messages_received += 1;

        match msg {
            ClientMessage::Join { room_key } => {
                self.join(conn, room_key);
            }
            ClientMessage::Edit { room_key, text } => {
                if let Err(e) = self.edit(conn, room_key, text) {
                    self.counters.messages_rejected += 1;
                    log::debug!("Dropped edit from {conn}: {e}");
                }
            }
            ClientMessage::Status => self.status(conn),
            ClientMessage::Run(_) => {
                log::debug!("Ignoring run request from {conn} inside the hub");
            }
        }
    }

    /// Record a frame that failed validation. It is dropped.
    pub fn reject(&mut self, conn: ConnectionId, error: &ProtocolError) {
        self.counters.messages_received += 1;
        self.counters.messages_rejected += 1;
        log::debug!("Dropped malformed message from {conn}: {error}");
    }

    /// Join transition.
    pub fn join(&mut self, conn: ConnectionId, room_key: RoomKey) -> JoinOutcome {
        if !self.dispatcher.is_attached(conn) {
            log::debug!("Join from unknown connection {conn} ignored");
            return JoinOutcome::Ignored;
        }

        self.registry.join(conn, room_key.clone());
        self.vacant_since.remove(&room_key);

        match self.store.ensure(&room_key, &self.default_text) {
            Ensured::Created(_) => {
                log::info!("Connection {conn} joined new room {room_key}");
                JoinOutcome::Seeded
            }
            Ensured::Existing(text) => {
                let init = ServerMessage::Init { text: text.to_owned() };
                if let Err(e) = self.dispatcher.send_to(conn, &init) {
                    log::error!("Failed to encode snapshot of room {room_key}: {e}");
                }
                log::info!("Connection {conn} joined room {room_key}");
                JoinOutcome::Snapshot
            }
        }
    }

    /// Edit transition: overwrite the room, then fan out to the other members.
    ///
    /// Returns the number of peers the update was queued for. An edit to a
    /// room nobody joined creates that room.
    pub fn edit(
        &mut self,
        conn: ConnectionId,
        room_key: RoomKey,
        text: String,
    ) -> Result<usize, ProtocolError> {
        if !self.dispatcher.is_attached(conn) {
            return Err(ProtocolError::UnknownConnection(conn));
        }
        if let Some(limit) = self.max_text_bytes {
            if text.len() > limit {
                return Err(ProtocolError::TextTooLarge { len: text.len(), limit });
            }
        }

        let update = ServerMessage::Update { text: text.clone() };
        let created = self.store.set(room_key.clone(), text);
        if created && self.registry.member_count(&room_key) == 0 {
            log::debug!("Edit from {conn} created unjoined room {room_key}");
            self.vacant_since.insert(room_key.clone(), Instant::now());
        }

        self.dispatcher.broadcast(&self.registry, &room_key, &update, conn)
    }

    /// Disconnect transition. Returns the rooms the connection was in.
    pub fn disconnect(&mut self, conn: ConnectionId) -> Vec<RoomKey> {
        let attached = self.dispatcher.detach(conn);
        let rooms = self.registry.leave(conn);

        let now = Instant::now();
        for room_key in &rooms {
            if self.registry.member_count(room_key) == 0 && self.store.contains(room_key) {
                self.vacant_since.insert(room_key.clone(), now);
            }
        }

        if attached {
            log::info!("Connection {conn} disconnected, left {} room(s)", rooms.len());
        }
        rooms
    }

    /// Answer a health query on the requesting connection.
    pub fn status(&mut self, conn: ConnectionId) {
        let report = StatusReport::running(self.store.len(), self.dispatcher.len());
        if let Err(e) = self.dispatcher.send_to(conn, &ServerMessage::Status(report)) {
            log::error!("Failed to encode status report: {e}");
        }
    }

    /// Evict rooms that have had no members for at least `ttl`.
    pub fn sweep_idle(&mut self, now: Instant, ttl: Duration) -> Vec<RoomKey> {
        let expired: Vec<RoomKey> = self
            .vacant_since
            .iter()
            .filter(|(_, since)| now.saturating_duration_since(**since) >= ttl)
            .map(|(room_key, _)| room_key.clone())
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for room_key in expired {
            self.vacant_since.remove(&room_key);
            if self.registry.member_count(&room_key) > 0 {
                continue;
            }
            if self.store.remove(&room_key).is_some() {
                log::info!("Evicted idle room {room_key}");
                evicted.push(room_key);
            }
        }
        self.counters.rooms_evicted += evicted.len() as u64;
        evicted
    }

    pub fn phase(&self, conn: ConnectionId) -> ConnectionPhase {
        if !self.dispatcher.is_attached(conn) {
            return ConnectionPhase::Closed;
        }
        let rooms = self.registry.rooms_of(conn);
        if rooms.is_empty() {
            ConnectionPhase::Unbound
        } else {
            ConnectionPhase::Bound(rooms)
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn stats(&self) -> ServerStats {
        let dispatch = self.dispatcher.stats();
        ServerStats {
            total_connections: self.counters.total_connections,
            active_connections: self.dispatcher.len() as u64,
            active_rooms: self.store.len(),
            messages_received: self.counters.messages_received,
            messages_rejected: self.counters.messages_rejected,
            broadcasts: dispatch.broadcasts,
            frames_sent: dispatch.frames_sent,
            frames_dropped: dispatch.frames_dropped,
            rooms_evicted: self.counters.rooms_evicted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(handler: &mut SyncHandler) -> (ConnectionId, mpsc::Receiver<Frame>) {
        let conn = ConnectionId::new();
        let (tx, rx) = mpsc::channel(32);
        handler.connect(conn, tx);
        (conn, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(ServerMessage::decode(&frame).unwrap());
        }
        out
    }

    fn room(key: &str) -> RoomKey {
        RoomKey::from(key)
    }

    #[test]
    fn test_join_seeds_exactly_once() {
        let mut handler = SyncHandler::new("seed");
        let (a, _rx_a) = connected(&mut handler);
        let (b, _rx_b) = connected(&mut handler);

        assert_eq!(handler.join(a, room("r")), JoinOutcome::Seeded);
        assert_eq!(handler.store().get(&room("r")), Some("seed"));

        assert_eq!(handler.join(b, room("r")), JoinOutcome::Snapshot);
        assert_eq!(handler.store().get(&room("r")), Some("seed"));
        assert_eq!(handler.store().len(), 1);
    }

    #[test]
    fn test_edit_last_writer_wins() {
        let mut handler = SyncHandler::default();
        let (a, _rx_a) = connected(&mut handler);
        let (b, _rx_b) = connected(&mut handler);
        handler.join(a, room("r"));
        handler.join(b, room("r"));

        for text in ["one", "two", "three"] {
            handler.edit(a, room("r"), text.into()).unwrap();
        }
        handler.edit(b, room("r"), "final".into()).unwrap();

        assert_eq!(handler.store().get(&room("r")), Some("final"));
    }

    #[test]
    fn test_no_self_echo_and_room_isolation() {
        let mut handler = SyncHandler::default();
        let (a, mut rx_a) = connected(&mut handler);
        let (b, mut rx_b) = connected(&mut handler);
        let (c, mut rx_c) = connected(&mut handler);
        let (d, mut rx_d) = connected(&mut handler);

        for conn in [a, b, c] {
            handler.join(conn, room("r"));
        }
        handler.join(d, room("elsewhere"));
        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_c);
        drain(&mut rx_d);

        let delivered = handler.edit(a, room("r"), "hello".into()).unwrap();
        assert_eq!(delivered, 2);

        let update = ServerMessage::Update { text: "hello".into() };
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b), vec![update.clone()]);
        assert_eq!(drain(&mut rx_c), vec![update]);
        assert!(drain(&mut rx_d).is_empty());
    }

    #[test]
    fn test_disconnect_cleanup() {
        let mut handler = SyncHandler::default();
        let (a, _rx_a) = connected(&mut handler);
        let (b, mut rx_b) = connected(&mut handler);
        handler.join(a, room("one"));
        handler.join(a, room("two"));
        handler.join(b, room("one"));

        let left = handler.disconnect(a);
        assert_eq!(left, vec![room("one"), room("two")]);
        assert_eq!(handler.phase(a), ConnectionPhase::Closed);
        assert!(handler.registry().members_except(&room("one"), b).is_empty());
        assert!(handler
            .registry()
            .members_except(&room("two"), ConnectionId::new())
            .is_empty());

        // b editing after a left reaches nobody
        drain(&mut rx_b);
        assert_eq!(handler.edit(b, room("one"), "solo".into()).unwrap(), 0);

        // rooms outlive their members
        assert_eq!(handler.store().get(&room("two")), Some(DEFAULT_ROOM_TEXT));
    }

    #[test]
    fn test_disconnect_unknown_is_noop() {
        let mut handler = SyncHandler::default();
        assert!(handler.disconnect(ConnectionId::new()).is_empty());
    }

    #[test]
    fn test_messages_after_disconnect_are_ignored() {
        let mut handler = SyncHandler::default();
        let (a, _rx) = connected(&mut handler);
        handler.disconnect(a);

        assert_eq!(handler.join(a, room("r")), JoinOutcome::Ignored);
        assert!(matches!(
            handler.edit(a, room("r"), "x".into()),
            Err(ProtocolError::UnknownConnection(_))
        ));
        assert!(handler.store().is_empty());
    }

    #[test]
    fn test_phase_transitions() {
        let mut handler = SyncHandler::default();
        let (a, _rx) = connected(&mut handler);
        assert_eq!(handler.phase(a), ConnectionPhase::Unbound);

        handler.join(a, room("x"));
        assert_eq!(handler.phase(a), ConnectionPhase::Bound(vec![room("x")]));

        // Joining elsewhere keeps the first membership
        handler.join(a, room("y"));
        assert_eq!(
            handler.phase(a),
            ConnectionPhase::Bound(vec![room("x"), room("y")])
        );

        handler.disconnect(a);
        assert_eq!(handler.phase(a), ConnectionPhase::Closed);
    }

    #[test]
    fn test_edit_without_join_creates_room() {
        let mut handler = SyncHandler::default();
        let (a, _rx) = connected(&mut handler);

        handler.edit(a, room("phantom"), "ghost text".into()).unwrap();
        assert_eq!(handler.store().get(&room("phantom")), Some("ghost text"));

        // A later join sees the edited text, not the seed
        let (b, mut rx_b) = connected(&mut handler);
        assert_eq!(handler.join(b, room("phantom")), JoinOutcome::Snapshot);
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerMessage::Init { text: "ghost text".into() }]
        );
    }

    #[test]
    fn test_text_limit() {
        let mut handler = SyncHandler::default().with_text_limit(Some(4));
        let (a, _rx) = connected(&mut handler);
        handler.join(a, room("r"));

        assert!(handler.edit(a, room("r"), "1234".into()).is_ok());
        let err = handler.edit(a, room("r"), "12345".into()).unwrap_err();
        assert_eq!(err, ProtocolError::TextTooLarge { len: 5, limit: 4 });
        assert_eq!(handler.store().get(&room("r")), Some("1234"));
    }

    #[test]
    fn test_handle_counts_rejected_edits() {
        let mut handler = SyncHandler::default().with_text_limit(Some(1));
        let (a, _rx) = connected(&mut handler);

        handler.handle(a, ClientMessage::edit("r", "too long"));
        handler.reject(a, &ProtocolError::Malformed("junk".into()));

        let stats = handler.stats();
        assert_eq!(stats.messages_received, 2);
        assert_eq!(stats.messages_rejected, 2);
        assert!(handler.store().is_empty());
    }

    #[test]
    fn test_status_report() {
        let mut handler = SyncHandler::default();
        let (a, mut rx_a) = connected(&mut handler);
        let (_b, _rx_b) = connected(&mut handler);
        handler.join(a, room("r"));

        handler.handle(a, ClientMessage::Status);
        assert_eq!(
            drain(&mut rx_a),
            vec![ServerMessage::Status(StatusReport::running(1, 2))]
        );
    }

    #[test]
    fn test_sweep_idle_rooms() {
        let mut handler = SyncHandler::default();
        let (a, _rx_a) = connected(&mut handler);
        let (b, _rx_b) = connected(&mut handler);
        handler.join(a, room("left"));
        handler.join(b, room("busy"));
        handler.disconnect(a);

        let ttl = Duration::from_secs(60);
        // Not idle long enough yet
        assert!(handler.sweep_idle(Instant::now(), ttl).is_empty());

        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(handler.sweep_idle(later, ttl), vec![room("left")]);
        assert!(!handler.store().contains(&room("left")));
        assert!(handler.store().contains(&room("busy")));
        assert_eq!(handler.stats().rooms_evicted, 1);
    }

    #[test]
    fn test_rejoin_cancels_eviction() {
        let mut handler = SyncHandler::default();
        let (a, _rx_a) = connected(&mut handler);
        handler.join(a, room("r"));
        handler.disconnect(a);

        let (b, _rx_b) = connected(&mut handler);
        handler.join(b, room("r"));

        let later = Instant::now() + Duration::from_secs(3600);
        assert!(handler.sweep_idle(later, Duration::from_secs(1)).is_empty());
        assert!(handler.store().contains(&room("r")));
    }

    #[test]
    fn test_collaboration_scenario() {
        let mut handler = SyncHandler::default();
        let (client1, mut rx1) = connected(&mut handler);
        let (client2, mut rx2) = connected(&mut handler);

        assert_eq!(handler.store().get(&room("abc")), None);

        handler.handle(client1, ClientMessage::join("abc"));
        assert_eq!(handler.store().get(&room("abc")), Some(DEFAULT_ROOM_TEXT));
        assert!(drain(&mut rx1).is_empty());

        handler.handle(client2, ClientMessage::join("abc"));
        assert_eq!(
            drain(&mut rx2),
            vec![ServerMessage::Init { text: DEFAULT_ROOM_TEXT.into() }]
        );

        handler.handle(client1, ClientMessage::edit("abc", "hello"));
        assert_eq!(handler.store().get(&room("abc")), Some("hello"));
        assert_eq!(
            drain(&mut rx2),
            vec![ServerMessage::Update { text: "hello".into() }]
        );
        assert!(drain(&mut rx1).is_empty());
    }
}
