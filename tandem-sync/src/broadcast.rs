//! Fan-out of room updates to N-1 connections.
//!
//! Every attached connection owns a bounded outbound queue. A broadcast
//! encodes its message once and hands the shared frame to each recipient
//! with a non-blocking `try_send`, so one slow consumer never stalls the
//! hub: when its queue is full the frame is dropped for that recipient
//! and counted in [`DispatchStats::frames_dropped`].
//!
//! There is no acknowledgment and no retry. Per-connection order is the
//! order frames were queued.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::protocol::{ConnectionId, ProtocolError, RoomKey, ServerMessage};
use crate::registry::ConnectionRegistry;

/// An encoded server frame, shared between all recipients of one broadcast.
pub type Frame = Arc<str>;

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Room broadcasts performed
    pub broadcasts: u64,
    /// Frames queued on some connection
    pub frames_sent: u64,
    /// Frames lost to a full or closed queue
    pub frames_dropped: u64,
}

/// Outbound queues of every live connection.
#[derive(Debug, Default)]
pub struct Dispatcher {
    outbound: HashMap<ConnectionId, mpsc::Sender<Frame>>,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the outbound queue of a freshly accepted connection.
    pub fn attach(&mut self, conn: ConnectionId, outbound: mpsc::Sender<Frame>) {
        self.outbound.insert(conn, outbound);
    }

    /// Forget a connection's queue. Returns `false` if it was not attached.
    pub fn detach(&mut self, conn: ConnectionId) -> bool {
        self.outbound.remove(&conn).is_some()
    }

    pub fn is_attached(&self, conn: ConnectionId) -> bool {
        self.outbound.contains_key(&conn)
    }

    /// Number of attached connections.
    pub fn len(&self) -> usize {
        self.outbound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty()
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Send one message to a single connection.
    pub fn send_to(&mut self, conn: ConnectionId, msg: &ServerMessage) -> Result<bool, ProtocolError> {
        let frame: Frame = msg.encode()?.into();
        Ok(self.deliver(conn, frame))
    }

    /// Send `msg` to every member of `room_key` except `exclude`.
    ///
    /// Returns the number of connections the frame was queued on.
    pub fn broadcast(
        &mut self,
        registry: &ConnectionRegistry,
        room_key: &RoomKey,
        msg: &ServerMessage,
        exclude: ConnectionId,
    ) -> Result<usize, ProtocolError> {
        let recipients = registry.members_except(room_key, exclude);
        self.stats.broadcasts += 1;
        if recipients.is_empty() {
            return Ok(0);
        }

        let frame: Frame = msg.encode()?.into();
        let delivered = recipients
            .into_iter()
            .filter(|conn| self.deliver(*conn, frame.clone()))
            .count();
        Ok(delivered)
    }

    fn deliver(&mut self, conn: ConnectionId, frame: Frame) -> bool {
        let Some(outbound) = self.outbound.get(&conn) else {
            log::debug!("No outbound queue for connection {conn}");
            self.stats.frames_dropped += 1;
            return false;
        };

        match outbound.try_send(frame) {
            Ok(()) => {
                self.stats.frames_sent += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                log::warn!("Outbound queue full for connection {conn}, dropping frame");
                self.stats.frames_dropped += 1;
                false
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Outbound queue closed for connection {conn}");
                self.stats.frames_dropped += 1;
                false
            }
        }
    }
}
