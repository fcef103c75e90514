//! Connection registry: which connection is a member of which room.
//!
//! Membership is additive. Joining a second room keeps the first, and a
//! connection only loses its memberships when it disconnects.

use std::collections::{BTreeSet, HashMap};

use crate::protocol::{ConnectionId, RoomKey};

/// Bidirectional connection ↔ room membership index.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    memberships: HashMap<ConnectionId, BTreeSet<RoomKey>>,
    members: HashMap<RoomKey, BTreeSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` to `room_key`. Returns `false` if it was already a member.
    pub fn join(&mut self, conn: ConnectionId, room_key: RoomKey) -> bool {
        let added = self
            .members
            .entry(room_key.clone())
            .or_default()
            .insert(conn);
        self.memberships.entry(conn).or_default().insert(room_key);
        added
    }

    /// Drop every membership of `conn`, returning the rooms it was in.
    ///
    /// Unknown connections are a no-op.
    pub fn leave(&mut self, conn: ConnectionId) -> Vec<RoomKey> {
        let Some(rooms) = self.memberships.remove(&conn) else {
            return Vec::new();
        };

        for room_key in &rooms {
            if let Some(members) = self.members.get_mut(room_key) {
                members.remove(&conn);
                if members.is_empty() {
                    self.members.remove(room_key);
                }
            }
        }
        rooms.into_iter().collect()
    }

    /// Members of `room_key` other than `exclude`.
    pub fn members_except(&self, room_key: &RoomKey, exclude: ConnectionId) -> Vec<ConnectionId> {
        self.members
            .get(room_key)
            .map(|members| members.iter().copied().filter(|c| *c != exclude).collect())
            .unwrap_or_default()
    }

    pub fn member_count(&self, room_key: &RoomKey) -> usize {
        self.members.get(room_key).map_or(0, BTreeSet::len)
    }

    pub fn is_member(&self, conn: ConnectionId, room_key: &RoomKey) -> bool {
        self.memberships
            .get(&conn)
            .is_some_and(|rooms| rooms.contains(room_key))
    }

    /// Rooms `conn` currently belongs to, in key order.
    pub fn rooms_of(&self, conn: ConnectionId) -> Vec<RoomKey> {
        self.memberships
            .get(&conn)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of connections holding at least one membership.
    pub fn connection_count(&self) -> usize {
        self.memberships.len()
    }

    /// Number of rooms with at least one member.
    pub fn occupied_rooms(&self) -> usize {
        self.members.len()
    }
}
