//! Session store: the authoritative text of every room.
//!
//! Rooms are created implicitly by [`SessionStore::ensure`] or
//! [`SessionStore::set`] and are only removed through
//! [`SessionStore::remove`], which the handler calls when idle-room
//! eviction is configured.

use std::collections::HashMap;

use crate::protocol::RoomKey;

/// Result of [`SessionStore::ensure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensured<'a> {
    /// The room already existed; carries its current text.
    Existing(&'a str),
    /// The room was just created with the default text.
    Created(&'a str),
}

impl<'a> Ensured<'a> {
    pub fn text(&self) -> &'a str {
        match self {
            Self::Existing(text) | Self::Created(text) => text,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Mapping from room key to current document text.
#[derive(Debug, Default)]
pub struct SessionStore {
    rooms: HashMap<RoomKey, String>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current text of a room, or `None` if the room does not exist.
    pub fn get(&self, room_key: &RoomKey) -> Option<&str> {
        self.rooms.get(room_key).map(String::as_str)
    }

    /// Replace a room's text unconditionally. Returns `true` if the room was created.
    pub fn set(&mut self, room_key: RoomKey, text: String) -> bool {
        self.rooms.insert(room_key, text).is_none()
    }

    /// Return the room's text, creating the room with `default_text` first if absent.
    pub fn ensure(&mut self, room_key: &RoomKey, default_text: &str) -> Ensured<'_> {
        use std::collections::hash_map::Entry;

        match self.rooms.entry(room_key.clone()) {
            Entry::Occupied(entry) => Ensured::Existing(entry.into_mut().as_str()),
            Entry::Vacant(entry) => Ensured::Created(entry.insert(default_text.to_owned()).as_str()),
        }
    }

    pub fn remove(&mut self, room_key: &RoomKey) -> Option<String> {
        self.rooms.remove(room_key)
    }

    pub fn contains(&self, room_key: &RoomKey) -> bool {
        self.rooms.contains_key(room_key)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_absent_room() {
        let store = SessionStore::new();
        assert_eq!(store.get(&RoomKey::from("nope")), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_ensure_seeds_once() {
        let mut store = SessionStore::new();
        let room = RoomKey::from("abc");

        let first = store.ensure(&room, "seed");
        assert_eq!(first, Ensured::Created("seed"));

        let second = store.ensure(&room, "other seed");
        assert_eq!(second, Ensured::Existing("seed"));
        assert!(!second.was_created());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_set_creates_and_overwrites() {
        let mut store = SessionStore::new();
        let room = RoomKey::from("abc");

        assert!(store.set(room.clone(), "one".into()));
        assert!(!store.set(room.clone(), "two".into()));
        assert_eq!(store.get(&room), Some("two"));
    }

    #[test]
    fn test_set_is_idempotent() {
        let mut store = SessionStore::new();
        let room = RoomKey::from("r");

        store.set(room.clone(), "x".into());
        store.set(room.clone(), "x".into());
        assert_eq!(store.get(&room), Some("x"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_ensure_after_set_returns_existing() {
        let mut store = SessionStore::new();
        let room = RoomKey::from("r");
        store.set(room.clone(), "typed".into());

        assert_eq!(store.ensure(&room, "seed").text(), "typed");
    }

    #[test]
    fn test_remove() {
        let mut store = SessionStore::new();
        let room = RoomKey::from("r");
        store.set(room.clone(), "x".into());

        assert_eq!(store.remove(&room).as_deref(), Some("x"));
        assert!(!store.contains(&room));
        assert_eq!(store.remove(&room), None);
    }
}
