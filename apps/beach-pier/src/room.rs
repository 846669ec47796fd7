use std::collections::HashMap;

use serde::Serialize;

use crate::connection::{Connection, ConnectionId};
use crate::namespace::Namespace;

/// One room: an optional primary and any number of observers.
#[derive(Debug)]
pub struct Room {
    id: String,
    pub(crate) primary: Option<Connection>,
    pub(crate) observers: HashMap<ConnectionId, Connection>,
}

impl Room {
    fn new(id: String) -> Self {
        Self {
            id,
            primary: None,
            observers: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn primary(&self) -> Option<&Connection> {
        self.primary.as_ref()
    }

    pub fn observers(&self) -> impl Iterator<Item = &Connection> {
        self.observers.values()
    }

    pub fn observer(&self, id: ConnectionId) -> Option<&Connection> {
        self.observers.get(&id)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn primary_online(&self) -> bool {
        self.primary.as_ref().is_some_and(Connection::is_live)
    }

    pub fn is_primary(&self, id: ConnectionId) -> bool {
        self.primary.as_ref().is_some_and(|conn| conn.id() == id)
    }

    /// Mutable access to whichever member carries `id`.
    pub fn member_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        match self.primary.as_mut() {
            Some(primary) if primary.id() == id => Some(primary),
            _ => self.observers.get_mut(&id),
        }
    }

    pub fn members_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.primary.iter_mut().chain(self.observers.values_mut())
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_none() && self.observers.is_empty()
    }

    pub fn connection_count(&self) -> usize {
        usize::from(self.primary.is_some()) + self.observers.len()
    }
}

/// Rooms of a single namespace, keyed by id. Rooms exist only while they have
/// at least one member.
#[derive(Debug)]
pub struct RoomRegistry {
    namespace: Namespace,
    rooms: HashMap<String, Room>,
}

impl RoomRegistry {
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            rooms: HashMap::new(),
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn get_or_create(&mut self, id: &str) -> &mut Room {
        self.rooms
            .entry(id.to_owned())
            .or_insert_with(|| Room::new(id.to_owned()))
    }

    pub fn get(&self, id: &str) -> Option<&Room> {
        self.rooms.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Room> {
        self.rooms.get_mut(id)
    }

    /// Drop the room if nobody is left in it. Returns whether it was removed.
    pub fn release_if_empty(&mut self, id: &str) -> bool {
        if self.rooms.get(id).is_some_and(Room::is_empty) {
            self.rooms.remove(id);
            return true;
        }
        false
    }

    pub fn rooms(&self) -> impl Iterator<Item = &Room> {
        self.rooms.values()
    }

    pub fn rooms_mut(&mut self) -> impl Iterator<Item = &mut Room> {
        self.rooms.values_mut()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn connection_count(&self) -> usize {
        self.rooms.values().map(Room::connection_count).sum()
    }

    pub fn snapshot(&self) -> Vec<RoomSnapshot> {
        let mut rooms: Vec<RoomSnapshot> = self
            .rooms
            .values()
            .map(|room| RoomSnapshot {
                namespace: self.namespace,
                room_id: room.id.clone(),
                primary_online: room.primary_online(),
                observers: room.observer_count(),
            })
            .collect();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        rooms
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSnapshot {
    pub namespace: Namespace,
    pub room_id: String,
    pub primary_online: bool,
    pub observers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::{Identity, Role};

    fn observer(room: &str) -> Connection {
        let (conn, _mailbox) = Connection::open(
            ConnectionId::new(),
            Identity::new(Namespace::Control, Role::Observer, room),
        );
        conn
    }

    #[test_timeout::timeout]
    fn get_or_create_reuses_existing_room() {
        let mut registry = RoomRegistry::new(Namespace::Control);
        let conn = observer("a");
        let id = conn.id();
        registry.get_or_create("a").observers.insert(id, conn);

        let room = registry.get_or_create("a");
        assert!(room.observer(id).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test_timeout::timeout]
    fn release_keeps_occupied_rooms() {
        let mut registry = RoomRegistry::new(Namespace::Control);
        let conn = observer("a");
        registry.get_or_create("a").observers.insert(conn.id(), conn);

        assert!(!registry.release_if_empty("a"));
        assert!(registry.get("a").is_some());
    }

    #[test_timeout::timeout]
    fn release_removes_empty_rooms_and_ignores_unknown_ids() {
        let mut registry = RoomRegistry::new(Namespace::Signal);
        registry.get_or_create("a");
        assert!(registry.release_if_empty("a"));
        assert!(registry.is_empty());
        assert!(!registry.release_if_empty("a"));
        assert!(!registry.release_if_empty("never-seen"));
    }

    #[test_timeout::timeout]
    fn snapshot_is_sorted_by_room_id() {
        let mut registry = RoomRegistry::new(Namespace::Control);
        for id in ["b", "a"] {
            let conn = observer(id);
            registry.get_or_create(id).observers.insert(conn.id(), conn);
        }
        let ids: Vec<_> = registry
            .snapshot()
            .into_iter()
            .map(|room| room.room_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
