//! Room membership
//!
//! Every bound connection is a member of exactly one broadcast room.
//! Rooms are created on first join and kept until the process exits.

use std::collections::{HashMap, HashSet};

use crate::types::{ClientId, RoomName, UserHandle};

/// Outcome of a join, for the caller to announce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    /// Room the connection was in before, if any
    pub previous: Option<RoomName>,
    /// Room the connection is in now
    pub current: RoomName,
    /// Whether `current` was created by this join
    pub created: bool,
}

/// Rooms and who is in them
#[derive(Debug)]
pub struct RoomManager {
    /// Room -> member connections
    rooms: HashMap<RoomName, HashSet<ClientId>>,
    /// Room names in creation order
    order: Vec<RoomName>,
    /// Connection -> its current room
    memberships: HashMap<ClientId, RoomName>,
}

impl RoomManager {
    /// Create a manager with `default_room` already present
    pub fn new(default_room: RoomName) -> Self {
        let mut manager = Self {
            rooms: HashMap::new(),
            order: Vec::new(),
            memberships: HashMap::new(),
        };
        manager.ensure_room(&default_room);
        manager
    }

    /// Move a user into `room`, leaving whatever room they were in
    pub fn join(&mut self, user: &UserHandle, room: RoomName) -> MembershipChange {
        let previous = self.leave(user.client_id);
        let created = self.ensure_room(&room);

        if let Some(members) = self.rooms.get_mut(&room) {
            members.insert(user.client_id);
        }
        self.memberships.insert(user.client_id, room.clone());

        MembershipChange {
            previous,
            current: room,
            created,
        }
    }

    /// Remove a connection from its room; returns the room it left
    pub fn leave(&mut self, client_id: ClientId) -> Option<RoomName> {
        let room = self.memberships.remove(&client_id)?;
        if let Some(members) = self.rooms.get_mut(&room) {
            members.remove(&client_id);
        }
        Some(room)
    }

    /// Member connections of a room (empty if the room does not exist)
    pub fn members(&self, room: &RoomName) -> HashSet<ClientId> {
        self.rooms.get(room).cloned().unwrap_or_default()
    }

    pub fn current_room(&self, client_id: ClientId) -> Option<&RoomName> {
        self.memberships.get(&client_id)
    }

    /// Room names in creation order
    pub fn list_rooms(&self) -> Vec<String> {
        self.order.iter().map(|r| r.0.clone()).collect()
    }

    /// Returns true if the room had to be created
    fn ensure_room(&mut self, name: &RoomName) -> bool {
        if self.rooms.contains_key(name) {
            return false;
        }
        self.rooms.insert(name.clone(), HashSet::new());
        self.order.push(name.clone());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(name: &str) -> RoomName {
        RoomName(name.to_string())
    }

    fn user(name: &str) -> UserHandle {
        UserHandle::new(ClientId::new(), name)
    }

    #[test]
    fn test_default_room_exists() {
        let manager = RoomManager::new(room("general"));
        assert_eq!(manager.list_rooms(), vec!["general"]);
        assert!(manager.members(&room("general")).is_empty());
    }

    #[test]
    fn test_first_join() {
        let mut manager = RoomManager::new(room("general"));
        let alice = user("Alice");

        let change = manager.join(&alice, room("general"));
        assert_eq!(change.previous, None);
        assert_eq!(change.current, room("general"));
        assert!(!change.created);
        assert_eq!(manager.members(&room("general")), HashSet::from([alice.client_id]));
    }

    #[test]
    fn test_join_moves_between_rooms() {
        let mut manager = RoomManager::new(room("general"));
        let alice = user("Alice");
        manager.join(&alice, room("general"));

        let change = manager.join(&alice, room("rust"));
        assert_eq!(change.previous, Some(room("general")));
        assert!(change.created);
        assert!(!manager.members(&room("general")).contains(&alice.client_id));
        assert!(manager.members(&room("rust")).contains(&alice.client_id));
        assert_eq!(manager.current_room(alice.client_id), Some(&room("rust")));
    }

    #[test]
    fn test_never_in_two_rooms() {
        let mut manager = RoomManager::new(room("general"));
        let alice = user("Alice");
        for name in ["a", "b", "c", "a", "general"] {
            manager.join(&alice, room(name));
            let count = manager
                .list_rooms()
                .iter()
                .filter(|r| manager.members(&room(r)).contains(&alice.client_id))
                .count();
            assert_eq!(count, 1);
        }
    }

    #[test]
    fn test_rooms_listed_in_creation_order() {
        let mut manager = RoomManager::new(room("general"));
        let alice = user("Alice");
        manager.join(&alice, room("zeta"));
        manager.join(&alice, room("alpha"));
        manager.join(&alice, room("zeta"));
        assert_eq!(manager.list_rooms(), vec!["general", "zeta", "alpha"]);
    }

    #[test]
    fn test_empty_rooms_persist() {
        let mut manager = RoomManager::new(room("general"));
        let alice = user("Alice");
        manager.join(&alice, room("side"));
        assert_eq!(manager.leave(alice.client_id), Some(room("side")));

        assert!(manager.members(&room("side")).is_empty());
        assert_eq!(manager.list_rooms().len(), 2);
        assert_eq!(manager.leave(alice.client_id), None);
    }

    #[test]
    fn test_members_of_unknown_room() {
        let manager = RoomManager::new(room("general"));
        assert!(manager.members(&room("nowhere")).is_empty());
    }
}
