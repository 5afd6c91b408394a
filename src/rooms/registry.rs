//! Room membership and per-room fan-out.
//!
//! Rooms are created on first use and live for the whole process. Each room
//! guards its member list and the outboxes of the connections attached to it
//! behind one lock, so a broadcast always carries a list that matches what
//! every other receiver sees.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

use super::events::ServerEvent;

pub type ConnectionId = u64;
pub type Outbox = mpsc::Sender<Arc<ServerEvent>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
}

impl Member {
    pub fn new(username: impl Into<String>, avatar_ref: Option<String>) -> Self {
        Self {
            username: username.into(),
            avatar_ref,
        }
    }
}

#[derive(Default)]
pub struct RoomState {
    members: Vec<Member>,
    outboxes: HashMap<ConnectionId, Outbox>,
}

impl RoomState {
    /// Adds or refreshes `member`; usernames stay unique.
    pub fn join(&mut self, member: Member) {
        match self.members.iter_mut().find(|m| m.username == member.username) {
            Some(existing) => existing.avatar_ref = member.avatar_ref,
            None => self.members.push(member),
        }
    }

    pub fn leave(&mut self, username: &str) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m.username != username);
        self.members.len() != before
    }

    pub fn members(&self) -> Vec<Member> {
        self.members.clone()
    }

    pub fn attach(&mut self, connection: ConnectionId, outbox: Outbox) {
        self.outboxes.insert(connection, outbox);
    }

    pub fn detach(&mut self, connection: ConnectionId) -> bool {
        self.outboxes.remove(&connection).is_some()
    }

    #[cfg(test)]
    fn connection_count(&self) -> usize {
        self.outboxes.len()
    }

    /// Queues `event` for every attached connection except `skip`.
    /// Returns how many outboxes accepted it.
    pub fn broadcast(&mut self, event: Arc<ServerEvent>, skip: Option<ConnectionId>) -> usize {
        let mut delivered = 0;
        self.outboxes.retain(|&connection, outbox| {
            if Some(connection) == skip {
                return true;
            }
            match outbox.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(connection, "outbox full, dropping event");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
        delivered
    }
}

pub struct Room {
    name: String,
    state: Mutex<RoomState>,
    serial: tokio::sync::Mutex<()>,
}

impl Room {
    fn new(name: String) -> Self {
        Self {
            name,
            state: Mutex::new(RoomState::default()),
            serial: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Held across store I/O that must line up with the live feed
    /// (history + attach on join, append + broadcast on send).
    pub async fn serialize(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.serial.lock().await
    }
}

#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<DashMap<String, Arc<Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up `name`, creating the room on first use.
    pub fn room(&self, name: &str) -> Arc<Room> {
        if let Some(room) = self.rooms.get(name) {
            return room.clone();
        }
        self.rooms
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(Room::new(name.to_owned())))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.get(name).map(|room| room.clone())
    }

    pub fn join(&self, room_name: &str, username: &str, avatar_ref: Option<String>) -> Vec<Member> {
        let room = self.room(room_name);
        let mut state = room.lock();
        state.join(Member::new(username, avatar_ref));
        state.members()
    }

    pub fn leave(&self, room_name: &str, username: &str) -> Vec<Member> {
        let Some(room) = self.get(room_name) else {
            return Vec::new();
        };
        let mut state = room.lock();
        state.leave(username);
        state.members()
    }

    pub fn members_of(&self, room_name: &str) -> Vec<Member> {
        self.get(room_name)
            .map(|room| room.lock().members())
            .unwrap_or_default()
    }

    /// Avatar references of everyone currently in a room.
    pub fn avatar_refs(&self) -> Vec<String> {
        let rooms: Vec<Arc<Room>> = self.rooms.iter().map(|entry| entry.value().clone()).collect();
        rooms
            .iter()
            .flat_map(|room| {
                room.lock()
                    .members
                    .iter()
                    .filter_map(|m| m.avatar_ref.clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[cfg(test)]
    fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(members: &[Member]) -> Vec<&str> {
        members.iter().map(|m| m.username.as_str()).collect()
    }

    #[test]
    fn join_is_idempotent_per_username() {
        let rooms = RoomRegistry::new();
        rooms.join("lobby", "alice", None);
        rooms.join("lobby", "alice", None);
        let members = rooms.join("lobby", "alice", Some("/blobs/a".into()));

        assert_eq!(names(&members), vec!["alice"]);
        assert_eq!(members[0].avatar_ref.as_deref(), Some("/blobs/a"));
        assert_eq!(rooms.room_count(), 1);
    }

    #[test]
    fn leave_is_a_noop_for_strangers() {
        let rooms = RoomRegistry::new();
        rooms.join("lobby", "alice", None);
        rooms.join("lobby", "bob", None);

        assert_eq!(names(&rooms.leave("lobby", "carol")), vec!["alice", "bob"]);
        assert_eq!(names(&rooms.leave("lobby", "alice")), vec!["bob"]);
        assert!(rooms.leave("attic", "alice").is_empty());
        assert_eq!(names(&rooms.members_of("lobby")), vec!["bob"]);
    }

    #[test]
    fn empty_rooms_persist() {
        let rooms = RoomRegistry::new();
        rooms.join("lobby", "alice", None);
        rooms.leave("lobby", "alice");
        assert!(rooms.get("lobby").is_some());
        assert!(rooms.members_of("lobby").is_empty());
        assert!(rooms.members_of("nowhere").is_empty());
    }

    #[test]
    fn avatar_refs_cover_every_room() {
        let rooms = RoomRegistry::new();
        rooms.join("lobby", "alice", Some("/blobs/a".into()));
        rooms.join("attic", "bob", None);
        rooms.join("attic", "carol", Some("https://cdn.example/c.png".into()));

        let mut refs = rooms.avatar_refs();
        refs.sort();
        assert_eq!(refs, vec!["/blobs/a", "https://cdn.example/c.png"]);
    }

    #[tokio::test]
    async fn broadcast_skips_origin_and_prunes_closed() {
        let rooms = RoomRegistry::new();
        let room = rooms.room("lobby");
        let (alice_tx, mut alice_rx) = mpsc::channel(4);
        let (bob_tx, mut bob_rx) = mpsc::channel(4);
        let (gone_tx, gone_rx) = mpsc::channel(4);
        drop(gone_rx);

        let mut state = room.lock();
        state.attach(1, alice_tx);
        state.attach(2, bob_tx);
        state.attach(3, gone_tx);

        let event = Arc::new(ServerEvent::UserTyping {
            username: "alice".into(),
        });
        assert_eq!(state.broadcast(event, Some(1)), 1);
        assert_eq!(state.connection_count(), 2);
        drop(state);

        assert!(alice_rx.try_recv().is_err());
        assert!(matches!(
            bob_rx.try_recv().as_deref(),
            Ok(ServerEvent::UserTyping { username }) if username == "alice"
        ));
    }
}
