use std::sync::Arc;

use super::{
    events::ServerEvent,
    registry::{ConnectionId, Member, Outbox, Room},
};

/// Join/leave announcements and typing notices.
///
/// Every change to a member list and the `usersList` push describing it
/// happen under the same room lock.
#[derive(Clone, Copy, Default)]
pub struct Presence;

impl Presence {
    pub fn enter(&self, room: &Room, connection: ConnectionId, outbox: Outbox, member: Member) -> Vec<Member> {
        let mut state = room.lock();
        state.attach(connection, outbox);
        state.join(member);
        let members = state.members();
        state.broadcast(Arc::new(ServerEvent::UsersList(members.clone())), None);
        members
    }

    pub fn exit(&self, room: &Room, connection: ConnectionId, username: &str) -> Vec<Member> {
        let mut state = room.lock();
        state.detach(connection);
        state.leave(username);
        let members = state.members();
        state.broadcast(Arc::new(ServerEvent::UsersList(members.clone())), None);
        members
    }

    /// Tells everyone but `origin` that `username` started or stopped typing.
    pub fn typing(&self, room: &Room, origin: ConnectionId, username: String, active: bool) {
        let event = if active {
            ServerEvent::UserTyping { username }
        } else {
            ServerEvent::UserStopTyping { username }
        };
        room.lock().broadcast(Arc::new(event), Some(origin));
    }
}
