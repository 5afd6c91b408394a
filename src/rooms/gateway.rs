//! Connection state machine and event routing.
//!
//! A connection starts `Connected`, becomes `Joined` after a successful
//! `joinRoom` and ends `Disconnected`. Everything a single connection does
//! is handled to completion before its next event is read.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::{
    blobs::BlobStore,
    error::{ChatError, ChatResult},
    messages::MessageStore,
    receipts::ReceiptTracker,
};

use super::{
    events::{ClientEvent, ServerEvent},
    policy::{JoinPolicy, JoinRequest},
    presence::Presence,
    registry::{ConnectionId, Member, Outbox, Room, RoomRegistry},
};

pub struct Session {
    pub room: Arc<Room>,
    pub member: Member,
}

pub enum ConnectionState {
    Connected,
    Joined(Session),
    Disconnected,
}

pub struct Connection {
    id: ConnectionId,
    outbox: Outbox,
    state: ConnectionState,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn room_name(&self) -> Option<&str> {
        match &self.state {
            ConnectionState::Joined(session) => Some(session.room.name()),
            _ => None,
        }
    }

    pub fn is_joined(&self) -> bool {
        matches!(self.state, ConnectionState::Joined(_))
    }

    /// Sends `event` to this connection only.
    pub fn reply(&self, event: ServerEvent) {
        match self.outbox.try_send(Arc::new(event)) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => warn!(connection = self.id, "outbox full, dropping reply"),
        }
    }

    pub(crate) fn session(&self) -> Option<&Session> {
        match &self.state {
            ConnectionState::Joined(session) => Some(session),
            _ => None,
        }
    }
}

pub struct Gateway {
    pub(crate) store: MessageStore,
    pub(crate) blobs: BlobStore,
    pub(crate) rooms: RoomRegistry,
    pub(crate) presence: Presence,
    pub(crate) receipts: ReceiptTracker,
    policy: Arc<dyn JoinPolicy>,
    outbox_capacity: usize,
    next_connection: AtomicU64,
}

impl Gateway {
    pub fn new(store: MessageStore, blobs: BlobStore, policy: Arc<dyn JoinPolicy>, outbox_capacity: usize) -> Self {
        Self {
            store,
            blobs,
            rooms: RoomRegistry::new(),
            presence: Presence,
            receipts: ReceiptTracker::new(),
            policy,
            outbox_capacity: outbox_capacity.max(1),
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn receipts(&self) -> &ReceiptTracker {
        &self.receipts
    }

    /// Registers a new connection. The receiver yields everything the
    /// gateway pushes to it.
    pub fn connect(&self) -> (Connection, mpsc::Receiver<Arc<ServerEvent>>) {
        let (outbox, rx) = mpsc::channel(self.outbox_capacity);
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        debug!(connection = id, "connected");
        (
            Connection {
                id,
                outbox,
                state: ConnectionState::Connected,
            },
            rx,
        )
    }

    pub async fn handle(&self, conn: &mut Connection, event: ClientEvent) {
        if matches!(conn.state, ConnectionState::Disconnected) {
            debug!(connection = conn.id, "event after disconnect ignored");
            return;
        }

        match event {
            ClientEvent::JoinRoom { room_name, username, avatar_ref, passkey } => {
                if let Err(err) = self.join(conn, &room_name, &username, avatar_ref, passkey.as_deref()).await {
                    warn!(connection = conn.id, room = %room_name, error = %err, "join failed");
                    conn.reply(ServerEvent::JoinError {
                        message: err.client_message(),
                    });
                }
            }
            ClientEvent::ChatMessage { room_name, user, text, avatar_ref, image_ref } => {
                if let Err(err) = self.send_message(conn, &room_name, &user, text, avatar_ref, image_ref).await {
                    warn!(connection = conn.id, room = %room_name, error = %err, "message rejected");
                    conn.reply(ServerEvent::Error {
                        message: err.client_message(),
                    });
                }
            }
            ClientEvent::MessageRead { message_id, room_name, username } => {
                match self.mark_read(conn, message_id, &username).await {
                    Ok(()) => {}
                    Err(ChatError::NotFound(what)) => {
                        debug!(connection = conn.id, room = %room_name, "read receipt for {what} dropped");
                    }
                    Err(err) => {
                        warn!(connection = conn.id, %message_id, error = %err, "read receipt failed");
                        conn.reply(ServerEvent::Error {
                            message: err.client_message(),
                        });
                    }
                }
            }
            ClientEvent::Typing { room_name, username } => self.typing(conn, &room_name, &username, true),
            ClientEvent::StopTyping { room_name, username } => self.typing(conn, &room_name, &username, false),
        }
    }

    async fn join(
        &self,
        conn: &mut Connection,
        room_name: &str,
        username: &str,
        avatar_ref: Option<String>,
        passkey: Option<&str>,
    ) -> ChatResult<()> {
        let room_name = room_name.trim();
        let username = username.trim();
        if room_name.is_empty() || username.is_empty() {
            return Err(ChatError::validation("room name and username are required"));
        }

        self.policy.admit(&JoinRequest {
            room_name,
            username,
            passkey,
        })?;

        let avatar_ref = self.blobs.intern(avatar_ref).await?;
        let room = self.rooms.room(room_name);

        // nothing reaches the room between the history snapshot and attach
        let _serial = room.serialize().await;
        let messages = self.store.history(room_name).await?;

        if let Some(previous) = conn.session() {
            if previous.room.name() != room_name || previous.member.username != username {
                self.presence.exit(&previous.room, conn.id, &previous.member.username);
                info!(connection = conn.id, room = previous.room.name(), user = %previous.member.username, "left for another room");
            }
        }

        conn.reply(ServerEvent::JoinedRoom {
            room_name: room_name.to_owned(),
            messages,
        });

        let member = Member::new(username, avatar_ref);
        let members = self.presence.enter(&room, conn.id, conn.outbox.clone(), member.clone());
        info!(connection = conn.id, room = room_name, user = username, members = members.len(), "joined");

        conn.state = ConnectionState::Joined(Session {
            room: room.clone(),
            member,
        });
        Ok(())
    }

    fn typing(&self, conn: &Connection, room_name: &str, username: &str, active: bool) {
        let Some(session) = conn.session() else {
            debug!(connection = conn.id, "typing before join ignored");
            return;
        };
        if session.room.name() != room_name.trim() {
            debug!(connection = conn.id, room = room_name, "typing for a foreign room ignored");
            return;
        }

        let username = match username.trim() {
            "" => session.member.username.clone(),
            name => name.to_owned(),
        };
        self.presence.typing(&session.room, conn.id, username, active);
    }

    /// Tears the connection down. Only the first call has any effect.
    pub fn disconnect(&self, conn: &mut Connection) {
        let previous = std::mem::replace(&mut conn.state, ConnectionState::Disconnected);
        if let ConnectionState::Joined(session) = previous {
            let members = self.presence.exit(&session.room, conn.id, &session.member.username);
            info!(
                connection = conn.id,
                room = session.room.name(),
                user = %session.member.username,
                members = members.len(),
                "disconnected"
            );
        }
    }
}
