use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::{
    error::{ChatError, ChatResult},
    messages::NewMessage,
};

use super::{
    events::ServerEvent,
    gateway::{Connection, Gateway},
};

impl Gateway {
    pub(crate) async fn send_message(
        &self,
        conn: &Connection,
        room_name: &str,
        user: &str,
        text: Option<String>,
        avatar_ref: Option<String>,
        image_ref: Option<String>,
    ) -> ChatResult<()> {
        let Some(session) = conn.session() else {
            return Err(ChatError::validation("join a room before sending messages"));
        };
        let room_name = room_name.trim();
        if room_name.is_empty() || room_name != session.room.name() {
            return Err(ChatError::validation(format!("not a member of room {room_name:?}")));
        }
        let user = user.trim();
        if user.is_empty() {
            return Err(ChatError::validation("username is required"));
        }

        let text = text.unwrap_or_default();
        let image_ref = self.blobs.intern(image_ref).await?;
        if text.trim().is_empty() && image_ref.is_none() {
            return Err(ChatError::validation("message has no content"));
        }
        let avatar_ref = self
            .blobs
            .intern(avatar_ref)
            .await?
            .or_else(|| session.member.avatar_ref.clone());

        let room = session.room.clone();
        let _serial = room.serialize().await;

        let message = self
            .store
            .append(NewMessage {
                room_name: room_name.to_owned(),
                user: user.to_owned(),
                avatar_ref,
                text,
                image_ref,
            })
            .await?;

        let delivered = room
            .lock()
            .broadcast(Arc::new(ServerEvent::ChatMessage(message)), None);
        debug!(connection = conn.id(), room = room_name, delivered, "message broadcast");
        Ok(())
    }

    pub(crate) async fn mark_read(&self, conn: &Connection, message_id: Uuid, username: &str) -> ChatResult<()> {
        let Some(session) = conn.session() else {
            return Err(ChatError::validation("join a room before marking messages read"));
        };
        let username = username.trim();
        if username.is_empty() {
            return Err(ChatError::validation("username is required"));
        }

        // the stored room decides, not whatever the client claimed
        let Some(state) = self.store.read_state(message_id).await? else {
            return Err(ChatError::message_not_found(message_id));
        };
        if state.room_name != session.room.name() {
            return Err(ChatError::validation(format!(
                "message {message_id} is not in room {:?}",
                session.room.name()
            )));
        }

        let room = &session.room;
        self.receipts
            .record_read(&self.store, message_id, username, |state| {
                room.lock().broadcast(
                    Arc::new(ServerEvent::ReadReceipt {
                        message_id,
                        read_by: state.read_by.clone(),
                    }),
                    None,
                );
            })
            .await?;
        Ok(())
    }
}
