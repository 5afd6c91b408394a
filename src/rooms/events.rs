use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::messages::Message;

use super::registry::Member;

/// Frames a client may send: `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    JoinRoom {
        #[serde(default)]
        room_name: String,
        #[serde(default)]
        username: String,
        #[serde(default)]
        avatar_ref: Option<String>,
        #[serde(default)]
        passkey: Option<String>,
    },
    ChatMessage {
        #[serde(default)]
        room_name: String,
        #[serde(default)]
        user: String,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        avatar_ref: Option<String>,
        #[serde(default)]
        image_ref: Option<String>,
    },
    MessageRead {
        message_id: Uuid,
        #[serde(default)]
        room_name: String,
        #[serde(default)]
        username: String,
    },
    Typing {
        #[serde(default)]
        room_name: String,
        #[serde(default)]
        username: String,
    },
    StopTyping {
        #[serde(default)]
        room_name: String,
        #[serde(default)]
        username: String,
    },
}

/// Frames pushed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    JoinedRoom {
        room_name: String,
        messages: Vec<Message>,
    },
    JoinError {
        message: String,
    },
    UsersList(Vec<Member>),
    ChatMessage(Message),
    ReadReceipt {
        message_id: Uuid,
        read_by: Vec<String>,
    },
    UserTyping {
        username: String,
    },
    UserStopTyping {
        username: String,
    },
    Error {
        message: String,
    },
}
