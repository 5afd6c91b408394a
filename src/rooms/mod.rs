mod gateway;
mod msg;
mod presence;
mod registry;
mod room;
mod ws;

pub mod events;
pub mod policy;

use axum::{routing::get, Router};

use crate::AppState;

pub use events::{ClientEvent, ServerEvent};
pub use gateway::{Connection, ConnectionState, Gateway, Session};
pub use presence::Presence;
pub use registry::{ConnectionId, Member, Outbox, Room, RoomRegistry, RoomState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{room}/members", get(room::members))
        .route("/{room}/messages", get(room::messages))
}

pub fn message_router() -> Router<AppState> {
    Router::new().route("/{id}/readers", get(room::readers))
}

pub fn ws_router() -> Router<AppState> {
    Router::new().route("/ws", get(ws::room_ws))
}
