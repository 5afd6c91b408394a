use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{Path, State},
    Json,
};
use uuid::Uuid;

use crate::{messages::Message, AppResult};

use super::{gateway::Gateway, registry::Member};

#[debug_handler(state = crate::AppState)]
pub(crate) async fn members(
    Path(room_name): Path<String>,
    State(gateway): State<Arc<Gateway>>,
) -> Json<Vec<Member>> {
    Json(gateway.rooms().members_of(&room_name))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn messages(
    Path(room_name): Path<String>,
    State(gateway): State<Arc<Gateway>>,
) -> AppResult<Json<Vec<Message>>> {
    Ok(Json(gateway.store().history(&room_name).await?))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn readers(
    Path(message_id): Path<Uuid>,
    State(gateway): State<Arc<Gateway>>,
) -> AppResult<Json<Vec<String>>> {
    Ok(Json(gateway.receipts().readers_of(gateway.store(), message_id).await?))
}
