use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info};

use super::{
    events::{ClientEvent, ServerEvent},
    gateway::Gateway,
};

#[debug_handler(state = crate::AppState)]
pub async fn room_ws(
    State(gateway): State<Arc<Gateway>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |stream| serve(gateway, stream))
}

async fn serve(gateway: Arc<Gateway>, stream: WebSocket) {
    let (mut conn, mut rx) = gateway.connect();
    let (mut sender, mut receiver) = stream.split();
    info!(connection = conn.id(), "socket open");

    let mut writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&*event) {
                Ok(text) => text,
                Err(err) => {
                    debug!(error = %err, "unserializable event skipped");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientEvent>(text.as_str()) {
                    Ok(event) => gateway.handle(&mut conn, event).await,
                    Err(err) => {
                        debug!(connection = conn.id(), error = %err, "malformed frame");
                        conn.reply(ServerEvent::Error {
                            message: format!("malformed event: {err}"),
                        });
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    debug!(connection = conn.id(), error = %err, "socket error");
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    gateway.disconnect(&mut conn);
    writer.abort();
    info!(connection = conn.id(), "socket closed");
}
