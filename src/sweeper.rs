use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{info, warn};

use crate::{db, error::ChatResult, rooms::Gateway};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub messages: usize,
    pub blobs: u64,
}

/// Runs `sweep` every `every` until the handle is aborted.
pub fn spawn(gateway: Arc<Gateway>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match sweep(&gateway).await {
                Ok(report) if report != SweepReport::default() => {
                    info!(messages = report.messages, blobs = report.blobs, "expired records purged");
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "expiry sweep failed"),
            }
        }
    })
}

pub async fn sweep(gateway: &Gateway) -> ChatResult<SweepReport> {
    sweep_at(gateway, db::now_millis()).await
}

pub(crate) async fn sweep_at(gateway: &Gateway, now: i64) -> ChatResult<SweepReport> {
    let expired = gateway.store.purge_expired_at(now).await?;
    gateway.receipts.forget(&expired);

    // avatars shown in a members list stay resolvable while their owner is present
    gateway.blobs.touch_at(&gateway.rooms.avatar_refs(), now).await?;
    let blobs = gateway.blobs.purge_expired_at(now).await?;

    Ok(SweepReport {
        messages: expired.len(),
        blobs,
    })
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use sqlx::SqlitePool;

    use crate::{
        blobs::BlobStore,
        messages::{MessageStore, TTL_MILLIS},
        rooms::{policy::OpenPolicy, ClientEvent},
    };

    use super::*;

    const HOUR: i64 = 60 * 60 * 1000;

    async fn gateway() -> (Gateway, SqlitePool) {
        let db_pool = db::connect_in_memory().await.unwrap();
        let gateway = Gateway::new(
            MessageStore::new(db_pool.clone()),
            BlobStore::new(db_pool.clone(), 1024),
            Arc::new(OpenPolicy),
            16,
        );
        (gateway, db_pool)
    }

    fn join(avatar_ref: Option<String>) -> ClientEvent {
        ClientEvent::JoinRoom {
            room_name: "lobby".into(),
            username: "alice".into(),
            avatar_ref,
            passkey: None,
        }
    }

    fn say(text: &str) -> ClientEvent {
        ClientEvent::ChatMessage {
            room_name: "lobby".into(),
            user: "alice".into(),
            text: Some(text.into()),
            avatar_ref: None,
            image_ref: None,
        }
    }

    fn inline_avatar() -> Option<String> {
        Some(format!("data:image/png;base64,{}", STANDARD.encode(b"alice's face")))
    }

    fn avatar_id(gateway: &Gateway) -> String {
        let members = gateway.rooms().members_of("lobby");
        let reference = members[0].avatar_ref.as_deref().unwrap();
        reference.trim_start_matches("/blobs/").to_owned()
    }

    #[tokio::test]
    async fn sweep_purges_messages_and_receipts() {
        let (gateway, _db_pool) = gateway().await;

        let (mut alice, _rx) = gateway.connect();
        gateway.handle(&mut alice, join(None)).await;
        gateway.handle(&mut alice, say("hi")).await;

        let history = gateway.store().history("lobby").await.unwrap();
        let id = history[0].id;
        gateway
            .handle(&mut alice, ClientEvent::MessageRead {
                message_id: id,
                room_name: "lobby".into(),
                username: "alice".into(),
            })
            .await;
        let readers = gateway.receipts().readers_of(gateway.store(), id).await.unwrap();
        assert_eq!(readers, vec!["alice"]);

        let now = db::now_millis();
        assert_eq!(sweep_at(&gateway, now).await.unwrap(), SweepReport::default());

        let report = sweep_at(&gateway, now + TTL_MILLIS + 60_000).await.unwrap();
        assert_eq!(report.messages, 1);
        assert!(gateway.receipts().readers_of(gateway.store(), id).await.unwrap().is_empty());
        assert!(gateway.store().history("lobby").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn avatars_on_live_messages_survive() {
        let (gateway, db_pool) = gateway().await;
        let (mut alice, _rx) = gateway.connect();
        gateway.handle(&mut alice, join(inline_avatar())).await;
        let blob = avatar_id(&gateway);

        // interned long ago, reused by a fresh message
        let now = db::now_millis();
        sqlx::query("UPDATE blobs SET last_used_at=?")
            .bind(now - 23 * HOUR)
            .execute(&db_pool)
            .await
            .unwrap();
        gateway.handle(&mut alice, say("still here")).await;
        gateway.disconnect(&mut alice);

        let report = sweep_at(&gateway, now + 2 * HOUR).await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert!(gateway.blobs().fetch(&blob).await.unwrap().is_some());

        let report = sweep_at(&gateway, now + TTL_MILLIS + 60_000).await.unwrap();
        assert_eq!(report, SweepReport { messages: 1, blobs: 1 });
        assert!(gateway.blobs().fetch(&blob).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn avatars_of_present_members_survive() {
        let (gateway, _db_pool) = gateway().await;
        let (mut alice, _rx) = gateway.connect();
        gateway.handle(&mut alice, join(inline_avatar())).await;
        let blob = avatar_id(&gateway);

        let now = db::now_millis();
        assert_eq!(sweep_at(&gateway, now + TTL_MILLIS + 60_000).await.unwrap().blobs, 0);
        assert!(gateway.blobs().fetch(&blob).await.unwrap().is_some());

        gateway.disconnect(&mut alice);
        assert_eq!(sweep_at(&gateway, now + 3 * TTL_MILLIS).await.unwrap().blobs, 1);
    }
}
