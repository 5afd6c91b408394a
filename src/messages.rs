use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    db::{self, from_millis},
    error::{ChatError, ChatResult},
};

/// Hard retention window for messages and blobs.
pub const TTL_MILLIS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub room_name: String,
    pub user: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub read_by: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub room_name: String,
    pub user: String,
    pub avatar_ref: Option<String>,
    pub text: String,
    pub image_ref: Option<String>,
}

/// Read-by state of one message after a `mark_read`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadState {
    pub room_name: String,
    pub read_by: Vec<String>,
}

type MessageRow = (String, String, String, String, Option<String>, Option<String>, i64);

#[derive(Clone)]
pub struct MessageStore {
    db_pool: SqlitePool,
}

impl MessageStore {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }

    pub async fn append(&self, new: NewMessage) -> ChatResult<Message> {
        self.append_at(new, db::now_millis()).await
    }

    pub(crate) async fn append_at(&self, new: NewMessage, now: i64) -> ChatResult<Message> {
        let id = Uuid::now_v7();
        let mut tx = self.db_pool.begin().await?;

        // never earlier than the newest message already in the room
        let (created_at,): (i64,) = sqlx::query_as(
            "INSERT INTO messages (id,room_name,user,text,avatar_ref,image_ref,created_at) \
             SELECT ?,?,?,?,?,?,MAX(?,COALESCE((SELECT MAX(created_at) FROM messages WHERE room_name=?),0)) \
             RETURNING created_at",
        )
        .bind(id.to_string())
        .bind(&new.room_name)
        .bind(&new.user)
        .bind(&new.text)
        .bind(&new.avatar_ref)
        .bind(&new.image_ref)
        .bind(now)
        .bind(&new.room_name)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO message_reads (message_id,username) VALUES (?,?)")
            .bind(id.to_string())
            .bind(&new.user)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Message {
            id,
            read_by: vec![new.user.clone()],
            room_name: new.room_name,
            user: new.user,
            text: new.text,
            avatar_ref: new.avatar_ref,
            image_ref: new.image_ref,
            created_at: from_millis(created_at),
        })
    }

    pub async fn history(&self, room_name: &str) -> ChatResult<Vec<Message>> {
        self.history_at(room_name, db::now_millis()).await
    }

    pub(crate) async fn history_at(&self, room_name: &str, now: i64) -> ChatResult<Vec<Message>> {
        let cutoff = now - TTL_MILLIS;

        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id,room_name,user,text,avatar_ref,image_ref,created_at FROM messages \
             WHERE room_name=? AND created_at>=? ORDER BY created_at,rowid",
        )
        .bind(room_name)
        .bind(cutoff)
        .fetch_all(&self.db_pool)
        .await?;

        let reads: Vec<(String, String)> = sqlx::query_as(
            "SELECT r.message_id,r.username FROM message_reads r \
             JOIN messages m ON m.id=r.message_id \
             WHERE m.room_name=? AND m.created_at>=? ORDER BY r.rowid",
        )
        .bind(room_name)
        .bind(cutoff)
        .fetch_all(&self.db_pool)
        .await?;

        let mut read_by: HashMap<String, Vec<String>> = HashMap::new();
        for (message_id, username) in reads {
            read_by.entry(message_id).or_default().push(username);
        }

        rows.into_iter()
            .map(|(id, room_name, user, text, avatar_ref, image_ref, created_at)| {
                let read_by = read_by.remove(&id).unwrap_or_default();
                Ok(Message {
                    id: Uuid::parse_str(&id).map_err(|e| ChatError::Persistence(sqlx::Error::Decode(e.into())))?,
                    room_name,
                    user,
                    text,
                    avatar_ref,
                    image_ref,
                    created_at: from_millis(created_at),
                    read_by,
                })
            })
            .collect()
    }

    /// Adds `username` to the read-by set. Repeats are no-ops.
    pub async fn mark_read(&self, message_id: Uuid, username: &str) -> ChatResult<ReadState> {
        self.mark_read_at(message_id, username, db::now_millis()).await
    }

    pub(crate) async fn mark_read_at(&self, message_id: Uuid, username: &str, now: i64) -> ChatResult<ReadState> {
        let mut tx = self.db_pool.begin().await?;

        let Some((room_name,)): Option<(String,)> =
            sqlx::query_as("SELECT room_name FROM messages WHERE id=? AND created_at>=?")
                .bind(message_id.to_string())
                .bind(now - TTL_MILLIS)
                .fetch_optional(&mut *tx)
                .await?
        else {
            return Err(ChatError::message_not_found(message_id));
        };

        sqlx::query("INSERT OR IGNORE INTO message_reads (message_id,username) VALUES (?,?)")
            .bind(message_id.to_string())
            .bind(username)
            .execute(&mut *tx)
            .await?;

        let read_by: Vec<(String,)> =
            sqlx::query_as("SELECT username FROM message_reads WHERE message_id=? ORDER BY rowid")
                .bind(message_id.to_string())
                .fetch_all(&mut *tx)
                .await?;

        tx.commit().await?;

        Ok(ReadState {
            room_name,
            read_by: read_by.into_iter().map(|(username,)| username).collect(),
        })
    }

    /// Current read-by set of a live message, `None` once it is unknown or expired.
    pub async fn read_state(&self, message_id: Uuid) -> ChatResult<Option<ReadState>> {
        self.read_state_at(message_id, db::now_millis()).await
    }

    pub(crate) async fn read_state_at(&self, message_id: Uuid, now: i64) -> ChatResult<Option<ReadState>> {
        let Some((room_name,)): Option<(String,)> =
            sqlx::query_as("SELECT room_name FROM messages WHERE id=? AND created_at>=?")
                .bind(message_id.to_string())
                .bind(now - TTL_MILLIS)
                .fetch_optional(&self.db_pool)
                .await?
        else {
            return Ok(None);
        };

        let read_by: Vec<(String,)> =
            sqlx::query_as("SELECT username FROM message_reads WHERE message_id=? ORDER BY rowid")
                .bind(message_id.to_string())
                .fetch_all(&self.db_pool)
                .await?;

        Ok(Some(ReadState {
            room_name,
            read_by: read_by.into_iter().map(|(username,)| username).collect(),
        }))
    }

    /// Deletes every message older than the TTL and returns their ids.
    pub(crate) async fn purge_expired_at(&self, now: i64) -> ChatResult<Vec<Uuid>> {
        let cutoff = now - TTL_MILLIS;
        let mut tx = self.db_pool.begin().await?;

        let ids: Vec<(String,)> = sqlx::query_as("SELECT id FROM messages WHERE created_at<?")
            .bind(cutoff)
            .fetch_all(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM message_reads WHERE message_id IN (SELECT id FROM messages WHERE created_at<?)")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM messages WHERE created_at<?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(ids
            .into_iter()
            .filter_map(|(id,)| Uuid::parse_str(&id).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello(room_name: &str, user: &str) -> NewMessage {
        NewMessage {
            room_name: room_name.to_owned(),
            user: user.to_owned(),
            text: "hello".to_owned(),
            ..Default::default()
        }
    }

    async fn store() -> MessageStore {
        MessageStore::new(db::connect_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn append_seeds_read_by_with_author() {
        let store = store().await;
        let msg = store.append(hello("lobby", "alice")).await.unwrap();
        assert_eq!(msg.read_by, vec!["alice"]);

        let history = store.history("lobby").await.unwrap();
        assert_eq!(history, vec![msg]);
    }

    #[tokio::test]
    async fn history_of_unknown_room_is_empty() {
        let store = store().await;
        assert!(store.history("nowhere").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_is_scoped_and_ordered() {
        let store = store().await;
        let first = store.append_at(hello("lobby", "alice"), 1_000).await.unwrap();
        store.append_at(hello("attic", "carol"), 1_500).await.unwrap();
        let second = store.append_at(hello("lobby", "bob"), 2_000).await.unwrap();

        let ids: Vec<Uuid> = store
            .history_at("lobby", 3_000)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn created_at_never_goes_backwards_within_a_room() {
        let store = store().await;
        let first = store.append_at(hello("lobby", "alice"), 5_000).await.unwrap();
        let skewed = store.append_at(hello("lobby", "bob"), 4_000).await.unwrap();
        assert_eq!(skewed.created_at, first.created_at);

        // other rooms keep their own clock
        let elsewhere = store.append_at(hello("attic", "bob"), 4_000).await.unwrap();
        assert!(elsewhere.created_at < first.created_at);
    }

    #[tokio::test]
    async fn message_expires_after_ttl_and_stays_gone() {
        let store = store().await;
        let t = 10_000;
        let msg = store.append_at(hello("lobby", "alice"), t).await.unwrap();

        assert_eq!(store.history_at("lobby", t + TTL_MILLIS).await.unwrap().len(), 1);
        assert!(store.history_at("lobby", t + TTL_MILLIS + 1).await.unwrap().is_empty());

        let purged = store.purge_expired_at(t + TTL_MILLIS + 1).await.unwrap();
        assert_eq!(purged, vec![msg.id]);
        assert!(store.history_at("lobby", t).await.unwrap().is_empty());
        assert!(matches!(
            store.mark_read_at(msg.id, "bob", t).await,
            Err(ChatError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn mark_read_is_idempotent() {
        let store = store().await;
        let msg = store.append(hello("lobby", "alice")).await.unwrap();

        let once = store.mark_read(msg.id, "bob").await.unwrap();
        let twice = store.mark_read(msg.id, "bob").await.unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.read_by, vec!["alice", "bob"]);
        assert_eq!(twice.room_name, "lobby");

        let history = store.history("lobby").await.unwrap();
        assert_eq!(history[0].read_by, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn read_state_follows_the_store() {
        let store = store().await;
        let t = 10_000;
        let msg = store.append_at(hello("lobby", "alice"), t).await.unwrap();
        store.mark_read_at(msg.id, "bob", t).await.unwrap();

        let state = store.read_state_at(msg.id, t).await.unwrap().unwrap();
        assert_eq!(state.room_name, "lobby");
        assert_eq!(state.read_by, vec!["alice", "bob"]);

        assert_eq!(store.read_state_at(msg.id, t + TTL_MILLIS + 1).await.unwrap(), None);
        assert_eq!(store.read_state(Uuid::now_v7()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn mark_read_unknown_message() {
        let store = store().await;
        let missing = Uuid::now_v7();
        match store.mark_read(missing, "bob").await {
            Err(ChatError::NotFound(what)) => assert!(what.contains(&missing.to_string())),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_store_reports_persistence_error() {
        let db_pool = db::connect_in_memory().await.unwrap();
        let store = MessageStore::new(db_pool.clone());
        db_pool.close().await;

        assert!(matches!(
            store.append(hello("lobby", "alice")).await,
            Err(ChatError::Persistence(_))
        ));
        assert!(matches!(store.history("lobby").await, Err(ChatError::Persistence(_))));
    }

    #[test]
    fn wire_shape() {
        let msg = Message {
            id: Uuid::nil(),
            room_name: "lobby".into(),
            user: "alice".into(),
            text: "hi".into(),
            avatar_ref: None,
            image_ref: Some("/blobs/abc".into()),
            created_at: from_millis(0),
            read_by: vec!["alice".into()],
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["_id"], Uuid::nil().to_string());
        assert_eq!(json["roomName"], "lobby");
        assert_eq!(json["imageRef"], "/blobs/abc");
        assert_eq!(json["createdAt"], "1970-01-01T00:00:00Z");
        assert_eq!(json["readBy"][0], "alice");
        assert!(json.get("avatarRef").is_none());
    }
}
