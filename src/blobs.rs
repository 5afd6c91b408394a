use axum::{
    debug_handler,
    extract::{Path, State},
    http::header,
    response::IntoResponse,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::{
    db,
    error::{ChatError, ChatResult},
    messages::TTL_MILLIS,
    AppResult,
};

const REF_PREFIX: &str = "/blobs/";

/// Content-addressed storage for avatars and images, so message rows carry
/// a short reference instead of the inline payload.
#[derive(Clone)]
pub struct BlobStore {
    db_pool: SqlitePool,
    max_bytes: usize,
}

impl BlobStore {
    pub fn new(db_pool: SqlitePool, max_bytes: usize) -> Self {
        Self { db_pool, max_bytes }
    }

    /// Turns an optional client-supplied value into a stored reference.
    ///
    /// `data:` URLs are decoded and stored; anything else is already a
    /// reference and passes through. Blank values become `None`.
    pub async fn intern(&self, value: Option<String>) -> ChatResult<Option<String>> {
        let Some(value) = value.filter(|v| !v.trim().is_empty()) else {
            return Ok(None);
        };
        let Some(data_url) = value.strip_prefix("data:") else {
            return Ok(Some(value));
        };

        let (content_type, bytes) = self.decode(data_url)?;
        let id = hex::encode(Sha256::digest(&bytes));

        sqlx::query(
            "INSERT INTO blobs (id,content_type,bytes,last_used_at) VALUES (?,?,?,?) \
             ON CONFLICT(id) DO UPDATE SET last_used_at=excluded.last_used_at",
        )
        .bind(&id)
        .bind(content_type)
        .bind(bytes)
        .bind(db::now_millis())
        .execute(&self.db_pool)
        .await?;

        Ok(Some(format!("{REF_PREFIX}{id}")))
    }

    fn decode(&self, data_url: &str) -> ChatResult<(String, Vec<u8>)> {
        let (meta, payload) = data_url
            .split_once(',')
            .ok_or_else(|| ChatError::validation("malformed data url"))?;
        let content_type = meta
            .strip_suffix(";base64")
            .ok_or_else(|| ChatError::validation("only base64 data urls are accepted"))?;
        let content_type = if content_type.is_empty() {
            "application/octet-stream"
        } else {
            content_type
        };

        // base64 inflates by 4/3, reject before decoding
        if payload.len() / 4 * 3 > self.max_bytes + 3 {
            return Err(ChatError::validation("attachment too large"));
        }

        let bytes = STANDARD
            .decode(payload.trim())
            .map_err(|_| ChatError::validation("attachment is not valid base64"))?;
        if bytes.len() > self.max_bytes {
            return Err(ChatError::validation("attachment too large"));
        }

        Ok((content_type.to_owned(), bytes))
    }

    pub async fn fetch(&self, id: &str) -> ChatResult<Option<(String, Vec<u8>)>> {
        Ok(sqlx::query_as("SELECT content_type,bytes FROM blobs WHERE id=?")
            .bind(id)
            .fetch_optional(&self.db_pool)
            .await?)
    }

    /// Marks the blobs behind `refs` as used at `now`. Other references are skipped.
    pub(crate) async fn touch_at(&self, refs: &[String], now: i64) -> ChatResult<()> {
        for id in refs.iter().filter_map(|r| r.strip_prefix(REF_PREFIX)) {
            sqlx::query("UPDATE blobs SET last_used_at=MAX(last_used_at,?) WHERE id=?")
                .bind(now)
                .bind(id)
                .execute(&self.db_pool)
                .await?;
        }
        Ok(())
    }

    /// Deletes blobs unused for the TTL that no stored message points at.
    pub(crate) async fn purge_expired_at(&self, now: i64) -> ChatResult<u64> {
        let result = sqlx::query(
            "DELETE FROM blobs WHERE last_used_at<? AND NOT EXISTS (\
             SELECT 1 FROM messages m WHERE m.avatar_ref=?||blobs.id OR m.image_ref=?||blobs.id)",
        )
        .bind(now - TTL_MILLIS)
        .bind(REF_PREFIX)
        .bind(REF_PREFIX)
        .execute(&self.db_pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[debug_handler(state = crate::AppState)]
pub async fn blob(
    Path(id): Path<String>,
    State(blobs): State<BlobStore>,
) -> AppResult<impl IntoResponse> {
    let (content_type, bytes) = blobs
        .fetch(&id)
        .await?
        .ok_or_else(|| ChatError::NotFound(format!("blob {id}")))?;

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "public, max-age=86400, immutable".to_owned()),
        ],
        bytes,
    ))
}
