//! Message Store: durable, append-only, per-room ordered message log.
//!
//! The store-assigned sequence id is the authoritative ordering key within a
//! room; `created_at` is kept for display only.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::{RelayError, RelayResult};

pub const DEFAULT_HISTORY_LIMIT: i64 = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
}

/// A persisted message, joined with its author's username.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct StoredMessage {
    pub id: i64,
    pub room_id: i64,
    pub user_id: i64,
    pub username: String,
    pub content: String,
    pub kind: MessageKind,
    pub created_at: String,
}

/// The client-facing shape. Rooms are addressed by name on the wire; the
/// internal id stays behind the Room Directory boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: i64,
    pub room: String,
    pub user_id: i64,
    pub username: String,
    pub content: String,
    pub kind: MessageKind,
    pub created_at: String,
}

impl StoredMessage {
    pub fn into_payload(self, room: impl Into<String>) -> MessagePayload {
        MessagePayload {
            id: self.id,
            room: room.into(),
            user_id: self.user_id,
            username: self.username,
            content: self.content,
            kind: self.kind,
            created_at: self.created_at,
        }
    }
}

/// Append a message. Fails `UnknownUser`/`UnknownRoom` for dangling
/// references; users are never auto-created here, unlike rooms in the
/// directory.
///
/// With an idempotency key, a duplicate submission returns the row persisted
/// first and `false`, so callers can skip the broadcast for replays.
pub async fn append(
    pool: &SqlitePool,
    room_id: i64,
    user_id: i64,
    content: &str,
    kind: MessageKind,
    idempotency_key: Option<&str>,
) -> RelayResult<(StoredMessage, bool)> {
    let Some((username,)) =
        sqlx::query_as::<_, (String,)>("SELECT username FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(pool)
            .await?
    else {
        return Err(RelayError::UnknownUser(user_id));
    };

    if sqlx::query_as::<_, (i64,)>("SELECT id FROM rooms WHERE id = ?")
        .bind(room_id)
        .fetch_optional(pool)
        .await?
        .is_none()
    {
        return Err(RelayError::UnknownRoom(room_id.to_string()));
    }

    let created_at = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(anyhow::Error::from)?;

    let result = sqlx::query(
        "INSERT INTO messages (room_id, user_id, content, kind, idempotency_key, created_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT(idempotency_key) DO NOTHING",
    )
    .bind(room_id)
    .bind(user_id)
    .bind(content)
    .bind(kind)
    .bind(idempotency_key)
    .bind(&created_at)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        // Only a key conflict can swallow the insert; hand back the row the
        // conflicting key already names.
        let Some(key) = idempotency_key else {
            return Err(RelayError::Internal(anyhow::anyhow!(
                "keyless insert affected no rows"
            )));
        };
        let message = fetch_by_key(pool, key).await?;
        return Ok((message, false));
    }

    let message = StoredMessage {
        id: result.last_insert_rowid(),
        room_id,
        user_id,
        username,
        content: content.to_owned(),
        kind,
        created_at,
    };
    Ok((message, true))
}

/// Read-only projection of the `limit` most recent messages in a room,
/// returned oldest-first with author usernames.
pub async fn history(pool: &SqlitePool, room_id: i64, limit: i64) -> RelayResult<Vec<StoredMessage>> {
    let mut rows: Vec<StoredMessage> = sqlx::query_as(
        "SELECT m.id, m.room_id, m.user_id, u.username, m.content, m.kind, m.created_at \
         FROM messages m JOIN users u ON u.id = m.user_id \
         WHERE m.room_id = ? \
         ORDER BY m.id DESC \
         LIMIT ?",
    )
    .bind(room_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.reverse();
    Ok(rows)
}

async fn fetch_by_key(pool: &SqlitePool, key: &str) -> RelayResult<StoredMessage> {
    Ok(sqlx::query_as(
        "SELECT m.id, m.room_id, m.user_id, u.username, m.content, m.kind, m.created_at \
         FROM messages m JOIN users u ON u.id = m.user_id \
         WHERE m.idempotency_key = ?",
    )
    .bind(key)
    .fetch_one(pool)
    .await?)
}

#[cfg(test)]
pub(crate) async fn seed_user(pool: &SqlitePool, username: &str) -> i64 {
    sqlx::query("INSERT INTO users (username, password_hash) VALUES (?, '')")
        .bind(username)
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid()
}

#[cfg(test)]
pub(crate) async fn seed_room(pool: &SqlitePool, name: &str) -> i64 {
    sqlx::query("INSERT INTO rooms (name) VALUES (?)")
        .bind(name)
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn append_then_history_roundtrip() {
        let pool = db::memory_pool().await;
        let user = seed_user(&pool, "ana").await;
        let room = seed_room(&pool, "general").await;

        for n in 1..=3 {
            let (message, fresh) =
                append(&pool, room, user, &format!("msg-{n}"), MessageKind::Text, None)
                    .await
                    .unwrap();
            assert!(fresh);
            assert_eq!(message.username, "ana");
        }

        let rows = history(&pool, room, DEFAULT_HISTORY_LIMIT).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(rows[0].content, "msg-1");
        assert_eq!(rows[2].content, "msg-3");
    }

    #[tokio::test]
    async fn append_unknown_user_writes_nothing() {
        let pool = db::memory_pool().await;
        let room = seed_room(&pool, "general").await;

        let err = append(&pool, room, 99, "hi", MessageKind::Text, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unknown_user");

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn append_unknown_room_fails() {
        let pool = db::memory_pool().await;
        let user = seed_user(&pool, "ana").await;

        let err = append(&pool, 99, user, "hi", MessageKind::Text, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unknown_room");
    }

    #[tokio::test]
    async fn history_returns_most_recent_oldest_first() {
        let pool = db::memory_pool().await;
        let user = seed_user(&pool, "ana").await;
        let room = seed_room(&pool, "general").await;

        for n in 1..=51 {
            append(&pool, room, user, &format!("msg-{n}"), MessageKind::Text, None)
                .await
                .unwrap();
        }

        let rows = history(&pool, room, DEFAULT_HISTORY_LIMIT).await.unwrap();
        assert_eq!(rows.len(), 50);
        assert_eq!(rows[0].content, "msg-2");
        assert_eq!(rows[49].content, "msg-51");
    }

    #[tokio::test]
    async fn history_is_scoped_to_the_room() {
        let pool = db::memory_pool().await;
        let user = seed_user(&pool, "ana").await;
        let general = seed_room(&pool, "general").await;
        let random = seed_room(&pool, "random").await;

        append(&pool, general, user, "here", MessageKind::Text, None).await.unwrap();
        append(&pool, random, user, "there", MessageKind::Text, None).await.unwrap();

        let rows = history(&pool, general, DEFAULT_HISTORY_LIMIT).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "here");
    }

    #[tokio::test]
    async fn keyless_duplicates_both_persist() {
        let pool = db::memory_pool().await;
        let user = seed_user(&pool, "ana").await;
        let room = seed_room(&pool, "general").await;

        let (first, fresh) = append(&pool, room, user, "hi", MessageKind::Text, None)
            .await
            .unwrap();
        assert!(fresh);

        let (second, fresh) = append(&pool, room, user, "hi", MessageKind::Text, None)
            .await
            .unwrap();
        assert!(fresh);
        assert_ne!(second.id, first.id);
    }

    #[tokio::test]
    async fn idempotency_key_collapses_duplicates() {
        let pool = db::memory_pool().await;
        let user = seed_user(&pool, "ana").await;
        let room = seed_room(&pool, "general").await;

        let (first, fresh) =
            append(&pool, room, user, "hi", MessageKind::Text, Some("nonce-1"))
                .await
                .unwrap();
        assert!(fresh);

        let (replay, fresh) =
            append(&pool, room, user, "hi", MessageKind::Text, Some("nonce-1"))
                .await
                .unwrap();
        assert!(!fresh);
        assert_eq!(replay.id, first.id);

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
