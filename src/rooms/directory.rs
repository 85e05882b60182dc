//! Room Directory: maps either addressing form (human name or internal
//! numeric id) to the canonical room record, lazily creating by name.

use serde::Serialize;
use sqlx::SqlitePool;

use crate::error::{RelayError, RelayResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Room {
    pub id: i64,
    pub name: String,
}

/// A client-supplied room identifier. All-digit identifiers are tried as
/// internal ids first; everything else is a name.
pub enum RoomRef<'a> {
    Id(i64),
    Name(&'a str),
}

impl<'a> RoomRef<'a> {
    pub fn parse(identifier: &'a str) -> Self {
        let identifier = identifier.trim();
        match identifier.parse::<i64>() {
            Ok(id) => RoomRef::Id(id),
            Err(_) => RoomRef::Name(identifier),
        }
    }
}

/// Resolve an identifier to a room, creating the room when an unseen name is
/// referenced. A numeric identifier that matches no existing id falls back to
/// the name path, so "42" can still be a room called "42".
pub async fn resolve(pool: &SqlitePool, identifier: &str) -> RelayResult<Room> {
    if identifier.trim().is_empty() {
        return Err(RelayError::InvalidInput("room identifier must not be empty".into()));
    }

    if let RoomRef::Id(id) = RoomRef::parse(identifier) {
        if let Some(room) = fetch_by_id(pool, id).await? {
            return Ok(room);
        }
    }

    resolve_name(pool, identifier.trim()).await
}

/// Insert-or-fetch by name. Atomic under concurrent calls for the same
/// unseen name: the unique constraint on `rooms.name` admits one row, and
/// every racer then fetches it.
pub async fn resolve_name(pool: &SqlitePool, name: &str) -> RelayResult<Room> {
    if name.is_empty() {
        return Err(RelayError::InvalidInput("room name must not be empty".into()));
    }

    if let Some(room) = fetch_by_name(pool, name).await? {
        return Ok(room);
    }

    sqlx::query("INSERT INTO rooms (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
        .bind(name)
        .execute(pool)
        .await?;

    fetch_by_name(pool, name)
        .await?
        .ok_or_else(|| RelayError::StoreUnavailable(format!("room {name:?} missing after insert")))
}

/// Lookup without creation. Used wherever referencing an unknown room must
/// not bring it into existence (history, leave, room GET).
pub async fn find(pool: &SqlitePool, identifier: &str) -> RelayResult<Option<Room>> {
    match RoomRef::parse(identifier) {
        RoomRef::Id(id) => {
            if let Some(room) = fetch_by_id(pool, id).await? {
                return Ok(Some(room));
            }
            fetch_by_name(pool, identifier.trim()).await
        }
        RoomRef::Name(name) => fetch_by_name(pool, name).await,
    }
}

pub async fn list(pool: &SqlitePool) -> RelayResult<Vec<Room>> {
    Ok(sqlx::query_as("SELECT id, name FROM rooms ORDER BY id")
        .fetch_all(pool)
        .await?)
}

async fn fetch_by_id(pool: &SqlitePool, id: i64) -> RelayResult<Option<Room>> {
    Ok(sqlx::query_as("SELECT id, name FROM rooms WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?)
}

async fn fetch_by_name(pool: &SqlitePool, name: &str) -> RelayResult<Option<Room>> {
    Ok(sqlx::query_as("SELECT id, name FROM rooms WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?)
}
