//! Connection Registry: the only in-process mutable shared structure.
//!
//! One `RwLock` owns both maps, so subscribe/unsubscribe/publish can never
//! observe a torn membership set. Delivery itself happens outside the lock
//! via snapshots.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::ws::ServerEvent;

/// Process-local identifier for one live WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

struct Entry {
    sender: EventSender,
    rooms: HashSet<i64>,
}

#[derive(Default)]
struct Inner {
    conns: HashMap<ConnectionId, Entry>,
    rooms: HashMap<i64, HashSet<ConnectionId>>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, sender: EventSender) -> ConnectionId {
        let id = ConnectionId::new();
        self.inner.write().await.conns.insert(
            id,
            Entry { sender, rooms: HashSet::new() },
        );
        id
    }

    /// Idempotent. A subscribe from an already-gone connection is discarded.
    pub async fn subscribe(&self, conn: ConnectionId, room_id: i64) {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let Some(entry) = inner.conns.get_mut(&conn) else {
            return;
        };
        entry.rooms.insert(room_id);
        inner.rooms.entry(room_id).or_default().insert(conn);
    }

    pub async fn unsubscribe(&self, conn: ConnectionId, room_id: i64) {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        if let Some(entry) = inner.conns.get_mut(&conn) {
            entry.rooms.remove(&room_id);
        }
        let emptied = inner
            .rooms
            .get_mut(&room_id)
            .map(|members| {
                members.remove(&conn);
                members.is_empty()
            })
            .unwrap_or(false);
        if emptied {
            inner.rooms.remove(&room_id);
        }
    }

    pub async fn members(&self, room_id: i64) -> Vec<ConnectionId> {
        self.inner
            .read()
            .await
            .rooms
            .get(&room_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Current membership with outbound channels, for fan-out. The lock is
    /// released before anything is delivered.
    pub async fn snapshot(&self, room_id: i64) -> Vec<(ConnectionId, EventSender)> {
        let inner = self.inner.read().await;
        let Some(members) = inner.rooms.get(&room_id) else {
            return Vec::new();
        };
        members
            .iter()
            .filter_map(|conn| {
                inner
                    .conns
                    .get(conn)
                    .map(|entry| (*conn, entry.sender.clone()))
            })
            .collect()
    }

    /// Called exactly once when a connection's socket task ends. Safe for
    /// connections that never subscribed to anything.
    pub async fn on_disconnect(&self, conn: ConnectionId) {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let Some(entry) = inner.conns.remove(&conn) else {
            return;
        };
        for room_id in entry.rooms {
            let emptied = inner
                .rooms
                .get_mut(&room_id)
                .map(|members| {
                    members.remove(&conn);
                    members.is_empty()
                })
                .unwrap_or(false);
            if emptied {
                inner.rooms.remove(&room_id);
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.conns.len()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }
}
