//! Ingestion Pipeline: validate, resolve, persist, broadcast.
//!
//! Both ingress adapters (HTTP request/response and the WebSocket event)
//! call into [`ingest`] and get identical outcomes. Persistence strictly
//! precedes broadcast: nothing unpersisted is ever fanned out, and fan-out
//! failure never rolls persistence back.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::broadcast;
use crate::db;
use crate::error::{RelayError, RelayResult};
use crate::messages::store::{self, MessageKind, MessagePayload};
use crate::registry::ConnectionRegistry;
use crate::rooms::directory;
use crate::users;

/// One inbound message, as submitted on either ingress. `room` accepts
/// either addressing form (name or internal id); `idempotency_key` is the
/// optional client nonce that collapses duplicate submissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub user_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub content: String,
    pub room: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// Deployment policy for the pipeline. Unknown authors are rejected unless
/// `provision_users` is set, in which case they are created on first use.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestPolicy {
    pub provision_users: bool,
}

pub async fn ingest(
    pool: &SqlitePool,
    registry: &ConnectionRegistry,
    policy: IngestPolicy,
    req: IngestRequest,
) -> RelayResult<MessagePayload> {
    if req.user_id <= 0 {
        return Err(RelayError::InvalidInput("user_id must be a positive integer".into()));
    }
    if req.content.trim().is_empty() {
        return Err(RelayError::InvalidInput("content must not be empty".into()));
    }
    if req.room.trim().is_empty() {
        return Err(RelayError::InvalidInput("room identifier must not be empty".into()));
    }

    match db::store_call(users::lookup(pool, req.user_id)).await? {
        Some(_) => {}
        None if policy.provision_users => {
            let handle = req
                .username
                .as_deref()
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_owned)
                .unwrap_or_else(|| format!("user{}", Uuid::now_v7().simple()));
            db::store_call(users::provision(pool, req.user_id, &handle)).await?;
        }
        None => return Err(RelayError::UnknownUser(req.user_id)),
    }

    let room = db::store_call(directory::resolve(pool, &req.room)).await?;

    let (message, fresh) = db::store_call(store::append(
        pool,
        room.id,
        req.user_id,
        &req.content,
        req.kind,
        req.idempotency_key.as_deref(),
    ))
    .await?;

    if fresh {
        broadcast::publish(registry, &room, &message).await;
        return Ok(message.into_payload(room.name));
    }

    debug!(key = ?req.idempotency_key, room = %room.name, "replayed submission, broadcast skipped");

    // A retry can resolve a different room than the original submission
    // landed in; the payload is labeled with the room of record.
    let name = if message.room_id == room.id {
        room.name
    } else {
        db::store_call(directory::find(pool, &message.room_id.to_string()))
            .await?
            .map(|room| room.name)
            .ok_or_else(|| {
                RelayError::Internal(anyhow::anyhow!(
                    "room {} missing for replayed message {}",
                    message.room_id,
                    message.id
                ))
            })?
    };
    Ok(message.into_payload(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::messages::store::seed_user;
    use crate::ws::ServerEvent;
    use tokio::sync::mpsc;

    fn request(user_id: i64, content: &str, room: &str) -> IngestRequest {
        IngestRequest {
            user_id,
            username: None,
            content: content.into(),
            room: room.into(),
            kind: MessageKind::Text,
            idempotency_key: None,
        }
    }

    async fn subscriber(
        registry: &ConnectionRegistry,
        room_id: i64,
    ) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = registry.register(tx).await;
        registry.subscribe(conn, room_id).await;
        rx
    }

    #[tokio::test]
    async fn persists_then_broadcasts_by_room_name() {
        let pool = db::memory_pool().await;
        let registry = ConnectionRegistry::new();
        let user = seed_user(&pool, "ana").await;

        let room = directory::resolve(&pool, "general").await.unwrap();
        let mut rx = subscriber(&registry, room.id).await;

        let payload = ingest(&pool, &registry, IngestPolicy::default(), request(user, "hi", "general"))
            .await
            .unwrap();

        assert_eq!(payload.room, "general");
        assert_eq!(payload.username, "ana");

        let ServerEvent::Message { message } = rx.recv().await.unwrap() else {
            panic!("expected a message event");
        };
        assert_eq!(message, payload);

        let rows = store::history(&pool, room.id, 50).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, payload.id);
    }

    #[tokio::test]
    async fn creates_unseen_rooms_on_ingest() {
        let pool = db::memory_pool().await;
        let registry = ConnectionRegistry::new();
        let user = seed_user(&pool, "ana").await;

        let payload = ingest(&pool, &registry, IngestPolicy::default(), request(user, "hi", "fresh"))
            .await
            .unwrap();

        let room = directory::find(&pool, "fresh").await.unwrap().unwrap();
        assert_eq!(payload.room, "fresh");
        assert_eq!(store::history(&pool, room.id, 50).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_user_aborts_before_broadcast() {
        let pool = db::memory_pool().await;
        let registry = ConnectionRegistry::new();

        let room = directory::resolve(&pool, "general").await.unwrap();
        let mut rx = subscriber(&registry, room.id).await;

        let err = ingest(&pool, &registry, IngestPolicy::default(), request(99, "hi", "general"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "unknown_user");
        assert!(rx.try_recv().is_err());
        assert!(store::history(&pool, room.id, 50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn provisioning_policy_creates_the_author() {
        let pool = db::memory_pool().await;
        let registry = ConnectionRegistry::new();
        let policy = IngestPolicy { provision_users: true };

        let mut req = request(7, "hi", "general");
        req.username = Some("ana".into());

        let payload = ingest(&pool, &registry, policy, req).await.unwrap();

        assert_eq!(payload.username, "ana");
        assert_eq!(users::lookup(&pool, 7).await.unwrap(), Some("ana".into()));
    }

    #[tokio::test]
    async fn rejects_blank_fields() {
        let pool = db::memory_pool().await;
        let registry = ConnectionRegistry::new();
        let policy = IngestPolicy::default();

        for req in [request(0, "hi", "general"), request(1, "  ", "general"), request(1, "hi", "")] {
            let err = ingest(&pool, &registry, policy, req).await.unwrap_err();
            assert_eq!(err.kind(), "invalid_input");
        }
    }

    #[tokio::test]
    async fn replay_with_idempotency_key_broadcasts_once() {
        let pool = db::memory_pool().await;
        let registry = ConnectionRegistry::new();
        let user = seed_user(&pool, "ana").await;

        let room = directory::resolve(&pool, "general").await.unwrap();
        let mut rx = subscriber(&registry, room.id).await;

        let mut req = request(user, "hi", "general");
        req.idempotency_key = Some("nonce-1".into());

        let first = ingest(&pool, &registry, IngestPolicy::default(), req.clone())
            .await
            .unwrap();
        let replay = ingest(&pool, &registry, IngestPolicy::default(), req)
            .await
            .unwrap();

        assert_eq!(first.id, replay.id);
        assert!(matches!(rx.try_recv(), Ok(ServerEvent::Message { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn only_current_subscribers_receive_the_broadcast() {
        let pool = db::memory_pool().await;
        let registry = ConnectionRegistry::new();
        let user = seed_user(&pool, "ana").await;
        let room = directory::resolve(&pool, "general").await.unwrap();

        // Registered but never joined the room.
        let (tx, mut bystander) = mpsc::unbounded_channel();
        registry.register(tx).await;

        // Joined, then left before the publish.
        let (tx, mut departed) = mpsc::unbounded_channel();
        let conn = registry.register(tx).await;
        registry.subscribe(conn, room.id).await;
        registry.unsubscribe(conn, room.id).await;

        let mut rx = subscriber(&registry, room.id).await;

        ingest(&pool, &registry, IngestPolicy::default(), request(user, "hi", "general"))
            .await
            .unwrap();

        assert!(matches!(rx.try_recv(), Ok(ServerEvent::Message { .. })));
        assert!(bystander.try_recv().is_err());
        assert!(departed.try_recv().is_err());
    }

    #[tokio::test]
    async fn replay_keeps_the_original_room_label() {
        let pool = db::memory_pool().await;
        let registry = ConnectionRegistry::new();
        let user = seed_user(&pool, "ana").await;

        let mut req = request(user, "hi", "general");
        req.idempotency_key = Some("nonce-1".into());
        let first = ingest(&pool, &registry, IngestPolicy::default(), req.clone())
            .await
            .unwrap();

        req.room = "random".into();
        let replay = ingest(&pool, &registry, IngestPolicy::default(), req).await.unwrap();

        assert_eq!(replay.id, first.id);
        assert_eq!(replay.room, "general");
    }

    #[tokio::test]
    async fn racing_ingests_order_by_persistence_sequence() {
        let pool = db::memory_pool().await;
        let registry = std::sync::Arc::new(ConnectionRegistry::new());
        let ana = seed_user(&pool, "ana").await;
        let bob = seed_user(&pool, "bob").await;

        let room = directory::resolve(&pool, "general").await.unwrap();
        let mut rx = subscriber(&registry, room.id).await;

        let a = {
            let (pool, registry) = (pool.clone(), registry.clone());
            tokio::spawn(async move {
                ingest(&pool, &registry, IngestPolicy::default(), request(ana, "from ana", "general")).await
            })
        };
        let b = {
            let (pool, registry) = (pool.clone(), registry.clone());
            tokio::spawn(async move {
                ingest(&pool, &registry, IngestPolicy::default(), request(bob, "from bob", "general")).await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let rows = store::history(&pool, room.id, 50).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].id < rows[1].id);

        // Both broadcasts arrive; the store sequence is the order of record.
        let mut delivered = Vec::new();
        for _ in 0..2 {
            let ServerEvent::Message { message } = rx.recv().await.unwrap() else {
                panic!("expected a message event");
            };
            delivered.push(message.id);
        }
        delivered.sort_unstable();
        assert_eq!(delivered, vec![rows[0].id, rows[1].id]);
    }
}
