//! Broadcast Router: fan a persisted message out to every connection
//! currently subscribed to its room.

use tracing::{debug, warn};

use crate::messages::store::StoredMessage;
use crate::registry::ConnectionRegistry;
use crate::rooms::directory::Room;
use crate::ws::ServerEvent;

/// Deliver `message` to the room's current subscribers, fire-and-forget per
/// recipient. Membership is snapshotted first so a slow recipient never
/// blocks registry mutations, and a recipient that vanished mid-fan-out is
/// skipped without failing the publish.
///
/// Delivered payloads address the room by name, the canonical external
/// identifier.
pub async fn publish(registry: &ConnectionRegistry, room: &Room, message: &StoredMessage) {
    let targets = registry.snapshot(room.id).await;
    if targets.is_empty() {
        return;
    }

    let event = ServerEvent::Message {
        message: message.clone().into_payload(room.name.clone()),
    };

    let total = targets.len();
    let mut dropped = 0usize;
    for (conn, sender) in targets {
        if sender.send(event.clone()).is_err() {
            debug!(%conn, room = %room.name, "subscriber went away mid fan-out");
            dropped += 1;
        }
    }

    if dropped > 0 {
        warn!(
            room = %room.name,
            delivered = total - dropped,
            dropped,
            "partial delivery"
        );
    }
}
