use chrono::{DateTime, Utc};
use sea_orm::JsonValue;
use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::entities::sync_event;
use crate::types::Operation;

/// Wire envelope carried by both the HTTP webhook and the relay tunnel.
///
/// `pk` holds the primary-key fragment; `data` carries the full column image
/// for inserts and updates and is absent for deletes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncEnvelope {
    /// UUID rendered as 36-char text, exactly as stored in the outbox.
    pub event_id: String,
    pub table: String,
    pub operation: Operation,
    pub pk: Map<String, JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, JsonValue>>,
    pub source_node: String,
    pub timestamp: DateTime<Utc>,
}

impl SyncEnvelope {
    /// Builds the outbound envelope for an outbox row. The sender stamps its
    /// own node id as `source_node` so the receiver can register it as a peer.
    pub fn from_event(event: &sync_event::Model, sender_node: &str) -> Self {
        let pk = as_object(&event.pk);
        let data = event
            .payload
            .as_ref()
            .map(as_object)
            .filter(|map| !map.is_empty());
        Self {
            event_id: event.event_id.clone(),
            table: event.table_name.clone(),
            operation: event.operation,
            pk,
            data,
            source_node: sender_node.to_string(),
            timestamp: event.created_at,
        }
    }
}

fn as_object(value: &JsonValue) -> Map<String, JsonValue> {
    value.as_object().cloned().unwrap_or_default()
}

/// Frame kinds understood by the relay tunnel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Sync,
    Command,
    Ping,
}

/// Envelope routed through the relay hub. The hub fills `source` when empty
/// and forwards on `target` without inspecting `payload`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayFrame {
    pub target: String,
    pub source: String,
    pub payload: JsonValue,
    #[serde(rename = "type")]
    pub frame_type: FrameType,
}

impl RelayFrame {
    pub fn sync(target: &str, source: &str, envelope: &SyncEnvelope) -> Result<Self, serde_json::Error> {
        Ok(Self {
            target: target.to_string(),
            source: source.to_string(),
            payload: serde_json::to_value(envelope)?,
            frame_type: FrameType::Sync,
        })
    }

    /// Decodes the payload of a `sync` frame; `None` for other frame kinds.
    pub fn decode_sync(&self) -> Option<Result<SyncEnvelope, serde_json::Error>> {
        match self.frame_type {
            FrameType::Sync => Some(serde_json::from_value(self.payload.clone())),
            _ => None,
        }
    }
}
