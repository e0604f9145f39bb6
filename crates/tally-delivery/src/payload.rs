//! Canonical JSON body sent to subscribers.

use chrono::SecondsFormat;
use serde::Serialize;
use serde_json::{Map, Value};
use tally_core::{Actor, Entity, Event};

use crate::error::{DeliveryError, Result};

/// Wire representation of an event.
///
/// Field order is stable so that the rendered body, and therefore its
/// signature, is deterministic for a given event.
#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    /// Dot-namespaced event type.
    pub event_type: &'a str,
    /// RFC 3339 UTC timestamp with millisecond precision and `Z` suffix.
    pub timestamp: String,
    /// Actor, serialized under `user`.
    pub user: &'a Actor,
    /// Entity the action was performed on.
    pub entity: &'a Entity,
    /// Verb.
    pub action: &'a str,
    /// Human-readable sentence.
    pub description: &'a str,
    /// Free-form event data.
    pub data: &'a Map<String, Value>,
}

impl<'a> From<&'a Event> for WebhookPayload<'a> {
    fn from(event: &'a Event) -> Self {
        Self {
            event_type: &event.event_type,
            timestamp: event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            user: &event.actor,
            entity: &event.entity,
            action: &event.action,
            description: &event.description,
            data: &event.data,
        }
    }
}

/// Renders the request body for an event.
///
/// # Errors
///
/// Returns `DeliveryError::InternalError` if serialization fails.
pub fn render(event: &Event) -> Result<String> {
    serde_json::to_string(&WebhookPayload::from(event))
        .map_err(|e| DeliveryError::internal(format!("failed to serialize payload: {e}")))
}
