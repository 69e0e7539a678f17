//! The event record and kind-specific builders.
//!
//! An event is a signed, content-addressed record. The id is the SHA-256 of
//! the canonical serialization array `[0, pubkey, created_at, kind, tags,
//! content]`, so two signs of semantically equal events at the same
//! timestamp produce the same id.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::nostr::{
    base_tags, correlation_tags, replaceable_tag, schema_version, type_tag, visibility_tag,
    Correlations, Tag, KIND_CONVOY_STATE, KIND_ISSUE_STATE, KIND_LOG_STATUS, KIND_PROTOCOL_EVENT,
    KIND_WORK_ITEM,
};

/// A publishable event. `id`, `pubkey`, and `sig` are filled in by the
/// signer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    /// Seconds since the epoch.
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Tag>,
    /// JSON object text with a leading `schema` field.
    pub content: String,
    pub sig: String,
}

impl Event {
    /// An unsigned event stamped with the current time.
    pub fn new(kind: u32, tags: Vec<Tag>, content: String) -> Self {
        Self {
            kind,
            tags,
            content,
            created_at: Utc::now().timestamp(),
            ..Default::default()
        }
    }

    /// Hex SHA-256 over the canonical serialization array. Deterministic in
    /// `(pubkey, created_at, kind, tags, content)`.
    pub fn canonical_id(&self) -> String {
        let canonical = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content,
        ]);
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// Value of the "d" discriminator tag, if present.
    pub fn d_tag(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.len() >= 2 && t[0] == "d")
            .map(|t| t[1].as_str())
    }

    pub fn has_d_tag(&self) -> bool {
        self.d_tag().is_some()
    }

    pub fn is_signed(&self) -> bool {
        !self.sig.is_empty() && !self.id.is_empty()
    }

    /// Append correlation tags for issue / convoy / bead / session
    /// references.
    pub fn with_correlations(mut self, c: &Correlations) -> Self {
        self.tags.extend(correlation_tags(c));
        self
    }
}

/// Activity-feed entry (kind 30315). Replaces local event-log writes.
pub fn new_log_status(
    rig: &str,
    role: &str,
    actor: &str,
    event_type: &str,
    visibility: &str,
    payload: &serde_json::Value,
) -> Event {
    let mut tags = base_tags(rig, role, actor);
    tags.push(type_tag(event_type));
    tags.push(visibility_tag(visibility));

    let content = serde_json::json!({
        "schema": schema_version("log", 1),
        "type": event_type,
        "source": "gt",
        "payload": payload,
    });

    Event::new(KIND_LOG_STATUS, tags, content.to_string())
}

/// Aggregated convoy tracking state (kind 30318, replaceable by convoy id).
pub fn new_convoy_state(
    rig: &str,
    role: &str,
    actor: &str,
    convoy_id: &str,
    state: &serde_json::Value,
) -> Event {
    let mut tags = base_tags(rig, role, actor);
    tags.push(replaceable_tag(convoy_id));

    let content = serde_json::json!({
        "schema": schema_version("convoy", 1),
        "convoy_id": convoy_id,
        "state": state,
    });

    Event::new(KIND_CONVOY_STATE, tags, content.to_string())
}

/// Issue mirror (kind 30319, replaceable by issue id).
pub fn new_issue_state(
    rig: &str,
    role: &str,
    actor: &str,
    issue_id: &str,
    issue_data: &serde_json::Value,
) -> Event {
    let mut tags = base_tags(rig, role, actor);
    tags.push(replaceable_tag(issue_id));
    tags.push(vec!["t".to_string(), issue_id.to_string()]);

    let content = serde_json::json!({
        "schema": schema_version("issue", 1),
        "issue_id": issue_id,
        "data": issue_data,
    });

    Event::new(KIND_ISSUE_STATE, tags, content.to_string())
}

/// Machine-to-machine protocol signal (kind 30320, append-only): MERGE_READY,
/// POLECAT_DONE, HANDOFF, and friends.
pub fn new_protocol_event(
    rig: &str,
    role: &str,
    actor: &str,
    protocol_type: &str,
    payload: &serde_json::Value,
) -> Event {
    let mut tags = base_tags(rig, role, actor);
    tags.push(type_tag(protocol_type));

    let content = serde_json::json!({
        "schema": schema_version("protocol", 1),
        "type": protocol_type,
        "payload": payload,
    });

    Event::new(KIND_PROTOCOL_EVENT, tags, content.to_string())
}

/// Claimable queue work item (kind 30325, append-only).
pub fn new_work_item(
    rig: &str,
    role: &str,
    actor: &str,
    queue_name: &str,
    item: &serde_json::Value,
) -> Event {
    let mut tags = base_tags(rig, role, actor);
    tags.push(vec!["queue".to_string(), queue_name.to_string()]);

    let content = serde_json::json!({
        "schema": schema_version("work_item", 1),
        "queue": queue_name,
        "item": item,
    });

    Event::new(KIND_WORK_ITEM, tags, content.to_string())
}
