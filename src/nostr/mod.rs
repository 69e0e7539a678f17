//! Nostr publishing layer.
//!
//! Every event the orchestrator emits flows through this module: event
//! construction and canonical ids ([`event`]), signing ([`signer`]), relay
//! fan-out ([`relay`]), offline spooling ([`spool`]), the high-level
//! publisher ([`publisher`]), lifecycle heartbeats ([`lifecycle`]), and the
//! per-agent identity registry ([`identity`]).

pub mod event;
pub mod identity;
pub mod lifecycle;
pub mod publisher;
pub mod relay;
pub mod signer;
pub mod spool;

pub use event::Event;
pub use identity::{IdentityRecord, IdentityRegistry};
pub use lifecycle::{HeartbeatPublisher, LifecycleContent, LifecycleStatus};
pub use publisher::{PublishError, Publisher};
pub use relay::{EventSink, Relay, RelayError, RelayPool, Subscription};
pub use signer::{LocalSigner, RemoteSigner, Signer, SignerError};
pub use spool::{DrainStats, Spool, SpoolEntry};

// --- event kinds ---

/// Activity feed entries.
pub const KIND_LOG_STATUS: u32 = 30315;
/// Agent lifecycle (register / heartbeat / retire / dead).
pub const KIND_LIFECYCLE: u32 = 30316;
/// Convoy definition and progress.
pub const KIND_CONVOY_STATE: u32 = 30318;
/// Issue mirror for UI consumption.
pub const KIND_ISSUE_STATE: u32 = 30319;
/// Machine-to-machine protocol signals (MERGE_READY, HANDOFF, ...).
pub const KIND_PROTOCOL_EVENT: u32 = 30320;
/// Group membership definition.
pub const KIND_GROUP_DEF: u32 = 30321;
/// Work queue definition and status.
pub const KIND_QUEUE_DEF: u32 = 30322;
/// Pub/sub channel definition.
pub const KIND_CHANNEL_DEF: u32 = 30323;
/// Claimable queue work items.
pub const KIND_WORK_ITEM: u32 = 30325;

/// Per-agent profile metadata.
pub const KIND_PROFILE: u32 = 0;
/// Private direct messages (sealed).
pub const KIND_DIRECT_MESSAGE: u32 = 14;
/// Gift wraps for private messages.
pub const KIND_GIFT_WRAP: u32 = 1059;
/// Public channel creation.
pub const KIND_CHANNEL_CREATE: u32 = 40;
/// Public channel metadata updates.
pub const KIND_CHANNEL_META: u32 = 41;
/// Public channel messages.
pub const KIND_CHANNEL_MESSAGE: u32 = 42;
/// Relay-preference list.
pub const KIND_RELAY_LIST: u32 = 10002;
/// DM relay preferences.
pub const KIND_DM_RELAY_LIST: u32 = 10050;

// --- protocol constants ---

/// Protocol version carried as `["gt", "1"]` on every orchestrator event.
pub const PROTOCOL_VERSION: &str = "1";
/// Prefix for schema identifiers in event content.
pub const SCHEMA_PREFIX: &str = "gt/";

/// Event visibility levels.
pub const VISIBILITY_AUDIT: &str = "audit";
pub const VISIBILITY_FEED: &str = "feed";
pub const VISIBILITY_BOTH: &str = "both";

/// An event tag: an ordered list of strings, key first.
pub type Tag = Vec<String>;

/// Cross-reference data linking events to issues, convoys, beads,
/// sessions, branches, and merge requests. Empty fields are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Correlations {
    pub issue_id: String,
    pub convoy_id: String,
    pub bead_id: String,
    pub session_id: String,
    pub branch: String,
    pub merge_request: String,
    pub target: String,
}

/// Tags present on every orchestrator event: protocol version, plus rig,
/// role, and actor when known.
pub fn base_tags(rig: &str, role: &str, actor: &str) -> Vec<Tag> {
    let mut tags = vec![vec!["gt".to_string(), PROTOCOL_VERSION.to_string()]];
    if !rig.is_empty() {
        tags.push(vec!["rig".to_string(), rig.to_string()]);
    }
    if !role.is_empty() {
        tags.push(vec!["role".to_string(), role.to_string()]);
    }
    if !actor.is_empty() {
        tags.push(vec!["actor".to_string(), actor.to_string()]);
    }
    tags
}

/// Optional correlation tags; empty values are omitted.
pub fn correlation_tags(c: &Correlations) -> Vec<Tag> {
    let mut tags = Vec::new();
    if !c.issue_id.is_empty() {
        tags.push(vec!["t".to_string(), c.issue_id.clone()]);
    }
    if !c.convoy_id.is_empty() {
        tags.push(vec!["convoy".to_string(), c.convoy_id.clone()]);
    }
    if !c.bead_id.is_empty() {
        tags.push(vec!["bead".to_string(), c.bead_id.clone()]);
    }
    if !c.session_id.is_empty() {
        tags.push(vec!["session".to_string(), c.session_id.clone()]);
    }
    tags
}

/// The "d" discriminator tag for parameterized replaceable events.
pub fn replaceable_tag(d: &str) -> Tag {
    vec!["d".to_string(), d.to_string()]
}

/// Type discriminator for events sharing a kind.
pub fn type_tag(event_type: &str) -> Tag {
    vec!["type".to_string(), event_type.to_string()]
}

/// Visibility tag controlling where the event appears.
pub fn visibility_tag(visibility: &str) -> Tag {
    vec!["visibility".to_string(), visibility.to_string()]
}

/// Schema identifier like `gt/log@1` for event content.
pub fn schema_version(name: &str, version: u32) -> String {
    format!("{SCHEMA_PREFIX}{name}@{version}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_tags_always_carry_protocol_version() {
        let tags = base_tags("", "", "");
        assert_eq!(tags, vec![vec!["gt".to_string(), "1".to_string()]]);

        let tags = base_tags("valhalla", "polecat", "valhalla/polecats/Nux");
        assert_eq!(tags.len(), 4);
        assert_eq!(tags[1], vec!["rig", "valhalla"]);
        assert_eq!(tags[2], vec!["role", "polecat"]);
        assert_eq!(tags[3], vec!["actor", "valhalla/polecats/Nux"]);
    }

    #[test]
    fn test_correlation_tags_omit_empty_values() {
        let c = Correlations {
            issue_id: "gt-123".to_string(),
            session_id: "sess-9".to_string(),
            ..Default::default()
        };
        let tags = correlation_tags(&c);
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0], vec!["t", "gt-123"]);
        assert_eq!(tags[1], vec!["session", "sess-9"]);
    }

    #[test]
    fn test_schema_version_format() {
        assert_eq!(schema_version("log", 1), "gt/log@1");
        assert_eq!(schema_version("lifecycle", 2), "gt/lifecycle@2");
    }

    #[test]
    fn test_replaceable_tag() {
        assert_eq!(replaceable_tag("rig/polecat/Nux"), vec!["d", "rig/polecat/Nux"]);
    }
}
