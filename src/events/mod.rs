//! Dual-write bridge from orchestrator activity to the event network.
//!
//! Call sites that record activity (sling, hook, done, merges, session
//! lifecycle) hand their event to [`publish_activity`], which mirrors it as
//! a kind 30315 event in the background. The handoff deep-copies the
//! payload first so the originating writer is free to keep mutating its
//! own copy.
//!
//! Several emitters predate the publisher, so the bridge keeps a
//! process-wide publisher slot; unlike a bare once-guard it can also be
//! reset, which is the test seam. New code should prefer passing a
//! [`Publisher`] explicitly.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::config;
use crate::nostr::event::new_log_status;
use crate::nostr::{Correlations, Event, Publisher};

// Activity types the bridge understands well enough to extract
// correlations from.
pub const TYPE_SLING: &str = "sling";
pub const TYPE_HOOK: &str = "hook";
pub const TYPE_UNHOOK: &str = "unhook";
pub const TYPE_HANDOFF: &str = "handoff";
pub const TYPE_DONE: &str = "done";
pub const TYPE_SESSION_START: &str = "session_start";
pub const TYPE_SESSION_END: &str = "session_end";
pub const TYPE_SESSION_DEATH: &str = "session_death";
pub const TYPE_MERGE_STARTED: &str = "merge_started";
pub const TYPE_MERGED: &str = "merged";
pub const TYPE_MERGE_FAILED: &str = "merge_failed";
pub const TYPE_MERGE_SKIPPED: &str = "merge_skipped";

/// One orchestrator activity record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub event_type: String,
    /// Actor address, e.g. "valhalla/polecats/Nux" or "deacon".
    pub actor: String,
    /// "audit", "feed", or "both".
    pub visibility: String,
    pub payload: serde_json::Value,
}

static GLOBAL_PUBLISHER: RwLock<Option<Arc<Publisher>>> = RwLock::new(None);

/// Install the process-wide publisher when the event network is enabled.
/// Returns whether a publisher was installed.
pub fn init_global_publisher(publisher: Arc<Publisher>) -> bool {
    if !config::nostr_enabled() {
        return false;
    }
    set_global_publisher(publisher);
    true
}

/// Install the process-wide publisher unconditionally.
pub fn set_global_publisher(publisher: Arc<Publisher>) {
    *GLOBAL_PUBLISHER.write().unwrap() = Some(publisher);
}

/// The installed publisher, if any.
pub fn global_publisher() -> Option<Arc<Publisher>> {
    GLOBAL_PUBLISHER.read().unwrap().clone()
}

/// Clear the process-wide publisher (test seam).
pub fn reset_global_publisher() {
    *GLOBAL_PUBLISHER.write().unwrap() = None;
}

/// Mirror an activity record onto the event network. Fire-and-forget: the
/// publish runs on a background task and never blocks or fails the caller.
/// A no-op when no publisher is installed.
pub fn publish_activity(activity: &ActivityEvent) {
    let Some(publisher) = global_publisher() else {
        return;
    };

    // Deep copy before the handoff; the caller may mutate its payload
    // after we return.
    let event_type = activity.event_type.clone();
    let actor = activity.actor.clone();
    let visibility = activity.visibility.clone();
    let payload = activity.payload.clone();

    tokio::spawn(async move {
        let correlations = extract_correlations(&event_type, &payload);
        let (rig, role, name) = parse_actor(&actor);

        let mut event = new_log_status(&rig, &role, &name, &event_type, &visibility, &payload)
            .with_correlations(&correlations);
        add_extra_tags(&mut event, &correlations);

        if let Err(e) = publisher.publish(&mut event).await {
            tracing::warn!(event_type = %event_type, error = %e, "activity mirror failed");
        }
    });
}

/// Pull cross-reference ids out of an activity payload. Each activity type
/// stores different fields.
pub fn extract_correlations(event_type: &str, payload: &serde_json::Value) -> Correlations {
    let mut c = Correlations::default();

    match event_type {
        TYPE_SLING | TYPE_HOOK | TYPE_UNHOOK => {
            c.bead_id = get_string(payload, "bead");
            c.issue_id = c.bead_id.clone();
        }
        TYPE_HANDOFF => {
            c.session_id = get_string(payload, "session");
        }
        TYPE_DONE => {
            c.bead_id = get_string(payload, "bead");
            c.issue_id = c.bead_id.clone();
            c.branch = get_string(payload, "branch");
        }
        TYPE_SESSION_START | TYPE_SESSION_END => {
            c.session_id = get_string(payload, "session_id");
        }
        TYPE_SESSION_DEATH => {
            c.session_id = get_string(payload, "session");
        }
        TYPE_MERGE_STARTED | TYPE_MERGED | TYPE_MERGE_FAILED | TYPE_MERGE_SKIPPED => {
            c.merge_request = get_string(payload, "mr_id");
            c.branch = get_string(payload, "branch");
            c.target = get_string(payload, "target");
        }
        _ => {}
    }

    c
}

/// Attach the type-specific tags the correlation set carries beyond the
/// shared issue/convoy/bead/session tags.
fn add_extra_tags(event: &mut Event, c: &Correlations) {
    if !c.branch.is_empty() {
        event.tags.push(vec!["branch".to_string(), c.branch.clone()]);
    }
    if !c.merge_request.is_empty() {
        event.tags.push(vec!["mr".to_string(), c.merge_request.clone()]);
    }
    if !c.target.is_empty() {
        event.tags.push(vec!["target".to_string(), c.target.clone()]);
    }
}

/// Split an actor address into rig, role, and name.
///
/// "valhalla/polecats/Nux" → ("valhalla", "polecat", "Nux");
/// "valhalla/witness" → ("valhalla", "witness", "witness");
/// "deacon" → ("", "deacon", "deacon").
pub fn parse_actor(actor: &str) -> (String, String, String) {
    let parts: Vec<&str> = actor.split('/').collect();
    match parts.as_slice() {
        [rig, role, name] => (rig.to_string(), singular_role(role), name.to_string()),
        [rig, role] => (rig.to_string(), role.to_string(), role.to_string()),
        [single] if !single.is_empty() => (String::new(), single.to_string(), single.to_string()),
        _ => (String::new(), "unknown".to_string(), actor.to_string()),
    }
}

/// Fold plural role directories to singular role names.
fn singular_role(plural: &str) -> String {
    match plural {
        "polecats" => "polecat".to_string(),
        "crews" | "crew" => "crew".to_string(),
        other => other.to_string(),
    }
}

fn get_string(payload: &serde_json::Value, key: &str) -> String {
    match payload.get(key) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) if !other.is_null() => other.to_string(),
        _ => String::new(),
    }
}
