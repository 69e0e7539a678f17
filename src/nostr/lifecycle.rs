//! Agent lifecycle heartbeats.
//!
//! Every running agent owns a [`HeartbeatPublisher`] that emits a
//! replaceable lifecycle event (kind 30316) on a fixed cadence under the
//! stable discriminator `<rig>/<role>/<instance>`, so consumers always see
//! exactly one current state per agent. The supervisor heartbeats faster
//! than workers and may publish an authoritative `dead` event for an agent
//! it observes as stale.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};

use crate::config;
use crate::nostr::publisher::{PublishError, Publisher};
use crate::nostr::{base_tags, replaceable_tag, schema_version, Event, KIND_LIFECYCLE};

/// Heartbeat cadence for worker roles.
pub const DEFAULT_WORKER_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
/// Heartbeat cadence for the supervisor role.
pub const DEFAULT_SUPERVISOR_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Missed heartbeats before an agent is considered stale.
pub const STALE_MULTIPLIER: u32 = 3;

const SUPERVISOR_ROLE: &str = "deacon";
/// How long `stop` waits for the ticker task.
const STOP_WAIT: Duration = Duration::from_secs(5);

/// An agent's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStatus {
    Ready,
    Busy,
    Retiring,
    Dead,
}

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStatus::Ready => "ready",
            LifecycleStatus::Busy => "busy",
            LifecycleStatus::Retiring => "retiring",
            LifecycleStatus::Dead => "dead",
        }
    }
}

/// Content body of a lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleContent {
    pub schema: String,
    pub status: String,
    pub role: String,
    pub rig: String,
    pub instance: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cwd: String,
    pub started_at: String,
    pub last_heartbeat: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_issue: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
}

struct HeartbeatState {
    status: LifecycleStatus,
    current_issue: String,
    model: String,
    cwd: String,
}

/// Periodic lifecycle publisher for one agent.
pub struct HeartbeatPublisher {
    publisher: Arc<Publisher>,
    actor: String,
    rig: String,
    role: String,
    instance: String,
    interval: Duration,
    started_at: DateTime<Utc>,

    state: Mutex<HeartbeatState>,
    cancel_tx: watch::Sender<bool>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl HeartbeatPublisher {
    /// Create a heartbeat publisher. The cadence comes from the role,
    /// overridable through the environment.
    pub fn new(
        publisher: Arc<Publisher>,
        actor: impl Into<String>,
        rig: impl Into<String>,
        role: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        let role = role.into();
        let interval = resolve_interval(&role, config::heartbeat_interval_override());
        let cwd = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let (cancel_tx, _) = watch::channel(false);

        Self {
            publisher,
            actor: actor.into(),
            rig: rig.into(),
            role,
            instance: instance.into(),
            interval,
            started_at: Utc::now(),
            state: Mutex::new(HeartbeatState {
                status: LifecycleStatus::Ready,
                current_issue: String::new(),
                model: String::new(),
                cwd,
            }),
            cancel_tx,
            done_rx: Mutex::new(None),
        }
    }

    /// Override the cadence (tests, unusual deployments).
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Publish an immediate ready event, then a snapshot on every tick.
    pub fn start(self: &Arc<Self>) {
        let (done_tx, done_rx) = oneshot::channel();
        *self.done_rx.lock().unwrap() = Some(done_rx);

        let this = self.clone();
        let mut cancel_rx = self.cancel_tx.subscribe();
        tokio::spawn(async move {
            this.publish_snapshot().await;

            let mut ticker = tokio::time::interval(this.interval);
            ticker.tick().await; // the immediate publish covered this tick

            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    _ = ticker.tick() => this.publish_snapshot().await,
                }
            }
            drop(done_tx);
        });
    }

    /// Publish `retiring`, stop the ticker, then publish `dead`.
    pub async fn stop(&self) {
        self.set_status(LifecycleStatus::Retiring);
        self.publish_snapshot().await;

        let _ = self.cancel_tx.send(true);
        let done_rx = self.done_rx.lock().unwrap().take();
        if let Some(done_rx) = done_rx {
            let _ = tokio::time::timeout(STOP_WAIT, done_rx).await;
        }

        self.set_status(LifecycleStatus::Dead);
        self.publish_snapshot().await;
    }

    pub fn set_status(&self, status: LifecycleStatus) {
        self.state.lock().unwrap().status = status;
    }

    /// Record the issue in progress; a non-empty issue flips the agent to
    /// busy, clearing it flips back to ready.
    pub fn set_current_issue(&self, issue_id: impl Into<String>) {
        let issue_id = issue_id.into();
        let mut state = self.state.lock().unwrap();
        state.status = if issue_id.is_empty() {
            LifecycleStatus::Ready
        } else {
            LifecycleStatus::Busy
        };
        state.current_issue = issue_id;
    }

    pub fn set_model(&self, model: impl Into<String>) {
        self.state.lock().unwrap().model = model.into();
    }

    /// The heartbeat cadence in effect.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    async fn publish_snapshot(&self) {
        let content = {
            let state = self.state.lock().unwrap();
            LifecycleContent {
                schema: schema_version("lifecycle", 1),
                status: state.status.as_str().to_string(),
                role: self.role.clone(),
                rig: self.rig.clone(),
                instance: self.instance.clone(),
                cwd: state.cwd.clone(),
                started_at: self.started_at.to_rfc3339(),
                last_heartbeat: Utc::now().to_rfc3339(),
                current_issue: state.current_issue.clone(),
                model: state.model.clone(),
            }
        };

        let mut event =
            build_lifecycle_event(&self.actor, &self.rig, &self.role, &self.instance, &content);
        if let Err(e) = self.publisher.publish_replaceable(&mut event).await {
            tracing::warn!(error = %e, "failed to publish heartbeat");
        }
    }
}

/// Construct a kind 30316 lifecycle event with the stable
/// `<rig>/<role>/<instance>` discriminator.
pub fn build_lifecycle_event(
    actor: &str,
    rig: &str,
    role: &str,
    instance: &str,
    content: &LifecycleContent,
) -> Event {
    let d_tag = format!("{rig}/{role}/{instance}");

    let mut tags = base_tags(rig, role, actor);
    tags.push(replaceable_tag(&d_tag));
    tags.push(vec!["instance".to_string(), instance.to_string()]);
    tags.push(vec!["status".to_string(), content.status.clone()]);
    if !content.current_issue.is_empty() {
        tags.push(vec!["t".to_string(), content.current_issue.clone()]);
    }
    if !content.model.is_empty() {
        tags.push(vec!["model".to_string(), content.model.clone()]);
    }

    let content_json = serde_json::to_string(content).unwrap_or_default();
    Event::new(KIND_LIFECYCLE, tags, content_json)
}

/// Publish an authoritative `dead` event for another agent. Called by the
/// supervisor when it observes a stale or crashed agent.
pub async fn publish_death(
    publisher: &Publisher,
    actor: &str,
    rig: &str,
    role: &str,
    instance: &str,
) -> Result<(), PublishError> {
    let content = LifecycleContent {
        schema: schema_version("lifecycle", 1),
        status: LifecycleStatus::Dead.as_str().to_string(),
        role: role.to_string(),
        rig: rig.to_string(),
        instance: instance.to_string(),
        cwd: String::new(),
        started_at: String::new(),
        last_heartbeat: Utc::now().to_rfc3339(),
        current_issue: String::new(),
        model: String::new(),
    };

    let mut event = build_lifecycle_event(actor, rig, role, instance, &content);
    publisher.publish_replaceable(&mut event).await
}

/// How long without a heartbeat before an agent counts as stale.
pub fn stale_threshold(role: &str) -> Duration {
    resolve_interval(role, config::heartbeat_interval_override()) * STALE_MULTIPLIER
}

/// Cadence for a role, with the optional environment override applied.
fn resolve_interval(role: &str, override_interval: Option<Duration>) -> Duration {
    if let Some(interval) = override_interval {
        return interval;
    }
    if role == SUPERVISOR_ROLE {
        DEFAULT_SUPERVISOR_HEARTBEAT_INTERVAL
    } else {
        DEFAULT_WORKER_HEARTBEAT_INTERVAL
    }
}
