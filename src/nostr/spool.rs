//! Local event spool for offline resilience.
//!
//! When every write relay refuses an event, it lands here: an append-only
//! JSONL file in the runtime directory, mode 0600. A periodic drain retries
//! entries against the relay pool under a per-entry backoff gate; entries
//! older than a day move to a sibling archive file. The spool assumes a
//! single owner process and serializes access with an in-process lock.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::nostr::relay::EventSink;
use crate::nostr::{Event, Tag};

/// Warn threshold for queued entries.
pub const DEFAULT_SOFT_LIMIT: usize = 10_000;
/// Enqueue rejection threshold.
pub const DEFAULT_HARD_LIMIT: usize = 100_000;
/// Active spool file name inside the runtime directory.
pub const SPOOL_FILE_NAME: &str = "nostr-spool.jsonl";
/// Archive file name for aged-out entries.
pub const SPOOL_ARCHIVE_FILE_NAME: &str = "nostr-spool-archive.jsonl";
/// Entries older than this are archived.
pub const SPOOL_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors from spool persistence.
#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("spool hard limit exceeded ({0} events); requires operator intervention")]
    HardLimitExceeded(usize),

    #[error("spool I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("spool serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Retry bookkeeping attached to each spooled event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolMeta {
    pub spooled_at: DateTime<Utc>,
    pub target_relays: Vec<String>,
    pub attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// One spooled event with retry metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolEntry {
    pub id: String,
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Tag>,
    pub content: String,
    pub pubkey: String,
    pub sig: String,
    pub spool_meta: SpoolMeta,
}

impl SpoolEntry {
    fn from_event(event: &Event, target_relays: &[String]) -> Self {
        Self {
            id: event.id.clone(),
            created_at: event.created_at,
            kind: event.kind,
            tags: event.tags.clone(),
            content: event.content.clone(),
            pubkey: event.pubkey.clone(),
            sig: event.sig.clone(),
            spool_meta: SpoolMeta {
                spooled_at: Utc::now(),
                target_relays: target_relays.to_vec(),
                attempts: 0,
                last_attempt: None,
                last_error: None,
            },
        }
    }

    fn to_event(&self) -> Event {
        Event {
            id: self.id.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
            pubkey: self.pubkey.clone(),
            sig: self.sig.clone(),
        }
    }
}

/// Result of one drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub sent: usize,
    pub failed: usize,
}

/// The on-disk spool.
pub struct Spool {
    path: PathBuf,
    archive_path: PathBuf,
    soft_limit: usize,
    hard_limit: usize,
    lock: Mutex<()>,
}

impl Spool {
    /// Create a spool rooted in the runtime directory.
    pub fn new(runtime_dir: impl AsRef<Path>) -> Self {
        let dir = runtime_dir.as_ref();
        Self {
            path: dir.join(SPOOL_FILE_NAME),
            archive_path: dir.join(SPOOL_ARCHIVE_FILE_NAME),
            soft_limit: DEFAULT_SOFT_LIMIT,
            hard_limit: DEFAULT_HARD_LIMIT,
            lock: Mutex::new(()),
        }
    }

    /// Override the limits (tests and constrained deployments).
    pub fn with_limits(mut self, soft: usize, hard: usize) -> Self {
        self.soft_limit = soft;
        self.hard_limit = hard;
        self
    }

    /// Append one event. Fails once the hard limit is reached.
    pub async fn enqueue(&self, event: &Event, target_relays: &[String]) -> Result<(), SpoolError> {
        let _guard = self.lock.lock().await;

        let count = self.count_locked();
        if count >= self.hard_limit {
            return Err(SpoolError::HardLimitExceeded(count));
        }
        if count >= self.soft_limit {
            tracing::warn!(count, "spool soft limit reached");
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let entry = SpoolEntry::from_event(event, target_relays);
        let line = serde_json::to_string(&entry)?;

        let mut file = open_append_0600(&self.path)?;
        writeln!(file, "{line}")?;

        Ok(())
    }

    /// Retry every gated-in entry against the sink. Delivered entries are
    /// dropped; failures stay with bumped attempt metadata. The active file
    /// is rewritten atomically with whatever remains.
    pub async fn drain(&self, sink: &dyn EventSink) -> Result<DrainStats, SpoolError> {
        let _guard = self.lock.lock().await;

        let entries = self.read_all_locked()?;
        if entries.is_empty() {
            return Ok(DrainStats::default());
        }

        let now = Utc::now();
        let mut stats = DrainStats::default();
        let mut remaining = Vec::new();

        for mut entry in entries {
            // Backoff gate: recently failed entries wait their turn.
            if let Some(last) = entry.spool_meta.last_attempt {
                let wait = backoff_duration(entry.spool_meta.attempts);
                let elapsed = (now - last).to_std().unwrap_or_default();
                if elapsed < wait {
                    remaining.push(entry);
                    continue;
                }
            }

            match sink.publish(&entry.to_event()).await {
                Ok(()) => stats.sent += 1,
                Err(e) => {
                    entry.spool_meta.attempts += 1;
                    entry.spool_meta.last_attempt = Some(now);
                    entry.spool_meta.last_error = Some(e.to_string());
                    remaining.push(entry);
                    stats.failed += 1;
                }
            }
        }

        self.write_all_locked(&remaining)?;
        Ok(stats)
    }

    /// Number of queued entries.
    pub async fn count(&self) -> usize {
        let _guard = self.lock.lock().await;
        self.count_locked()
    }

    /// Move entries older than `max_age` to the archive file.
    pub async fn archive_old(&self, max_age: Duration) -> Result<usize, SpoolError> {
        let _guard = self.lock.lock().await;

        let entries = self.read_all_locked()?;
        let now = Utc::now();

        let (old, active): (Vec<_>, Vec<_>) = entries.into_iter().partition(|entry| {
            (now - entry.spool_meta.spooled_at)
                .to_std()
                .unwrap_or_default()
                > max_age
        });

        if old.is_empty() {
            return Ok(0);
        }

        let mut archive = open_append_0600(&self.archive_path)?;
        for entry in &old {
            let line = serde_json::to_string(entry)?;
            writeln!(archive, "{line}")?;
        }

        self.write_all_locked(&active)?;
        Ok(old.len())
    }

    fn count_locked(&self) -> usize {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => content.lines().filter(|l| !l.is_empty()).count(),
            Err(_) => 0,
        }
    }

    fn read_all_locked(&self) -> Result<Vec<SpoolEntry>, SpoolError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for line in content.lines() {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(error = %e, "skipping malformed spool entry"),
            }
        }
        Ok(entries)
    }

    /// Rewrite the active file atomically: write a temp sibling, then
    /// rename over the original.
    fn write_all_locked(&self, entries: &[SpoolEntry]) -> Result<(), SpoolError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("jsonl.tmp");
        {
            let mut tmp = open_truncate_0600(&tmp_path)?;
            for entry in entries {
                let line = serde_json::to_string(entry)?;
                writeln!(tmp, "{line}")?;
            }
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

/// Backoff before retrying an entry, by attempt count: 0, 30 s, 60 s,
/// 120 s, then capped at 5 minutes.
pub fn backoff_duration(attempts: u32) -> Duration {
    match attempts {
        0 => Duration::ZERO,
        1 => Duration::from_secs(30),
        2 => Duration::from_secs(60),
        3 => Duration::from_secs(120),
        _ => Duration::from_secs(300),
    }
}

fn open_append_0600(path: &Path) -> std::io::Result<std::fs::File> {
    let mut options = std::fs::OpenOptions::new();
    options.append(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

fn open_truncate_0600(path: &Path) -> std::io::Result<std::fs::File> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nostr::event::new_log_status;
    use crate::nostr::relay::RelayError;
    use crate::nostr::signer::{LocalSigner, Signer};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    /// Sink whose acceptance is toggled at runtime.
    struct ToggleSink {
        accept: AtomicBool,
        delivered: StdMutex<Vec<Event>>,
    }

    impl ToggleSink {
        fn new(accept: bool) -> Self {
            Self {
                accept: AtomicBool::new(accept),
                delivered: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EventSink for ToggleSink {
        async fn publish(&self, event: &Event) -> Result<(), RelayError> {
            if self.accept.load(Ordering::SeqCst) {
                self.delivered.lock().unwrap().push(event.clone());
                Ok(())
            } else {
                Err(RelayError::AllRelaysFailed {
                    last: "refused".to_string(),
                })
            }
        }

        fn write_relay_urls(&self) -> Vec<String> {
            vec!["ws://relay.test".to_string()]
        }
    }

    async fn signed_event() -> Event {
        let signer = LocalSigner::generate();
        let mut event =
            new_log_status("r", "polecat", "r/polecats/Nux", "test", "feed", &serde_json::json!({}));
        signer.sign(&mut event).await.unwrap();
        event
    }

    #[tokio::test]
    async fn test_enqueue_and_count() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::new(dir.path());

        assert_eq!(spool.count().await, 0);
        let event = signed_event().await;
        spool.enqueue(&event, &["ws://a".to_string()]).await.unwrap();
        spool.enqueue(&event, &["ws://a".to_string()]).await.unwrap();
        assert_eq!(spool.count().await, 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spool_file_is_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let spool = Spool::new(dir.path());
        spool.enqueue(&signed_event().await, &[]).await.unwrap();

        let mode = std::fs::metadata(dir.path().join(SPOOL_FILE_NAME))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_drain_delivers_and_empties() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::new(dir.path());
        let event = signed_event().await;
        spool.enqueue(&event, &[]).await.unwrap();

        let sink = ToggleSink::new(true);
        let stats = spool.drain(&sink).await.unwrap();
        assert_eq!(stats, DrainStats { sent: 1, failed: 0 });
        assert_eq!(spool.count().await, 0);
        assert_eq!(sink.delivered.lock().unwrap().len(), 1);
        assert_eq!(sink.delivered.lock().unwrap()[0].id, event.id);
    }

    #[tokio::test]
    async fn test_drain_failure_bumps_attempts_and_keeps_entry() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::new(dir.path());
        spool.enqueue(&signed_event().await, &[]).await.unwrap();

        let sink = ToggleSink::new(false);
        let stats = spool.drain(&sink).await.unwrap();
        assert_eq!(stats, DrainStats { sent: 0, failed: 1 });
        assert_eq!(spool.count().await, 1);

        let entries = spool.read_all_locked().unwrap();
        assert_eq!(entries[0].spool_meta.attempts, 1);
        assert!(entries[0].spool_meta.last_attempt.is_some());
        assert!(entries[0].spool_meta.last_error.as_ref().unwrap().contains("refused"));
    }

    #[tokio::test]
    async fn test_backoff_gate_skips_recent_failures() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::new(dir.path());
        spool.enqueue(&signed_event().await, &[]).await.unwrap();

        // First drain fails and stamps last_attempt = now.
        let failing = ToggleSink::new(false);
        spool.drain(&failing).await.unwrap();

        // Second drain immediately after: the entry is gated, not retried.
        let accepting = ToggleSink::new(true);
        let stats = spool.drain(&accepting).await.unwrap();
        assert_eq!(stats, DrainStats::default());
        assert_eq!(spool.count().await, 1);
        assert!(accepting.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hard_limit_rejects_enqueue() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::new(dir.path()).with_limits(1, 2);
        let event = signed_event().await;

        spool.enqueue(&event, &[]).await.unwrap();
        spool.enqueue(&event, &[]).await.unwrap();
        let err = spool.enqueue(&event, &[]).await.unwrap_err();
        assert!(matches!(err, SpoolError::HardLimitExceeded(2)));
        assert_eq!(spool.count().await, 2);
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::new(dir.path());
        spool.enqueue(&signed_event().await, &[]).await.unwrap();

        // Corrupt the file with a partial line.
        let mut file = open_append_0600(&dir.path().join(SPOOL_FILE_NAME)).unwrap();
        writeln!(file, "{{not json").unwrap();
        drop(file);

        let entries = spool.read_all_locked().unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_archive_old_moves_aged_entries() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::new(dir.path());
        let event = signed_event().await;
        spool.enqueue(&event, &[]).await.unwrap();
        spool.enqueue(&event, &[]).await.unwrap();

        // Age the first entry by rewriting its spooled_at.
        let mut entries = spool.read_all_locked().unwrap();
        entries[0].spool_meta.spooled_at = Utc::now() - chrono::Duration::hours(48);
        spool.write_all_locked(&entries).unwrap();

        let archived = spool.archive_old(SPOOL_MAX_AGE).await.unwrap();
        assert_eq!(archived, 1);
        assert_eq!(spool.count().await, 1);

        let archive = std::fs::read_to_string(dir.path().join(SPOOL_ARCHIVE_FILE_NAME)).unwrap();
        assert_eq!(archive.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_archive_noop_when_nothing_is_old() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::new(dir.path());
        spool.enqueue(&signed_event().await, &[]).await.unwrap();

        let archived = spool.archive_old(SPOOL_MAX_AGE).await.unwrap();
        assert_eq!(archived, 0);
        assert_eq!(spool.count().await, 1);
        assert!(!dir.path().join(SPOOL_ARCHIVE_FILE_NAME).exists());
    }

    #[test]
    fn test_backoff_table() {
        assert_eq!(backoff_duration(0), Duration::ZERO);
        assert_eq!(backoff_duration(1), Duration::from_secs(30));
        assert_eq!(backoff_duration(2), Duration::from_secs(60));
        assert_eq!(backoff_duration(3), Duration::from_secs(120));
        assert_eq!(backoff_duration(4), Duration::from_secs(300));
        assert_eq!(backoff_duration(100), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_entry_round_trips_event_fields() {
        let event = signed_event().await;
        let entry = SpoolEntry::from_event(&event, &["ws://a".to_string()]);
        assert_eq!(entry.to_event(), event);
        assert_eq!(entry.spool_meta.target_relays, vec!["ws://a".to_string()]);
    }
}
