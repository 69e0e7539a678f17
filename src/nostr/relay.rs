//! Relay connections and the read/write relay pool.
//!
//! A relay speaks JSON frames over a websocket: `["EVENT", event]` out,
//! `["OK", id, accepted, message]` back, `["REQ", sub, filter]` for
//! subscriptions. The pool fans writes out to every write relay in
//! parallel and succeeds when at least one accepts; consumers of the event
//! network must tolerate duplicates and out-of-order arrival.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::NostrConfig;
use crate::nostr::Event;

/// Deadline for a relay to acknowledge one event.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for the initial websocket connect.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Buffered events per subscription before backpressure.
const SUBSCRIPTION_BUFFER: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Errors from relay transport and acknowledgment.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("connecting to relay {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("relay transport: {0}")]
    Transport(String),

    #[error("relay {url} rejected event: {reason}")]
    Rejected { url: String, reason: String },

    #[error("relay {url} did not acknowledge within {timeout:?}")]
    PublishTimeout { url: String, timeout: Duration },

    #[error("relay pool is closed")]
    Closed,

    #[error("no write relays connected")]
    NoWriteRelays,

    #[error("all write relays failed, last error: {last}")]
    AllRelaysFailed { last: String },
}

/// Where the publisher hands events off. Implemented by [`RelayPool`] and
/// stubbed in tests.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one signed event. Succeeds when at least one write relay
    /// accepts it.
    async fn publish(&self, event: &Event) -> Result<(), RelayError>;

    /// The configured write relay URLs (spooled events retry against
    /// these).
    fn write_relay_urls(&self) -> Vec<String>;
}

/// Subscription request filter. Empty fields are omitted on the wire.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<u32>,
    #[serde(rename = "#d", skip_serializing_if = "Vec::is_empty")]
    pub d_tags: Vec<String>,
    #[serde(rename = "#t", skip_serializing_if = "Vec::is_empty")]
    pub issue_tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

/// Events delivered for one subscription on one relay.
pub struct Subscription {
    pub id: String,
    pub relay_url: String,
    pub events: mpsc::Receiver<Event>,
}

/// One relay connection. A background task reads acknowledgments and
/// subscription events off the socket.
#[derive(Debug)]
pub struct Relay {
    url: String,
    writer: tokio::sync::Mutex<SplitSink<WsStream, WsMessage>>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<(bool, String)>>>>,
    subscriptions: Arc<Mutex<HashMap<String, mpsc::Sender<Event>>>>,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Relay {
    /// Connect to a relay URL (ws:// or wss://).
    pub async fn connect(url: &str) -> Result<Self, RelayError> {
        let (stream, _) = tokio::time::timeout(DEFAULT_CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| RelayError::Connect {
                url: url.to_string(),
                reason: "connect timed out".to_string(),
            })?
            .map_err(|e| RelayError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let (writer, reader_half) = stream.split();
        let pending = Arc::new(Mutex::new(HashMap::new()));
        let subscriptions = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(read_loop(
            url.to_string(),
            reader_half,
            pending.clone(),
            subscriptions.clone(),
            connected.clone(),
        ));

        Ok(Self {
            url: url.to_string(),
            writer: tokio::sync::Mutex::new(writer),
            pending,
            subscriptions,
            connected,
            reader,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send one event and wait for the relay's acknowledgment.
    pub async fn publish(&self, event: &Event) -> Result<(), RelayError> {
        if !self.is_connected() {
            return Err(RelayError::Transport(format!("{} is disconnected", self.url)));
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(event.id.clone(), ack_tx);

        let frame = serde_json::json!(["EVENT", event]).to_string();
        {
            let mut writer = self.writer.lock().await;
            writer
                .send(WsMessage::Text(frame))
                .await
                .map_err(|e| RelayError::Transport(e.to_string()))?;
        }

        match tokio::time::timeout(DEFAULT_PUBLISH_TIMEOUT, ack_rx).await {
            Ok(Ok((true, _))) => Ok(()),
            Ok(Ok((false, reason))) => Err(RelayError::Rejected {
                url: self.url.clone(),
                reason,
            }),
            Ok(Err(_)) => Err(RelayError::Transport(format!("{} closed mid-publish", self.url))),
            Err(_) => {
                self.pending.lock().unwrap().remove(&event.id);
                Err(RelayError::PublishTimeout {
                    url: self.url.clone(),
                    timeout: DEFAULT_PUBLISH_TIMEOUT,
                })
            }
        }
    }

    /// Open a subscription for a filter. The caller drains the returned
    /// channel.
    pub async fn subscribe(&self, filter: &Filter) -> Result<Subscription, RelayError> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscriptions.lock().unwrap().insert(id.clone(), tx);

        let frame = serde_json::json!(["REQ", id, filter]).to_string();
        let mut writer = self.writer.lock().await;
        writer
            .send(WsMessage::Text(frame))
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        Ok(Subscription {
            id,
            relay_url: self.url.clone(),
            events: rx,
        })
    }

    /// Close the connection and stop the read task.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        let _ = writer.send(WsMessage::Close(None)).await;
        self.reader.abort();
    }
}

async fn read_loop(
    url: String,
    mut reader: SplitStream<WsStream>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<(bool, String)>>>>,
    subscriptions: Arc<Mutex<HashMap<String, mpsc::Sender<Event>>>>,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg) = reader.next().await {
        let text = match msg {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) | Err(_) => break,
            _ => continue,
        };

        let Ok(frame) = serde_json::from_str::<serde_json::Value>(&text) else {
            tracing::debug!(relay = %url, "skipping malformed frame");
            continue;
        };
        let Some(kind) = frame.get(0).and_then(|v| v.as_str()) else {
            continue;
        };

        match kind {
            "OK" => {
                let id = frame.get(1).and_then(|v| v.as_str()).unwrap_or_default();
                let accepted = frame.get(2).and_then(|v| v.as_bool()).unwrap_or(false);
                let reason = frame
                    .get(3)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                if let Some(tx) = pending.lock().unwrap().remove(id) {
                    let _ = tx.send((accepted, reason));
                }
            }
            "EVENT" => {
                let sub_id = frame.get(1).and_then(|v| v.as_str()).unwrap_or_default();
                let Some(event) = frame
                    .get(2)
                    .and_then(|v| serde_json::from_value::<Event>(v.clone()).ok())
                else {
                    continue;
                };
                let tx = subscriptions.lock().unwrap().get(sub_id).cloned();
                if let Some(tx) = tx {
                    // A slow consumer drops events; replaceable kinds
                    // resync on the next copy.
                    let _ = tx.try_send(event);
                }
            }
            "EOSE" | "NOTICE" => {
                tracing::debug!(relay = %url, frame = %text, "relay notice");
            }
            _ => {}
        }
    }

    connected.store(false, Ordering::SeqCst);
    tracing::debug!(relay = %url, "relay read loop ended");
}

/// Connections to the configured read and write relays.
pub struct RelayPool {
    read_urls: Vec<String>,
    write_urls: Vec<String>,
    read_relays: RwLock<Vec<Arc<Relay>>>,
    write_relays: RwLock<Vec<Arc<Relay>>>,
    closed: AtomicBool,
}

impl RelayPool {
    /// Connect to every configured relay. Individual connect failures log
    /// and continue; the pool is usable with any subset connected.
    pub async fn connect(cfg: &NostrConfig) -> Self {
        let mut write_relays = Vec::new();
        for url in &cfg.write_relays {
            match Relay::connect(url).await {
                Ok(relay) => write_relays.push(Arc::new(relay)),
                Err(e) => tracing::warn!(url, error = %e, "failed to connect to write relay"),
            }
        }

        let mut read_relays = Vec::new();
        for url in &cfg.read_relays {
            match Relay::connect(url).await {
                Ok(relay) => read_relays.push(Arc::new(relay)),
                Err(e) => tracing::warn!(url, error = %e, "failed to connect to read relay"),
            }
        }

        Self {
            read_urls: cfg.read_relays.clone(),
            write_urls: cfg.write_relays.clone(),
            read_relays: RwLock::new(read_relays),
            write_relays: RwLock::new(write_relays),
            closed: AtomicBool::new(false),
        }
    }

    /// Subscribe on every read relay; one subscription per relay.
    pub async fn subscribe(&self, filter: &Filter) -> Vec<Subscription> {
        let relays = self.read_relays.read().await.clone();
        let mut subs = Vec::new();
        for relay in relays {
            match relay.subscribe(filter).await {
                Ok(sub) => subs.push(sub),
                Err(e) => tracing::warn!(url = relay.url(), error = %e, "subscribe failed"),
            }
        }
        subs
    }

    /// Replace any relay whose connection has dropped. Call periodically
    /// from a health task.
    pub async fn reconnect(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        for relays in [&self.write_relays, &self.read_relays] {
            let mut guard = relays.write().await;
            for slot in guard.iter_mut() {
                if !slot.is_connected() {
                    tracing::info!(url = slot.url(), "reconnecting relay");
                    match Relay::connect(slot.url()).await {
                        Ok(fresh) => *slot = Arc::new(fresh),
                        Err(e) => {
                            tracing::warn!(url = slot.url(), error = %e, "reconnect failed")
                        }
                    }
                }
            }
        }
    }

    /// Count of write relays currently connected.
    pub async fn connected_write_relays(&self) -> usize {
        self.write_relays
            .read()
            .await
            .iter()
            .filter(|r| r.is_connected())
            .count()
    }

    /// Log the connection state of every relay.
    pub async fn health_check(&self) {
        for relay in self.write_relays.read().await.iter() {
            tracing::info!(url = relay.url(), connected = relay.is_connected(), "write relay");
        }
        for relay in self.read_relays.read().await.iter() {
            tracing::info!(url = relay.url(), connected = relay.is_connected(), "read relay");
        }
    }

    /// URLs of the configured read relays.
    pub fn read_relay_urls(&self) -> Vec<String> {
        self.read_urls.clone()
    }

    /// Disconnect everything.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for relay in self.write_relays.write().await.drain(..) {
            relay.close().await;
        }
        for relay in self.read_relays.write().await.drain(..) {
            relay.close().await;
        }
    }
}

#[async_trait]
impl EventSink for RelayPool {
    async fn publish(&self, event: &Event) -> Result<(), RelayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Closed);
        }

        let relays = self.write_relays.read().await.clone();
        if relays.is_empty() {
            return Err(RelayError::NoWriteRelays);
        }

        // Fan out to every write relay in parallel; order across relays is
        // not guaranteed.
        let results =
            futures::future::join_all(relays.iter().map(|relay| relay.publish(event))).await;

        let mut successes = 0;
        let mut last_err = None;
        for (relay, result) in relays.iter().zip(results) {
            match result {
                Ok(()) => successes += 1,
                Err(e) => {
                    tracing::warn!(url = relay.url(), error = %e, "publish failed");
                    last_err = Some(e);
                }
            }
        }

        if successes == 0 {
            return Err(RelayError::AllRelaysFailed {
                last: last_err.map(|e| e.to_string()).unwrap_or_default(),
            });
        }
        Ok(())
    }

    fn write_relay_urls(&self) -> Vec<String> {
        self.write_urls.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nostr::event::new_log_status;
    use crate::nostr::signer::{LocalSigner, Signer};

    /// In-process relay: records events and acknowledges per `accept`.
    async fn spawn_mock_relay(accept: bool) -> (String, Arc<Mutex<Vec<Event>>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else { break };
                let seen = seen_clone.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(socket).await else {
                        return;
                    };
                    while let Some(Ok(msg)) = ws.next().await {
                        let WsMessage::Text(text) = msg else { continue };
                        let Ok(frame) = serde_json::from_str::<serde_json::Value>(&text) else {
                            continue;
                        };
                        if frame[0] == "EVENT" {
                            let event: Event = serde_json::from_value(frame[1].clone()).unwrap();
                            let id = event.id.clone();
                            seen.lock().unwrap().push(event);
                            let reply = serde_json::json!(["OK", id, accept, ""]).to_string();
                            let _ = ws.send(WsMessage::Text(reply)).await;
                        }
                    }
                });
            }
        });

        (format!("ws://{addr}"), seen)
    }

    async fn signed_event() -> Event {
        let signer = LocalSigner::generate();
        let mut event =
            new_log_status("r", "polecat", "r/polecats/Nux", "test", "feed", &serde_json::json!({}));
        signer.sign(&mut event).await.unwrap();
        event
    }

    #[tokio::test]
    async fn test_relay_publish_acknowledged() {
        let (url, seen) = spawn_mock_relay(true).await;
        let relay = Relay::connect(&url).await.unwrap();
        assert!(relay.is_connected());

        let event = signed_event().await;
        relay.publish(&event).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(seen.lock().unwrap()[0].id, event.id);

        relay.close().await;
    }

    #[tokio::test]
    async fn test_relay_publish_rejected() {
        let (url, _seen) = spawn_mock_relay(false).await;
        let relay = Relay::connect(&url).await.unwrap();

        let event = signed_event().await;
        let err = relay.publish(&event).await.unwrap_err();
        assert!(matches!(err, RelayError::Rejected { .. }));

        relay.close().await;
    }

    #[tokio::test]
    async fn test_relay_connect_failure() {
        let err = Relay::connect("ws://127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, RelayError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_pool_succeeds_when_any_relay_accepts() {
        let (good_url, good_seen) = spawn_mock_relay(true).await;
        let (bad_url, _) = spawn_mock_relay(false).await;

        let pool = RelayPool::connect(&NostrConfig {
            write_relays: vec![bad_url, good_url],
            ..Default::default()
        })
        .await;
        assert_eq!(pool.connected_write_relays().await, 2);

        let event = signed_event().await;
        pool.publish(&event).await.unwrap();
        assert_eq!(good_seen.lock().unwrap().len(), 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_pool_fails_when_all_relays_reject() {
        let (a, _) = spawn_mock_relay(false).await;
        let (b, _) = spawn_mock_relay(false).await;

        let pool = RelayPool::connect(&NostrConfig {
            write_relays: vec![a, b],
            ..Default::default()
        })
        .await;

        let event = signed_event().await;
        let err = pool.publish(&event).await.unwrap_err();
        assert!(matches!(err, RelayError::AllRelaysFailed { .. }));

        pool.close().await;
    }

    #[tokio::test]
    async fn test_pool_with_no_relays() {
        let pool = RelayPool::connect(&NostrConfig::default()).await;
        let event = signed_event().await;
        assert!(matches!(
            pool.publish(&event).await,
            Err(RelayError::NoWriteRelays)
        ));
    }

    #[tokio::test]
    async fn test_pool_closed_rejects_publish() {
        let pool = RelayPool::connect(&NostrConfig::default()).await;
        pool.close().await;
        let event = signed_event().await;
        assert!(matches!(pool.publish(&event).await, Err(RelayError::Closed)));
    }

    #[test]
    fn test_filter_serialization_omits_empty_fields() {
        let filter = Filter {
            kinds: vec![30316],
            d_tags: vec!["rig/polecat/Nux".to_string()],
            ..Default::default()
        };
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json, serde_json::json!({"kinds": [30316], "#d": ["rig/polecat/Nux"]}));
    }

    #[tokio::test]
    async fn test_write_relay_urls_reports_configuration() {
        let pool = RelayPool::connect(&NostrConfig {
            write_relays: vec!["ws://127.0.0.1:1".to_string()],
            ..Default::default()
        })
        .await;
        // The relay never connected, but the configured URL is still the
        // spool retry target.
        assert_eq!(pool.write_relay_urls(), vec!["ws://127.0.0.1:1".to_string()]);
    }
}
