//! Event signing.
//!
//! All signing flows through the [`Signer`] trait so the backend can be
//! swapped: production agents relay sign requests to an external signer
//! service over a websocket session and never hold the identity key;
//! [`LocalSigner`] keeps a key in memory and exists for development and
//! tests.

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use futures::{SinkExt, StreamExt};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::nostr::Event;

/// Deadline for one remote sign round-trip.
const SIGN_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the signing backends.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("connecting to signer {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("signer transport: {0}")]
    Transport(String),

    #[error("signer protocol: {0}")]
    Protocol(String),

    #[error("signer request timed out after {0:?}")]
    Timeout(Duration),

    #[error("signer session is closed")]
    Closed,
}

/// Signs events. `sign` computes the canonical id, sets the pubkey, and
/// attaches the signature.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, event: &mut Event) -> Result<(), SignerError>;

    /// The signer's public key, hex-encoded.
    fn public_key(&self) -> String;

    /// Release backend resources (e.g. the signer session).
    async fn close(&self) -> Result<(), SignerError>;
}

// --- local signer (development / tests) ---

/// Signs with an in-memory Ed25519 key. Development and testing only; the
/// production path keeps keys in the external signer.
pub struct LocalSigner {
    key: SigningKey,
    pubkey: String,
}

impl LocalSigner {
    /// Build from a hex-encoded 32-byte secret key.
    pub fn from_hex(secret_hex: &str) -> Result<Self, SignerError> {
        let bytes = hex::decode(secret_hex.trim())
            .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SignerError::InvalidKey("secret key must be 32 bytes".to_string()))?;
        let key = SigningKey::from_bytes(&bytes);
        let pubkey = hex::encode(key.verifying_key().to_bytes());
        Ok(Self { key, pubkey })
    }

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let key = SigningKey::from_bytes(&bytes);
        let pubkey = hex::encode(key.verifying_key().to_bytes());
        Self { key, pubkey }
    }

    /// Verify an event's signature against its embedded pubkey and id.
    pub fn verify(event: &Event) -> bool {
        let Ok(pk_bytes) = hex::decode(&event.pubkey) else {
            return false;
        };
        let pk_bytes: [u8; 32] = match pk_bytes.try_into() {
            Ok(b) => b,
            Err(_) => return false,
        };
        let Ok(pubkey) = VerifyingKey::from_bytes(&pk_bytes) else {
            return false;
        };
        let Ok(sig_bytes) = hex::decode(&event.sig) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(&sig_bytes) else {
            return false;
        };
        event.id == event.canonical_id()
            && pubkey.verify(event.id.as_bytes(), &sig).is_ok()
    }
}

#[async_trait]
impl Signer for LocalSigner {
    async fn sign(&self, event: &mut Event) -> Result<(), SignerError> {
        event.pubkey = self.pubkey.clone();
        event.id = event.canonical_id();
        let sig = self.key.sign(event.id.as_bytes());
        event.sig = hex::encode(sig.to_bytes());
        Ok(())
    }

    fn public_key(&self) -> String {
        self.pubkey.clone()
    }

    async fn close(&self) -> Result<(), SignerError> {
        Ok(())
    }
}

// --- remote signer (production) ---

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SignerFrame {
    /// Client hello carrying the ephemeral session key.
    Connect { client_pubkey: String },
    /// Service reply with the identity's public key.
    Connected { pubkey: String },
    /// Sign request carrying the unsigned event.
    Sign { request_id: String, event: Event },
    /// Sign reply with the computed id, identity pubkey, and signature.
    Signed {
        request_id: String,
        id: String,
        pubkey: String,
        sig: String,
    },
    Error {
        #[serde(default)]
        request_id: String,
        message: String,
    },
}

/// Relays sign requests to an external signer service over a websocket
/// session. The session uses an ephemeral client key; the identity public
/// key is fetched once at connect. Requests are serialized over the single
/// session.
#[derive(Debug)]
pub struct RemoteSigner {
    url: String,
    pubkey: String,
    stream: Mutex<Option<WsStream>>,
}

impl RemoteSigner {
    /// Establish a session with the signer service at `url` (ws:// or
    /// wss://).
    pub async fn connect(url: &str) -> Result<Self, SignerError> {
        let (mut stream, _) = connect_async(url).await.map_err(|e| SignerError::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        // The session key is throwaway; it only identifies this connection.
        let session_key = LocalSigner::generate();
        let hello = SignerFrame::Connect {
            client_pubkey: session_key.public_key(),
        };
        send_frame(&mut stream, &hello).await?;

        let pubkey = match recv_frame(&mut stream).await? {
            SignerFrame::Connected { pubkey } => pubkey,
            SignerFrame::Error { message, .. } => {
                return Err(SignerError::Protocol(message));
            }
            other => {
                return Err(SignerError::Protocol(format!(
                    "unexpected frame during connect: {other:?}"
                )))
            }
        };

        tracing::info!(url, pubkey = %pubkey, "signer session established");

        Ok(Self {
            url: url.to_string(),
            pubkey,
            stream: Mutex::new(Some(stream)),
        })
    }
}

async fn send_frame(stream: &mut WsStream, frame: &SignerFrame) -> Result<(), SignerError> {
    let text = serde_json::to_string(frame).map_err(|e| SignerError::Protocol(e.to_string()))?;
    stream
        .send(WsMessage::Text(text))
        .await
        .map_err(|e| SignerError::Transport(e.to_string()))
}

async fn recv_frame(stream: &mut WsStream) -> Result<SignerFrame, SignerError> {
    loop {
        let msg = tokio::time::timeout(SIGN_TIMEOUT, stream.next())
            .await
            .map_err(|_| SignerError::Timeout(SIGN_TIMEOUT))?
            .ok_or(SignerError::Closed)?
            .map_err(|e| SignerError::Transport(e.to_string()))?;

        match msg {
            WsMessage::Text(text) => {
                return serde_json::from_str(&text)
                    .map_err(|e| SignerError::Protocol(e.to_string()));
            }
            WsMessage::Close(_) => return Err(SignerError::Closed),
            // Ping/pong and binary frames are transport noise here.
            _ => continue,
        }
    }
}

#[async_trait]
impl Signer for RemoteSigner {
    async fn sign(&self, event: &mut Event) -> Result<(), SignerError> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(SignerError::Closed)?;

        let request_id = uuid::Uuid::new_v4().to_string();
        let request = SignerFrame::Sign {
            request_id: request_id.clone(),
            event: event.clone(),
        };
        send_frame(stream, &request).await?;

        loop {
            match recv_frame(stream).await? {
                SignerFrame::Signed {
                    request_id: rid,
                    id,
                    pubkey,
                    sig,
                } if rid == request_id => {
                    event.id = id;
                    event.pubkey = pubkey;
                    event.sig = sig;
                    return Ok(());
                }
                SignerFrame::Error {
                    request_id: rid,
                    message,
                } if rid == request_id || rid.is_empty() => {
                    return Err(SignerError::Protocol(message));
                }
                // A reply for an older request that already timed out.
                _ => continue,
            }
        }
    }

    fn public_key(&self) -> String {
        self.pubkey.clone()
    }

    async fn close(&self) -> Result<(), SignerError> {
        let mut guard = self.stream.lock().await;
        if let Some(mut stream) = guard.take() {
            let _ = stream.send(WsMessage::Close(None)).await;
        }
        tracing::debug!(url = %self.url, "signer session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nostr::{event::new_log_status, KIND_LOG_STATUS};

    fn sample_event() -> Event {
        new_log_status("r", "polecat", "r/polecats/Nux", "sling", "feed", &serde_json::json!({}))
    }

    #[tokio::test]
    async fn test_local_signer_produces_verifiable_signature() {
        let signer = LocalSigner::generate();
        let mut event = sample_event();
        signer.sign(&mut event).await.unwrap();

        assert!(event.is_signed());
        assert_eq!(event.pubkey, signer.public_key());
        assert_eq!(event.id, event.canonical_id());
        assert!(LocalSigner::verify(&event));
    }

    #[tokio::test]
    async fn test_tampered_event_fails_verification() {
        let signer = LocalSigner::generate();
        let mut event = sample_event();
        signer.sign(&mut event).await.unwrap();

        event.content.push_str("tampered");
        assert!(!LocalSigner::verify(&event));
    }

    #[tokio::test]
    async fn test_same_input_same_timestamp_same_id() {
        let signer = LocalSigner::generate();
        let mut a = sample_event();
        a.created_at = 1_700_000_000;
        let mut b = a.clone();

        signer.sign(&mut a).await.unwrap();
        signer.sign(&mut b).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.sig, b.sig);
    }

    #[test]
    fn test_from_hex_round_trip() {
        let original = LocalSigner::generate();
        let secret_hex = hex::encode(original.key.to_bytes());
        let restored = LocalSigner::from_hex(&secret_hex).unwrap();
        assert_eq!(original.public_key(), restored.public_key());
    }

    #[test]
    fn test_from_hex_rejects_bad_material() {
        assert!(matches!(
            LocalSigner::from_hex("not-hex"),
            Err(SignerError::InvalidKey(_))
        ));
        assert!(matches!(
            LocalSigner::from_hex("abcd"),
            Err(SignerError::InvalidKey(_))
        ));
    }

    /// Minimal in-process signer service speaking the session protocol.
    async fn spawn_signer_service() -> (std::net::SocketAddr, String) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let identity = std::sync::Arc::new(LocalSigner::generate());
        let pubkey = identity.public_key();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();

            while let Some(Ok(msg)) = ws.next().await {
                let WsMessage::Text(text) = msg else { continue };
                match serde_json::from_str::<SignerFrame>(&text).unwrap() {
                    SignerFrame::Connect { .. } => {
                        let reply = SignerFrame::Connected {
                            pubkey: identity.public_key(),
                        };
                        ws.send(WsMessage::Text(serde_json::to_string(&reply).unwrap()))
                            .await
                            .unwrap();
                    }
                    SignerFrame::Sign { request_id, mut event } => {
                        identity.sign(&mut event).await.unwrap();
                        let reply = SignerFrame::Signed {
                            request_id,
                            id: event.id,
                            pubkey: event.pubkey,
                            sig: event.sig,
                        };
                        ws.send(WsMessage::Text(serde_json::to_string(&reply).unwrap()))
                            .await
                            .unwrap();
                    }
                    _ => {}
                }
            }
        });

        (addr, pubkey)
    }

    #[tokio::test]
    async fn test_remote_signer_session_round_trip() {
        let (addr, identity_pubkey) = spawn_signer_service().await;

        let signer = RemoteSigner::connect(&format!("ws://{addr}")).await.unwrap();
        assert_eq!(signer.public_key(), identity_pubkey);

        let mut event = sample_event();
        signer.sign(&mut event).await.unwrap();

        assert!(event.is_signed());
        assert_eq!(event.kind, KIND_LOG_STATUS);
        assert_eq!(event.pubkey, identity_pubkey);
        assert!(LocalSigner::verify(&event));

        signer.close().await.unwrap();
        let mut another = sample_event();
        assert!(matches!(
            signer.sign(&mut another).await,
            Err(SignerError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_remote_signer_connect_failure() {
        let err = RemoteSigner::connect("ws://127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, SignerError::Connect { .. }));
    }
}
