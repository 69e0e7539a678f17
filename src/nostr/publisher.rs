//! The high-level publish path: sign → broadcast → spool on total failure.
//!
//! All orchestrator event publishing goes through [`Publisher`]. A publish
//! only fails outright when both the relay broadcast and the spool fall
//! over; a spooled event counts as success and drains later.

use std::sync::Arc;

use thiserror::Error;

use crate::nostr::relay::EventSink;
use crate::nostr::signer::{Signer, SignerError};
use crate::nostr::spool::{DrainStats, Spool, SpoolError};
use crate::nostr::Event;

/// Errors from the publish path.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("signing event: {0}")]
    Signing(#[from] SignerError),

    #[error("replaceable event must have a 'd' tag")]
    InvalidReplaceable,

    /// Broadcast and spool both failed; the event is lost.
    #[error("publish failed ({publish}) and spool failed: {spool}")]
    Failed {
        publish: crate::nostr::relay::RelayError,
        spool: SpoolError,
    },
}

/// Signs events and fans them out to the relay set, spooling on total
/// failure.
pub struct Publisher {
    signer: Arc<dyn Signer>,
    sink: Arc<dyn EventSink>,
    spool: Spool,
}

impl Publisher {
    /// Assemble a publisher from its parts. `sink` is normally a
    /// [`crate::nostr::RelayPool`]; tests substitute a stub.
    pub fn new(signer: Arc<dyn Signer>, sink: Arc<dyn EventSink>, spool: Spool) -> Self {
        Self { signer, sink, spool }
    }

    /// Sign and broadcast a regular (append-only) event. If every write
    /// relay fails, the event is spooled and the call still succeeds.
    pub async fn publish(&self, event: &mut Event) -> Result<(), PublishError> {
        self.signer.sign(event).await?;

        if let Err(publish_err) = self.sink.publish(event).await {
            tracing::warn!(id = %event.id, error = %publish_err, "publish failed, spooling event");
            match self.spool.enqueue(event, &self.sink.write_relay_urls()).await {
                Ok(()) => return Ok(()),
                Err(spool_err) => {
                    return Err(PublishError::Failed {
                        publish: publish_err,
                        spool: spool_err,
                    })
                }
            }
        }

        Ok(())
    }

    /// Sign and broadcast a parameterized replaceable event. The event must
    /// carry a "d" discriminator tag.
    pub async fn publish_replaceable(&self, event: &mut Event) -> Result<(), PublishError> {
        if !event.has_d_tag() {
            return Err(PublishError::InvalidReplaceable);
        }
        self.publish(event).await
    }

    /// Retry spooled events against the relay set. Called periodically by
    /// the supervising daemon.
    pub async fn drain_spool(&self) -> Result<DrainStats, SpoolError> {
        self.spool.drain(self.sink.as_ref()).await
    }

    /// Number of events waiting in the spool.
    pub async fn spool_count(&self) -> usize {
        self.spool.count().await
    }

    /// The publisher's signer, for identity operations.
    pub fn signer(&self) -> &Arc<dyn Signer> {
        &self.signer
    }

    /// Release the signer session. The sink is shared and closed by its
    /// owner.
    pub async fn close(&self) -> Result<(), SignerError> {
        self.signer.close().await
    }
}
