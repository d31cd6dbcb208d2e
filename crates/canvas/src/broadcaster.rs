//! Fan-out of change notifications to subscribed connections.
//!
//! Every message is serialised once and the same frame is queued on each
//! target's outbox without waiting. A full or closed outbox drops the frame
//! for that connection only; the socket writer owns disconnect detection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tesserae_ipc::{ChunkCoord, ServerMessage, TileCoord, encode_png_data_url};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error};

use crate::registry::{ConnectionId, Outbox, SubscriptionRegistry};

/// Outcome of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Routes notifications through the subscription registry
#[derive(Debug)]
pub struct Broadcaster {
    registry: Arc<SubscriptionRegistry>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Broadcaster {
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            registry,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// A tile was written; subscribers of its chunk get the raster inline
    pub fn on_tile_written(
        &self,
        tile: TileCoord,
        chunk: ChunkCoord,
        version: u64,
        image: &[u8],
    ) -> DeliveryReport {
        let targets = self.registry.outboxes_for(chunk);
        if targets.is_empty() {
            return DeliveryReport::default();
        }
        let message = ServerMessage::TileUpdate {
            x: tile.x,
            y: tile.y,
            chunk_id: chunk,
            version,
            image: encode_png_data_url(image),
        };
        self.deliver(&message, targets)
    }

    /// A tile was reset to the blank default
    pub fn on_tile_reset(&self, tile: TileCoord, chunk: ChunkCoord) -> DeliveryReport {
        let targets = self.registry.outboxes_for(chunk);
        if targets.is_empty() {
            return DeliveryReport::default();
        }
        let message = ServerMessage::TileReset {
            x: tile.x,
            y: tile.y,
            chunk_id: chunk,
        };
        self.deliver(&message, targets)
    }

    /// A chunk composite was committed
    pub fn on_chunk_rendered(&self, chunk: ChunkCoord, version: u64) -> DeliveryReport {
        let targets = self.registry.outboxes_for(chunk);
        if targets.is_empty() {
            return DeliveryReport::default();
        }
        self.deliver(
            &ServerMessage::ChunkReady {
                chunk_id: chunk,
                version,
            },
            targets,
        )
    }

    /// The overview was committed; every connection is told
    pub fn on_overview_rendered(&self, version: u64) -> DeliveryReport {
        let targets = self.registry.all_outboxes();
        if targets.is_empty() {
            return DeliveryReport::default();
        }
        self.deliver(&ServerMessage::OverviewReady { version }, targets)
    }

    /// Queue a message for a single connection
    pub fn send_to(&self, id: ConnectionId, message: &ServerMessage) -> DeliveryReport {
        match self.registry.outbox_of(id) {
            Some(outbox) => self.deliver(message, vec![(id, outbox)]),
            None => DeliveryReport::default(),
        }
    }

    /// Frames queued since start
    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Frames dropped since start
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn deliver(&self, message: &ServerMessage, targets: Vec<(ConnectionId, Outbox)>) -> DeliveryReport {
        let frame: Arc<str> = match message.to_json() {
            Ok(json) => json.into(),
            Err(e) => {
                error!("Failed to serialize {} message: {}", message.kind(), e);
                return DeliveryReport::default();
            }
        };

        let mut report = DeliveryReport::default();
        for (id, outbox) in targets {
            match outbox.try_send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!("Outbox of {} is full, dropping {}", id, message.kind());
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Outbox of {} is closed, dropping {}", id, message.kind());
                    report.dropped += 1;
                }
            }
        }

        self.delivered.fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.dropped.fetch_add(report.dropped as u64, Ordering::Relaxed);
        debug!(
            "Sent {} to {} connections ({} dropped)",
            message.kind(),
            report.delivered,
            report.dropped
        );
        report
    }
}
