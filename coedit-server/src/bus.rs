//! Cross-node fan-out contract.
//!
//! The engine publishes its broadcast stream to a topic keyed by document
//! id so peer server nodes hosting sessions for the same document see the
//! authoritative operations. The substrate only promises at-least-once
//! delivery with per-topic ordering; engines deduplicate by
//! `(document, version)`. Payloads are opaque bytes so real substrates can
//! carry them unchanged; this module also owns the JSON codec for them.

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::Identifier;
use crate::ot::Operation;
use crate::presence::PresenceEntry;
use crate::protocol::Member;

/// Messages mirrored between nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum BusMessage {
    /// An operation was applied by the document's authoritative engine.
    #[serde(rename_all = "camelCase")]
    Applied {
        /// Document topic key.
        document: Identifier,
        /// Version the engine assigned.
        version: u64,
        /// The transformed operation as applied.
        op: Operation,
    },
    /// Presence changed; `entry` is `None` when the user detached.
    #[serde(rename_all = "camelCase")]
    Presence {
        /// Document topic key.
        document: Identifier,
        /// Whose presence.
        user: Member,
        /// The new entry, or `None` on detach.
        entry: Option<PresenceEntry>,
    },
}

impl BusMessage {
    /// Serialize for the wire.
    pub fn encode(&self) -> Bytes {
        serde_json::to_vec(self).expect("failed serialize").into()
    }

    /// Parse a payload received from the substrate.
    pub fn decode(payload: &Bytes) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Publish/subscribe substrate the engine fans out through.
pub trait FanoutBus: Send + Sync {
    /// Publish `payload` to the document's topic.
    fn publish(&self, topic: &Identifier, payload: Bytes);
    /// Subscribe to the document's topic.
    fn subscribe(&self, topic: &Identifier) -> BusSubscription;
}

/// An open subscription to one topic.
pub struct BusSubscription {
    rx: broadcast::Receiver<Bytes>,
}

impl BusSubscription {
    /// Next payload, or `None` once the topic is closed. Lagged receivers
    /// skip ahead; at-least-once delivery means the engine's version
    /// deduplication absorbs both gaps and replays.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "bus subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

const TOPIC_CAPACITY: usize = 256;

/// In-process bus for a single node (and for tests): one broadcast channel
/// per topic.
#[derive(Debug, Default)]
pub struct LocalBus {
    topics: DashMap<Identifier, broadcast::Sender<Bytes>>,
}

impl LocalBus {
    /// A fresh bus with no topics.
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, id: &Identifier) -> broadcast::Sender<Bytes> {
        self.topics
            .entry(id.clone())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

impl FanoutBus for LocalBus {
    fn publish(&self, topic: &Identifier, payload: Bytes) {
        // No subscribers is fine; the message is simply dropped locally.
        self.topic(topic).send(payload).ok();
    }

    fn subscribe(&self, topic: &Identifier) -> BusSubscription {
        BusSubscription {
            rx: self.topic(topic).subscribe(),
        }
    }
}
