// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Topic routing and the ingest worker pool.
//!
//! The router is a pure function over `(topic, payload)`: parse the topic,
//! decode the envelope, run schema validation, then hand the frame to a
//! worker. Workers are partitioned by device id hash, so all frames for one
//! device are processed in arrival order while different devices proceed in
//! parallel.
//!
//! Protocol violations (malformed topics, wrong version, bad JSON, strict
//! schema rejects) are counted and dropped here; they never propagate upward.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::envelope::Envelope;
use crate::schema::SchemaValidator;
use crate::topic::TopicAddr;

/// A raw frame as delivered by the broker client.
///
/// Retained deliveries are flagged for logging but treated identically to
/// live messages downstream.
#[derive(Debug, Clone)]
pub struct IngressFrame {
    /// Full topic string.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// Whether the broker flagged this as a retained delivery.
    pub retained: bool,
}

/// Typed frame consumer implemented by the controller's dispatch layer.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// Handles one decoded frame. Must not block indefinitely.
    async fn handle(&self, addr: TopicAddr, envelope: Envelope);
}

/// Counters exposed by the router.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Frames accepted and dispatched to a worker.
    pub accepted: u64,
    /// Frames dropped for an unparseable or unsupported topic.
    pub malformed_topic: u64,
    /// Frames dropped for an undecodable envelope.
    pub invalid_envelope: u64,
    /// Frames rejected by strict schema validation.
    pub schema_rejected: u64,
}

/// The topic router and its worker pool.
pub struct TopicRouter {
    workers: Vec<mpsc::Sender<(TopicAddr, Envelope)>>,
    handles: Vec<JoinHandle<()>>,
    validator: Arc<SchemaValidator>,
    accepted: AtomicU64,
    malformed_topic: AtomicU64,
    invalid_envelope: AtomicU64,
    schema_rejected: AtomicU64,
}

impl TopicRouter {
    /// Starts the worker pool.
    ///
    /// `worker_count` tasks are spawned; each owns a bounded queue of
    /// `queue_capacity` frames. Sending into a full worker queue applies
    /// backpressure to the caller rather than dropping.
    #[must_use]
    pub fn start(
        handler: Arc<dyn FrameHandler>,
        validator: Arc<SchemaValidator>,
        worker_count: usize,
        queue_capacity: usize,
    ) -> Self {
        let worker_count = worker_count.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let (tx, mut rx) = mpsc::channel::<(TopicAddr, Envelope)>(queue_capacity.max(1));
            let handler = Arc::clone(&handler);
            handles.push(tokio::spawn(async move {
                while let Some((addr, envelope)) = rx.recv().await {
                    handler.handle(addr, envelope).await;
                }
                tracing::debug!(worker = index, "router worker stopped");
            }));
            workers.push(tx);
        }
        Self {
            workers,
            handles,
            validator,
            accepted: AtomicU64::new(0),
            malformed_topic: AtomicU64::new(0),
            invalid_envelope: AtomicU64::new(0),
            schema_rejected: AtomicU64::new(0),
        }
    }

    /// Routes one raw frame.
    ///
    /// Parsing or validation failures are counted and dropped; an accepted
    /// frame is queued to the worker owning its device partition.
    pub async fn route(&self, frame: IngressFrame) {
        let addr = match TopicAddr::parse(&frame.topic) {
            Ok(addr) => addr,
            Err(e) => {
                self.malformed_topic.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(topic = %frame.topic, error = %e, "dropping frame with malformed topic");
                return;
            }
        };

        let envelope = match Envelope::decode(&frame.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.invalid_envelope.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(topic = %frame.topic, error = %e, "dropping frame with invalid envelope");
                return;
            }
        };

        if let Err(e) = self.validator.check(&envelope) {
            self.schema_rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(topic = %frame.topic, error = %e, "rejecting frame in strict schema mode");
            return;
        }

        if frame.retained {
            tracing::trace!(topic = %frame.topic, "processing retained delivery");
        }

        self.accepted.fetch_add(1, Ordering::Relaxed);
        let worker = self.partition(&addr.canonical_device_id());
        // A full queue blocks here, backpressuring the broker client.
        if self.workers[worker].send((addr, envelope)).await.is_err() {
            tracing::warn!(topic = %frame.topic, "router worker gone, frame dropped");
        }
    }

    /// Picks the worker owning a device's partition.
    fn partition(&self, device_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        device_id.hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)]
        let index = (hasher.finish() % self.workers.len() as u64) as usize;
        index
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            malformed_topic: self.malformed_topic.load(Ordering::Relaxed),
            invalid_envelope: self.invalid_envelope.load(Ordering::Relaxed),
            schema_rejected: self.schema_rejected.load(Ordering::Relaxed),
        }
    }

    /// Stops accepting frames and waits for the workers to drain.
    pub async fn shutdown(mut self) {
        self.workers.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for TopicRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicRouter")
            .field("workers", &self.workers.len())
            .finish()
    }
}
