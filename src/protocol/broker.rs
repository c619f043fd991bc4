// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Broker client.
//!
//! Maintains the controller's single long-lived MQTT session: wildcard
//! subscriptions over the whole `rtk/v1` hierarchy, QoS 1 publishes for
//! `cmd/req`, a last-will on the controller's own presence topic, and an
//! inbound frame channel feeding the topic router.
//!
//! Reconnection is exponential backoff with jitter, capped. Subscriptions
//! are re-established on every ConnAck, which makes them idempotent across
//! reconnects. Frames are never dropped silently: a saturated ingress queue
//! backpressures the MQTT event loop, and an `ingress.overload` event fires
//! when saturation is first observed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::command::CommandPublisher;
use crate::config::{BrokerConfig, IngressConfig};
use crate::envelope::{Envelope, SchemaId};
use crate::error::TransportError;
use crate::event::{ControllerEvent, EventBus};
use crate::topic::{TopicAddr, TopicKind};

use super::router::IngressFrame;

/// Wildcard filters the controller subscribes to on every (re)connect.
pub const CONTROLLER_SUBSCRIPTIONS: [&str; 8] = [
    "rtk/v1/+/+/+/state",
    "rtk/v1/+/+/+/attr",
    "rtk/v1/+/+/+/lwt",
    "rtk/v1/+/+/+/evt/#",
    "rtk/v1/+/+/+/telemetry/#",
    "rtk/v1/+/+/+/cmd/ack",
    "rtk/v1/+/+/+/cmd/res",
    "rtk/v1/+/+/+/topology/#",
];

/// Process-wide counter for unique client ids.
static CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Counters exposed by the broker client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Successful (re)connects.
    pub connects: u64,
    /// Frames delivered into the ingress channel.
    pub frames_in: u64,
    /// Outbound publishes.
    pub publishes: u64,
    /// Frames that arrived while the ingress queue was saturated.
    pub overloaded_frames: u64,
}

struct BrokerInner {
    client: AsyncClient,
    config: BrokerConfig,
    ingress: IngressConfig,
    events: EventBus,
    connected: AtomicBool,
    connects: AtomicU64,
    frames_in: AtomicU64,
    publishes: AtomicU64,
    overloaded_frames: AtomicU64,
    overload_latched: AtomicBool,
}

/// Handle for publishing and introspection; cheaply cloneable.
#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<BrokerInner>,
}

impl BrokerClient {
    /// Creates the client and its event loop driver.
    ///
    /// Nothing touches the network until [`BrokerEventLoop::run`] is
    /// spawned. The session is configured with a retained last-will of
    /// `status=offline` on the controller's presence topic.
    #[must_use]
    pub fn new(
        config: BrokerConfig,
        ingress: IngressConfig,
        events: EventBus,
    ) -> (Self, BrokerEventLoop) {
        let counter = CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let client_id = format!(
            "{}_{}_{}",
            config.client_id_prefix,
            std::process::id(),
            counter
        );

        let mut options = MqttOptions::new(&client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(true);
        if let Some((username, password)) = &config.credentials {
            options.set_credentials(username, password);
        }
        options.set_last_will(LastWill::new(
            presence_topic(&config).to_string(),
            presence_payload("offline"),
            QoS::AtLeastOnce,
            true,
        ));

        let (client, event_loop) = AsyncClient::new(options, 64);
        let inner = Arc::new(BrokerInner {
            client,
            config,
            ingress,
            events,
            connected: AtomicBool::new(false),
            connects: AtomicU64::new(0),
            frames_in: AtomicU64::new(0),
            publishes: AtomicU64::new(0),
            overloaded_frames: AtomicU64::new(0),
            overload_latched: AtomicBool::new(false),
        });

        (
            Self {
                inner: Arc::clone(&inner),
            },
            BrokerEventLoop { event_loop, inner },
        )
    }

    /// Whether the session currently holds a ConnAck.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Publishes a payload at QoS 1.
    ///
    /// While disconnected, the publish is queued and flushed after the next
    /// reconnect.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when the client request queue is closed.
    pub async fn publish_qos1(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.inner.publishes.fetch_add(1, Ordering::Relaxed);
        self.inner
            .client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(TransportError::Mqtt)
    }

    /// Cleanly closes the session.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when the disconnect cannot be queued.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        tracing::info!(
            host = %self.inner.config.host,
            port = self.inner.config.port,
            "disconnecting from broker"
        );
        self.inner.connected.store(false, Ordering::Release);
        self.inner
            .client
            .disconnect()
            .await
            .map_err(TransportError::Mqtt)
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            connects: self.inner.connects.load(Ordering::Relaxed),
            frames_in: self.inner.frames_in.load(Ordering::Relaxed),
            publishes: self.inner.publishes.load(Ordering::Relaxed),
            overloaded_frames: self.inner.overloaded_frames.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl CommandPublisher for BrokerClient {
    async fn publish_request(
        &self,
        addr: &TopicAddr,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.publish_qos1(&addr.to_string(), payload, false).await
    }
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Drives the MQTT session; spawned once by the composition root.
pub struct BrokerEventLoop {
    event_loop: EventLoop,
    inner: Arc<BrokerInner>,
}

impl BrokerEventLoop {
    /// Runs the session until cancelled.
    ///
    /// Incoming publishes go to `frames`; a full channel backpressures the
    /// event loop instead of dropping. Connection errors trigger
    /// exponential-backoff reconnects with jitter, capped at the configured
    /// maximum.
    pub async fn run(mut self, frames: mpsc::Sender<IngressFrame>, cancel: CancellationToken) {
        let mut backoff = self.inner.config.reconnect_min;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = self.event_loop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        backoff = self.inner.config.reconnect_min;
                        self.inner.connected.store(true, Ordering::Release);
                        self.inner.connects.fetch_add(1, Ordering::Relaxed);
                        tracing::info!(
                            host = %self.inner.config.host,
                            port = self.inner.config.port,
                            "broker session established"
                        );
                        Self::on_connect(&self.inner).await;
                        self.inner.events.publish(ControllerEvent::BrokerConnected);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.inner.frames_in.fetch_add(1, Ordering::Relaxed);
                        Self::watch_queue_pressure(&self.inner, &frames);
                        let frame = IngressFrame {
                            topic: publish.topic,
                            payload: publish.payload.to_vec(),
                            retained: publish.retain,
                        };
                        if frames.send(frame).await.is_err() {
                            tracing::error!("ingress channel closed, stopping broker loop");
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        Self::on_disconnect(&self.inner);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        Self::on_disconnect(&self.inner);
                        let delay = jittered(backoff);
                        tracing::warn!(
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "broker connection error, backing off"
                        );
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            () = tokio::time::sleep(delay) => {}
                        }
                        backoff = (backoff * 2).min(self.inner.config.reconnect_max);
                    }
                }
            }
        }
        tracing::debug!("broker event loop stopped");
    }

    /// Re-establishes subscriptions and announces presence.
    async fn on_connect(inner: &Arc<BrokerInner>) {
        for filter in CONTROLLER_SUBSCRIPTIONS {
            if let Err(e) = inner.client.subscribe(filter, QoS::AtLeastOnce).await {
                tracing::warn!(filter = %filter, error = %e, "subscribe failed");
            }
        }
        let topic = presence_topic(&inner.config).to_string();
        if let Err(e) = inner
            .client
            .publish(&topic, QoS::AtLeastOnce, true, presence_payload("online"))
            .await
        {
            tracing::warn!(topic = %topic, error = %e, "presence publish failed");
        }
    }

    fn on_disconnect(inner: &Arc<BrokerInner>) {
        if inner.connected.swap(false, Ordering::AcqRel) {
            tracing::warn!("broker session lost");
            inner.events.publish(ControllerEvent::BrokerDisconnected);
        }
    }

    /// Tracks ingress queue fill and emits `ingress.overload` on saturation.
    fn watch_queue_pressure(inner: &Arc<BrokerInner>, frames: &mpsc::Sender<IngressFrame>) {
        let capacity = frames.max_capacity();
        let fill = capacity.saturating_sub(frames.capacity());
        let high_water = inner.ingress.high_water_mark.min(capacity);

        if fill >= high_water {
            let total = inner.overloaded_frames.fetch_add(1, Ordering::Relaxed) + 1;
            if !inner.overload_latched.swap(true, Ordering::AcqRel) {
                tracing::warn!(fill, capacity, "ingress queue past high-water mark");
                inner
                    .events
                    .publish(ControllerEvent::IngressOverload { dropped: total });
            }
        } else if fill < high_water / 2 {
            inner.overload_latched.store(false, Ordering::Release);
        }
    }
}

/// The controller's own presence topic.
fn presence_topic(config: &BrokerConfig) -> TopicAddr {
    TopicAddr {
        tenant: config.tenant.clone(),
        site: config.site.clone(),
        device_id: config.controller_id.clone(),
        kind: TopicKind::Lwt,
        sub: None,
    }
}

/// Builds the presence payload (`status=online|offline`).
fn presence_payload(status: &str) -> Vec<u8> {
    let mut body = Map::new();
    body.insert("status".to_string(), Value::String(status.to_string()));
    Envelope::new(SchemaId::new("device.lwt", 1, 0), body).encode()
}

/// Adds up to 50% random jitter to a backoff delay.
fn jittered(base: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    if base_ms == 0 {
        return base;
    }
    let jitter = rand::thread_rng().gen_range(0..=base_ms / 2);
    Duration::from_millis(base_ms + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_topic_follows_grammar() {
        let config = BrokerConfig {
            tenant: "demo".to_string(),
            site: "home".to_string(),
            controller_id: "ctl-1".to_string(),
            ..BrokerConfig::default()
        };
        assert_eq!(
            presence_topic(&config).to_string(),
            "rtk/v1/demo/home/ctl-1/lwt"
        );
    }

    #[test]
    fn presence_payload_is_a_valid_envelope() {
        let envelope = Envelope::decode(&presence_payload("offline")).unwrap();
        assert_eq!(envelope.schema.to_string(), "device.lwt/1.0");
        assert_eq!(envelope.str_field("status"), Some("offline"));
    }

    #[test]
    fn subscription_filters_cover_all_kinds() {
        for kind in ["state", "attr", "lwt", "evt", "telemetry", "cmd", "topology"] {
            assert!(
                CONTROLLER_SUBSCRIPTIONS.iter().any(|f| f.contains(kind)),
                "no filter for kind {kind}"
            );
        }
        // All filters stay inside the versioned namespace.
        assert!(CONTROLLER_SUBSCRIPTIONS.iter().all(|f| f.starts_with("rtk/v1/")));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(4);
        for _ in 0..100 {
            let delay = jittered(base);
            assert!(delay >= base);
            assert!(delay <= base + Duration::from_secs(2));
        }
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test]
    async fn client_ids_are_unique() {
        let events = EventBus::new();
        let (a, _loop_a) = BrokerClient::new(
            BrokerConfig::default(),
            IngressConfig::default(),
            events.clone(),
        );
        let (b, _loop_b) = BrokerClient::new(
            BrokerConfig::default(),
            IngressConfig::default(),
            events,
        );
        // Indirect check: both clients exist and neither is connected yet.
        assert!(!a.is_connected());
        assert!(!b.is_connected());
    }

    #[tokio::test]
    async fn publish_queues_while_disconnected() {
        let (client, _event_loop) = BrokerClient::new(
            BrokerConfig::default(),
            IngressConfig::default(),
            EventBus::new(),
        );
        // The request queue buffers publishes until the event loop runs.
        client
            .publish_qos1("rtk/v1/demo/home/dev01/cmd/req", b"{}".to_vec(), false)
            .await
            .unwrap();
        assert_eq!(client.stats().publishes, 1);
    }
}
