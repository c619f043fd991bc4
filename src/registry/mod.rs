// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Identity and device registry.
//!
//! The registry exclusively owns [`Device`] records. Devices are created on
//! the first sighting of any topic for their id, kept fresh by every
//! subsequent payload, marked offline by `lwt` messages or the staleness
//! sweeper, and destroyed only by explicit admin action.
//!
//! Identity is canonicalised: a device that reports `AA:BB:CC:DD:EE:FF` on
//! one topic and `aabbccddeeff` on another resolves to a single record.

mod device;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::RegistryConfig;
use crate::envelope::{Envelope, now_ms};
use crate::event::{ControllerEvent, EventBus};
use crate::storage::{Storage, device_key};
use crate::topic::{TopicAddr, TopicKind};

pub use device::{Device, DeviceFilter, DeviceRole};

/// Counters exposed by the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Payloads observed.
    pub observed: u64,
    /// Payloads with a stale (out-of-window) timestamp.
    pub stale_envelopes: u64,
    /// Devices marked offline by the sweeper.
    pub swept_offline: u64,
}

/// The device registry.
///
/// Mutations persist the affected record through the [`Storage`] adapter;
/// persistence failures are logged and counted but never fail ingestion.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Device>>,
    storage: Arc<dyn Storage>,
    events: EventBus,
    config: RegistryConfig,
    observed: AtomicU64,
    stale_envelopes: AtomicU64,
    swept_offline: AtomicU64,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, events: EventBus, config: RegistryConfig) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            storage,
            events,
            config,
            observed: AtomicU64::new(0),
            stale_envelopes: AtomicU64::new(0),
            swept_offline: AtomicU64::new(0),
        }
    }

    /// Restores persisted device records from storage.
    ///
    /// Restored devices come back `online=false`; their true liveness is
    /// re-established by fresh traffic or left to the sweeper's view.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the scan itself fails; individual corrupt
    /// records are skipped with a warning.
    pub async fn restore(&self) -> Result<usize, crate::error::StorageError> {
        let mut restored = Vec::new();
        self.storage
            .iterate("device:", &mut |key, value| {
                match serde_json::from_slice::<Device>(value) {
                    Ok(mut device) => {
                        device.online = false;
                        restored.push(device);
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "skipping corrupt device record");
                    }
                }
            })
            .await?;

        let count = restored.len();
        let mut devices = self.devices.write();
        for device in restored {
            devices.insert(device.device_id.clone(), device);
        }
        drop(devices);
        if count > 0 {
            tracing::info!(count, "restored device records from storage");
        }
        Ok(count)
    }

    /// Observes a payload for a device, creating the record on first sight.
    ///
    /// Returns a snapshot of the record after the update. `last_seen`
    /// advances to the maximum payload timestamp seen so far; any non-lwt
    /// payload marks the device online, an `lwt` with `status=offline` marks
    /// it offline.
    pub async fn observe(&self, addr: &TopicAddr, envelope: &Envelope) -> Device {
        self.observed.fetch_add(1, Ordering::Relaxed);
        if !envelope.is_fresh() {
            self.stale_envelopes.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                device = %addr.device_id,
                ts = envelope.ts,
                "accepting payload with out-of-window timestamp"
            );
        }

        let id = addr.canonical_device_id();
        let lwt_offline = addr.kind == TopicKind::Lwt
            && envelope.str_field("status") == Some("offline");

        let (snapshot, went_online, went_offline) = {
            let mut devices = self.devices.write();
            let device = devices.entry(id.clone()).or_insert_with(|| {
                tracing::info!(device = %id, tenant = %addr.tenant, site = %addr.site, "new device sighted");
                Device::new(id.clone(), addr.tenant.clone(), addr.site.clone(), envelope.ts)
            });

            let was_online = device.online;
            if lwt_offline {
                device.online = false;
            } else {
                device.online = true;
                device.last_seen = device.last_seen.max(envelope.ts);
            }

            match addr.kind {
                TopicKind::State => {
                    device.absorb_identity(&envelope.body);
                    device.state = Some(envelope.body_value());
                }
                TopicKind::Attr => {
                    device.attributes = envelope.body.clone();
                }
                _ => {}
            }

            let went_online = device.online && !was_online;
            let went_offline = !device.online && was_online;
            (device.clone(), went_online, went_offline)
        };

        if went_online {
            self.events.publish(ControllerEvent::DeviceOnline {
                device_id: id.clone(),
            });
        }
        if went_offline {
            self.events.publish(ControllerEvent::DeviceOffline {
                device_id: id.clone(),
                reason: "lwt".to_string(),
            });
        }

        self.persist(&snapshot).await;
        snapshot
    }

    /// Explicitly sets a device's online flag.
    ///
    /// Returns `false` when the device is unknown. A no-op change publishes
    /// no event.
    pub async fn set_online(&self, device_id: &str, online: bool, reason: &str) -> bool {
        let snapshot = {
            let mut devices = self.devices.write();
            let Some(device) = devices.get_mut(device_id) else {
                return false;
            };
            if device.online == online {
                return true;
            }
            device.online = online;
            device.clone()
        };

        tracing::debug!(device = %device_id, online, reason, "online state changed");
        if online {
            self.events.publish(ControllerEvent::DeviceOnline {
                device_id: device_id.to_string(),
            });
        } else {
            self.events.publish(ControllerEvent::DeviceOffline {
                device_id: device_id.to_string(),
                reason: reason.to_string(),
            });
        }
        self.persist(&snapshot).await;
        true
    }

    /// Returns a snapshot of one device.
    #[must_use]
    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.devices
            .read()
            .get(&crate::topic::canonical_device_id(device_id))
            .cloned()
    }

    /// Lists devices matching the filter.
    #[must_use]
    pub fn list(&self, filter: &DeviceFilter) -> Vec<Device> {
        let mut out: Vec<Device> = self
            .devices
            .read()
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        out
    }

    /// Returns the number of known devices.
    #[must_use]
    pub fn count(&self) -> usize {
        self.devices.read().len()
    }

    /// Sets a device's role, returning the previous value.
    ///
    /// Used by the topology store when folding discovery payloads and when
    /// enforcing gateway uniqueness.
    pub async fn set_role(&self, device_id: &str, role: DeviceRole) -> Option<DeviceRole> {
        let (previous, snapshot) = {
            let mut devices = self.devices.write();
            let device = devices.get_mut(device_id)?;
            let previous = device.role;
            device.role = Some(role);
            (previous, device.clone())
        };
        self.persist(&snapshot).await;
        previous
    }

    /// Folds identity fields from a payload body into an existing device.
    ///
    /// Returns the updated snapshot, or `None` when the device is unknown.
    pub async fn update_identity(
        &self,
        device_id: &str,
        body: &serde_json::Map<String, serde_json::Value>,
    ) -> Option<Device> {
        let snapshot = {
            let mut devices = self.devices.write();
            let device = devices.get_mut(device_id)?;
            device.absorb_identity(body);
            device.clone()
        };
        self.persist(&snapshot).await;
        Some(snapshot)
    }

    /// Finds the device currently holding `role=gateway` in a site.
    #[must_use]
    pub fn find_gateway(&self, tenant: &str, site: &str) -> Option<String> {
        self.devices
            .read()
            .values()
            .find(|d| {
                d.tenant == tenant && d.site == site && d.role == Some(DeviceRole::Gateway)
            })
            .map(|d| d.device_id.clone())
    }

    /// Removes a device record; the explicit admin destroy path.
    pub async fn remove(&self, device_id: &str) -> bool {
        let id = crate::topic::canonical_device_id(device_id);
        let removed = self.devices.write().remove(&id).is_some();
        if removed {
            if let Err(e) = self.storage.delete(&device_key(&id)).await {
                tracing::warn!(device = %id, error = %e, "failed to delete persisted device");
            }
            self.events.publish(ControllerEvent::DeviceOffline {
                device_id: id,
                reason: "admin".to_string(),
            });
        }
        removed
    }

    /// Marks devices unseen past the stale horizon offline.
    ///
    /// Returns the ids that transitioned.
    pub async fn sweep_stale(&self, now: i64) -> Vec<String> {
        #[allow(clippy::cast_possible_wrap)]
        let horizon_ms = self.config.stale_horizon.as_millis() as i64;
        let stale: Vec<Device> = {
            let mut devices = self.devices.write();
            devices
                .values_mut()
                .filter(|d| d.online && now - d.last_seen > horizon_ms)
                .map(|d| {
                    d.online = false;
                    d.clone()
                })
                .collect()
        };

        let mut ids = Vec::with_capacity(stale.len());
        for device in &stale {
            self.swept_offline.fetch_add(1, Ordering::Relaxed);
            tracing::info!(device = %device.device_id, "marking stale device offline");
            self.events.publish(ControllerEvent::DeviceOffline {
                device_id: device.device_id.clone(),
                reason: "stale".to_string(),
            });
            self.persist(device).await;
            ids.push(device.device_id.clone());
        }
        ids
    }

    /// Periodic staleness sweep; runs until cancelled.
    pub async fn sweeper_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_stale(now_ms()).await;
                }
            }
        }
        tracing::debug!("registry sweeper stopped");
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            observed: self.observed.load(Ordering::Relaxed),
            stale_envelopes: self.stale_envelopes.load(Ordering::Relaxed),
            swept_offline: self.swept_offline.load(Ordering::Relaxed),
        }
    }

    async fn persist(&self, device: &Device) {
        match serde_json::to_vec(device) {
            Ok(bytes) => {
                if let Err(e) = self.storage.set(&device_key(&device.device_id), bytes).await {
                    tracing::warn!(device = %device.device_id, error = %e, "failed to persist device");
                }
            }
            Err(e) => {
                tracing::warn!(device = %device.device_id, error = %e, "failed to serialize device");
            }
        }
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.devices.read().len())
            .finish()
    }
}
