// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Controller event bus.
//!
//! Subsystems publish notable occurrences here; observers (the CLI, metrics
//! exporters, tests) subscribe without coupling to the producing subsystem.
//! Built on tokio's broadcast channel: every subscriber sees every event, and
//! a slow subscriber lags without blocking producers.

use tokio::sync::broadcast;

/// Default channel capacity for the event bus.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// An event published by a controller subsystem.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    /// A device transitioned to online.
    DeviceOnline {
        /// Canonical device id.
        device_id: String,
    },
    /// A device transitioned to offline.
    DeviceOffline {
        /// Canonical device id.
        device_id: String,
        /// Why it went offline (`lwt`, `stale`, `admin`).
        reason: String,
    },
    /// A second device claimed the gateway role in a site.
    GatewayConflict {
        /// Tenant of the affected site.
        tenant: String,
        /// The affected site.
        site: String,
        /// The device that kept the gateway role.
        kept: String,
        /// The device demoted to router.
        demoted: String,
    },
    /// A topology record violated an invariant and was dropped.
    InvariantViolation {
        /// Description of the violated invariant.
        detail: String,
    },
    /// The ingress queue crossed its high-water mark or dropped frames.
    IngressOverload {
        /// Frames dropped so far.
        dropped: u64,
    },
    /// A command exhausted its ack retries or result window.
    CommandTimedOut {
        /// The timed-out command id.
        command_id: String,
        /// Target device.
        device_id: String,
    },
    /// The broker session was (re)established.
    BrokerConnected,
    /// The broker session was lost; reconnection is in progress.
    BrokerDisconnected,
    /// A workflow execution finished.
    WorkflowFinished {
        /// Workflow definition id.
        workflow_id: String,
        /// Execution session id.
        session_id: String,
        /// Overall outcome.
        success: bool,
    },
}

/// Event bus for broadcasting controller events to multiple subscribers.
///
/// Cheaply cloneable; clones share the same channel. If the channel fills up
/// because a subscriber is slow, that subscriber observes
/// `RecvError::Lagged` and loses the oldest events.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<ControllerEvent>,
}

impl EventBus {
    /// Creates a new event bus with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a new event bus with the specified capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribes to controller events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publishes an event to all subscribers.
    ///
    /// If there are no subscribers, the event is silently discarded.
    pub fn publish(&self, event: ControllerEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}
