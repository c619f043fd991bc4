// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device command lifecycle.
//!
//! A command is a single request/ack/result triple correlated by id. The
//! [`CommandManager`] publishes requests, matches asynchronous replies back
//! to their futures, and drives timeouts and retries.
//!
//! State machine:
//!
//! ```text
//! pending → sent → acked → completed
//!             │       │  └→ failed
//!             │       └───→ timeout
//!             ├──→ timeout   (no ack)
//!             └──→ failed    (rejected / publish error)
//! cancelled is reachable from any non-terminal state.
//! ```
//!
//! Terminal states are absorbing, and ids are unique for the lifetime of the
//! controller.

mod manager;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{CommandError, TransportError};
use crate::topic::TopicAddr;

pub use manager::{CommandManager, CommandManagerStats};

/// Lifecycle state of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandState {
    /// Created but not yet published.
    Pending,
    /// Published, waiting for an ack.
    Sent,
    /// Acknowledged by the device, waiting for a result.
    Acked,
    /// Completed successfully on the device.
    Completed,
    /// Failed (rejected, publish error, or device-reported failure).
    Failed,
    /// Timed out waiting for an ack or result.
    Timeout,
    /// Cancelled before reaching a terminal state.
    Cancelled,
}

impl CommandState {
    /// Whether this state is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }

    /// Whether the state machine permits moving to `next` from here.
    #[must_use]
    pub const fn can_transition(self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Sent | Self::Cancelled | Self::Failed),
            Self::Sent => matches!(
                next,
                Self::Acked | Self::Timeout | Self::Failed | Self::Cancelled
            ),
            Self::Acked => matches!(
                next,
                Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
            ),
            // Terminal states are absorbing.
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled => false,
        }
    }
}

/// A command record, kept in memory while live and in storage for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    /// Unique command id (uuid v4).
    pub id: String,
    /// Target device address (the `cmd/req` topic coordinates).
    pub device: TopicAddr,
    /// Operation name (`get_system_info`, `reboot`, ...).
    pub op: String,
    /// Operation arguments.
    pub args: Map<String, Value>,
    /// When the request was issued, unix ms.
    pub issued_at: i64,
    /// Latest possible resolution time, unix ms.
    pub deadline: i64,
    /// Current lifecycle state.
    pub state: CommandState,
    /// When the ack arrived, unix ms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_at: Option<i64>,
    /// Device-supplied result map for completed commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Map<String, Value>>,
    /// Error text for failed/timed-out/cancelled commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Remaining retry budget.
    pub retries_left: u32,
    /// Retries consumed so far across the logical command.
    pub retry_count: u32,
}

/// Filter for [`CommandManager::list`].
#[derive(Debug, Clone, Default)]
pub struct CommandFilter {
    /// Restrict to one device.
    pub device_id: Option<String>,
    /// Restrict to one state.
    pub state: Option<CommandState>,
}

impl CommandFilter {
    /// Matches a record against this filter.
    #[must_use]
    pub fn matches(&self, record: &CommandRecord) -> bool {
        self.device_id
            .as_ref()
            .is_none_or(|d| *d == record.device.device_id)
            && self.state.is_none_or(|s| s == record.state)
    }
}

/// Options for [`CommandManager::issue`].
#[derive(Debug, Clone, Default)]
pub struct IssueOptions {
    /// Result wait after the ack; manager default when unset.
    pub result_timeout: Option<Duration>,
    /// Retry budget for missing acks; manager default when unset.
    pub retries: Option<u32>,
    /// Cancellation source; cancelling it cancels the command.
    pub cancel_token: Option<CancellationToken>,
}

/// Final outcome of a logical command, delivered through its future.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// Id of the attempt that reached the terminal state.
    pub command_id: String,
    /// Terminal state.
    pub state: CommandState,
    /// Device-supplied result for completed commands.
    pub result: Option<Map<String, Value>>,
    /// Error text otherwise.
    pub error: Option<String>,
    /// Retries consumed.
    pub retry_count: u32,
}

impl CommandOutcome {
    /// Whether the command completed successfully.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state == CommandState::Completed
    }

    /// Converts a non-completed outcome into the matching [`CommandError`].
    #[must_use]
    pub fn as_error(&self) -> Option<CommandError> {
        match self.state {
            CommandState::Completed => None,
            CommandState::Timeout => Some(match &self.error {
                Some(e) if e.contains("result") => CommandError::ResultTimeout,
                _ => CommandError::AckTimeout {
                    attempts: self.retry_count + 1,
                },
            }),
            CommandState::Cancelled => Some(CommandError::Cancelled),
            _ => Some(CommandError::DeviceFailure(
                self.error.clone().unwrap_or_else(|| "unknown".to_string()),
            )),
        }
    }
}

/// Handle to a pending command.
///
/// Dropping the future does not cancel the command; call
/// [`CommandManager::cancel`] for that.
#[derive(Debug)]
pub struct CommandFuture {
    /// The initial attempt id; stable for the life of the logical command.
    pub id: String,
    rx: oneshot::Receiver<CommandOutcome>,
}

impl CommandFuture {
    pub(crate) fn new(id: String, rx: oneshot::Receiver<CommandOutcome>) -> Self {
        Self { id, rx }
    }

    /// Waits for the terminal outcome.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Cancelled`] if the manager shut down before
    /// resolving the command.
    pub async fn wait(self) -> Result<CommandOutcome, CommandError> {
        self.rx.await.map_err(|_| CommandError::Cancelled)
    }
}

/// Outbound publish seam between the command manager and the broker client.
///
/// The broker client is the production implementation; tests substitute a
/// channel-backed fake.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    /// Publishes a `cmd/req` payload at QoS 1.
    async fn publish_request(
        &self,
        addr: &TopicAddr,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_absorbing() {
        let terminals = [
            CommandState::Completed,
            CommandState::Failed,
            CommandState::Timeout,
            CommandState::Cancelled,
        ];
        let all = [
            CommandState::Pending,
            CommandState::Sent,
            CommandState::Acked,
            CommandState::Completed,
            CommandState::Failed,
            CommandState::Timeout,
            CommandState::Cancelled,
        ];
        for terminal in terminals {
            assert!(terminal.is_terminal());
            for next in all {
                assert!(!terminal.can_transition(next));
            }
        }
    }

    #[test]
    fn state_dag_matches_lifecycle() {
        use CommandState as S;
        assert!(S::Pending.can_transition(S::Sent));
        assert!(S::Sent.can_transition(S::Acked));
        assert!(S::Sent.can_transition(S::Timeout));
        assert!(S::Acked.can_transition(S::Completed));
        assert!(S::Acked.can_transition(S::Failed));
        assert!(S::Acked.can_transition(S::Timeout));
        // No skipping sent, no reviving.
        assert!(!S::Pending.can_transition(S::Acked));
        assert!(!S::Sent.can_transition(S::Completed));
        assert!(!S::Acked.can_transition(S::Sent));
        // Cancel from any non-terminal state.
        assert!(S::Pending.can_transition(S::Cancelled));
        assert!(S::Sent.can_transition(S::Cancelled));
        assert!(S::Acked.can_transition(S::Cancelled));
    }

    #[test]
    fn outcome_error_mapping() {
        let outcome = CommandOutcome {
            command_id: "x".to_string(),
            state: CommandState::Timeout,
            result: None,
            error: Some("no ack".to_string()),
            retry_count: 1,
        };
        assert_eq!(
            outcome.as_error(),
            Some(CommandError::AckTimeout { attempts: 2 })
        );

        let outcome = CommandOutcome {
            command_id: "x".to_string(),
            state: CommandState::Completed,
            result: None,
            error: None,
            retry_count: 0,
        };
        assert!(outcome.is_completed());
        assert_eq!(outcome.as_error(), None);
    }

    #[test]
    fn filter_matches_device_and_state() {
        let record = CommandRecord {
            id: "c1".to_string(),
            device: TopicAddr::cmd_req("demo", "home", "dev01"),
            op: "reboot".to_string(),
            args: Map::new(),
            issued_at: 0,
            deadline: 0,
            state: CommandState::Sent,
            ack_at: None,
            result: None,
            error: None,
            retries_left: 0,
            retry_count: 0,
        };

        assert!(CommandFilter::default().matches(&record));
        assert!(
            CommandFilter {
                device_id: Some("dev01".to_string()),
                state: Some(CommandState::Sent),
            }
            .matches(&record)
        );
        assert!(
            !CommandFilter {
                device_id: Some("other".to_string()),
                ..CommandFilter::default()
            }
            .matches(&record)
        );
    }
}
