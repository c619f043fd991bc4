// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The command manager.
//!
//! One supervisor task runs per logical command: it publishes the request,
//! arms the ack timer, retries with fresh ids when acks go missing, waits for
//! the result, and resolves the caller's future with the terminal outcome.
//! Replies are correlated by id only; the topic is not enough because a
//! device may have several commands in flight.
//!
//! Terminal records are persisted through the storage adapter for audit and
//! evicted from memory after a grace period. Replies that match no live id
//! are logged and discarded.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout_at};
use uuid::Uuid;

use crate::config::CommandConfig;
use crate::envelope::{AckBody, AckStatus, Envelope, ResultBody, ResultStatus, SchemaId, now_ms};
use crate::error::{CommandError, Error, ProtocolError};
use crate::event::{ControllerEvent, EventBus};
use crate::storage::{Storage, command_key};
use crate::topic::TopicAddr;

use super::{
    CommandFilter, CommandFuture, CommandOutcome, CommandPublisher, CommandRecord, CommandState,
    IssueOptions,
};

/// Counters exposed by the command manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandManagerStats {
    /// Logical commands issued.
    pub issued: u64,
    /// Commands that completed successfully.
    pub completed: u64,
    /// Commands that ended failed.
    pub failed: u64,
    /// Commands that ended in timeout.
    pub timeouts: u64,
    /// Commands that were cancelled.
    pub cancelled: u64,
    /// Replies that matched no live command id.
    pub late_replies: u64,
}

/// Reply or control signal routed to a command supervisor.
#[derive(Debug)]
enum Signal {
    Ack(AckBody),
    Result(ResultBody),
    Cancel,
}

struct Attempt {
    root_id: String,
    record: CommandRecord,
}

struct Inner {
    publisher: Arc<dyn CommandPublisher>,
    storage: Arc<dyn Storage>,
    events: EventBus,
    config: CommandConfig,
    attempts: Mutex<HashMap<String, Attempt>>,
    sessions: Mutex<HashMap<String, mpsc::UnboundedSender<Signal>>>,
    issued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    cancelled: AtomicU64,
    late_replies: AtomicU64,
}

/// Issues device commands and reconciles their asynchronous replies.
#[derive(Clone)]
pub struct CommandManager {
    inner: Arc<Inner>,
}

impl CommandManager {
    /// Creates a manager over the given publish seam.
    #[must_use]
    pub fn new(
        publisher: Arc<dyn CommandPublisher>,
        storage: Arc<dyn Storage>,
        events: EventBus,
        config: CommandConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                publisher,
                storage,
                events,
                config,
                attempts: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                issued: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                timeouts: AtomicU64::new(0),
                cancelled: AtomicU64::new(0),
                late_replies: AtomicU64::new(0),
            }),
        }
    }

    /// Issues a command to a device.
    ///
    /// Publishes `{id, op, schema: "cmd.<op>/1.0", ts, args}` on the device's
    /// `cmd/req` topic and returns a future that resolves with the terminal
    /// outcome. A missing ack within the ack window retries with a fresh id
    /// up to the retry budget; the superseded id is marked `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::DeviceBusy`] when the per-device in-flight
    /// limit is reached.
    pub fn issue(
        &self,
        addr: &TopicAddr,
        op: &str,
        args: Map<String, Value>,
        opts: IssueOptions,
    ) -> Result<CommandFuture, Error> {
        let inner = &self.inner;
        let limit = inner.config.max_in_flight_per_device;
        if limit > 0 {
            let in_flight = inner
                .attempts
                .lock()
                .values()
                .filter(|a| {
                    a.record.device.device_id == addr.device_id && !a.record.state.is_terminal()
                })
                .count();
            if in_flight >= limit {
                return Err(CommandError::DeviceBusy {
                    device_id: addr.device_id.clone(),
                    limit,
                }
                .into());
            }
        }

        let retries = opts.retries.unwrap_or(inner.config.default_retries);
        let result_timeout = opts
            .result_timeout
            .unwrap_or(inner.config.result_timeout);
        let root_id = Uuid::new_v4().to_string();
        let issued_at = now_ms();
        #[allow(clippy::cast_possible_wrap)]
        let deadline = issued_at
            + (inner.config.ack_timeout.as_millis() as i64) * i64::from(retries + 1)
            + result_timeout.as_millis() as i64;

        let record = CommandRecord {
            id: root_id.clone(),
            device: addr.clone(),
            op: op.to_string(),
            args,
            issued_at,
            deadline,
            state: CommandState::Pending,
            ack_at: None,
            result: None,
            error: None,
            retries_left: retries,
            retry_count: 0,
        };

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        inner.attempts.lock().insert(
            root_id.clone(),
            Attempt {
                root_id: root_id.clone(),
                record: record.clone(),
            },
        );
        inner.sessions.lock().insert(root_id.clone(), signal_tx);
        inner.issued.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            command = %root_id,
            device = %addr.device_id,
            op = %op,
            retries,
            "issuing command"
        );
        tokio::spawn(run_command(
            Arc::clone(inner),
            record,
            result_timeout,
            opts.cancel_token,
            signal_rx,
            outcome_tx,
        ));

        Ok(CommandFuture::new(root_id, outcome_rx))
    }

    /// Routes an incoming `cmd/ack` payload to its command.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] when the payload does not parse; the
    /// caller counts and drops it.
    pub fn handle_ack(&self, addr: &TopicAddr, envelope: &Envelope) -> Result<(), ProtocolError> {
        let body = AckBody::from_envelope(envelope)?;
        tracing::trace!(command = %body.id, device = %addr.device_id, "ack received");
        self.route(&body.id.clone(), Signal::Ack(body));
        Ok(())
    }

    /// Routes an incoming `cmd/res` payload to its command.
    ///
    /// A result without a prior ack is accepted and treated as an implicit
    /// ack.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] when the payload does not parse.
    pub fn handle_result(
        &self,
        addr: &TopicAddr,
        envelope: &Envelope,
    ) -> Result<(), ProtocolError> {
        let body = ResultBody::from_envelope(envelope)?;
        tracing::trace!(command = %body.id, device = %addr.device_id, "result received");
        self.route(&body.id.clone(), Signal::Result(body));
        Ok(())
    }

    /// Cancels a command by any of its attempt ids.
    ///
    /// Cancelling an already-terminal command is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::UnknownId`] when no attempt matches.
    pub fn cancel(&self, command_id: &str) -> Result<(), CommandError> {
        let root_id = {
            let attempts = self.inner.attempts.lock();
            let Some(attempt) = attempts.get(command_id) else {
                return Err(CommandError::UnknownId(command_id.to_string()));
            };
            attempt.root_id.clone()
        };
        if let Some(tx) = self.inner.sessions.lock().get(&root_id) {
            let _ = tx.send(Signal::Cancel);
        }
        Ok(())
    }

    /// Returns a command record by id, falling back to the audit store.
    pub async fn get(&self, command_id: &str) -> Option<CommandRecord> {
        if let Some(attempt) = self.inner.attempts.lock().get(command_id) {
            return Some(attempt.record.clone());
        }
        let bytes = self
            .inner
            .storage
            .get(&command_key(command_id))
            .await
            .ok()
            .flatten()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Lists in-memory command records matching the filter.
    #[must_use]
    pub fn list(&self, filter: &CommandFilter) -> Vec<CommandRecord> {
        let mut out: Vec<CommandRecord> = self
            .inner
            .attempts
            .lock()
            .values()
            .filter(|a| filter.matches(&a.record))
            .map(|a| a.record.clone())
            .collect();
        out.sort_by(|a, b| a.issued_at.cmp(&b.issued_at).then(a.id.cmp(&b.id)));
        out
    }

    /// Cancels every live command; used during shutdown (fail-open).
    pub fn cancel_all(&self) {
        let sessions = self.inner.sessions.lock();
        for tx in sessions.values() {
            let _ = tx.send(Signal::Cancel);
        }
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> CommandManagerStats {
        let inner = &self.inner;
        CommandManagerStats {
            issued: inner.issued.load(Ordering::Relaxed),
            completed: inner.completed.load(Ordering::Relaxed),
            failed: inner.failed.load(Ordering::Relaxed),
            timeouts: inner.timeouts.load(Ordering::Relaxed),
            cancelled: inner.cancelled.load(Ordering::Relaxed),
            late_replies: inner.late_replies.load(Ordering::Relaxed),
        }
    }

    fn route(&self, id: &str, signal: Signal) {
        let root_id = {
            let attempts = self.inner.attempts.lock();
            match attempts.get(id) {
                Some(attempt) if !attempt.record.state.is_terminal() => attempt.root_id.clone(),
                Some(_) => {
                    // Late or duplicate reply for a settled attempt.
                    self.inner.late_replies.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(command = %id, "discarding reply for terminal command");
                    return;
                }
                None => {
                    self.inner.late_replies.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(command = %id, "discarding reply with unknown id");
                    return;
                }
            }
        };
        let sent = self
            .inner
            .sessions
            .lock()
            .get(&root_id)
            .is_some_and(|tx| tx.send(signal).is_ok());
        if !sent {
            self.inner.late_replies.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(command = %id, "discarding reply for finished session");
        }
    }
}

impl std::fmt::Debug for CommandManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandManager")
            .field("attempts", &self.inner.attempts.lock().len())
            .field("sessions", &self.inner.sessions.lock().len())
            .finish()
    }
}

impl Inner {
    /// Applies a validated state transition and returns the updated record.
    fn transition(
        &self,
        attempt_id: &str,
        next: CommandState,
        mutate: impl FnOnce(&mut CommandRecord),
    ) -> Option<CommandRecord> {
        let mut attempts = self.attempts.lock();
        let attempt = attempts.get_mut(attempt_id)?;
        if !attempt.record.state.can_transition(next) {
            tracing::warn!(
                command = %attempt_id,
                from = ?attempt.record.state,
                to = ?next,
                "refusing invalid command state transition"
            );
            return None;
        }
        attempt.record.state = next;
        mutate(&mut attempt.record);
        Some(attempt.record.clone())
    }

    async fn persist_terminal(&self, record: &CommandRecord) {
        match serde_json::to_vec(record) {
            Ok(bytes) => {
                if let Err(e) = self.storage.set(&command_key(&record.id), bytes).await {
                    tracing::warn!(command = %record.id, error = %e, "failed to persist command audit row");
                }
            }
            Err(e) => {
                tracing::warn!(command = %record.id, error = %e, "failed to serialize command");
            }
        }
    }

    fn count_terminal(&self, state: CommandState) {
        match state {
            CommandState::Completed => self.completed.fetch_add(1, Ordering::Relaxed),
            CommandState::Failed => self.failed.fetch_add(1, Ordering::Relaxed),
            CommandState::Timeout => self.timeouts.fetch_add(1, Ordering::Relaxed),
            CommandState::Cancelled => self.cancelled.fetch_add(1, Ordering::Relaxed),
            CommandState::Pending | CommandState::Sent | CommandState::Acked => 0,
        };
    }
}

fn request_payload(record: &CommandRecord) -> Vec<u8> {
    let mut body = Map::new();
    body.insert("id".to_string(), Value::String(record.id.clone()));
    body.insert("op".to_string(), Value::String(record.op.clone()));
    body.insert("args".to_string(), Value::Object(record.args.clone()));
    Envelope::new(SchemaId::new(format!("cmd.{}", record.op), 1, 0), body).encode()
}

/// Supervisor for one logical command; drives attempts to a terminal state.
#[allow(clippy::too_many_lines)]
async fn run_command(
    inner: Arc<Inner>,
    first: CommandRecord,
    result_timeout: std::time::Duration,
    cancel_token: Option<tokio_util::sync::CancellationToken>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    outcome_tx: oneshot::Sender<CommandOutcome>,
) {
    let root_id = first.id.clone();
    let cancel_token = cancel_token.unwrap_or_default();
    let mut attempt = first;
    let mut retry_count = 0u32;

    let outcome = loop {
        // Publish this attempt.
        let payload = request_payload(&attempt);
        if let Err(e) = inner.publisher.publish_request(&attempt.device, payload).await {
            let record = inner.transition(&attempt.id, CommandState::Failed, |r| {
                r.error = Some(format!("publish failed: {e}"));
            });
            break finish(record, CommandState::Failed, None, Some(format!("publish failed: {e}")), retry_count, &attempt.id);
        }
        inner.transition(&attempt.id, CommandState::Sent, |_| {});

        // Wait for the ack (or an implicit one via an early result).
        let ack_deadline = Instant::now() + inner.config.ack_timeout;
        let ack_wait = loop {
            tokio::select! {
                () = cancel_token.cancelled() => break AckWait::Cancelled,
                signal = timeout_at(ack_deadline, signals.recv()) => match signal {
                    Err(_) => break AckWait::Timeout,
                    Ok(None) => break AckWait::Cancelled,
                    Ok(Some(Signal::Cancel)) => break AckWait::Cancelled,
                    Ok(Some(Signal::Ack(body))) if body.id == attempt.id => break AckWait::Ack(body),
                    Ok(Some(Signal::Result(body))) if body.id == attempt.id => break AckWait::Result(body),
                    Ok(Some(_)) => {} // reply for a superseded attempt; keep waiting
                }
            }
        };

        match ack_wait {
            AckWait::Cancelled => {
                let record = inner.transition(&attempt.id, CommandState::Cancelled, |r| {
                    r.error = Some("cancelled".to_string());
                });
                break finish(record, CommandState::Cancelled, None, Some("cancelled".to_string()), retry_count, &attempt.id);
            }
            AckWait::Timeout => {
                let record = inner.transition(&attempt.id, CommandState::Timeout, |r| {
                    r.error = Some("no ack within window".to_string());
                });
                if let Some(record) = &record {
                    inner.persist_terminal(record).await;
                }
                inner.events.publish(ControllerEvent::CommandTimedOut {
                    command_id: attempt.id.clone(),
                    device_id: attempt.device.device_id.clone(),
                });
                if attempt.retries_left == 0 {
                    inner.count_terminal(CommandState::Timeout);
                    let _ = outcome_tx.send(CommandOutcome {
                        command_id: attempt.id.clone(),
                        state: CommandState::Timeout,
                        result: None,
                        error: Some("no ack within window".to_string()),
                        retry_count,
                    });
                    cleanup(&inner, &root_id).await;
                    return;
                }

                // Retry with a fresh id; the old id stays terminal.
                retry_count += 1;
                let mut next = attempt.clone();
                next.id = Uuid::new_v4().to_string();
                next.state = CommandState::Pending;
                next.issued_at = now_ms();
                next.retries_left = attempt.retries_left - 1;
                next.retry_count = retry_count;
                next.error = None;
                tracing::debug!(
                    command = %root_id,
                    attempt = %next.id,
                    retry = retry_count,
                    "retrying command with fresh id"
                );
                // Replies for the new id route to the same session via the
                // attempt table's root_id.
                inner.attempts.lock().insert(
                    next.id.clone(),
                    Attempt {
                        root_id: root_id.clone(),
                        record: next.clone(),
                    },
                );
                attempt = next;
                continue;
            }
            AckWait::Ack(body) => {
                if body.status == AckStatus::Rejected {
                    let error = body.error.unwrap_or_else(|| "rejected".to_string());
                    let record = inner.transition(&attempt.id, CommandState::Failed, |r| {
                        r.error = Some(error.clone());
                    });
                    break finish(record, CommandState::Failed, None, Some(error), retry_count, &attempt.id);
                }
                inner.transition(&attempt.id, CommandState::Acked, |r| {
                    r.ack_at = Some(now_ms());
                });
            }
            AckWait::Result(body) => {
                // Implicit ack: the device skipped straight to the result.
                inner.transition(&attempt.id, CommandState::Acked, |r| {
                    r.ack_at = Some(now_ms());
                });
                break settle_result(&inner, &attempt.id, body, retry_count);
            }
        }

        // Acked; wait for the result.
        let result_deadline = Instant::now() + result_timeout;
        let settled = loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    let record = inner.transition(&attempt.id, CommandState::Cancelled, |r| {
                        r.error = Some("cancelled".to_string());
                    });
                    break finish(record, CommandState::Cancelled, None, Some("cancelled".to_string()), retry_count, &attempt.id);
                }
                signal = timeout_at(result_deadline, signals.recv()) => match signal {
                    Err(_) => {
                        let record = inner.transition(&attempt.id, CommandState::Timeout, |r| {
                            r.error = Some("no result within window".to_string());
                        });
                        inner.events.publish(ControllerEvent::CommandTimedOut {
                            command_id: attempt.id.clone(),
                            device_id: attempt.device.device_id.clone(),
                        });
                        break finish(record, CommandState::Timeout, None, Some("no result within window".to_string()), retry_count, &attempt.id);
                    }
                    Ok(None | Some(Signal::Cancel)) => {
                        let record = inner.transition(&attempt.id, CommandState::Cancelled, |r| {
                            r.error = Some("cancelled".to_string());
                        });
                        break finish(record, CommandState::Cancelled, None, Some("cancelled".to_string()), retry_count, &attempt.id);
                    }
                    Ok(Some(Signal::Result(body))) if body.id == attempt.id => {
                        break settle_result(&inner, &attempt.id, body, retry_count);
                    }
                    Ok(Some(_)) => {} // duplicate ack or stray reply; keep waiting
                }
            }
        };
        break settled;
    };

    if let Some(record) = &outcome.0 {
        inner.persist_terminal(record).await;
    }
    inner.count_terminal(outcome.1.state);
    let _ = outcome_tx.send(outcome.1);
    cleanup(&inner, &root_id).await;
}

enum AckWait {
    Ack(AckBody),
    Result(ResultBody),
    Timeout,
    Cancelled,
}

/// Builds the `(record, outcome)` pair for a terminal transition.
fn finish(
    record: Option<CommandRecord>,
    state: CommandState,
    result: Option<Map<String, Value>>,
    error: Option<String>,
    retry_count: u32,
    attempt_id: &str,
) -> (Option<CommandRecord>, CommandOutcome) {
    (
        record,
        CommandOutcome {
            command_id: attempt_id.to_string(),
            state,
            result,
            error,
            retry_count,
        },
    )
}

fn settle_result(
    inner: &Inner,
    attempt_id: &str,
    body: ResultBody,
    retry_count: u32,
) -> (Option<CommandRecord>, CommandOutcome) {
    let (state, error) = match body.status {
        ResultStatus::Completed => (CommandState::Completed, None),
        ResultStatus::Failed => (
            CommandState::Failed,
            Some(body.error.clone().unwrap_or_else(|| "failed".to_string())),
        ),
    };
    let result = body.result.clone();
    let record = inner.transition(attempt_id, state, |r| {
        r.result = Some(result.clone());
        r.error = error.clone();
    });
    finish(record, state, Some(body.result), error, retry_count, attempt_id)
}

/// Drops the session immediately and the attempt rows after the grace period.
async fn cleanup(inner: &Arc<Inner>, root_id: &str) {
    inner.sessions.lock().remove(root_id);
    let stale_ids: Vec<String> = inner
        .attempts
        .lock()
        .values()
        .filter(|a| a.root_id == *root_id)
        .map(|a| a.record.id.clone())
        .collect();

    let inner = Arc::clone(inner);
    let grace = inner.config.eviction_grace;
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        let mut attempts = inner.attempts.lock();
        for id in stale_ids {
            attempts.remove(&id);
        }
    });
}
