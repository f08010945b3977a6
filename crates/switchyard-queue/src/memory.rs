// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory queue.
//!
//! A single-process broker with the semantics the consumer relies on:
//! long-poll receive, visibility timeouts with redelivery, delete on success
//! and credential expiry enforced per connection. It also supports failure
//! injection so callers can exercise self-healing paths without a real broker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::message::{QueueEndpoint, QueueMessage};
use crate::transport::{QueueConnector, QueueTransport};

/// Upper bound on how long a receive sleeps before re-checking visibility deadlines.
const VISIBILITY_RECHECK: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: Option<String>,
    receive_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<String, (StoredMessage, Instant)>,
    deleted: u64,
}

impl QueueState {
    /// Move messages whose visibility timeout lapsed back to the ready queue.
    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in expired {
            if let Some((message, _)) = self.in_flight.remove(&receipt) {
                debug!(message_id = %message.message_id, "Visibility timeout lapsed, requeueing");
                self.ready.push_back(message);
            }
        }
    }
}

/// In-memory queue shared by all of its connections.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    failures_remaining: AtomicUsize,
    receive_calls: AtomicUsize,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        // State stays consistent even if a holder panicked mid-way: every
        // mutation is a single push/remove.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a message with a body. Returns the message id.
    pub fn send(&self, body: impl Into<String>) -> String {
        self.send_raw(Some(body.into()))
    }

    /// Enqueue a message that may lack a body. Returns the message id.
    pub fn send_raw(&self, body: Option<String>) -> String {
        let message_id = Uuid::new_v4().to_string();
        self.state().ready.push_back(StoredMessage {
            message_id: message_id.clone(),
            body,
            receive_count: 0,
        });
        self.notify.notify_waiters();
        message_id
    }

    /// Make the next `count` receive calls fail with a transport error.
    pub fn fail_next_receives(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Messages waiting to be received.
    pub fn ready_len(&self) -> usize {
        self.state().ready.len()
    }

    /// Messages received but neither deleted nor released yet.
    pub fn in_flight_len(&self) -> usize {
        self.state().in_flight.len()
    }

    /// Messages deleted so far.
    pub fn deleted_count(&self) -> u64 {
        self.state().deleted
    }

    /// Receive calls made so far, failed ones included.
    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }

    fn take_injected_failure(&self) -> bool {
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn try_take(&self, max_messages: usize, visibility_timeout: Duration) -> Vec<QueueMessage> {
        let now = Instant::now();
        let mut state = self.state();
        state.requeue_expired(now);

        let mut batch = Vec::new();
        while batch.len() < max_messages {
            let Some(mut message) = state.ready.pop_front() else {
                break;
            };
            message.receive_count += 1;
            let receipt_handle = Uuid::new_v4().to_string();
            batch.push(QueueMessage {
                message_id: message.message_id.clone(),
                receipt_handle: receipt_handle.clone(),
                body: message.body.clone(),
                receive_count: message.receive_count,
            });
            state
                .in_flight
                .insert(receipt_handle, (message, now + visibility_timeout));
        }
        batch
    }
}

#[async_trait]
impl QueueTransport for MemoryQueue {
    async fn receive(
        &self,
        max_messages: usize,
        wait_time: Duration,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_injected_failure() {
            return Err(QueueError::Transport(
                "injected receive failure (503 Service Unavailable)".to_string(),
            ));
        }

        let deadline = Instant::now() + wait_time;
        loop {
            // Register interest before checking so a concurrent send is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.try_take(max_messages, visibility_timeout);
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let nap = (deadline - now).min(VISIBILITY_RECHECK);
            let _ = tokio::time::timeout(nap, notified).await;
        }
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        let mut state = self.state();
        match state.in_flight.remove(receipt_handle) {
            Some(_) => {
                state.deleted += 1;
                Ok(())
            }
            None => Err(QueueError::UnknownReceipt(receipt_handle.to_string())),
        }
    }

    async fn change_visibility(&self, receipt_handle: &str, timeout: Duration) -> Result<()> {
        let mut state = self.state();
        let Some((message, _)) = state.in_flight.remove(receipt_handle) else {
            return Err(QueueError::UnknownReceipt(receipt_handle.to_string()));
        };

        if timeout.is_zero() {
            state.ready.push_back(message);
            drop(state);
            self.notify.notify_waiters();
        } else {
            state
                .in_flight
                .insert(receipt_handle.to_string(), (message, Instant::now() + timeout));
        }
        Ok(())
    }
}

/// A connection to a [`MemoryQueue`] that enforces credential expiry.
#[derive(Debug)]
pub struct MemoryConnection {
    queue: Arc<MemoryQueue>,
    expires_at: DateTime<Utc>,
}

impl MemoryConnection {
    fn check_credentials(&self) -> Result<()> {
        if Utc::now() >= self.expires_at {
            return Err(QueueError::ExpiredCredentials(self.expires_at));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueTransport for MemoryConnection {
    async fn receive(
        &self,
        max_messages: usize,
        wait_time: Duration,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>> {
        self.check_credentials()?;
        self.queue
            .receive(max_messages, wait_time, visibility_timeout)
            .await
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        self.check_credentials()?;
        self.queue.delete(receipt_handle).await
    }

    async fn change_visibility(&self, receipt_handle: &str, timeout: Duration) -> Result<()> {
        self.check_credentials()?;
        self.queue.change_visibility(receipt_handle, timeout).await
    }
}

/// Connector that routes every endpoint to one shared [`MemoryQueue`].
#[derive(Debug)]
pub struct MemoryConnector {
    queue: Arc<MemoryQueue>,
    endpoints: Mutex<Vec<QueueEndpoint>>,
}

impl MemoryConnector {
    pub fn new(queue: Arc<MemoryQueue>) -> Self {
        Self {
            queue,
            endpoints: Mutex::new(Vec::new()),
        }
    }

    pub fn queue(&self) -> &Arc<MemoryQueue> {
        &self.queue
    }

    /// Endpoints connected so far, oldest first.
    pub fn endpoints(&self) -> Vec<QueueEndpoint> {
        self.endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of connections opened so far.
    pub fn connection_count(&self) -> usize {
        self.endpoints.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl QueueConnector for MemoryConnector {
    async fn connect(&self, endpoint: &QueueEndpoint) -> Result<Arc<dyn QueueTransport>> {
        if endpoint.queue_url.is_empty() {
            return Err(QueueError::Connection("queue url is empty".to_string()));
        }

        self.endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(endpoint.clone());

        Ok(Arc::new(MemoryConnection {
            queue: Arc::clone(&self.queue),
            expires_at: endpoint.credentials.expiration,
        }))
    }
}
