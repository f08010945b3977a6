// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Managed consume loop.
//!
//! A [`Consumer`] repeatedly receives batches from a [`QueueTransport`] and
//! hands every message of a batch to a [`MessageHandler`] on its own task.
//! Handled messages are deleted; failed ones are left for the broker to
//! redeliver once their visibility timeout lapses.
//!
//! The loop reports what it is doing through two channels:
//! - a `broadcast` channel of [`ConsumerEvent`]s (lifecycle signals), and
//! - a `watch` channel of [`ConsumerStatus`] used to await readiness and
//!   quiescence without polling.
//!
//! Stopping cancels the receive in flight immediately. Handler tasks that were
//! already dispatched keep running and still delete their messages.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{QueueError, Result};
use crate::message::QueueMessage;
use crate::transport::QueueTransport;

/// Maximum number of messages a single receive may return.
pub const MAX_BATCH_SIZE: usize = 10;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Error type returned by message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes one message. Returning `Ok` deletes the message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &QueueMessage) -> std::result::Result<(), HandlerError>;
}

/// Lifecycle signals emitted by the consumer loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    /// The loop is running and about to issue its first receive.
    Started,
    /// A message was received and dispatched to the handler.
    MessageReceived(String),
    /// A message was handled and deleted.
    MessageProcessed(String),
    /// A receive returned no messages.
    EmptyQueue,
    /// Every message of a batch finished processing.
    BatchProcessed,
    /// A transport call failed.
    Error(String),
    /// The handler failed for a message.
    ProcessingError {
        /// Message whose processing failed.
        message_id: String,
        /// Rendered handler error.
        error: String,
    },
    /// The loop exited.
    Stopped,
}

/// Coarse state of the consume loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStatus {
    /// Constructed, not started.
    Idle,
    /// Receiving and dispatching messages.
    Polling,
    /// Stop requested, loop still unwinding.
    Stopping,
    /// Loop exited (or never started and was stopped).
    Stopped,
}

impl ConsumerStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ConsumerStatus::Idle => "idle",
            ConsumerStatus::Polling => "polling",
            ConsumerStatus::Stopping => "stopping",
            ConsumerStatus::Stopped => "stopped",
        }
    }
}

/// Tunables for the consume loop.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Messages per receive (1..=10).
    pub batch_size: usize,
    /// Long-poll wait per receive.
    pub wait_time: Duration,
    /// How long received messages stay hidden from other receivers.
    pub visibility_timeout: Duration,
    /// Pause between a failed receive and the next attempt.
    pub error_backoff: Duration,
    /// Release failed messages immediately instead of waiting for the
    /// visibility timeout to lapse.
    pub terminate_visibility_timeout: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_SIZE,
            wait_time: Duration::from_secs(20),
            visibility_timeout: Duration::from_secs(60),
            error_backoff: Duration::from_secs(1),
            terminate_visibility_timeout: false,
        }
    }
}

/// Managed consume loop over one transport.
pub struct Consumer {
    transport: Arc<dyn QueueTransport>,
    handler: Arc<dyn MessageHandler>,
    config: ConsumerConfig,
    events: broadcast::Sender<ConsumerEvent>,
    status: watch::Sender<ConsumerStatus>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
}

impl Consumer {
    /// Create a consumer. Nothing happens until [`Consumer::start`].
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        handler: Arc<dyn MessageHandler>,
        mut config: ConsumerConfig,
    ) -> Self {
        config.batch_size = config.batch_size.clamp(1, MAX_BATCH_SIZE);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (status, _) = watch::channel(ConsumerStatus::Idle);

        Self {
            transport,
            handler,
            config,
            events,
            status,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Subscribe to lifecycle signals.
    pub fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.events.subscribe()
    }

    /// Current loop status.
    pub fn status(&self) -> ConsumerStatus {
        *self.status.borrow()
    }

    /// Whether the loop is currently receiving.
    pub fn is_polling(&self) -> bool {
        self.status() == ConsumerStatus::Polling
    }

    /// Number of dispatched handler tasks that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Spawn the consume loop.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(QueueError::Stopped);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(QueueError::AlreadyStarted);
        }

        // Status flips to Polling once the loop itself is running
        let consumer = Arc::clone(self);
        tokio::spawn(async move { consumer.run().await });
        Ok(())
    }

    /// Request the loop to stop, aborting the receive in flight.
    ///
    /// Returns immediately; use [`Consumer::wait_until_stopped`] to await the
    /// loop exit.
    pub fn stop(&self) {
        self.cancel.cancel();
        if self.started.load(Ordering::SeqCst) {
            self.status.send_if_modified(|status| {
                if matches!(*status, ConsumerStatus::Idle | ConsumerStatus::Polling) {
                    *status = ConsumerStatus::Stopping;
                    true
                } else {
                    false
                }
            });
        } else {
            self.status.send_replace(ConsumerStatus::Stopped);
        }
    }

    /// Wait until the loop reports itself polling.
    pub async fn wait_until_polling(&self, timeout: Duration) -> Result<()> {
        let reached = self
            .wait_for_status(timeout, "polling", |s| *s != ConsumerStatus::Idle)
            .await?;
        if reached == ConsumerStatus::Polling {
            Ok(())
        } else {
            Err(QueueError::Stopped)
        }
    }

    /// Wait until the loop has exited.
    pub async fn wait_until_stopped(&self, timeout: Duration) -> Result<()> {
        self.wait_for_status(timeout, "stopped", |s| *s == ConsumerStatus::Stopped)
            .await
            .map(|_| ())
    }

    /// Wait for dispatched handler tasks to finish. Returns false on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok()
    }

    async fn wait_for_status(
        &self,
        timeout: Duration,
        target: &'static str,
        predicate: impl FnMut(&ConsumerStatus) -> bool,
    ) -> Result<ConsumerStatus> {
        let mut rx = self.status.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(predicate)).await {
            Ok(Ok(status)) => Ok(*status),
            // Sender lives in self, so the channel cannot close while we borrow it.
            Ok(Err(_)) => Err(QueueError::Stopped),
            Err(_) => Err(QueueError::Timeout {
                waited_ms: timeout.as_millis() as u64,
                target,
            }),
        }
    }

    fn emit(&self, event: ConsumerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn run(self: Arc<Self>) {
        info!(
            batch_size = self.config.batch_size,
            wait_time_ms = self.config.wait_time.as_millis() as u64,
            "Queue consumer started"
        );
        self.emit(ConsumerEvent::Started);
        self.status.send_if_modified(|status| {
            if *status == ConsumerStatus::Idle {
                *status = ConsumerStatus::Polling;
                true
            } else {
                false
            }
        });

        loop {
            let received = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                result = self.transport.receive(
                    self.config.batch_size,
                    self.config.wait_time,
                    self.config.visibility_timeout,
                ) => result,
            };

            let messages = match received {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(error = %e, "Queue receive failed");
                    self.emit(ConsumerEvent::Error(e.to_string()));

                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => continue,
                    }
                }
            };

            if messages.is_empty() {
                debug!("Queue empty");
                self.emit(ConsumerEvent::EmptyQueue);
                continue;
            }

            debug!(count = messages.len(), "Received batch");
            let handles: Vec<_> = messages
                .into_iter()
                .map(|message| {
                    self.emit(ConsumerEvent::MessageReceived(message.message_id.clone()));
                    let consumer = Arc::clone(&self);
                    self.tracker
                        .spawn(async move { consumer.process(message).await })
                })
                .collect();

            tokio::select! {
                biased;

                // Dispatched handlers keep running on their own tasks.
                _ = self.cancel.cancelled() => break,

                _ = futures::future::join_all(handles) => {
                    self.emit(ConsumerEvent::BatchProcessed);
                }
            }
        }

        self.status.send_replace(ConsumerStatus::Stopped);
        self.emit(ConsumerEvent::Stopped);
        info!(
            in_flight = self.tracker.len(),
            "Queue consumer stopped"
        );
    }

    async fn process(&self, message: QueueMessage) {
        match self.handler.handle(&message).await {
            Ok(()) => match self.transport.delete(&message.receipt_handle).await {
                Ok(()) => {
                    self.emit(ConsumerEvent::MessageProcessed(message.message_id));
                }
                Err(e) => {
                    warn!(
                        message_id = %message.message_id,
                        error = %e,
                        "Failed to delete processed message"
                    );
                    self.emit(ConsumerEvent::Error(e.to_string()));
                }
            },
            Err(e) => {
                warn!(
                    message_id = %message.message_id,
                    error = %e,
                    "Message handler failed"
                );
                self.emit(ConsumerEvent::ProcessingError {
                    message_id: message.message_id.clone(),
                    error: e.to_string(),
                });

                if self.config.terminate_visibility_timeout
                    && let Err(e) = self
                        .transport
                        .change_visibility(&message.receipt_handle, Duration::ZERO)
                        .await
                {
                    warn!(
                        message_id = %message.message_id,
                        error = %e,
                        "Failed to release message"
                    );
                }
            }
        }
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("status", &self.status().as_str())
            .field("in_flight", &self.tracker.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConsumerConfig::default();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.wait_time, Duration::from_secs(20));
        assert_eq!(config.visibility_timeout, Duration::from_secs(60));
        assert!(!config.terminate_visibility_timeout);
    }

    #[test]
    fn test_status_names() {
        assert_eq!(ConsumerStatus::Idle.as_str(), "idle");
        assert_eq!(ConsumerStatus::Polling.as_str(), "polling");
        assert_eq!(ConsumerStatus::Stopping.as_str(), "stopping");
        assert_eq!(ConsumerStatus::Stopped.as_str(), "stopped");
    }
}
