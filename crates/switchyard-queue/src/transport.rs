// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transport trait definitions.
//!
//! Defines the abstract interface a queue broker client must provide.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::{QueueEndpoint, QueueMessage};

/// A connection to one queue.
///
/// Implementations own their retry policy for individual calls. The consumer
/// loop only backs off between failed receives.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Receive up to `max_messages`, long-polling for at most `wait_time`.
    ///
    /// Received messages stay invisible to other receivers for
    /// `visibility_timeout` unless deleted or released first.
    async fn receive(
        &self,
        max_messages: usize,
        wait_time: Duration,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>>;

    /// Permanently remove a delivered message.
    async fn delete(&self, receipt_handle: &str) -> Result<()>;

    /// Change how long a delivered message stays invisible. Zero releases it.
    async fn change_visibility(&self, receipt_handle: &str, timeout: Duration) -> Result<()>;
}

/// Builds transports for endpoints handed out by the control plane.
#[async_trait]
pub trait QueueConnector: Send + Sync {
    /// Open a transport bound to the endpoint and its credentials.
    async fn connect(&self, endpoint: &QueueEndpoint) -> Result<Arc<dyn QueueTransport>>;
}
