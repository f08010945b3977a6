// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue error types.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised by queue transports and the consumer loop.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// The transport failed to talk to the broker (network blip, 5xx, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// The credentials bound to the connection are no longer valid.
    #[error("queue credentials expired at {0}")]
    ExpiredCredentials(DateTime<Utc>),

    /// Could not establish a connection for the given endpoint.
    #[error("connection error: {0}")]
    Connection(String),

    /// Delete or visibility change referenced a receipt the broker does not know.
    #[error("unknown receipt handle: {0}")]
    UnknownReceipt(String),

    /// `start()` was called on a consumer that already ran.
    #[error("consumer already started")]
    AlreadyStarted,

    /// The consumer stopped before reaching the awaited state.
    #[error("consumer stopped")]
    Stopped,

    /// A status wait did not complete in time.
    #[error("timed out after {waited_ms}ms waiting for consumer to become {target}")]
    Timeout {
        /// How long the caller waited.
        waited_ms: u64,
        /// The status that was awaited.
        target: &'static str,
    },
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
