// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SDK-specific error types.

use switchyard_queue::QueueError;
use thiserror::Error;

/// Errors that can occur in the SDK.
///
/// Configuration variants are returned synchronously during setup. Variants
/// carrying `status` and `body` come from non-success control-plane responses.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SdkError {
    /// Configuration error (missing or invalid environment variable or option)
    #[error("configuration error: {0}")]
    Config(String),

    /// A service or function name does not satisfy the naming rules
    #[error("invalid {kind} name '{name}': {reason}")]
    InvalidName {
        /// "service" or "function"
        kind: &'static str,
        /// The rejected name
        name: String,
        /// Which rule was violated
        reason: &'static str,
    },

    /// A function with this name is already registered
    #[error("function '{0}' is already registered")]
    DuplicateName(String),

    /// The input schema is not an object schema or does not compile
    #[error("invalid input schema for function '{function}': {reason}")]
    InvalidSchema {
        /// Function the schema was supplied for
        function: String,
        /// Why the schema was rejected
        reason: String,
    },

    /// The service already has a polling agent
    #[error("service '{0}' has already been started")]
    ServiceAlreadyStarted(String),

    /// A packed payload could not be decoded
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A queue message arrived without a body
    #[error("message {0} has no body")]
    MissingMessageBody(String),

    /// Machine registration was rejected by the control plane
    #[error("machine registration failed with status {status}: {body}")]
    RegistrationFailed {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// Job acknowledgement was rejected by the control plane
    #[error("job acknowledgement failed with status {status}: {body}")]
    AcknowledgeFailed {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// Result persistence was rejected by the control plane
    #[error("result persistence failed with status {status}: {body}")]
    ResultPersistFailed {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// Blob upload was rejected by the control plane
    #[error("blob persistence failed with status {status}: {body}")]
    BlobPersistFailed {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// Cluster heartbeat was rejected by the control plane
    #[error("cluster ping failed with status {status}: {body}")]
    PingFailed {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// The control plane could not be reached
    #[error("transport error: {0}")]
    Transport(String),

    /// Queue transport or consumer error
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// The consumer did not report itself polling in time
    #[error("consumer did not start polling within {0}ms")]
    StartTimeout(u64),

    /// The consumer did not stop in time
    #[error("consumer did not stop within {0}ms")]
    StopTimeout(u64),

    /// `stop()` was called on an agent without a consumer
    #[error("agent for service '{0}' is not running")]
    NotRunning(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Unexpected response from the control plane
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl From<reqwest::Error> for SdkError {
    fn from(err: reqwest::Error) -> Self {
        SdkError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for SdkError {
    fn from(err: serde_json::Error) -> Self {
        SdkError::Serialization(err.to_string())
    }
}

/// Type alias for SDK results.
pub type Result<T> = std::result::Result<T, SdkError>;
