// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Messages and endpoint descriptions.

use std::fmt;

use chrono::{DateTime, Utc};

/// A message received from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Broker-assigned message identifier, stable across redeliveries.
    pub message_id: String,
    /// Handle for this particular delivery, used to delete or release it.
    pub receipt_handle: String,
    /// Message body. Brokers may deliver messages without one.
    pub body: Option<String>,
    /// How many times this message has been delivered, including this one.
    pub receive_count: u32,
}

/// Temporary credentials scoped to a single queue.
#[derive(Clone, PartialEq, Eq)]
pub struct QueueCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    /// Point in time after which the broker rejects these credentials.
    pub expiration: DateTime<Utc>,
}

impl fmt::Debug for QueueCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expiration", &self.expiration)
            .finish()
    }
}

/// Everything a connector needs to reach a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEndpoint {
    pub queue_url: String,
    pub region: String,
    pub credentials: QueueCredentials,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let creds = QueueCredentials {
            access_key_id: "AKIA123".to_string(),
            secret_access_key: "very-secret".to_string(),
            session_token: "token-value".to_string(),
            expiration: Utc::now(),
        };

        let debug = format!("{:?}", creds);
        assert!(debug.contains("AKIA123"));
        assert!(!debug.contains("very-secret"));
        assert!(!debug.contains("token-value"));
    }
}
