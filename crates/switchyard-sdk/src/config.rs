// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SDK configuration.

use std::env;
use std::time::Duration;

use switchyard_queue::{ConsumerConfig, MAX_BATCH_SIZE};
use uuid::Uuid;

use crate::error::{Result, SdkError};

/// Default control-plane endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://api.switchyard.dev";

/// Allowed range for the long-poll wait, in milliseconds.
pub const POLL_WAIT_RANGE_MS: std::ops::RangeInclusive<u64> = 5_000..=20_000;

/// Client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// API secret (required) - must start with `sk_`
    pub api_secret: String,
    /// Control-plane endpoint (default: "https://api.switchyard.dev")
    pub endpoint: String,
    /// Machine identity sent with every request (default: generated)
    pub machine_id: String,
    /// Long-poll wait per queue receive in milliseconds (default: 20_000, 5_000..=20_000)
    pub poll_wait_ms: u64,
    /// Background heartbeat interval in milliseconds (default: 10_000).
    /// Set to 0 to disable the heartbeat.
    pub heartbeat_interval_ms: u64,
    /// Control-plane request timeout in milliseconds (default: 30_000)
    pub request_timeout_ms: u64,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("api_secret", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("machine_id", &self.machine_id)
            .field("poll_wait_ms", &self.poll_wait_ms)
            .field("heartbeat_interval_ms", &self.heartbeat_interval_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish()
    }
}

impl ClientConfig {
    /// Load configuration from environment variables.
    ///
    /// # Required Environment Variables
    /// - `SWITCHYARD_API_SECRET` - API secret for the control plane
    ///
    /// # Optional Environment Variables
    /// - `SWITCHYARD_API_ENDPOINT` - Control-plane endpoint (default: "https://api.switchyard.dev")
    /// - `SWITCHYARD_MACHINE_ID` - Machine identity (default: generated)
    /// - `SWITCHYARD_POLL_WAIT_MS` - Long-poll wait (default: 20000, allowed 5000-20000)
    /// - `SWITCHYARD_HEARTBEAT_INTERVAL_MS` - Heartbeat interval (default: 10000, 0 to disable)
    /// - `SWITCHYARD_REQUEST_TIMEOUT_MS` - Request timeout (default: 30000)
    pub fn from_env() -> Result<Self> {
        let api_secret = env::var("SWITCHYARD_API_SECRET")
            .map_err(|_| SdkError::Config("SWITCHYARD_API_SECRET is required".to_string()))?;

        let mut config = Self::new(api_secret);

        if let Ok(endpoint) = env::var("SWITCHYARD_API_ENDPOINT") {
            config.endpoint = endpoint;
        }

        if let Ok(machine_id) = env::var("SWITCHYARD_MACHINE_ID") {
            config.machine_id = machine_id;
        }

        if let Ok(value) = env::var("SWITCHYARD_POLL_WAIT_MS") {
            config.poll_wait_ms = value.parse().map_err(|e| {
                SdkError::Config(format!("invalid SWITCHYARD_POLL_WAIT_MS: {}", e))
            })?;
        }

        config.heartbeat_interval_ms = env::var("SWITCHYARD_HEARTBEAT_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.heartbeat_interval_ms);

        config.request_timeout_ms = env::var("SWITCHYARD_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.request_timeout_ms);

        config.validate()?;
        Ok(config)
    }

    /// Create a configuration with defaults for everything but the secret.
    pub fn new(api_secret: impl Into<String>) -> Self {
        Self {
            api_secret: api_secret.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            machine_id: generate_machine_id(),
            poll_wait_ms: 20_000,
            heartbeat_interval_ms: 10_000,
            request_timeout_ms: 30_000,
        }
    }

    /// Set the control-plane endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Set the machine identity.
    pub fn with_machine_id(mut self, machine_id: impl Into<String>) -> Self {
        self.machine_id = machine_id.into();
        self
    }

    /// Set the long-poll wait.
    pub fn with_poll_wait_ms(mut self, poll_wait_ms: u64) -> Self {
        self.poll_wait_ms = poll_wait_ms;
        self
    }

    /// Set the background heartbeat interval.
    /// Set to 0 to disable the heartbeat.
    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    /// Set the request timeout.
    pub fn with_request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }

    /// Check every field. Called by the client before any network activity.
    pub fn validate(&self) -> Result<()> {
        if self.api_secret.is_empty() {
            return Err(SdkError::Config("API secret is required".to_string()));
        }
        if !self.api_secret.starts_with("sk_") {
            return Err(SdkError::Config(
                "API secret must start with 'sk_'".to_string(),
            ));
        }
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(SdkError::Config(format!(
                "endpoint must be an http(s) URL, got '{}'",
                self.endpoint
            )));
        }
        if self.machine_id.trim().is_empty() {
            return Err(SdkError::Config("machine id must not be empty".to_string()));
        }
        if !POLL_WAIT_RANGE_MS.contains(&self.poll_wait_ms) {
            return Err(SdkError::Config(format!(
                "poll wait must be between {} and {} ms, got {}",
                POLL_WAIT_RANGE_MS.start(),
                POLL_WAIT_RANGE_MS.end(),
                self.poll_wait_ms
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(SdkError::Config(
                "request timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Generate a machine identity for processes that do not configure one.
pub fn generate_machine_id() -> String {
    format!("machine-{}", Uuid::new_v4().simple())
}

/// Retry strategy for result persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryStrategy {
    /// Exponential backoff: delay * 2^(attempt-1)
    #[default]
    ExponentialBackoff,
}

/// Retry behaviour for control-plane writes that must not be lost.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries, just one attempt).
    pub max_retries: u32,
    /// Base delay between retries in milliseconds.
    pub delay_ms: u64,
    /// Retry strategy for calculating delays.
    pub strategy: RetryStrategy,
}

impl RetryConfig {
    pub fn new(max_retries: u32, delay_ms: u64, strategy: RetryStrategy) -> Self {
        Self {
            max_retries,
            delay_ms,
            strategy,
        }
    }

    /// Delay before the given retry attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = match self.strategy {
            RetryStrategy::ExponentialBackoff => 2u64.saturating_pow(attempt.saturating_sub(1)),
        };
        Duration::from_millis(self.delay_ms.saturating_mul(multiplier))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_ms: 500,
            strategy: RetryStrategy::default(),
        }
    }
}

/// Per-agent tunables.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Messages per receive (default: 10)
    pub batch_size: usize,
    /// Long-poll wait per receive (default: 20s)
    pub poll_wait: Duration,
    /// How long received jobs stay hidden from other machines (default: 60s)
    pub visibility_timeout: Duration,
    /// Pause between failed receives (default: 1s)
    pub error_backoff: Duration,
    /// Bound on waiting for the consumer to report polling (default: 30s)
    pub start_timeout: Duration,
    /// Bound on waiting for the consumer to stop (default: 30s)
    pub stop_timeout: Duration,
    /// Restart when credentials expire within this margin (default: 60s)
    pub expiry_margin: Duration,
    /// Retry policy for result persistence
    pub result_retry: RetryConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_SIZE,
            poll_wait: Duration::from_millis(20_000),
            visibility_timeout: Duration::from_secs(60),
            error_backoff: Duration::from_secs(1),
            start_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(30),
            expiry_margin: Duration::from_secs(60),
            result_retry: RetryConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Derive agent tunables from the client configuration.
    pub fn from_client_config(config: &ClientConfig) -> Self {
        Self {
            poll_wait: Duration::from_millis(config.poll_wait_ms),
            ..Self::default()
        }
    }

    pub(crate) fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            batch_size: self.batch_size,
            wait_time: self.poll_wait,
            visibility_timeout: self.visibility_timeout,
            error_backoff: self.error_backoff,
            terminate_visibility_timeout: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_config_defaults() {
        let config = ClientConfig::new("sk_test");
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.poll_wait_ms, 20_000);
        assert_eq!(config.heartbeat_interval_ms, 10_000);
        assert!(config.machine_id.starts_with("machine-"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = ClientConfig::new("sk_test")
            .with_endpoint("http://localhost:4000")
            .with_machine_id("m-1")
            .with_poll_wait_ms(5_000)
            .with_heartbeat_interval_ms(0);

        assert_eq!(config.endpoint, "http://localhost:4000");
        assert_eq!(config.machine_id, "m-1");
        assert_eq!(config.poll_wait_ms, 5_000);
        assert_eq!(config.heartbeat_interval_ms, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_secret_must_have_prefix() {
        let err = ClientConfig::new("pk_public").validate().unwrap_err();
        assert!(matches!(err, SdkError::Config(msg) if msg.contains("sk_")));
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(matches!(
            ClientConfig::new("").validate(),
            Err(SdkError::Config(_))
        ));
    }

    #[test]
    fn test_poll_wait_bounds() {
        for ok in [5_000, 12_345, 20_000] {
            assert!(
                ClientConfig::new("sk_x")
                    .with_poll_wait_ms(ok)
                    .validate()
                    .is_ok()
            );
        }
        for bad in [0, 4_999, 20_001] {
            assert!(
                ClientConfig::new("sk_x")
                    .with_poll_wait_ms(bad)
                    .validate()
                    .is_err()
            );
        }
    }

    #[test]
    fn test_endpoint_must_be_http() {
        let err = ClientConfig::new("sk_x")
            .with_endpoint("ftp://example.com")
            .validate()
            .unwrap_err();
        assert!(matches!(err, SdkError::Config(_)));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let debug = format!("{:?}", ClientConfig::new("sk_super_secret"));
        assert!(!debug.contains("sk_super_secret"));
    }

    #[test]
    fn test_machine_ids_are_unique() {
        assert_ne!(generate_machine_id(), generate_machine_id());
    }

    #[test]
    fn test_retry_delay_calculation() {
        let retry = RetryConfig::new(3, 100, RetryStrategy::ExponentialBackoff);
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn test_agent_config_from_client_config() {
        let client = ClientConfig::new("sk_x").with_poll_wait_ms(7_000);
        let agent = AgentConfig::from_client_config(&client);
        assert_eq!(agent.poll_wait, Duration::from_millis(7_000));
        assert_eq!(agent.batch_size, 10);
        assert_eq!(agent.expiry_margin, Duration::from_secs(60));

        let consumer = agent.consumer_config();
        assert_eq!(consumer.wait_time, Duration::from_millis(7_000));
        assert_eq!(consumer.batch_size, 10);
    }
}
