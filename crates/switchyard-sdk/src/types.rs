// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire types exchanged with the control plane.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchyard_queue::{QueueCredentials, QueueEndpoint};

use crate::codec;
use crate::error::{Result, SdkError};
use crate::execution::{ResultEnvelope, ResultType};
use crate::registry::{FunctionConfig, FunctionRegistration};

/// A unit of work delivered through the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub target_fn: String,
    /// Packed argument value.
    pub target_args: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_context: Option<Value>,
}

impl Job {
    /// Decode a queue message body (a packed job object).
    pub fn decode(body: &str) -> Result<Self> {
        let value = codec::unpack(body)?;
        serde_json::from_value(value)
            .map_err(|e| SdkError::MalformedPayload(format!("invalid job: {}", e)))
    }

    /// Encode as a queue message body.
    pub fn encode(&self) -> Result<String> {
        Ok(codec::pack(&serde_json::to_value(self)?))
    }
}

/// Function description sent when registering a machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Canonical JSON Schema string.
    pub schema: String,
    pub config: FunctionConfig,
}

impl From<&FunctionRegistration> for FunctionDescriptor {
    fn from(registration: &FunctionRegistration) -> Self {
        Self {
            name: registration.name.clone(),
            description: registration.description.clone(),
            schema: registration.schema.canonical().to_string(),
            config: registration.config.clone(),
        }
    }
}

/// Body of `POST /machines`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterMachineRequest {
    pub service: String,
    pub functions: Vec<FunctionDescriptor>,
}

/// Temporary queue credentials as returned by the control plane.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
}

impl fmt::Debug for RemoteCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .finish()
    }
}

/// Response of `POST /machines`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineRegistration {
    pub queue_url: String,
    pub region: String,
    pub enabled: bool,
    pub expiration: DateTime<Utc>,
    pub credentials: RemoteCredentials,
    pub cluster_id: String,
}

/// Credentials held by a running agent.
///
/// Never mutated: a re-registration replaces the whole value.
#[derive(Clone, PartialEq, Eq)]
pub struct AgentCredentials {
    pub queue_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: DateTime<Utc>,
    pub enabled: bool,
    pub cluster_id: String,
}

impl AgentCredentials {
    /// Queue endpoint these credentials grant access to.
    pub fn endpoint(&self) -> QueueEndpoint {
        QueueEndpoint {
            queue_url: self.queue_url.clone(),
            region: self.region.clone(),
            credentials: QueueCredentials {
                access_key_id: self.access_key_id.clone(),
                secret_access_key: self.secret_access_key.clone(),
                session_token: self.session_token.clone(),
                expiration: self.expiration,
            },
        }
    }

    /// True if the credentials are expired or expire within `margin`.
    pub fn expires_within(&self, margin: Duration) -> bool {
        let deadline = chrono::Duration::from_std(margin)
            .ok()
            .and_then(|margin| Utc::now().checked_add_signed(margin));
        match deadline {
            Some(deadline) => self.expiration <= deadline,
            None => true,
        }
    }
}

impl From<MachineRegistration> for AgentCredentials {
    fn from(registration: MachineRegistration) -> Self {
        Self {
            queue_url: registration.queue_url,
            region: registration.region,
            access_key_id: registration.credentials.access_key_id,
            secret_access_key: registration.credentials.secret_access_key,
            session_token: registration.credentials.session_token,
            expiration: registration.expiration,
            enabled: registration.enabled,
            cluster_id: registration.cluster_id,
        }
    }
}

impl fmt::Debug for AgentCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentCredentials")
            .field("queue_url", &self.queue_url)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expiration", &self.expiration)
            .field("enabled", &self.enabled)
            .field("cluster_id", &self.cluster_id)
            .finish()
    }
}

/// Body of `POST /jobs/{jobId}/result`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedResult {
    /// Packed result content.
    pub result: String,
    pub result_type: ResultType,
    pub function_execution_time: u64,
}

impl PersistedResult {
    /// Pack an envelope whose blobs were already extracted.
    pub fn from_envelope(envelope: &ResultEnvelope) -> Self {
        Self {
            result: codec::pack(&envelope.content),
            result_type: envelope.result_type,
            function_execution_time: envelope.function_execution_time,
        }
    }
}

/// Body of `POST /ping-cluster`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PingRequest {
    pub services: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn credentials(expiration: DateTime<Utc>) -> AgentCredentials {
        AgentCredentials {
            queue_url: "memory://q".to_string(),
            region: "eu-central-1".to_string(),
            access_key_id: "AKIA".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: "session".to_string(),
            expiration,
            enabled: true,
            cluster_id: "cluster-1".to_string(),
        }
    }

    #[test]
    fn test_job_wire_shape() {
        let job: Job = serde_json::from_value(json!({
            "id": "job-1",
            "targetFn": "echo",
            "targetArgs": "{\"value\":{\"text\":\"hi\"}}",
            "authContext": {"token": "t"}
        }))
        .unwrap();

        assert_eq!(job.target_fn, "echo");
        assert_eq!(job.auth_context, Some(json!({"token": "t"})));
        assert_eq!(
            codec::unpack(&job.target_args).unwrap(),
            json!({"text": "hi"})
        );
    }

    #[test]
    fn test_job_decode_from_packed_body() {
        let job = Job {
            id: "job-2".to_string(),
            target_fn: "echo".to_string(),
            target_args: codec::pack(&json!({"text": "x"})),
            auth_context: None,
        };
        let body = job.encode().unwrap();
        assert!(!body.contains("authContext"));
        assert_eq!(Job::decode(&body).unwrap(), job);
    }

    #[test]
    fn test_job_decode_rejects_bad_bodies() {
        assert!(matches!(
            Job::decode("not json"),
            Err(SdkError::MalformedPayload(_))
        ));
        assert!(matches!(
            Job::decode(&codec::pack(&json!({"id": "only-id"}))),
            Err(SdkError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_machine_registration_wire_shape() {
        let registration: MachineRegistration = serde_json::from_value(json!({
            "queueUrl": "https://queue.example.com/123/jobs",
            "region": "us-east-1",
            "enabled": true,
            "expiration": "2030-01-01T00:00:00Z",
            "credentials": {
                "accessKeyId": "AKIA",
                "secretAccessKey": "s",
                "sessionToken": "t"
            },
            "clusterId": "c-1"
        }))
        .unwrap();

        let creds = AgentCredentials::from(registration);
        assert_eq!(creds.cluster_id, "c-1");
        let endpoint = creds.endpoint();
        assert_eq!(endpoint.queue_url, "https://queue.example.com/123/jobs");
        assert_eq!(endpoint.credentials.session_token, "t");
    }

    #[test]
    fn test_expires_within() {
        let fresh = credentials(Utc::now() + chrono::Duration::hours(1));
        assert!(!fresh.expires_within(Duration::from_secs(60)));

        let soon = credentials(Utc::now() + chrono::Duration::seconds(30));
        assert!(soon.expires_within(Duration::from_secs(60)));

        let expired = credentials(Utc::now() - chrono::Duration::seconds(1));
        assert!(expired.expires_within(Duration::ZERO));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let debug = format!("{:?}", credentials(Utc::now()));
        assert!(!debug.contains("secret\""));
        assert!(!debug.contains("session\""));
        assert!(debug.contains("cluster-1"));
    }

    #[test]
    fn test_persisted_result_shape() {
        let envelope = ResultEnvelope::resolution(json!({"ok": true}), 12);
        let body = serde_json::to_value(PersistedResult::from_envelope(&envelope)).unwrap();
        assert_eq!(
            body,
            json!({
                "result": "{\"value\":{\"ok\":true}}",
                "resultType": "resolution",
                "functionExecutionTime": 12
            })
        );
    }
}
