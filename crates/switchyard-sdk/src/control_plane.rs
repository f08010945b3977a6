// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control-plane client.
//!
//! The [`ControlPlane`] trait is the seam between the agent and the remote
//! coordinator. [`HttpControlPlane`] is the REST implementation; tests plug in
//! in-process fakes.

use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use tracing::{debug, instrument};

use crate::blob::BlobUpload;
use crate::config::ClientConfig;
use crate::error::{Result, SdkError};
use crate::types::{MachineRegistration, PersistedResult, PingRequest, RegisterMachineRequest};

/// SDK version reported with every request.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// SDK language reported with every request.
pub const SDK_LANGUAGE: &str = "rust";

/// Characters escaped when a job id is used as a path segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Operations the agent and client need from the control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Register this machine for a service and obtain queue credentials.
    async fn register_machine(&self, request: &RegisterMachineRequest)
    -> Result<MachineRegistration>;

    /// Mark a job as claimed by this machine.
    async fn acknowledge_job(&self, job_id: &str) -> Result<()>;

    /// Persist the outcome of a job.
    async fn create_result(&self, job_id: &str, result: &PersistedResult) -> Result<()>;

    /// Persist one blob extracted from a job result.
    async fn create_blob(&self, job_id: &str, blob: &BlobUpload) -> Result<()>;

    /// Report the services this machine is serving.
    async fn ping_cluster(&self, services: &[String]) -> Result<()>;
}

/// REST control-plane client.
#[derive(Clone)]
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
    api_secret: String,
    machine_id: String,
}

impl HttpControlPlane {
    /// Create a client from validated configuration.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| SdkError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            api_secret: config.api_secret.clone(),
            machine_id: config.machine_id.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_secret)
            .header("X-Machine-ID", &self.machine_id)
            .header("X-Machine-SDK-Version", SDK_VERSION)
            .header("X-Machine-SDK-Language", SDK_LANGUAGE)
    }

    fn job_path(job_id: &str, suffix: &str) -> String {
        format!(
            "/jobs/{}/{}",
            utf8_percent_encode(job_id, PATH_SEGMENT),
            suffix
        )
    }
}

impl std::fmt::Debug for HttpControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpControlPlane")
            .field("base_url", &self.base_url)
            .field("machine_id", &self.machine_id)
            .finish()
    }
}

/// Status and body of a response that did not match the expected status.
async fn unexpected(response: Response) -> (u16, String) {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    (status, body)
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    #[instrument(skip(self, request), fields(service = %request.service, functions = request.functions.len()))]
    async fn register_machine(
        &self,
        request: &RegisterMachineRequest,
    ) -> Result<MachineRegistration> {
        let response = self
            .request(Method::POST, "/machines")
            .json(request)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            let (status, body) = unexpected(response).await;
            return Err(SdkError::RegistrationFailed { status, body });
        }

        let registration: MachineRegistration = response.json().await.map_err(|e| {
            SdkError::UnexpectedResponse(format!("invalid machine registration: {}", e))
        })?;
        debug!(
            cluster_id = %registration.cluster_id,
            enabled = registration.enabled,
            expiration = %registration.expiration,
            "Machine registered"
        );
        Ok(registration)
    }

    #[instrument(skip(self))]
    async fn acknowledge_job(&self, job_id: &str) -> Result<()> {
        let response = self
            .request(Method::PUT, &Self::job_path(job_id, "acknowledge"))
            .send()
            .await?;

        if response.status() != StatusCode::NO_CONTENT {
            let (status, body) = unexpected(response).await;
            return Err(SdkError::AcknowledgeFailed { status, body });
        }
        Ok(())
    }

    #[instrument(skip(self, result), fields(result_type = ?result.result_type))]
    async fn create_result(&self, job_id: &str, result: &PersistedResult) -> Result<()> {
        let response = self
            .request(Method::POST, &Self::job_path(job_id, "result"))
            .json(result)
            .send()
            .await?;

        if response.status() != StatusCode::NO_CONTENT {
            let (status, body) = unexpected(response).await;
            return Err(SdkError::ResultPersistFailed { status, body });
        }
        Ok(())
    }

    #[instrument(skip(self, blob), fields(blob = %blob.name, size = blob.size))]
    async fn create_blob(&self, job_id: &str, blob: &BlobUpload) -> Result<()> {
        let response = self
            .request(Method::POST, &Self::job_path(job_id, "blobs"))
            .json(blob)
            .send()
            .await?;

        if !response.status().is_success() {
            let (status, body) = unexpected(response).await;
            return Err(SdkError::BlobPersistFailed { status, body });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn ping_cluster(&self, services: &[String]) -> Result<()> {
        let response = self
            .request(Method::POST, "/ping-cluster")
            .json(&PingRequest {
                services: services.to_vec(),
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let (status, body) = unexpected(response).await;
            return Err(SdkError::PingFailed { status, body });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ResultType;
    use crate::types::FunctionDescriptor;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> HttpControlPlane {
        let config = ClientConfig::new("sk_test_secret")
            .with_endpoint(server.uri())
            .with_machine_id("machine-under-test");
        HttpControlPlane::new(&config).unwrap()
    }

    fn registration_body() -> serde_json::Value {
        json!({
            "queueUrl": "https://queue.example.com/jobs",
            "region": "us-east-1",
            "enabled": true,
            "expiration": "2099-01-01T00:00:00Z",
            "credentials": {
                "accessKeyId": "AKIA",
                "secretAccessKey": "secret",
                "sessionToken": "token"
            },
            "clusterId": "cluster-42"
        })
    }

    // ========================================================================
    // Machine registration
    // ========================================================================

    #[tokio::test]
    async fn test_register_machine_sends_identity_headers() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/machines"))
            .and(header("Authorization", "Bearer sk_test_secret"))
            .and(header("X-Machine-ID", "machine-under-test"))
            .and(header("X-Machine-SDK-Version", SDK_VERSION))
            .and(header("X-Machine-SDK-Language", "rust"))
            .and(body_json(json!({
                "service": "billing",
                "functions": [{
                    "name": "charge",
                    "description": "Charge a card",
                    "schema": "{\"type\":\"object\"}",
                    "config": {}
                }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(registration_body()))
            .expect(1)
            .mount(&server)
            .await;

        let request = RegisterMachineRequest {
            service: "billing".to_string(),
            functions: vec![FunctionDescriptor {
                name: "charge".to_string(),
                description: Some("Charge a card".to_string()),
                schema: "{\"type\":\"object\"}".to_string(),
                config: Default::default(),
            }],
        };

        let registration = client_for(&server)
            .register_machine(&request)
            .await
            .unwrap();
        assert_eq!(registration.cluster_id, "cluster-42");
        assert!(registration.enabled);
        assert_eq!(registration.credentials.session_token, "token");
    }

    #[tokio::test]
    async fn test_register_machine_failure_carries_status_and_body() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/machines"))
            .respond_with(ResponseTemplate::new(403).set_body_string("invalid api secret"))
            .mount(&server)
            .await;

        let request = RegisterMachineRequest {
            service: "billing".to_string(),
            functions: vec![],
        };
        let err = client_for(&server)
            .register_machine(&request)
            .await
            .unwrap_err();

        match err {
            SdkError::RegistrationFailed { status, body } => {
                assert_eq!(status, 403);
                assert_eq!(body, "invalid api secret");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_register_machine_invalid_body() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/machines"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"queueUrl": 1})))
            .mount(&server)
            .await;

        let request = RegisterMachineRequest {
            service: "billing".to_string(),
            functions: vec![],
        };
        let err = client_for(&server)
            .register_machine(&request)
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::UnexpectedResponse(_)));
    }

    // ========================================================================
    // Job operations
    // ========================================================================

    #[tokio::test]
    async fn test_acknowledge_job() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/jobs/job-1/acknowledge"))
            .and(header("X-Machine-ID", "machine-under-test"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server).acknowledge_job("job-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_acknowledge_job_rejects_non_204() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/jobs/job-1/acknowledge"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .acknowledge_job("job-1")
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::AcknowledgeFailed { status: 200, .. }));
    }

    #[tokio::test]
    async fn test_job_id_is_escaped() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/jobs/a%2Fb%20c/acknowledge"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server).acknowledge_job("a/b c").await.unwrap();
    }

    #[tokio::test]
    async fn test_create_result() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/jobs/job-7/result"))
            .and(body_json(json!({
                "result": "{\"value\":{\"echo\":\"hi\"}}",
                "resultType": "resolution",
                "functionExecutionTime": 3
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let result = PersistedResult {
            result: "{\"value\":{\"echo\":\"hi\"}}".to_string(),
            result_type: ResultType::Resolution,
            function_execution_time: 3,
        };
        client_for(&server)
            .create_result("job-7", &result)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_result_failure() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/jobs/job-7/result"))
            .respond_with(ResponseTemplate::new(500).set_body_string("db down"))
            .mount(&server)
            .await;

        let result = PersistedResult {
            result: "{\"value\":null}".to_string(),
            result_type: ResultType::Rejection,
            function_execution_time: 0,
        };
        let err = client_for(&server)
            .create_result("job-7", &result)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SdkError::ResultPersistFailed { status: 500, ref body } if body == "db down"
        ));
    }

    #[tokio::test]
    async fn test_create_blob() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/jobs/job-9/blobs"))
            .and(body_json(json!({
                "name": "out.bin",
                "type": "application/octet-stream",
                "encoding": "base64",
                "size": 3,
                "data": "AQID"
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let blob = BlobUpload {
            name: "out.bin".to_string(),
            mime_type: "application/octet-stream".to_string(),
            encoding: "base64",
            size: 3,
            data: "AQID".to_string(),
        };
        client_for(&server).create_blob("job-9", &blob).await.unwrap();
    }

    // ========================================================================
    // Heartbeat and transport
    // ========================================================================

    #[tokio::test]
    async fn test_ping_cluster() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/ping-cluster"))
            .and(body_json(json!({"services": ["billing", "email"]})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server)
            .ping_cluster(&["billing".to_string(), "email".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ping_cluster_failure() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/ping-cluster"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .ping_cluster(&["billing".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::PingFailed { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_unreachable_control_plane_is_transport_error() {
        let config = ClientConfig::new("sk_test")
            .with_endpoint("http://127.0.0.1:1")
            .with_request_timeout_ms(2_000);
        let client = HttpControlPlane::new(&config).unwrap();

        let err = client.acknowledge_job("job").await.unwrap_err();
        assert!(matches!(err, SdkError::Transport(_)));
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let config = ClientConfig::new("sk_test").with_endpoint("https://api.example.com/");
        let client = HttpControlPlane::new(&config).unwrap();
        assert_eq!(client.base_url(), "https://api.example.com");
    }
}
