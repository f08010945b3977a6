// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for switchyard-sdk integration tests.
//!
//! Provides an in-process control plane that records every call and can be
//! scripted to hand out expired credentials or fail requests, plus helpers to
//! enqueue jobs on a [`MemoryQueue`].

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use switchyard_sdk::queue::{MemoryConnector, MemoryQueue};
use switchyard_sdk::{
    AgentConfig, BlobUpload, ControlPlane, Job, MachineRegistration, PersistedResult,
    RegisterMachineRequest, RemoteCredentials, Result, RetryConfig, RetryStrategy, SdkError,
    pack, unpack,
};

pub const WAIT: Duration = Duration::from_secs(10);

enum Scripted {
    Expiring(DateTime<Utc>),
    Fail { status: u16, body: String },
}

/// Control plane fake that records calls.
pub struct FakeControlPlane {
    script: Mutex<VecDeque<Scripted>>,
    enabled: AtomicBool,
    ack_failures: AtomicBool,
    result_failures: AtomicUsize,
    blob_failures: AtomicBool,
    ping_failures: AtomicBool,
    pub registrations: Mutex<Vec<RegisterMachineRequest>>,
    pub acks: Mutex<Vec<String>>,
    pub result_attempts: AtomicUsize,
    pub results: Mutex<Vec<(String, PersistedResult)>>,
    pub blobs: Mutex<Vec<(String, BlobUpload)>>,
    pub pings: Mutex<Vec<Vec<String>>>,
}

impl Default for FakeControlPlane {
    fn default() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            enabled: AtomicBool::new(true),
            ack_failures: AtomicBool::new(false),
            result_failures: AtomicUsize::new(0),
            blob_failures: AtomicBool::new(false),
            ping_failures: AtomicBool::new(false),
            registrations: Mutex::new(Vec::new()),
            acks: Mutex::new(Vec::new()),
            result_attempts: AtomicUsize::new(0),
            results: Mutex::new(Vec::new()),
            blobs: Mutex::new(Vec::new()),
            pings: Mutex::new(Vec::new()),
        }
    }
}

impl FakeControlPlane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next registration returns credentials expiring at `expiration`.
    pub fn next_registration_expires_at(&self, expiration: DateTime<Utc>) {
        self.script
            .lock()
            .unwrap()
            .push_back(Scripted::Expiring(expiration));
    }

    /// The next registration fails with `status`.
    pub fn fail_next_registration(&self, status: u16, body: &str) {
        self.script.lock().unwrap().push_back(Scripted::Fail {
            status,
            body: body.to_string(),
        });
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_acks(&self) {
        self.ack_failures.store(true, Ordering::SeqCst);
    }

    /// Fail the next `count` result writes.
    pub fn fail_next_results(&self, count: usize) {
        self.result_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_blobs(&self) {
        self.blob_failures.store(true, Ordering::SeqCst);
    }

    pub fn fail_pings(&self) {
        self.ping_failures.store(true, Ordering::SeqCst);
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.lock().unwrap().len()
    }

    pub fn result_count(&self) -> usize {
        self.results.lock().unwrap().len()
    }

    pub fn ping_count(&self) -> usize {
        self.pings.lock().unwrap().len()
    }

    /// Persisted result for a job, with its content unpacked.
    pub fn result_for(&self, job_id: &str) -> Option<(String, Value)> {
        self.results
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| id == job_id)
            .map(|(_, result)| {
                let body = serde_json::to_value(result).unwrap();
                (
                    body["resultType"].as_str().unwrap().to_string(),
                    unpack(&result.result).unwrap(),
                )
            })
    }

    /// Wait until `count` results have been persisted.
    pub async fn wait_for_results(&self, count: usize) {
        wait_until(|| self.result_count() >= count).await;
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn register_machine(
        &self,
        request: &RegisterMachineRequest,
    ) -> Result<MachineRegistration> {
        self.registrations.lock().unwrap().push(request.clone());

        let expiration = match self.script.lock().unwrap().pop_front() {
            Some(Scripted::Fail { status, body }) => {
                return Err(SdkError::RegistrationFailed { status, body });
            }
            Some(Scripted::Expiring(expiration)) => expiration,
            None => Utc::now() + chrono::Duration::hours(1),
        };

        let n = self.registration_count();
        Ok(MachineRegistration {
            queue_url: format!("memory://{}", request.service),
            region: "local".to_string(),
            enabled: self.enabled.load(Ordering::SeqCst),
            expiration,
            credentials: RemoteCredentials {
                access_key_id: format!("AKIA{}", n),
                secret_access_key: "secret".to_string(),
                session_token: format!("session-{}", n),
            },
            cluster_id: "cluster-test".to_string(),
        })
    }

    async fn acknowledge_job(&self, job_id: &str) -> Result<()> {
        self.acks.lock().unwrap().push(job_id.to_string());
        if self.ack_failures.load(Ordering::SeqCst) {
            return Err(SdkError::AcknowledgeFailed {
                status: 500,
                body: "ack store unavailable".to_string(),
            });
        }
        Ok(())
    }

    async fn create_result(&self, job_id: &str, result: &PersistedResult) -> Result<()> {
        self.result_attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .result_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SdkError::ResultPersistFailed {
                status: 503,
                body: "try again".to_string(),
            });
        }
        self.results
            .lock()
            .unwrap()
            .push((job_id.to_string(), result.clone()));
        Ok(())
    }

    async fn create_blob(&self, job_id: &str, blob: &BlobUpload) -> Result<()> {
        if self.blob_failures.load(Ordering::SeqCst) {
            return Err(SdkError::BlobPersistFailed {
                status: 413,
                body: "too large".to_string(),
            });
        }
        self.blobs
            .lock()
            .unwrap()
            .push((job_id.to_string(), blob.clone()));
        Ok(())
    }

    async fn ping_cluster(&self, services: &[String]) -> Result<()> {
        self.pings.lock().unwrap().push(services.to_vec());
        if self.ping_failures.load(Ordering::SeqCst) {
            return Err(SdkError::PingFailed {
                status: 502,
                body: "bad gateway".to_string(),
            });
        }
        Ok(())
    }
}

/// Shared in-memory queue and a connector routing every endpoint to it.
pub fn memory_queue() -> (Arc<MemoryQueue>, Arc<MemoryConnector>) {
    let queue = Arc::new(MemoryQueue::new());
    let connector = Arc::new(MemoryConnector::new(queue.clone()));
    (queue, connector)
}

/// Agent tunables that keep tests fast.
pub fn fast_agent_config() -> AgentConfig {
    AgentConfig {
        poll_wait: Duration::from_millis(50),
        error_backoff: Duration::from_millis(10),
        start_timeout: Duration::from_secs(5),
        stop_timeout: Duration::from_secs(5),
        result_retry: RetryConfig::new(2, 10, RetryStrategy::ExponentialBackoff),
        ..AgentConfig::default()
    }
}

/// Enqueue a job and return its id.
pub fn submit(queue: &MemoryQueue, job_id: &str, function: &str, args: Value) -> String {
    submit_with_auth(queue, job_id, function, args, None)
}

pub fn submit_with_auth(
    queue: &MemoryQueue,
    job_id: &str,
    function: &str,
    args: Value,
    auth_context: Option<Value>,
) -> String {
    let job = Job {
        id: job_id.to_string(),
        target_fn: function.to_string(),
        target_args: pack(&args),
        auth_context,
    };
    queue.send(job.encode().unwrap());
    job_id.to_string()
}

pub async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
