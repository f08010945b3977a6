// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Polling agent.
//!
//! One agent serves one service. Starting it registers the machine with the
//! control plane, which hands back a queue endpoint and short-lived
//! credentials. The agent then runs a [`Consumer`] against that queue and
//! processes every received job through the registry and the execution
//! wrapper, persisting one result per job.
//!
//! A supervisor task listens to the consumer's lifecycle signals. Whenever the
//! credentials are expired or about to expire it tears the consumer down and
//! runs a fresh registration. Only one restart is ever in flight per agent.
//!
//! ```text
//! Idle -> Registering -> Polling -> Restarting -> Registering -> Polling
//!                     \-> Disabled                  Polling -> Stopping -> Stopped
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use switchyard_queue::{
    Consumer, ConsumerEvent, HandlerError, MessageHandler, QueueConnector, QueueError,
    QueueMessage,
};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::blob::{Blob, BlobUpload, Extracted, extract_blobs};
use crate::codec::{self, json_type_name};
use crate::config::{AgentConfig, RetryConfig};
use crate::control_plane::ControlPlane;
use crate::error::{Result, SdkError};
use crate::execution::{FunctionError, ResultEnvelope, execute};
use crate::registry::{FunctionRegistration, FunctionRegistry};
use crate::types::{
    AgentCredentials, FunctionDescriptor, Job, PersistedResult, RegisterMachineRequest,
};

/// Lifecycle state of a polling agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Constructed, not started.
    Idle,
    /// Registering the machine with the control plane.
    Registering,
    /// Consuming jobs.
    Polling,
    /// Registered, but the control plane disabled this machine.
    Disabled,
    /// Replacing the consumer after credential expiry.
    Restarting,
    /// Stop requested.
    Stopping,
    /// Stopped, either on request or after a failed restart.
    Stopped,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Registering => "registering",
            AgentState::Polling => "polling",
            AgentState::Disabled => "disabled",
            AgentState::Restarting => "restarting",
            AgentState::Stopping => "stopping",
            AgentState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

type ExitCallback = Box<dyn FnOnce() + Send>;

/// Consumer and supervisor of the current registration.
#[derive(Default)]
struct Runtime {
    consumer: Option<Arc<Consumer>>,
    supervisor: Option<CancellationToken>,
    /// Consumer detached by the last `stop()`, kept for draining.
    stopped: Option<Arc<Consumer>>,
}

impl Runtime {
    /// Cancel the supervisor and ask the consumer to stop.
    fn detach(&mut self) -> Option<Arc<Consumer>> {
        if let Some(token) = self.supervisor.take() {
            token.cancel();
        }
        let consumer = self.consumer.take();
        if let Some(consumer) = &consumer {
            consumer.stop();
        }
        consumer
    }
}

struct AgentInner {
    service: String,
    registry: Arc<FunctionRegistry>,
    control_plane: Arc<dyn ControlPlane>,
    connector: Arc<dyn QueueConnector>,
    config: AgentConfig,
    state: watch::Sender<AgentState>,
    runtime: tokio::sync::Mutex<Runtime>,
    credentials: RwLock<Option<Arc<AgentCredentials>>>,
    restarting: AtomicBool,
    restarts: AtomicU32,
    on_exit: Mutex<Option<ExitCallback>>,
}

/// Long-lived worker that serves one service.
#[derive(Clone)]
pub struct PollingAgent {
    inner: Arc<AgentInner>,
}

impl PollingAgent {
    pub fn new(
        service: impl Into<String>,
        registry: Arc<FunctionRegistry>,
        control_plane: Arc<dyn ControlPlane>,
        connector: Arc<dyn QueueConnector>,
        config: AgentConfig,
    ) -> Self {
        let (state, _) = watch::channel(AgentState::Idle);
        Self {
            inner: Arc::new(AgentInner {
                service: service.into(),
                registry,
                control_plane,
                connector,
                config,
                state,
                runtime: tokio::sync::Mutex::new(Runtime::default()),
                credentials: RwLock::new(None),
                restarting: AtomicBool::new(false),
                restarts: AtomicU32::new(0),
                on_exit: Mutex::new(None),
            }),
        }
    }

    /// Run `callback` once when the agent stops, on request or after a
    /// failed restart.
    pub fn on_exit(&self, callback: impl FnOnce() + Send + 'static) {
        *self
            .inner
            .on_exit
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Box::new(callback));
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn state(&self) -> AgentState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<AgentState> {
        self.inner.state.subscribe()
    }

    /// Credentials of the current registration.
    pub fn credentials(&self) -> Option<Arc<AgentCredentials>> {
        self.inner.current_credentials()
    }

    /// Cluster id of the current registration.
    pub fn cluster_id(&self) -> Option<String> {
        self.credentials().map(|c| c.cluster_id.clone())
    }

    /// Number of expiry-triggered restarts so far.
    pub fn restarts(&self) -> u32 {
        self.inner.restarts.load(Ordering::SeqCst)
    }

    /// Wait until the agent reaches `target`. Returns false on timeout.
    pub async fn wait_for_state(&self, target: AgentState, timeout: Duration) -> bool {
        let mut rx = self.inner.state.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|state| *state == target)).await,
            Ok(Ok(_))
        )
    }

    /// Register the machine and start consuming. Returns the cluster id.
    ///
    /// Registration failures propagate; nothing is retried. A machine the
    /// control plane reports as disabled ends up in [`AgentState::Disabled`]
    /// without consuming.
    pub async fn start(&self) -> Result<String> {
        let mut runtime = self.inner.runtime.lock().await;
        if self.state() != AgentState::Idle {
            return Err(SdkError::ServiceAlreadyStarted(self.inner.service.clone()));
        }

        match self.inner.start_locked(&mut runtime).await {
            Ok(cluster_id) => Ok(cluster_id),
            Err(e) => {
                self.inner.set_state(AgentState::Idle);
                Err(e)
            }
        }
    }

    /// Stop consuming.
    ///
    /// The receive in flight is aborted. Jobs already dispatched run to
    /// completion and still persist their results.
    pub async fn stop(&self) -> Result<()> {
        let mut runtime = self.inner.runtime.lock().await;
        let Some(consumer) = runtime.consumer.clone() else {
            return Err(SdkError::NotRunning(self.inner.service.clone()));
        };

        self.inner.set_state(AgentState::Stopping);
        runtime.detach();
        runtime.stopped = Some(Arc::clone(&consumer));
        let stopped = consumer
            .wait_until_stopped(self.inner.config.stop_timeout)
            .await;

        self.inner.set_state(AgentState::Stopped);
        drop(runtime);
        self.inner.run_exit_callback();
        info!(service = %self.inner.service, "Polling agent stopped");

        match stopped {
            Ok(()) => Ok(()),
            Err(QueueError::Timeout { waited_ms, .. }) => Err(SdkError::StopTimeout(waited_ms)),
            Err(e) => Err(e.into()),
        }
    }
}

impl PollingAgent {
    /// Wait for jobs dispatched before the last `stop()` to persist their
    /// results. Returns false on timeout; true when nothing was stopped.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let stopped = self.inner.runtime.lock().await.stopped.clone();
        match stopped {
            Some(consumer) => consumer.drain(timeout).await,
            None => true,
        }
    }
}

impl std::fmt::Debug for PollingAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingAgent")
            .field("service", &self.inner.service)
            .field("state", &self.state())
            .field("restarts", &self.restarts())
            .finish()
    }
}

impl AgentInner {
    fn set_state(&self, state: AgentState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(
                service = %self.service,
                from = %previous,
                to = %state,
                "Agent state changed"
            );
        }
    }

    fn current_credentials(&self) -> Option<Arc<AgentCredentials>> {
        self.credentials
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn credentials_expiring(&self) -> bool {
        self.current_credentials()
            .is_some_and(|c| c.expires_within(self.config.expiry_margin))
    }

    fn run_exit_callback(&self) {
        let callback = self
            .on_exit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Register, connect and start a consumer. Caller holds the runtime lock.
    async fn start_locked(self: &Arc<Self>, runtime: &mut Runtime) -> Result<String> {
        self.set_state(AgentState::Registering);

        let functions: Vec<FunctionDescriptor> = self
            .registry
            .list_by_service(&self.service)
            .iter()
            .map(|registration| FunctionDescriptor::from(registration.as_ref()))
            .collect();
        let request = RegisterMachineRequest {
            service: self.service.clone(),
            functions,
        };

        let registration = self.control_plane.register_machine(&request).await?;
        let credentials = Arc::new(AgentCredentials::from(registration));
        *self.credentials.write().unwrap_or_else(|e| e.into_inner()) =
            Some(Arc::clone(&credentials));

        let transport = self.connector.connect(&credentials.endpoint()).await?;
        let processor = Arc::new(JobProcessor::new(
            self.service.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.control_plane),
            self.config.result_retry.clone(),
        ));
        let consumer = Arc::new(Consumer::new(
            transport,
            processor,
            self.config.consumer_config(),
        ));

        let supervisor = CancellationToken::new();
        tokio::spawn(supervise(
            Arc::downgrade(self),
            consumer.subscribe(),
            supervisor.clone(),
        ));
        runtime.consumer = Some(Arc::clone(&consumer));
        runtime.supervisor = Some(supervisor);

        if !credentials.enabled {
            warn!(
                service = %self.service,
                cluster_id = %credentials.cluster_id,
                "Machine is disabled by the control plane, not consuming"
            );
            self.set_state(AgentState::Disabled);
            return Ok(credentials.cluster_id.clone());
        }

        let ready = match consumer.start() {
            Ok(()) => consumer.wait_until_polling(self.config.start_timeout).await,
            Err(e) => Err(e),
        };
        if let Err(e) = ready {
            runtime.detach();
            return Err(readiness_error(e));
        }

        self.set_state(AgentState::Polling);
        info!(
            service = %self.service,
            cluster_id = %credentials.cluster_id,
            expiration = %credentials.expiration,
            "Polling agent started"
        );
        Ok(credentials.cluster_id.clone())
    }

    /// Start a restart unless one is already running.
    fn trigger_restart(self: &Arc<Self>) {
        if self
            .restarting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let agent = Arc::clone(self);
        tokio::spawn(async move {
            agent.restart().await;
            agent.restarting.store(false, Ordering::SeqCst);
        });
    }

    async fn restart(self: &Arc<Self>) {
        let mut runtime = self.runtime.lock().await;
        if runtime.consumer.is_none()
            || matches!(
                *self.state.borrow(),
                AgentState::Stopping | AgentState::Stopped
            )
        {
            return;
        }

        info!(service = %self.service, "Credentials expiring, restarting consumer");
        self.set_state(AgentState::Restarting);

        if let Some(consumer) = runtime.detach()
            && let Err(e) = consumer.wait_until_stopped(self.config.stop_timeout).await
        {
            warn!(service = %self.service, error = %e, "Previous consumer did not stop cleanly");
        }
        self.restarts.fetch_add(1, Ordering::SeqCst);

        match self.start_locked(&mut runtime).await {
            Ok(cluster_id) => {
                info!(service = %self.service, cluster_id = %cluster_id, "Consumer restarted");
            }
            Err(e) => {
                error!(service = %self.service, error = %e, "Restart failed, agent stopped");
                runtime.detach();
                self.set_state(AgentState::Stopped);
                drop(runtime);
                self.run_exit_callback();
            }
        }
    }
}

/// Map a failed readiness wait onto the agent's error.
fn readiness_error(error: QueueError) -> SdkError {
    match error {
        QueueError::Timeout { waited_ms, .. } => SdkError::StartTimeout(waited_ms),
        other => other.into(),
    }
}

impl Drop for AgentInner {
    fn drop(&mut self) {
        self.runtime.get_mut().detach();
    }
}

/// Watch consumer signals and trigger a restart when credentials run out.
async fn supervise(
    agent: Weak<AgentInner>,
    mut events: broadcast::Receiver<ConsumerEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            event = events.recv() => event,
        };

        match event {
            Ok(ConsumerEvent::Error(_) | ConsumerEvent::EmptyQueue | ConsumerEvent::BatchProcessed) => {
                let Some(agent) = agent.upgrade() else {
                    break;
                };
                if agent.credentials_expiring() {
                    agent.trigger_restart();
                }
            }
            Ok(ConsumerEvent::Stopped) => break,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Supervisor lagged behind consumer signals");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Turns queue messages into persisted job results.
pub struct JobProcessor {
    service: String,
    registry: Arc<FunctionRegistry>,
    control_plane: Arc<dyn ControlPlane>,
    retry: RetryConfig,
}

impl JobProcessor {
    pub fn new(
        service: String,
        registry: Arc<FunctionRegistry>,
        control_plane: Arc<dyn ControlPlane>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            service,
            registry,
            control_plane,
            retry,
        }
    }

    /// Process one message and return the persisted outcome.
    ///
    /// Errors mean the message should stay on the queue for redelivery: no
    /// body, an undecodable job, or a result that could not be persisted.
    pub async fn process(&self, message: &QueueMessage) -> Result<ResultEnvelope> {
        let body = message
            .body
            .as_deref()
            .ok_or_else(|| SdkError::MissingMessageBody(message.message_id.clone()))?;
        let job = Job::decode(body)?;

        debug!(
            job_id = %job.id,
            function = %job.target_fn,
            receive_count = message.receive_count,
            "Processing job"
        );

        let registration = self
            .registry
            .lookup(&job.target_fn)
            .filter(|registration| registration.service_name == self.service);

        if let Err(e) = self.control_plane.acknowledge_job(&job.id).await {
            warn!(job_id = %job.id, error = %e, "Failed to acknowledge job, continuing");
        }

        let envelope = match registration {
            Some(registration) => self.run(&registration, &job).await,
            None => {
                warn!(job_id = %job.id, function = %job.target_fn, "Function not registered");
                ResultEnvelope::rejection(FunctionError::not_registered(&job.target_fn), 0)
            }
        };

        self.persist(&job.id, envelope.clone()).await?;
        debug!(
            job_id = %job.id,
            result_type = ?envelope.result_type,
            execution_ms = envelope.function_execution_time,
            "Job completed"
        );
        Ok(envelope)
    }

    async fn run(&self, registration: &FunctionRegistration, job: &Job) -> ResultEnvelope {
        let args = match codec::unpack(&job.target_args) {
            Ok(args) => args,
            Err(e) => {
                return ResultEnvelope::rejection(
                    FunctionError::malformed_payload(e.to_string()),
                    0,
                );
            }
        };

        if !args.is_object() {
            return ResultEnvelope::rejection(
                FunctionError::invalid_argument_shape(json_type_name(&args)),
                0,
            );
        }

        if let Err(errors) = registration.schema.validate(&args) {
            debug!(job_id = %job.id, errors = errors.len(), "Input failed schema validation");
            return ResultEnvelope::rejection(FunctionError::schema_validation(errors), 0);
        }

        execute(
            registration.handler.as_ref(),
            args,
            registration.authenticate.as_deref(),
            job.auth_context.as_ref(),
        )
        .await
    }

    /// Persist the result and every extracted blob concurrently.
    async fn persist(&self, job_id: &str, envelope: ResultEnvelope) -> Result<()> {
        let Extracted { content, blobs } = extract_blobs(envelope.content);
        let result = PersistedResult::from_envelope(&ResultEnvelope { content, ..envelope });
        let uploads: Vec<BlobUpload> = blobs.iter().map(Blob::to_upload).collect();

        let (persisted, uploaded) = tokio::join!(
            self.persist_result(job_id, &result),
            join_all(
                uploads
                    .iter()
                    .map(|upload| self.control_plane.create_blob(job_id, upload))
            ),
        );

        let mut first_blob_error = None;
        for (upload, outcome) in uploads.iter().zip(uploaded) {
            if let Err(e) = outcome {
                error!(job_id = %job_id, blob = %upload.name, error = %e, "Failed to persist blob");
                first_blob_error.get_or_insert(e);
            }
        }

        persisted?;
        match first_blob_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn persist_result(&self, job_id: &str, result: &PersistedResult) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.control_plane.create_result(job_id, result).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        job_id = %job_id,
                        attempt,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Result persistence failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "Result persistence failed, giving up");
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl MessageHandler for JobProcessor {
    async fn handle(&self, message: &QueueMessage) -> std::result::Result<(), HandlerError> {
        self.process(message)
            .await
            .map(|_| ())
            .map_err(|e| Box::new(e) as HandlerError)
    }
}

impl std::fmt::Debug for JobProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobProcessor")
            .field("service", &self.service)
            .field("retry", &self.retry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(AgentState::Idle.as_str(), "idle");
        assert_eq!(AgentState::Registering.to_string(), "registering");
        assert_eq!(AgentState::Polling.as_str(), "polling");
        assert_eq!(AgentState::Disabled.as_str(), "disabled");
        assert_eq!(AgentState::Restarting.as_str(), "restarting");
        assert_eq!(AgentState::Stopping.as_str(), "stopping");
        assert_eq!(AgentState::Stopped.as_str(), "stopped");
    }

    #[test]
    fn test_readiness_timeout_maps_to_start_timeout() {
        let err = readiness_error(QueueError::Timeout {
            waited_ms: 250,
            target: "polling",
        });
        assert!(matches!(err, SdkError::StartTimeout(250)));

        let err = readiness_error(QueueError::Stopped);
        assert!(matches!(err, SdkError::Queue(QueueError::Stopped)));
    }

    #[test]
    fn test_runtime_detach_is_idempotent() {
        let mut runtime = Runtime::default();
        assert!(runtime.detach().is_none());
        assert!(runtime.detach().is_none());
    }
}
