// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client facade.
//!
//! [`Switchyard`] owns the function registry, the control-plane client and the
//! background heartbeat. Functions are registered through [`Service`] handles;
//! starting a service spawns its [`PollingAgent`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::join_all;
use switchyard_queue::QueueConnector;
use tracing::{debug, info, warn};

use crate::agent::{AgentState, PollingAgent};
use crate::config::{AgentConfig, ClientConfig};
use crate::control_plane::{ControlPlane, HttpControlPlane};
use crate::error::{Result, SdkError};
use crate::heartbeat::Heartbeat;
use crate::registry::{FunctionDefinition, FunctionRegistration, FunctionRegistry, validate_name};

struct ClientInner {
    config: ClientConfig,
    agent_config: AgentConfig,
    registry: Arc<FunctionRegistry>,
    control_plane: Arc<dyn ControlPlane>,
    connector: Arc<dyn QueueConnector>,
    agents: Mutex<HashMap<String, PollingAgent>>,
    heartbeat: Mutex<Option<Heartbeat>>,
}

impl ClientInner {
    fn agents(&self) -> MutexGuard<'_, HashMap<String, PollingAgent>> {
        self.agents.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_heartbeat(&self) -> Option<Heartbeat> {
        self.heartbeat.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Builder for [`Switchyard`].
pub struct SwitchyardBuilder {
    config: ClientConfig,
    agent_config: Option<AgentConfig>,
    control_plane: Option<Arc<dyn ControlPlane>>,
    connector: Option<Arc<dyn QueueConnector>>,
}

impl SwitchyardBuilder {
    /// Use a custom control plane instead of the HTTP client.
    pub fn control_plane(mut self, control_plane: Arc<dyn ControlPlane>) -> Self {
        self.control_plane = Some(control_plane);
        self
    }

    /// Queue connector used by every agent.
    pub fn connector(mut self, connector: Arc<dyn QueueConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Override the agent tunables derived from the client configuration.
    pub fn agent_config(mut self, agent_config: AgentConfig) -> Self {
        self.agent_config = Some(agent_config);
        self
    }

    /// Validate the configuration and start the heartbeat.
    ///
    /// Must be called inside a Tokio runtime when the heartbeat is enabled.
    pub fn build(self) -> Result<Switchyard> {
        self.config.validate()?;

        let connector = self
            .connector
            .ok_or_else(|| SdkError::Config("a queue connector is required".to_string()))?;
        let control_plane: Arc<dyn ControlPlane> = match self.control_plane {
            Some(control_plane) => control_plane,
            None => Arc::new(HttpControlPlane::new(&self.config)?),
        };
        let agent_config = self
            .agent_config
            .unwrap_or_else(|| AgentConfig::from_client_config(&self.config));
        let registry = Arc::new(FunctionRegistry::new());

        let heartbeat = if self.config.heartbeat_interval_ms > 0 {
            if tokio::runtime::Handle::try_current().is_err() {
                return Err(SdkError::Config(
                    "the heartbeat needs a Tokio runtime; build the client inside one or set the interval to 0"
                        .to_string(),
                ));
            }
            Some(Heartbeat::spawn(
                Arc::clone(&control_plane),
                Arc::clone(&registry),
                Duration::from_millis(self.config.heartbeat_interval_ms),
            ))
        } else {
            debug!("Background heartbeat disabled");
            None
        };

        info!(
            endpoint = %self.config.endpoint,
            machine_id = %self.config.machine_id,
            "Switchyard client created"
        );

        Ok(Switchyard {
            inner: Arc::new(ClientInner {
                config: self.config,
                agent_config,
                registry,
                control_plane,
                connector,
                agents: Mutex::new(HashMap::new()),
                heartbeat: Mutex::new(heartbeat),
            }),
        })
    }
}

/// Entry point of the SDK.
///
/// # Example
///
/// ```ignore
/// use switchyard_sdk::{FunctionDefinition, Switchyard};
///
/// let client = Switchyard::from_env(connector)?;
/// let service = client.service("greeter")?;
/// service.register(FunctionDefinition::new("echo", schema, |input| async move {
///     Ok(json!({"echo": input["text"]}))
/// }))?;
/// service.start().await?;
/// ```
#[derive(Clone)]
pub struct Switchyard {
    inner: Arc<ClientInner>,
}

impl Switchyard {
    /// Start building a client.
    pub fn builder(config: ClientConfig) -> SwitchyardBuilder {
        SwitchyardBuilder {
            config,
            agent_config: None,
            control_plane: None,
            connector: None,
        }
    }

    /// Client talking to the HTTP control plane.
    pub fn new(config: ClientConfig, connector: Arc<dyn QueueConnector>) -> Result<Self> {
        Self::builder(config).connector(connector).build()
    }

    /// Client configured from `SWITCHYARD_*` environment variables.
    pub fn from_env(connector: Arc<dyn QueueConnector>) -> Result<Self> {
        Self::new(ClientConfig::from_env()?, connector)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.inner.registry
    }

    /// Handle to a service. Validates the name; nothing is registered yet.
    pub fn service(&self, name: &str) -> Result<Service> {
        validate_name("service", name)?;
        Ok(Service {
            name: name.to_string(),
            client: Arc::clone(&self.inner),
        })
    }

    /// Services with a running agent, reported by the heartbeat.
    pub fn active_services(&self) -> Vec<String> {
        self.inner.registry.started_services()
    }

    /// Agent of a started service.
    pub fn agent(&self, service: &str) -> Option<PollingAgent> {
        self.inner.agents().get(service).cloned()
    }

    /// Stop the heartbeat and every agent, then wait up to the agents' stop
    /// timeout for jobs already dispatched to persist their results.
    ///
    /// Every agent is stopped even if some fail; the first error is returned.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(mut heartbeat) = self.inner.take_heartbeat() {
            heartbeat.shutdown().await;
        }

        let agents: Vec<PollingAgent> = self.inner.agents().values().cloned().collect();
        let mut first_error = None;
        for agent in &agents {
            match agent.stop().await {
                Ok(()) | Err(SdkError::NotRunning(_)) => {}
                Err(e) => {
                    warn!(service = %agent.service(), error = %e, "Failed to stop agent");
                    first_error.get_or_insert(e);
                }
            }
        }

        let drain_timeout = self.inner.agent_config.stop_timeout;
        let drained = join_all(agents.iter().map(|agent| agent.drain(drain_timeout))).await;
        for (agent, drained) in agents.iter().zip(drained) {
            if !drained {
                warn!(
                    service = %agent.service(),
                    timeout_ms = drain_timeout.as_millis() as u64,
                    "In-flight jobs still running after shutdown"
                );
            }
        }

        info!("Switchyard client shut down");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether the background heartbeat is running.
    pub fn heartbeat_running(&self) -> bool {
        self.inner
            .heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|heartbeat| !heartbeat.is_cancelled())
    }
}

impl std::fmt::Debug for Switchyard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Switchyard")
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .finish()
    }
}

/// A named group of functions served by one agent.
#[derive(Clone)]
pub struct Service {
    name: String,
    client: Arc<ClientInner>,
}

impl Service {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a function. Fails once the service has started.
    pub fn register(&self, definition: FunctionDefinition) -> Result<Arc<FunctionRegistration>> {
        self.client.registry.register(&self.name, definition)
    }

    /// Registered functions in registration order.
    pub fn functions(&self) -> Vec<Arc<FunctionRegistration>> {
        self.client.registry.list_by_service(&self.name)
    }

    /// Start the service's agent. Returns the cluster id.
    ///
    /// The service's functions are frozen from here on. A service runs at
    /// most one agent at a time.
    pub async fn start(&self) -> Result<String> {
        let client = &self.client;
        client.registry.claim_service(&self.name)?;

        let agent = PollingAgent::new(
            self.name.clone(),
            Arc::clone(&client.registry),
            Arc::clone(&client.control_plane),
            Arc::clone(&client.connector),
            client.agent_config.clone(),
        );
        agent.on_exit(release_on_exit(Arc::downgrade(client), self.name.clone()));
        client.agents().insert(self.name.clone(), agent.clone());

        match agent.start().await {
            Ok(cluster_id) => Ok(cluster_id),
            Err(e) => {
                client.agents().remove(&self.name);
                client.registry.release_service(&self.name);
                Err(e)
            }
        }
    }

    /// Stop the service's agent.
    pub async fn stop(&self) -> Result<()> {
        let agent = self
            .client
            .agents()
            .get(&self.name)
            .cloned()
            .ok_or_else(|| SdkError::NotRunning(self.name.clone()))?;
        agent.stop().await
    }

    /// State of the service's agent, `Idle` if none is running.
    pub fn state(&self) -> AgentState {
        self.client
            .agents()
            .get(&self.name)
            .map(PollingAgent::state)
            .unwrap_or(AgentState::Idle)
    }

    pub fn agent(&self) -> Option<PollingAgent> {
        self.client.agents().get(&self.name).cloned()
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Exit callback: forget the agent and unfreeze the service.
fn release_on_exit(client: Weak<ClientInner>, service: String) -> impl FnOnce() + Send + 'static {
    move || {
        if let Some(client) = client.upgrade() {
            client.agents().remove(&service);
            client.registry.release_service(&service);
            debug!(service = %service, "Service released");
        }
    }
}
