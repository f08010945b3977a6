// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Switchyard SDK.
//!
//! Register functions grouped into services, then let a polling agent pull
//! jobs for them from a queue, execute them locally and report the results to
//! the control plane.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use serde_json::{json, Value};
//! use switchyard_sdk::queue::{MemoryConnector, MemoryQueue};
//! use switchyard_sdk::{FunctionDefinition, FunctionError, Switchyard};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connector = Arc::new(MemoryConnector::new(Arc::new(MemoryQueue::new())));
//!     let client = Switchyard::from_env(connector)?;
//!
//!     let service = client.service("greeter")?;
//!     service.register(FunctionDefinition::new(
//!         "echo",
//!         json!({"type": "object", "properties": {"text": {"type": "string"}}}),
//!         |input: Value| async move { Ok::<_, FunctionError>(json!({"echo": input["text"]})) },
//!     ))?;
//!
//!     let cluster_id = service.start().await?;
//!     println!("serving greeter in cluster {}", cluster_id);
//!
//!     tokio::signal::ctrl_c().await?;
//!     client.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`registry`]: function registrations, schemas and naming rules
//! - [`codec`] and [`blob`]: payload envelopes and blob extraction
//! - [`execution`]: the execution wrapper producing result envelopes
//! - [`agent`]: the polling agent and its job processor
//! - [`control_plane`]: the control-plane contract and its HTTP client
//! - [`client`]: the [`Switchyard`] facade and [`Service`] handles

pub mod agent;
pub mod blob;
pub mod client;
pub mod codec;
pub mod config;
pub mod control_plane;
mod error;
pub mod execution;
mod heartbeat;
pub mod registry;
pub mod types;

pub use switchyard_queue as queue;

pub use agent::{AgentState, JobProcessor, PollingAgent};
pub use blob::{Blob, BlobData, BlobUpload, Extracted, PathSegment, extract_blobs, reinsert_blobs};
pub use client::{Service, Switchyard, SwitchyardBuilder};
pub use codec::{pack, unpack};
pub use config::{AgentConfig, ClientConfig, RetryConfig, RetryStrategy};
pub use control_plane::{ControlPlane, HttpControlPlane, SDK_LANGUAGE, SDK_VERSION};
pub use error::{Result, SdkError};
pub use execution::{
    Authenticator, FunctionError, FunctionHandler, ResultEnvelope, ResultType, execute,
};
pub use heartbeat::Heartbeat;
pub use registry::{
    CacheConfig, FunctionConfig, FunctionDefinition, FunctionRegistration, FunctionRegistry,
    InputSchema,
};
pub use types::{
    AgentCredentials, FunctionDescriptor, Job, MachineRegistration, PersistedResult,
    RegisterMachineRequest, RemoteCredentials,
};
