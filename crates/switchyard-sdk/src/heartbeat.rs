// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background cluster heartbeat.
//!
//! Periodically reports the services this machine is serving. Failures are
//! logged and never affect the agents.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::control_plane::ControlPlane;
use crate::registry::FunctionRegistry;

/// Handle to a running heartbeat task. Dropping it stops the task.
#[derive(Debug)]
pub struct Heartbeat {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// Spawn the heartbeat on the current Tokio runtime.
    pub fn spawn(
        control_plane: Arc<dyn ControlPlane>,
        registry: Arc<FunctionRegistry>,
        interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let cancel_token = cancel.clone();

        let handle = tokio::spawn(async move {
            debug!(
                interval_ms = interval.as_millis() as u64,
                "Background heartbeat task started"
            );

            loop {
                tokio::select! {
                    biased;

                    _ = cancel_token.cancelled() => {
                        debug!("Background heartbeat task cancelled");
                        break;
                    }

                    _ = tokio::time::sleep(interval) => {
                        let services = registry.started_services();
                        if services.is_empty() {
                            continue;
                        }

                        if let Err(e) = control_plane.ping_cluster(&services).await {
                            warn!(error = %e, "Failed to send cluster heartbeat");
                        } else {
                            debug!(services = services.len(), "Cluster heartbeat sent");
                        }
                    }
                }
            }
        });

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the task and wait for it to exit.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
