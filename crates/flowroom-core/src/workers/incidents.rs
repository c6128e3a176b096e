// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic check that ends webhook incidents once their nodes recover.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info};

use crate::models::incident;
use crate::runtime::Runtime;

/// Webhook health monitor configuration.
#[derive(Debug, Clone)]
pub struct WebhookHealthConfig {
    /// How often open incidents are checked
    pub poll_interval: Duration,
}

impl Default for WebhookHealthConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
        }
    }
}

/// Checks open webhook incidents as a background task.
pub struct WebhookHealthMonitor {
    rt: Runtime,
    config: WebhookHealthConfig,
    shutdown: Arc<Notify>,
}

impl WebhookHealthMonitor {
    pub fn new(rt: Runtime, config: WebhookHealthConfig) -> Self {
        Self {
            rt,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the monitor loop.
    pub async fn run(self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Webhook health monitor started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Webhook health monitor shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match incident::check_webhook_health(&self.rt.db, &self.rt.redis).await {
                        Ok(ended) if !ended.is_empty() => {
                            info!(ended = ended.len(), "Ended recovered webhook incidents");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Failed to check webhook health"),
                    }
                }
            }
        }
    }
}
