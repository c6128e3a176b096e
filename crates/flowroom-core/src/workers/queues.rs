// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Processors for flow starts and broadcasts waiting to be fanned out.
//!
//! Both claim pending rows by moving them to `queued`, so each is picked up by exactly one
//! processor even when several workers run against the same database.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::models::{broadcast, flow_start};
use crate::runner;
use crate::runtime::Runtime;

/// Queue processor configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How often to check for pending work
    pub poll_interval: Duration,
    /// Maximum items claimed per poll
    pub batch_size: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
        }
    }
}

/// Fans out pending flow starts as a background task.
pub struct StartProcessor {
    rt: Runtime,
    config: QueueConfig,
    shutdown: Arc<Notify>,
}

impl StartProcessor {
    pub fn new(rt: Runtime, config: QueueConfig) -> Self {
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

    /// Run the processor loop.
    pub async fn run(self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Start processor started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Start processor shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.process_pending().await {
                        error!(error = %e, "Failed to claim pending flow starts");
                    }
                }
            }
        }
    }

    /// Claims pending starts and processes each. Returns how many were claimed.
    pub async fn process_pending(&self) -> Result<usize> {
        let ids = flow_start::claim_pending_starts(&self.rt.db, self.config.batch_size).await?;
        if ids.is_empty() {
            debug!("No pending flow starts");
            return Ok(0);
        }

        for id in &ids {
            if let Err(e) = runner::process_flow_start(&self.rt, *id).await {
                error!(start_id = %id, error = %e, "Failed to process flow start");
            }
        }
        Ok(ids.len())
    }
}

/// Sends pending broadcasts as a background task.
pub struct BroadcastProcessor {
    rt: Runtime,
    config: QueueConfig,
    shutdown: Arc<Notify>,
}

impl BroadcastProcessor {
    pub fn new(rt: Runtime, config: QueueConfig) -> Self {
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

    /// Run the processor loop.
    pub async fn run(self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Broadcast processor started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Broadcast processor shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.process_pending().await {
                        error!(error = %e, "Failed to claim pending broadcasts");
                    }
                }
            }
        }
    }

    /// Claims pending broadcasts and sends each. Returns how many were claimed.
    pub async fn process_pending(&self) -> Result<usize> {
        let ids = broadcast::claim_pending_broadcasts(&self.rt.db, self.config.batch_size).await?;
        if ids.is_empty() {
            debug!("No pending broadcasts");
            return Ok(0);
        }

        for id in &ids {
            if let Err(e) = runner::process_broadcast(&self.rt, *id).await {
                error!(broadcast_id = %id, error = %e, "Failed to process broadcast");
            }
        }
        Ok(ids.len())
    }
}
