// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background workers.
//!
//! Each worker polls the database for work it owns and stops when its shutdown handle is
//! notified. [`Workers::start`] spawns them all against one [`Runtime`]:
//! - [`FireScheduler`] dispatches due campaign events, wait expirations and timeouts
//! - [`PointScheduler`] backfills the fires of new and edited campaign points
//! - [`MessageRetrier`] re-queues outgoing messages the courier never received
//! - [`StartProcessor`] and [`BroadcastProcessor`] fan out pending starts and broadcasts
//! - [`WebhookHealthMonitor`] ends webhook incidents that have recovered

mod fires;
mod incidents;
mod points;
mod queues;
mod retries;

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub use self::fires::{FireScheduler, FireSchedulerConfig};
pub use self::incidents::{WebhookHealthConfig, WebhookHealthMonitor};
pub use self::points::{PointScheduler, PointSchedulerConfig};
pub use self::queues::{BroadcastProcessor, QueueConfig, StartProcessor};
pub use self::retries::{MessageRetrier, MessageRetrierConfig};

use crate::runtime::Runtime;

/// The running set of background workers.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct Workers {
    tasks: Vec<(&'static str, Arc<Notify>, JoinHandle<()>)>,
}

impl Workers {
    /// Spawns every worker, with poll intervals taken from the runtime's config.
    pub fn start(rt: &Runtime) -> Self {
        let mut tasks = Vec::with_capacity(6);

        let fires = FireScheduler::new(
            rt.clone(),
            FireSchedulerConfig {
                poll_interval: rt.config.fire_poll_interval,
                ..Default::default()
            },
        );
        let shutdown = fires.shutdown_handle();
        tasks.push(("fire scheduler", shutdown, tokio::spawn(async move { fires.run().await })));

        let points = PointScheduler::new(rt.clone(), PointSchedulerConfig::default());
        let shutdown = points.shutdown_handle();
        tasks.push(("point scheduler", shutdown, tokio::spawn(async move { points.run().await })));

        let retrier = MessageRetrier::new(
            rt.clone(),
            MessageRetrierConfig {
                poll_interval: rt.config.retry_poll_interval,
                ..Default::default()
            },
        );
        let shutdown = retrier.shutdown_handle();
        tasks.push(("message retrier", shutdown, tokio::spawn(async move { retrier.run().await })));

        let starts = StartProcessor::new(rt.clone(), QueueConfig::default());
        let shutdown = starts.shutdown_handle();
        tasks.push(("start processor", shutdown, tokio::spawn(async move { starts.run().await })));

        let broadcasts = BroadcastProcessor::new(rt.clone(), QueueConfig::default());
        let shutdown = broadcasts.shutdown_handle();
        tasks.push((
            "broadcast processor",
            shutdown,
            tokio::spawn(async move { broadcasts.run().await }),
        ));

        let health = WebhookHealthMonitor::new(rt.clone(), WebhookHealthConfig::default());
        let shutdown = health.shutdown_handle();
        tasks.push(("webhook health monitor", shutdown, tokio::spawn(async move { health.run().await })));

        info!(workers = tasks.len(), "Workers started");
        Self { tasks }
    }

    /// Signals every worker to stop and waits for them to finish their current poll.
    pub async fn shutdown(self) {
        info!("Shutting down workers");

        for (_, shutdown, _) in &self.tasks {
            shutdown.notify_one();
        }

        for (name, _, handle) in self.tasks {
            if let Err(e) = handle.await {
                error!("{} task panicked: {}", name, e);
            }
        }

        info!("Workers shutdown complete");
    }
}
