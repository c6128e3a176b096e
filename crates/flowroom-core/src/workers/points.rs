// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Campaign point scheduler.
//!
//! A new or edited campaign point starts out scheduling. This worker backfills its fires for
//! every contact in the campaign's group and flips it to ready, after which the fire
//! scheduler acts on them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};

use crate::assets::Refresh;
use crate::error::Result;
use crate::models::campaign::{self, SchedulingPoint};
use crate::models::contact;
use crate::models::group;
use crate::runtime::Runtime;

/// How many contacts are loaded at a time while backfilling.
const CONTACT_BATCH_SIZE: usize = 1000;

/// Point scheduler configuration.
#[derive(Debug, Clone)]
pub struct PointSchedulerConfig {
    /// How often to look for points being scheduled
    pub poll_interval: Duration,
    /// Maximum points scheduled per poll
    pub batch_size: usize,
}

impl Default for PointSchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            batch_size: 10,
        }
    }
}

/// Campaign point scheduler that runs as a background task.
pub struct PointScheduler {
    rt: Runtime,
    config: PointSchedulerConfig,
    shutdown: Arc<Notify>,
}

impl PointScheduler {
    pub fn new(rt: Runtime, config: PointSchedulerConfig) -> Self {
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

    /// Run the scheduler loop.
    pub async fn run(self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Point scheduler started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Point scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.schedule_pending_points().await {
                        error!(error = %e, "Failed to schedule campaign points");
                    }
                }
            }
        }
    }

    /// Backfills points that are still scheduling, one transaction each. Returns how many
    /// were made ready.
    pub async fn schedule_pending_points(&self) -> Result<usize> {
        let mut scheduled = 0;

        while scheduled < self.config.batch_size {
            let mut tx = self.rt.db.begin().await?;
            let Some(pending) = campaign::claim_scheduling_point(&mut tx).await? else {
                break;
            };

            let fires = backfill_point(&self.rt, &mut tx, pending).await?;
            tx.commit().await?;

            // cached snapshots still have the point as scheduling
            self.rt.refreshed_org_assets(pending.org_id, Refresh::CAMPAIGNS).await?;

            info!(point_id = %pending.point_id, fires, "Scheduled campaign point");
            scheduled += 1;
        }

        if scheduled == 0 {
            debug!("No campaign points to schedule");
        }
        Ok(scheduled)
    }
}

#[instrument(skip(rt, conn), fields(point_id = %pending.point_id, org_id = %pending.org_id))]
async fn backfill_point(rt: &Runtime, conn: &mut sqlx::PgConnection, pending: SchedulingPoint) -> Result<usize> {
    let oa = rt.refreshed_org_assets(pending.org_id, Refresh::CAMPAIGNS).await?;
    let Some((_, point)) = oa.campaign_point(pending.point_id) else {
        // not loaded with the org's campaigns, so it can never fire
        warn!("Campaign point missing from org assets, marking ready without fires");
        campaign::mark_point_ready(conn, pending.point_id).await?;
        return Ok(0);
    };

    let contact_ids = group::contact_ids_in_groups(&rt.db, &[pending.group_id]).await?;

    let mut contacts = Vec::with_capacity(contact_ids.len());
    for chunk in contact_ids.chunks(CONTACT_BATCH_SIZE) {
        contacts.extend(contact::load_contacts(&mut *conn, pending.org_id, chunk).await?);
    }

    campaign::schedule_point(conn, pending.org_id, oa.tz(), point, &contacts).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = PointSchedulerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(15));
        assert_eq!(config.batch_size, 10);
    }
}
