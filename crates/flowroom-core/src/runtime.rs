// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The process-wide handles every operation runs against.

use std::sync::Arc;

use sqlx::PgPool;

use crate::assets::{AssetCache, OrgAssets, Refresh};
use crate::config::Config;
use crate::engine::Engine;
use crate::error::Result;
use crate::models::channel_log::ChannelLogStore;
use crate::models::ids::OrgID;
use crate::models::msg::{MsgOrigin, MsgOutOptions, MsgType, ReplyTo};
use crate::search::ContactSearch;
use crate::storage::ObjectStore;

/// Shared clients and configuration.
#[derive(Clone)]
pub struct Runtime {
    pub db: PgPool,
    /// Read replica, or the primary pool when there isn't one.
    pub readonly_db: PgPool,
    pub redis: redis::Client,
    pub store: Arc<dyn ObjectStore>,
    pub channel_logs: Arc<dyn ChannelLogStore>,
    pub engine: Arc<dyn Engine>,
    pub search: Arc<dyn ContactSearch>,
    pub config: Arc<Config>,
    pub assets: Arc<AssetCache>,
}

impl Runtime {
    /// The current asset snapshot for an org.
    pub async fn org_assets(&self, org_id: OrgID) -> Result<Arc<OrgAssets>> {
        self.assets.get(&self.db, org_id, Refresh::NONE).await
    }

    /// An asset snapshot with the flagged parts reloaded.
    pub async fn refreshed_org_assets(&self, org_id: OrgID, refresh: Refresh) -> Result<Arc<OrgAssets>> {
        self.assets.get(&self.db, org_id, refresh).await
    }

    /// Options for building outgoing messages with this runtime's limits.
    pub fn msg_options(&self, origin: MsgOrigin, reply_to: Option<ReplyTo>, msg_type: MsgType) -> MsgOutOptions<'_> {
        MsgOutOptions {
            origin,
            reply_to,
            msg_type,
            attachment_domain: &self.config.attachment_domain,
            max_repetitions: self.config.max_repetitions,
        }
    }
}
