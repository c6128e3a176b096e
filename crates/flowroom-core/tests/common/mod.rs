// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for flowroom-core integration tests.
//!
//! Provides TestContext, which connects to the test database and Redis, applies migrations
//! and seeds a fresh org to work in, so tests can run side by side against one database.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use uuid::Uuid;

use flowroom_core::assets::{AssetCache, OrgAssets, Refresh};
use flowroom_core::config::Config;
use flowroom_core::engine::mock::MockEngine;
use flowroom_core::models::channel_log::MemoryLogStore;
use flowroom_core::models::contact::{self, Contact, ContactStatus};
use flowroom_core::models::ids::{ChannelID, FieldID, FlowID, GroupID, OrgID, PointID, UserID};
use flowroom_core::runtime::Runtime;
use flowroom_core::search::StaticSearch;
use flowroom_core::storage::MemoryStore;

/// Skips a test when there's no test database to run against.
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

/// A seeded channel.
#[derive(Debug, Clone, Copy)]
pub struct ChannelFixture {
    pub id: ChannelID,
    pub uuid: Uuid,
}

/// Test context with a runtime and a freshly seeded org.
pub struct TestContext {
    pub rt: Runtime,
    pub org_id: OrgID,
    pub user_id: UserID,
    /// A telephone and telegram channel that can send and receive.
    pub channel: ChannelFixture,
}

impl TestContext {
    /// Create a new test context.
    pub async fn new() -> Result<Self, String> {
        let database_url = std::env::var("TEST_DATABASE_URL").map_err(|_| "TEST_DATABASE_URL not set")?;
        let redis_url =
            std::env::var("TEST_REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379/15".to_string());

        let db = sqlx::PgPool::connect(&database_url)
            .await
            .map_err(|e| format!("Failed to connect to database: {}", e))?;

        flowroom_core::migrations::run_postgres(&db)
            .await
            .map_err(|e| format!("Failed to run migrations: {}", e))?;

        let redis =
            redis::Client::open(redis_url.as_str()).map_err(|e| format!("Failed to open Redis client: {}", e))?;

        let config = Config {
            database_url,
            redis_url,
            ..Default::default()
        };

        let rt = Runtime {
            readonly_db: db.clone(),
            db,
            redis,
            store: Arc::new(MemoryStore::new()),
            channel_logs: Arc::new(MemoryLogStore::new()),
            engine: Arc::new(MockEngine::new()),
            search: Arc::new(StaticSearch::new()),
            assets: Arc::new(AssetCache::new(Duration::from_secs(60))),
            config: Arc::new(config),
        };

        let (org_id,): (OrgID,) = sqlx::query_as(
            r#"
            INSERT INTO orgs (uuid, name, timezone, default_country, flow_languages)
            VALUES ($1, $2, 'America/Los_Angeles', 'US', '{eng,kin}')
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(format!("Test Org {}", Uuid::new_v4()))
        .fetch_one(&rt.db)
        .await
        .map_err(|e| format!("Failed to create org: {}", e))?;

        let (user_id,): (UserID,) = sqlx::query_as(
            "INSERT INTO users (uuid, org_id, email, first_name, role) VALUES ($1, $2, $3, 'Admin', 'A') RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(org_id)
        .bind(format!("admin-{}@example.com", Uuid::new_v4()))
        .fetch_one(&rt.db)
        .await
        .map_err(|e| format!("Failed to create user: {}", e))?;

        let mut ctx = Self {
            rt,
            org_id,
            user_id,
            channel: ChannelFixture {
                id: ChannelID(0),
                uuid: Uuid::nil(),
            },
        };
        ctx.channel = ctx.create_channel("Nexmo", &["tel", "telegram"]).await;

        Ok(ctx)
    }

    /// The org's assets, reloaded so they include everything seeded so far.
    pub async fn assets(&self) -> Arc<OrgAssets> {
        self.rt
            .refreshed_org_assets(self.org_id, Refresh::ALL)
            .await
            .expect("Failed to load org assets")
    }

    /// Create a channel that can send and receive on the given schemes.
    pub async fn create_channel(&self, name: &str, schemes: &[&str]) -> ChannelFixture {
        let uuid = Uuid::new_v4();
        let schemes: Vec<String> = schemes.iter().map(|s| s.to_string()).collect();

        let (id,): (ChannelID,) = sqlx::query_as(
            r#"
            INSERT INTO channels (uuid, org_id, name, address, channel_type, schemes, role, tps)
            VALUES ($1, $2, $3, '+12065551212', 'NX', $4, 'SR', 10)
            RETURNING id
            "#,
        )
        .bind(uuid)
        .bind(self.org_id)
        .bind(name)
        .bind(&schemes)
        .fetch_one(&self.rt.db)
        .await
        .expect("Failed to create channel");

        ChannelFixture { id, uuid }
    }

    /// Create a group, a query group when a query is given.
    pub async fn create_group(&self, name: &str, query: Option<&str>) -> (GroupID, Uuid) {
        let uuid = Uuid::new_v4();
        let group_type = if query.is_some() { "Q" } else { "M" };

        let (id,): (GroupID,) = sqlx::query_as(
            "INSERT INTO contact_groups (uuid, org_id, name, group_type, query) VALUES ($1, $2, $3, $4, $5) RETURNING id",
        )
        .bind(uuid)
        .bind(self.org_id)
        .bind(name)
        .bind(group_type)
        .bind(query)
        .fetch_one(&self.rt.db)
        .await
        .expect("Failed to create group");

        (id, uuid)
    }

    /// Create a contact field with the given value type code.
    pub async fn create_field(&self, key: &str, name: &str, value_type: &str) -> FieldID {
        let (id,): (FieldID,) = sqlx::query_as(
            "INSERT INTO contact_fields (uuid, org_id, key, name, value_type) VALUES ($1, $2, $3, $4, $5) RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(self.org_id)
        .bind(key)
        .bind(name)
        .bind(value_type)
        .fetch_one(&self.rt.db)
        .await
        .expect("Failed to create field");

        id
    }

    /// Create a campaign on a group with one flow point that fires `days` after the field,
    /// in the given status code.
    pub async fn create_campaign_point(
        &self,
        group_id: GroupID,
        field_id: FieldID,
        flow_id: FlowID,
        days: i32,
        status: &str,
    ) -> PointID {
        let (campaign_id,): (i64,) = sqlx::query_as(
            "INSERT INTO campaigns (uuid, org_id, name, group_id) VALUES ($1, $2, 'Reminders', $3) RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(self.org_id)
        .bind(group_id)
        .fetch_one(&self.rt.db)
        .await
        .expect("Failed to create campaign");

        let (id,): (PointID,) = sqlx::query_as(
            r#"
            INSERT INTO campaign_points (uuid, campaign_id, point_type, status, relative_to_id, "offset", unit, flow_id)
            VALUES ($1, $2, 'F', $3, $4, $5, 'D', $6)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(campaign_id)
        .bind(status)
        .bind(field_id)
        .bind(days)
        .bind(flow_id)
        .fetch_one(&self.rt.db)
        .await
        .expect("Failed to create campaign point");

        id
    }

    /// Add contacts to a group directly.
    pub async fn add_to_group(&self, group_id: GroupID, contacts: &[&Contact]) {
        for c in contacts {
            sqlx::query("INSERT INTO contact_groups_contacts (contactgroup_id, contact_id) VALUES ($1, $2)")
                .bind(group_id)
                .bind(c.id)
                .execute(&self.rt.db)
                .await
                .expect("Failed to add contact to group");
        }
    }

    /// Count a contact's campaign fires.
    pub async fn count_campaign_fires(&self, contact: &Contact) -> i64 {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM contact_fires WHERE contact_id = $1 AND fire_type = 'C'")
                .bind(contact.id)
                .fetch_one(&self.rt.db)
                .await
                .expect("Failed to count fires");
        count
    }

    /// Create a flow of the given type code from a list of scripted nodes.
    pub async fn create_flow(&self, name: &str, flow_type: &str, nodes: Vec<Value>) -> (FlowID, Uuid) {
        let uuid = Uuid::new_v4();

        let (id,): (FlowID,) = sqlx::query_as(
            "INSERT INTO flows (uuid, org_id, name, flow_type, definition) VALUES ($1, $2, $3, $4, $5) RETURNING id",
        )
        .bind(uuid)
        .bind(self.org_id)
        .bind(name)
        .bind(flow_type)
        .bind(json!({ "nodes": nodes }))
        .fetch_one(&self.rt.db)
        .await
        .expect("Failed to create flow");

        (id, uuid)
    }

    /// Create an active contact with the given URNs.
    pub async fn create_contact(&self, name: &str, urns: &[&str]) -> Contact {
        let oa = self.assets().await;
        let urns: Vec<String> = urns.iter().map(|u| u.to_string()).collect();

        contact::create_contact(
            &self.rt.db,
            self.rt.engine.as_ref(),
            &oa,
            self.user_id,
            Some(name),
            None,
            ContactStatus::Active,
            &urns,
        )
        .await
        .expect("Failed to create contact")
    }

    /// Reload a contact.
    pub async fn load_contact(&self, contact: &Contact) -> Contact {
        contact::load_contact(&self.rt.db, self.org_id, contact.id)
            .await
            .expect("Failed to load contact")
    }
}

/// A scripted node that sends a message.
pub fn send_msg_node(text: &str) -> Value {
    json!({
        "uuid": Uuid::new_v4(),
        "exit_uuid": Uuid::new_v4(),
        "action": {"type": "send_msg", "text": text}
    })
}

/// A scripted node that waits for a reply.
pub fn wait_node() -> Value {
    json!({
        "uuid": Uuid::new_v4(),
        "exit_uuid": Uuid::new_v4(),
        "ui_type": "wait_for_response",
        "action": {"type": "wait_for_response", "result_name": "Reply"}
    })
}

/// A scripted node that fails the session.
pub fn fail_node(text: &str) -> Value {
    json!({
        "uuid": Uuid::new_v4(),
        "exit_uuid": Uuid::new_v4(),
        "action": {"type": "fail", "text": text}
    })
}

/// A scripted node running any engine action.
pub fn action_node(action: Value) -> Value {
    json!({
        "uuid": Uuid::new_v4(),
        "exit_uuid": Uuid::new_v4(),
        "action": action
    })
}
