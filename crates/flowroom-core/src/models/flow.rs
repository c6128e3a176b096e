// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flows and their definitions.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use super::ids::{FlowID, OrgID};
use crate::error::{CoreError, Result};

/// Bounds on how long a messaging flow waits before expiring.
pub const MIN_EXPIRES_MINUTES: i32 = 5;
pub const MAX_EXPIRES_MINUTES: i32 = 20160;

/// Voice flows always expire after this long.
pub const VOICE_EXPIRES_MINUTES: i32 = 15;

code_enum! {
    /// The type of a flow, which is also the type of sessions running it.
    pub enum FlowType {
        Messaging = ("M", "messaging"),
        Voice = ("V", "voice"),
        Background = ("B", "messaging_background"),
        Survey = ("S", "messaging_offline"),
    }
}

/// A flow, including its current definition.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Flow {
    pub id: FlowID,
    pub uuid: Uuid,
    pub name: String,
    pub flow_type: FlowType,
    pub definition: Json<serde_json::Value>,
    pub expires_after_minutes: i32,
    pub ivr_retry_minutes: Option<i32>,
    pub ignore_triggers: bool,
    pub is_active: bool,
}

impl Flow {
    /// The reference the engine sees for this flow.
    pub fn reference(&self) -> FlowRef {
        FlowRef {
            uuid: self.uuid,
            name: self.name.clone(),
        }
    }

    /// How long a wait in this flow lasts before expiring, if it expires at all.
    pub fn expires_after(&self) -> Option<Duration> {
        let minutes = match self.flow_type {
            FlowType::Voice => VOICE_EXPIRES_MINUTES,
            FlowType::Background => return None,
            FlowType::Messaging | FlowType::Survey => self
                .expires_after_minutes
                .clamp(MIN_EXPIRES_MINUTES, MAX_EXPIRES_MINUTES),
        };
        Some(Duration::from_secs(minutes as u64 * 60))
    }

    /// How long to wait before retrying an unanswered call, voice flows only.
    pub fn ivr_retry_wait(&self) -> Option<Duration> {
        match (self.flow_type, self.ivr_retry_minutes) {
            (FlowType::Voice, Some(m)) if m > 0 => Some(Duration::from_secs(m as u64 * 60)),
            _ => None,
        }
    }
}

/// A flow as referenced by the engine and events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowRef {
    pub uuid: Uuid,
    pub name: String,
}

const SELECT_FLOW: &str = r#"
    SELECT id, uuid, name, flow_type, definition, expires_after_minutes, ivr_retry_minutes,
           ignore_triggers, is_active
    FROM flows
"#;

/// Loads the active flows of an org.
pub async fn load_flows(pool: &PgPool, org_id: OrgID) -> Result<Vec<Flow>> {
    let flows = sqlx::query_as::<_, Flow>(&format!(
        "{SELECT_FLOW} WHERE org_id = $1 AND is_active AND NOT is_archived ORDER BY id"
    ))
    .bind(org_id)
    .fetch_all(pool)
    .await?;

    Ok(flows)
}

/// Loads a flow by id, including inactive flows.
pub async fn load_flow_by_id(pool: &PgPool, org_id: OrgID, flow_id: FlowID) -> Result<Flow> {
    sqlx::query_as::<_, Flow>(&format!("{SELECT_FLOW} WHERE org_id = $1 AND id = $2"))
        .bind(org_id)
        .bind(flow_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| CoreError::not_found("flow", flow_id))
}

/// Loads a flow by UUID, including inactive flows.
pub async fn load_flow_by_uuid(pool: &PgPool, org_id: OrgID, uuid: Uuid) -> Result<Flow> {
    sqlx::query_as::<_, Flow>(&format!("{SELECT_FLOW} WHERE org_id = $1 AND uuid = $2"))
        .bind(org_id)
        .bind(uuid)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| CoreError::not_found("flow", uuid))
}
