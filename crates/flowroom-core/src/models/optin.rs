// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Optins, the topics contacts can opt in to receiving messages about.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use super::ids::{OptInID, OrgID};
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OptIn {
    pub id: OptInID,
    pub uuid: Uuid,
    pub name: String,
}

impl OptIn {
    pub fn reference(&self) -> OptInRef {
        OptInRef {
            uuid: self.uuid,
            name: self.name.clone(),
        }
    }
}

/// An optin as referenced by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptInRef {
    pub uuid: Uuid,
    pub name: String,
}

pub async fn load_optins(pool: &PgPool, org_id: OrgID) -> Result<Vec<OptIn>> {
    let optins = sqlx::query_as::<_, OptIn>(
        "SELECT id, uuid, name FROM optins WHERE org_id = $1 AND is_active ORDER BY name",
    )
    .bind(org_id)
    .fetch_all(pool)
    .await?;

    Ok(optins)
}
