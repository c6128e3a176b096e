// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Administrative boundaries used by state, district and ward fields.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use super::ids::OrgID;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Location {
    pub osm_id: String,
    pub name: String,
    pub level: i32,
    pub parent_osm_id: Option<String>,
    pub aliases: Vec<String>,
}

impl Location {
    /// Whether `text` names this location, case-insensitively, by name or alias.
    pub fn matches(&self, text: &str) -> bool {
        let text = text.trim();
        self.name.eq_ignore_ascii_case(text) || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(text))
    }
}

pub async fn load_locations(pool: &PgPool, org_id: OrgID) -> Result<Vec<Location>> {
    let locations = sqlx::query_as::<_, Location>(
        r#"
        SELECT osm_id, name, level, parent_osm_id, aliases
        FROM locations
        WHERE org_id = $1
        ORDER BY level, name
        "#,
    )
    .bind(org_id)
    .fetch_all(pool)
    .await?;

    Ok(locations)
}
