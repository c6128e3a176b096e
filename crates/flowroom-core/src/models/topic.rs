// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ticket topics.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use super::ids::{OrgID, TopicID};
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Topic {
    pub id: TopicID,
    pub uuid: Uuid,
    pub name: String,
    pub is_default: bool,
}

impl Topic {
    pub fn reference(&self) -> TopicRef {
        TopicRef {
            uuid: self.uuid,
            name: self.name.clone(),
        }
    }
}

/// A topic as referenced by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRef {
    pub uuid: Uuid,
    pub name: String,
}

pub async fn load_topics(pool: &PgPool, org_id: OrgID) -> Result<Vec<Topic>> {
    let topics = sqlx::query_as::<_, Topic>(
        r#"
        SELECT id, uuid, name, is_default
        FROM ticket_topics
        WHERE org_id = $1 AND is_active
        ORDER BY is_default DESC, name
        "#,
    )
    .bind(org_id)
    .fetch_all(pool)
    .await?;

    Ok(topics)
}
