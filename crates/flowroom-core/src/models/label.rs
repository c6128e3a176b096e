// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message labels.

use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::ids::{LabelID, MsgID, OrgID, raw_ids};
use crate::error::Result;

/// A label that can be applied to incoming messages.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Label {
    pub id: LabelID,
    pub uuid: Uuid,
    pub name: String,
}

/// A label as referenced by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRef {
    pub uuid: Uuid,
    pub name: String,
}

/// A label to apply to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgLabelAdd {
    pub msg_id: MsgID,
    pub label_id: LabelID,
}

pub async fn load_labels(pool: &PgPool, org_id: OrgID) -> Result<Vec<Label>> {
    let labels = sqlx::query_as::<_, Label>(
        "SELECT id, uuid, name FROM labels WHERE org_id = $1 AND is_active ORDER BY name",
    )
    .bind(org_id)
    .fetch_all(pool)
    .await?;

    Ok(labels)
}

/// Applies labels to messages, ignoring ones already applied.
pub async fn add_msg_labels(conn: &mut PgConnection, adds: &[MsgLabelAdd]) -> Result<()> {
    if adds.is_empty() {
        return Ok(());
    }

    let msg_ids: Vec<MsgID> = adds.iter().map(|a| a.msg_id).collect();
    let label_ids: Vec<LabelID> = adds.iter().map(|a| a.label_id).collect();

    sqlx::query(
        r#"
        INSERT INTO msgs_labels (msg_id, label_id)
        SELECT * FROM UNNEST($1::BIGINT[], $2::BIGINT[])
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(raw_ids(&msg_ids))
    .bind(raw_ids(&label_ids))
    .execute(conn)
    .await?;

    Ok(())
}
