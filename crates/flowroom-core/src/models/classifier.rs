// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! NLU classifiers and LLM services, used by flows through service calls.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use super::ids::{ClassifierID, LlmID, OrgID};
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Classifier {
    pub id: ClassifierID,
    pub uuid: Uuid,
    pub name: String,
    pub classifier_type: String,
    pub intents: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Llm {
    pub id: LlmID,
    pub uuid: Uuid,
    pub name: String,
    pub llm_type: String,
    pub model: String,
}

pub async fn load_classifiers(pool: &PgPool, org_id: OrgID) -> Result<Vec<Classifier>> {
    let classifiers = sqlx::query_as::<_, Classifier>(
        r#"
        SELECT id, uuid, name, classifier_type, intents
        FROM classifiers
        WHERE org_id = $1 AND is_active
        ORDER BY name
        "#,
    )
    .bind(org_id)
    .fetch_all(pool)
    .await?;

    Ok(classifiers)
}

pub async fn load_llms(pool: &PgPool, org_id: OrgID) -> Result<Vec<Llm>> {
    let llms = sqlx::query_as::<_, Llm>(
        "SELECT id, uuid, name, llm_type, model FROM llms WHERE org_id = $1 AND is_active ORDER BY name",
    )
    .bind(org_id)
    .fetch_all(pool)
    .await?;

    Ok(llms)
}
