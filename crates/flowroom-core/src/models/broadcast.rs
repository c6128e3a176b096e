// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broadcasts: one message, in several languages, sent to many contacts.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{PgConnection, PgExecutor, PgPool};
use uuid::Uuid;

use super::flow_start::Exclusions;
use super::ids::{BroadcastID, ContactID, GroupID, OptInID, OrgID, TemplateID, UserID, raw_ids};
use super::msg::MsgContent;
use crate::error::{CoreError, Result};

code_enum! {
    pub enum BroadcastStatus {
        Pending = ("P", "pending"),
        Queued = ("Q", "queued"),
        Started = ("S", "started"),
        Completed = ("C", "completed"),
        Failed = ("F", "failed"),
        Interrupted = ("I", "interrupted"),
    }
}

/// The content of a broadcast in one language.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastTranslation {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quick_replies: Vec<String>,
}

impl From<&BroadcastTranslation> for MsgContent {
    fn from(t: &BroadcastTranslation) -> Self {
        MsgContent {
            text: t.text.clone(),
            attachments: t.attachments.clone(),
            quick_replies: t.quick_replies.clone(),
        }
    }
}

/// Translations keyed by language code.
pub type Translations = BTreeMap<String, BroadcastTranslation>;

/// Picks the translation to send a contact: their own language if the org allows it, then the
/// org's default language, then the base language.
pub fn pick_translation<'a>(
    translations: &'a Translations,
    base_language: &str,
    contact_language: Option<&str>,
    org_languages: &[String],
) -> Option<(&'a str, &'a BroadcastTranslation)> {
    let allowed = contact_language.filter(|l| org_languages.iter().any(|o| o == l));
    let candidates = [allowed, org_languages.first().map(String::as_str), Some(base_language)];

    candidates
        .into_iter()
        .flatten()
        .find_map(|lang| translations.get_key_value(lang))
        .map(|(k, v)| (k.as_str(), v))
}

/// A row in `broadcasts`, with its recipients from the join tables.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Broadcast {
    pub id: BroadcastID,
    pub uuid: Uuid,
    pub org_id: OrgID,
    pub status: BroadcastStatus,
    pub translations: Json<Translations>,
    pub base_language: String,
    pub optin_id: OptInID,
    pub template_id: TemplateID,
    pub template_variables: Vec<String>,
    pub query: Option<String>,
    pub exclusions: Json<Exclusions>,
    pub urns: Vec<String>,
    pub contact_count: Option<i32>,
    pub created_by_id: UserID,
    pub created_on: DateTime<Utc>,
    pub contact_ids: Vec<ContactID>,
    pub group_ids: Vec<GroupID>,
}

impl Broadcast {
    /// A new broadcast, not yet inserted.
    pub fn new(org_id: OrgID, translations: Translations, base_language: &str) -> Self {
        Self {
            id: BroadcastID(0),
            uuid: Uuid::new_v4(),
            org_id,
            status: BroadcastStatus::Pending,
            translations: Json(translations),
            base_language: base_language.to_string(),
            optin_id: OptInID(0),
            template_id: TemplateID(0),
            template_variables: Vec::new(),
            query: None,
            exclusions: Json(Exclusions::default()),
            urns: Vec::new(),
            contact_count: None,
            created_by_id: UserID(0),
            created_on: Utc::now(),
            contact_ids: Vec::new(),
            group_ids: Vec::new(),
        }
    }

    pub fn with_contact_ids(mut self, ids: &[ContactID]) -> Self {
        self.contact_ids = ids.to_vec();
        self
    }

    pub fn with_group_ids(mut self, ids: &[GroupID]) -> Self {
        self.group_ids = ids.to_vec();
        self
    }

    pub fn with_urns(mut self, urns: &[String]) -> Self {
        self.urns = urns.to_vec();
        self
    }

    pub fn with_query(mut self, query: &str) -> Self {
        self.query = Some(query.to_string()).filter(|q| !q.is_empty());
        self
    }

    pub fn with_exclusions(mut self, exclusions: Exclusions) -> Self {
        self.exclusions = Json(exclusions);
        self
    }

    pub fn with_optin(mut self, optin_id: OptInID) -> Self {
        self.optin_id = optin_id;
        self
    }

    pub fn with_template(mut self, template_id: TemplateID, variables: &[String]) -> Self {
        self.template_id = template_id;
        self.template_variables = variables.to_vec();
        self
    }

    pub fn with_created_by(mut self, user_id: UserID) -> Self {
        self.created_by_id = user_id;
        self
    }

    pub fn create_batch(&self, contact_ids: Vec<ContactID>, is_first: bool, is_last: bool) -> BroadcastBatch {
        BroadcastBatch {
            broadcast_id: self.id,
            org_id: self.org_id,
            translations: self.translations.0.clone(),
            base_language: self.base_language.clone(),
            optin_id: self.optin_id,
            template_id: self.template_id,
            template_variables: self.template_variables.clone(),
            created_by_id: self.created_by_id,
            contact_ids,
            is_first,
            is_last,
        }
    }
}

/// A slice of a broadcast's recipients, sent as one unit of work. Campaign message points are
/// sent as batches with no broadcast behind them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastBatch {
    pub broadcast_id: BroadcastID,
    pub org_id: OrgID,
    pub translations: Translations,
    pub base_language: String,
    #[serde(default)]
    pub optin_id: OptInID,
    #[serde(default)]
    pub template_id: TemplateID,
    #[serde(default)]
    pub template_variables: Vec<String>,
    #[serde(default)]
    pub created_by_id: UserID,
    pub contact_ids: Vec<ContactID>,
    pub is_first: bool,
    pub is_last: bool,
}

/// Inserts broadcasts along with their contacts and groups, setting their ids.
pub async fn insert_broadcasts(conn: &mut PgConnection, broadcasts: &mut [Broadcast]) -> Result<()> {
    for b in broadcasts.iter_mut() {
        let (id,): (BroadcastID,) = sqlx::query_as(
            r#"
            INSERT INTO broadcasts (uuid, org_id, status, translations, base_language, optin_id,
                                    template_id, template_variables, query, exclusions, urns,
                                    created_by_id, created_on, modified_on)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
            RETURNING id
            "#,
        )
        .bind(b.uuid)
        .bind(b.org_id)
        .bind(b.status)
        .bind(&b.translations)
        .bind(&b.base_language)
        .bind(b.optin_id)
        .bind(b.template_id)
        .bind(&b.template_variables)
        .bind(&b.query)
        .bind(&b.exclusions)
        .bind(&b.urns)
        .bind(b.created_by_id)
        .bind(b.created_on)
        .fetch_one(&mut *conn)
        .await?;

        b.id = id;

        sqlx::query(
            "INSERT INTO broadcasts_contacts (broadcast_id, contact_id) SELECT $1, UNNEST($2::BIGINT[])",
        )
        .bind(id)
        .bind(raw_ids(&b.contact_ids))
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "INSERT INTO broadcasts_groups (broadcast_id, contactgroup_id) SELECT $1, UNNEST($2::BIGINT[])",
        )
        .bind(id)
        .bind(raw_ids(&b.group_ids))
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

/// Loads a broadcast with its contacts and groups.
pub async fn load_broadcast<'e>(db: impl PgExecutor<'e>, id: BroadcastID) -> Result<Broadcast> {
    sqlx::query_as::<_, Broadcast>(
        r#"
        SELECT b.id, b.uuid, b.org_id, b.status, b.translations, b.base_language, b.optin_id,
               b.template_id, b.template_variables, b.query, b.exclusions, b.urns, b.contact_count,
               b.created_by_id, b.created_on,
               ARRAY(SELECT contact_id FROM broadcasts_contacts WHERE broadcast_id = b.id ORDER BY id) AS contact_ids,
               ARRAY(SELECT contactgroup_id FROM broadcasts_groups WHERE broadcast_id = b.id ORDER BY id) AS group_ids
        FROM broadcasts b WHERE b.id = $1 AND b.is_active
        "#,
    )
    .bind(id)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| CoreError::not_found("broadcast", id))
}

/// Sets the status of a broadcast unless it has been interrupted.
pub async fn update_broadcast_status<'e>(
    db: impl PgExecutor<'e>,
    id: BroadcastID,
    status: BroadcastStatus,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE broadcasts SET status = $2, modified_on = NOW() WHERE id = $1 AND status != 'I'",
    )
    .bind(id)
    .bind(status)
    .execute(db)
    .await?;

    Ok(res.rows_affected() > 0)
}

/// Marks a broadcast as started with its final recipient count.
pub async fn mark_broadcast_started<'e>(db: impl PgExecutor<'e>, id: BroadcastID, contact_count: i32) -> Result<bool> {
    let res = sqlx::query(
        r#"
        UPDATE broadcasts SET status = 'S', contact_count = $2, modified_on = NOW()
        WHERE id = $1 AND status != 'I'
        "#,
    )
    .bind(id)
    .bind(contact_count)
    .execute(db)
    .await?;

    Ok(res.rows_affected() > 0)
}

/// Claims up to `limit` pending broadcasts, moving them to queued so no other worker picks them.
pub async fn claim_pending_broadcasts(db: &PgPool, limit: i64) -> Result<Vec<BroadcastID>> {
    let ids: Vec<BroadcastID> = sqlx::query_scalar(
        r#"
        UPDATE broadcasts SET status = 'Q', modified_on = NOW()
        WHERE id IN (
            SELECT id FROM broadcasts WHERE status = 'P'
            ORDER BY created_on, id
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id
        "#,
    )
    .bind(limit)
    .fetch_all(db)
    .await?;

    Ok(ids)
}

/// The current status of a broadcast.
pub async fn broadcast_status<'e>(db: impl PgExecutor<'e>, id: BroadcastID) -> Result<BroadcastStatus> {
    sqlx::query_scalar("SELECT status FROM broadcasts WHERE id = $1")
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| CoreError::not_found("broadcast", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn translations() -> Translations {
        serde_json::from_value(json!({
            "eng": {"text": "Hello"},
            "fra": {"text": "Bonjour", "attachments": ["image/jpeg:https://x.com/a.jpg"]},
            "spa": {"text": "Hola", "quick_replies": ["Si", "No"]}
        }))
        .unwrap()
    }

    #[test]
    fn test_pick_translation() {
        let t = translations();
        let org = vec!["spa".to_string(), "fra".to_string()];

        let pick = |lang: Option<&str>| pick_translation(&t, "eng", lang, &org).map(|(l, _)| l);

        assert_eq!(pick(Some("fra")), Some("fra"));
        // eng exists but isn't an org language
        assert_eq!(pick(Some("eng")), Some("spa"));
        assert_eq!(pick(None), Some("spa"));
        assert_eq!(pick_translation(&t, "eng", Some("kin"), &[]).map(|(l, _)| l), Some("eng"));
        assert_eq!(pick_translation(&t, "kin", Some("kin"), &[]), None);
    }

    #[test]
    fn test_batch() {
        let b = Broadcast::new(OrgID(1), translations(), "eng")
            .with_contact_ids(&[ContactID(1), ContactID(2)])
            .with_optin(OptInID(3));

        let batch = b.create_batch(vec![ContactID(2)], false, true);
        assert_eq!(batch.contact_ids, vec![ContactID(2)]);
        assert_eq!(batch.optin_id, OptInID(3));
        assert!(batch.is_last);

        let content: MsgContent = (&batch.translations["spa"]).into();
        assert_eq!(content.quick_replies, vec!["Si", "No"]);

        assert_eq!(BroadcastStatus::Interrupted.code(), "I");
    }
}
