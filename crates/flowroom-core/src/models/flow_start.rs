// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow starts: requests to start a flow for an audience of contacts.
//!
//! A start moves `pending → queued → started → completed` (or `failed`). Users can interrupt a
//! start at any time, so every status write is guarded to never overwrite `interrupted`.

use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{PgConnection, PgExecutor, PgPool};
use uuid::Uuid;

use super::ids::{ContactID, FlowID, GroupID, OrgID, StartID, UserID, raw_ids};
use crate::error::{CoreError, Result};

code_enum! {
    pub enum StartType {
        Manual = ("M", "manual"),
        Api = ("A", "api"),
        FlowAction = ("F", "flow_action"),
        Trigger = ("T", "trigger"),
    }
}

code_enum! {
    pub enum StartStatus {
        Pending = ("P", "pending"),
        Queued = ("Q", "queued"),
        Started = ("S", "started"),
        Completed = ("C", "completed"),
        Failed = ("F", "failed"),
        Interrupted = ("I", "interrupted"),
    }
}

/// Which contacts to leave out of an audience.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusions {
    /// Contacts that are blocked, stopped or archived.
    #[serde(default)]
    pub non_active: bool,
    /// Contacts currently waiting in a session.
    #[serde(default)]
    pub in_a_flow: bool,
    /// Contacts that have ever had a run of the flow.
    #[serde(default)]
    pub started_previously: bool,
    /// Contacts last seen more recently than this many days ago, when positive.
    #[serde(default)]
    pub not_seen_since_days: i32,
}

/// A row in `flow_starts` with its contact and group targets.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct FlowStart {
    pub id: StartID,
    pub uuid: Uuid,
    pub org_id: OrgID,
    pub flow_id: FlowID,
    pub start_type: StartType,
    pub status: StartStatus,
    pub exclusions: Json<Exclusions>,
    pub query: Option<String>,
    pub urns: Vec<String>,
    pub create_contact: bool,
    pub params: Option<Json<serde_json::Value>>,
    pub parent_summary: Option<Json<serde_json::Value>>,
    pub session_history: Option<Json<serde_json::Value>>,
    pub contact_count: Option<i32>,
    pub created_by_id: UserID,
    pub contact_ids: Vec<ContactID>,
    pub group_ids: Vec<GroupID>,
    #[sqlx(skip)]
    pub exclude_group_ids: Vec<GroupID>,
}

impl FlowStart {
    pub fn new(org_id: OrgID, start_type: StartType, flow_id: FlowID) -> Self {
        Self {
            id: StartID(0),
            uuid: Uuid::new_v4(),
            org_id,
            flow_id,
            start_type,
            status: StartStatus::Pending,
            exclusions: Json(Exclusions::default()),
            query: None,
            urns: Vec::new(),
            create_contact: false,
            params: None,
            parent_summary: None,
            session_history: None,
            contact_count: None,
            created_by_id: UserID(0),
            contact_ids: Vec::new(),
            group_ids: Vec::new(),
            exclude_group_ids: Vec::new(),
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
        self.query = Some(query.to_string());
        self
    }

    pub fn with_exclusions(mut self, exclusions: Exclusions) -> Self {
        self.exclusions = Json(exclusions);
        self
    }

    pub fn with_params(mut self, params: Option<serde_json::Value>) -> Self {
        self.params = params.map(Json);
        self
    }

    /// Sets what a start from a flow action carries over from the session that triggered it.
    pub fn with_parent(mut self, summary: serde_json::Value, history: serde_json::Value) -> Self {
        self.parent_summary = Some(Json(summary));
        self.session_history = Some(Json(history));
        self
    }

    pub fn with_create_contact(mut self, create: bool) -> Self {
        self.create_contact = create;
        self
    }

    pub fn with_created_by(mut self, user_id: UserID) -> Self {
        self.created_by_id = user_id;
        self
    }

    /// Creates a batch of this start for the given contacts.
    pub fn create_batch(&self, contact_ids: Vec<ContactID>, is_first: bool, is_last: bool) -> FlowStartBatch {
        FlowStartBatch {
            start_id: self.id,
            start_type: self.start_type,
            org_id: self.org_id,
            flow_id: self.flow_id,
            created_by_id: self.created_by_id,
            contact_ids,
            params: self.params.as_ref().map(|p| p.0.clone()),
            parent_summary: self.parent_summary.as_ref().map(|p| p.0.clone()),
            session_history: self.session_history.as_ref().map(|p| p.0.clone()),
            interrupt: !self.exclusions.in_a_flow,
            is_first,
            is_last,
        }
    }
}

/// A slice of a start's audience, processed as one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStartBatch {
    pub start_id: StartID,
    pub start_type: StartType,
    pub org_id: OrgID,
    pub flow_id: FlowID,
    pub created_by_id: UserID,
    pub contact_ids: Vec<ContactID>,
    pub params: Option<serde_json::Value>,
    pub parent_summary: Option<serde_json::Value>,
    pub session_history: Option<serde_json::Value>,
    /// Whether contacts already waiting in a session have it interrupted first.
    pub interrupt: bool,
    pub is_first: bool,
    pub is_last: bool,
}

/// Inserts new starts with their contact and group targets, setting their ids.
pub async fn insert_flow_starts(conn: &mut PgConnection, starts: &mut [FlowStart]) -> Result<()> {
    for start in starts.iter_mut() {
        let (id,): (StartID,) = sqlx::query_as(
            r#"
            INSERT INTO flow_starts (uuid, org_id, flow_id, start_type, status, exclusions, query, urns,
                                     create_contact, params, parent_summary, session_history, created_by_id)
            VALUES ($1, $2, $3, $4, 'P', $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id
            "#,
        )
        .bind(start.uuid)
        .bind(start.org_id)
        .bind(start.flow_id)
        .bind(start.start_type)
        .bind(&start.exclusions)
        .bind(&start.query)
        .bind(&start.urns)
        .bind(start.create_contact)
        .bind(&start.params)
        .bind(&start.parent_summary)
        .bind(&start.session_history)
        .bind(start.created_by_id)
        .fetch_one(&mut *conn)
        .await?;

        start.id = id;
        start.status = StartStatus::Pending;

        if !start.contact_ids.is_empty() {
            sqlx::query(
                "INSERT INTO flow_starts_contacts (flowstart_id, contact_id) SELECT $1, UNNEST($2::BIGINT[])",
            )
            .bind(id)
            .bind(raw_ids(&start.contact_ids))
            .execute(&mut *conn)
            .await?;
        }

        if !start.group_ids.is_empty() {
            sqlx::query(
                "INSERT INTO flow_starts_groups (flowstart_id, contactgroup_id) SELECT $1, UNNEST($2::BIGINT[])",
            )
            .bind(id)
            .bind(raw_ids(&start.group_ids))
            .execute(&mut *conn)
            .await?;
        }
    }

    Ok(())
}

/// Loads a start with its targets.
pub async fn load_flow_start<'e>(db: impl PgExecutor<'e>, id: StartID) -> Result<FlowStart> {
    sqlx::query_as::<_, FlowStart>(
        r#"
        SELECT s.id, s.uuid, s.org_id, s.flow_id, s.start_type, s.status, s.exclusions, s.query, s.urns,
               s.create_contact, s.params, s.parent_summary, s.session_history, s.contact_count,
               s.created_by_id,
               ARRAY(SELECT contact_id FROM flow_starts_contacts WHERE flowstart_id = s.id ORDER BY contact_id) AS contact_ids,
               ARRAY(SELECT contactgroup_id FROM flow_starts_groups WHERE flowstart_id = s.id ORDER BY contactgroup_id) AS group_ids
        FROM flow_starts s WHERE s.id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| CoreError::not_found("flow start", id))
}

/// Moves a start to a new status unless it has been interrupted. Returns whether it moved.
pub async fn update_start_status<'e>(
    db: impl PgExecutor<'e>,
    id: StartID,
    status: StartStatus,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE flow_starts SET status = $2, modified_on = NOW() WHERE id = $1 AND status != 'I'",
    )
    .bind(id)
    .bind(status)
    .execute(db)
    .await?;

    Ok(res.rows_affected() > 0)
}

/// Marks a start as started with the size of its audience.
pub async fn mark_start_started<'e>(db: impl PgExecutor<'e>, id: StartID, contact_count: i32) -> Result<bool> {
    let res = sqlx::query(
        r#"
        UPDATE flow_starts SET status = 'S', contact_count = $2, modified_on = NOW()
        WHERE id = $1 AND status != 'I'
        "#,
    )
    .bind(id)
    .bind(contact_count)
    .execute(db)
    .await?;

    Ok(res.rows_affected() > 0)
}

/// Marks a start as failed, recording how many contacts were started before it did.
pub async fn mark_start_failed<'e>(db: impl PgExecutor<'e>, id: StartID, contact_count: i32) -> Result<bool> {
    let res = sqlx::query(
        r#"
        UPDATE flow_starts SET status = 'F', contact_count = $2, modified_on = NOW()
        WHERE id = $1 AND status != 'I'
        "#,
    )
    .bind(id)
    .bind(contact_count)
    .execute(db)
    .await?;

    Ok(res.rows_affected() > 0)
}

/// Claims up to `limit` pending starts, moving them to queued so no other worker picks them.
pub async fn claim_pending_starts(db: &PgPool, limit: i64) -> Result<Vec<StartID>> {
    let ids: Vec<StartID> = sqlx::query_scalar(
        r#"
        UPDATE flow_starts SET status = 'Q', modified_on = NOW()
        WHERE id IN (
            SELECT id FROM flow_starts WHERE status = 'P'
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

/// Reads just the status of a start.
pub async fn start_status<'e>(db: impl PgExecutor<'e>, id: StartID) -> Result<StartStatus> {
    let status: Option<StartStatus> = sqlx::query_scalar("SELECT status FROM flow_starts WHERE id = $1")
        .bind(id)
        .fetch_optional(db)
        .await?;

    status.ok_or_else(|| CoreError::not_found("flow start", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exclusions_json() {
        let e: Exclusions = serde_json::from_value(json!({"in_a_flow": true})).unwrap();
        assert!(e.in_a_flow);
        assert!(!e.non_active);
        assert_eq!(e.not_seen_since_days, 0);

        let e: Exclusions = serde_json::from_value(json!({})).unwrap();
        assert_eq!(e, Exclusions::default());
    }

    #[test]
    fn test_create_batch() {
        let mut start = FlowStart::new(OrgID(1), StartType::Manual, FlowID(10))
            .with_contact_ids(&[ContactID(1), ContactID(2)])
            .with_exclusions(Exclusions {
                in_a_flow: true,
                ..Default::default()
            })
            .with_params(Some(json!({"foo": "bar"})));
        start.id = StartID(7);

        let batch = start.create_batch(vec![ContactID(2)], true, false);
        assert_eq!(batch.start_id, StartID(7));
        assert_eq!(batch.contact_ids, vec![ContactID(2)]);
        assert!(!batch.interrupt);
        assert!(batch.is_first);
        assert!(!batch.is_last);
        assert_eq!(batch.params, Some(json!({"foo": "bar"})));

        let start = FlowStart::new(OrgID(1), StartType::Api, FlowID(10));
        assert!(start.create_batch(vec![], true, true).interrupt);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(StartStatus::Interrupted.code(), "I");
        assert_eq!(StartStatus::from_code("S"), Some(StartStatus::Started));
        assert_eq!(StartType::FlowAction.code(), "F");
    }
}
