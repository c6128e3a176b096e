// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! IVR calls. Voice sessions point at the call they run in.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgExecutor};
use uuid::Uuid;

use super::ids::{CallID, ChannelID, ContactID, OrgID, UrnID};
use crate::error::{CoreError, Result};

code_enum! {
    pub enum CallDirection {
        Incoming = ("I", "in"),
        Outgoing = ("O", "out"),
    }
}

code_enum! {
    pub enum CallStatus {
        Pending = ("P", "pending"),
        Queued = ("Q", "queued"),
        Wired = ("W", "wired"),
        InProgress = ("I", "in_progress"),
        Completed = ("D", "completed"),
        Errored = ("E", "errored"),
        Failed = ("F", "failed"),
    }
}

/// A row in `calls`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Call {
    pub id: CallID,
    pub uuid: Uuid,
    pub org_id: OrgID,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub channel_id: ChannelID,
    pub contact_id: ContactID,
    pub contact_urn_id: UrnID,
    pub external_id: String,
    pub session_uuid: Option<Uuid>,
    pub created_on: DateTime<Utc>,
    pub ended_on: Option<DateTime<Utc>>,
}

/// Inserts a new call in the given status.
#[allow(clippy::too_many_arguments)]
pub async fn insert_call<'e>(
    db: impl PgExecutor<'e>,
    org_id: OrgID,
    channel_id: ChannelID,
    contact_id: ContactID,
    urn_id: UrnID,
    direction: CallDirection,
    status: CallStatus,
    external_id: &str,
) -> Result<Call> {
    let call = sqlx::query_as::<_, Call>(
        r#"
        INSERT INTO calls (uuid, org_id, direction, status, channel_id, contact_id, contact_urn_id, external_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id, uuid, org_id, direction, status, channel_id, contact_id, contact_urn_id,
                  external_id, session_uuid, created_on, ended_on
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(org_id)
    .bind(direction)
    .bind(status)
    .bind(channel_id)
    .bind(contact_id)
    .bind(urn_id)
    .bind(external_id)
    .fetch_one(db)
    .await?;

    Ok(call)
}

/// Loads a call by UUID.
pub async fn load_call<'e>(db: impl PgExecutor<'e>, uuid: Uuid) -> Result<Call> {
    sqlx::query_as::<_, Call>(
        r#"
        SELECT id, uuid, org_id, direction, status, channel_id, contact_id, contact_urn_id,
               external_id, session_uuid, created_on, ended_on
        FROM calls WHERE uuid = $1
        "#,
    )
    .bind(uuid)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| CoreError::not_found("call", uuid))
}

/// Records the session a call is running.
pub async fn attach_session(conn: &mut PgConnection, call_uuid: Uuid, session_uuid: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE calls SET session_uuid = $2, status = 'I', modified_on = NOW() WHERE uuid = $1",
    )
    .bind(call_uuid)
    .bind(session_uuid)
    .execute(conn)
    .await?;

    Ok(())
}

/// Marks a call completed once its session has ended.
pub async fn end_call(conn: &mut PgConnection, call_uuid: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE calls SET status = 'D', ended_on = COALESCE(ended_on, NOW()), modified_on = NOW()
        WHERE uuid = $1 AND status NOT IN ('D', 'F')
        "#,
    )
    .bind(call_uuid)
    .execute(conn)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_codes() {
        assert_eq!(CallStatus::Completed.code(), "D");
        assert_eq!(CallStatus::from_code("I"), Some(CallStatus::InProgress));
        assert_eq!(CallDirection::Outgoing.as_str(), "out");
    }
}
