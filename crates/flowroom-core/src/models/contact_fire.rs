// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Contact fires, the future-dated jobs behind campaign events and session waits.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use super::ids::{ContactID, FireID, OrgID, PointID, raw_ids};
use crate::error::Result;

code_enum! {
    /// What a fire does when it comes due.
    pub enum FireType {
        WaitExpiration = ("E", "wait_expiration"),
        WaitTimeout = ("T", "wait_timeout"),
        Campaign = ("C", "campaign"),
    }
}

/// A scheduled action against a contact. Scope is unique per contact and type.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ContactFire {
    pub id: FireID,
    pub org_id: OrgID,
    pub contact_id: ContactID,
    pub fire_type: FireType,
    pub scope: String,
    pub fire_on: DateTime<Utc>,
    pub session_uuid: Option<Uuid>,
    pub sprint_uuid: Option<Uuid>,
}

impl ContactFire {
    /// A fire for a campaign point, scoped to the point's current version.
    pub fn for_campaign(
        org_id: OrgID,
        contact_id: ContactID,
        point_id: PointID,
        fire_version: i32,
        fire_on: DateTime<Utc>,
    ) -> Self {
        Self {
            id: FireID(0),
            org_id,
            contact_id,
            fire_type: FireType::Campaign,
            scope: campaign_scope(point_id, fire_version),
            fire_on,
            session_uuid: None,
            sprint_uuid: None,
        }
    }

    /// A wait expiration or timeout fire for a waiting session.
    pub fn for_session(
        org_id: OrgID,
        contact_id: ContactID,
        fire_type: FireType,
        session_uuid: Uuid,
        sprint_uuid: Uuid,
        fire_on: DateTime<Utc>,
    ) -> Self {
        Self {
            id: FireID(0),
            org_id,
            contact_id,
            fire_type,
            scope: String::new(),
            fire_on,
            session_uuid: Some(session_uuid),
            sprint_uuid: Some(sprint_uuid),
        }
    }

    /// The point and version of a campaign fire.
    pub fn campaign_point(&self) -> Option<(PointID, i32)> {
        if self.fire_type != FireType::Campaign {
            return None;
        }
        parse_campaign_scope(&self.scope)
    }
}

/// The scope of a campaign fire, `{pointID}:{fireVersion}`.
pub fn campaign_scope(point_id: PointID, fire_version: i32) -> String {
    format!("{}:{}", point_id, fire_version)
}

/// Parses a campaign fire scope.
pub fn parse_campaign_scope(scope: &str) -> Option<(PointID, i32)> {
    let (point, version) = scope.split_once(':')?;
    Some((PointID(point.parse().ok()?), version.parse().ok()?))
}

/// Inserts fires, ignoring any whose scope already exists for the contact.
pub async fn insert_contact_fires(conn: &mut PgConnection, fires: &[ContactFire]) -> Result<()> {
    if fires.is_empty() {
        return Ok(());
    }

    let org_ids: Vec<OrgID> = fires.iter().map(|f| f.org_id).collect();
    let contact_ids: Vec<ContactID> = fires.iter().map(|f| f.contact_id).collect();
    let types: Vec<&str> = fires.iter().map(|f| f.fire_type.code()).collect();
    let scopes: Vec<&str> = fires.iter().map(|f| f.scope.as_str()).collect();
    let fire_ons: Vec<DateTime<Utc>> = fires.iter().map(|f| f.fire_on).collect();
    let sessions: Vec<Option<Uuid>> = fires.iter().map(|f| f.session_uuid).collect();
    let sprints: Vec<Option<Uuid>> = fires.iter().map(|f| f.sprint_uuid).collect();

    sqlx::query(
        r#"
        INSERT INTO contact_fires (org_id, contact_id, fire_type, scope, fire_on, session_uuid, sprint_uuid)
        SELECT * FROM UNNEST($1::BIGINT[], $2::BIGINT[], $3::TEXT[], $4::TEXT[], $5::TIMESTAMPTZ[], $6::UUID[], $7::UUID[])
        ON CONFLICT (contact_id, fire_type, scope) DO NOTHING
        "#,
    )
    .bind(raw_ids(&org_ids))
    .bind(raw_ids(&contact_ids))
    .bind(types)
    .bind(scopes)
    .bind(fire_ons)
    .bind(sessions)
    .bind(sprints)
    .execute(conn)
    .await?;

    Ok(())
}

/// Deletes the wait expiration and timeout fires of the given contacts.
pub async fn delete_session_fires(conn: &mut PgConnection, contact_ids: &[ContactID]) -> Result<u64> {
    if contact_ids.is_empty() {
        return Ok(0);
    }

    let res = sqlx::query(
        "DELETE FROM contact_fires WHERE contact_id = ANY($1) AND fire_type IN ('E', 'T')",
    )
    .bind(raw_ids(contact_ids))
    .execute(conn)
    .await?;

    Ok(res.rows_affected())
}

/// A contact's fire for a campaign point, at any version, to delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FireDelete {
    pub contact_id: ContactID,
    pub point_id: PointID,
}

/// Deletes unfired campaign fires for (contact, point) pairs.
pub async fn delete_campaign_fires(conn: &mut PgConnection, deletes: &[FireDelete]) -> Result<u64> {
    if deletes.is_empty() {
        return Ok(0);
    }

    let contact_ids: Vec<ContactID> = deletes.iter().map(|d| d.contact_id).collect();
    let point_ids: Vec<PointID> = deletes.iter().map(|d| d.point_id).collect();

    let res = sqlx::query(
        r#"
        DELETE FROM contact_fires f
        USING UNNEST($1::BIGINT[], $2::BIGINT[]) AS d(contact_id, point_id)
        WHERE f.fire_type = 'C' AND f.contact_id = d.contact_id
          AND split_part(f.scope, ':', 1) = d.point_id::TEXT
        "#,
    )
    .bind(raw_ids(&contact_ids))
    .bind(raw_ids(&point_ids))
    .execute(conn)
    .await?;

    Ok(res.rows_affected())
}

/// Deletes every campaign fire of the given contacts.
pub async fn delete_all_campaign_fires(
    conn: &mut PgConnection,
    contact_ids: &[ContactID],
) -> Result<u64> {
    if contact_ids.is_empty() {
        return Ok(0);
    }

    let res = sqlx::query("DELETE FROM contact_fires WHERE contact_id = ANY($1) AND fire_type = 'C'")
        .bind(raw_ids(contact_ids))
        .execute(conn)
        .await?;

    Ok(res.rows_affected())
}

/// Deletes the fires of a campaign point scheduled for any version but the given one.
pub async fn delete_stale_point_fires(conn: &mut PgConnection, point_id: PointID, fire_version: i32) -> Result<u64> {
    let res = sqlx::query(
        r#"
        DELETE FROM contact_fires
        WHERE fire_type = 'C' AND split_part(scope, ':', 1) = $1::TEXT AND scope != $2
        "#,
    )
    .bind(point_id.0)
    .bind(campaign_scope(point_id, fire_version))
    .execute(conn)
    .await?;

    Ok(res.rows_affected())
}

/// Claims fires that are due, skipping any another worker holds.
pub async fn load_due_fires(conn: &mut PgConnection, limit: i64) -> Result<Vec<ContactFire>> {
    let fires = sqlx::query_as::<_, ContactFire>(
        r#"
        SELECT id, org_id, contact_id, fire_type, scope, fire_on, session_uuid, sprint_uuid
        FROM contact_fires
        WHERE fire_on < NOW()
        ORDER BY fire_on
        LIMIT $1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(limit)
    .fetch_all(conn)
    .await?;

    Ok(fires)
}

/// Deletes fires by id.
pub async fn delete_fires(conn: &mut PgConnection, ids: &[FireID]) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }

    let res = sqlx::query("DELETE FROM contact_fires WHERE id = ANY($1)")
        .bind(raw_ids(ids))
        .execute(conn)
        .await?;

    Ok(res.rows_affected())
}
