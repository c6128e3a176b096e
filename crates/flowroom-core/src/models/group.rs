// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Contact groups and group membership writes.

use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::ids::{ContactID, GroupID, OrgID, raw_ids};
use crate::error::Result;

code_enum! {
    /// The kind of a group. Status groups are maintained implicitly from contact status.
    pub enum GroupType {
        Manual = ("M", "manual"),
        Query = ("Q", "query"),
        DbActive = ("A", "active"),
        DbBlocked = ("B", "blocked"),
        DbStopped = ("S", "stopped"),
        DbArchived = ("V", "archived"),
    }
}

code_enum! {
    /// Whether a query group's membership is ready to use.
    pub enum GroupStatus {
        Initializing = ("I", "initializing"),
        Evaluating = ("V", "evaluating"),
        Ready = ("R", "ready"),
    }
}

/// A contact group.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Group {
    pub id: GroupID,
    pub uuid: Uuid,
    pub name: String,
    pub group_type: GroupType,
    pub status: GroupStatus,
    pub query: Option<String>,
    pub is_visible: bool,
}

impl Group {
    /// Whether this is one of the implicit status groups.
    pub fn is_status_group(&self) -> bool {
        !matches!(self.group_type, GroupType::Manual | GroupType::Query)
    }

    /// The reference the engine sees for this group.
    pub fn reference(&self) -> GroupRef {
        GroupRef {
            uuid: self.uuid,
            name: self.name.clone(),
        }
    }
}

/// A group as referenced by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupRef {
    pub uuid: Uuid,
    pub name: String,
}

/// A single contact joining or leaving a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupChange {
    pub contact_id: ContactID,
    pub group_id: GroupID,
}

/// Loads the active groups of an org.
pub async fn load_groups(pool: &PgPool, org_id: OrgID) -> Result<Vec<Group>> {
    let groups = sqlx::query_as::<_, Group>(
        r#"
        SELECT id, uuid, name, group_type, status, query, is_visible
        FROM contact_groups
        WHERE org_id = $1 AND is_active
        ORDER BY name
        "#,
    )
    .bind(org_id)
    .fetch_all(pool)
    .await?;

    Ok(groups)
}

/// Adds contacts to groups, ignoring memberships that already exist.
pub async fn add_contacts_to_groups(conn: &mut PgConnection, adds: &[GroupChange]) -> Result<()> {
    if adds.is_empty() {
        return Ok(());
    }

    let contact_ids: Vec<ContactID> = adds.iter().map(|a| a.contact_id).collect();
    let group_ids: Vec<GroupID> = adds.iter().map(|a| a.group_id).collect();

    sqlx::query(
        r#"
        INSERT INTO contact_groups_contacts (contact_id, contactgroup_id)
        SELECT * FROM UNNEST($1::BIGINT[], $2::BIGINT[])
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(raw_ids(&contact_ids))
    .bind(raw_ids(&group_ids))
    .execute(conn)
    .await?;

    Ok(())
}

/// Removes contacts from groups.
pub async fn remove_contacts_from_groups(
    conn: &mut PgConnection,
    removes: &[GroupChange],
) -> Result<()> {
    if removes.is_empty() {
        return Ok(());
    }

    let contact_ids: Vec<ContactID> = removes.iter().map(|r| r.contact_id).collect();
    let group_ids: Vec<GroupID> = removes.iter().map(|r| r.group_id).collect();

    sqlx::query(
        r#"
        DELETE FROM contact_groups_contacts g
        USING UNNEST($1::BIGINT[], $2::BIGINT[]) AS r(contact_id, group_id)
        WHERE g.contact_id = r.contact_id AND g.contactgroup_id = r.group_id
        "#,
    )
    .bind(raw_ids(&contact_ids))
    .bind(raw_ids(&group_ids))
    .execute(conn)
    .await?;

    Ok(())
}

/// Removes contacts from all their manual and query groups.
pub async fn remove_contacts_from_user_groups(
    conn: &mut PgConnection,
    contact_ids: &[ContactID],
) -> Result<()> {
    if contact_ids.is_empty() {
        return Ok(());
    }

    sqlx::query(
        r#"
        DELETE FROM contact_groups_contacts
        WHERE contact_id = ANY($1)
          AND contactgroup_id IN (SELECT id FROM contact_groups WHERE group_type IN ('M', 'Q'))
        "#,
    )
    .bind(raw_ids(contact_ids))
    .execute(conn)
    .await?;

    Ok(())
}

/// Loads the ids of the active contacts in the given groups.
pub async fn contact_ids_in_groups(pool: &PgPool, group_ids: &[GroupID]) -> Result<Vec<ContactID>> {
    if group_ids.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<(ContactID,)> = sqlx::query_as(
        r#"
        SELECT DISTINCT gc.contact_id
        FROM contact_groups_contacts gc
        JOIN contacts c ON c.id = gc.contact_id
        WHERE gc.contactgroup_id = ANY($1) AND c.is_active
        ORDER BY gc.contact_id
        "#,
    )
    .bind(raw_ids(group_ids))
    .fetch_all(pool)
    .await?;

    Ok(ids.into_iter().map(|(id,)| id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_groups() {
        let mut g = Group {
            id: GroupID(1),
            uuid: Uuid::new_v4(),
            name: "Kinyarwanda".to_string(),
            group_type: GroupType::Query,
            status: GroupStatus::Ready,
            query: Some("language = kin".to_string()),
            is_visible: true,
        };
        assert!(!g.is_status_group());
        assert_eq!(g.reference().name, "Kinyarwanda");

        g.group_type = GroupType::DbStopped;
        assert!(g.is_status_group());
        assert_eq!(GroupType::from_code("V"), Some(GroupType::DbArchived));
    }
}
