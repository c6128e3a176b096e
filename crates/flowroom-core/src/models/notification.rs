// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! User notifications.

use sqlx::PgConnection;

use super::ids::{ImportID, IncidentID, OrgID, UserID, raw_ids};
use super::org::{User, UserRole};
use crate::error::Result;

/// The kind of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationType {
    ImportFinished,
    IncidentStarted,
    TicketsActivity,
}

impl NotificationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ImportFinished => "import:finished",
            Self::IncidentStarted => "incident:started",
            Self::TicketsActivity => "tickets:activity",
        }
    }
}

/// A notification to insert for one or more users.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub org_id: OrgID,
    pub notification_type: NotificationType,
    pub scope: String,
    pub user_ids: Vec<UserID>,
    pub contact_import_id: ImportID,
    pub incident_id: IncidentID,
}

impl Notification {
    /// Tells an agent they have ticket activity.
    pub fn tickets_activity(org_id: OrgID, user_id: UserID) -> Self {
        Self {
            org_id,
            notification_type: NotificationType::TicketsActivity,
            scope: String::new(),
            user_ids: vec![user_id],
            contact_import_id: ImportID(0),
            incident_id: IncidentID(0),
        }
    }

    /// Tells the org's administrators an incident started.
    pub fn incident_started(org_id: OrgID, incident_id: IncidentID, users: &[User]) -> Self {
        Self {
            org_id,
            notification_type: NotificationType::IncidentStarted,
            scope: incident_id.to_string(),
            user_ids: administrators(users),
            contact_import_id: ImportID(0),
            incident_id,
        }
    }

    /// Tells the user who created an import that it finished.
    pub fn import_finished(org_id: OrgID, import_id: ImportID, user_id: UserID) -> Self {
        Self {
            org_id,
            notification_type: NotificationType::ImportFinished,
            scope: import_id.to_string(),
            user_ids: vec![user_id],
            contact_import_id: import_id,
            incident_id: IncidentID(0),
        }
    }
}

fn administrators(users: &[User]) -> Vec<UserID> {
    users
        .iter()
        .filter(|u| u.role == UserRole::Administrator)
        .map(|u| u.id)
        .collect()
}

/// Inserts notifications, re-marking as unseen any that already exist.
pub async fn insert_notifications(conn: &mut PgConnection, notifications: &[Notification]) -> Result<()> {
    for n in notifications {
        let user_ids: Vec<UserID> = n.user_ids.iter().copied().filter(|u| !u.is_nil()).collect();
        if user_ids.is_empty() {
            continue;
        }

        sqlx::query(
            r#"
            INSERT INTO notifications (org_id, notification_type, scope, user_id, contact_import_id, incident_id)
            SELECT $1, $2, $3, u, $5, $6 FROM UNNEST($4::BIGINT[]) AS u
            ON CONFLICT (org_id, notification_type, scope, user_id) DO UPDATE SET is_seen = FALSE
            "#,
        )
        .bind(n.org_id)
        .bind(n.notification_type.as_str())
        .bind(&n.scope)
        .bind(raw_ids(&user_ids))
        .bind(n.contact_import_id)
        .bind(n.incident_id)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_incident_notifies_admins() {
        let user = |id: i64, role: UserRole| User {
            id: UserID(id),
            uuid: Uuid::new_v4(),
            email: format!("user{}@example.com", id),
            first_name: String::new(),
            last_name: String::new(),
            role,
            is_active: true,
        };
        let users = vec![
            user(1, UserRole::Administrator),
            user(2, UserRole::Agent),
            user(3, UserRole::Administrator),
        ];

        let n = Notification::incident_started(OrgID(1), IncidentID(12), &users);
        assert_eq!(n.notification_type.as_str(), "incident:started");
        assert_eq!(n.scope, "12");
        assert_eq!(n.user_ids, vec![UserID(1), UserID(3)]);
    }
}
