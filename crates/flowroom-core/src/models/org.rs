// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orgs and their users.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use super::ids::{OrgID, UserID};
use crate::error::{CoreError, Result};

code_enum! {
    /// How dates are formatted for an org.
    pub enum DateFormat {
        DayFirst = ("D", "DD-MM-YYYY"),
        MonthFirst = ("M", "MM-DD-YYYY"),
        YearFirst = ("Y", "YYYY-MM-DD"),
    }
}

code_enum! {
    /// A user's role within an org.
    pub enum UserRole {
        Administrator = ("A", "administrator"),
        Editor = ("E", "editor"),
        Viewer = ("V", "viewer"),
        Agent = ("T", "agent"),
    }
}

/// A tenant.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Org {
    pub id: OrgID,
    pub uuid: Uuid,
    pub name: String,
    pub parent_id: OrgID,
    pub is_suspended: bool,
    pub timezone: String,
    pub date_format: DateFormat,
    pub default_country: Option<String>,
    pub flow_languages: Vec<String>,
    pub redaction_policy: String,
    pub smtp_url: Option<String>,
    pub config: Json<serde_json::Value>,
    pub created_on: DateTime<Utc>,
}

impl Org {
    /// The org's timezone, falling back to UTC for unknown names.
    pub fn tz(&self) -> Tz {
        self.timezone.parse().unwrap_or(Tz::UTC)
    }

    /// The default flow language, the first of the allowed languages.
    pub fn default_language(&self) -> Option<&str> {
        self.flow_languages.first().map(String::as_str)
    }

    /// Whether `language` is one of the org's flow languages.
    pub fn allows_language(&self, language: &str) -> bool {
        self.flow_languages.iter().any(|l| l == language)
    }

    /// Whether contact URNs should be redacted in logs and exports.
    pub fn redacts_urns(&self) -> bool {
        self.redaction_policy == "urns"
    }

    /// Reads a string value from the org's config map.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.0.get(key).and_then(|v| v.as_str())
    }
}

/// A user who can act on behalf of an org.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: UserID,
    pub uuid: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: UserRole,
    pub is_active: bool,
}

/// A user as referenced by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub email: String,
    #[serde(default)]
    pub name: String,
}

impl User {
    pub fn reference(&self) -> UserRef {
        UserRef {
            email: self.email.clone(),
            name: self.display_name(),
        }
    }

    /// Full name, or email when no name is set.
    pub fn display_name(&self) -> String {
        let name = format!("{} {}", self.first_name, self.last_name);
        let name = name.trim();
        if name.is_empty() {
            self.email.clone()
        } else {
            name.to_string()
        }
    }
}

/// Loads an org by id.
pub async fn load_org(pool: &PgPool, org_id: OrgID) -> Result<Org> {
    sqlx::query_as::<_, Org>(
        r#"
        SELECT id, uuid, name, parent_id, is_suspended, timezone, date_format, default_country,
               flow_languages, redaction_policy, smtp_url, config, created_on
        FROM orgs
        WHERE id = $1 AND is_active
        "#,
    )
    .bind(org_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| CoreError::not_found("org", org_id))
}

/// Loads the active users of an org.
pub async fn load_users(pool: &PgPool, org_id: OrgID) -> Result<Vec<User>> {
    let users = sqlx::query_as::<_, User>(
        r#"
        SELECT id, uuid, email, first_name, last_name, role, is_active
        FROM users
        WHERE org_id = $1 AND is_active
        ORDER BY id
        "#,
    )
    .bind(org_id)
    .fetch_all(pool)
    .await?;

    Ok(users)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn org(timezone: &str) -> Org {
        Org {
            id: OrgID(1),
            uuid: Uuid::new_v4(),
            name: "Nyaruka".to_string(),
            parent_id: OrgID(0),
            is_suspended: false,
            timezone: timezone.to_string(),
            date_format: DateFormat::DayFirst,
            default_country: Some("RW".to_string()),
            flow_languages: vec!["eng".to_string(), "kin".to_string()],
            redaction_policy: "none".to_string(),
            smtp_url: None,
            config: Json(serde_json::json!({"slack_url": "https://example.com"})),
            created_on: Utc::now(),
        }
    }

    #[test]
    fn test_org_helpers() {
        let o = org("Africa/Kigali");
        assert_eq!(o.tz(), chrono_tz::Africa::Kigali);
        assert_eq!(o.default_language(), Some("eng"));
        assert!(o.allows_language("kin"));
        assert!(!o.allows_language("fra"));
        assert!(!o.redacts_urns());
        assert_eq!(o.config_str("slack_url"), Some("https://example.com"));

        assert_eq!(org("Not/AZone").tz(), Tz::UTC);
    }

    #[test]
    fn test_codes() {
        assert_eq!(DateFormat::from_code("Y"), Some(DateFormat::YearFirst));
        assert_eq!(UserRole::Agent.code(), "T");
        assert_eq!(UserRole::parse("editor"), Some(UserRole::Editor));
        assert_eq!(UserRole::from_code("Z"), None);
    }
}
