// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Contact field definitions and values.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use super::ids::{FieldID, OrgID};
use crate::error::{CoreError, Result};

/// Reserved key exposing the contact's creation time.
pub const CREATED_ON_KEY: &str = "created_on";
/// Reserved key exposing the contact's last seen time.
pub const LAST_SEEN_ON_KEY: &str = "last_seen_on";

code_enum! {
    /// The type of values a field holds.
    pub enum FieldType {
        Text = ("T", "text"),
        Number = ("N", "number"),
        Datetime = ("D", "datetime"),
        State = ("S", "state"),
        District = ("I", "district"),
        Ward = ("W", "ward"),
    }
}

/// A contact field definition.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Field {
    pub id: FieldID,
    pub uuid: Uuid,
    pub key: String,
    pub name: String,
    pub value_type: FieldType,
    pub is_system: bool,
}

/// A typed reference to a field, as carried in engine events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRef {
    pub key: String,
    pub name: String,
}

/// The value of a field on a contact, with every type it could be parsed as.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datetime: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub district: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ward: Option<String>,
}

impl FieldValue {
    /// Parses raw text into every type it can be read as, in the org's timezone.
    pub fn parse(text: &str, tz: Tz) -> Self {
        let text = text.trim();
        Self {
            text: text.to_string(),
            number: text.parse::<f64>().ok().filter(|n| n.is_finite()),
            datetime: parse_datetime(text, tz),
            state: None,
            district: None,
            ward: None,
        }
    }

    /// Parses raw text for a field, failing if it can't hold the field's type.
    pub fn parse_for(field: &Field, text: &str, tz: Tz) -> Result<Self> {
        let value = Self::parse(text, tz);
        let ok = match field.value_type {
            FieldType::Number => value.number.is_some(),
            FieldType::Datetime => value.datetime.is_some(),
            _ => true,
        };

        if ok {
            Ok(value)
        } else {
            Err(CoreError::InvalidFieldValue {
                field: field.key.clone(),
                value: text.to_string(),
            })
        }
    }
}

/// Parses an ISO8601 datetime, or a plain date (midnight in `tz`).
pub fn parse_datetime(text: &str, tz: Tz) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }

    let local = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S"))
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;

    tz.from_local_datetime(&local)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Loads the active fields of an org.
pub async fn load_fields(pool: &PgPool, org_id: OrgID) -> Result<Vec<Field>> {
    let fields = sqlx::query_as::<_, Field>(
        r#"
        SELECT id, uuid, key, name, value_type, is_system
        FROM contact_fields
        WHERE org_id = $1 AND is_active
        ORDER BY key
        "#,
    )
    .bind(org_id)
    .fetch_all(pool)
    .await?;

    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(key: &str, value_type: FieldType) -> Field {
        Field {
            id: FieldID(1),
            uuid: Uuid::new_v4(),
            key: key.to_string(),
            name: key.to_string(),
            value_type,
            is_system: false,
        }
    }

    #[test]
    fn test_parse_value() {
        let tz: Tz = "America/New_York".parse().unwrap();

        let v = FieldValue::parse(" 12.5 ", tz);
        assert_eq!(v.text, "12.5");
        assert_eq!(v.number, Some(12.5));
        assert_eq!(v.datetime, None);

        let v = FieldValue::parse("2029-11-03 00:30:00", tz);
        assert_eq!(
            v.datetime.unwrap().to_rfc3339(),
            "2029-11-03T04:30:00+00:00"
        );

        let v = FieldValue::parse("2020-01-01", tz);
        assert_eq!(
            v.datetime.unwrap().to_rfc3339(),
            "2020-01-01T05:00:00+00:00"
        );

        let v = FieldValue::parse("2020-01-01T10:00:00Z", tz);
        assert_eq!(
            v.datetime.unwrap().to_rfc3339(),
            "2020-01-01T10:00:00+00:00"
        );
    }

    #[test]
    fn test_parse_for_field_type() {
        let tz = Tz::UTC;
        assert!(FieldValue::parse_for(&field("age", FieldType::Number), "23", tz).is_ok());
        assert!(FieldValue::parse_for(&field("name", FieldType::Text), "bob", tz).is_ok());

        let err = FieldValue::parse_for(&field("age", FieldType::Number), "old", tz).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_FIELD_VALUE");

        let err =
            FieldValue::parse_for(&field("joined", FieldType::Datetime), "later", tz).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_value_json_omits_missing_types() {
        let v = FieldValue {
            text: "bob".to_string(),
            ..Default::default()
        };
        assert_eq!(serde_json::to_string(&v).unwrap(), r#"{"text":"bob"}"#);
    }
}
