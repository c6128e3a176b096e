// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Channel events: things that happen on a channel that aren't messages.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgExecutor};
use uuid::Uuid;

use super::contact::{self, ContactStatus};
use super::ids::{ChannelEventID, ChannelID, ContactID, OptInID, OrgID, UrnID};
use crate::error::{CoreError, Result};

code_enum! {
    pub enum ChannelEventType {
        NewConversation = ("new_conversation", "new_conversation"),
        Referral = ("referral", "referral"),
        StopContact = ("stop_contact", "stop_contact"),
        WelcomeMessage = ("welcome_message", "welcome_message"),
        Optin = ("optin", "optin"),
        Optout = ("optout", "optout"),
        MissedIncomingCall = ("mo_miss", "mo_miss"),
        IncomingCall = ("mo_call", "mo_call"),
        OutgoingCall = ("mt_call", "mt_call"),
        MissedOutgoingCall = ("mt_miss", "mt_miss"),
        DeleteContact = ("delete_contact", "delete_contact"),
    }
}

code_enum! {
    pub enum ChannelEventStatus {
        Pending = ("P", "pending"),
        Handled = ("H", "handled"),
    }
}

impl ChannelEventType {
    /// Whether events of this type can start a flow through a trigger.
    pub fn is_triggerable(self) -> bool {
        matches!(
            self,
            Self::NewConversation
                | Self::Referral
                | Self::WelcomeMessage
                | Self::Optin
                | Self::Optout
                | Self::MissedIncomingCall
                | Self::IncomingCall
        )
    }
}

/// A row in `channel_events`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ChannelEvent {
    pub id: ChannelEventID,
    pub uuid: Uuid,
    pub org_id: OrgID,
    pub event_type: ChannelEventType,
    pub status: ChannelEventStatus,
    pub channel_id: ChannelID,
    pub contact_id: ContactID,
    pub contact_urn_id: UrnID,
    pub optin_id: OptInID,
    pub extra: Option<Json<serde_json::Value>>,
    pub occurred_on: DateTime<Utc>,
    pub created_on: DateTime<Utc>,
}

impl ChannelEvent {
    pub fn new(
        org_id: OrgID,
        event_type: ChannelEventType,
        channel_id: ChannelID,
        contact_id: ContactID,
        urn_id: UrnID,
        occurred_on: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ChannelEventID(0),
            uuid: Uuid::new_v4(),
            org_id,
            event_type,
            status: ChannelEventStatus::Pending,
            channel_id,
            contact_id,
            contact_urn_id: urn_id,
            optin_id: OptInID(0),
            extra: None,
            occurred_on,
            created_on: Utc::now(),
        }
    }

    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = Some(Json(extra));
        self
    }

    pub fn with_optin(mut self, optin_id: OptInID) -> Self {
        self.optin_id = optin_id;
        self
    }

    /// The `extra` values as strings, which is how triggers see them.
    pub fn extra_strings(&self) -> Vec<(String, String)> {
        let Some(Json(serde_json::Value::Object(map))) = &self.extra else {
            return Vec::new();
        };
        map.iter()
            .map(|(k, v)| {
                let v = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), v)
            })
            .collect()
    }
}

/// Inserts a channel event, setting its id.
pub async fn insert_channel_event(conn: &mut PgConnection, event: &mut ChannelEvent) -> Result<()> {
    let (id,): (ChannelEventID,) = sqlx::query_as(
        r#"
        INSERT INTO channel_events (uuid, org_id, event_type, status, channel_id, contact_id,
                                    contact_urn_id, optin_id, extra, occurred_on, created_on)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING id
        "#,
    )
    .bind(event.uuid)
    .bind(event.org_id)
    .bind(event.event_type)
    .bind(event.status)
    .bind(event.channel_id)
    .bind(event.contact_id)
    .bind(event.contact_urn_id)
    .bind(event.optin_id)
    .bind(&event.extra)
    .bind(event.occurred_on)
    .bind(event.created_on)
    .fetch_one(&mut *conn)
    .await?;

    event.id = id;

    if event.event_type == ChannelEventType::StopContact {
        contact::update_contact_status(conn, &[(event.contact_id, ContactStatus::Stopped)]).await?;
    }

    Ok(())
}

/// Loads a channel event by id.
pub async fn load_channel_event<'e>(
    db: impl PgExecutor<'e>,
    org_id: OrgID,
    id: ChannelEventID,
) -> Result<ChannelEvent> {
    sqlx::query_as::<_, ChannelEvent>(
        r#"
        SELECT id, uuid, org_id, event_type, status, channel_id, contact_id, contact_urn_id, optin_id,
               extra, occurred_on, created_on
        FROM channel_events WHERE id = $1 AND org_id = $2
        "#,
    )
    .bind(id)
    .bind(org_id)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| CoreError::not_found("channel event", id))
}

/// Marks a channel event as handled.
pub async fn mark_channel_event_handled<'e>(db: impl PgExecutor<'e>, id: ChannelEventID) -> Result<()> {
    sqlx::query("UPDATE channel_events SET status = 'H' WHERE id = $1")
        .bind(id)
        .execute(db)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_types() {
        assert_eq!(ChannelEventType::MissedIncomingCall.code(), "mo_miss");
        assert_eq!(ChannelEventType::from_code("stop_contact"), Some(ChannelEventType::StopContact));
        assert!(ChannelEventType::Referral.is_triggerable());
        assert!(!ChannelEventType::StopContact.is_triggerable());
        assert!(!ChannelEventType::DeleteContact.is_triggerable());
    }

    #[test]
    fn test_extra_strings() {
        let event = ChannelEvent::new(
            OrgID(1),
            ChannelEventType::Referral,
            ChannelID(2),
            ContactID(3),
            UrnID(4),
            Utc::now(),
        )
        .with_extra(json!({"referrer_id": "acme", "count": 3}));

        let mut extra = event.extra_strings();
        extra.sort();
        assert_eq!(
            extra,
            vec![
                ("count".to_string(), "3".to_string()),
                ("referrer_id".to_string(), "acme".to_string())
            ]
        );
    }
}
