// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Channels, the bound messaging endpoints messages are sent and received on.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use super::ids::{ChannelID, OrgID};
use super::urn::Urn;
use crate::error::Result;

/// The channel type code for Android relay phones, which sync rather than being pushed to.
pub const ANDROID_TYPE: &str = "A";

/// Channel types whose providers accept pre-approved message templates.
const TEMPLATING_TYPES: &[&str] = &["WA", "WAC", "D3C", "TWA"];

code_enum! {
    /// Something a channel can do.
    pub enum ChannelRole {
        Send = ("S", "send"),
        Receive = ("R", "receive"),
        Call = ("C", "call"),
        Answer = ("A", "answer"),
    }
}

code_enum! {
    /// Which interactions of a channel get logged.
    pub enum LogPolicy {
        None = ("N", "none"),
        Errors = ("E", "errors"),
        All = ("A", "all"),
    }
}

/// A messaging endpoint owned by an org.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Channel {
    pub id: ChannelID,
    pub uuid: Uuid,
    pub org_id: OrgID,
    pub name: String,
    pub address: String,
    pub channel_type: String,
    pub country: Option<String>,
    pub schemes: Vec<String>,
    pub role: String,
    pub tps: i32,
    pub parent_id: ChannelID,
    pub config: Json<serde_json::Value>,
    pub log_policy: LogPolicy,
}

/// A channel as referenced by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelRef {
    pub uuid: Uuid,
    pub name: String,
}

impl Channel {
    pub fn reference(&self) -> ChannelRef {
        ChannelRef {
            uuid: self.uuid,
            name: self.name.clone(),
        }
    }

    /// Whether this channel has the given role.
    pub fn has_role(&self, role: ChannelRole) -> bool {
        self.role.contains(role.code())
    }

    /// Whether this channel can send to the given scheme.
    pub fn supports_scheme(&self, scheme: &str) -> bool {
        self.schemes.iter().any(|s| s == scheme)
    }

    /// Whether this channel is an Android relay.
    pub fn is_android(&self) -> bool {
        self.channel_type == ANDROID_TYPE
    }

    /// Whether this channel's provider supports templated messages.
    pub fn supports_templating(&self) -> bool {
        TEMPLATING_TYPES.contains(&self.channel_type.as_str())
    }

    /// Config values that must never appear in logs.
    pub fn secret_values(&self) -> Vec<String> {
        const SECRET_KEYS: &[&str] = &["auth_token", "api_key", "secret", "password", "token"];

        SECRET_KEYS
            .iter()
            .filter_map(|k| self.config.0.get(*k).and_then(|v| v.as_str()))
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Picks the channel to send to `urn` on, preferring `preferred` when it can.
pub fn channel_for_urn<'a>(
    channels: &'a [Channel],
    urn: &Urn,
    preferred: ChannelID,
) -> Option<&'a Channel> {
    let can_send =
        |c: &&Channel| c.has_role(ChannelRole::Send) && c.supports_scheme(&urn.scheme);

    if !preferred.is_nil() {
        if let Some(ch) = channels.iter().filter(can_send).find(|c| c.id == preferred) {
            return Some(ch);
        }
    }

    channels.iter().find(can_send)
}

/// Loads the active channels of an org.
pub async fn load_channels(pool: &PgPool, org_id: OrgID) -> Result<Vec<Channel>> {
    let channels = sqlx::query_as::<_, Channel>(
        r#"
        SELECT id, uuid, org_id, name, address, channel_type, country, schemes, role, tps,
               parent_id, config, log_policy
        FROM channels
        WHERE org_id = $1 AND is_active
        ORDER BY id
        "#,
    )
    .bind(org_id)
    .fetch_all(pool)
    .await?;

    Ok(channels)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn channel(id: i64, channel_type: &str, schemes: &[&str], role: &str) -> Channel {
        Channel {
            id: ChannelID(id),
            uuid: Uuid::new_v4(),
            org_id: OrgID(1),
            name: format!("Channel {}", id),
            address: "+12065551212".to_string(),
            channel_type: channel_type.to_string(),
            country: Some("US".to_string()),
            schemes: schemes.iter().map(|s| s.to_string()).collect(),
            role: role.to_string(),
            tps: 10,
            parent_id: ChannelID(0),
            config: Json(serde_json::json!({"auth_token": "sesame", "callback_domain": "x.com"})),
            log_policy: LogPolicy::All,
        }
    }

    #[test]
    fn test_roles_and_features() {
        let ch = channel(1, "T", &["tel"], "SR");
        assert!(ch.has_role(ChannelRole::Send));
        assert!(ch.has_role(ChannelRole::Receive));
        assert!(!ch.has_role(ChannelRole::Call));
        assert!(ch.supports_scheme("tel"));
        assert!(!ch.is_android());
        assert!(!ch.supports_templating());
        assert_eq!(ch.secret_values(), vec!["sesame".to_string()]);

        assert!(channel(2, "A", &["tel"], "SR").is_android());
        assert!(channel(3, "WA", &["whatsapp"], "SR").supports_templating());
    }

    #[test]
    fn test_channel_for_urn() {
        let channels = vec![
            channel(1, "T", &["tel"], "SR"),
            channel(2, "TG", &["telegram"], "SR"),
            channel(3, "T", &["tel"], "SR"),
            channel(4, "T", &["tel"], "R"),
        ];
        let tel = Urn::new("tel", "+16055741111");

        assert_eq!(channel_for_urn(&channels, &tel, ChannelID(0)).map(|c| c.id.0), Some(1));
        assert_eq!(channel_for_urn(&channels, &tel, ChannelID(3)).map(|c| c.id.0), Some(3));
        // receive-only channels are never used for sending
        assert_eq!(channel_for_urn(&channels, &tel, ChannelID(4)).map(|c| c.id.0), Some(1));
        assert!(channel_for_urn(&channels, &Urn::new("whatsapp", "1234"), ChannelID(0)).is_none());
    }
}
