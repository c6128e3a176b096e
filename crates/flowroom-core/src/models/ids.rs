// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Nullable numeric identifiers.
//!
//! Every sequence ID is a newtype over `i64` where `0` is the nil sentinel. Nil IDs are
//! stored as SQL `NULL`, decoded from `NULL` back to `0`, and serialized to JSON `null`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArgumentBuffer, PgHasArrayType, PgTypeInfo, PgValueRef};
use sqlx::{Decode, Encode, Postgres, Type, ValueRef};

macro_rules! nullable_id {
    ($(#[$meta:meta])* $name:ident, $nil:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub i64);

        #[doc = concat!("The nil value for [`", stringify!($name), "`].")]
        pub const $nil: $name = $name(0);

        impl $name {
            /// Whether this is the nil sentinel.
            pub fn is_nil(self) -> bool {
                self.0 == 0
            }

            /// `None` for nil, the raw value otherwise.
            pub fn as_option(self) -> Option<i64> {
                if self.is_nil() { None } else { Some(self.0) }
            }
        }

        impl From<i64> for $name {
            fn from(v: i64) -> Self {
                Self(v)
            }
        }

        impl From<Option<i64>> for $name {
            fn from(v: Option<i64>) -> Self {
                Self(v.unwrap_or(0))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> ::std::result::Result<S::Ok, S::Error> {
                self.as_option().serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> ::std::result::Result<Self, D::Error> {
                Ok(Self(Option::<i64>::deserialize(deserializer)?.unwrap_or(0)))
            }
        }

        impl Type<Postgres> for $name {
            fn type_info() -> PgTypeInfo {
                <i64 as Type<Postgres>>::type_info()
            }

            fn compatible(ty: &PgTypeInfo) -> bool {
                <i64 as Type<Postgres>>::compatible(ty)
            }
        }

        impl PgHasArrayType for $name {
            fn array_type_info() -> PgTypeInfo {
                <i64 as PgHasArrayType>::array_type_info()
            }
        }

        impl Encode<'_, Postgres> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> ::std::result::Result<IsNull, BoxDynError> {
                if self.is_nil() {
                    return Ok(IsNull::Yes);
                }
                <i64 as Encode<Postgres>>::encode_by_ref(&self.0, buf)
            }
        }

        impl<'r> Decode<'r, Postgres> for $name {
            fn decode(value: PgValueRef<'r>) -> ::std::result::Result<Self, BoxDynError> {
                if value.is_null() {
                    return Ok(Self(0));
                }
                Ok(Self(<i64 as Decode<Postgres>>::decode(value)?))
            }
        }
    };
}

nullable_id!(
    /// Identifies an org.
    OrgID, NIL_ORG_ID
);
nullable_id!(
    /// Identifies a user.
    UserID, NIL_USER_ID
);
nullable_id!(
    /// Identifies a channel.
    ChannelID, NIL_CHANNEL_ID
);
nullable_id!(
    /// Identifies a contact.
    ContactID, NIL_CONTACT_ID
);
nullable_id!(
    /// Identifies a contact URN row.
    UrnID, NIL_URN_ID
);
nullable_id!(
    /// Identifies a contact group.
    GroupID, NIL_GROUP_ID
);
nullable_id!(
    /// Identifies a contact field.
    FieldID, NIL_FIELD_ID
);
nullable_id!(
    /// Identifies a flow.
    FlowID, NIL_FLOW_ID
);
nullable_id!(
    /// Identifies a flow run.
    RunID, NIL_RUN_ID
);
nullable_id!(
    /// Identifies a flow start.
    StartID, NIL_START_ID
);
nullable_id!(
    /// Identifies a campaign.
    CampaignID, NIL_CAMPAIGN_ID
);
nullable_id!(
    /// Identifies a campaign point.
    PointID, NIL_POINT_ID
);
nullable_id!(
    /// Identifies a contact fire.
    FireID, NIL_FIRE_ID
);
nullable_id!(
    /// Identifies a message.
    MsgID, NIL_MSG_ID
);
nullable_id!(
    /// Identifies a broadcast.
    BroadcastID, NIL_BROADCAST_ID
);
nullable_id!(
    /// Identifies a ticket.
    TicketID, NIL_TICKET_ID
);
nullable_id!(
    /// Identifies a ticket topic.
    TopicID, NIL_TOPIC_ID
);
nullable_id!(
    /// Identifies a label.
    LabelID, NIL_LABEL_ID
);
nullable_id!(
    /// Identifies an optin.
    OptInID, NIL_OPTIN_ID
);
nullable_id!(
    /// Identifies a template.
    TemplateID, NIL_TEMPLATE_ID
);
nullable_id!(
    /// Identifies a classifier.
    ClassifierID, NIL_CLASSIFIER_ID
);
nullable_id!(
    /// Identifies an LLM.
    LlmID, NIL_LLM_ID
);
nullable_id!(
    /// Identifies an IVR call.
    CallID, NIL_CALL_ID
);
nullable_id!(
    /// Identifies a channel event.
    ChannelEventID, NIL_CHANNEL_EVENT_ID
);
nullable_id!(
    /// Identifies an incident.
    IncidentID, NIL_INCIDENT_ID
);
nullable_id!(
    /// Identifies an airtime transfer.
    AirtimeTransferID, NIL_AIRTIME_TRANSFER_ID
);
nullable_id!(
    /// Identifies a contact import.
    ImportID, NIL_IMPORT_ID
);
nullable_id!(
    /// Identifies a contact import batch.
    ImportBatchID, NIL_IMPORT_BATCH_ID
);

/// Converts a slice of IDs to raw values for binding as an array.
pub fn raw_ids<T: Copy + Into<i64>>(ids: &[T]) -> Vec<i64> {
    ids.iter().map(|id| (*id).into()).collect()
}

macro_rules! into_raw {
    ($($name:ident),*) => {
        $(impl From<$name> for i64 {
            fn from(id: $name) -> i64 {
                id.0
            }
        })*
    };
}

into_raw!(
    OrgID, UserID, ChannelID, ContactID, UrnID, GroupID, FieldID, FlowID, RunID, StartID,
    CampaignID, PointID, FireID, MsgID, BroadcastID, TicketID, TopicID, LabelID, OptInID,
    TemplateID, ClassifierID, LlmID, CallID, ChannelEventID, IncidentID, AirtimeTransferID,
    ImportID, ImportBatchID
);

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Holder {
        flow_id: FlowID,
        contact_id: ContactID,
    }

    #[test]
    fn test_nil_serializes_to_null() {
        let h = Holder {
            flow_id: NIL_FLOW_ID,
            contact_id: ContactID(42),
        };
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, r#"{"flow_id":null,"contact_id":42}"#);

        let back: Holder = serde_json::from_str(&json).unwrap();
        assert!(back.flow_id.is_nil());
        assert_eq!(back.contact_id, ContactID(42));
    }

    #[test]
    fn test_option_conversions() {
        assert_eq!(ChannelID::from(None), NIL_CHANNEL_ID);
        assert_eq!(ChannelID::from(Some(7)).as_option(), Some(7));
        assert_eq!(NIL_CHANNEL_ID.as_option(), None);
        assert_eq!(raw_ids(&[ContactID(1), ContactID(3)]), vec![1, 3]);
    }
}
