// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handing outgoing messages to the courier.
//!
//! Each channel has two Redis sorted sets of pending batches, one per priority, named
//! `msgs:{channelUUID}|{tps}/{1|0}`. Consecutive messages to the same contact go in one batch
//! so the courier sends them in order. Every queue written to is registered in `msgs:active`.
//!
//! This only ever runs after the transaction that created the messages has committed.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::assets::OrgAssets;
use crate::error::Result;
use crate::models::ids::{ChannelID, ContactID, FlowID, MsgID, OrgID, UrnID};
use crate::models::msg::{self, OutgoingMsg};
use crate::models::template::MsgTemplating;
use crate::runtime::Runtime;

/// The set of queues with pending batches.
pub const ACTIVE_QUEUES_KEY: &str = "msgs:active";

/// The queue for a channel and priority.
pub fn queue_key(channel_uuid: Uuid, tps: i32, high_priority: bool) -> String {
    format!("msgs:{}|{}/{}", channel_uuid, tps, if high_priority { 1 } else { 0 })
}

/// A message as the courier reads it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CourierMsg {
    pub id: MsgID,
    pub uuid: Uuid,
    pub org_id: OrgID,
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub quick_replies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub templating: Option<MsgTemplating>,
    pub high_priority: bool,
    pub channel_id: ChannelID,
    pub channel_uuid: Uuid,
    pub contact_id: ContactID,
    pub contact_uuid: Uuid,
    pub contact_urn_id: UrnID,
    pub urn: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub urn_auth_tokens: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_to_id: Option<MsgID>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_to_external_id: Option<String>,
    pub flow_id: FlowID,
    pub msg_count: i32,
    pub error_count: i32,
    pub is_resend: bool,
    pub created_on: DateTime<Utc>,
}

impl CourierMsg {
    /// The payload for a message, if it has a destination.
    pub fn new(m: &OutgoingMsg) -> Option<Self> {
        let channel = m.channel.as_ref()?;
        let urn = m.urn.as_ref()?;

        Some(Self {
            id: m.msg.id,
            uuid: m.msg.uuid,
            org_id: m.msg.org_id,
            text: m.msg.text.clone(),
            attachments: m.msg.attachments.clone(),
            quick_replies: m.msg.quick_replies.clone(),
            locale: m.msg.locale.clone(),
            templating: m.msg.templating.as_ref().map(|t| t.0.clone()),
            high_priority: m.msg.high_priority,
            channel_id: channel.id,
            channel_uuid: channel.uuid,
            contact_id: m.msg.contact_id,
            contact_uuid: m.contact_uuid,
            contact_urn_id: urn.id,
            urn: urn.urn().to_string(),
            urn_auth_tokens: urn.auth_tokens(),
            response_to_id: m.reply_to.as_ref().map(|r| r.id),
            response_to_external_id: m.reply_to.as_ref().and_then(|r| r.external_id.clone()),
            flow_id: m.msg.flow_id,
            msg_count: m.msg.msg_count,
            error_count: m.msg.error_count,
            is_resend: m.is_resend,
            created_on: m.msg.created_on,
        })
    }
}

/// A run of messages for one contact on one queue.
#[derive(Debug)]
struct Batch<'a> {
    queue: String,
    msgs: Vec<&'a OutgoingMsg>,
}

/// Groups queueable messages into per-contact batches, keeping their order.
fn batch_messages<'a>(msgs: &[&'a OutgoingMsg]) -> Vec<Batch<'a>> {
    let mut batches: Vec<Batch<'a>> = Vec::new();
    let mut last_contact = None;

    for m in msgs.iter().copied().filter(|m| m.is_queueable()) {
        let Some(channel) = &m.channel else { continue };
        let queue = queue_key(channel.uuid, channel.tps, m.msg.high_priority);

        match batches.last_mut() {
            Some(b) if b.queue == queue && last_contact == Some(m.msg.contact_id) => b.msgs.push(m),
            _ => batches.push(Batch { queue, msgs: vec![m] }),
        }
        last_contact = Some(m.msg.contact_id);
    }

    batches
}

/// Publishes messages to their channels' queues. Messages that aren't queued, or are for
/// Android relays, are skipped. When publishing fails the messages are marked to be retried
/// later instead. Returns the ids of the messages published.
#[instrument(skip_all, fields(org_id = %oa.org_id()))]
pub async fn queue_messages(rt: &Runtime, oa: &OrgAssets, msgs: &[&OutgoingMsg]) -> Result<Vec<MsgID>> {
    let batches = batch_messages(msgs);
    if batches.is_empty() {
        return Ok(Vec::new());
    }

    let now = Utc::now().timestamp_micros() as f64 / 1_000_000.0;
    let mut pipe = redis::pipe();
    let mut ids = Vec::new();

    for (i, batch) in batches.iter().enumerate() {
        let payload: Vec<CourierMsg> = batch.msgs.iter().filter_map(|m| CourierMsg::new(m)).collect();
        let score = format!("{:.6}", now + i as f64 * 0.000001);

        pipe.cmd("ZADD")
            .arg(&batch.queue)
            .arg(score)
            .arg(serde_json::to_string(&payload)?)
            .ignore();
        pipe.cmd("ZINCRBY").arg(ACTIVE_QUEUES_KEY).arg(0).arg(&batch.queue).ignore();

        ids.extend(batch.msgs.iter().map(|m| m.msg.id));
    }

    let published: Result<()> = async {
        let mut conn = rt.redis.get_multiplexed_async_connection().await?;
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
    .await;

    if let Err(e) = published {
        error!(error = %e, msgs = ids.len(), "Error queuing messages to courier, will retry");
        msg::mark_messages_for_requeuing(&rt.db, &ids).await?;
        return Ok(Vec::new());
    }

    debug!(msgs = ids.len(), batches = batches.len(), "Queued messages to courier");
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::channel::tests::channel;
    use crate::models::msg::{Msg, MsgStatus};
    use crate::models::urn::ContactUrn;
    use sqlx::types::Json;

    fn outgoing(id: i64, contact_id: i64, ch: &crate::models::channel::Channel, high: bool) -> OutgoingMsg {
        let mut msg = crate::models::msg::new_incoming_ivr(
            OrgID(1),
            ch.id,
            ContactID(contact_id),
            UrnID(contact_id),
            "hello",
            &[],
        );
        msg.id = MsgID(id);
        msg.direction = crate::models::msg::MsgDirection::Out;
        msg.status = MsgStatus::Queued;
        msg.high_priority = high;

        OutgoingMsg {
            msg,
            urn: Some(ContactUrn {
                id: UrnID(contact_id),
                org_id: OrgID(1),
                contact_id: ContactID(contact_id),
                identity: format!("tel:+1605574000{}", contact_id),
                scheme: "tel".to_string(),
                path: format!("+1605574000{}", contact_id),
                display: None,
                priority: 1000,
                channel_id: ch.id,
                auth_tokens: Some(Json(HashMap::from([("token".to_string(), "abc".to_string())]))),
            }),
            channel: Some(ch.clone()),
            contact_uuid: Uuid::new_v4(),
            reply_to: None,
            is_resend: false,
        }
    }

    fn failed(mut m: OutgoingMsg) -> OutgoingMsg {
        m.msg = Msg {
            status: MsgStatus::Failed,
            ..m.msg
        };
        m
    }

    #[test]
    fn test_queue_key() {
        let uuid = Uuid::parse_str("74729f45-7f29-4868-9dc4-90e491e3c7d8").unwrap();
        assert_eq!(queue_key(uuid, 10, true), "msgs:74729f45-7f29-4868-9dc4-90e491e3c7d8|10/1");
        assert_eq!(queue_key(uuid, 50, false), "msgs:74729f45-7f29-4868-9dc4-90e491e3c7d8|50/0");
    }

    #[test]
    fn test_batching() {
        let twilio = channel(1, "T", &["tel"], "SR");
        let android = channel(2, "A", &["tel"], "SR");

        let m1 = outgoing(1, 10, &twilio, false);
        let m2 = outgoing(2, 10, &twilio, false);
        let m3 = outgoing(3, 11, &twilio, false);
        let m4 = outgoing(4, 11, &twilio, true);
        let m5 = outgoing(5, 12, &android, false);
        let m6 = failed(outgoing(6, 12, &twilio, false));

        let batches = batch_messages(&[&m1, &m2, &m3, &m4, &m5, &m6]);
        let ids: Vec<Vec<i64>> = batches
            .iter()
            .map(|b| b.msgs.iter().map(|m| m.msg.id.0).collect())
            .collect();
        assert_eq!(ids, vec![vec![1, 2], vec![3], vec![4]]);
        assert!(batches[2].queue.ends_with("/1"));
    }

    #[test]
    fn test_payload() {
        let ch = channel(1, "T", &["tel"], "SR");
        let mut m = outgoing(1, 10, &ch, false);
        m.reply_to = Some(crate::models::msg::ReplyTo {
            id: MsgID(99),
            external_id: Some("ext-99".to_string()),
        });

        let payload = serde_json::to_value(CourierMsg::new(&m).unwrap()).unwrap();
        assert_eq!(payload["id"], 1);
        assert_eq!(payload["urn"], "tel:+160557400010");
        assert_eq!(payload["channel_uuid"], ch.uuid.to_string());
        assert_eq!(payload["urn_auth_tokens"]["token"], "abc");
        assert_eq!(payload["response_to_id"], 99);
        assert_eq!(payload["response_to_external_id"], "ext-99");
        assert!(payload.get("attachments").is_none());

        m.urn = None;
        assert!(CourierMsg::new(&m).is_none());
    }
}
