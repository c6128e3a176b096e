// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Messages.
//!
//! Outgoing messages are built from what the engine produced plus the channel and URN they go
//! out on. Whether they can actually be sent is decided here: blocked contacts, missing
//! destinations, suspended orgs and looping flows all produce failed messages rather than
//! errors, so the contact's history still shows them.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::Serialize;
use sqlx::types::Json;
use sqlx::{PgConnection, PgExecutor, PgPool};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::channel::{self, Channel};
use super::contact::{Contact, ContactStatus};
use super::ids::{
    BroadcastID, ChannelID, ContactID, FlowID, MsgID, OptInID, OrgID, TemplateID, TicketID, UrnID,
    UserID, raw_ids,
};
use super::template::MsgTemplating;
use super::urn::{ContactUrn, Urn};
use crate::assets::OrgAssets;
use crate::engine::{self, Engine, MsgOut, UnsendableReason};
use crate::error::{CoreError, Result};
use crate::gsm7;

/// How long a message waits before the retrier requeues it.
pub const REQUEUE_DELAY_MINUTES: i64 = 10;
/// Messages failed per statement when failing a channel's backlog.
pub const FAIL_BATCH_SIZE: i64 = 1000;
/// Length of the text prefix the repetition limiter compares.
pub const REPETITION_TEXT_CHARS: usize = 128;
/// Lifetime of a repetition bucket.
pub const REPETITION_TTL_SECS: i64 = 300;

code_enum! {
    pub enum MsgDirection {
        In = ("I", "in"),
        Out = ("O", "out"),
    }
}

code_enum! {
    pub enum MsgStatus {
        Pending = ("P", "pending"),
        Handled = ("H", "handled"),
        Initializing = ("I", "initializing"),
        Queued = ("Q", "queued"),
        Wired = ("W", "wired"),
        Sent = ("S", "sent"),
        Delivered = ("D", "delivered"),
        Read = ("R", "read"),
        Errored = ("E", "errored"),
        Failed = ("F", "failed"),
    }
}

code_enum! {
    pub enum MsgVisibility {
        Visible = ("V", "visible"),
        Archived = ("A", "archived"),
        DeletedBySender = ("X", "deleted_by_sender"),
        DeletedByUser = ("D", "deleted_by_user"),
    }
}

code_enum! {
    pub enum MsgType {
        Text = ("T", "text"),
        Voice = ("V", "voice"),
        Optin = ("O", "optin"),
    }
}

code_enum! {
    pub enum FailedReason {
        Suspended = ("S", "suspended"),
        Contact = ("C", "contact"),
        Looping = ("L", "looping"),
        ErrorLimit = ("E", "error_limit"),
        TooOld = ("O", "too_old"),
        NoDestination = ("D", "no_destination"),
        ChannelRemoved = ("R", "channel_removed"),
    }
}

impl From<UnsendableReason> for FailedReason {
    fn from(r: UnsendableReason) -> Self {
        match r {
            UnsendableReason::ContactStatus => FailedReason::Contact,
            UnsendableReason::NoDestination => FailedReason::NoDestination,
        }
    }
}

/// Where an outgoing message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgOrigin {
    Flow(FlowID),
    Broadcast(BroadcastID),
    Chat { ticket_id: TicketID, user_id: UserID },
    Optin(OptInID),
}

/// A row in `msgs`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Msg {
    pub id: MsgID,
    pub uuid: Uuid,
    pub org_id: OrgID,
    pub direction: MsgDirection,
    pub status: MsgStatus,
    pub visibility: MsgVisibility,
    pub msg_type: MsgType,
    pub text: String,
    pub attachments: Vec<String>,
    pub quick_replies: Vec<String>,
    pub locale: Option<String>,
    pub templating: Option<Json<MsgTemplating>>,
    pub high_priority: bool,
    pub channel_id: ChannelID,
    pub contact_id: ContactID,
    pub contact_urn_id: UrnID,
    pub error_count: i32,
    pub next_attempt: Option<DateTime<Utc>>,
    pub failed_reason: Option<FailedReason>,
    pub msg_count: i32,
    pub broadcast_id: BroadcastID,
    pub flow_id: FlowID,
    pub ticket_id: TicketID,
    pub optin_id: OptInID,
    pub created_by_id: UserID,
    pub external_id: Option<String>,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
    pub sent_on: Option<DateTime<Utc>>,
}

impl Msg {
    fn blank(org_id: OrgID, direction: MsgDirection, status: MsgStatus, contact_id: ContactID) -> Self {
        let now = Utc::now();
        Self {
            id: MsgID(0),
            uuid: Uuid::new_v4(),
            org_id,
            direction,
            status,
            visibility: MsgVisibility::Visible,
            msg_type: MsgType::Text,
            text: String::new(),
            attachments: Vec::new(),
            quick_replies: Vec::new(),
            locale: None,
            templating: None,
            high_priority: false,
            channel_id: ChannelID(0),
            contact_id,
            contact_urn_id: UrnID(0),
            error_count: 0,
            next_attempt: None,
            failed_reason: None,
            msg_count: 1,
            broadcast_id: BroadcastID(0),
            flow_id: FlowID(0),
            ticket_id: TicketID(0),
            optin_id: OptInID(0),
            created_by_id: UserID(0),
            external_id: None,
            created_on: now,
            modified_on: now,
            sent_on: None,
        }
    }

    fn fail(&mut self, reason: FailedReason) {
        self.status = MsgStatus::Failed;
        self.failed_reason = Some(reason);
    }
}

/// An outgoing message with what the courier needs to send it.
#[derive(Debug, Clone)]
pub struct OutgoingMsg {
    pub msg: Msg,
    pub urn: Option<ContactUrn>,
    pub channel: Option<Channel>,
    pub contact_uuid: Uuid,
    /// The incoming message this replies to, if any.
    pub reply_to: Option<ReplyTo>,
    pub is_resend: bool,
}

/// The incoming message an outgoing message responds to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplyTo {
    pub id: MsgID,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

impl OutgoingMsg {
    /// Whether this message should be handed to the courier.
    pub fn is_queueable(&self) -> bool {
        self.msg.status == MsgStatus::Queued
            && self.channel.as_ref().is_some_and(|c| !c.is_android())
    }
}

/// The Redis key of the repetition bucket containing `now`, aligned to 5 minutes.
pub fn repetition_key(now: DateTime<Utc>) -> String {
    let minute = now.minute() - now.minute() % 5;
    format!("msg_repetitions:{}:{:02}", now.format("%Y-%m-%dT%H"), minute)
}

/// The field of a contact and text within a repetition bucket.
pub fn repetition_field(contact_id: ContactID, text: &str) -> String {
    let prefix: String = text.to_lowercase().chars().take(REPETITION_TEXT_CHARS).collect();
    format!("{}|{}", contact_id, prefix)
}

const REPETITION_SCRIPT: &str = r#"
local key, field, ttl = KEYS[1], ARGV[1], tonumber(ARGV[2])
local count = redis.call("HINCRBY", key, field, 1)
if count == 1 then
    redis.call("EXPIRE", key, ttl)
end
return count
"#;

/// Counts another send of `text` to a contact in the current bucket, returning the new count.
pub async fn increment_repetitions(
    redis: &redis::Client,
    contact_id: ContactID,
    text: &str,
    now: DateTime<Utc>,
) -> Result<i64> {
    let mut conn = redis.get_multiplexed_async_connection().await?;
    let count: i64 = redis::Script::new(REPETITION_SCRIPT)
        .key(repetition_key(now))
        .arg(repetition_field(contact_id, text))
        .arg(REPETITION_TTL_SECS)
        .invoke_async(&mut conn)
        .await?;
    Ok(count)
}

/// Makes an attachment URL absolute. `geo:` and absolute URLs are left alone.
pub fn normalize_attachment(attachment: &str, domain: &str) -> String {
    let Some((content_type, url)) = attachment.split_once(':') else {
        return attachment.to_string();
    };
    if content_type == "geo" || url.starts_with("http://") || url.starts_with("https://") {
        return attachment.to_string();
    }
    format!("{}:https://{}/{}", content_type, domain, url.trim_start_matches('/'))
}

/// Options for building an outgoing message.
#[derive(Debug, Clone)]
pub struct MsgOutOptions<'a> {
    pub origin: MsgOrigin,
    pub reply_to: Option<ReplyTo>,
    pub msg_type: MsgType,
    pub attachment_domain: &'a str,
    pub max_repetitions: i64,
}

/// Builds the row for a message the engine created.
#[instrument(skip_all, fields(contact_id = %contact.id))]
pub async fn new_msg_out(
    redis: &redis::Client,
    oa: &OrgAssets,
    contact: &Contact,
    out: &MsgOut,
    opts: MsgOutOptions<'_>,
) -> Result<OutgoingMsg> {
    let mut msg = Msg::blank(oa.org_id(), MsgDirection::Out, MsgStatus::Queued, contact.id);
    msg.uuid = out.uuid;
    msg.msg_type = opts.msg_type;
    msg.text = out.text.clone();
    msg.attachments = out
        .attachments
        .iter()
        .map(|a| normalize_attachment(a, opts.attachment_domain))
        .collect();
    msg.quick_replies = out.quick_replies.clone();
    msg.locale = out.locale.clone();
    msg.templating = out.templating.clone().map(Json);
    msg.high_priority = opts.reply_to.is_some() || matches!(opts.origin, MsgOrigin::Chat { .. });

    match opts.origin {
        MsgOrigin::Flow(id) => msg.flow_id = id,
        MsgOrigin::Broadcast(id) => msg.broadcast_id = id,
        MsgOrigin::Chat { ticket_id, user_id } => {
            msg.ticket_id = ticket_id;
            msg.created_by_id = user_id;
        }
        MsgOrigin::Optin(id) => msg.optin_id = id,
    }

    let channel = out
        .channel
        .as_ref()
        .and_then(|c| oa.channel_by_uuid(c.uuid))
        .cloned();
    let urn = out.urn.as_deref().and_then(|u| Urn::parse(u).ok());
    let contact_urn = urn
        .as_ref()
        .and_then(|u| contact.urn_by_identity(&u.identity()))
        .cloned();

    msg.channel_id = channel.as_ref().map(|c| c.id).unwrap_or_default();
    msg.contact_urn_id = contact_urn.as_ref().map(|u| u.id).unwrap_or_default();

    if let Some(urn) = &urn {
        if urn.scheme == "tel" {
            msg.msg_count = (gsm7::segments(&msg.text) + msg.attachments.len()) as i32;
        }
    }

    if let Some(reason) = out.unsendable_reason {
        msg.fail(reason.into());
    } else if oa.org().is_suspended {
        msg.fail(FailedReason::Suspended);
    } else if channel.is_none() || contact_urn.is_none() {
        msg.fail(FailedReason::NoDestination);
    } else if !msg.text.is_empty() {
        let count = increment_repetitions(redis, contact.id, &msg.text, Utc::now()).await?;
        if count > opts.max_repetitions {
            error!(
                contact_id = %contact.id,
                text = %msg.text,
                repetitions = count,
                "Too many repetitions, failing message due to looping"
            );
            msg.fail(FailedReason::Looping);
        }
    }

    Ok(OutgoingMsg {
        msg,
        urn: contact_urn,
        channel,
        contact_uuid: contact.uuid,
        reply_to: opts.reply_to,
        is_resend: false,
    })
}

/// Builds the row for a message synced from an Android relay phone, handled later.
pub fn new_incoming_android(
    org_id: OrgID,
    channel_id: ChannelID,
    contact_id: ContactID,
    urn_id: UrnID,
    text: &str,
    external_id: Option<&str>,
    received_on: DateTime<Utc>,
) -> Msg {
    let mut msg = Msg::blank(org_id, MsgDirection::In, MsgStatus::Pending, contact_id);
    msg.channel_id = channel_id;
    msg.contact_urn_id = urn_id;
    msg.text = text.to_string();
    msg.external_id = external_id.map(str::to_string);
    msg.sent_on = Some(received_on);
    msg
}

/// Builds the row for input gathered on a call, which is handled as it's received.
pub fn new_incoming_ivr(
    org_id: OrgID,
    channel_id: ChannelID,
    contact_id: ContactID,
    urn_id: UrnID,
    text: &str,
    attachments: &[String],
) -> Msg {
    let mut msg = Msg::blank(org_id, MsgDirection::In, MsgStatus::Handled, contact_id);
    msg.msg_type = MsgType::Voice;
    msg.channel_id = channel_id;
    msg.contact_urn_id = urn_id;
    msg.text = text.to_string();
    msg.attachments = attachments.to_vec();
    msg
}

/// Inserts messages, setting their ids.
pub async fn insert_messages(conn: &mut PgConnection, msgs: &mut [&mut Msg]) -> Result<()> {
    for msg in msgs.iter_mut() {
        let (id,): (MsgID,) = sqlx::query_as(
            r#"
            INSERT INTO msgs (uuid, org_id, direction, status, visibility, msg_type, text, attachments,
                              quick_replies, locale, templating, high_priority, channel_id, contact_id,
                              contact_urn_id, error_count, next_attempt, failed_reason, msg_count,
                              broadcast_id, flow_id, ticket_id, optin_id, created_by_id, external_id,
                              created_on, modified_on, sent_on)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
                    $19, $20, $21, $22, $23, $24, $25, $26, $27, $28)
            RETURNING id
            "#,
        )
        .bind(msg.uuid)
        .bind(msg.org_id)
        .bind(msg.direction)
        .bind(msg.status)
        .bind(msg.visibility)
        .bind(msg.msg_type)
        .bind(&msg.text)
        .bind(&msg.attachments)
        .bind(&msg.quick_replies)
        .bind(&msg.locale)
        .bind(&msg.templating)
        .bind(msg.high_priority)
        .bind(msg.channel_id)
        .bind(msg.contact_id)
        .bind(msg.contact_urn_id)
        .bind(msg.error_count)
        .bind(msg.next_attempt)
        .bind(msg.failed_reason)
        .bind(msg.msg_count)
        .bind(msg.broadcast_id)
        .bind(msg.flow_id)
        .bind(msg.ticket_id)
        .bind(msg.optin_id)
        .bind(msg.created_by_id)
        .bind(&msg.external_id)
        .bind(msg.created_on)
        .bind(msg.modified_on)
        .bind(msg.sent_on)
        .fetch_one(&mut *conn)
        .await?;

        msg.id = id;
    }

    Ok(())
}

const SELECT_MSGS: &str = r#"
    SELECT id, uuid, org_id, direction, status, visibility, msg_type, text, attachments, quick_replies,
           locale, templating, high_priority, channel_id, contact_id, contact_urn_id, error_count,
           next_attempt, failed_reason, msg_count, broadcast_id, flow_id, ticket_id, optin_id,
           created_by_id, external_id, created_on, modified_on, sent_on
    FROM msgs
"#;

/// Loads messages of an org by id and direction.
pub async fn load_messages<'e>(
    db: impl PgExecutor<'e>,
    org_id: OrgID,
    direction: MsgDirection,
    ids: &[MsgID],
) -> Result<Vec<Msg>> {
    let msgs = sqlx::query_as::<_, Msg>(&format!(
        "{SELECT_MSGS} WHERE id = ANY($1) AND org_id = $2 AND direction = $3 ORDER BY id"
    ))
    .bind(raw_ids(ids))
    .bind(org_id)
    .bind(direction)
    .fetch_all(db)
    .await?;

    Ok(msgs)
}

/// Claims outgoing messages that are due a retry: initializing messages past their next
/// attempt and pending resends.
pub async fn load_messages_for_retry(conn: &mut PgConnection, limit: i64) -> Result<Vec<Msg>> {
    let msgs = sqlx::query_as::<_, Msg>(&format!(
        r#"{SELECT_MSGS}
        WHERE direction = 'O' AND (
            (status = 'I' AND next_attempt <= NOW()) OR
            (status = 'P' AND next_attempt IS NOT NULL AND next_attempt <= NOW())
        )
        ORDER BY next_attempt, id
        LIMIT $1
        FOR UPDATE SKIP LOCKED"#
    ))
    .bind(limit)
    .fetch_all(conn)
    .await?;

    Ok(msgs)
}

/// Loads URN rows by id.
pub async fn load_urns<'e>(db: impl PgExecutor<'e>, ids: &[UrnID]) -> Result<Vec<ContactUrn>> {
    let urns = sqlx::query_as::<_, ContactUrn>(
        r#"
        SELECT id, org_id, contact_id, identity, scheme, path, display, priority, channel_id, auth_tokens
        FROM contact_urns WHERE id = ANY($1)
        "#,
    )
    .bind(raw_ids(ids))
    .fetch_all(db)
    .await?;

    Ok(urns)
}

/// Marks messages to be picked up again by the retrier in [`REQUEUE_DELAY_MINUTES`].
pub async fn mark_messages_for_requeuing<'e>(db: impl PgExecutor<'e>, ids: &[MsgID]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }

    sqlx::query(
        r#"
        UPDATE msgs SET status = 'I', next_attempt = NOW() + make_interval(mins => $2), modified_on = NOW()
        WHERE id = ANY($1)
        "#,
    )
    .bind(raw_ids(ids))
    .bind(REQUEUE_DELAY_MINUTES as i32)
    .execute(db)
    .await?;

    Ok(())
}

/// Marks messages as handed to the courier.
pub async fn mark_messages_queued<'e>(db: impl PgExecutor<'e>, ids: &[MsgID]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }

    sqlx::query(
        "UPDATE msgs SET status = 'Q', next_attempt = NULL, modified_on = NOW() WHERE id = ANY($1)",
    )
    .bind(raw_ids(ids))
    .execute(db)
    .await?;

    Ok(())
}

/// Marks incoming messages as handled by the flows that received them.
pub async fn mark_messages_handled(conn: &mut PgConnection, handled: &[(MsgID, FlowID)]) -> Result<()> {
    if handled.is_empty() {
        return Ok(());
    }

    let ids: Vec<MsgID> = handled.iter().map(|(id, _)| *id).collect();
    let flows: Vec<Option<i64>> = handled.iter().map(|(_, f)| f.as_option()).collect();

    sqlx::query(
        r#"
        UPDATE msgs m SET status = 'H', flow_id = r.flow_id, modified_on = NOW()
        FROM UNNEST($1::BIGINT[], $2::BIGINT[]) AS r(id, flow_id)
        WHERE m.id = r.id AND m.direction = 'I'
        "#,
    )
    .bind(raw_ids(&ids))
    .bind(&flows)
    .execute(conn)
    .await?;

    Ok(())
}

/// Prepares failed or errored messages for another send.
///
/// Each message's channel is chosen again for its URN. Messages that now have a channel are
/// reset to pending for the retrier and returned. The others are failed with no destination.
#[instrument(skip_all, fields(org_id = %oa.org_id(), msgs = msgs.len()))]
pub async fn prepare_messages_for_resend(
    conn: &mut PgConnection,
    oa: &OrgAssets,
    msgs: Vec<Msg>,
) -> Result<Vec<OutgoingMsg>> {
    let urn_ids: Vec<UrnID> = msgs.iter().map(|m| m.contact_urn_id).filter(|id| !id.is_nil()).collect();
    let urns = load_urns(&mut *conn, &urn_ids).await?;

    let mut resends = Vec::new();
    let mut failed = Vec::new();

    for mut msg in msgs {
        let urn = urns.iter().find(|u| u.id == msg.contact_urn_id).cloned();
        let channel = urn
            .as_ref()
            .and_then(|u| channel::channel_for_urn(oa.channels(), &u.urn(), u.channel_id))
            .cloned();

        match (urn, channel) {
            (Some(urn), Some(channel)) if !urn.contact_id.is_nil() => {
                msg.channel_id = channel.id;
                msg.status = MsgStatus::Pending;
                msg.error_count = 0;
                msg.failed_reason = None;
                msg.sent_on = None;
                msg.next_attempt = Some(Utc::now());
                resends.push(OutgoingMsg {
                    msg,
                    urn: Some(urn),
                    channel: Some(channel),
                    contact_uuid: Uuid::nil(),
                    reply_to: None,
                    is_resend: true,
                });
            }
            _ => {
                msg.fail(FailedReason::NoDestination);
                failed.push(msg.id);
            }
        }
    }

    if !resends.is_empty() {
        let ids: Vec<MsgID> = resends.iter().map(|r| r.msg.id).collect();
        let channels: Vec<ChannelID> = resends.iter().map(|r| r.msg.channel_id).collect();

        sqlx::query(
            r#"
            UPDATE msgs m
            SET channel_id = r.channel_id, status = 'P', error_count = 0, failed_reason = NULL,
                sent_on = NULL, next_attempt = NOW(), modified_on = NOW()
            FROM UNNEST($1::BIGINT[], $2::BIGINT[]) AS r(id, channel_id)
            WHERE m.id = r.id
            "#,
        )
        .bind(raw_ids(&ids))
        .bind(raw_ids(&channels))
        .execute(&mut *conn)
        .await?;
    }

    if !failed.is_empty() {
        sqlx::query(
            "UPDATE msgs SET status = 'F', failed_reason = 'D', modified_on = NOW() WHERE id = ANY($1)",
        )
        .bind(raw_ids(&failed))
        .execute(&mut *conn)
        .await?;
    }

    debug!(resent = resends.len(), failed = failed.len(), "Prepared messages for resend");
    Ok(resends)
}

/// Fails every unsent outgoing message on a channel, a batch at a time until none are left.
#[instrument(skip(db))]
pub async fn fail_channel_messages(
    db: &PgPool,
    org_id: OrgID,
    channel_id: ChannelID,
    reason: FailedReason,
) -> Result<u64> {
    let mut total = 0;

    loop {
        let res = sqlx::query(
            r#"
            UPDATE msgs SET status = 'F', failed_reason = $3, modified_on = NOW()
            WHERE id IN (
                SELECT id FROM msgs
                WHERE org_id = $1 AND channel_id = $2 AND direction = 'O' AND status IN ('P', 'Q', 'E')
                LIMIT $4
            )
            "#,
        )
        .bind(org_id)
        .bind(channel_id)
        .bind(reason)
        .bind(FAIL_BATCH_SIZE)
        .execute(db)
        .await?;

        total += res.rows_affected();
        if res.rows_affected() == 0 {
            break;
        }
    }

    Ok(total)
}

/// The content of a message before evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MsgContent {
    pub text: String,
    pub attachments: Vec<String>,
    pub quick_replies: Vec<String>,
}

/// Creates an engine message for a contact outside of a flow, as broadcasts and ticket replies do.
///
/// When `context` is given, the text, attachments, quick replies and template variables are
/// evaluated as templates against it. A template is used when the channel supports templates
/// and has a translation for the contact's locale or the org's default.
#[allow(clippy::too_many_arguments)]
pub async fn create_msg_out(
    engine: &dyn Engine,
    oa: &OrgAssets,
    contact: &Contact,
    content: &MsgContent,
    template_id: TemplateID,
    template_variables: &[String],
    locale: Option<&str>,
    context: Option<&serde_json::Value>,
) -> Result<MsgOut> {
    let destination = contact.urns.iter().find_map(|u| {
        channel::channel_for_urn(oa.channels(), &u.urn(), u.channel_id).map(|ch| (u, ch))
    });

    let ec = contact.to_engine(oa);
    let mut content = content.clone();
    let mut variables = template_variables.to_vec();

    if let Some(ctx) = context {
        content.text = engine.evaluate_template(oa, &ec, ctx, &content.text).await?;
        for a in content.attachments.iter_mut() {
            *a = engine.evaluate_template(oa, &ec, ctx, a).await?;
        }
        for qr in content.quick_replies.iter_mut() {
            *qr = engine.evaluate_template(oa, &ec, ctx, qr).await?;
        }
        for v in variables.iter_mut() {
            *v = engine.evaluate_template(oa, &ec, ctx, v).await?;
        }
    }

    let mut out = MsgOut::new(
        destination.map(|(u, _)| u.urn().to_string()),
        destination.map(|(_, ch)| ch.reference()),
        &content.text,
    );
    out.attachments = content.attachments;
    out.quick_replies = content.quick_replies;
    out.locale = locale.map(str::to_string);

    if let (Some((_, channel)), Some(template)) = (destination, oa.template_by_id(template_id)) {
        if channel.supports_templating() {
            let country = oa.org().default_country.clone().unwrap_or_default();
            let contact_locale = contact
                .language
                .as_deref()
                .map(|l| format!("{}-{}", l, country));
            let default_locale = oa
                .org()
                .default_language()
                .map(|l| format!("{}-{}", l, country));
            let candidates = [locale.map(str::to_string), contact_locale, default_locale];
            let locales: Vec<&str> = candidates.iter().flatten().map(String::as_str).collect();

            if let Some(translation) = template.find_translation(channel.id, &locales) {
                out.text = translation.preview(&variables);
                out.locale = Some(translation.locale.clone());
                out.templating = Some(MsgTemplating::new(template, translation, &variables));
            }
        }
    }

    if contact.status != ContactStatus::Active {
        out.unsendable_reason = Some(UnsendableReason::ContactStatus);
    } else if destination.is_none() {
        out.unsendable_reason = Some(UnsendableReason::NoDestination);
    }

    Ok(out)
}

/// Parses the incoming messages an engine trigger carries back to a message id and external id.
pub fn reply_to(msg: &engine::MsgIn) -> Option<ReplyTo> {
    (!msg.id.is_nil()).then(|| ReplyTo {
        id: msg.id,
        external_id: msg.external_id.clone(),
    })
}

/// Fails with an invariant error if any message about to be queued breaks the queued-message
/// invariant: queued messages always have a channel and never a failure reason.
pub fn check_queueable(msgs: &[OutgoingMsg]) -> Result<()> {
    for m in msgs {
        if m.msg.status == MsgStatus::Queued && (m.msg.channel_id.is_nil() || m.msg.failed_reason.is_some()) {
            return Err(CoreError::Invariant(format!(
                "queued message {} has no channel or a failure reason",
                m.msg.uuid
            )));
        }
    }
    Ok(())
}

/// When a message failed to reach the courier, how long until it's retried.
pub fn next_attempt(now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::minutes(REQUEUE_DELAY_MINUTES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_codes() {
        assert_eq!(MsgStatus::Initializing.code(), "I");
        assert_eq!(MsgStatus::from_code("Q"), Some(MsgStatus::Queued));
        assert_eq!(MsgVisibility::DeletedBySender.code(), "X");
        assert_eq!(FailedReason::Looping.code(), "L");
        assert_eq!(FailedReason::from(UnsendableReason::ContactStatus), FailedReason::Contact);
        assert_eq!(FailedReason::from(UnsendableReason::NoDestination), FailedReason::NoDestination);
    }

    #[test]
    fn test_repetition_keys() {
        let now = Utc.with_ymd_and_hms(2029, 11, 3, 4, 38, 12).unwrap();
        assert_eq!(repetition_key(now), "msg_repetitions:2029-11-03T04:35");

        let now = Utc.with_ymd_and_hms(2029, 11, 3, 4, 4, 59).unwrap();
        assert_eq!(repetition_key(now), "msg_repetitions:2029-11-03T04:00");

        assert_eq!(repetition_field(ContactID(12), "Hello THERE"), "12|hello there");
        let long = "x".repeat(300);
        assert_eq!(repetition_field(ContactID(1), &long).len(), 2 + 128);
    }

    #[test]
    fn test_normalize_attachment() {
        let domain = "attachments.example.com";
        assert_eq!(
            normalize_attachment("image/jpeg:http://example.com/test.jpg", domain),
            "image/jpeg:http://example.com/test.jpg"
        );
        assert_eq!(normalize_attachment("geo:-2.90875,-79.0117", domain), "geo:-2.90875,-79.0117");
        assert_eq!(
            normalize_attachment("audio/mp4:/recordings/99.m4a", domain),
            "audio/mp4:https://attachments.example.com/recordings/99.m4a"
        );
    }

    #[test]
    fn test_incoming() {
        let msg = new_incoming_ivr(OrgID(1), ChannelID(2), ContactID(3), UrnID(4), "1", &[]);
        assert_eq!(msg.status, MsgStatus::Handled);
        assert_eq!(msg.direction, MsgDirection::In);
        assert_eq!(msg.msg_type, MsgType::Voice);

        let msg = new_incoming_android(OrgID(1), ChannelID(2), ContactID(3), UrnID(4), "hi", Some("ext1"), Utc::now());
        assert_eq!(msg.status, MsgStatus::Pending);
        assert_eq!(msg.external_id.as_deref(), Some("ext1"));
    }

    #[test]
    fn test_check_queueable() {
        let mut msg = Msg::blank(OrgID(1), MsgDirection::Out, MsgStatus::Queued, ContactID(1));
        let out = OutgoingMsg {
            msg: msg.clone(),
            urn: None,
            channel: None,
            contact_uuid: Uuid::new_v4(),
            reply_to: None,
            is_resend: false,
        };
        assert!(check_queueable(&[out.clone()]).is_err());

        msg.fail(FailedReason::NoDestination);
        assert!(check_queueable(&[OutgoingMsg { msg, ..out }]).is_ok());
    }
}
