// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Turning engine events into database writes.
//!
//! Events are handled in two phases. First every event of a sprint goes to the handler
//! registered for its type, which works out what should change and buffers it on the contact's
//! [`Scene`] under a [`HookKind`]. Then, inside the sprint's transaction, each hook runs once
//! with the buffered items of every scene in the batch. Hooks run in the order of [`HookKind`],
//! so contacts and URNs are written before anything that depends on them and statistics come
//! last. Outgoing messages are only handed to the courier once the transaction has committed.

mod handlers;
mod writers;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::assets::OrgAssets;
use crate::courier;
use crate::engine::{EngineSession, Event, EventKind, MsgIn, Sprint};
use crate::error::{CoreError, Result};
use crate::models::contact::{Contact, ContactStatus, FieldChange};
use crate::models::flow_start::FlowStart;
use crate::models::http_log::{AirtimeTransfer, HttpLog};
use crate::models::ids::{FlowID, GroupID, MsgID, TopicID, UserID};
use crate::models::label::MsgLabelAdd;
use crate::models::msg::{self, OutgoingMsg, ReplyTo};
use crate::models::run::RunStatus;
use crate::models::ticket::Ticket;
use crate::runtime::Runtime;
use crate::stats::{self, RecentContact};

pub use self::handlers::{EventHandler, handler_for};

/// The hooks, declared in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HookKind {
    ContactName,
    ContactLanguage,
    ContactFields,
    ContactStatus,
    ContactUrns,
    ContactGroups,
    CampaignFires,
    ContactModified,
    ContactLastSeen,
    OpenTickets,
    TicketEvents,
    Msgs,
    HttpLogs,
    MsgLabels,
    FlowStarts,
    WebhookHealth,
    FlowStats,
}

impl HookKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::ContactName => "contact_name",
            Self::ContactLanguage => "contact_language",
            Self::ContactFields => "contact_fields",
            Self::ContactStatus => "contact_status",
            Self::ContactUrns => "contact_urns",
            Self::ContactGroups => "contact_groups",
            Self::CampaignFires => "campaign_fires",
            Self::ContactModified => "contact_modified",
            Self::ContactLastSeen => "contact_last_seen",
            Self::OpenTickets => "open_tickets",
            Self::TicketEvents => "ticket_events",
            Self::Msgs => "msgs",
            Self::HttpLogs => "http_logs",
            Self::MsgLabels => "msg_labels",
            Self::FlowStarts => "flow_starts",
            Self::WebhookHealth => "webhook_health",
            Self::FlowStats => "flow_stats",
        }
    }
}

/// A change to a ticket that already exists, or was opened earlier in the same batch.
#[derive(Debug, Clone, PartialEq)]
pub enum TicketChange {
    Assigned(UserID),
    TopicChanged(TopicID),
    Closed,
    Reopened,
    NoteAdded(String),
}

/// A start requested by a flow, with the contacts it names still as UUIDs.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingStart {
    pub start: FlowStart,
    pub contact_uuids: Vec<Uuid>,
}

/// Something a handler wants written.
#[derive(Debug, Clone)]
pub enum HookItem {
    Name(String),
    Language(String),
    Field(FieldChange),
    Status(ContactStatus),
    Urns(Vec<String>),
    Groups { added: Vec<GroupID>, removed: Vec<GroupID> },
    CampaignGroups { joined: Vec<GroupID>, left: Vec<GroupID> },
    /// A change that can move the contact in or out of query groups.
    Modified,
    /// Only bumps the contact's modified time.
    Touched,
    LastSeen(DateTime<Utc>),
    OpenTicket { ticket: Box<Ticket>, note: Option<String> },
    TicketChange { ticket_uuid: Uuid, change: TicketChange },
    OutgoingMsg(Box<OutgoingMsg>),
    HandledMsg { msg_id: MsgID, flow_id: FlowID },
    HttpLog(Box<HttpLog>),
    Airtime(Box<AirtimeTransfer>),
    MsgLabel(MsgLabelAdd),
    FlowStart(Box<PendingStart>),
    WebhookCall { node_uuid: Uuid, healthy: bool },
    ResultChange {
        flow_id: FlowID,
        key: String,
        previous: Option<String>,
        category: String,
    },
    SprintEnded,
}

/// One contact's share of a batch: the contact as changed so far, the session and sprint that
/// produced the events if there was one, and everything waiting to be written.
#[derive(Debug)]
pub struct Scene {
    pub contact: Contact,
    /// Who made the changes, nil when it was a flow.
    pub user_id: UserID,
    /// The message the session was resumed with.
    pub incoming: Option<MsgIn>,
    pub session: Option<EngineSession>,
    pub sprint: Option<Sprint>,
    items: BTreeMap<HookKind, Vec<HookItem>>,
    /// Messages inserted for this contact, to queue after commit.
    outgoing: Vec<OutgoingMsg>,
}

impl Scene {
    /// A scene for changes made outside of a session, such as modifiers.
    pub fn for_contact(contact: Contact, user_id: UserID) -> Self {
        Self {
            contact,
            user_id,
            incoming: None,
            session: None,
            sprint: None,
            items: BTreeMap::new(),
            outgoing: Vec::new(),
        }
    }

    /// A scene for a sprint of a session.
    pub fn for_sprint(contact: Contact, session: EngineSession, sprint: Sprint) -> Self {
        Self {
            session: Some(session),
            sprint: Some(sprint),
            ..Self::for_contact(contact, UserID(0))
        }
    }

    pub fn with_incoming(mut self, msg: Option<MsgIn>) -> Self {
        self.incoming = msg;
        self
    }

    /// Buffers an item for a hook.
    pub fn attach(&mut self, kind: HookKind, item: HookItem) {
        self.items.entry(kind).or_default().push(item);
    }

    pub fn items(&self, kind: HookKind) -> &[HookItem] {
        self.items.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    /// The messages written for this contact.
    pub fn outgoing(&self) -> &[OutgoingMsg] {
        &self.outgoing
    }

    /// The flow an event happened in, nil if it wasn't in a flow or the flow isn't cached.
    pub fn flow_id_for(&self, oa: &OrgAssets, event: &Event) -> FlowID {
        self.locate(event)
            .and_then(|(flow_uuid, _)| oa.flow_by_uuid(flow_uuid))
            .map(|f| f.id)
            .unwrap_or_default()
    }

    /// The flow and node an event happened at.
    pub fn locate(&self, event: &Event) -> Option<(Uuid, Uuid)> {
        let step = event.step_uuid?;
        self.session
            .as_ref()?
            .locate_event(step)
            .map(|(flow, node)| (flow.uuid, node))
    }

    /// What outgoing messages in this scene are replies to.
    pub fn reply_to(&self) -> Option<ReplyTo> {
        self.incoming.as_ref().and_then(msg::reply_to)
    }
}

/// The events of a sprint to handle: everything except what happened in failed runs, then a
/// sprint ended marker.
pub fn sprint_events(session: &EngineSession, sprint: &Sprint) -> Vec<Event> {
    let failed: Vec<&Event> = session
        .runs
        .iter()
        .filter(|r| r.status == RunStatus::Failed)
        .flat_map(|r| r.events.iter())
        .collect();

    let mut events: Vec<Event> = sprint
        .events
        .iter()
        .filter(|e| !failed.contains(e))
        .cloned()
        .collect();
    events.push(Event::new(EventKind::SprintEnded));
    events
}

/// Runs the handler of each event, in order, against a scene.
pub async fn process_events(rt: &Runtime, oa: &OrgAssets, scene: &mut Scene, events: &[Event]) -> Result<()> {
    for event in events {
        let handler = handler_for(event.type_name()).ok_or_else(|| {
            CoreError::Invariant(format!("no handler for event type {}", event.type_name()))
        })?;

        handler
            .handle(rt, oa, scene, event)
            .await
            .map_err(|e| e.context(format!("handling {} event", event.type_name())))?;
    }
    Ok(())
}

/// Runs every hook with buffered items, once each, across all scenes.
#[instrument(skip_all, fields(org_id = %oa.org_id(), scenes = scenes.len()))]
pub async fn execute_pre_commit(
    conn: &mut PgConnection,
    rt: &Runtime,
    oa: &OrgAssets,
    scenes: &mut [Scene],
) -> Result<()> {
    writers::check_distinct_contacts(scenes)?;

    let mut batches: BTreeMap<HookKind, Vec<(usize, HookItem)>> = BTreeMap::new();
    for (i, scene) in scenes.iter_mut().enumerate() {
        for (kind, items) in std::mem::take(&mut scene.items) {
            batches.entry(kind).or_default().extend(items.into_iter().map(|item| (i, item)));
        }
    }

    for (kind, items) in batches {
        debug!(hook = kind.name(), items = items.len(), "Executing hook");
        writers::execute(kind, conn, rt, oa, scenes, items)
            .await
            .map_err(|e| e.context(format!("executing {} hook", kind.name())))?;
    }

    Ok(())
}

/// Work that waits for the transaction to commit: queueing messages to the courier and
/// recording recent contacts. Failures are logged since the sprint itself already stands.
#[instrument(skip_all, fields(org_id = %oa.org_id(), scenes = scenes.len()))]
pub async fn execute_post_commit(rt: &Runtime, oa: &OrgAssets, scenes: &[Scene]) {
    let msgs: Vec<&OutgoingMsg> = scenes.iter().flat_map(|s| s.outgoing.iter()).collect();
    if let Err(e) = courier::queue_messages(rt, oa, &msgs).await {
        error!(error = %e, "Error queuing messages to courier");
    }

    let recent: Vec<RecentContact> = scenes
        .iter()
        .filter_map(|s| s.sprint.as_ref().map(|sp| (s.contact.id, sp)))
        .flat_map(|(contact_id, sprint)| {
            sprint.segments.iter().map(move |seg| {
                RecentContact::new(
                    seg.exit_uuid,
                    seg.dest_uuid,
                    contact_id,
                    &seg.ui_type,
                    &seg.operand,
                    seg.time,
                )
            })
        })
        .collect();
    if let Err(e) = stats::record_recent_contacts(&rt.redis, &recent).await {
        error!(error = %e, "Error recording recent contacts");
    }
}
