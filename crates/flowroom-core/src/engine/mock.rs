// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! A scripted engine for tests and local development.
//!
//! Flow definitions are read as a flat list of nodes, each with one action and one exit that
//! leads to the next node. Waits suspend the run, `enter_flow` starts a child run, and
//! `fail` fails the whole session. Group queries support `key = "value"` and
//! `key != "value"` conditions joined by `AND`, on `name`, `language`, `status`, `urn` and
//! field keys.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use super::{
    Engine, EngineContact, EngineRun, EngineSession, Event, EventKind, GroupModification,
    Modifier, MsgOut, OpenedTicket, Resume, RunResult, Segment, Sprint, Step, Trigger,
    TriggerKind, UnsendableReason, UrnsModification, Wait, result_key,
};
use crate::assets::OrgAssets;
use crate::engine::events::TransferAttempt;
use crate::error::{CoreError, Result};
use crate::models::channel::{self, Channel};
use crate::models::contact::ContactStatus;
use crate::models::field::{FieldRef, FieldValue};
use crate::models::flow::{Flow, FlowRef};
use crate::models::group::{GroupRef, GroupType};
use crate::models::http_log::{CallStatus, HttpTrace};
use crate::models::ids::ChannelID;
use crate::models::label::LabelRef;
use crate::models::optin::OptInRef;
use crate::models::org::UserRef;
use crate::models::run::RunStatus;
use crate::models::session::SessionStatus;
use crate::models::topic::TopicRef;
use crate::models::urn::Urn;

#[derive(Debug, Deserialize)]
struct Definition {
    #[serde(default)]
    nodes: Vec<Node>,
}

#[derive(Debug, Deserialize)]
struct Node {
    uuid: Uuid,
    exit_uuid: Uuid,
    #[serde(default)]
    ui_type: String,
    action: Action,
}

fn default_status_code() -> i32 {
    200
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Action {
    SendMsg {
        text: String,
        #[serde(default)]
        attachments: Vec<String>,
        #[serde(default)]
        quick_replies: Vec<String>,
    },
    WaitForResponse {
        #[serde(default)]
        timeout_seconds: Option<i32>,
        #[serde(default)]
        result_name: Option<String>,
    },
    SetRunResult {
        name: String,
        value: String,
        #[serde(default)]
        category: String,
    },
    AddContactGroups {
        groups: Vec<GroupRef>,
    },
    RemoveContactGroups {
        groups: Vec<GroupRef>,
    },
    SetContactField {
        field: FieldRef,
        value: String,
    },
    SetContactLanguage {
        language: String,
    },
    SetContactName {
        name: String,
    },
    SetContactStatus {
        status: ContactStatus,
    },
    OpenTicket {
        #[serde(default)]
        topic: Option<TopicRef>,
        #[serde(default)]
        assignee: Option<UserRef>,
        #[serde(default)]
        note: Option<String>,
    },
    CallWebhook {
        url: String,
        #[serde(default = "default_status_code")]
        status_code: i32,
    },
    EnterFlow {
        flow: FlowRef,
    },
    StartSession {
        flow: FlowRef,
        #[serde(default)]
        groups: Vec<GroupRef>,
        #[serde(default)]
        contacts: Vec<Uuid>,
    },
    AddInputLabels {
        labels: Vec<LabelRef>,
    },
    RequestOptin {
        optin: OptInRef,
    },
    TransferAirtime {
        amount: f64,
        currency: String,
    },
    SendEmail {
        addresses: Vec<String>,
        subject: String,
        body: String,
    },
    Fail {
        text: String,
    },
}

/// An [`Engine`] that interprets simple linear flow definitions.
#[derive(Debug, Default, Clone)]
pub struct MockEngine;

impl MockEngine {
    pub fn new() -> Self {
        Self
    }
}

fn definition(flow: &Flow) -> Result<Definition> {
    serde_json::from_value(flow.definition.0.clone())
        .map_err(|e| CoreError::Engine(format!("invalid definition for flow {}: {}", flow.uuid, e)))
}

struct Execution<'a> {
    oa: &'a OrgAssets,
    session: EngineSession,
    sprint: Sprint,
    now: DateTime<Utc>,
}

impl<'a> Execution<'a> {
    fn new(oa: &'a OrgAssets, session: EngineSession) -> Self {
        Self {
            oa,
            session,
            sprint: Sprint::new(),
            now: Utc::now(),
        }
    }

    fn flow(&self, flow: &FlowRef) -> Result<(Arc<Flow>, Definition)> {
        let f = self
            .oa
            .flow_by_uuid(flow.uuid)
            .ok_or_else(|| CoreError::Engine(format!("no such flow {}", flow.uuid)))?;
        let def = definition(&f)?;
        Ok((f, def))
    }

    fn push_run(&mut self, flow: FlowRef, parent_uuid: Option<Uuid>) {
        self.session.runs.push(EngineRun {
            uuid: Uuid::new_v4(),
            flow,
            status: RunStatus::Active,
            path: Vec::new(),
            results: BTreeMap::new(),
            events: Vec::new(),
            parent_uuid,
            created_on: self.now,
            modified_on: self.now,
            exited_on: None,
        });
    }

    fn current(&self) -> Option<usize> {
        self.session
            .runs
            .iter()
            .rposition(|r| r.status == RunStatus::Active)
    }

    fn log(&mut self, idx: usize, kind: EventKind) {
        let run = &mut self.session.runs[idx];
        let event = match run.path.last() {
            Some(step) => Event::at_step(step.uuid, kind),
            None => Event::new(kind),
        };
        run.events.push(event.clone());
        run.modified_on = self.now;
        self.sprint.events.push(event);
    }

    fn end_run(&mut self, idx: usize, status: RunStatus) {
        let run = &mut self.session.runs[idx];
        run.status = status;
        run.exited_on = Some(self.now);
        run.modified_on = self.now;
    }

    /// Runs the session from its deepest active run until it waits, fails or completes.
    fn run(&mut self, mut operand: String) -> Result<()> {
        while let Some(idx) = self.current() {
            let flow_ref = self.session.runs[idx].flow.clone();
            let (flow, def) = self.flow(&flow_ref)?;

            let next = match self.session.runs[idx].path.last() {
                None => 0,
                Some(step) => {
                    def.nodes
                        .iter()
                        .position(|n| n.uuid == step.node_uuid)
                        .ok_or_else(|| {
                            CoreError::Engine(format!("node {} not in flow {}", step.node_uuid, flow.uuid))
                        })?
                        + 1
                }
            };

            if next > 0 {
                let prev = &def.nodes[next - 1];
                if let Some(step) = self.session.runs[idx].path.last_mut() {
                    step.exit_uuid = Some(prev.exit_uuid);
                }
                if let Some(node) = def.nodes.get(next) {
                    self.sprint.segments.push(Segment {
                        flow: flow_ref.clone(),
                        node_uuid: prev.uuid,
                        exit_uuid: prev.exit_uuid,
                        dest_uuid: node.uuid,
                        ui_type: prev.ui_type.clone(),
                        operand: std::mem::take(&mut operand),
                        time: self.now,
                    });
                }
            }

            let Some(node) = def.nodes.get(next) else {
                self.end_run(idx, RunStatus::Completed);
                continue;
            };

            let run = &mut self.session.runs[idx];
            run.path.push(Step {
                uuid: Uuid::new_v4(),
                node_uuid: node.uuid,
                exit_uuid: None,
                arrived_on: self.now,
            });
            run.modified_on = self.now;

            self.execute(idx, &flow, node)?;
            if self.session.status == SessionStatus::Failed {
                break;
            }
        }

        self.finish();
        Ok(())
    }

    fn finish(&mut self) {
        if self.session.status != SessionStatus::Failed {
            self.session.status = if self
                .session
                .runs
                .iter()
                .any(|r| r.status == RunStatus::Waiting)
            {
                SessionStatus::Waiting
            } else {
                SessionStatus::Completed
            };
        }
        if self.session.status != SessionStatus::Waiting {
            self.session.wait = None;
        }
    }

    fn terminate(&mut self, session_status: SessionStatus, run_status: RunStatus) {
        for idx in 0..self.session.runs.len() {
            if self.session.runs[idx].is_active_or_waiting() {
                self.end_run(idx, run_status);
            }
        }
        self.session.status = session_status;
        self.session.wait = None;
    }

    fn execute(&mut self, idx: usize, flow: &Flow, node: &Node) -> Result<()> {
        match &node.action {
            Action::SendMsg {
                text,
                attachments,
                quick_replies,
            } => {
                let context = json!({ "results": self.results_context(idx) });
                let text = evaluate(text, &self.session.contact, &context);
                let mut msg = self.msg_out(&text);
                msg.attachments = attachments.clone();
                msg.quick_replies = quick_replies.clone();
                let kind = if flow.flow_type == crate::models::flow::FlowType::Voice {
                    EventKind::IvrCreated { msg }
                } else {
                    EventKind::MsgCreated { msg }
                };
                self.log(idx, kind);
            }
            Action::WaitForResponse { timeout_seconds, .. } => {
                let expires_on = flow
                    .expires_after()
                    .and_then(|d| chrono::Duration::from_std(d).ok())
                    .map(|d| self.now + d);
                self.session.runs[idx].status = RunStatus::Waiting;
                self.session.wait = Some(Wait {
                    expires_on,
                    timeout_seconds: *timeout_seconds,
                });
                self.session.status = SessionStatus::Waiting;
            }
            Action::SetRunResult {
                name,
                value,
                category,
            } => self.save_result(idx, name, value, category, node.uuid, None),
            Action::AddContactGroups { groups } => {
                let added: Vec<GroupRef> = groups
                    .iter()
                    .filter(|g| !self.session.contact.groups.contains(g))
                    .cloned()
                    .collect();
                if !added.is_empty() {
                    self.session.contact.groups.extend(added.iter().cloned());
                    self.log(
                        idx,
                        EventKind::ContactGroupsChanged {
                            groups_added: added,
                            groups_removed: Vec::new(),
                        },
                    );
                }
            }
            Action::RemoveContactGroups { groups } => {
                let removed: Vec<GroupRef> = groups
                    .iter()
                    .filter(|g| self.session.contact.groups.contains(g))
                    .cloned()
                    .collect();
                if !removed.is_empty() {
                    self.session.contact.groups.retain(|g| !removed.contains(g));
                    self.log(
                        idx,
                        EventKind::ContactGroupsChanged {
                            groups_added: Vec::new(),
                            groups_removed: removed,
                        },
                    );
                }
            }
            Action::SetContactField { field, value } => {
                let current = self.session.contact.fields.get(&field.key).map(|v| v.text.as_str());
                if current != Some(value.as_str()) {
                    self.session
                        .contact
                        .fields
                        .insert(field.key.clone(), FieldValue::parse(value, self.oa.tz()));
                    self.log(
                        idx,
                        EventKind::ContactFieldChanged {
                            field: field.clone(),
                            value: Some(value.clone()),
                        },
                    );
                    self.reevaluate(idx);
                }
            }
            Action::SetContactLanguage { language } => {
                if self.session.contact.language.as_deref() != Some(language.as_str()) {
                    self.session.contact.language = Some(language.clone());
                    self.log(
                        idx,
                        EventKind::ContactLanguageChanged {
                            language: language.clone(),
                        },
                    );
                    self.reevaluate(idx);
                }
            }
            Action::SetContactName { name } => {
                if self.session.contact.name.as_deref() != Some(name.as_str()) {
                    self.session.contact.name = Some(name.clone());
                    self.log(idx, EventKind::ContactNameChanged { name: name.clone() });
                    self.reevaluate(idx);
                }
            }
            Action::SetContactStatus { status } => {
                if self.session.contact.status != *status {
                    self.session.contact.status = *status;
                    self.log(idx, EventKind::ContactStatusChanged { status: *status });
                }
            }
            Action::OpenTicket {
                topic,
                assignee,
                note,
            } => {
                let ticket = OpenedTicket {
                    uuid: Uuid::new_v4(),
                    topic: topic.clone(),
                    assignee: assignee.clone(),
                    note: note.clone(),
                };
                self.session.contact.tickets.push(ticket.uuid);
                self.log(idx, EventKind::TicketOpened { ticket });
            }
            Action::CallWebhook { url, status_code } => {
                let status = match status_code {
                    0 => CallStatus::ConnectionError,
                    200..=299 => CallStatus::Success,
                    _ => CallStatus::ResponseError,
                };
                let trace = HttpTrace {
                    url: url.clone(),
                    status,
                    status_code: *status_code,
                    request: format!("POST {} HTTP/1.1\r\n\r\n", url),
                    response: if *status_code > 0 {
                        format!("HTTP/1.1 {} \r\n\r\n{{}}", status_code)
                    } else {
                        String::new()
                    },
                    elapsed_ms: 1,
                    retries: 0,
                    created_on: self.now,
                };
                self.log(idx, EventKind::WebhookCalled { trace, resthook: None });
            }
            Action::EnterFlow { flow: child } => {
                let parent_uuid = self.session.runs[idx].uuid;
                self.log(
                    idx,
                    EventKind::FlowEntered {
                        flow: child.clone(),
                        parent_run_uuid: Some(parent_uuid),
                    },
                );
                self.push_run(child.clone(), Some(parent_uuid));
            }
            Action::StartSession {
                flow: target,
                groups,
                contacts,
            } => {
                let run = &self.session.runs[idx];
                let run_summary = json!({
                    "uuid": run.uuid,
                    "flow": run.flow,
                    "contact": self.session.contact.uuid,
                    "status": run.status,
                });
                self.log(
                    idx,
                    EventKind::SessionTriggered {
                        flow: target.clone(),
                        groups: groups.clone(),
                        contacts: contacts.clone(),
                        urns: Vec::new(),
                        contact_query: None,
                        create_contact: false,
                        run_summary,
                        history: json!({ "parent_uuid": self.session.uuid, "ancestors": 1 }),
                    },
                );
            }
            Action::AddInputLabels { labels } => {
                let input = self.session.runs.iter().rev().find_map(|r| {
                    r.events.iter().rev().find_map(|e| match &e.kind {
                        EventKind::MsgReceived { msg } => Some(msg.uuid),
                        _ => None,
                    })
                });
                if let Some(input_uuid) = input {
                    self.log(
                        idx,
                        EventKind::InputLabelsAdded {
                            input_uuid,
                            labels: labels.clone(),
                        },
                    );
                }
            }
            Action::RequestOptin { optin } => match self.destination() {
                Some((urn, channel)) => {
                    let kind = EventKind::OptinRequested {
                        optin: optin.clone(),
                        channel: channel.reference(),
                        urn: urn.identity(),
                    };
                    self.log(idx, kind);
                }
                None => self.log(
                    idx,
                    EventKind::Error {
                        text: "no channel able to request optin".to_string(),
                    },
                ),
            },
            Action::TransferAirtime { amount, currency } => {
                let recipient = self.session.contact.urns.iter().find_map(|u| {
                    Urn::parse(u).ok().filter(|u| u.scheme == "tel").map(|u| u.identity())
                });
                match recipient {
                    Some(recipient) => {
                        let transfer = TransferAttempt {
                            uuid: Uuid::new_v4(),
                            sender: None,
                            recipient,
                            currency: Some(currency.clone()),
                            desired_amount: *amount,
                            actual_amount: *amount,
                            external_id: None,
                            http_logs: Vec::new(),
                        };
                        self.log(idx, EventKind::AirtimeTransferred { transfer });
                    }
                    None => self.log(
                        idx,
                        EventKind::Error {
                            text: "can't transfer airtime to contact without a tel URN".to_string(),
                        },
                    ),
                }
            }
            Action::SendEmail {
                addresses,
                subject,
                body,
            } => {
                self.log(
                    idx,
                    EventKind::EmailSent {
                        to: addresses.clone(),
                        subject: subject.clone(),
                        body: body.clone(),
                    },
                );
            }
            Action::Fail { text } => {
                self.log(idx, EventKind::Failure { text: text.clone() });
                self.terminate(SessionStatus::Failed, RunStatus::Failed);
            }
        }
        Ok(())
    }

    fn save_result(
        &mut self,
        idx: usize,
        name: &str,
        value: &str,
        category: &str,
        node_uuid: Uuid,
        input: Option<String>,
    ) {
        let key = result_key(name);
        let previous_category = self.session.runs[idx]
            .results
            .get(&key)
            .map(|r| r.category.clone())
            .unwrap_or_default();

        self.session.runs[idx].results.insert(
            key,
            RunResult {
                name: name.to_string(),
                value: value.to_string(),
                category: category.to_string(),
                node_uuid,
                input: input.clone(),
                created_on: self.now,
            },
        );
        self.log(
            idx,
            EventKind::RunResultChanged {
                name: name.to_string(),
                value: value.to_string(),
                category: category.to_string(),
                previous_category,
                input,
            },
        );
    }

    fn results_context(&self, idx: usize) -> Value {
        let results: serde_json::Map<String, Value> = self.session.runs[idx]
            .results
            .iter()
            .map(|(k, r)| (k.clone(), json!({ "value": r.value, "category": r.category })))
            .collect();
        Value::Object(results)
    }

    fn reevaluate(&mut self, idx: usize) {
        let (added, removed) = reevaluate(self.oa, &self.session.contact);
        if added.is_empty() && removed.is_empty() {
            return;
        }
        self.session.contact.groups.retain(|g| !removed.contains(g));
        self.session.contact.groups.extend(added.iter().cloned());
        self.log(
            idx,
            EventKind::ContactGroupsChanged {
                groups_added: added,
                groups_removed: removed,
            },
        );
    }

    /// The contact's highest priority URN that some channel can send to.
    fn destination(&self) -> Option<(Urn, &'a Channel)> {
        destination(self.oa, &self.session.contact)
    }

    fn msg_out(&self, text: &str) -> MsgOut {
        let contact = &self.session.contact;
        let locale = contact.language.clone();

        if contact.status != ContactStatus::Active {
            let mut msg = MsgOut::new(None, None, text);
            msg.locale = locale;
            msg.unsendable_reason = Some(UnsendableReason::ContactStatus);
            return msg;
        }

        let mut msg = match self.destination() {
            Some((urn, channel)) => MsgOut::new(Some(urn.identity()), Some(channel.reference()), text),
            None => {
                let mut msg = MsgOut::new(None, None, text);
                msg.unsendable_reason = Some(UnsendableReason::NoDestination);
                msg
            }
        };
        msg.locale = locale;
        msg
    }
}

fn destination<'a>(oa: &'a OrgAssets, contact: &EngineContact) -> Option<(Urn, &'a Channel)> {
    contact.urns.iter().find_map(|u| {
        let urn = Urn::parse(u).ok()?;
        let preferred = preferred_channel(oa, &urn);
        channel::channel_for_urn(oa.channels(), &urn, preferred).map(|c| (urn, c))
    })
}

fn preferred_channel(oa: &OrgAssets, urn: &Urn) -> ChannelID {
    urn.query
        .split('&')
        .find_map(|kv| kv.strip_prefix("channel="))
        .and_then(|v| Uuid::parse_str(v).ok())
        .and_then(|uuid| oa.channel_by_uuid(uuid))
        .map(|c| c.id)
        .unwrap_or(ChannelID(0))
}

/// Evaluates `@contact.*`, `@fields.*` and `@<context path>` expressions in a template.
fn evaluate(template: &str, contact: &EngineContact, context: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if c != '@' {
            out.push(c);
            continue;
        }
        if let Some((_, '@')) = chars.peek() {
            chars.next();
            out.push('@');
            continue;
        }

        let rest = &template[i + 1..];
        let len = rest
            .find(|ch: char| !(ch.is_alphanumeric() || ch == '_' || ch == '.'))
            .unwrap_or(rest.len());
        let path = rest[..len].trim_end_matches('.');

        match resolve(path, contact, context) {
            Some(value) => {
                out.push_str(&value);
                for _ in 0..path.chars().count() {
                    chars.next();
                }
            }
            None => out.push('@'),
        }
    }
    out
}

fn resolve(path: &str, contact: &EngineContact, context: &Value) -> Option<String> {
    let mut parts = path.split('.');
    let root = parts.next()?;

    match root {
        "contact" => {
            let attr = parts.next()?;
            let value = match attr {
                "name" => contact.name.clone().unwrap_or_default(),
                "first_name" => contact
                    .name
                    .as_deref()
                    .and_then(|n| n.split_whitespace().next())
                    .unwrap_or_default()
                    .to_string(),
                "language" => contact.language.clone().unwrap_or_default(),
                "uuid" => contact.uuid.to_string(),
                "urn" => contact.urns.first().cloned().unwrap_or_default(),
                "fields" => field_text(contact, parts.next()?),
                _ => return None,
            };
            Some(value)
        }
        "fields" => Some(field_text(contact, parts.next()?)),
        _ => {
            let mut value = context.get(root)?;
            for part in parts {
                value = value.get(part)?;
            }
            if let Some(inner) = value.get("value") {
                value = inner;
            }
            Some(match value {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            })
        }
    }
}

fn field_text(contact: &EngineContact, key: &str) -> String {
    contact
        .fields
        .get(key)
        .map(|v| v.text.clone())
        .unwrap_or_default()
}

/// Evaluates a group query against a contact, `None` if the query can't be parsed.
fn query_matches(query: &str, contact: &EngineContact) -> Option<bool> {
    let normalized = query.replace(" and ", " AND ");
    for condition in normalized.split(" AND ") {
        let (key, negate, value) = if let Some((k, v)) = condition.split_once("!=") {
            (k, true, v)
        } else if let Some((k, v)) = condition.split_once('=') {
            (k, false, v)
        } else {
            return None;
        };

        let key = key.trim().to_lowercase();
        let value = value.trim().trim_matches('"');

        let matched = match key.as_str() {
            "name" => contact.name.as_deref().unwrap_or("").eq_ignore_ascii_case(value),
            "language" => contact.language.as_deref().unwrap_or("").eq_ignore_ascii_case(value),
            "status" => contact.status.as_str() == value,
            "urn" => {
                if value.is_empty() {
                    contact.urns.is_empty()
                } else {
                    contact
                        .urns
                        .iter()
                        .filter_map(|u| Urn::parse(u).ok())
                        .any(|u| u.identity().eq_ignore_ascii_case(value))
                }
            }
            key => {
                let key = key.strip_prefix("fields.").unwrap_or(key);
                let text = contact.fields.get(key).map(|v| v.text.as_str()).unwrap_or("");
                text.eq_ignore_ascii_case(value)
            }
        };

        if matched == negate {
            return Some(false);
        }
    }
    Some(true)
}

fn reevaluate(oa: &OrgAssets, contact: &EngineContact) -> (Vec<GroupRef>, Vec<GroupRef>) {
    let mut added = Vec::new();
    let mut removed = Vec::new();

    for group in oa.groups().iter().filter(|g| g.group_type == GroupType::Query) {
        let Some(query) = group.query.as_deref() else {
            continue;
        };
        let Some(matches) = query_matches(query, contact) else {
            continue;
        };

        let reference = group.reference();
        let is_member = contact.groups.contains(&reference);
        let should_be = matches && contact.status == ContactStatus::Active;

        if should_be && !is_member {
            added.push(reference);
        } else if !should_be && is_member {
            removed.push(reference);
        }
    }
    (added, removed)
}

fn modified_urns(
    oa: &OrgAssets,
    current: &[String],
    urns: &[String],
    modification: UrnsModification,
) -> std::result::Result<Vec<String>, String> {
    let country = oa.org().default_country.as_deref();
    let mut normalized = Vec::with_capacity(urns.len());
    for u in urns {
        let urn = Urn::parse_normalized(u, country)?;
        normalized.push(urn);
    }

    let identity = |s: &String| Urn::parse(s).map(|u| u.identity()).unwrap_or_default();

    let mut result: Vec<String> = match modification {
        UrnsModification::Set => Vec::new(),
        UrnsModification::Append | UrnsModification::Remove => current.to_vec(),
    };

    match modification {
        UrnsModification::Remove => {
            let remove: Vec<String> = normalized.iter().map(Urn::identity).collect();
            result.retain(|u| !remove.contains(&identity(u)));
        }
        UrnsModification::Append | UrnsModification::Set => {
            for urn in normalized {
                if !result.iter().any(|u| identity(u) == urn.identity()) {
                    result.push(urn.to_string());
                }
            }
        }
    }
    Ok(result)
}

#[async_trait]
impl Engine for MockEngine {
    async fn start_session(
        &self,
        oa: &OrgAssets,
        contact: &EngineContact,
        trigger: &Trigger,
    ) -> Result<(EngineSession, Sprint)> {
        let flow = oa
            .flow_by_uuid(trigger.flow.uuid)
            .ok_or_else(|| CoreError::Engine(format!("no such flow {}", trigger.flow.uuid)))?;

        let session = EngineSession {
            uuid: Uuid::new_v4(),
            session_type: flow.flow_type,
            status: SessionStatus::Waiting,
            contact: contact.clone(),
            runs: Vec::new(),
            wait: None,
        };

        let mut exec = Execution::new(oa, session);
        exec.push_run(flow.reference(), None);
        if let TriggerKind::Msg { msg, .. } = &trigger.kind {
            exec.session.runs[0].events.push(Event::new(EventKind::MsgReceived { msg: msg.clone() }));
        }
        exec.run(String::new())?;

        Ok((exec.session, exec.sprint))
    }

    async fn resume_session(
        &self,
        oa: &OrgAssets,
        contact: &EngineContact,
        output: &str,
        resume: &Resume,
    ) -> Result<(EngineSession, Sprint)> {
        let mut session: EngineSession = serde_json::from_str(output)?;
        if session.status != SessionStatus::Waiting {
            return Err(CoreError::Engine(format!(
                "can't resume session {} with status {}",
                session.uuid, session.status
            )));
        }
        session.contact = contact.clone();

        let mut exec = Execution::new(oa, session);
        let idx = exec
            .session
            .runs
            .iter()
            .position(|r| r.status == RunStatus::Waiting)
            .ok_or_else(|| CoreError::Engine("waiting session has no waiting run".to_string()))?;

        let resume_on_expire = exec.session.resume_on_expire();
        exec.session.wait = None;

        match resume {
            Resume::Msg { msg } => {
                let flow_ref = exec.session.runs[idx].flow.clone();
                let (_, def) = exec.flow(&flow_ref)?;
                let wait_node = exec.session.runs[idx]
                    .path
                    .last()
                    .and_then(|s| def.nodes.iter().find(|n| n.uuid == s.node_uuid));

                exec.session.runs[idx].status = RunStatus::Active;
                exec.log(idx, EventKind::MsgReceived { msg: msg.clone() });

                if let Some(Node {
                    uuid,
                    action: Action::WaitForResponse {
                        result_name: Some(name),
                        ..
                    },
                    ..
                }) = wait_node
                {
                    exec.save_result(idx, name, &msg.text, "All Responses", *uuid, Some(msg.text.clone()));
                }
                exec.run(msg.text.clone())?;
            }
            Resume::WaitTimeout | Resume::Dial { .. } => {
                exec.session.runs[idx].status = RunStatus::Active;
                exec.run(String::new())?;
            }
            Resume::WaitExpiration => {
                if resume_on_expire {
                    exec.end_run(idx, RunStatus::Expired);
                    exec.run(String::new())?;
                } else {
                    exec.terminate(SessionStatus::Expired, RunStatus::Expired);
                }
            }
        }

        Ok((exec.session, exec.sprint))
    }

    async fn read_session(&self, _oa: &OrgAssets, output: &str) -> Result<EngineSession> {
        Ok(serde_json::from_str(output)?)
    }

    async fn reevaluate_query_groups(
        &self,
        oa: &OrgAssets,
        contact: &EngineContact,
    ) -> Result<(Vec<GroupRef>, Vec<GroupRef>)> {
        Ok(reevaluate(oa, contact))
    }

    async fn apply_modifiers(
        &self,
        oa: &OrgAssets,
        contact: &EngineContact,
        modifiers: &[Modifier],
    ) -> Result<Vec<Event>> {
        let mut contact = contact.clone();
        let mut events = Vec::new();
        let mut reevaluate_groups = false;

        for modifier in modifiers {
            match modifier {
                Modifier::Name { name } => {
                    if contact.name != *name {
                        contact.name = name.clone();
                        events.push(Event::new(EventKind::ContactNameChanged {
                            name: name.clone().unwrap_or_default(),
                        }));
                        reevaluate_groups = true;
                    }
                }
                Modifier::Language { language } => {
                    if contact.language != *language {
                        contact.language = language.clone();
                        events.push(Event::new(EventKind::ContactLanguageChanged {
                            language: language.clone().unwrap_or_default(),
                        }));
                        reevaluate_groups = true;
                    }
                }
                Modifier::Field { field, value } => {
                    let current = contact.fields.get(&field.key).map(|v| v.text.clone());
                    if current != *value {
                        match value {
                            Some(v) => {
                                contact.fields.insert(field.key.clone(), FieldValue::parse(v, oa.tz()));
                            }
                            None => {
                                contact.fields.remove(&field.key);
                            }
                        }
                        events.push(Event::new(EventKind::ContactFieldChanged {
                            field: field.clone(),
                            value: value.clone(),
                        }));
                        reevaluate_groups = true;
                    }
                }
                Modifier::Groups {
                    groups,
                    modification,
                } => {
                    let (added, removed): (Vec<GroupRef>, Vec<GroupRef>) = match modification {
                        GroupModification::Add => (
                            groups.iter().filter(|g| !contact.groups.contains(g)).cloned().collect(),
                            Vec::new(),
                        ),
                        GroupModification::Remove => (
                            Vec::new(),
                            groups.iter().filter(|g| contact.groups.contains(g)).cloned().collect(),
                        ),
                    };
                    if !added.is_empty() || !removed.is_empty() {
                        contact.groups.retain(|g| !removed.contains(g));
                        contact.groups.extend(added.iter().cloned());
                        events.push(Event::new(EventKind::ContactGroupsChanged {
                            groups_added: added,
                            groups_removed: removed,
                        }));
                    }
                }
                Modifier::Status { status } => {
                    if contact.status != *status {
                        contact.status = *status;
                        events.push(Event::new(EventKind::ContactStatusChanged { status: *status }));
                        reevaluate_groups = true;
                    }
                }
                Modifier::Urns { urns, modification } => {
                    match modified_urns(oa, &contact.urns, urns, *modification) {
                        Ok(new_urns) => {
                            if new_urns != contact.urns {
                                contact.urns = new_urns.clone();
                                events.push(Event::new(EventKind::ContactUrnsChanged { urns: new_urns }));
                                reevaluate_groups = true;
                            }
                        }
                        Err(reason) => events.push(Event::new(EventKind::Error { text: reason })),
                    }
                }
                Modifier::Ticket {
                    topic,
                    assignee,
                    note,
                } => {
                    let ticket = OpenedTicket {
                        uuid: Uuid::new_v4(),
                        topic: topic.clone(),
                        assignee: assignee.clone(),
                        note: note.clone(),
                    };
                    contact.tickets.push(ticket.uuid);
                    events.push(Event::new(EventKind::TicketOpened { ticket }));
                }
            }
        }

        if reevaluate_groups {
            let (added, removed) = reevaluate(oa, &contact);
            if !added.is_empty() || !removed.is_empty() {
                events.push(Event::new(EventKind::ContactGroupsChanged {
                    groups_added: added,
                    groups_removed: removed,
                }));
            }
        }

        Ok(events)
    }

    async fn evaluate_template(
        &self,
        _oa: &OrgAssets,
        contact: &EngineContact,
        context: &Value,
        template: &str,
    ) -> Result<String> {
        Ok(evaluate(template, contact, context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ids::ContactID;

    fn contact() -> EngineContact {
        let mut fields = BTreeMap::new();
        fields.insert("gender".to_string(), FieldValue::parse("Female", chrono_tz::UTC));
        EngineContact {
            uuid: Uuid::new_v4(),
            id: ContactID(10),
            name: Some("Cathy Quincy".to_string()),
            language: Some("kin".to_string()),
            status: ContactStatus::Active,
            created_on: Utc::now(),
            last_seen_on: None,
            urns: vec!["tel:+16055741111".to_string()],
            groups: Vec::new(),
            fields,
            tickets: Vec::new(),
        }
    }

    #[test]
    fn test_evaluate() {
        let c = contact();
        let ctx = json!({"results": {"color": {"value": "red", "category": "Red"}}, "params": {"n": 3}});

        assert_eq!(evaluate("Hi @contact.first_name!", &c, &ctx), "Hi Cathy!");
        assert_eq!(evaluate("You are @fields.gender.", &c, &ctx), "You are Female.");
        assert_eq!(evaluate("Color: @results.color", &c, &ctx), "Color: red");
        assert_eq!(evaluate("n=@params.n", &c, &ctx), "n=3");
        assert_eq!(evaluate("mail bob@example.com", &c, &ctx), "mail bob@example.com");
        assert_eq!(evaluate("@@contact", &c, &ctx), "@contact");
    }

    #[test]
    fn test_query_matches() {
        let mut c = contact();
        assert_eq!(query_matches("language = kin", &c), Some(true));
        assert_eq!(query_matches("language = \"eng\"", &c), Some(false));
        assert_eq!(query_matches("gender = female AND language != eng", &c), Some(true));
        assert_eq!(query_matches("urn = \"\"", &c), Some(false));
        assert_eq!(query_matches("urn = tel:+16055741111", &c), Some(true));
        assert_eq!(query_matches("nonsense", &c), None);

        c.urns.clear();
        assert_eq!(query_matches("urn = \"\"", &c), Some(true));
    }
}
