// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The interface to the flow engine.
//!
//! The engine owns flow semantics: it evaluates expressions, routes between nodes and decides
//! what a sprint produces. This crate only ever sees its output as [`EngineSession`] snapshots
//! and [`Sprint`]s, and never keeps a live engine session across sprints. Every sprint starts
//! from the serialized `output` of the previous one.

pub mod events;
pub mod mock;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use self::events::{Event, EventKind, MsgIn, MsgOut, OpenedTicket, UnsendableReason};
use crate::assets::OrgAssets;
use crate::error::Result;
use crate::models::contact::ContactStatus;
use crate::models::field::{FieldRef, FieldValue};
use crate::models::flow::{FlowRef, FlowType};
use crate::models::group::GroupRef;
use crate::models::ids::ContactID;
use crate::models::optin::OptInRef;
use crate::models::org::UserRef;
use crate::models::run::RunStatus;
use crate::models::session::SessionStatus;
use crate::models::topic::TopicRef;

/// A contact as the engine sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineContact {
    pub uuid: Uuid,
    pub id: ContactID,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub status: ContactStatus,
    pub created_on: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_on: Option<DateTime<Utc>>,
    /// URNs in priority order, each with its preferred channel as `?channel={uuid}`.
    #[serde(default)]
    pub urns: Vec<String>,
    #[serde(default)]
    pub groups: Vec<GroupRef>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(default)]
    pub tickets: Vec<Uuid>,
}

/// One node visit in a run's path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub uuid: Uuid,
    pub node_uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_uuid: Option<Uuid>,
    pub arrived_on: DateTime<Utc>,
}

/// A result saved by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub category: String,
    pub node_uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    pub created_on: DateTime<Utc>,
}

/// Snakifies a result name into the key results are stored under.
pub fn result_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len());
    let mut last_underscore = true;
    for c in name.trim().chars() {
        if c.is_alphanumeric() {
            key.extend(c.to_lowercase());
            last_underscore = false;
        } else if !last_underscore {
            key.push('_');
            last_underscore = true;
        }
    }
    key.trim_end_matches('_').to_string()
}

/// One flow execution within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineRun {
    pub uuid: Uuid,
    pub flow: FlowRef,
    pub status: RunStatus,
    #[serde(default)]
    pub path: Vec<Step>,
    #[serde(default)]
    pub results: BTreeMap<String, RunResult>,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_uuid: Option<Uuid>,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exited_on: Option<DateTime<Utc>>,
}

impl EngineRun {
    /// Whether the contact sent a message during this run.
    pub fn responded(&self) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e.kind, EventKind::MsgReceived { .. }))
    }

    pub fn is_active_or_waiting(&self) -> bool {
        matches!(self.status, RunStatus::Active | RunStatus::Waiting)
    }
}

/// What a waiting session is waiting for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wait {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_on: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,
}

/// A snapshot of an engine session after a sprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSession {
    pub uuid: Uuid,
    pub session_type: FlowType,
    pub status: SessionStatus,
    pub contact: EngineContact,
    #[serde(default)]
    pub runs: Vec<EngineRun>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<Wait>,
}

impl EngineSession {
    /// The serialized session, what gets persisted between sprints.
    pub fn output(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The run the session is waiting in, if any.
    pub fn waiting_run(&self) -> Option<&EngineRun> {
        self.runs.iter().find(|r| r.status == RunStatus::Waiting)
    }

    pub fn run_by_uuid(&self, uuid: Uuid) -> Option<&EngineRun> {
        self.runs.iter().find(|r| r.uuid == uuid)
    }

    /// Whether an expiring wait should resume the session rather than end it, which is the
    /// case when the waiting run was entered from a parent messaging run.
    pub fn resume_on_expire(&self) -> bool {
        self.session_type == FlowType::Messaging
            && self
                .waiting_run()
                .and_then(|r| r.parent_uuid)
                .and_then(|p| self.run_by_uuid(p))
                .is_some_and(|p| p.is_active_or_waiting())
    }

    /// Resolves the flow and node of the step that produced an event.
    pub fn locate_event(&self, step_uuid: Uuid) -> Option<(&FlowRef, Uuid)> {
        self.runs.iter().find_map(|run| {
            run.path
                .iter()
                .find(|s| s.uuid == step_uuid)
                .map(|s| (&run.flow, s.node_uuid))
        })
    }
}

/// A transition between two nodes made during a sprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub flow: FlowRef,
    pub node_uuid: Uuid,
    pub exit_uuid: Uuid,
    pub dest_uuid: Uuid,
    #[serde(default)]
    pub ui_type: String,
    #[serde(default)]
    pub operand: String,
    pub time: DateTime<Utc>,
}

/// The output of one engine advance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sprint {
    pub uuid: Uuid,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

impl Sprint {
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            events: Vec::new(),
            segments: Vec::new(),
        }
    }
}

impl Default for Sprint {
    fn default() -> Self {
        Self::new()
    }
}

/// What caused a session to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    Manual {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<UserRef>,
    },
    Msg {
        msg: MsgIn,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        keyword: Option<String>,
    },
    Campaign {
        point_uuid: Uuid,
    },
    Channel {
        event_type: String,
        #[serde(default)]
        extra: serde_json::Value,
    },
    FlowAction {
        run_summary: serde_json::Value,
        #[serde(default)]
        history: serde_json::Value,
    },
    Optin {
        optin: OptInRef,
    },
}

/// A request to start a flow for a contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub flow: FlowRef,
    #[serde(flatten)]
    pub kind: TriggerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    /// Set for sessions of a voice call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_uuid: Option<Uuid>,
    pub triggered_on: DateTime<Utc>,
}

impl Trigger {
    pub fn new(flow: FlowRef, kind: TriggerKind) -> Self {
        Self {
            flow,
            kind,
            params: None,
            call_uuid: None,
            triggered_on: Utc::now(),
        }
    }

    pub fn with_params(mut self, params: Option<serde_json::Value>) -> Self {
        self.params = params;
        self
    }
}

/// What a waiting session is resumed with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resume {
    Msg { msg: MsgIn },
    WaitExpiration,
    WaitTimeout,
    Dial { status: String, duration: i32 },
}

/// Whether a group modifier adds or removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupModification {
    Add,
    Remove,
}

/// How a URNs modifier changes the contact's URN list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrnsModification {
    Append,
    Remove,
    Set,
}

/// A change to a contact made outside of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Modifier {
    Name {
        name: Option<String>,
    },
    Language {
        language: Option<String>,
    },
    Field {
        field: FieldRef,
        value: Option<String>,
    },
    Groups {
        groups: Vec<GroupRef>,
        modification: GroupModification,
    },
    Status {
        status: ContactStatus,
    },
    Urns {
        urns: Vec<String>,
        modification: UrnsModification,
    },
    Ticket {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<TopicRef>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assignee: Option<UserRef>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
}

/// The flow engine.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Starts a new session for a contact, running it up to its first wait or its end.
    async fn start_session(
        &self,
        oa: &OrgAssets,
        contact: &EngineContact,
        trigger: &Trigger,
    ) -> Result<(EngineSession, Sprint)>;

    /// Resumes a waiting session from its serialized output.
    async fn resume_session(
        &self,
        oa: &OrgAssets,
        contact: &EngineContact,
        output: &str,
        resume: &Resume,
    ) -> Result<(EngineSession, Sprint)>;

    /// Reads a serialized session without advancing it.
    async fn read_session(&self, oa: &OrgAssets, output: &str) -> Result<EngineSession>;

    /// Works out which query groups a contact should join and leave.
    async fn reevaluate_query_groups(
        &self,
        oa: &OrgAssets,
        contact: &EngineContact,
    ) -> Result<(Vec<GroupRef>, Vec<GroupRef>)>;

    /// Applies modifiers to a contact, returning the events describing what changed.
    async fn apply_modifiers(
        &self,
        oa: &OrgAssets,
        contact: &EngineContact,
        modifiers: &[Modifier],
    ) -> Result<Vec<Event>>;

    /// Evaluates a message template against a contact and an extra context.
    async fn evaluate_template(
        &self,
        oa: &OrgAssets,
        contact: &EngineContact,
        context: &serde_json::Value,
        template: &str,
    ) -> Result<String>;
}
