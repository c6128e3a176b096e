// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Events produced by the engine.
//!
//! Events are a closed set. Each carries a `type` discriminant and a typed payload, and the
//! hook dispatcher looks handlers up by [`EventKind::type_name`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::channel::ChannelRef;
use crate::models::contact::ContactStatus;
use crate::models::field::FieldRef;
use crate::models::flow::FlowRef;
use crate::models::group::GroupRef;
use crate::models::http_log::HttpTrace;
use crate::models::ids::MsgID;
use crate::models::label::LabelRef;
use crate::models::optin::OptInRef;
use crate::models::org::UserRef;
use crate::models::template::MsgTemplating;
use crate::models::topic::TopicRef;

/// Why the engine decided a message can't be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsendableReason {
    ContactStatus,
    NoDestination,
}

/// An outgoing message as created by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgOut {
    pub uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelRef>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quick_replies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub templating: Option<MsgTemplating>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsendable_reason: Option<UnsendableReason>,
}

impl MsgOut {
    pub fn new(urn: Option<String>, channel: Option<ChannelRef>, text: &str) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            urn,
            channel,
            text: text.to_string(),
            attachments: Vec::new(),
            quick_replies: Vec::new(),
            templating: None,
            locale: None,
            unsendable_reason: None,
        }
    }
}

/// An incoming message as seen by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgIn {
    pub uuid: Uuid,
    #[serde(default)]
    pub id: MsgID,
    pub urn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelRef>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

/// A ticket as opened by a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenedTicket {
    pub uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<TopicRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<UserRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// An airtime transfer attempted by a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferAttempt {
    pub uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    pub recipient: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    pub desired_amount: f64,
    pub actual_amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default)]
    pub http_logs: Vec<HttpTrace>,
}

/// The payload of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    MsgCreated {
        msg: MsgOut,
    },
    MsgReceived {
        msg: MsgIn,
    },
    IvrCreated {
        msg: MsgOut,
    },
    ContactFieldChanged {
        field: FieldRef,
        value: Option<String>,
    },
    ContactGroupsChanged {
        #[serde(default)]
        groups_added: Vec<GroupRef>,
        #[serde(default)]
        groups_removed: Vec<GroupRef>,
    },
    ContactLanguageChanged {
        language: String,
    },
    ContactNameChanged {
        name: String,
    },
    ContactStatusChanged {
        status: ContactStatus,
    },
    ContactUrnsChanged {
        urns: Vec<String>,
    },
    SessionTriggered {
        flow: FlowRef,
        #[serde(default)]
        groups: Vec<GroupRef>,
        #[serde(default)]
        contacts: Vec<Uuid>,
        #[serde(default)]
        urns: Vec<String>,
        #[serde(default)]
        contact_query: Option<String>,
        #[serde(default)]
        create_contact: bool,
        #[serde(default)]
        run_summary: serde_json::Value,
        #[serde(default)]
        history: serde_json::Value,
    },
    TicketOpened {
        ticket: OpenedTicket,
    },
    TicketAssigned {
        ticket_uuid: Uuid,
        assignee: Option<UserRef>,
    },
    TicketTopicChanged {
        ticket_uuid: Uuid,
        topic: TopicRef,
    },
    TicketClosed {
        ticket_uuid: Uuid,
    },
    TicketReopened {
        ticket_uuid: Uuid,
    },
    NoteAdded {
        ticket_uuid: Uuid,
        note: String,
    },
    EmailSent {
        to: Vec<String>,
        subject: String,
        body: String,
    },
    AirtimeTransferred {
        transfer: TransferAttempt,
    },
    WebhookCalled {
        trace: HttpTrace,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resthook: Option<String>,
    },
    ServiceCalled {
        service: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        classifier_uuid: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        llm_uuid: Option<Uuid>,
        http_logs: Vec<HttpTrace>,
    },
    RunResultChanged {
        name: String,
        value: String,
        category: String,
        #[serde(default)]
        previous_category: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<String>,
    },
    FlowEntered {
        flow: FlowRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_run_uuid: Option<Uuid>,
    },
    OptinRequested {
        optin: OptInRef,
        channel: ChannelRef,
        urn: String,
    },
    InputLabelsAdded {
        input_uuid: Uuid,
        labels: Vec<LabelRef>,
    },
    Error {
        text: String,
    },
    Failure {
        text: String,
    },
    /// Appended by the dispatcher to the end of every sprint.
    SprintEnded,
}

impl EventKind {
    /// The discriminant handlers are registered under.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::MsgCreated { .. } => "msg_created",
            Self::MsgReceived { .. } => "msg_received",
            Self::IvrCreated { .. } => "ivr_created",
            Self::ContactFieldChanged { .. } => "contact_field_changed",
            Self::ContactGroupsChanged { .. } => "contact_groups_changed",
            Self::ContactLanguageChanged { .. } => "contact_language_changed",
            Self::ContactNameChanged { .. } => "contact_name_changed",
            Self::ContactStatusChanged { .. } => "contact_status_changed",
            Self::ContactUrnsChanged { .. } => "contact_urns_changed",
            Self::SessionTriggered { .. } => "session_triggered",
            Self::TicketOpened { .. } => "ticket_opened",
            Self::TicketAssigned { .. } => "ticket_assigned",
            Self::TicketTopicChanged { .. } => "ticket_topic_changed",
            Self::TicketClosed { .. } => "ticket_closed",
            Self::TicketReopened { .. } => "ticket_reopened",
            Self::NoteAdded { .. } => "note_added",
            Self::EmailSent { .. } => "email_sent",
            Self::AirtimeTransferred { .. } => "airtime_transferred",
            Self::WebhookCalled { .. } => "webhook_called",
            Self::ServiceCalled { .. } => "service_called",
            Self::RunResultChanged { .. } => "run_result_changed",
            Self::FlowEntered { .. } => "flow_entered",
            Self::OptinRequested { .. } => "optin_requested",
            Self::InputLabelsAdded { .. } => "input_labels_added",
            Self::Error { .. } => "error",
            Self::Failure { .. } => "failure",
            Self::SprintEnded => "sprint_ended",
        }
    }
}

/// An event with the time it happened and the step that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub created_on: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_uuid: Option<Uuid>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    /// An event not tied to any step, as produced by modifiers.
    pub fn new(kind: EventKind) -> Self {
        Self {
            created_on: Utc::now(),
            step_uuid: None,
            kind,
        }
    }

    /// An event produced at a step of a run.
    pub fn at_step(step_uuid: Uuid, kind: EventKind) -> Self {
        Self {
            created_on: Utc::now(),
            step_uuid: Some(step_uuid),
            kind,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_json() {
        let step = Uuid::parse_str("3a4bd54e-9e50-4eb5-8a5e-7f8b8e0ff82c").unwrap();
        let event = Event::at_step(
            step,
            EventKind::ContactNameChanged {
                name: "Rich".to_string(),
            },
        );

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "contact_name_changed");
        assert_eq!(value["name"], "Rich");
        assert_eq!(value["step_uuid"], step.to_string());

        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.type_name(), "contact_name_changed");
    }

    #[test]
    fn test_parse_engine_event() {
        let event: Event = serde_json::from_value(json!({
            "type": "contact_groups_changed",
            "created_on": "2029-11-03T04:30:00Z",
            "groups_added": [{"uuid": "b7cf0d83-f1c9-411c-96fd-c511a4cfa86d", "name": "Testers"}]
        }))
        .unwrap();

        match &event.kind {
            EventKind::ContactGroupsChanged {
                groups_added,
                groups_removed,
            } => {
                assert_eq!(groups_added.len(), 1);
                assert_eq!(groups_added[0].name, "Testers");
                assert!(groups_removed.is_empty());
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(event.step_uuid, None);
    }

    #[test]
    fn test_sprint_ended() {
        let event = Event::new(EventKind::SprintEnded);
        assert_eq!(serde_json::to_value(&event).unwrap()["type"], "sprint_ended");
    }
}
