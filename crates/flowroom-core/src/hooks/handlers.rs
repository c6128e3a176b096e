// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One handler per event type.
//!
//! Handlers never write anything themselves. They resolve what an event refers to against the
//! org's assets, keep the scene's contact up to date for the events that follow, and attach
//! items for the hooks to write.

use std::collections::HashMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{HookItem, HookKind, PendingStart, Scene, TicketChange};
use crate::assets::OrgAssets;
use crate::engine::{self, Event, EventKind, MsgOut};
use crate::error::Result;
use crate::models::contact::{self, ContactTicket, FieldChange};
use crate::models::field::FieldValue;
use crate::models::flow_start::{FlowStart, StartType};
use crate::models::http_log::{AirtimeStatus, AirtimeTransfer, HttpLog, HttpLogType};
use crate::models::ids::{AirtimeTransferID, GroupID, TicketID, UserID};
use crate::models::incident;
use crate::models::label::MsgLabelAdd;
use crate::models::msg::{self, MsgOrigin, MsgStatus, MsgType};
use crate::models::org::UserRef;
use crate::models::ticket::Ticket;
use crate::runtime::Runtime;

/// Handles one type of event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, rt: &Runtime, oa: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<()>;
}

static HANDLERS: LazyLock<HashMap<&'static str, Box<dyn EventHandler>>> = LazyLock::new(|| {
    let mut m: HashMap<&'static str, Box<dyn EventHandler>> = HashMap::new();
    m.insert("msg_created", Box::new(MsgCreated));
    m.insert("msg_received", Box::new(MsgReceived));
    m.insert("ivr_created", Box::new(IvrCreated));
    m.insert("contact_field_changed", Box::new(ContactFieldChanged));
    m.insert("contact_groups_changed", Box::new(ContactGroupsChanged));
    m.insert("contact_language_changed", Box::new(ContactLanguageChanged));
    m.insert("contact_name_changed", Box::new(ContactNameChanged));
    m.insert("contact_status_changed", Box::new(ContactStatusChanged));
    m.insert("contact_urns_changed", Box::new(ContactUrnsChanged));
    m.insert("session_triggered", Box::new(SessionTriggered));
    m.insert("ticket_opened", Box::new(TicketOpened));
    m.insert("ticket_assigned", Box::new(TicketEvent));
    m.insert("ticket_topic_changed", Box::new(TicketEvent));
    m.insert("ticket_closed", Box::new(TicketEvent));
    m.insert("ticket_reopened", Box::new(TicketEvent));
    m.insert("note_added", Box::new(TicketEvent));
    m.insert("email_sent", Box::new(LogOnly));
    m.insert("airtime_transferred", Box::new(AirtimeTransferred));
    m.insert("webhook_called", Box::new(WebhookCalled));
    m.insert("service_called", Box::new(ServiceCalled));
    m.insert("run_result_changed", Box::new(RunResultChanged));
    m.insert("flow_entered", Box::new(LogOnly));
    m.insert("optin_requested", Box::new(OptinRequested));
    m.insert("input_labels_added", Box::new(InputLabelsAdded));
    m.insert("error", Box::new(LogOnly));
    m.insert("failure", Box::new(LogOnly));
    m.insert("sprint_ended", Box::new(SprintEnded));
    m
});

/// The handler registered for an event type.
pub fn handler_for(type_name: &str) -> Option<&'static dyn EventHandler> {
    HANDLERS.get(type_name).map(|h| h.as_ref())
}

fn user_id_for(oa: &OrgAssets, user: Option<&UserRef>) -> UserID {
    user.and_then(|u| oa.user_by_email(&u.email))
        .map(|u| u.id)
        .unwrap_or_default()
}

struct MsgCreated;

#[async_trait]
impl EventHandler for MsgCreated {
    async fn handle(&self, rt: &Runtime, oa: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<()> {
        let EventKind::MsgCreated { msg: out } = &event.kind else {
            return Ok(());
        };

        let flow_id = scene.flow_id_for(oa, event);
        let opts = rt.msg_options(MsgOrigin::Flow(flow_id), scene.reply_to(), MsgType::Text);
        let out = msg::new_msg_out(&rt.redis, oa, &scene.contact, out, opts).await?;

        scene.attach(HookKind::Msgs, HookItem::OutgoingMsg(Box::new(out)));
        Ok(())
    }
}

struct IvrCreated;

#[async_trait]
impl EventHandler for IvrCreated {
    async fn handle(&self, rt: &Runtime, oa: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<()> {
        let EventKind::IvrCreated { msg: out } = &event.kind else {
            return Ok(());
        };

        let flow_id = scene.flow_id_for(oa, event);
        let opts = rt.msg_options(MsgOrigin::Flow(flow_id), None, MsgType::Voice);
        let mut out = msg::new_msg_out(&rt.redis, oa, &scene.contact, out, opts).await?;

        // voice prompts are played on the live call, never queued
        if out.msg.status != MsgStatus::Failed {
            out.msg.status = MsgStatus::Wired;
        }

        scene.attach(HookKind::Msgs, HookItem::OutgoingMsg(Box::new(out)));
        Ok(())
    }
}

struct MsgReceived;

#[async_trait]
impl EventHandler for MsgReceived {
    async fn handle(&self, _: &Runtime, oa: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<()> {
        let EventKind::MsgReceived { msg } = &event.kind else {
            return Ok(());
        };

        if !msg.id.is_nil() {
            let flow_id = scene.flow_id_for(oa, event);
            scene.attach(
                HookKind::Msgs,
                HookItem::HandledMsg {
                    msg_id: msg.id,
                    flow_id,
                },
            );
        }

        scene.contact.last_seen_on = Some(event.created_on);
        scene.attach(HookKind::ContactLastSeen, HookItem::LastSeen(event.created_on));
        Ok(())
    }
}

struct ContactFieldChanged;

#[async_trait]
impl EventHandler for ContactFieldChanged {
    async fn handle(&self, _: &Runtime, oa: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<()> {
        let EventKind::ContactFieldChanged { field, value } = &event.kind else {
            return Ok(());
        };

        let Some(f) = oa.field_by_key(&field.key) else {
            warn!(key = %field.key, "Ignoring change to unknown field");
            return Ok(());
        };

        let value = match value.as_deref().filter(|v| !v.is_empty()) {
            Some(text) => match FieldValue::parse_for(f, text, oa.tz()) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(key = %field.key, error = %e, "Ignoring invalid field value");
                    return Ok(());
                }
            },
            None => None,
        };

        match &value {
            Some(v) => scene.contact.fields.insert(f.key.clone(), v.clone()),
            None => scene.contact.fields.remove(&f.key),
        };

        scene.attach(
            HookKind::ContactFields,
            HookItem::Field(FieldChange {
                contact_id: scene.contact.id,
                key: f.key.clone(),
                value,
            }),
        );
        scene.attach(HookKind::ContactModified, HookItem::Modified);
        Ok(())
    }
}

struct ContactGroupsChanged;

#[async_trait]
impl EventHandler for ContactGroupsChanged {
    async fn handle(&self, _: &Runtime, oa: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<()> {
        let EventKind::ContactGroupsChanged {
            groups_added,
            groups_removed,
        } = &event.kind
        else {
            return Ok(());
        };

        let resolve = |refs: &[crate::models::group::GroupRef]| -> Vec<GroupID> {
            refs.iter()
                .filter_map(|g| match oa.group_by_uuid(g.uuid) {
                    Some(group) => Some(group.id),
                    None => {
                        warn!(group_uuid = %g.uuid, "Ignoring change to unknown group");
                        None
                    }
                })
                .collect()
        };
        let added = resolve(groups_added);
        let removed = resolve(groups_removed);

        for id in &added {
            if !scene.contact.group_ids.contains(id) {
                scene.contact.group_ids.push(*id);
            }
        }
        scene.contact.group_ids.retain(|id| !removed.contains(id));

        scene.attach(
            HookKind::ContactGroups,
            HookItem::Groups {
                added: added.clone(),
                removed: removed.clone(),
            },
        );
        scene.attach(
            HookKind::CampaignFires,
            HookItem::CampaignGroups {
                joined: added,
                left: removed,
            },
        );
        scene.attach(HookKind::ContactModified, HookItem::Touched);
        Ok(())
    }
}

struct ContactLanguageChanged;

#[async_trait]
impl EventHandler for ContactLanguageChanged {
    async fn handle(&self, _: &Runtime, _: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<()> {
        let EventKind::ContactLanguageChanged { language } = &event.kind else {
            return Ok(());
        };

        scene.contact.language = Some(language.clone()).filter(|l| !l.is_empty());
        scene.attach(HookKind::ContactLanguage, HookItem::Language(language.clone()));
        scene.attach(HookKind::ContactModified, HookItem::Modified);
        Ok(())
    }
}

struct ContactNameChanged;

#[async_trait]
impl EventHandler for ContactNameChanged {
    async fn handle(&self, _: &Runtime, _: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<()> {
        let EventKind::ContactNameChanged { name } = &event.kind else {
            return Ok(());
        };

        scene.contact.name = Some(name.clone()).filter(|n| !n.is_empty());
        scene.attach(HookKind::ContactName, HookItem::Name(name.clone()));
        scene.attach(HookKind::ContactModified, HookItem::Modified);
        Ok(())
    }
}

struct ContactStatusChanged;

#[async_trait]
impl EventHandler for ContactStatusChanged {
    async fn handle(&self, _: &Runtime, _: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<()> {
        let EventKind::ContactStatusChanged { status } = &event.kind else {
            return Ok(());
        };

        scene.contact.status = *status;
        scene.attach(HookKind::ContactStatus, HookItem::Status(*status));
        scene.attach(HookKind::ContactModified, HookItem::Modified);
        Ok(())
    }
}

struct ContactUrnsChanged;

#[async_trait]
impl EventHandler for ContactUrnsChanged {
    async fn handle(&self, _: &Runtime, oa: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<()> {
        let EventKind::ContactUrnsChanged { urns } = &event.kind else {
            return Ok(());
        };

        let normalized = contact::normalize_urns(oa, urns)?;
        scene.attach(
            HookKind::ContactUrns,
            HookItem::Urns(normalized.iter().map(ToString::to_string).collect()),
        );
        scene.attach(HookKind::ContactModified, HookItem::Modified);
        Ok(())
    }
}

struct SessionTriggered;

#[async_trait]
impl EventHandler for SessionTriggered {
    async fn handle(&self, _: &Runtime, oa: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<()> {
        let EventKind::SessionTriggered {
            flow,
            groups,
            contacts,
            urns,
            contact_query,
            create_contact,
            run_summary,
            history,
        } = &event.kind
        else {
            return Ok(());
        };

        let Some(target) = oa.flow_by_uuid(flow.uuid) else {
            warn!(flow_uuid = %flow.uuid, "Ignoring trigger of unknown flow");
            return Ok(());
        };

        let group_ids: Vec<GroupID> = groups
            .iter()
            .filter_map(|g| oa.group_by_uuid(g.uuid).map(|g| g.id))
            .collect();

        let mut start = FlowStart::new(oa.org_id(), StartType::FlowAction, target.id)
            .with_group_ids(&group_ids)
            .with_urns(urns)
            .with_create_contact(*create_contact)
            .with_parent(run_summary.clone(), history.clone());
        if let Some(query) = contact_query.as_deref().filter(|q| !q.is_empty()) {
            start = start.with_query(query);
        }

        scene.attach(
            HookKind::FlowStarts,
            HookItem::FlowStart(Box::new(PendingStart {
                start,
                contact_uuids: contacts.clone(),
            })),
        );
        Ok(())
    }
}

struct TicketOpened;

#[async_trait]
impl EventHandler for TicketOpened {
    async fn handle(&self, _: &Runtime, oa: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<()> {
        let EventKind::TicketOpened { ticket: opened } = &event.kind else {
            return Ok(());
        };

        let topic = match opened.topic.as_ref().and_then(|t| oa.topic_by_uuid(t.uuid)) {
            Some(t) => t,
            None => oa.default_topic()?,
        };
        let assignee_id = user_id_for(oa, opened.assignee.as_ref());
        let flow_id = scene.flow_id_for(oa, event);

        let ticket = Ticket::new(
            opened.uuid,
            oa.org_id(),
            scene.contact.id,
            topic.id,
            assignee_id,
            scene.user_id,
            flow_id,
        );

        scene.contact.tickets.push(ContactTicket {
            id: TicketID(0),
            uuid: ticket.uuid,
            topic_id: ticket.topic_id,
            assignee_id,
        });
        scene.attach(
            HookKind::OpenTickets,
            HookItem::OpenTicket {
                ticket: Box::new(ticket),
                note: opened.note.clone(),
            },
        );
        scene.attach(HookKind::ContactModified, HookItem::Touched);
        Ok(())
    }
}

/// Changes to existing tickets, which all go through the same hook.
struct TicketEvent;

#[async_trait]
impl EventHandler for TicketEvent {
    async fn handle(&self, _: &Runtime, oa: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<()> {
        let (ticket_uuid, change) = match &event.kind {
            EventKind::TicketAssigned { ticket_uuid, assignee } => {
                (*ticket_uuid, TicketChange::Assigned(user_id_for(oa, assignee.as_ref())))
            }
            EventKind::TicketTopicChanged { ticket_uuid, topic } => match oa.topic_by_uuid(topic.uuid) {
                Some(t) => (*ticket_uuid, TicketChange::TopicChanged(t.id)),
                None => {
                    warn!(topic_uuid = %topic.uuid, "Ignoring change to unknown topic");
                    return Ok(());
                }
            },
            EventKind::TicketClosed { ticket_uuid } => (*ticket_uuid, TicketChange::Closed),
            EventKind::TicketReopened { ticket_uuid } => (*ticket_uuid, TicketChange::Reopened),
            EventKind::NoteAdded { ticket_uuid, note } => (*ticket_uuid, TicketChange::NoteAdded(note.clone())),
            _ => return Ok(()),
        };

        if matches!(change, TicketChange::Closed) {
            scene.contact.tickets.retain(|t| t.uuid != ticket_uuid);
        }

        scene.attach(HookKind::TicketEvents, HookItem::TicketChange { ticket_uuid, change });
        Ok(())
    }
}

struct AirtimeTransferred;

#[async_trait]
impl EventHandler for AirtimeTransferred {
    async fn handle(&self, _: &Runtime, oa: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<()> {
        let EventKind::AirtimeTransferred { transfer } = &event.kind else {
            return Ok(());
        };

        let status = if transfer.actual_amount > 0.0 {
            AirtimeStatus::Success
        } else {
            AirtimeStatus::Failed
        };

        let logs = transfer
            .http_logs
            .iter()
            .map(|t| HttpLog::from_trace(oa.org_id(), HttpLogType::AirtimeTransferred, t))
            .collect();

        scene.attach(
            HookKind::HttpLogs,
            HookItem::Airtime(Box::new(AirtimeTransfer {
                id: AirtimeTransferID(0),
                uuid: transfer.uuid,
                org_id: oa.org_id(),
                status,
                contact_id: scene.contact.id,
                sender: transfer.sender.clone(),
                recipient: transfer.recipient.clone(),
                currency: transfer.currency.clone(),
                desired_amount: transfer.desired_amount,
                actual_amount: transfer.actual_amount,
                external_id: transfer.external_id.clone(),
                created_on: event.created_on,
                logs,
            })),
        );
        Ok(())
    }
}

struct WebhookCalled;

#[async_trait]
impl EventHandler for WebhookCalled {
    async fn handle(&self, _: &Runtime, oa: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<()> {
        let EventKind::WebhookCalled { trace, resthook } = &event.kind else {
            return Ok(());
        };

        let mut log = HttpLog::from_trace(oa.org_id(), HttpLogType::WebhookCalled, trace);
        log.flow_id = scene.flow_id_for(oa, event);
        scene.attach(HookKind::HttpLogs, HookItem::HttpLog(Box::new(log)));

        // resthooks go to many subscribers so say nothing about one node's health
        if resthook.is_none() {
            if let Some((_, node_uuid)) = scene.locate(event) {
                scene.attach(
                    HookKind::WebhookHealth,
                    HookItem::WebhookCall {
                        node_uuid,
                        healthy: incident::is_healthy_call(trace),
                    },
                );
            }
        }
        Ok(())
    }
}

struct ServiceCalled;

#[async_trait]
impl EventHandler for ServiceCalled {
    async fn handle(&self, _: &Runtime, oa: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<()> {
        let EventKind::ServiceCalled {
            service,
            classifier_uuid,
            llm_uuid,
            http_logs,
        } = &event.kind
        else {
            return Ok(());
        };

        let classifier = classifier_uuid.and_then(|u| oa.classifier_by_uuid(u));
        let llm = llm_uuid.and_then(|u| oa.llm_by_uuid(u));
        let log_type = if llm.is_some() {
            HttpLogType::LlmCalled
        } else {
            HttpLogType::ClassifierCalled
        };
        if classifier.is_none() && llm.is_none() {
            debug!(service = %service, "Service call without a known classifier or LLM");
        }

        let flow_id = scene.flow_id_for(oa, event);
        for trace in http_logs {
            let mut log = HttpLog::from_trace(oa.org_id(), log_type, trace);
            log.flow_id = flow_id;
            if let Some(c) = classifier {
                log.classifier_id = c.id;
            }
            if let Some(l) = llm {
                log.llm_id = l.id;
            }
            scene.attach(HookKind::HttpLogs, HookItem::HttpLog(Box::new(log)));
        }
        Ok(())
    }
}

struct RunResultChanged;

#[async_trait]
impl EventHandler for RunResultChanged {
    async fn handle(&self, _: &Runtime, oa: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<()> {
        let EventKind::RunResultChanged {
            name,
            category,
            previous_category,
            ..
        } = &event.kind
        else {
            return Ok(());
        };

        let flow_id = scene.flow_id_for(oa, event);
        if flow_id.is_nil() {
            return Ok(());
        }

        scene.attach(
            HookKind::FlowStats,
            HookItem::ResultChange {
                flow_id,
                key: engine::result_key(name),
                previous: Some(previous_category.clone()).filter(|c| !c.is_empty()),
                category: category.clone(),
            },
        );
        Ok(())
    }
}

struct OptinRequested;

#[async_trait]
impl EventHandler for OptinRequested {
    async fn handle(&self, rt: &Runtime, oa: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<()> {
        let EventKind::OptinRequested { optin, channel, urn } = &event.kind else {
            return Ok(());
        };

        let Some(o) = oa.optin_by_uuid(optin.uuid) else {
            warn!(optin_uuid = %optin.uuid, "Ignoring request for unknown opt-in");
            return Ok(());
        };

        let out = MsgOut::new(Some(urn.clone()), Some(channel.clone()), "");
        let opts = rt.msg_options(MsgOrigin::Optin(o.id), scene.reply_to(), MsgType::Optin);
        let out = msg::new_msg_out(&rt.redis, oa, &scene.contact, &out, opts).await?;

        scene.attach(HookKind::Msgs, HookItem::OutgoingMsg(Box::new(out)));
        Ok(())
    }
}

struct InputLabelsAdded;

#[async_trait]
impl EventHandler for InputLabelsAdded {
    async fn handle(&self, _: &Runtime, oa: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<()> {
        let EventKind::InputLabelsAdded { input_uuid, labels } = &event.kind else {
            return Ok(());
        };

        // only the message that resumed the session has a row to label
        let Some(msg_id) = scene
            .incoming
            .as_ref()
            .filter(|m| m.uuid == *input_uuid && !m.id.is_nil())
            .map(|m| m.id)
        else {
            return Ok(());
        };

        for label in labels {
            if let Some(l) = oa.label_by_uuid(label.uuid) {
                scene.attach(
                    HookKind::MsgLabels,
                    HookItem::MsgLabel(MsgLabelAdd {
                        msg_id,
                        label_id: l.id,
                    }),
                );
            }
        }
        Ok(())
    }
}

/// Events with nothing to write.
struct LogOnly;

#[async_trait]
impl EventHandler for LogOnly {
    async fn handle(&self, _: &Runtime, _: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<()> {
        match &event.kind {
            EventKind::Error { text } => {
                warn!(contact_uuid = %scene.contact.uuid, error = %text, "Engine reported an error")
            }
            EventKind::Failure { text } => {
                warn!(contact_uuid = %scene.contact.uuid, failure = %text, "Session failed")
            }
            EventKind::EmailSent { to, subject, .. } => {
                debug!(contact_uuid = %scene.contact.uuid, to = ?to, subject = %subject, "Email sent")
            }
            EventKind::FlowEntered { flow, .. } => {
                debug!(contact_uuid = %scene.contact.uuid, flow_uuid = %flow.uuid, "Flow entered")
            }
            _ => {}
        }
        Ok(())
    }
}

struct SprintEnded;

#[async_trait]
impl EventHandler for SprintEnded {
    async fn handle(&self, _: &Runtime, _: &OrgAssets, scene: &mut Scene, _: &Event) -> Result<()> {
        scene.attach(HookKind::ContactModified, HookItem::Touched);
        if scene.sprint.is_some() {
            scene.attach(HookKind::FlowStats, HookItem::SprintEnded);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_event_type_has_handler() {
        let names = [
            "msg_created",
            "msg_received",
            "ivr_created",
            "contact_field_changed",
            "contact_groups_changed",
            "contact_language_changed",
            "contact_name_changed",
            "contact_status_changed",
            "contact_urns_changed",
            "session_triggered",
            "ticket_opened",
            "ticket_assigned",
            "ticket_topic_changed",
            "ticket_closed",
            "ticket_reopened",
            "note_added",
            "email_sent",
            "airtime_transferred",
            "webhook_called",
            "service_called",
            "run_result_changed",
            "flow_entered",
            "optin_requested",
            "input_labels_added",
            "error",
            "failure",
            "sprint_ended",
        ];
        for name in names {
            assert!(handler_for(name).is_some(), "no handler for {}", name);
        }
        assert_eq!(HANDLERS.len(), names.len());
        assert!(handler_for("contact_exploded").is_none());
    }

    #[test]
    fn test_user_id_for() {
        let oa = OrgAssets::for_tests();
        assert!(user_id_for(&oa, None).is_nil());
        assert!(
            user_id_for(
                &oa,
                Some(&UserRef {
                    email: "bob@nyaruka.com".to_string(),
                    name: "Bob".to_string(),
                })
            )
            .is_nil()
        );
    }
}
