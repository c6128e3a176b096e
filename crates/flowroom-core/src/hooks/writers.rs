// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The hooks: one batched write per [`HookKind`] across every scene.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{HookItem, HookKind, Scene, TicketChange};
use crate::assets::OrgAssets;
use crate::error::{CoreError, Result};
use crate::models::campaign;
use crate::models::contact::{self, ContactStatus, FieldChange, UrnChange};
use crate::models::flow_start::{self, FlowStart};
use crate::models::group::{self, GroupChange};
use crate::models::http_log::{self, AirtimeTransfer, HttpLog};
use crate::models::ids::{ContactID, FlowID, GroupID, MsgID};
use crate::models::incident;
use crate::models::label::{self, MsgLabelAdd};
use crate::models::msg::{self, Msg, OutgoingMsg};
use crate::models::ticket::{self, Ticket};
use crate::runtime::Runtime;
use crate::stats::{self, FlowActivity, FlowResults};

type Items = Vec<(usize, HookItem)>;

pub(super) async fn execute(
    kind: HookKind,
    conn: &mut PgConnection,
    rt: &Runtime,
    oa: &OrgAssets,
    scenes: &mut [Scene],
    items: Items,
) -> Result<()> {
    match kind {
        HookKind::ContactName => write_names(conn, scenes, items).await,
        HookKind::ContactLanguage => write_languages(conn, scenes, items).await,
        HookKind::ContactFields => write_fields(conn, items).await,
        HookKind::ContactStatus => write_statuses(conn, scenes, items).await,
        HookKind::ContactUrns => write_urns(conn, rt, oa, scenes, items).await,
        HookKind::ContactGroups => write_groups(conn, scenes, items).await,
        HookKind::CampaignFires => write_campaign_fires(conn, oa, scenes, items).await,
        HookKind::ContactModified => write_modified(conn, rt, oa, scenes, items).await,
        HookKind::ContactLastSeen => write_last_seen(conn, scenes, items).await,
        HookKind::OpenTickets => write_opened_tickets(conn, oa, scenes, items).await,
        HookKind::TicketEvents => write_ticket_changes(conn, oa, scenes, items).await,
        HookKind::Msgs => write_msgs(conn, scenes, items).await,
        HookKind::HttpLogs => write_http_logs(conn, items).await,
        HookKind::MsgLabels => write_msg_labels(conn, items).await,
        HookKind::FlowStarts => write_flow_starts(conn, oa, scenes, items).await,
        HookKind::WebhookHealth => write_webhook_health(conn, rt, oa, items).await,
        HookKind::FlowStats => write_flow_stats(conn, oa, scenes, items).await,
    }
}

/// Keeps the last value per contact, in contact order.
fn last_per_contact<T>(scenes: &[Scene], items: impl IntoIterator<Item = (usize, T)>) -> Vec<(ContactID, T)> {
    let mut last = BTreeMap::new();
    for (i, v) in items {
        last.insert(scenes[i].contact.id, v);
    }
    last.into_iter().collect()
}

async fn write_names(conn: &mut PgConnection, scenes: &mut [Scene], items: Items) -> Result<()> {
    let names = last_per_contact(
        scenes,
        items.into_iter().filter_map(|(i, item)| match item {
            HookItem::Name(name) => Some((i, name)),
            _ => None,
        }),
    );
    contact::update_contact_names(conn, &names).await
}

async fn write_languages(conn: &mut PgConnection, scenes: &mut [Scene], items: Items) -> Result<()> {
    let languages = last_per_contact(
        scenes,
        items.into_iter().filter_map(|(i, item)| match item {
            HookItem::Language(language) => Some((i, language)),
            _ => None,
        }),
    );
    contact::update_contact_languages(conn, &languages).await
}

async fn write_fields(conn: &mut PgConnection, items: Items) -> Result<()> {
    let changes: Vec<FieldChange> = items
        .into_iter()
        .filter_map(|(_, item)| match item {
            HookItem::Field(change) => Some(change),
            _ => None,
        })
        .collect();
    contact::update_contact_fields(conn, &changes).await
}

async fn write_statuses(conn: &mut PgConnection, scenes: &mut [Scene], items: Items) -> Result<()> {
    let statuses: Vec<(ContactID, ContactStatus)> = last_per_contact(
        scenes,
        items.into_iter().filter_map(|(i, item)| match item {
            HookItem::Status(status) => Some((i, status)),
            _ => None,
        }),
    );
    contact::update_contact_status(conn, &statuses).await
}

async fn write_urns(
    conn: &mut PgConnection,
    rt: &Runtime,
    oa: &OrgAssets,
    scenes: &mut [Scene],
    items: Items,
) -> Result<()> {
    let changes: Vec<UrnChange> = last_per_contact(
        scenes,
        items.into_iter().filter_map(|(i, item)| match item {
            HookItem::Urns(urns) => Some((i, urns)),
            _ => None,
        }),
    )
    .into_iter()
    .map(|(contact_id, urns)| UrnChange { contact_id, urns })
    .collect();

    let stolen_from = contact::update_contact_urns(conn, rt.engine.as_ref(), oa, &changes).await?;
    if !stolen_from.is_empty() {
        debug!(contacts = stolen_from.len(), "URNs taken from other contacts");
    }
    Ok(())
}

/// The net membership change per contact and group, applying changes in order.
fn net_memberships(scenes: &[Scene], changes: &[(usize, Vec<GroupID>, Vec<GroupID>)]) -> BTreeMap<(ContactID, GroupID), bool> {
    let mut net = BTreeMap::new();
    for (i, added, removed) in changes {
        let contact_id = scenes[*i].contact.id;
        for g in added {
            net.insert((contact_id, *g), true);
        }
        for g in removed {
            net.insert((contact_id, *g), false);
        }
    }
    net
}

async fn write_groups(conn: &mut PgConnection, scenes: &mut [Scene], items: Items) -> Result<()> {
    let changes: Vec<(usize, Vec<GroupID>, Vec<GroupID>)> = items
        .into_iter()
        .filter_map(|(i, item)| match item {
            HookItem::Groups { added, removed } => Some((i, added, removed)),
            _ => None,
        })
        .collect();

    let (mut adds, mut removes) = (Vec::new(), Vec::new());
    for ((contact_id, group_id), joined) in net_memberships(scenes, &changes) {
        let change = GroupChange { contact_id, group_id };
        if joined {
            adds.push(change);
        } else {
            removes.push(change);
        }
    }

    group::add_contacts_to_groups(conn, &adds).await?;
    group::remove_contacts_from_groups(conn, &removes).await
}

async fn write_campaign_fires(conn: &mut PgConnection, oa: &OrgAssets, scenes: &mut [Scene], items: Items) -> Result<()> {
    if oa.campaigns().is_empty() {
        return Ok(());
    }

    let changes: Vec<(usize, Vec<GroupID>, Vec<GroupID>)> = items
        .into_iter()
        .filter_map(|(i, item)| match item {
            HookItem::CampaignGroups { joined, left } => Some((i, joined, left)),
            _ => None,
        })
        .collect();

    let mut leaves = Vec::new();
    let mut join_keys = Vec::new();
    for ((contact_id, group_id), joined) in net_memberships(scenes, &changes) {
        if joined {
            join_keys.push((contact_id, group_id));
        } else {
            leaves.push((contact_id, group_id));
        }
    }

    // only active contacts get campaign events scheduled
    let joins: Vec<_> = join_keys
        .iter()
        .filter_map(|(contact_id, group_id)| {
            scenes
                .iter()
                .find(|s| s.contact.id == *contact_id)
                .filter(|s| s.contact.status == ContactStatus::Active)
                .map(|s| (&s.contact, *group_id))
        })
        .collect();

    campaign::delete_fires_for_group_leave(conn, oa.campaigns(), &leaves).await?;
    campaign::add_fires_for_group_join(conn, oa.campaigns(), oa.org_id(), oa.tz(), &joins).await
}

async fn write_modified(
    conn: &mut PgConnection,
    rt: &Runtime,
    oa: &OrgAssets,
    scenes: &mut [Scene],
    items: Items,
) -> Result<()> {
    let mut touched = BTreeSet::new();
    let mut changed = BTreeSet::new();
    for (i, item) in items {
        touched.insert(i);
        if matches!(item, HookItem::Modified) {
            changed.insert(i);
        }
    }

    // only real changes recompute groups, which also reschedules campaign fires
    if !changed.is_empty() {
        let mut contacts: Vec<_> = changed.iter().map(|i| scenes[*i].contact.clone()).collect();
        contact::calculate_dynamic_groups(conn, rt.engine.as_ref(), oa, &mut contacts).await?;

        for (i, c) in changed.into_iter().zip(contacts) {
            scenes[i].contact.group_ids = c.group_ids;
        }
    }

    let ids: Vec<ContactID> = touched.into_iter().map(|i| scenes[i].contact.id).collect();
    contact::touch_contacts(conn, &ids).await
}

async fn write_last_seen(conn: &mut PgConnection, scenes: &mut [Scene], items: Items) -> Result<()> {
    let latest: BTreeMap<ContactID, DateTime<Utc>> = last_per_contact(
        scenes,
        items.into_iter().filter_map(|(i, item)| match item {
            HookItem::LastSeen(on) => Some((i, on)),
            _ => None,
        }),
    )
    .into_iter()
    .collect();

    let mut by_time: BTreeMap<DateTime<Utc>, Vec<ContactID>> = BTreeMap::new();
    for (contact_id, on) in latest {
        by_time.entry(on).or_default().push(contact_id);
    }
    for (on, ids) in by_time {
        contact::update_last_seen_on(conn, &ids, on).await?;
    }
    Ok(())
}

async fn write_opened_tickets(conn: &mut PgConnection, oa: &OrgAssets, scenes: &mut [Scene], items: Items) -> Result<()> {
    let mut owners = Vec::new();
    let mut tickets: Vec<Ticket> = Vec::new();
    let mut notes = Vec::new();
    for (i, item) in items {
        if let HookItem::OpenTicket { ticket, note } = item {
            owners.push(i);
            tickets.push(*ticket);
            notes.push(note);
        }
    }

    ticket::insert_tickets(conn, &mut tickets).await?;
    ticket::record_tickets_opened(conn, oa, &tickets, &notes).await?;

    for (i, t) in owners.into_iter().zip(&tickets) {
        if let Some(ct) = scenes[i].contact.tickets.iter_mut().find(|ct| ct.uuid == t.uuid) {
            ct.id = t.id;
        }
    }

    debug!(tickets = tickets.len(), "Opened tickets");
    Ok(())
}

async fn write_ticket_changes(conn: &mut PgConnection, oa: &OrgAssets, scenes: &mut [Scene], items: Items) -> Result<()> {
    let changes: Vec<(usize, Uuid, TicketChange)> = items
        .into_iter()
        .filter_map(|(i, item)| match item {
            HookItem::TicketChange { ticket_uuid, change } => Some((i, ticket_uuid, change)),
            _ => None,
        })
        .collect();

    let uuids: Vec<Uuid> = changes.iter().map(|(_, u, _)| *u).collect();
    let mut tickets = ticket::load_tickets_by_uuid(&mut *conn, oa.org_id(), &uuids).await?;

    for (i, ticket_uuid, change) in changes {
        let Some(t) = tickets.iter_mut().find(|t| t.uuid == ticket_uuid) else {
            warn!(ticket_uuid = %ticket_uuid, "Ignoring change to unknown ticket");
            continue;
        };
        let user_id = scenes[i].user_id;
        let one = std::slice::from_mut(t);

        match change {
            TicketChange::Assigned(assignee) => {
                ticket::assign_tickets(conn, oa, user_id, one, assignee).await?;
            }
            TicketChange::TopicChanged(topic_id) => {
                ticket::change_ticket_topic(conn, user_id, one, topic_id).await?;
            }
            TicketChange::Closed => {
                ticket::close_tickets(conn, user_id, one).await?;
            }
            TicketChange::Reopened => {
                ticket::reopen_tickets(conn, user_id, one).await?;
            }
            TicketChange::NoteAdded(note) => {
                ticket::add_ticket_note(conn, oa, user_id, one, &note).await?;
            }
        }
    }
    Ok(())
}

async fn write_msgs(conn: &mut PgConnection, scenes: &mut [Scene], items: Items) -> Result<()> {
    let mut outgoing: Vec<(usize, OutgoingMsg)> = Vec::new();
    let mut handled: Vec<(MsgID, FlowID)> = Vec::new();
    for (i, item) in items {
        match item {
            HookItem::OutgoingMsg(m) => outgoing.push((i, *m)),
            HookItem::HandledMsg { msg_id, flow_id } => handled.push((msg_id, flow_id)),
            _ => {}
        }
    }

    msg::mark_messages_handled(conn, &handled).await?;

    if outgoing.is_empty() {
        return Ok(());
    }

    let (owners, mut msgs): (Vec<usize>, Vec<OutgoingMsg>) = outgoing.into_iter().unzip();
    msg::check_queueable(&msgs)?;

    let mut rows: Vec<&mut Msg> = msgs.iter_mut().map(|m| &mut m.msg).collect();
    msg::insert_messages(conn, &mut rows).await?;

    for (i, m) in owners.into_iter().zip(msgs) {
        scenes[i].outgoing.push(m);
    }
    Ok(())
}

async fn write_http_logs(conn: &mut PgConnection, items: Items) -> Result<()> {
    let mut logs: Vec<HttpLog> = Vec::new();
    let mut transfers: Vec<AirtimeTransfer> = Vec::new();
    for (_, item) in items {
        match item {
            HookItem::HttpLog(l) => logs.push(*l),
            HookItem::Airtime(t) => transfers.push(*t),
            _ => {}
        }
    }

    http_log::insert_airtime_transfers(conn, &mut transfers).await?;
    http_log::insert_http_logs(conn, &logs).await
}

async fn write_msg_labels(conn: &mut PgConnection, items: Items) -> Result<()> {
    let mut adds: Vec<MsgLabelAdd> = items
        .into_iter()
        .filter_map(|(_, item)| match item {
            HookItem::MsgLabel(add) => Some(add),
            _ => None,
        })
        .collect();
    adds.sort_by_key(|a| (a.msg_id, a.label_id));
    adds.dedup();

    label::add_msg_labels(conn, &adds).await
}

async fn write_flow_starts(conn: &mut PgConnection, oa: &OrgAssets, scenes: &mut [Scene], items: Items) -> Result<()> {
    let mut starts: Vec<FlowStart> = Vec::new();
    for (i, item) in items {
        let HookItem::FlowStart(pending) = item else {
            continue;
        };
        let mut start = pending.start;

        if !pending.contact_uuids.is_empty() {
            let ids: Vec<ContactID> = sqlx::query_scalar(
                "SELECT id FROM contacts WHERE org_id = $1 AND uuid = ANY($2) AND is_active ORDER BY id",
            )
            .bind(oa.org_id())
            .bind(&pending.contact_uuids)
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .map(ContactID)
            .collect();
            start = start.with_contact_ids(&ids);
        }

        starts.push(start.with_created_by(scenes[i].user_id));
    }

    flow_start::insert_flow_starts(conn, &mut starts).await?;
    info!(starts = starts.len(), "Queued flow starts triggered by sessions");
    Ok(())
}

async fn write_webhook_health(conn: &mut PgConnection, rt: &Runtime, oa: &OrgAssets, items: Items) -> Result<()> {
    let calls: Vec<(Uuid, bool)> = items
        .into_iter()
        .filter_map(|(_, item)| match item {
            HookItem::WebhookCall { node_uuid, healthy } => Some((node_uuid, healthy)),
            _ => None,
        })
        .collect();

    let unhealthy = incident::record_webhook_calls(&rt.redis, &calls, Utc::now()).await?;
    if !unhealthy.is_empty() {
        incident::incident_webhooks_unhealthy(conn, &rt.redis, oa, &unhealthy).await?;
    }
    Ok(())
}

async fn write_flow_stats(conn: &mut PgConnection, oa: &OrgAssets, scenes: &mut [Scene], items: Items) -> Result<()> {
    let mut activity = FlowActivity::default();
    let mut results = FlowResults::default();
    let mut counted = BTreeSet::new();

    for (i, item) in items {
        match item {
            HookItem::SprintEnded => {
                if !counted.insert(i) {
                    continue;
                }
                let Some(sprint) = &scenes[i].sprint else {
                    continue;
                };
                for seg in &sprint.segments {
                    match oa.flow_by_uuid(seg.flow.uuid) {
                        Some(flow) => activity.add(flow.id, stats::segment_scope(seg.exit_uuid, seg.dest_uuid), 1),
                        None => debug!(flow_uuid = %seg.flow.uuid, "Skipping segment of uncached flow"),
                    }
                }
            }
            HookItem::ResultChange {
                flow_id,
                key,
                previous,
                category,
            } => results.record_change(flow_id, &key, previous.as_deref(), &category),
            _ => {}
        }
    }

    stats::insert_flow_activity(conn, &activity).await?;
    stats::insert_flow_results(conn, &results).await
}

/// Errors if a contact has more than one scene in a batch.
pub(super) fn check_distinct_contacts(scenes: &[Scene]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for s in scenes {
        if !seen.insert(s.contact.id) {
            return Err(CoreError::Invariant(format!(
                "contact {} appears in more than one scene",
                s.contact.id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ids::UserID;

    fn scene(id: i64) -> Scene {
        let mut c = crate::hooks::tests::contact();
        c.id = ContactID(id);
        Scene::for_contact(c, UserID(0))
    }

    #[test]
    fn test_last_per_contact() {
        let scenes = vec![scene(2), scene(1)];
        let items = vec![(0, "a"), (1, "b"), (0, "c")];

        let last = last_per_contact(&scenes, items);
        assert_eq!(last, vec![(ContactID(1), "b"), (ContactID(2), "c")]);
    }

    #[test]
    fn test_net_memberships() {
        let scenes = vec![scene(1), scene(2)];
        let changes = vec![
            (0, vec![GroupID(10), GroupID(11)], vec![]),
            (1, vec![GroupID(10)], vec![]),
            (0, vec![], vec![GroupID(11)]),
        ];

        let net = net_memberships(&scenes, &changes);
        assert_eq!(net.get(&(ContactID(1), GroupID(10))), Some(&true));
        assert_eq!(net.get(&(ContactID(1), GroupID(11))), Some(&false));
        assert_eq!(net.get(&(ContactID(2), GroupID(10))), Some(&true));
        assert_eq!(net.len(), 3);
    }

    #[test]
    fn test_check_distinct_contacts() {
        assert!(check_distinct_contacts(&[scene(1), scene(2)]).is_ok());
        let err = check_distinct_contacts(&[scene(1), scene(1)]).unwrap_err();
        assert_eq!(err.error_code(), "INVARIANT_VIOLATED");
    }
}
