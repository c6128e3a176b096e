// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tickets and ticket events.
//!
//! Every transition writes a ticket event and bumps the ticket's last activity. Openings,
//! assignments and agent replies also record daily counts.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgExecutor};
use tracing::debug;
use uuid::Uuid;

use super::ids::{ContactID, FlowID, OrgID, TicketID, TopicID, UserID, raw_ids};
use super::notification::{self, Notification};
use crate::assets::OrgAssets;
use crate::error::Result;
use crate::stats;

code_enum! {
    pub enum TicketStatus {
        Open = ("O", "open"),
        Closed = ("C", "closed"),
    }
}

code_enum! {
    pub enum TicketEventType {
        Opened = ("O", "opened"),
        Assigned = ("A", "assigned"),
        NoteAdded = ("N", "note_added"),
        TopicChanged = ("T", "topic_changed"),
        Closed = ("C", "closed"),
        Reopened = ("R", "reopened"),
    }
}

/// A conversation case between agents and a contact.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Ticket {
    pub id: TicketID,
    pub uuid: Uuid,
    pub org_id: OrgID,
    pub contact_id: ContactID,
    pub status: TicketStatus,
    pub topic_id: TopicID,
    pub assignee_id: UserID,
    pub opened_on: DateTime<Utc>,
    pub opened_by_id: UserID,
    pub opened_in_id: FlowID,
    pub replied_on: Option<DateTime<Utc>>,
    pub modified_on: DateTime<Utc>,
    pub closed_on: Option<DateTime<Utc>>,
    pub last_activity_on: DateTime<Utc>,
}

impl Ticket {
    /// A new open ticket, not yet inserted.
    pub fn new(
        uuid: Uuid,
        org_id: OrgID,
        contact_id: ContactID,
        topic_id: TopicID,
        assignee_id: UserID,
        opened_by_id: UserID,
        opened_in_id: FlowID,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TicketID(0),
            uuid,
            org_id,
            contact_id,
            status: TicketStatus::Open,
            topic_id,
            assignee_id,
            opened_on: now,
            opened_by_id,
            opened_in_id,
            replied_on: None,
            modified_on: now,
            closed_on: None,
            last_activity_on: now,
        }
    }
}

/// Something that happened to a ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TicketEvent {
    pub org_id: OrgID,
    pub contact_id: ContactID,
    pub ticket_id: TicketID,
    pub event_type: TicketEventType,
    pub note: Option<String>,
    pub topic_id: TopicID,
    pub assignee_id: UserID,
    pub created_by_id: UserID,
    pub created_on: DateTime<Utc>,
}

impl TicketEvent {
    pub fn new(ticket: &Ticket, event_type: TicketEventType, user_id: UserID) -> Self {
        Self {
            org_id: ticket.org_id,
            contact_id: ticket.contact_id,
            ticket_id: ticket.id,
            event_type,
            note: None,
            topic_id: TopicID(0),
            assignee_id: UserID(0),
            created_by_id: user_id,
            created_on: Utc::now(),
        }
    }

    pub fn with_note(mut self, note: Option<&str>) -> Self {
        self.note = note.filter(|n| !n.is_empty()).map(str::to_string);
        self
    }
}

const SELECT_TICKET: &str = r#"
    SELECT id, uuid, org_id, contact_id, status, topic_id, assignee_id, opened_on, opened_by_id,
           opened_in_id, replied_on, modified_on, closed_on, last_activity_on
    FROM tickets
"#;

/// Loads tickets by id.
pub async fn load_tickets<'e>(
    db: impl PgExecutor<'e>,
    org_id: OrgID,
    ids: &[TicketID],
) -> Result<Vec<Ticket>> {
    let tickets = sqlx::query_as::<_, Ticket>(&format!(
        "{SELECT_TICKET} WHERE org_id = $1 AND id = ANY($2) ORDER BY id"
    ))
    .bind(org_id)
    .bind(raw_ids(ids))
    .fetch_all(db)
    .await?;

    Ok(tickets)
}

pub async fn load_tickets_by_uuid<'e>(
    db: impl PgExecutor<'e>,
    org_id: OrgID,
    uuids: &[Uuid],
) -> Result<Vec<Ticket>> {
    let tickets = sqlx::query_as::<_, Ticket>(&format!(
        "{SELECT_TICKET} WHERE org_id = $1 AND uuid = ANY($2) ORDER BY id"
    ))
    .bind(org_id)
    .bind(uuids)
    .fetch_all(db)
    .await?;

    Ok(tickets)
}

/// Inserts new tickets, setting their ids.
pub async fn insert_tickets(conn: &mut PgConnection, tickets: &mut [Ticket]) -> Result<()> {
    for ticket in tickets.iter_mut() {
        let (id,): (TicketID,) = sqlx::query_as(
            r#"
            INSERT INTO tickets (uuid, org_id, contact_id, status, topic_id, assignee_id, opened_on,
                                 opened_by_id, opened_in_id, modified_on, last_activity_on)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $7, $7)
            RETURNING id
            "#,
        )
        .bind(ticket.uuid)
        .bind(ticket.org_id)
        .bind(ticket.contact_id)
        .bind(ticket.status)
        .bind(ticket.topic_id)
        .bind(ticket.assignee_id)
        .bind(ticket.opened_on)
        .bind(ticket.opened_by_id)
        .bind(ticket.opened_in_id)
        .fetch_one(&mut *conn)
        .await?;

        ticket.id = id;
    }

    Ok(())
}

/// Inserts ticket events.
pub async fn insert_ticket_events(conn: &mut PgConnection, events: &[TicketEvent]) -> Result<()> {
    for e in events {
        sqlx::query(
            r#"
            INSERT INTO ticket_events (org_id, contact_id, ticket_id, event_type, note, topic_id,
                                       assignee_id, created_by_id, created_on)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(e.org_id)
        .bind(e.contact_id)
        .bind(e.ticket_id)
        .bind(e.event_type)
        .bind(&e.note)
        .bind(e.topic_id)
        .bind(e.assignee_id)
        .bind(e.created_by_id)
        .bind(e.created_on)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

/// Recomputes the cached open ticket count of contacts.
pub async fn update_contact_ticket_counts(
    conn: &mut PgConnection,
    contact_ids: &[ContactID],
) -> Result<()> {
    if contact_ids.is_empty() {
        return Ok(());
    }

    sqlx::query(
        r#"
        UPDATE contacts c SET ticket_count = (
            SELECT COUNT(*) FROM tickets t WHERE t.contact_id = c.id AND t.status = 'O'
        ), modified_on = NOW()
        WHERE c.id = ANY($1)
        "#,
    )
    .bind(raw_ids(contact_ids))
    .execute(conn)
    .await?;

    Ok(())
}

/// Records newly opened tickets: their open events, counts and assignment notifications.
///
/// The tickets must already be inserted.
pub async fn record_tickets_opened(
    conn: &mut PgConnection,
    oa: &OrgAssets,
    tickets: &[Ticket],
    notes: &[Option<String>],
) -> Result<()> {
    let mut events = Vec::with_capacity(tickets.len());
    let mut counts = BTreeMap::new();
    let mut notifications = Vec::new();

    for (i, ticket) in tickets.iter().enumerate() {
        let mut event = TicketEvent::new(ticket, TicketEventType::Opened, ticket.opened_by_id)
            .with_note(notes.get(i).and_then(|n| n.as_deref()));
        event.assignee_id = ticket.assignee_id;
        event.topic_id = ticket.topic_id;
        events.push(event);

        *counts.entry(format!("tickets:opened:{}", ticket.topic_id)).or_insert(0) += 1;

        if !ticket.assignee_id.is_nil() {
            *counts.entry(format!("tickets:assigned:{}", ticket.assignee_id)).or_insert(0) += 1;
            if ticket.assignee_id != ticket.opened_by_id {
                notifications.push(Notification::tickets_activity(oa.org_id(), ticket.assignee_id));
            }
        }
    }

    insert_ticket_events(conn, &events).await?;
    stats::insert_daily_counts(conn, oa.org_id(), oa.today(), &counts).await?;
    notification::insert_notifications(conn, &notifications).await?;

    let contact_ids: Vec<ContactID> = tickets.iter().map(|t| t.contact_id).collect();
    update_contact_ticket_counts(conn, &contact_ids).await
}

/// Assigns tickets to a user, or unassigns them when `assignee_id` is nil.
pub async fn assign_tickets(
    conn: &mut PgConnection,
    oa: &OrgAssets,
    user_id: UserID,
    tickets: &mut [Ticket],
    assignee_id: UserID,
) -> Result<Vec<TicketEvent>> {
    let changed: Vec<&mut Ticket> = tickets
        .iter_mut()
        .filter(|t| t.assignee_id != assignee_id)
        .collect();
    if changed.is_empty() {
        return Ok(Vec::new());
    }

    let now = Utc::now();
    let mut events = Vec::with_capacity(changed.len());
    let mut ids = Vec::with_capacity(changed.len());
    for ticket in changed {
        ticket.assignee_id = assignee_id;
        ticket.modified_on = now;
        ticket.last_activity_on = now;
        ids.push(ticket.id);

        let mut event = TicketEvent::new(ticket, TicketEventType::Assigned, user_id);
        event.assignee_id = assignee_id;
        events.push(event);
    }

    sqlx::query(
        r#"
        UPDATE tickets SET assignee_id = $2, modified_on = $3, last_activity_on = $3
        WHERE id = ANY($1)
        "#,
    )
    .bind(raw_ids(&ids))
    .bind(assignee_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    insert_ticket_events(conn, &events).await?;

    if !assignee_id.is_nil() {
        let counts = BTreeMap::from([(
            format!("tickets:assigned:{}", assignee_id),
            events.len() as i32,
        )]);
        stats::insert_daily_counts(conn, oa.org_id(), oa.today(), &counts).await?;

        if assignee_id != user_id {
            notification::insert_notifications(
                conn,
                &[Notification::tickets_activity(oa.org_id(), assignee_id)],
            )
            .await?;
        }
    }

    debug!(org_id = %oa.org_id(), count = events.len(), "Assigned tickets");
    Ok(events)
}

/// Changes the topic of tickets.
pub async fn change_ticket_topic(
    conn: &mut PgConnection,
    user_id: UserID,
    tickets: &mut [Ticket],
    topic_id: TopicID,
) -> Result<Vec<TicketEvent>> {
    let now = Utc::now();
    let mut events = Vec::new();
    let mut ids = Vec::new();

    for ticket in tickets.iter_mut().filter(|t| t.topic_id != topic_id) {
        ticket.topic_id = topic_id;
        ticket.modified_on = now;
        ticket.last_activity_on = now;
        ids.push(ticket.id);

        let mut event = TicketEvent::new(ticket, TicketEventType::TopicChanged, user_id);
        event.topic_id = topic_id;
        events.push(event);
    }
    if ids.is_empty() {
        return Ok(events);
    }

    sqlx::query(
        "UPDATE tickets SET topic_id = $2, modified_on = $3, last_activity_on = $3 WHERE id = ANY($1)",
    )
    .bind(raw_ids(&ids))
    .bind(topic_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    insert_ticket_events(conn, &events).await?;
    Ok(events)
}

/// Closes open tickets.
pub async fn close_tickets(
    conn: &mut PgConnection,
    user_id: UserID,
    tickets: &mut [Ticket],
) -> Result<Vec<TicketEvent>> {
    transition_status(conn, user_id, tickets, TicketStatus::Closed).await
}

/// Reopens closed tickets.
pub async fn reopen_tickets(
    conn: &mut PgConnection,
    user_id: UserID,
    tickets: &mut [Ticket],
) -> Result<Vec<TicketEvent>> {
    transition_status(conn, user_id, tickets, TicketStatus::Open).await
}

async fn transition_status(
    conn: &mut PgConnection,
    user_id: UserID,
    tickets: &mut [Ticket],
    status: TicketStatus,
) -> Result<Vec<TicketEvent>> {
    let now = Utc::now();
    let event_type = match status {
        TicketStatus::Open => TicketEventType::Reopened,
        TicketStatus::Closed => TicketEventType::Closed,
    };

    let mut events = Vec::new();
    let mut ids = Vec::new();
    let mut contact_ids = Vec::new();

    for ticket in tickets.iter_mut().filter(|t| t.status != status) {
        ticket.status = status;
        ticket.modified_on = now;
        ticket.last_activity_on = now;
        ticket.closed_on = (status == TicketStatus::Closed).then_some(now);
        ids.push(ticket.id);
        contact_ids.push(ticket.contact_id);
        events.push(TicketEvent::new(ticket, event_type, user_id));
    }
    if ids.is_empty() {
        return Ok(events);
    }

    sqlx::query(
        r#"
        UPDATE tickets SET status = $2, modified_on = $3, last_activity_on = $3,
               closed_on = CASE WHEN $2 = 'C' THEN $3 ELSE NULL END
        WHERE id = ANY($1)
        "#,
    )
    .bind(raw_ids(&ids))
    .bind(status)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    insert_ticket_events(conn, &events).await?;
    update_contact_ticket_counts(conn, &contact_ids).await?;
    Ok(events)
}

/// Adds a note to tickets, notifying assignees other than the author.
pub async fn add_ticket_note(
    conn: &mut PgConnection,
    oa: &OrgAssets,
    user_id: UserID,
    tickets: &mut [Ticket],
    note: &str,
) -> Result<Vec<TicketEvent>> {
    let now = Utc::now();
    let mut events = Vec::with_capacity(tickets.len());
    let mut notifications = Vec::new();

    for ticket in tickets.iter_mut() {
        ticket.modified_on = now;
        ticket.last_activity_on = now;
        events.push(TicketEvent::new(ticket, TicketEventType::NoteAdded, user_id).with_note(Some(note)));

        if !ticket.assignee_id.is_nil() && ticket.assignee_id != user_id {
            notifications.push(Notification::tickets_activity(oa.org_id(), ticket.assignee_id));
        }
    }

    let ids: Vec<TicketID> = tickets.iter().map(|t| t.id).collect();
    sqlx::query("UPDATE tickets SET modified_on = $2, last_activity_on = $2 WHERE id = ANY($1)")
        .bind(raw_ids(&ids))
        .bind(now)
        .execute(&mut *conn)
        .await?;

    insert_ticket_events(conn, &events).await?;
    notification::insert_notifications(conn, &notifications).await?;
    Ok(events)
}

/// Records an agent's reply on a ticket. Only the first reply sets `replied_on`.
pub async fn record_ticket_reply(
    conn: &mut PgConnection,
    oa: &OrgAssets,
    ticket_id: TicketID,
    user_id: UserID,
    replied_on: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tickets SET replied_on = COALESCE(replied_on, $2), last_activity_on = $2
        WHERE id = $1
        "#,
    )
    .bind(ticket_id)
    .bind(replied_on)
    .execute(&mut *conn)
    .await?;

    if !user_id.is_nil() {
        let counts = BTreeMap::from([(format!("msgs:ticketreplies:{}", user_id), 1)]);
        stats::insert_daily_counts(conn, oa.org_id(), oa.today(), &counts).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builders() {
        let mut ticket = Ticket::new(
            Uuid::new_v4(),
            OrgID(1),
            ContactID(2),
            TopicID(3),
            UserID(0),
            UserID(4),
            FlowID(5),
        );
        ticket.id = TicketID(9);
        assert_eq!(ticket.status, TicketStatus::Open);
        assert_eq!(ticket.opened_on, ticket.last_activity_on);

        let e = TicketEvent::new(&ticket, TicketEventType::NoteAdded, UserID(4)).with_note(Some(""));
        assert_eq!(e.ticket_id, TicketID(9));
        assert_eq!(e.note, None);

        let e = e.with_note(Some("call back"));
        assert_eq!(e.note.as_deref(), Some("call back"));
        assert_eq!(TicketEventType::TopicChanged.code(), "T");
    }
}
