// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Contacts and their URNs.
//!
//! Contacts are always loaded fully hydrated: one query returns the contact row with its URNs,
//! group memberships and open tickets aggregated as JSON. Creating contacts and moving URNs
//! between them relies on the `(identity, org_id)` unique constraint on `contact_urns` to settle
//! races between writers.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{PgConnection, PgExecutor, PgPool};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::campaign;
use super::contact_fire;
use super::field::FieldValue;
use super::group::{self, GroupChange};
use super::ids::{ChannelID, ContactID, GroupID, OrgID, TicketID, TopicID, UrnID, UserID, raw_ids};
use super::trigger;
use super::urn::{self, ContactUrn, TOP_PRIORITY, Urn};
use crate::assets::OrgAssets;
use crate::engine::{Engine, EngineContact};
use crate::error::{CoreError, Result};

code_enum! {
    pub enum ContactStatus {
        Active = ("A", "active"),
        Blocked = ("B", "blocked"),
        Stopped = ("S", "stopped"),
        Archived = ("V", "archived"),
    }
}

/// An open ticket as carried on a contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactTicket {
    pub id: TicketID,
    pub uuid: Uuid,
    pub topic_id: TopicID,
    #[serde(default)]
    pub assignee_id: UserID,
}

/// A fully hydrated contact.
#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub id: ContactID,
    pub uuid: Uuid,
    pub org_id: OrgID,
    pub name: Option<String>,
    pub language: Option<String>,
    pub status: ContactStatus,
    pub fields: HashMap<String, FieldValue>,
    /// Ordered by priority desc, id asc.
    pub urns: Vec<ContactUrn>,
    pub group_ids: Vec<GroupID>,
    /// Ordered by opened on.
    pub tickets: Vec<ContactTicket>,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
    pub last_seen_on: Option<DateTime<Utc>>,
    pub current_session_uuid: Option<Uuid>,
    pub current_flow_id: super::ids::FlowID,
}

impl Contact {
    /// The contact as the engine sees it. Status groups are left out, URNs carry their preferred
    /// channel as a `channel` query parameter.
    pub fn to_engine(&self, oa: &OrgAssets) -> EngineContact {
        let urns = self
            .urns
            .iter()
            .map(|u| {
                let mut urn = u.urn();
                if let Some(ch) = oa.channel_by_id(u.channel_id) {
                    urn.query = format!("channel={}", ch.uuid);
                }
                urn.to_string()
            })
            .collect();

        let groups = self
            .group_ids
            .iter()
            .filter_map(|id| oa.group_by_id(*id))
            .filter(|g| !g.is_status_group())
            .map(|g| g.reference())
            .collect();

        EngineContact {
            uuid: self.uuid,
            id: self.id,
            name: self.name.clone(),
            language: self.language.clone(),
            status: self.status,
            created_on: self.created_on,
            last_seen_on: self.last_seen_on,
            urns,
            groups,
            fields: self
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
            tickets: self.tickets.iter().map(|t| t.uuid).collect(),
        }
    }

    /// The highest priority URN, if the contact has any.
    pub fn preferred_urn(&self) -> Option<&ContactUrn> {
        self.urns.first()
    }

    pub fn urn_by_id(&self, id: UrnID) -> Option<&ContactUrn> {
        self.urns.iter().find(|u| u.id == id)
    }

    pub fn urn_by_identity(&self, identity: &str) -> Option<&ContactUrn> {
        self.urns.iter().find(|u| u.identity == identity)
    }
}

#[derive(sqlx::FromRow)]
struct ContactRow {
    id: ContactID,
    uuid: Uuid,
    org_id: OrgID,
    name: Option<String>,
    language: Option<String>,
    status: ContactStatus,
    fields: Json<HashMap<String, FieldValue>>,
    urns: Json<Vec<ContactUrn>>,
    group_ids: Vec<i64>,
    tickets: Json<Vec<ContactTicket>>,
    created_on: DateTime<Utc>,
    modified_on: DateTime<Utc>,
    last_seen_on: Option<DateTime<Utc>>,
    current_session_uuid: Option<Uuid>,
    current_flow_id: super::ids::FlowID,
}

impl From<ContactRow> for Contact {
    fn from(row: ContactRow) -> Self {
        let mut urns = row.urns.0;
        urn::sort_by_priority(&mut urns);

        Contact {
            id: row.id,
            uuid: row.uuid,
            org_id: row.org_id,
            name: row.name,
            language: row.language,
            status: row.status,
            fields: row.fields.0,
            urns,
            group_ids: row.group_ids.into_iter().map(GroupID).collect(),
            tickets: row.tickets.0,
            created_on: row.created_on,
            modified_on: row.modified_on,
            last_seen_on: row.last_seen_on,
            current_session_uuid: row.current_session_uuid,
            current_flow_id: row.current_flow_id,
        }
    }
}

const SELECT_CONTACTS: &str = r#"
    SELECT c.id, c.uuid, c.org_id, c.name, c.language, c.status, c.fields, c.created_on,
           c.modified_on, c.last_seen_on, c.current_session_uuid, c.current_flow_id,
           COALESCE((
               SELECT jsonb_agg(jsonb_build_object(
                   'id', u.id, 'org_id', u.org_id, 'contact_id', u.contact_id, 'identity', u.identity,
                   'scheme', u.scheme, 'path', u.path, 'display', u.display, 'priority', u.priority,
                   'channel_id', u.channel_id, 'auth_tokens', u.auth_tokens
               ) ORDER BY u.priority DESC, u.id ASC)
               FROM contact_urns u WHERE u.contact_id = c.id
           ), '[]') AS urns,
           ARRAY(
               SELECT gc.contactgroup_id FROM contact_groups_contacts gc
               JOIN contact_groups g ON g.id = gc.contactgroup_id
               WHERE gc.contact_id = c.id AND g.is_active
               ORDER BY gc.contactgroup_id
           ) AS group_ids,
           COALESCE((
               SELECT jsonb_agg(jsonb_build_object(
                   'id', t.id, 'uuid', t.uuid, 'topic_id', t.topic_id, 'assignee_id', t.assignee_id
               ) ORDER BY t.opened_on ASC, t.id ASC)
               FROM tickets t WHERE t.contact_id = c.id AND t.status = 'O'
           ), '[]') AS tickets
    FROM contacts c
"#;

/// Loads contacts by id. Missing and inactive contacts are skipped and the order of the result
/// isn't that of `ids`.
pub async fn load_contacts<'e>(
    db: impl PgExecutor<'e>,
    org_id: OrgID,
    ids: &[ContactID],
) -> Result<Vec<Contact>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let rows = sqlx::query_as::<_, ContactRow>(&format!(
        "{SELECT_CONTACTS} WHERE c.id = ANY($1) AND c.org_id = $2 AND c.is_active"
    ))
    .bind(raw_ids(ids))
    .bind(org_id)
    .fetch_all(db)
    .await?;

    Ok(rows.into_iter().map(Contact::from).collect())
}

/// Loads contacts by UUID, with the same semantics as [`load_contacts`].
pub async fn load_contacts_by_uuid<'e>(
    db: impl PgExecutor<'e>,
    org_id: OrgID,
    uuids: &[Uuid],
) -> Result<Vec<Contact>> {
    if uuids.is_empty() {
        return Ok(Vec::new());
    }

    let rows = sqlx::query_as::<_, ContactRow>(&format!(
        "{SELECT_CONTACTS} WHERE c.uuid = ANY($1) AND c.org_id = $2 AND c.is_active"
    ))
    .bind(uuids)
    .bind(org_id)
    .fetch_all(db)
    .await?;

    Ok(rows.into_iter().map(Contact::from).collect())
}

/// Loads the UUIDs of contacts by id, active or not.
pub async fn load_contact_uuids<'e>(db: impl PgExecutor<'e>, ids: &[ContactID]) -> Result<HashMap<ContactID, Uuid>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows: Vec<(ContactID, Uuid)> = sqlx::query_as("SELECT id, uuid FROM contacts WHERE id = ANY($1)")
        .bind(raw_ids(ids))
        .fetch_all(db)
        .await?;

    Ok(rows.into_iter().collect())
}

/// Loads a single contact, failing if it doesn't exist.
pub async fn load_contact<'e>(db: impl PgExecutor<'e>, org_id: OrgID, id: ContactID) -> Result<Contact> {
    load_contacts(db, org_id, &[id])
        .await?
        .pop()
        .ok_or_else(|| CoreError::not_found("contact", id))
}

/// Parses and normalizes URN strings, failing on the first invalid one.
pub fn normalize_urns(oa: &OrgAssets, urns: &[String]) -> Result<Vec<Urn>> {
    let country = oa.org().default_country.as_deref();

    urns.iter()
        .enumerate()
        .map(|(index, s)| {
            Urn::parse_normalized(s, country).map_err(|reason| CoreError::UrnInvalid { index, reason })
        })
        .collect()
}

/// The channel a URN asks to be sent on via its `channel` query parameter.
fn urn_channel(oa: &OrgAssets, urn: &Urn) -> ChannelID {
    urn.query
        .split('&')
        .find_map(|kv| kv.strip_prefix("channel="))
        .and_then(|s| Uuid::parse_str(s).ok())
        .and_then(|uuid| oa.channel_by_uuid(uuid))
        .map(|c| c.id)
        .unwrap_or_default()
}

/// Looks up which contacts own the given URN identities. Orphaned URNs aren't included.
async fn owners_of<'e>(
    db: impl PgExecutor<'e>,
    org_id: OrgID,
    urns: &[Urn],
) -> Result<HashMap<String, ContactID>> {
    let identities: Vec<String> = urns.iter().map(Urn::identity).collect();

    let rows: Vec<(String, ContactID)> = sqlx::query_as(
        r#"
        SELECT identity, contact_id FROM contact_urns
        WHERE org_id = $1 AND identity = ANY($2) AND contact_id IS NOT NULL
        "#,
    )
    .bind(org_id)
    .bind(&identities)
    .fetch_all(db)
    .await?;

    Ok(rows.into_iter().collect())
}

async fn insert_contact(
    conn: &mut PgConnection,
    oa: &OrgAssets,
    user_id: UserID,
    name: Option<&str>,
    language: Option<&str>,
    status: ContactStatus,
) -> Result<ContactID> {
    let (id,): (ContactID,) = sqlx::query_as(
        r#"
        INSERT INTO contacts (org_id, uuid, name, language, status, fields, created_by_id, modified_by_id,
                              created_on, modified_on)
        VALUES ($1, $2, $3, $4, $5, '{}', $6, $6, NOW(), NOW())
        RETURNING id
        "#,
    )
    .bind(oa.org_id())
    .bind(Uuid::new_v4())
    .bind(name.filter(|n| !n.is_empty()))
    .bind(language.filter(|l| !l.is_empty()))
    .bind(status)
    .bind(user_id)
    .fetch_one(conn)
    .await?;

    Ok(id)
}

/// Attaches a URN to a contact, claiming the row if it exists as an orphan. Fails with
/// [`CoreError::UrnTaken`] if another contact owns it.
async fn attach_urn(
    conn: &mut PgConnection,
    org_id: OrgID,
    contact_id: ContactID,
    urn: &Urn,
    priority: i32,
    channel_id: ChannelID,
    index: usize,
) -> Result<UrnID> {
    let row: Option<(UrnID,)> = sqlx::query_as(
        r#"
        INSERT INTO contact_urns (org_id, contact_id, identity, scheme, path, display, priority, channel_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (identity, org_id) DO UPDATE
            SET contact_id = EXCLUDED.contact_id, priority = EXCLUDED.priority,
                channel_id = COALESCE(EXCLUDED.channel_id, contact_urns.channel_id)
            WHERE contact_urns.contact_id IS NULL
        RETURNING id
        "#,
    )
    .bind(org_id)
    .bind(contact_id)
    .bind(urn.identity())
    .bind(&urn.scheme)
    .bind(&urn.path)
    .bind((!urn.display.is_empty()).then_some(&urn.display))
    .bind(priority)
    .bind(channel_id)
    .fetch_optional(conn)
    .await?;

    row.map(|(id,)| id).ok_or(CoreError::UrnTaken { index })
}

/// Creates a new contact with the given URNs, none of which may belong to another contact.
#[instrument(skip(db, engine, oa, urns), fields(org_id = %oa.org_id()))]
#[allow(clippy::too_many_arguments)]
pub async fn create_contact(
    db: &PgPool,
    engine: &dyn Engine,
    oa: &OrgAssets,
    user_id: UserID,
    name: Option<&str>,
    language: Option<&str>,
    status: ContactStatus,
    urns: &[String],
) -> Result<Contact> {
    let urns = normalize_urns(oa, urns)?;

    if let Some(lang) = language.filter(|l| !l.is_empty()) {
        if !oa.org().allows_language(lang) {
            return Err(CoreError::UnknownLanguage(lang.to_string()));
        }
    }

    let owners = owners_of(db, oa.org_id(), &urns).await?;
    if let Some(index) = urns.iter().position(|u| owners.contains_key(&u.identity())) {
        return Err(CoreError::UrnTaken { index });
    }

    let mut tx = db.begin().await?;
    let contact_id = insert_contact(&mut tx, oa, user_id, name, language, status).await?;
    if let Err(e) = attach_urns(&mut tx, oa, contact_id, &urns, ChannelID(0)).await {
        return Err(taken_on_race(e, &urns, &owners_of(db, oa.org_id(), &urns).await?));
    }

    let mut contacts = load_contacts(&mut *tx, oa.org_id(), &[contact_id]).await?;
    calculate_dynamic_groups(&mut tx, engine, oa, &mut contacts).await?;
    tx.commit().await?;

    contacts
        .pop()
        .ok_or_else(|| CoreError::Invariant(format!("contact {} vanished after insert", contact_id)))
}

async fn attach_urns(
    conn: &mut PgConnection,
    oa: &OrgAssets,
    contact_id: ContactID,
    urns: &[Urn],
    first_channel: ChannelID,
) -> Result<()> {
    for (index, urn) in urns.iter().enumerate() {
        let mut channel_id = urn_channel(oa, urn);
        if index == 0 && channel_id.is_nil() {
            channel_id = first_channel;
        }
        let priority = TOP_PRIORITY - index as i32;
        attach_urn(conn, oa.org_id(), contact_id, urn, priority, channel_id, index).await?;
    }
    Ok(())
}

/// Converts a unique violation lost to a concurrent writer into a taken error for the first URN
/// that now has an owner.
fn taken_on_race(err: CoreError, urns: &[Urn], owners: &HashMap<String, ContactID>) -> CoreError {
    if !err.is_unique_violation() {
        return err;
    }
    match urns.iter().position(|u| owners.contains_key(&u.identity())) {
        Some(index) => CoreError::UrnTaken { index },
        None => err,
    }
}

/// Gets the contact that owns the given URNs, creating one if none does. A created contact's
/// first URN records `channel_id` as its preferred channel. Returns whether it was created.
#[instrument(skip(db, engine, oa, urns), fields(org_id = %oa.org_id()))]
pub async fn get_or_create_contact(
    db: &PgPool,
    engine: &dyn Engine,
    oa: &OrgAssets,
    urns: &[String],
    channel_id: ChannelID,
) -> Result<(Contact, bool)> {
    let urns = normalize_urns(oa, urns)?;

    if let Some(contact) = existing_owner(db, oa, &urns).await? {
        return Ok((contact, false));
    }

    match create_for_urns(db, engine, oa, &urns, channel_id).await {
        Ok(contact) => Ok((contact, true)),
        Err(e) if e.is_unique_violation() || matches!(e.root(), CoreError::UrnTaken { .. }) => {
            debug!("Lost race creating contact, looking up other writer's contact");
            match existing_owner(db, oa, &urns).await? {
                Some(contact) => Ok((contact, false)),
                None => Err(CoreError::Invariant(
                    "lookup of URNs after failed insert returned zero contacts".to_string(),
                )),
            }
        }
        Err(e) => Err(e),
    }
}

async fn existing_owner(db: &PgPool, oa: &OrgAssets, urns: &[Urn]) -> Result<Option<Contact>> {
    let owners = owners_of(db, oa.org_id(), urns).await?;
    let distinct: HashSet<ContactID> = owners.values().copied().collect();

    match distinct.len() {
        0 => Ok(None),
        1 => {
            let id = distinct.into_iter().next().unwrap_or_default();
            Ok(Some(load_contact(db, oa.org_id(), id).await?))
        }
        _ => Err(CoreError::ContactsConflict),
    }
}

async fn create_for_urns(
    db: &PgPool,
    engine: &dyn Engine,
    oa: &OrgAssets,
    urns: &[Urn],
    channel_id: ChannelID,
) -> Result<Contact> {
    let mut tx = db.begin().await?;
    let contact_id =
        insert_contact(&mut tx, oa, UserID(0), None, None, ContactStatus::Active).await?;
    attach_urns(&mut tx, oa, contact_id, urns, channel_id).await?;

    let mut contacts = load_contacts(&mut *tx, oa.org_id(), &[contact_id]).await?;
    calculate_dynamic_groups(&mut tx, engine, oa, &mut contacts).await?;
    tx.commit().await?;

    contacts
        .pop()
        .ok_or_else(|| CoreError::Invariant(format!("contact {} vanished after insert", contact_id)))
}

/// Makes a URN the contact's preferred one, sending on `channel_id`. The other URNs keep
/// their relative order below it.
pub async fn update_preferred_urn(
    conn: &mut PgConnection,
    contact: &mut Contact,
    urn_id: UrnID,
    channel_id: ChannelID,
) -> Result<()> {
    let Some(pos) = contact.urns.iter().position(|u| u.id == urn_id) else {
        return Err(CoreError::not_found("contact URN", urn_id));
    };

    let mut preferred = contact.urns.remove(pos);
    preferred.channel_id = channel_id;
    contact.urns.insert(0, preferred);
    for (i, u) in contact.urns.iter_mut().enumerate() {
        u.priority = TOP_PRIORITY - i as i32;
    }

    let ids: Vec<UrnID> = contact.urns.iter().map(|u| u.id).collect();
    let priorities: Vec<i32> = contact.urns.iter().map(|u| u.priority).collect();

    sqlx::query(
        r#"
        UPDATE contact_urns u SET priority = r.priority
        FROM UNNEST($1::BIGINT[], $2::INT[]) AS r(id, priority)
        WHERE u.id = r.id
        "#,
    )
    .bind(raw_ids(&ids))
    .bind(&priorities)
    .execute(&mut *conn)
    .await?;

    sqlx::query("UPDATE contact_urns SET channel_id = $2 WHERE id = $1")
        .bind(urn_id)
        .bind(channel_id)
        .execute(&mut *conn)
        .await?;

    sqlx::query("UPDATE contacts SET modified_on = NOW() WHERE id = $1")
        .bind(contact.id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// A contact's desired URN list, highest priority first.
#[derive(Debug, Clone, PartialEq)]
pub struct UrnChange {
    pub contact_id: ContactID,
    pub urns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
struct UrnUpdate {
    id: UrnID,
    priority: i32,
    channel_id: ChannelID,
}

#[derive(Debug, Clone, PartialEq)]
struct UrnInsert {
    contact_id: ContactID,
    urn: Urn,
    priority: i32,
    channel_id: ChannelID,
}

/// Splits a desired URN list into updates of rows the contact already has and inserts of new
/// ones, and the ids of rows the contact should lose.
fn plan_urn_change(
    oa: &OrgAssets,
    current: &[ContactUrn],
    contact_id: ContactID,
    desired: &[Urn],
) -> (Vec<UrnUpdate>, Vec<UrnInsert>, Vec<UrnID>) {
    let mut updates = Vec::new();
    let mut inserts = Vec::new();
    let mut keep = HashSet::new();

    for (i, urn) in desired.iter().enumerate() {
        let priority = TOP_PRIORITY - i as i32;
        let channel_id = urn_channel(oa, urn);

        match current.iter().find(|u| u.identity == urn.identity()) {
            Some(existing) => {
                keep.insert(existing.id);
                let channel_id = if channel_id.is_nil() { existing.channel_id } else { channel_id };
                if existing.priority != priority || existing.channel_id != channel_id {
                    updates.push(UrnUpdate {
                        id: existing.id,
                        priority,
                        channel_id,
                    });
                }
            }
            None => inserts.push(UrnInsert {
                contact_id,
                urn: urn.clone(),
                priority,
                channel_id,
            }),
        }
    }

    let detach = current
        .iter()
        .filter(|u| !keep.contains(&u.id))
        .map(|u| u.id)
        .collect();

    (updates, inserts, detach)
}

/// Sets the URNs of contacts. URNs owned by other contacts are taken from them and those
/// contacts are returned, after having their groups recalculated.
#[instrument(skip(conn, engine, oa, changes), fields(org_id = %oa.org_id(), contacts = changes.len()))]
pub async fn update_contact_urns(
    conn: &mut PgConnection,
    engine: &dyn Engine,
    oa: &OrgAssets,
    changes: &[UrnChange],
) -> Result<Vec<ContactID>> {
    if changes.is_empty() {
        return Ok(Vec::new());
    }

    let contact_ids: Vec<ContactID> = changes.iter().map(|c| c.contact_id).collect();
    let current: Vec<ContactUrn> = sqlx::query_as(
        r#"
        SELECT id, org_id, contact_id, identity, scheme, path, display, priority, channel_id, auth_tokens
        FROM contact_urns WHERE contact_id = ANY($1)
        ORDER BY priority DESC, id ASC
        "#,
    )
    .bind(raw_ids(&contact_ids))
    .fetch_all(&mut *conn)
    .await?;

    let mut updates = Vec::new();
    let mut inserts = Vec::new();
    let mut detach = Vec::new();
    let mut modified = HashSet::new();

    for change in changes {
        let desired = normalize_urns(oa, &change.urns)?;
        let mine: Vec<ContactUrn> = current
            .iter()
            .filter(|u| u.contact_id == change.contact_id)
            .cloned()
            .collect();

        let (u, i, d) = plan_urn_change(oa, &mine, change.contact_id, &desired);
        if !u.is_empty() || !i.is_empty() || !d.is_empty() {
            modified.insert(change.contact_id);
        }
        updates.extend(u);
        inserts.extend(i);
        detach.extend(d);
    }

    if !updates.is_empty() {
        let ids: Vec<UrnID> = updates.iter().map(|u| u.id).collect();
        let priorities: Vec<i32> = updates.iter().map(|u| u.priority).collect();
        let channels: Vec<Option<i64>> = updates.iter().map(|u| u.channel_id.as_option()).collect();

        sqlx::query(
            r#"
            UPDATE contact_urns u SET priority = r.priority, channel_id = r.channel_id
            FROM UNNEST($1::BIGINT[], $2::INT[], $3::BIGINT[]) AS r(id, priority, channel_id)
            WHERE u.id = r.id
            "#,
        )
        .bind(raw_ids(&ids))
        .bind(&priorities)
        .bind(&channels)
        .execute(&mut *conn)
        .await?;
    }

    if !detach.is_empty() {
        sqlx::query("UPDATE contact_urns SET contact_id = NULL WHERE id = ANY($1)")
            .bind(raw_ids(&detach))
            .execute(&mut *conn)
            .await?;
    }

    // find who we're about to take URNs from before taking them
    let inserting: Vec<Urn> = inserts.iter().map(|i| i.urn.clone()).collect();
    let mut affected: Vec<ContactID> = owners_of(&mut *conn, oa.org_id(), &inserting)
        .await?
        .into_values()
        .filter(|id| !modified.contains(id))
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    affected.sort();

    for insert in &inserts {
        sqlx::query(
            r#"
            INSERT INTO contact_urns (org_id, contact_id, identity, scheme, path, display, priority, channel_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (identity, org_id) DO UPDATE
                SET contact_id = EXCLUDED.contact_id, priority = EXCLUDED.priority
            "#,
        )
        .bind(oa.org_id())
        .bind(insert.contact_id)
        .bind(insert.urn.identity())
        .bind(&insert.urn.scheme)
        .bind(&insert.urn.path)
        .bind((!insert.urn.display.is_empty()).then_some(&insert.urn.display))
        .bind(insert.priority)
        .bind(insert.channel_id)
        .execute(&mut *conn)
        .await?;
    }

    let mut bump: Vec<ContactID> = modified.into_iter().collect();
    bump.extend(affected.iter().copied());
    if !bump.is_empty() {
        sqlx::query("UPDATE contacts SET modified_on = NOW() WHERE id = ANY($1)")
            .bind(raw_ids(&bump))
            .execute(&mut *conn)
            .await?;
    }

    if !affected.is_empty() {
        let mut stolen_from = load_contacts(&mut *conn, oa.org_id(), &affected).await?;
        calculate_dynamic_groups(conn, engine, oa, &mut stolen_from).await?;
        debug!(count = affected.len(), "Took URNs from other contacts");
    }

    Ok(affected)
}

/// Sets the status of contacts. Contacts leaving active lose their manual and query groups and
/// their campaign fires. Blocking or stopping a contact archives triggers that only target it.
pub async fn update_contact_status(
    conn: &mut PgConnection,
    changes: &[(ContactID, ContactStatus)],
) -> Result<()> {
    if changes.is_empty() {
        return Ok(());
    }

    let archive: Vec<ContactID> = changes
        .iter()
        .filter(|(_, s)| matches!(s, ContactStatus::Blocked | ContactStatus::Stopped))
        .map(|(id, _)| *id)
        .collect();
    trigger::archive_contact_triggers(conn, &archive).await?;

    let ids: Vec<ContactID> = changes.iter().map(|(id, _)| *id).collect();
    let statuses: Vec<ContactStatus> = changes.iter().map(|(_, s)| *s).collect();

    sqlx::query(
        r#"
        UPDATE contacts c SET status = r.status, modified_on = NOW()
        FROM UNNEST($1::BIGINT[], $2::TEXT[]) AS r(id, status)
        WHERE c.id = r.id
        "#,
    )
    .bind(raw_ids(&ids))
    .bind(&statuses)
    .execute(&mut *conn)
    .await?;

    let inactive: Vec<ContactID> = changes
        .iter()
        .filter(|(_, s)| *s != ContactStatus::Active)
        .map(|(id, _)| *id)
        .collect();
    group::remove_contacts_from_user_groups(conn, &inactive).await?;
    contact_fire::delete_all_campaign_fires(conn, &inactive).await?;

    Ok(())
}

/// Re-evaluates the query groups of contacts, writes any membership changes and recomputes
/// their campaign fires. `contacts` is updated with the new memberships.
pub async fn calculate_dynamic_groups(
    conn: &mut PgConnection,
    engine: &dyn Engine,
    oa: &OrgAssets,
    contacts: &mut [Contact],
) -> Result<()> {
    if contacts.is_empty() {
        return Ok(());
    }

    let mut adds = Vec::new();
    let mut removes = Vec::new();

    for contact in contacts.iter_mut() {
        let (added, removed) = engine
            .reevaluate_query_groups(oa, &contact.to_engine(oa))
            .await?;

        for g in &added {
            let group = oa.group_by_uuid(g.uuid).ok_or(CoreError::UnknownGroup(g.uuid))?;
            adds.push(GroupChange {
                contact_id: contact.id,
                group_id: group.id,
            });
            if !contact.group_ids.contains(&group.id) {
                contact.group_ids.push(group.id);
            }
        }
        for g in &removed {
            let group = oa.group_by_uuid(g.uuid).ok_or(CoreError::UnknownGroup(g.uuid))?;
            removes.push(GroupChange {
                contact_id: contact.id,
                group_id: group.id,
            });
            contact.group_ids.retain(|id| *id != group.id);
        }
    }

    group::add_contacts_to_groups(conn, &adds).await?;
    group::remove_contacts_from_groups(conn, &removes).await?;

    let ids: Vec<ContactID> = contacts.iter().map(|c| c.id).collect();
    contact_fire::delete_all_campaign_fires(conn, &ids).await?;

    let now = Utc::now();
    let fires: Vec<contact_fire::ContactFire> = contacts
        .iter()
        .filter(|c| c.status == ContactStatus::Active)
        .flat_map(|c| {
            let campaigns = oa
                .campaigns()
                .iter()
                .filter(|camp| c.group_ids.contains(&camp.group_id));
            campaign::fires_for_contact(campaigns, oa.org_id(), oa.tz(), now, c)
        })
        .collect();
    contact_fire::insert_contact_fires(conn, &fires).await?;

    Ok(())
}

/// Sets the names of contacts. An empty name clears it.
pub async fn update_contact_names(conn: &mut PgConnection, changes: &[(ContactID, String)]) -> Result<()> {
    if changes.is_empty() {
        return Ok(());
    }

    let ids: Vec<ContactID> = changes.iter().map(|(id, _)| *id).collect();
    let names: Vec<Option<&str>> = changes
        .iter()
        .map(|(_, n)| Some(n.as_str()).filter(|n| !n.is_empty()))
        .collect();

    sqlx::query(
        r#"
        UPDATE contacts c SET name = r.name, modified_on = NOW()
        FROM UNNEST($1::BIGINT[], $2::TEXT[]) AS r(id, name)
        WHERE c.id = r.id
        "#,
    )
    .bind(raw_ids(&ids))
    .bind(&names)
    .execute(conn)
    .await?;

    Ok(())
}

/// Sets the languages of contacts. An empty language clears it.
pub async fn update_contact_languages(conn: &mut PgConnection, changes: &[(ContactID, String)]) -> Result<()> {
    if changes.is_empty() {
        return Ok(());
    }

    let ids: Vec<ContactID> = changes.iter().map(|(id, _)| *id).collect();
    let languages: Vec<Option<&str>> = changes
        .iter()
        .map(|(_, l)| Some(l.as_str()).filter(|l| !l.is_empty()))
        .collect();

    sqlx::query(
        r#"
        UPDATE contacts c SET language = r.language, modified_on = NOW()
        FROM UNNEST($1::BIGINT[], $2::TEXT[]) AS r(id, language)
        WHERE c.id = r.id
        "#,
    )
    .bind(raw_ids(&ids))
    .bind(&languages)
    .execute(conn)
    .await?;

    Ok(())
}

/// A change to one field value of a contact. `None` clears the value.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub contact_id: ContactID,
    pub key: String,
    pub value: Option<FieldValue>,
}

/// Writes field value changes. Changes are applied in order so the last change to a key wins.
pub async fn update_contact_fields(conn: &mut PgConnection, changes: &[FieldChange]) -> Result<()> {
    if changes.is_empty() {
        return Ok(());
    }

    let mut by_contact: BTreeMap<ContactID, (serde_json::Map<String, serde_json::Value>, Vec<String>)> =
        BTreeMap::new();
    for change in changes {
        let (sets, clears) = by_contact.entry(change.contact_id).or_default();
        match &change.value {
            Some(value) => {
                clears.retain(|k| k != &change.key);
                sets.insert(change.key.clone(), serde_json::to_value(value)?);
            }
            None => {
                sets.remove(&change.key);
                clears.push(change.key.clone());
            }
        }
    }

    for (contact_id, (sets, clears)) in by_contact {
        sqlx::query(
            r#"
            UPDATE contacts SET fields = (COALESCE(fields, '{}'::jsonb) - $3::TEXT[]) || $2, modified_on = NOW()
            WHERE id = $1
            "#,
        )
        .bind(contact_id)
        .bind(Json(serde_json::Value::Object(sets)))
        .bind(&clears)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

/// Updates `last_seen_on` for contacts who just sent us something.
pub async fn update_last_seen_on(
    conn: &mut PgConnection,
    contact_ids: &[ContactID],
    seen_on: DateTime<Utc>,
) -> Result<()> {
    if contact_ids.is_empty() {
        return Ok(());
    }

    sqlx::query(
        r#"
        UPDATE contacts SET last_seen_on = $2, modified_on = NOW()
        WHERE id = ANY($1) AND (last_seen_on IS NULL OR last_seen_on < $2)
        "#,
    )
    .bind(raw_ids(contact_ids))
    .bind(seen_on)
    .execute(conn)
    .await?;

    Ok(())
}

/// Bumps `modified_on` for contacts.
pub async fn touch_contacts(conn: &mut PgConnection, contact_ids: &[ContactID]) -> Result<()> {
    if contact_ids.is_empty() {
        return Ok(());
    }

    sqlx::query("UPDATE contacts SET modified_on = NOW() WHERE id = ANY($1)")
        .bind(raw_ids(contact_ids))
        .execute(conn)
        .await?;

    Ok(())
}

/// Ids of contacts that have ever started a flow.
pub async fn contact_ids_started_flow<'e>(
    db: impl PgExecutor<'e>,
    flow_id: super::ids::FlowID,
    contact_ids: &[ContactID],
) -> Result<HashSet<ContactID>> {
    let rows: Vec<(ContactID,)> = sqlx::query_as(
        "SELECT DISTINCT contact_id FROM flow_runs WHERE flow_id = $1 AND contact_id = ANY($2)",
    )
    .bind(flow_id)
    .bind(raw_ids(contact_ids))
    .fetch_all(db)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::channel::{Channel, LogPolicy};
    use crate::models::group::{Group, GroupStatus, GroupType};

    fn urn_row(id: i64, identity: &str, priority: i32, channel: i64) -> ContactUrn {
        let urn = Urn::parse(identity).unwrap();
        ContactUrn {
            id: UrnID(id),
            org_id: OrgID(1),
            contact_id: ContactID(5),
            identity: urn.identity(),
            scheme: urn.scheme,
            path: urn.path,
            display: None,
            priority,
            channel_id: ChannelID(channel),
            auth_tokens: None,
        }
    }

    fn channel(id: i64) -> Channel {
        Channel {
            id: ChannelID(id),
            uuid: Uuid::new_v4(),
            org_id: OrgID(1),
            name: "Twilio".to_string(),
            address: "+12065551212".to_string(),
            channel_type: "T".to_string(),
            country: Some("US".to_string()),
            schemes: vec!["tel".to_string()],
            role: "SR".to_string(),
            tps: 10,
            parent_id: ChannelID(0),
            config: Json(serde_json::json!({})),
            log_policy: LogPolicy::All,
        }
    }

    fn contact(urns: Vec<ContactUrn>, group_ids: Vec<GroupID>) -> Contact {
        Contact {
            id: ContactID(5),
            uuid: Uuid::new_v4(),
            org_id: OrgID(1),
            name: Some("Cathy".to_string()),
            language: Some("eng".to_string()),
            status: ContactStatus::Active,
            fields: HashMap::from([(
                "age".to_string(),
                FieldValue::parse("23", chrono_tz::UTC),
            )]),
            urns,
            group_ids,
            tickets: Vec::new(),
            created_on: Utc::now(),
            modified_on: Utc::now(),
            last_seen_on: None,
            current_session_uuid: None,
            current_flow_id: Default::default(),
        }
    }

    #[test]
    fn test_contact_status_codes() {
        assert_eq!(ContactStatus::from_code("V"), Some(ContactStatus::Archived));
        assert_eq!(ContactStatus::Stopped.as_str(), "stopped");
        assert_eq!(
            serde_json::to_value(ContactStatus::Blocked).unwrap(),
            serde_json::json!("blocked")
        );
    }

    #[test]
    fn test_to_engine() {
        let ch = channel(3);
        let status_group = Group {
            id: GroupID(1),
            uuid: Uuid::new_v4(),
            name: "Active".to_string(),
            group_type: GroupType::DbActive,
            status: GroupStatus::Ready,
            query: None,
            is_visible: false,
        };
        let doctors = Group {
            id: GroupID(2),
            uuid: Uuid::new_v4(),
            name: "Doctors".to_string(),
            group_type: GroupType::Manual,
            status: GroupStatus::Ready,
            query: None,
            is_visible: true,
        };
        let oa = OrgAssets::for_tests()
            .with_channels(vec![ch.clone()])
            .with_groups(vec![status_group, doctors.clone()]);

        let c = contact(
            vec![urn_row(10, "tel:+16055741111", 1000, 3), urn_row(11, "telegram:1234", 999, 0)],
            vec![GroupID(1), GroupID(2)],
        );
        let ec = c.to_engine(&oa);

        assert_eq!(
            ec.urns,
            vec![format!("tel:+16055741111?channel={}", ch.uuid), "telegram:1234".to_string()]
        );
        assert_eq!(ec.groups, vec![doctors.reference()]);
        assert_eq!(ec.fields["age"].number, Some(23.0));
        assert_eq!(c.preferred_urn().map(|u| u.id), Some(UrnID(10)));
    }

    #[test]
    fn test_normalize_urns() {
        let oa = OrgAssets::for_tests();
        let urns = normalize_urns(&oa, &["tel:+1 605 574 2222".to_string()]).unwrap();
        assert_eq!(urns[0].identity(), "tel:+16055742222");

        let err = normalize_urns(&oa, &["tel:+16055742222".to_string(), "xyz".to_string()]).unwrap_err();
        assert!(matches!(err, CoreError::UrnInvalid { index: 1, .. }));
        assert!(err.is_validation());
    }

    #[test]
    fn test_plan_urn_change() {
        let oa = OrgAssets::for_tests();
        let current = vec![
            urn_row(10, "tel:+16055741111", 1000, 0),
            urn_row(11, "telegram:1234", 999, 0),
        ];

        // same URNs in the same order is a no-op
        let same = vec![Urn::parse("tel:+16055741111").unwrap(), Urn::parse("telegram:1234").unwrap()];
        let (updates, inserts, detach) = plan_urn_change(&oa, &current, ContactID(5), &same);
        assert!(updates.is_empty() && inserts.is_empty() && detach.is_empty());

        // swap order, drop one, add one
        let desired = vec![
            Urn::parse("telegram:1234").unwrap(),
            Urn::parse("whatsapp:16055743333").unwrap(),
        ];
        let (updates, inserts, detach) = plan_urn_change(&oa, &current, ContactID(5), &desired);
        assert_eq!(
            updates,
            vec![UrnUpdate {
                id: UrnID(11),
                priority: 1000,
                channel_id: ChannelID(0)
            }]
        );
        assert_eq!(inserts.len(), 1);
        assert_eq!(inserts[0].urn.identity(), "whatsapp:16055743333");
        assert_eq!(inserts[0].priority, 999);
        assert_eq!(detach, vec![UrnID(10)]);
    }

    #[test]
    fn test_taken_on_race() {
        let urns = vec![Urn::parse("tel:+16055741111").unwrap(), Urn::parse("telegram:99").unwrap()];
        let owners = HashMap::from([("telegram:99".to_string(), ContactID(8))]);

        // not a unique violation, passed through untouched
        let err = taken_on_race(CoreError::Invariant("boom".to_string()), &urns, &owners);
        assert!(matches!(err, CoreError::Invariant(_)));
    }
}
