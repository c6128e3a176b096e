// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow sessions and their interruption.
//!
//! A session row holds the serialized engine session, inline or as the URL of an object in
//! the sessions bucket. The contact's `current_session_uuid` always points at its waiting
//! session, if it has one, and every write here keeps the two in step.

use chrono::{DateTime, Duration, Utc};
use sqlx::{PgConnection, PgExecutor, PgPool};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::contact_fire::{self, ContactFire, FireType};
use super::flow::FlowType;
use super::ids::{ChannelID, ContactID, FlowID, OrgID, raw_ids};
use super::run::{self, FlowRun};
use crate::assets::OrgAssets;
use crate::engine::{EngineSession, Sprint};
use crate::error::{CoreError, Result};
use crate::storage::{self, Acl, ObjectStore};

/// How many sessions are interrupted per transaction.
pub const INTERRUPT_BATCH_SIZE: usize = 100;

code_enum! {
    pub enum SessionStatus {
        Waiting = ("W", "waiting"),
        Completed = ("C", "completed"),
        Expired = ("X", "expired"),
        Interrupted = ("I", "interrupted"),
        Failed = ("F", "failed"),
    }
}

/// A row in `flow_sessions`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Session {
    pub uuid: Uuid,
    pub org_id: OrgID,
    pub contact_id: ContactID,
    pub contact_uuid: Uuid,
    pub session_type: FlowType,
    pub status: SessionStatus,
    pub last_sprint_uuid: Option<Uuid>,
    pub current_flow_uuid: Option<Uuid>,
    pub call_uuid: Option<Uuid>,
    pub output: Option<String>,
    pub output_url: Option<String>,
    pub created_on: DateTime<Utc>,
    pub ended_on: Option<DateTime<Utc>>,
}

impl Session {
    /// Builds the row for the first sprint of a session.
    pub fn new(
        oa: &OrgAssets,
        es: &EngineSession,
        sprint: &Sprint,
        call_uuid: Option<Uuid>,
    ) -> Result<Self> {
        let mut session = Self {
            uuid: es.uuid,
            org_id: oa.org_id(),
            contact_id: es.contact.id,
            contact_uuid: es.contact.uuid,
            session_type: es.session_type,
            status: es.status,
            last_sprint_uuid: None,
            current_flow_uuid: None,
            call_uuid,
            output: None,
            output_url: None,
            created_on: Utc::now(),
            ended_on: None,
        };
        session.apply(es, sprint)?;
        Ok(session)
    }

    /// Copies the state of the engine session after a sprint onto this row.
    pub fn apply(&mut self, es: &EngineSession, sprint: &Sprint) -> Result<()> {
        self.status = es.status;
        self.last_sprint_uuid = Some(sprint.uuid);
        self.current_flow_uuid = es.waiting_run().map(|r| r.flow.uuid);
        self.output = Some(es.output()?);
        self.output_url = None;
        self.ended_on = match self.status {
            SessionStatus::Waiting => None,
            _ => Some(self.ended_on.unwrap_or_else(Utc::now)),
        };
        Ok(())
    }

    /// The id of the flow the contact is waiting in.
    pub fn current_flow_id(&self, oa: &OrgAssets) -> FlowID {
        self.current_flow_uuid
            .and_then(|uuid| oa.flow_by_uuid(uuid))
            .map(|f| f.id)
            .unwrap_or_default()
    }

    /// Moves the output to the sessions bucket, leaving only its URL on the row.
    pub async fn offload_output(&mut self, store: &dyn ObjectStore, bucket: &str) -> Result<()> {
        let Some(output) = self.output.take() else {
            return Ok(());
        };

        let key = storage::session_path(self.org_id, self.contact_uuid, self.uuid, &output, Utc::now());
        let url = store
            .put(bucket, &key, "application/json", output.into_bytes(), Acl::Private)
            .await?;
        self.output_url = Some(url);
        Ok(())
    }

    /// The serialized engine session, fetching it from the sessions bucket if it was offloaded.
    pub async fn load_output(&self, store: &dyn ObjectStore, bucket: &str) -> Result<String> {
        if let Some(output) = &self.output {
            return Ok(output.clone());
        }

        let url = self
            .output_url
            .as_deref()
            .ok_or_else(|| CoreError::Invariant(format!("session {} has no output", self.uuid)))?;
        let key = store
            .key_for_url(bucket, url)
            .ok_or_else(|| CoreError::Storage(format!("session output URL {} not in bucket {}", url, bucket)))?;

        let body = store.get(bucket, &key).await?;
        String::from_utf8(body)
            .map_err(|e| CoreError::Storage(format!("session output {} isn't UTF-8: {}", url, e)))
    }

    /// The expiration and timeout fires for a waiting session.
    pub fn wait_fires(&self, es: &EngineSession) -> Vec<ContactFire> {
        let (Some(wait), Some(sprint_uuid)) = (&es.wait, self.last_sprint_uuid) else {
            return Vec::new();
        };
        if self.status != SessionStatus::Waiting {
            return Vec::new();
        }

        let mut fires = Vec::with_capacity(2);
        if let Some(expires_on) = wait.expires_on {
            fires.push(ContactFire::for_session(
                self.org_id,
                self.contact_id,
                FireType::WaitExpiration,
                self.uuid,
                sprint_uuid,
                expires_on,
            ));
        }
        if let Some(timeout) = wait.timeout_seconds {
            fires.push(ContactFire::for_session(
                self.org_id,
                self.contact_id,
                FireType::WaitTimeout,
                self.uuid,
                sprint_uuid,
                Utc::now() + Duration::seconds(timeout as i64),
            ));
        }
        fires
    }
}

const SELECT_SESSION: &str = r#"
    SELECT uuid, org_id, contact_id, contact_uuid, session_type, status, last_sprint_uuid,
           current_flow_uuid, call_uuid, output, output_url, created_on, ended_on
    FROM flow_sessions
"#;

/// Loads a session by UUID.
pub async fn load_session<'e>(db: impl PgExecutor<'e>, uuid: Uuid) -> Result<Option<Session>> {
    let session = sqlx::query_as::<_, Session>(&format!("{SELECT_SESSION} WHERE uuid = $1"))
        .bind(uuid)
        .fetch_optional(db)
        .await?;

    Ok(session)
}

/// Loads the waiting session of a contact, if any.
pub async fn load_waiting_session<'e>(
    db: impl PgExecutor<'e>,
    contact_uuid: Uuid,
) -> Result<Option<Session>> {
    let session = sqlx::query_as::<_, Session>(&format!(
        "{SELECT_SESSION} WHERE contact_uuid = $1 AND status = 'W'"
    ))
    .bind(contact_uuid)
    .fetch_optional(db)
    .await?;

    Ok(session)
}

async fn update_contact_pointer(
    conn: &mut PgConnection,
    oa: &OrgAssets,
    session: &Session,
) -> Result<()> {
    // background sessions never wait so they leave whatever the contact is waiting in alone
    if session.session_type == FlowType::Background {
        return Ok(());
    }

    let (session_uuid, flow_id) = match session.status {
        SessionStatus::Waiting => (Some(session.uuid), session.current_flow_id(oa)),
        _ => (None, FlowID(0)),
    };

    sqlx::query(
        r#"
        UPDATE contacts SET current_session_uuid = $2, current_flow_id = $3, modified_on = NOW()
        WHERE id = $1
        "#,
    )
    .bind(session.contact_id)
    .bind(session_uuid)
    .bind(flow_id)
    .execute(conn)
    .await?;

    Ok(())
}

/// Inserts new sessions with their runs, points their contacts at them and schedules their
/// wait fires. The root run of each session gets the start id at the same position in
/// `start_ids`, if any.
pub async fn insert_sessions(
    conn: &mut PgConnection,
    oa: &OrgAssets,
    sessions: &[(Session, &EngineSession)],
    start_ids: &[super::ids::StartID],
) -> Result<Vec<FlowRun>> {
    let mut runs = Vec::new();
    let mut fires = Vec::new();

    for (i, (session, es)) in sessions.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO flow_sessions (uuid, org_id, contact_id, contact_uuid, session_type, status,
                                       last_sprint_uuid, current_flow_uuid, call_uuid, output,
                                       output_url, created_on, ended_on)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(session.uuid)
        .bind(session.org_id)
        .bind(session.contact_id)
        .bind(session.contact_uuid)
        .bind(session.session_type)
        .bind(session.status)
        .bind(session.last_sprint_uuid)
        .bind(session.current_flow_uuid)
        .bind(session.call_uuid)
        .bind(&session.output)
        .bind(&session.output_url)
        .bind(session.created_on)
        .bind(session.ended_on)
        .execute(&mut *conn)
        .await?;

        update_contact_pointer(conn, oa, session).await?;

        let start_id = start_ids.get(i).copied().unwrap_or_default();
        for (j, r) in es.runs.iter().enumerate() {
            let mut row = FlowRun::from_engine(oa, session.uuid, session.contact_id, r);
            if j == 0 {
                row.start_id = start_id;
            }
            runs.push(row);
        }
        fires.extend(session.wait_fires(es));
    }

    run::insert_runs(conn, &mut runs).await?;
    contact_fire::insert_contact_fires(conn, &fires).await?;

    Ok(runs)
}

/// Writes the state of a session after a resuming sprint.
///
/// Runs that existed when the session was loaded are updated if they changed, new runs are
/// inserted. The session's previous wait fires are replaced by those of its new wait.
pub async fn update_session(
    conn: &mut PgConnection,
    oa: &OrgAssets,
    session: &Session,
    es: &EngineSession,
    previous_runs: &[FlowRun],
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE flow_sessions
        SET status = $2, last_sprint_uuid = $3, current_flow_uuid = $4, output = $5, output_url = $6,
            ended_on = $7
        WHERE uuid = $1
        "#,
    )
    .bind(session.uuid)
    .bind(session.status)
    .bind(session.last_sprint_uuid)
    .bind(session.current_flow_uuid)
    .bind(&session.output)
    .bind(&session.output_url)
    .bind(session.ended_on)
    .execute(&mut *conn)
    .await?;

    let mut inserts = Vec::new();
    let mut updates = Vec::new();
    for r in &es.runs {
        match previous_runs.iter().find(|p| p.uuid == r.uuid) {
            Some(prev) if r.modified_on > prev.modified_on => {
                updates.push(FlowRun::from_engine(oa, session.uuid, session.contact_id, r))
            }
            Some(_) => {}
            None => inserts.push(FlowRun::from_engine(oa, session.uuid, session.contact_id, r)),
        }
    }
    run::update_runs(conn, &updates).await?;
    run::insert_runs(conn, &mut inserts).await?;

    update_contact_pointer(conn, oa, session).await?;

    contact_fire::delete_session_fires(conn, &[session.contact_id]).await?;
    contact_fire::insert_contact_fires(conn, &session.wait_fires(es)).await?;

    if session.status != SessionStatus::Waiting {
        if let Some(call_uuid) = session.call_uuid {
            super::call::end_call(conn, call_uuid).await?;
        }
    }

    Ok(())
}

/// Ends the given waiting sessions with `status`, along with their active and waiting runs,
/// and detaches them from their contacts.
async fn exit_sessions(
    conn: &mut PgConnection,
    session_uuids: &[Uuid],
    status: SessionStatus,
) -> Result<Vec<ContactID>> {
    if session_uuids.is_empty() {
        return Ok(Vec::new());
    }

    let contact_ids: Vec<(ContactID,)> = sqlx::query_as(
        r#"
        UPDATE flow_sessions SET status = $2, ended_on = NOW(), current_flow_uuid = NULL
        WHERE uuid = ANY($1) AND status = 'W'
        RETURNING contact_id
        "#,
    )
    .bind(session_uuids)
    .bind(status)
    .fetch_all(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        UPDATE flow_runs SET status = $2, exited_on = NOW(), modified_on = NOW(), current_node_uuid = NULL
        WHERE session_uuid = ANY($1) AND status IN ('A', 'W')
        "#,
    )
    .bind(session_uuids)
    .bind(status.code())
    .execute(&mut *conn)
    .await?;

    let contact_ids: Vec<ContactID> = contact_ids.into_iter().map(|(id,)| id).collect();

    sqlx::query(
        r#"
        UPDATE contacts SET current_session_uuid = NULL, current_flow_id = NULL, modified_on = NOW()
        WHERE current_session_uuid = ANY($1)
        "#,
    )
    .bind(session_uuids)
    .execute(&mut *conn)
    .await?;

    contact_fire::delete_session_fires(conn, &contact_ids).await?;

    Ok(contact_ids)
}

/// Ends the waiting sessions of the given contacts. Applying it twice is the same as once.
#[instrument(skip(db, contact_ids), fields(contacts = contact_ids.len()))]
pub async fn interrupt_contacts(
    db: &PgPool,
    contact_ids: &[ContactID],
    status: SessionStatus,
) -> Result<usize> {
    let mut interrupted = 0;

    for batch in contact_ids.chunks(INTERRUPT_BATCH_SIZE) {
        let mut tx = db.begin().await?;

        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT current_session_uuid FROM contacts
            WHERE id = ANY($1) AND current_session_uuid IS NOT NULL
            "#,
        )
        .bind(raw_ids(batch))
        .fetch_all(&mut *tx)
        .await?;
        let session_uuids: Vec<Uuid> = rows.into_iter().map(|(uuid,)| uuid).collect();

        interrupted += exit_sessions(&mut tx, &session_uuids, status).await?.len();

        // sessions that somehow lost their contact pointer still shouldn't stay waiting
        contact_fire::delete_session_fires(&mut tx, batch).await?;
        tx.commit().await?;
    }

    debug!(count = interrupted, "Interrupted contact sessions");
    Ok(interrupted)
}

/// Ends the waiting sessions of the given contacts inside an existing transaction.
pub async fn interrupt_contacts_in_tx(
    conn: &mut PgConnection,
    contact_ids: &[ContactID],
    status: SessionStatus,
) -> Result<usize> {
    if contact_ids.is_empty() {
        return Ok(0);
    }

    let rows: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT current_session_uuid FROM contacts
        WHERE id = ANY($1) AND current_session_uuid IS NOT NULL
        "#,
    )
    .bind(raw_ids(contact_ids))
    .fetch_all(&mut *conn)
    .await?;
    let session_uuids: Vec<Uuid> = rows.into_iter().map(|(uuid,)| uuid).collect();

    Ok(exit_sessions(conn, &session_uuids, status).await?.len())
}

async fn interrupt_session_uuids(db: &PgPool, session_uuids: &[Uuid]) -> Result<usize> {
    let mut interrupted = 0;
    for batch in session_uuids.chunks(INTERRUPT_BATCH_SIZE) {
        let mut tx = db.begin().await?;
        interrupted += exit_sessions(&mut tx, batch, SessionStatus::Interrupted).await?.len();
        tx.commit().await?;
    }
    Ok(interrupted)
}

/// Interrupts the waiting sessions of calls on a channel.
#[instrument(skip(db))]
pub async fn interrupt_sessions_for_channel(db: &PgPool, channel_id: ChannelID) -> Result<usize> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT s.uuid FROM flow_sessions s
        JOIN calls c ON c.uuid = s.call_uuid
        WHERE s.status = 'W' AND c.channel_id = $1
        "#,
    )
    .bind(channel_id)
    .fetch_all(db)
    .await?;
    let session_uuids: Vec<Uuid> = rows.into_iter().map(|(uuid,)| uuid).collect();

    let count = interrupt_session_uuids(db, &session_uuids).await?;
    debug!(count, "Interrupted sessions for channel");
    Ok(count)
}

/// Interrupts the sessions of contacts currently waiting in any of the given flows.
#[instrument(skip(db, flow_ids), fields(flows = flow_ids.len()))]
pub async fn interrupt_sessions_for_flows(db: &PgPool, flow_ids: &[FlowID]) -> Result<usize> {
    if flow_ids.is_empty() {
        return Ok(0);
    }

    let rows: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT current_session_uuid FROM contacts
        WHERE current_flow_id = ANY($1) AND current_session_uuid IS NOT NULL
        "#,
    )
    .bind(raw_ids(flow_ids))
    .fetch_all(db)
    .await?;
    let session_uuids: Vec<Uuid> = rows.into_iter().map(|(uuid,)| uuid).collect();

    let count = interrupt_session_uuids(db, &session_uuids).await?;
    debug!(count, "Interrupted sessions for flows");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineContact, EngineRun, Wait};
    use crate::models::contact::ContactStatus;
    use crate::models::flow::FlowRef;
    use crate::models::run::RunStatus;
    use crate::storage::MemoryStore;
    use std::collections::BTreeMap;

    fn engine_session(status: SessionStatus, wait: Option<Wait>) -> EngineSession {
        let now = Utc::now();
        let run_status = match status {
            SessionStatus::Waiting => RunStatus::Waiting,
            SessionStatus::Completed => RunStatus::Completed,
            SessionStatus::Expired => RunStatus::Expired,
            SessionStatus::Interrupted => RunStatus::Interrupted,
            SessionStatus::Failed => RunStatus::Failed,
        };

        EngineSession {
            uuid: Uuid::new_v4(),
            session_type: FlowType::Messaging,
            status,
            contact: EngineContact {
                uuid: Uuid::new_v4(),
                id: ContactID(7),
                name: None,
                language: None,
                status: ContactStatus::Active,
                created_on: now,
                last_seen_on: None,
                urns: Vec::new(),
                groups: Vec::new(),
                fields: BTreeMap::new(),
                tickets: Vec::new(),
            },
            runs: vec![EngineRun {
                uuid: Uuid::new_v4(),
                flow: FlowRef {
                    uuid: Uuid::new_v4(),
                    name: "Favorites".to_string(),
                },
                status: run_status,
                path: Vec::new(),
                results: BTreeMap::new(),
                events: Vec::new(),
                parent_uuid: None,
                created_on: now,
                modified_on: now,
                exited_on: None,
            }],
            wait,
        }
    }

    #[test]
    fn test_new_session() {
        let oa = OrgAssets::for_tests();
        let wait = Wait {
            expires_on: Some(Utc::now() + Duration::days(7)),
            timeout_seconds: Some(300),
        };
        let es = engine_session(SessionStatus::Waiting, Some(wait));
        let sprint = Sprint::new();

        let session = Session::new(&oa, &es, &sprint, None).unwrap();
        assert_eq!(session.status, SessionStatus::Waiting);
        assert_eq!(session.current_flow_uuid, Some(es.runs[0].flow.uuid));
        assert_eq!(session.ended_on, None);
        assert_eq!(session.last_sprint_uuid, Some(sprint.uuid));
        assert_eq!(session.contact_id, ContactID(7));

        let fires = session.wait_fires(&es);
        assert_eq!(fires.len(), 2);
        assert_eq!(fires[0].fire_type, FireType::WaitExpiration);
        assert_eq!(fires[1].fire_type, FireType::WaitTimeout);
        assert_eq!(fires[1].session_uuid, Some(es.uuid));
        assert_eq!(fires[1].scope, "");

        let es = engine_session(SessionStatus::Failed, None);
        let session = Session::new(&oa, &es, &sprint, None).unwrap();
        assert_eq!(session.current_flow_uuid, None);
        assert!(session.ended_on.is_some());
        assert!(session.wait_fires(&es).is_empty());
    }

    #[tokio::test]
    async fn test_offload_output() {
        let oa = OrgAssets::for_tests();
        let es = engine_session(SessionStatus::Completed, None);
        let mut session = Session::new(&oa, &es, &Sprint::new(), None).unwrap();
        let output = session.output.clone().unwrap();

        let store = MemoryStore::new();
        session.offload_output(&store, "sessions").await.unwrap();

        assert_eq!(session.output, None);
        let url = session.output_url.clone().unwrap();
        assert!(url.starts_with(&format!("memory://sessions/orgs/1/c/{}/", &es.contact.uuid.to_string()[..4])));
        assert_eq!(session.load_output(&store, "sessions").await.unwrap(), output);
    }
}
