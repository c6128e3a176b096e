// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow runs, one per flow a contact passes through within a session.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgExecutor};
use uuid::Uuid;

use super::ids::{ContactID, FlowID, OrgID, RunID, StartID};
use crate::assets::OrgAssets;
use crate::engine::{EngineRun, RunResult};
use crate::error::Result;

code_enum! {
    pub enum RunStatus {
        Active = ("A", "active"),
        Waiting = ("W", "waiting"),
        Completed = ("C", "completed"),
        Expired = ("X", "expired"),
        Interrupted = ("I", "interrupted"),
        Failed = ("F", "failed"),
    }
}

impl RunStatus {
    pub fn is_ended(self) -> bool {
        !matches!(self, Self::Active | Self::Waiting)
    }
}

/// A row in `flow_runs`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct FlowRun {
    pub id: RunID,
    pub uuid: Uuid,
    pub org_id: OrgID,
    pub session_uuid: Uuid,
    pub flow_id: FlowID,
    pub contact_id: ContactID,
    pub status: RunStatus,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
    pub exited_on: Option<DateTime<Utc>>,
    pub responded: bool,
    pub results: Json<BTreeMap<String, RunResult>>,
    pub path_nodes: Vec<Uuid>,
    pub path_times: Vec<DateTime<Utc>>,
    pub current_node_uuid: Option<Uuid>,
    pub start_id: StartID,
}

impl FlowRun {
    /// Builds the row for an engine run. Runs of flows that no longer exist get a nil flow id.
    pub fn from_engine(
        oa: &OrgAssets,
        session_uuid: Uuid,
        contact_id: ContactID,
        run: &EngineRun,
    ) -> Self {
        let flow_id = oa
            .flow_by_uuid(run.flow.uuid)
            .map(|f| f.id)
            .unwrap_or_default();

        let path_nodes: Vec<Uuid> = run.path.iter().map(|s| s.node_uuid).collect();
        let path_times: Vec<DateTime<Utc>> = run.path.iter().map(|s| s.arrived_on).collect();
        let current_node_uuid = if run.is_active_or_waiting() {
            path_nodes.last().copied()
        } else {
            None
        };

        Self {
            id: RunID(0),
            uuid: run.uuid,
            org_id: oa.org_id(),
            session_uuid,
            flow_id,
            contact_id,
            status: run.status,
            created_on: run.created_on,
            modified_on: run.modified_on,
            exited_on: run.exited_on,
            responded: run.responded(),
            results: Json(run.results.clone()),
            path_nodes,
            path_times,
            current_node_uuid,
            start_id: StartID(0),
        }
    }
}

/// Inserts new runs, setting their ids.
pub async fn insert_runs(conn: &mut PgConnection, runs: &mut [FlowRun]) -> Result<()> {
    for run in runs.iter_mut() {
        let (id,): (RunID,) = sqlx::query_as(
            r#"
            INSERT INTO flow_runs (uuid, org_id, session_uuid, flow_id, contact_id, status, created_on,
                                   modified_on, exited_on, responded, results, path_nodes, path_times,
                                   current_node_uuid, start_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING id
            "#,
        )
        .bind(run.uuid)
        .bind(run.org_id)
        .bind(run.session_uuid)
        .bind(run.flow_id)
        .bind(run.contact_id)
        .bind(run.status)
        .bind(run.created_on)
        .bind(run.modified_on)
        .bind(run.exited_on)
        .bind(run.responded)
        .bind(&run.results)
        .bind(&run.path_nodes)
        .bind(&run.path_times)
        .bind(run.current_node_uuid)
        .bind(run.start_id)
        .fetch_one(&mut *conn)
        .await?;

        run.id = id;
    }

    Ok(())
}

/// Writes the new state of existing runs.
pub async fn update_runs(conn: &mut PgConnection, runs: &[FlowRun]) -> Result<()> {
    for run in runs {
        sqlx::query(
            r#"
            UPDATE flow_runs
            SET status = $2, modified_on = $3, exited_on = $4, responded = $5, results = $6,
                path_nodes = $7, path_times = $8, current_node_uuid = $9
            WHERE uuid = $1
            "#,
        )
        .bind(run.uuid)
        .bind(run.status)
        .bind(run.modified_on)
        .bind(run.exited_on)
        .bind(run.responded)
        .bind(&run.results)
        .bind(&run.path_nodes)
        .bind(&run.path_times)
        .bind(run.current_node_uuid)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

/// Loads the runs of a session in creation order.
pub async fn load_session_runs<'e>(db: impl PgExecutor<'e>, session_uuid: Uuid) -> Result<Vec<FlowRun>> {
    let runs = sqlx::query_as::<_, FlowRun>(
        r#"
        SELECT id, uuid, org_id, session_uuid, flow_id, contact_id, status, created_on, modified_on,
               exited_on, responded, results, path_nodes, path_times, current_node_uuid, start_id
        FROM flow_runs
        WHERE session_uuid = $1
        ORDER BY id
        "#,
    )
    .bind(session_uuid)
    .fetch_all(db)
    .await?;

    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Step;
    use crate::models::flow::FlowRef;

    fn engine_run(status: RunStatus) -> EngineRun {
        let now = Utc::now();
        EngineRun {
            uuid: Uuid::new_v4(),
            flow: FlowRef {
                uuid: Uuid::new_v4(),
                name: "Deleted".to_string(),
            },
            status,
            path: vec![
                Step {
                    uuid: Uuid::new_v4(),
                    node_uuid: Uuid::new_v4(),
                    exit_uuid: Some(Uuid::new_v4()),
                    arrived_on: now,
                },
                Step {
                    uuid: Uuid::new_v4(),
                    node_uuid: Uuid::new_v4(),
                    exit_uuid: None,
                    arrived_on: now,
                },
            ],
            results: BTreeMap::new(),
            events: Vec::new(),
            parent_uuid: None,
            created_on: now,
            modified_on: now,
            exited_on: status.is_ended().then_some(now),
        }
    }

    #[test]
    fn test_run_status() {
        assert!(!RunStatus::Waiting.is_ended());
        assert!(RunStatus::Interrupted.is_ended());
        assert_eq!(RunStatus::Expired.code(), "X");
    }

    #[test]
    fn test_from_engine() {
        let oa = OrgAssets::for_tests();

        let waiting = engine_run(RunStatus::Waiting);
        let run = FlowRun::from_engine(&oa, Uuid::new_v4(), ContactID(3), &waiting);
        assert_eq!(run.path_nodes.len(), run.path_times.len());
        assert_eq!(run.current_node_uuid, Some(waiting.path[1].node_uuid));
        assert!(run.flow_id.is_nil());
        assert!(!run.responded);

        let completed = engine_run(RunStatus::Completed);
        let run = FlowRun::from_engine(&oa, Uuid::new_v4(), ContactID(3), &completed);
        assert_eq!(run.current_node_uuid, None);
        assert!(run.exited_on.is_some());
    }
}
