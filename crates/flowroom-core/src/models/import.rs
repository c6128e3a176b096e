// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Contact imports and their batches.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{PgConnection, PgExecutor};
use uuid::Uuid;

use super::contact::ContactStatus;
use super::ids::{ImportBatchID, ImportID, OrgID, UserID};
use super::notification::{self, Notification};
use crate::error::{CoreError, Result};

code_enum! {
    pub enum ImportStatus {
        Pending = ("P", "pending"),
        Processing = ("O", "processing"),
        Complete = ("C", "complete"),
        Failed = ("F", "failed"),
    }
}

/// One contact to create or update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactSpec {
    /// Set to update an existing contact rather than match by URN.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ContactStatus>,
    #[serde(default)]
    pub urns: Vec<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub groups: Vec<Uuid>,
    /// The index of the record in the whole import.
    #[serde(rename = "_import_row")]
    pub import_row: i32,
}

/// A problem with one record of an import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportError {
    pub record: i32,
    pub row: i32,
    pub message: String,
}

/// A row in `contact_imports`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ContactImport {
    pub id: ImportID,
    pub org_id: OrgID,
    pub status: ImportStatus,
    pub num_records: i32,
    pub created_by_id: UserID,
    pub created_on: DateTime<Utc>,
    pub finished_on: Option<DateTime<Utc>>,
}

/// A row in `contact_import_batches`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ImportBatch {
    pub id: ImportBatchID,
    pub contact_import_id: ImportID,
    pub status: ImportStatus,
    pub specs: Json<Vec<ContactSpec>>,
    pub record_start: i32,
    pub record_end: i32,
    pub num_created: i32,
    pub num_updated: i32,
    pub num_errored: i32,
    pub errors: Json<Vec<ImportError>>,
    pub finished_on: Option<DateTime<Utc>>,
}

/// What happened to the records of a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub num_created: i32,
    pub num_updated: i32,
    pub errors: Vec<ImportError>,
}

impl BatchOutcome {
    pub fn error(&mut self, spec: &ContactSpec, record: i32, message: impl Into<String>) {
        self.errors.push(ImportError {
            record,
            row: spec.import_row,
            message: message.into(),
        });
    }
}

/// Inserts an import with its batches of specs, returning the import id.
pub async fn insert_import(
    conn: &mut PgConnection,
    org_id: OrgID,
    user_id: UserID,
    batches: &[Vec<ContactSpec>],
) -> Result<ImportID> {
    let num_records: usize = batches.iter().map(Vec::len).sum();

    let (id,): (ImportID,) = sqlx::query_as(
        r#"
        INSERT INTO contact_imports (org_id, status, num_records, created_by_id)
        VALUES ($1, 'P', $2, $3) RETURNING id
        "#,
    )
    .bind(org_id)
    .bind(num_records as i32)
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await?;

    let mut start = 0;
    for specs in batches {
        let end = start + specs.len() as i32;
        sqlx::query(
            r#"
            INSERT INTO contact_import_batches (contact_import_id, status, specs, record_start, record_end)
            VALUES ($1, 'P', $2, $3, $4)
            "#,
        )
        .bind(id)
        .bind(Json(specs))
        .bind(start)
        .bind(end)
        .execute(&mut *conn)
        .await?;
        start = end;
    }

    Ok(id)
}

/// Loads an import.
pub async fn load_import<'e>(db: impl PgExecutor<'e>, id: ImportID) -> Result<ContactImport> {
    sqlx::query_as::<_, ContactImport>(
        r#"
        SELECT id, org_id, status, num_records, created_by_id, created_on, finished_on
        FROM contact_imports WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| CoreError::not_found("contact import", id))
}

/// Loads the batches of an import, in record order.
pub async fn load_import_batches<'e>(db: impl PgExecutor<'e>, import_id: ImportID) -> Result<Vec<ImportBatch>> {
    let batches = sqlx::query_as::<_, ImportBatch>(
        r#"
        SELECT id, contact_import_id, status, specs, record_start, record_end, num_created, num_updated,
               num_errored, errors, finished_on
        FROM contact_import_batches WHERE contact_import_id = $1 ORDER BY record_start
        "#,
    )
    .bind(import_id)
    .fetch_all(db)
    .await?;

    Ok(batches)
}

/// Loads a batch.
pub async fn load_import_batch<'e>(db: impl PgExecutor<'e>, id: ImportBatchID) -> Result<ImportBatch> {
    sqlx::query_as::<_, ImportBatch>(
        r#"
        SELECT id, contact_import_id, status, specs, record_start, record_end, num_created, num_updated,
               num_errored, errors, finished_on
        FROM contact_import_batches WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| CoreError::not_found("contact import batch", id))
}

/// Marks a batch, and its import, as processing.
pub async fn mark_batch_processing(conn: &mut PgConnection, batch: &ImportBatch) -> Result<()> {
    sqlx::query("UPDATE contact_import_batches SET status = 'O' WHERE id = $1")
        .bind(batch.id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("UPDATE contact_imports SET status = 'O' WHERE id = $1 AND status = 'P'")
        .bind(batch.contact_import_id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// Records the outcome of a batch.
pub async fn mark_batch_complete(conn: &mut PgConnection, id: ImportBatchID, outcome: &BatchOutcome) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE contact_import_batches
        SET status = 'C', num_created = $2, num_updated = $3, num_errored = $4, errors = $5, finished_on = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(outcome.num_created)
    .bind(outcome.num_updated)
    .bind(outcome.errors.len() as i32)
    .bind(Json(&outcome.errors))
    .execute(conn)
    .await?;

    Ok(())
}

/// Records that a batch failed as a whole.
pub async fn mark_batch_failed(conn: &mut PgConnection, id: ImportBatchID) -> Result<()> {
    sqlx::query("UPDATE contact_import_batches SET status = 'F', finished_on = NOW() WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await?;

    Ok(())
}

/// Completes an import once none of its batches are still pending or processing. The import
/// fails if any batch did. Returns whether the import finished.
pub async fn finish_import_if_done(conn: &mut PgConnection, import_id: ImportID) -> Result<bool> {
    let statuses: Vec<ImportStatus> =
        sqlx::query_scalar("SELECT status FROM contact_import_batches WHERE contact_import_id = $1")
            .bind(import_id)
            .fetch_all(&mut *conn)
            .await?;

    let Some(status) = import_status(&statuses) else {
        return Ok(false);
    };

    let imp: Option<(OrgID, UserID)> = sqlx::query_as(
        r#"
        UPDATE contact_imports SET status = $2, finished_on = NOW()
        WHERE id = $1 AND finished_on IS NULL
        RETURNING org_id, created_by_id
        "#,
    )
    .bind(import_id)
    .bind(status)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some((org_id, user_id)) = imp {
        notification::insert_notifications(conn, &[Notification::import_finished(org_id, import_id, user_id)])
            .await?;
    }

    Ok(true)
}

/// The final status of an import with batches in the given statuses, if they've all finished.
fn import_status(batches: &[ImportStatus]) -> Option<ImportStatus> {
    if batches
        .iter()
        .any(|s| matches!(s, ImportStatus::Pending | ImportStatus::Processing))
    {
        None
    } else if batches.contains(&ImportStatus::Failed) {
        Some(ImportStatus::Failed)
    } else {
        Some(ImportStatus::Complete)
    }
}
