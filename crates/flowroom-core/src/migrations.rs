// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The flowroom schema.
//!
//! One embedded migration set creates everything the core reads and writes: orgs and their
//! assets (channels, fields, groups, flows, campaigns and their points), contacts with
//! their URNs and group memberships, sessions and runs, messages, tickets, contact fires,
//! flow starts and broadcasts with their targets, imports, incidents and the count tables.
//!
//! Status and type columns hold the single-letter codes of the `code_enum!` types in
//! [`crate::models`]. Nil ids are stored as `NULL`.

use sqlx::PgPool;
use sqlx::migrate::{MigrateError, Migrator};

/// The embedded PostgreSQL migrations.
pub static POSTGRES: Migrator = sqlx::migrate!("./migrations/postgresql");

/// Brings a database up to the current schema, skipping migrations already applied.
pub async fn run_postgres(pool: &PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await?;
    tracing::debug!(migrations = POSTGRES.iter().count(), "Schema is current");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_migrations() {
        let first = POSTGRES.iter().next().unwrap();
        assert_eq!(first.version, 20250101000000);
        assert_eq!(first.description, "initial schema");
        assert!(first.sql.contains("CREATE TABLE contact_fires"));
        assert!(first.sql.contains("CREATE TABLE campaign_points"));
    }
}
