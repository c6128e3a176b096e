// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trigger housekeeping.

use sqlx::PgConnection;

use super::ids::{ContactID, raw_ids};
use crate::error::Result;

/// Archives active triggers whose only target is one of the given contacts.
///
/// Returns the number of triggers archived.
pub async fn archive_contact_triggers(
    conn: &mut PgConnection,
    contact_ids: &[ContactID],
) -> Result<u64> {
    if contact_ids.is_empty() {
        return Ok(0);
    }

    let res = sqlx::query(
        r#"
        UPDATE triggers t SET is_archived = TRUE, modified_on = NOW()
        WHERE t.is_active AND NOT t.is_archived
          AND NOT EXISTS (SELECT 1 FROM triggers_groups tg WHERE tg.trigger_id = t.id)
          AND EXISTS (
              SELECT 1 FROM triggers_contacts tc
              WHERE tc.trigger_id = t.id
              GROUP BY tc.trigger_id
              HAVING COUNT(*) = 1 AND MIN(tc.contact_id) = ANY($1)
          )
        "#,
    )
    .bind(raw_ids(contact_ids))
    .execute(conn)
    .await?;

    Ok(res.rows_affected())
}
