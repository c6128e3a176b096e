// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Driving contacts through the engine.
//!
//! Everything here that changes a contact does so holding that contact's lock. Contacts whose
//! lock can't be had within [`LOCK_RETRY`] are skipped and reported back to the caller.

mod broadcasts;
mod channel_events;
mod imports;
mod modifiers;
mod sprints;
mod starts;

use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

pub use self::broadcasts::{process_broadcast, send_broadcast_batch};
pub use self::channel_events::handle_channel_event;
pub use self::imports::import_contact_batch;
pub use self::modifiers::apply_modifiers;
pub use self::sprints::{resume_session, start_sessions};
pub use self::starts::{process_flow_start, start_flow_batch};

use crate::config::SessionStorage;
use crate::error::Result;
use crate::locks;
use crate::models::ids::{ContactID, OrgID};
use crate::models::session::Session;
use crate::runtime::Runtime;

/// How long to wait on a contact lock before skipping the contact.
pub const LOCK_RETRY: Duration = Duration::from_secs(10);

/// Runs `f` with the given contacts locked, passing it the ones that were.
///
/// Returns what `f` returned and the contacts that were skipped. Locks are released whether
/// or not `f` succeeds.
pub(crate) async fn with_contact_locks<T, F, Fut>(
    rt: &Runtime,
    org_id: OrgID,
    contact_ids: &[ContactID],
    f: F,
) -> Result<(T, Vec<ContactID>)>
where
    F: FnOnce(Vec<ContactID>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let (held, skipped) = locks::lock_contacts(&rt.redis, org_id, contact_ids, LOCK_RETRY).await?;
    if !skipped.is_empty() {
        warn!(org_id = %org_id, skipped = ?skipped, "Unable to lock contacts, skipping");
    }

    let locked: Vec<ContactID> = contact_ids
        .iter()
        .copied()
        .filter(|id| held.contains_key(id))
        .collect();

    let result = f(locked).await;

    if let Err(e) = locks::unlock_contacts(&rt.redis, org_id, &held).await {
        error!(org_id = %org_id, error = %e, "Error releasing contact locks");
    }

    Ok((result?, skipped))
}

/// Moves a session's output to object storage when sessions are configured to live there.
async fn store_output(rt: &Runtime, session: &mut Session) -> Result<()> {
    if rt.config.session_storage == SessionStorage::S3 {
        session
            .offload_output(rt.store.as_ref(), &rt.config.sessions_bucket)
            .await?;
    }
    Ok(())
}
