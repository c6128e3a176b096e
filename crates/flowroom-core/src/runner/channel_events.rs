// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handling events reported by channels.

use std::collections::BTreeMap;

use tracing::{debug, info, instrument};

use super::{modifiers, with_contact_locks};
use crate::engine::Modifier;
use crate::error::Result;
use crate::models::channel_event::{self, ChannelEventStatus, ChannelEventType};
use crate::models::contact::{self, ContactStatus};
use crate::models::ids::{ChannelEventID, OrgID, UserID};
use crate::models::session::{self, SessionStatus};
use crate::runtime::Runtime;

/// Handles a pending channel event and marks it handled.
///
/// A `stop_contact` event ends the contact's session and stops them. Any other event just
/// records that the contact was seen.
#[instrument(skip(rt))]
pub async fn handle_channel_event(rt: &Runtime, org_id: OrgID, event_id: ChannelEventID) -> Result<()> {
    let event = channel_event::load_channel_event(&rt.db, org_id, event_id).await?;
    if event.status == ChannelEventStatus::Handled {
        debug!("Channel event already handled");
        return Ok(());
    }

    if !event.contact_id.is_nil() {
        let contact_ids = [event.contact_id];

        match event.event_type {
            ChannelEventType::StopContact => {
                with_contact_locks(rt, org_id, &contact_ids, |locked| async move {
                    session::interrupt_contacts(&rt.db, &locked, SessionStatus::Interrupted).await
                })
                .await?;

                let oa = rt.org_assets(org_id).await?;
                let mods = BTreeMap::from([(
                    event.contact_id,
                    vec![Modifier::Status {
                        status: ContactStatus::Stopped,
                    }],
                )]);
                modifiers::apply_modifiers(rt, &oa, UserID(0), &mods).await?;

                info!(contact_id = %event.contact_id, "Contact stopped by channel");
            }
            _ => {
                let seen_on = event.occurred_on;
                with_contact_locks(rt, org_id, &contact_ids, |locked| async move {
                    let mut tx = rt.db.begin().await?;
                    contact::update_last_seen_on(&mut tx, &locked, seen_on).await?;
                    tx.commit().await?;
                    Ok(())
                })
                .await?;
            }
        }
    }

    channel_event::mark_channel_event_handled(&rt.db, event_id).await?;
    Ok(())
}
