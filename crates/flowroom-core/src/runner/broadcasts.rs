// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sending broadcasts.

use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::assets::OrgAssets;
use crate::audience::{self, Audience};
use crate::courier;
use crate::error::Result;
use crate::models::broadcast::{self, Broadcast, BroadcastBatch, BroadcastStatus};
use crate::models::contact::{self, Contact};
use crate::models::ids::{BroadcastID, MsgID};
use crate::models::msg::{self, MsgContent, MsgOrigin, MsgType, OutgoingMsg};
use crate::runtime::Runtime;

/// Builds the message a contact gets from a batch, if there's a translation to send them.
async fn broadcast_msg(
    rt: &Runtime,
    oa: &OrgAssets,
    batch: &BroadcastBatch,
    contact: &Contact,
) -> Result<Option<OutgoingMsg>> {
    let Some((language, translation)) = broadcast::pick_translation(
        &batch.translations,
        &batch.base_language,
        contact.language.as_deref(),
        &oa.org().flow_languages,
    ) else {
        warn!(contact_id = %contact.id, "No translation to send contact, skipping");
        return Ok(None);
    };

    let context = json!({});
    let out = msg::create_msg_out(
        rt.engine.as_ref(),
        oa,
        contact,
        &MsgContent::from(translation),
        batch.template_id,
        &batch.template_variables,
        Some(language),
        Some(&context),
    )
    .await?;

    let opts = rt.msg_options(MsgOrigin::Broadcast(batch.broadcast_id), None, MsgType::Text);
    let mut m = msg::new_msg_out(&rt.redis, oa, contact, &out, opts).await?;
    m.msg.optin_id = batch.optin_id;
    m.msg.created_by_id = batch.created_by_id;

    Ok(Some(m))
}

/// Sends one batch of a broadcast, returning the ids of the messages handed to the courier.
///
/// Each contact gets the translation for their language if the org allows it, otherwise the
/// org's default or the base language. The last batch of a broadcast marks it completed.
#[instrument(skip_all, fields(org_id = %batch.org_id, broadcast_id = %batch.broadcast_id, contacts = batch.contact_ids.len()))]
pub async fn send_broadcast_batch(rt: &Runtime, batch: &BroadcastBatch) -> Result<Vec<MsgID>> {
    let has_broadcast = !batch.broadcast_id.is_nil();
    if has_broadcast
        && broadcast::broadcast_status(&rt.db, batch.broadcast_id).await? == BroadcastStatus::Interrupted
    {
        info!("Broadcast was interrupted, skipping batch");
        return Ok(Vec::new());
    }

    let oa = rt.org_assets(batch.org_id).await?;
    let contacts = contact::load_contacts(&rt.readonly_db, batch.org_id, &batch.contact_ids).await?;

    let mut msgs = Vec::with_capacity(contacts.len());
    for c in &contacts {
        if let Some(m) = broadcast_msg(rt, &oa, batch, c).await? {
            msgs.push(m);
        }
    }

    msg::check_queueable(&msgs)?;

    let mut tx = rt.db.begin().await?;
    let mut rows: Vec<_> = msgs.iter_mut().map(|m| &mut m.msg).collect();
    msg::insert_messages(&mut tx, &mut rows).await?;
    tx.commit().await?;

    let refs: Vec<&OutgoingMsg> = msgs.iter().collect();
    let queued = courier::queue_messages(rt, &oa, &refs).await?;

    if batch.is_last && has_broadcast {
        broadcast::update_broadcast_status(&rt.db, batch.broadcast_id, BroadcastStatus::Completed).await?;
    }

    debug!(msgs = msgs.len(), queued = queued.len(), "Sent broadcast batch");
    Ok(queued)
}

/// Processes a queued broadcast: resolves its recipients and sends to them in batches.
#[instrument(skip(rt))]
pub async fn process_broadcast(rt: &Runtime, broadcast_id: BroadcastID) -> Result<()> {
    let b = broadcast::load_broadcast(&rt.db, broadcast_id).await?;
    if b.status == BroadcastStatus::Interrupted {
        info!("Broadcast was interrupted before it began");
        return Ok(());
    }

    let oa = rt.org_assets(b.org_id).await?;

    if let Err(e) = run_broadcast(rt, &oa, &b).await {
        broadcast::update_broadcast_status(&rt.db, broadcast_id, BroadcastStatus::Failed).await?;
        return Err(e.context(format!("processing broadcast {}", broadcast_id)));
    }
    Ok(())
}

async fn run_broadcast(rt: &Runtime, oa: &OrgAssets, b: &Broadcast) -> Result<()> {
    let contact_ids = audience::resolve_recipients(rt, oa, &Audience::from(b), b.created_by_id).await?;

    if !broadcast::mark_broadcast_started(&rt.db, b.id, contact_ids.len() as i32).await? {
        info!("Broadcast was interrupted while resolving its recipients");
        return Ok(());
    }
    if contact_ids.is_empty() {
        broadcast::update_broadcast_status(&rt.db, b.id, BroadcastStatus::Completed).await?;
        return Ok(());
    }

    let size = rt.config.start_batch_size.max(1);
    let num_batches = contact_ids.len().div_ceil(size);

    for (i, chunk) in contact_ids.chunks(size).enumerate() {
        if i > 0 && broadcast::broadcast_status(&rt.db, b.id).await? == BroadcastStatus::Interrupted {
            info!(batch = i, "Broadcast was interrupted, stopping");
            return Ok(());
        }

        let batch = b.create_batch(chunk.to_vec(), i == 0, i == num_batches - 1);
        send_broadcast_batch(rt, &batch).await?;
    }

    Ok(())
}
