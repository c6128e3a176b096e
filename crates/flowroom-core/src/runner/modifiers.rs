// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Changing contacts outside of flows.

use std::collections::BTreeMap;

use tracing::{debug, instrument};

use super::with_contact_locks;
use crate::assets::OrgAssets;
use crate::engine::{Event, Modifier};
use crate::error::{Result, ResultExt};
use crate::hooks::{self, Scene};
use crate::models::contact;
use crate::models::ids::{ContactID, UserID};
use crate::runtime::Runtime;

/// Applies modifiers to contacts on behalf of a user.
///
/// The events the engine produces for each contact go through the same hooks as a sprint's,
/// and are written in a single transaction. Returns the events by contact along with the
/// contacts that were skipped because they couldn't be locked.
#[instrument(skip_all, fields(org_id = %oa.org_id(), user_id = %user_id, contacts = modifiers.len()))]
pub async fn apply_modifiers(
    rt: &Runtime,
    oa: &OrgAssets,
    user_id: UserID,
    modifiers: &BTreeMap<ContactID, Vec<Modifier>>,
) -> Result<(BTreeMap<ContactID, Vec<Event>>, Vec<ContactID>)> {
    let contact_ids: Vec<ContactID> = modifiers.keys().copied().collect();

    with_contact_locks(rt, oa.org_id(), &contact_ids, |locked| async move {
        let contacts = contact::load_contacts(&rt.db, oa.org_id(), &locked).await?;

        let mut events_by_contact = BTreeMap::new();
        let mut scenes = Vec::with_capacity(contacts.len());

        for c in contacts {
            let mods = modifiers.get(&c.id).map(Vec::as_slice).unwrap_or_default();
            let contact_id = c.id;

            let events = rt
                .engine
                .apply_modifiers(oa, &c.to_engine(oa), mods)
                .await
                .with_context(|| format!("applying modifiers to contact {}", contact_id))?;

            let mut scene = Scene::for_contact(c, user_id);
            hooks::process_events(rt, oa, &mut scene, &events).await?;

            events_by_contact.insert(contact_id, events);
            scenes.push(scene);
        }

        let mut tx = rt.db.begin().await?;
        hooks::execute_pre_commit(&mut tx, rt, oa, &mut scenes).await?;
        tx.commit().await?;

        hooks::execute_post_commit(rt, oa, &scenes).await;

        debug!(modified = scenes.len(), "Applied modifiers");
        Ok(events_by_contact)
    })
    .await
}
