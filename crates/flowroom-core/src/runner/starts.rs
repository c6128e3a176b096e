// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow starts: resolving who to start and starting them batch by batch.

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::{sprints, with_contact_locks};
use crate::assets::OrgAssets;
use crate::audience::{self, Audience};
use crate::engine::{Trigger, TriggerKind};
use crate::error::Result;
use crate::models::contact;
use crate::models::flow::{Flow, FlowType};
use crate::models::flow_start::{self, FlowStart, FlowStartBatch, StartStatus};
use crate::models::ids::StartID;
use crate::models::session::Session;
use crate::runtime::Runtime;

/// The trigger every contact of a batch is started with.
fn batch_trigger(oa: &OrgAssets, batch: &FlowStartBatch, flow: &Flow) -> Trigger {
    let kind = match &batch.parent_summary {
        Some(summary) => TriggerKind::FlowAction {
            run_summary: summary.clone(),
            history: batch.session_history.clone().unwrap_or(Value::Null),
        },
        None => TriggerKind::Manual {
            user: oa.user_by_id(batch.created_by_id).map(|u| u.reference()),
        },
    };

    Trigger::new(flow.reference(), kind).with_params(batch.params.clone())
}

/// Starts one batch of a flow start.
///
/// When the batch doesn't interrupt, contacts already waiting in a session are left out.
/// The last batch of a start marks it completed.
#[instrument(skip_all, fields(org_id = %batch.org_id, start_id = %batch.start_id, contacts = batch.contact_ids.len()))]
pub async fn start_flow_batch(rt: &Runtime, batch: &FlowStartBatch) -> Result<Vec<Session>> {
    if !batch.start_id.is_nil()
        && flow_start::start_status(&rt.db, batch.start_id).await? == StartStatus::Interrupted
    {
        info!("Flow start was interrupted, skipping batch");
        return Ok(Vec::new());
    }

    let oa = rt.org_assets(batch.org_id).await?;
    let oa = oa.as_ref();
    let flow = oa.load_flow_by_id(&rt.db, batch.flow_id).await?;
    if !flow.is_active {
        warn!(flow_id = %flow.id, "Flow is no longer active, skipping batch");
        return Ok(Vec::new());
    }

    let trigger = batch_trigger(oa, batch, &flow);
    let skip_waiting = !batch.interrupt && flow.flow_type != FlowType::Background;

    let (sessions, _) = with_contact_locks(rt, batch.org_id, &batch.contact_ids, |locked| async move {
        let mut contacts = contact::load_contacts(&rt.db, batch.org_id, &locked).await?;
        if skip_waiting {
            contacts.retain(|c| c.current_session_uuid.is_none());
        }

        let triggers = vec![trigger; contacts.len()];
        sprints::start_sessions(rt, oa, contacts, triggers, batch.start_id).await
    })
    .await?;

    if batch.is_last && !batch.start_id.is_nil() {
        flow_start::update_start_status(&rt.db, batch.start_id, StartStatus::Completed).await?;
    }

    debug!(sessions = sessions.len(), "Started flow batch");
    Ok(sessions)
}

/// Processes a queued flow start: resolves its audience and starts it in batches.
///
/// A start that fails is marked failed with how many contacts it got to. A start interrupted
/// while running stops before its next batch.
#[instrument(skip(rt))]
pub async fn process_flow_start(rt: &Runtime, start_id: StartID) -> Result<()> {
    let start = flow_start::load_flow_start(&rt.db, start_id).await?;
    if start.status == StartStatus::Interrupted {
        info!("Flow start was interrupted before it began");
        return Ok(());
    }

    let oa = rt.org_assets(start.org_id).await?;
    let mut started = 0;

    match run_start(rt, &oa, &start, &mut started).await {
        Ok(()) => {
            info!(started, "Processed flow start");
            Ok(())
        }
        Err(e) => {
            flow_start::mark_start_failed(&rt.db, start_id, started as i32).await?;
            Err(e.context(format!("processing flow start {}", start_id)))
        }
    }
}

async fn run_start(rt: &Runtime, oa: &OrgAssets, start: &FlowStart, started: &mut usize) -> Result<()> {
    let audience = Audience::from(start);
    let contact_ids = audience::resolve_recipients(rt, oa, &audience, start.created_by_id).await?;

    if !flow_start::mark_start_started(&rt.db, start.id, contact_ids.len() as i32).await? {
        info!("Flow start was interrupted while resolving its audience");
        return Ok(());
    }
    if contact_ids.is_empty() {
        flow_start::update_start_status(&rt.db, start.id, StartStatus::Completed).await?;
        return Ok(());
    }

    let size = rt.config.start_batch_size.max(1);
    let num_batches = contact_ids.len().div_ceil(size);

    for (i, chunk) in contact_ids.chunks(size).enumerate() {
        if i > 0 && flow_start::start_status(&rt.db, start.id).await? == StartStatus::Interrupted {
            info!(batch = i, "Flow start was interrupted, stopping");
            return Ok(());
        }

        let batch = start.create_batch(chunk.to_vec(), i == 0, i == num_batches - 1);
        *started += start_flow_batch(rt, &batch).await?.len();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::flow_start::StartType;
    use crate::models::ids::{ContactID, FlowID, OrgID, UserID};
    use serde_json::json;
    use sqlx::types::Json;
    use uuid::Uuid;

    fn flow() -> Flow {
        Flow {
            id: FlowID(4),
            uuid: Uuid::new_v4(),
            name: "Registration".to_string(),
            flow_type: FlowType::Messaging,
            definition: Json(json!({"nodes": []})),
            expires_after_minutes: 60,
            ivr_retry_minutes: None,
            ignore_triggers: false,
            is_active: true,
        }
    }

    #[test]
    fn test_batch_trigger() {
        let oa = OrgAssets::for_tests();
        let flow = flow();

        let start = FlowStart::new(OrgID(1), StartType::Manual, flow.id)
            .with_params(Some(json!({"source": "api"})))
            .with_created_by(UserID(0));
        let batch = start.create_batch(vec![ContactID(1)], true, true);

        let trigger = batch_trigger(&oa, &batch, &flow);
        assert_eq!(trigger.flow.uuid, flow.uuid);
        assert_eq!(trigger.kind, TriggerKind::Manual { user: None });
        assert_eq!(trigger.params, Some(json!({"source": "api"})));

        let start = FlowStart::new(OrgID(1), StartType::FlowAction, flow.id)
            .with_parent(json!({"uuid": "parent"}), json!({"parent_uuid": "p"}));
        let batch = start.create_batch(vec![ContactID(1)], true, true);

        let trigger = batch_trigger(&oa, &batch, &flow);
        assert_eq!(
            trigger.kind,
            TriggerKind::FlowAction {
                run_summary: json!({"uuid": "parent"}),
                history: json!({"parent_uuid": "p"}),
            }
        );
    }
}
