// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Contact fire scheduler.
//!
//! Periodically claims contact fires that have come due and acts on them: campaign points
//! start their flow or send their message, wait expirations and timeouts resume or end the
//! session they belong to.
//!
//! Fires are deleted as they're claimed. A fire whose contact is busy is put back to be
//! claimed again on the next poll, and one that failed is put back a minute out.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};

use crate::assets::{OrgAssets, Refresh};
use crate::engine::{Resume, Trigger, TriggerKind};
use crate::error::Result;
use crate::models::broadcast::BroadcastBatch;
use crate::models::campaign::{CampaignPoint, PointStatus, PointType, StartMode};
use crate::models::contact::{self, Contact};
use crate::models::contact_fire::{self, ContactFire, FireType};
use crate::models::flow::FlowType;
use crate::models::ids::{NIL_BROADCAST_ID, NIL_START_ID};
use crate::models::session::{self, Session, SessionStatus};
use crate::runner::{self, with_contact_locks};
use crate::runtime::Runtime;

/// Fire scheduler configuration.
#[derive(Debug, Clone)]
pub struct FireSchedulerConfig {
    /// How often to poll for due fires
    pub poll_interval: Duration,
    /// Maximum fires claimed per poll
    pub batch_size: i64,
}

impl Default for FireSchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_size: 500,
        }
    }
}

/// How far out a fire that failed to dispatch is put back, in seconds.
const RETRY_DELAY_SECS: i64 = 60;

/// What became of a fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatched {
    /// Acted on.
    Fired,
    /// No longer relevant, dropped without side effects.
    Stale,
    /// The contact was locked by someone else.
    Busy,
}

/// Whether a campaign point is still the version a fire was scheduled for, and ready to fire.
fn point_is_current(point: &CampaignPoint, fire_version: i32) -> bool {
    point.status == PointStatus::Ready && point.fire_version == fire_version
}

/// A fire that failed to dispatch, pushed back so it's retried on a later poll.
fn retry_later(fire: &ContactFire, now: DateTime<Utc>) -> ContactFire {
    ContactFire {
        fire_on: now + chrono::Duration::seconds(RETRY_DELAY_SECS),
        ..fire.clone()
    }
}

/// Whether a wait fire still belongs to the contact's current wait.
fn is_current_wait(fire: &ContactFire, contact: &Contact, session: &Session) -> bool {
    session.status == SessionStatus::Waiting
        && fire.session_uuid == Some(session.uuid)
        && contact.current_session_uuid == Some(session.uuid)
        && fire.sprint_uuid == session.last_sprint_uuid
}

/// Contact fire scheduler that runs as a background task.
pub struct FireScheduler {
    rt: Runtime,
    config: FireSchedulerConfig,
    shutdown: Arc<Notify>,
}

impl FireScheduler {
    pub fn new(rt: Runtime, config: FireSchedulerConfig) -> Self {
        Self {
            rt,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the scheduler loop.
    pub async fn run(self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Fire scheduler started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Fire scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.process_due_fires().await {
                        error!(error = %e, "Failed to process due fires");
                    }
                }
            }
        }
    }

    /// Claims and dispatches one batch of due fires. Returns how many were claimed.
    pub async fn process_due_fires(&self) -> Result<usize> {
        let fires = {
            let mut tx = self.rt.db.begin().await?;
            let fires = contact_fire::load_due_fires(&mut tx, self.config.batch_size).await?;
            let ids: Vec<_> = fires.iter().map(|f| f.id).collect();
            contact_fire::delete_fires(&mut tx, &ids).await?;
            tx.commit().await?;
            fires
        };

        if fires.is_empty() {
            debug!("No contact fires due");
            return Ok(0);
        }

        let mut requeue = Vec::new();
        let (mut fired, mut stale, mut busy, mut failed) = (0, 0, 0, 0);

        for fire in &fires {
            match dispatch_fire(&self.rt, fire).await {
                Ok(Dispatched::Fired) => fired += 1,
                Ok(Dispatched::Stale) => stale += 1,
                Ok(Dispatched::Busy) => {
                    busy += 1;
                    requeue.push(fire.clone());
                }
                Err(e) => {
                    error!(
                        fire_id = %fire.id,
                        contact_id = %fire.contact_id,
                        fire_type = %fire.fire_type,
                        error = %e,
                        "Failed to dispatch contact fire"
                    );
                    failed += 1;
                    requeue.push(retry_later(fire, Utc::now()));
                }
            }
        }

        if !requeue.is_empty() {
            let mut conn = self.rt.db.acquire().await?;
            contact_fire::insert_contact_fires(&mut conn, &requeue).await?;
        }

        info!(claimed = fires.len(), fired, stale, busy, failed, "Processed contact fires");
        Ok(fires.len())
    }
}

/// Acts on a single fire.
#[instrument(skip_all, fields(org_id = %fire.org_id, contact_id = %fire.contact_id, fire_type = %fire.fire_type))]
async fn dispatch_fire(rt: &Runtime, fire: &ContactFire) -> Result<Dispatched> {
    let oa = rt.org_assets(fire.org_id).await?;

    match fire.fire_type {
        FireType::Campaign => {
            // a snapshot from before the point was readied or edited would drop the fire
            let oa = match fire.campaign_point() {
                Some((point_id, version))
                    if !oa
                        .campaign_point(point_id)
                        .is_some_and(|(_, p)| point_is_current(p, version)) =>
                {
                    rt.refreshed_org_assets(fire.org_id, Refresh::CAMPAIGNS).await?
                }
                _ => oa,
            };
            fire_campaign_point(rt, &oa, fire).await
        }
        FireType::WaitExpiration | FireType::WaitTimeout => fire_wait(rt, &oa, fire).await,
    }
}

async fn fire_campaign_point(rt: &Runtime, oa: &OrgAssets, fire: &ContactFire) -> Result<Dispatched> {
    let Some((point_id, fire_version)) = fire.campaign_point() else {
        warn!(scope = %fire.scope, "Campaign fire has an unparseable scope");
        return Ok(Dispatched::Stale);
    };
    let Some((_, point)) = oa.campaign_point(point_id) else {
        debug!(point_id = %point_id, "Campaign point no longer exists");
        return Ok(Dispatched::Stale);
    };
    if !point_is_current(point, fire_version) {
        debug!(point_id = %point_id, fire_version, "Campaign fire is for an old point version");
        return Ok(Dispatched::Stale);
    }

    match point.point_type {
        PointType::Message => {
            let Some(translations) = point.translations.clone() else {
                warn!(point_id = %point_id, "Message point has no translations");
                return Ok(Dispatched::Stale);
            };
            let batch = BroadcastBatch {
                broadcast_id: NIL_BROADCAST_ID,
                org_id: fire.org_id,
                translations,
                base_language: point.base_language.clone().unwrap_or_default(),
                optin_id: Default::default(),
                template_id: Default::default(),
                template_variables: Vec::new(),
                created_by_id: Default::default(),
                contact_ids: vec![fire.contact_id],
                is_first: true,
                is_last: true,
            };
            runner::send_broadcast_batch(rt, &batch).await?;
            Ok(Dispatched::Fired)
        }
        PointType::Flow => {
            let flow = oa.load_flow_by_id(&rt.db, point.flow_id).await?;
            if !flow.is_active {
                return Ok(Dispatched::Stale);
            }
            let trigger = Trigger::new(flow.reference(), TriggerKind::Campaign { point_uuid: point.uuid });
            // a passive point only starts background flows over a contact's waiting session
            let skip_waiting = point.start_mode == StartMode::Skip
                || (point.start_mode == StartMode::Background && flow.flow_type != FlowType::Background);

            let (fired, skipped) = with_contact_locks(rt, fire.org_id, &[fire.contact_id], |locked| async move {
                let mut contacts = contact::load_contacts(&rt.db, fire.org_id, &locked).await?;
                if skip_waiting {
                    contacts.retain(|c| c.current_session_uuid.is_none());
                }
                let triggers = vec![trigger; contacts.len()];
                let sessions = runner::start_sessions(rt, oa, contacts, triggers, NIL_START_ID).await?;
                Ok(!sessions.is_empty())
            })
            .await?;

            Ok(match (fired, skipped.is_empty()) {
                (_, false) => Dispatched::Busy,
                (true, _) => Dispatched::Fired,
                (false, _) => Dispatched::Stale,
            })
        }
    }
}

async fn fire_wait(rt: &Runtime, oa: &OrgAssets, fire: &ContactFire) -> Result<Dispatched> {
    let Some(session_uuid) = fire.session_uuid else {
        return Ok(Dispatched::Stale);
    };

    let (dispatched, skipped) = with_contact_locks(rt, fire.org_id, &[fire.contact_id], |locked| async move {
        if locked.is_empty() {
            return Ok(Dispatched::Busy);
        }

        let Some(contact) = contact::load_contacts(&rt.db, fire.org_id, &locked).await?.pop() else {
            return Ok(Dispatched::Stale);
        };
        let Some(session) = session::load_session(&rt.db, session_uuid).await? else {
            return Ok(Dispatched::Stale);
        };
        if !is_current_wait(fire, &contact, &session) {
            return Ok(Dispatched::Stale);
        }

        if fire.fire_type == FireType::WaitTimeout {
            runner::resume_session(rt, oa, contact, session, Resume::WaitTimeout).await?;
            return Ok(Dispatched::Fired);
        }

        let output = session
            .load_output(rt.store.as_ref(), &rt.config.sessions_bucket)
            .await?;
        let es = rt.engine.read_session(oa, &output).await?;

        if es.resume_on_expire() {
            runner::resume_session(rt, oa, contact, session, Resume::WaitExpiration).await?;
        } else {
            session::interrupt_contacts(&rt.db, &[contact.id], SessionStatus::Expired).await?;
        }
        Ok(Dispatched::Fired)
    })
    .await?;

    if !skipped.is_empty() {
        return Ok(Dispatched::Busy);
    }
    Ok(dispatched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::campaign::{OffsetUnit, RelativeTo};
    use crate::models::ids::{CampaignID, ContactID, FieldID, FireID, FlowID, OrgID, PointID};
    use chrono::Utc;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn point(status: PointStatus, fire_version: i32) -> CampaignPoint {
        CampaignPoint {
            id: PointID(7),
            uuid: Uuid::new_v4(),
            campaign_id: CampaignID(1),
            point_type: PointType::Flow,
            status,
            fire_version,
            start_mode: StartMode::Interrupt,
            relative_to: RelativeTo {
                id: FieldID(1),
                key: "joined".to_string(),
            },
            offset: 2,
            unit: OffsetUnit::Days,
            delivery_hour: -1,
            flow_id: FlowID(3),
            translations: None,
            base_language: None,
        }
    }

    #[test]
    fn test_point_is_current() {
        assert!(point_is_current(&point(PointStatus::Ready, 2), 2));
        assert!(!point_is_current(&point(PointStatus::Ready, 3), 2));
        assert!(!point_is_current(&point(PointStatus::Scheduling, 2), 2));
    }

    #[test]
    fn test_is_current_wait() {
        let session_uuid = Uuid::new_v4();
        let sprint_uuid = Uuid::new_v4();
        let now = Utc::now();

        let session = Session {
            uuid: session_uuid,
            org_id: OrgID(1),
            contact_id: ContactID(5),
            contact_uuid: Uuid::new_v4(),
            session_type: FlowType::Messaging,
            status: SessionStatus::Waiting,
            last_sprint_uuid: Some(sprint_uuid),
            current_flow_uuid: Some(Uuid::new_v4()),
            call_uuid: None,
            output: Some("{}".to_string()),
            output_url: None,
            created_on: now,
            ended_on: None,
        };
        let contact = Contact {
            id: ContactID(5),
            uuid: session.contact_uuid,
            org_id: OrgID(1),
            name: None,
            language: None,
            status: contact::ContactStatus::Active,
            fields: HashMap::new(),
            urns: Vec::new(),
            group_ids: Vec::new(),
            tickets: Vec::new(),
            created_on: now,
            modified_on: now,
            last_seen_on: None,
            current_session_uuid: Some(session_uuid),
            current_flow_id: FlowID(3),
        };
        let mut fire = ContactFire::for_session(
            OrgID(1),
            ContactID(5),
            FireType::WaitExpiration,
            session_uuid,
            sprint_uuid,
            now,
        );
        fire.id = FireID(1);

        assert!(is_current_wait(&fire, &contact, &session));

        // the session has moved on to a later sprint
        let mut later = session.clone();
        later.last_sprint_uuid = Some(Uuid::new_v4());
        assert!(!is_current_wait(&fire, &contact, &later));

        // the contact has since started another session
        let mut moved = contact.clone();
        moved.current_session_uuid = Some(Uuid::new_v4());
        assert!(!is_current_wait(&fire, &moved, &session));

        let mut ended = session.clone();
        ended.status = SessionStatus::Completed;
        assert!(!is_current_wait(&fire, &contact, &ended));
    }

    #[test]
    fn test_retry_later() {
        let now = Utc::now();
        let fire = ContactFire::for_campaign(OrgID(1), ContactID(5), PointID(7), 2, now - chrono::Duration::hours(1));

        let retry = retry_later(&fire, now);
        assert_eq!(retry.fire_on, now + chrono::Duration::seconds(60));
        assert_eq!(retry.scope, "7:2");
        assert_eq!(retry.contact_id, fire.contact_id);
        assert_eq!(retry.fire_type, FireType::Campaign);
    }
}
