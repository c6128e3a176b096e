// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Starting and resuming sessions.
//!
//! A sprint is written in one transaction: the hooks its events collected first, then the
//! session and its runs. Messages are only queued once that transaction has committed.

use tracing::{debug, instrument};

use super::store_output;
use crate::assets::OrgAssets;
use crate::engine::{Resume, Trigger, TriggerKind};
use crate::error::{CoreError, Result, ResultExt};
use crate::hooks::{self, Scene};
use crate::models::call;
use crate::models::contact::Contact;
use crate::models::flow::FlowType;
use crate::models::ids::{ContactID, StartID};
use crate::models::run;
use crate::models::session::{self, Session, SessionStatus};
use crate::runtime::Runtime;

/// Starts a session for each contact with the trigger at the same position, and writes them.
///
/// Contacts already waiting in a session have it interrupted unless the new session is a
/// background one. The caller must hold the contacts' locks.
#[instrument(skip_all, fields(org_id = %oa.org_id(), contacts = contacts.len(), start_id = %start_id))]
pub async fn start_sessions(
    rt: &Runtime,
    oa: &OrgAssets,
    contacts: Vec<Contact>,
    triggers: Vec<Trigger>,
    start_id: StartID,
) -> Result<Vec<Session>> {
    if contacts.len() != triggers.len() {
        return Err(CoreError::Invariant(format!(
            "{} contacts but {} triggers",
            contacts.len(),
            triggers.len()
        )));
    }
    if contacts.is_empty() {
        return Ok(Vec::new());
    }

    let mut scenes = Vec::with_capacity(contacts.len());
    for (contact, trigger) in contacts.into_iter().zip(triggers.iter()) {
        let contact_id = contact.id;
        let (es, sprint) = rt
            .engine
            .start_session(oa, &contact.to_engine(oa), trigger)
            .await
            .with_context(|| format!("starting session for contact {}", contact_id))?;

        let incoming = match &trigger.kind {
            TriggerKind::Msg { msg, .. } => Some(msg.clone()),
            _ => None,
        };

        let events = hooks::sprint_events(&es, &sprint);
        let mut scene = Scene::for_sprint(contact, es, sprint).with_incoming(incoming);
        hooks::process_events(rt, oa, &mut scene, &events)
            .await
            .with_context(|| format!("processing events for contact {}", contact_id))?;
        scenes.push(scene);
    }

    let mut tx = rt.db.begin().await?;

    let foreground: Vec<ContactID> = scenes
        .iter()
        .filter(|s| s.session.as_ref().is_some_and(|es| es.session_type != FlowType::Background))
        .map(|s| s.contact.id)
        .collect();
    session::interrupt_contacts_in_tx(&mut tx, &foreground, SessionStatus::Interrupted).await?;

    hooks::execute_pre_commit(&mut tx, rt, oa, &mut scenes).await?;

    let mut sessions = Vec::with_capacity(scenes.len());
    for (scene, trigger) in scenes.iter().zip(triggers.iter()) {
        let (Some(es), Some(sprint)) = (&scene.session, &scene.sprint) else {
            return Err(CoreError::Invariant(format!("scene for contact {} has no sprint", scene.contact.id)));
        };
        let mut session = Session::new(oa, es, sprint, trigger.call_uuid)?;
        store_output(rt, &mut session).await?;
        sessions.push(session);
    }

    let pairs: Vec<(Session, &crate::engine::EngineSession)> = sessions
        .iter()
        .cloned()
        .zip(scenes.iter().filter_map(|s| s.session.as_ref()))
        .collect();
    session::insert_sessions(&mut tx, oa, &pairs, &vec![start_id; pairs.len()]).await?;

    for s in sessions.iter().filter(|s| s.status == SessionStatus::Waiting) {
        if let Some(call_uuid) = s.call_uuid {
            call::attach_session(&mut tx, call_uuid, s.uuid).await?;
        }
    }

    tx.commit().await?;

    hooks::execute_post_commit(rt, oa, &scenes).await;

    debug!(sessions = sessions.len(), "Started sessions");
    Ok(sessions)
}

/// Resumes a contact's waiting session and writes the result. The caller must hold the
/// contact's lock.
#[instrument(skip_all, fields(org_id = %oa.org_id(), contact_id = %contact.id, session_uuid = %session.uuid))]
pub async fn resume_session(
    rt: &Runtime,
    oa: &OrgAssets,
    contact: Contact,
    mut session: Session,
    resume: Resume,
) -> Result<Session> {
    if session.status != SessionStatus::Waiting {
        return Err(CoreError::InvalidState {
            kind: "session",
            id: session.uuid.to_string(),
            expected: SessionStatus::Waiting.to_string(),
            actual: session.status.to_string(),
        });
    }

    let output = session
        .load_output(rt.store.as_ref(), &rt.config.sessions_bucket)
        .await?;
    let previous_runs = run::load_session_runs(&rt.db, session.uuid).await?;

    let (es, sprint) = rt
        .engine
        .resume_session(oa, &contact.to_engine(oa), &output, &resume)
        .await
        .with_context(|| format!("resuming session {}", session.uuid))?;

    let incoming = match &resume {
        Resume::Msg { msg } => Some(msg.clone()),
        _ => None,
    };

    let events = hooks::sprint_events(&es, &sprint);
    let mut scene = Scene::for_sprint(contact, es, sprint).with_incoming(incoming);
    hooks::process_events(rt, oa, &mut scene, &events).await?;

    let mut tx = rt.db.begin().await?;
    hooks::execute_pre_commit(&mut tx, rt, oa, std::slice::from_mut(&mut scene)).await?;

    let (Some(es), Some(sprint)) = (&scene.session, &scene.sprint) else {
        return Err(CoreError::Invariant("resumed scene has no sprint".to_string()));
    };
    session.apply(es, sprint)?;
    store_output(rt, &mut session).await?;
    session::update_session(&mut tx, oa, &session, es, &previous_runs).await?;

    tx.commit().await?;

    hooks::execute_post_commit(rt, oa, std::slice::from_ref(&scene)).await;

    debug!(status = %session.status, "Resumed session");
    Ok(session)
}
