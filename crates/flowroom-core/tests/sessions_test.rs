// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for starting, resuming and interrupting sessions.

#[macro_use]
mod common;

use chrono::{Duration, Utc};
use redis::AsyncCommands;
use uuid::Uuid;

use common::{TestContext, fail_node, send_msg_node, wait_node};
use flowroom_core::courier;
use flowroom_core::engine::{MsgIn, Resume, Trigger, TriggerKind};
use flowroom_core::models::call::{self, CallDirection, CallStatus};
use flowroom_core::models::contact::Contact;
use flowroom_core::models::contact_fire::{self, ContactFire, FireType};
use flowroom_core::models::ids::{ChannelID, FlowID, NIL_START_ID};
use flowroom_core::models::run::{self, RunStatus};
use flowroom_core::models::session::{self, SessionStatus};
use flowroom_core::runner;

/// Counts the session rows of a contact with a status.
async fn count_sessions(ctx: &TestContext, contact: &Contact, status: &str) -> i64 {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM flow_sessions WHERE contact_id = $1 AND status = $2")
            .bind(contact.id)
            .bind(status)
            .fetch_one(&ctx.rt.db)
            .await
            .unwrap();
    count
}

#[tokio::test]
async fn test_failed_start_ends_session() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    ctx.create_flow("Broken", "M", vec![fail_node("no such webhook")]).await;
    let ann = ctx.create_contact("Ann", &["tel:+16055741111"]).await;

    let oa = ctx.assets().await;
    let flow = oa.flows().iter().find(|f| f.name == "Broken").unwrap().clone();
    let trigger = Trigger::new(flow.reference(), TriggerKind::Manual { user: None });

    let sessions = runner::start_sessions(&ctx.rt, &oa, vec![ann.clone()], vec![trigger], NIL_START_ID)
        .await
        .expect("Failed to start sessions");

    assert_eq!(sessions.len(), 1);
    let s = &sessions[0];
    assert_eq!(s.status, SessionStatus::Failed);

    let stored = session::load_session(&ctx.rt.db, s.uuid).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Failed);
    assert!(stored.ended_on.is_some());

    let ann = ctx.load_contact(&ann).await;
    assert_eq!(ann.current_session_uuid, None);
    assert_eq!(ann.current_flow_id, FlowID(0));

    let runs = run::load_session_runs(&ctx.rt.db, s.uuid).await.unwrap();
    assert!(!runs.is_empty());
    assert!(
        runs.iter()
            .any(|r| r.status == RunStatus::Failed && r.exited_on.is_some())
    );

    // nothing was sent
    let mut conn = ctx.rt.redis.get_multiplexed_async_connection().await.unwrap();
    let queued: i64 = conn
        .zcard(courier::queue_key(ctx.channel.uuid, 10, false))
        .await
        .unwrap();
    assert_eq!(queued, 0);
}

#[tokio::test]
async fn test_start_and_resume_waiting_session() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    ctx.create_flow(
        "Favorites",
        "M",
        vec![send_msg_node("What is your favorite color?"), wait_node(), send_msg_node("Thanks!")],
    )
    .await;
    let ann = ctx.create_contact("Ann", &["tel:+16055741111"]).await;

    let oa = ctx.assets().await;
    let flow = oa.flows().iter().find(|f| f.name == "Favorites").unwrap().clone();
    let trigger = Trigger::new(flow.reference(), TriggerKind::Manual { user: None });

    let sessions = runner::start_sessions(&ctx.rt, &oa, vec![ann.clone()], vec![trigger], NIL_START_ID)
        .await
        .expect("Failed to start sessions");
    let started = sessions.into_iter().next().unwrap();
    assert_eq!(started.status, SessionStatus::Waiting);

    let ann = ctx.load_contact(&ann).await;
    assert_eq!(ann.current_session_uuid, Some(started.uuid));
    assert_eq!(ann.current_flow_id, flow.id);
    assert_eq!(count_sessions(&ctx, &ann, "W").await, 1);

    let msg = MsgIn {
        uuid: Uuid::new_v4(),
        id: Default::default(),
        urn: "tel:+16055741111".to_string(),
        channel: None,
        text: "blue".to_string(),
        attachments: Vec::new(),
        external_id: None,
    };
    let resumed = runner::resume_session(&ctx.rt, &oa, ann.clone(), started, Resume::Msg { msg })
        .await
        .expect("Failed to resume session");
    assert_eq!(resumed.status, SessionStatus::Completed);

    let ann = ctx.load_contact(&ann).await;
    assert_eq!(ann.current_session_uuid, None);
    assert_eq!(count_sessions(&ctx, &ann, "W").await, 0);
    assert_eq!(count_sessions(&ctx, &ann, "C").await, 1);

    let (outgoing,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM msgs WHERE contact_id = $1 AND direction = 'O'")
            .bind(ann.id)
            .fetch_one(&ctx.rt.db)
            .await
            .unwrap();
    assert_eq!(outgoing, 2);
}

#[tokio::test]
async fn test_starting_interrupts_waiting_session() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    ctx.create_flow("Survey", "M", vec![wait_node()]).await;
    let ann = ctx.create_contact("Ann", &["tel:+16055741111"]).await;

    let oa = ctx.assets().await;
    let flow = oa.flows().iter().find(|f| f.name == "Survey").unwrap().clone();
    let trigger = Trigger::new(flow.reference(), TriggerKind::Manual { user: None });

    let first = runner::start_sessions(&ctx.rt, &oa, vec![ann.clone()], vec![trigger.clone()], NIL_START_ID)
        .await
        .unwrap();
    let ann = ctx.load_contact(&ann).await;
    let second = runner::start_sessions(&ctx.rt, &oa, vec![ann.clone()], vec![trigger], NIL_START_ID)
        .await
        .unwrap();

    let first = session::load_session(&ctx.rt.db, first[0].uuid).await.unwrap().unwrap();
    assert_eq!(first.status, SessionStatus::Interrupted);
    assert!(first.ended_on.is_some());

    let ann = ctx.load_contact(&ann).await;
    assert_eq!(ann.current_session_uuid, Some(second[0].uuid));
    assert_eq!(count_sessions(&ctx, &ann, "W").await, 1);
}

#[tokio::test]
async fn test_sprint_keeps_due_campaign_fires() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let (flow_id, _) = ctx.create_flow("Survey", "M", vec![wait_node()]).await;
    let joined = ctx.create_field("joined", "Joined", "D").await;
    let (group_id, _) = ctx.create_group("Members", None).await;
    let point_id = ctx.create_campaign_point(group_id, joined, flow_id, 1, "R").await;

    let ann = ctx.create_contact("Ann", &["tel:+16055741111"]).await;
    ctx.add_to_group(group_id, &[&ann]).await;
    let ann = ctx.load_contact(&ann).await;

    // due but not yet picked up by the fire scheduler
    let mut conn = ctx.rt.db.acquire().await.unwrap();
    contact_fire::insert_contact_fires(
        &mut conn,
        &[ContactFire::for_campaign(ctx.org_id, ann.id, point_id, 1, Utc::now() - Duration::seconds(3))],
    )
    .await
    .unwrap();
    drop(conn);

    let oa = ctx.assets().await;
    let flow = oa.flows().iter().find(|f| f.name == "Survey").unwrap().clone();
    let trigger = Trigger::new(flow.reference(), TriggerKind::Manual { user: None });

    let sessions = runner::start_sessions(&ctx.rt, &oa, vec![ann.clone()], vec![trigger], NIL_START_ID)
        .await
        .expect("Failed to start sessions");
    assert_eq!(sessions[0].status, SessionStatus::Waiting);

    let (scope,): (String,) =
        sqlx::query_as("SELECT scope FROM contact_fires WHERE contact_id = $1 AND fire_type = 'C'")
            .bind(ann.id)
            .fetch_one(&ctx.rt.db)
            .await
            .expect("Due campaign fire was deleted");
    assert_eq!(scope, format!("{}:1", point_id));

    // the contact was still touched
    let reloaded = ctx.load_contact(&ann).await;
    assert!(reloaded.modified_on > ann.modified_on);
}

/// Inserts a waiting voice session on a call, with a wait expiration fire.
async fn insert_call_session(ctx: &TestContext, contact: &Contact, channel_id: ChannelID) -> Uuid {
    let call = call::insert_call(
        &ctx.rt.db,
        ctx.org_id,
        channel_id,
        contact.id,
        contact.urns[0].id,
        CallDirection::Outgoing,
        CallStatus::InProgress,
        "",
    )
    .await
    .unwrap();

    let session_uuid = Uuid::new_v4();
    let sprint_uuid = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO flow_sessions (uuid, org_id, contact_id, contact_uuid, session_type, status, last_sprint_uuid, call_uuid, output)
        VALUES ($1, $2, $3, $4, 'V', 'W', $5, $6, '{}')
        "#,
    )
    .bind(session_uuid)
    .bind(ctx.org_id)
    .bind(contact.id)
    .bind(contact.uuid)
    .bind(sprint_uuid)
    .bind(call.uuid)
    .execute(&ctx.rt.db)
    .await
    .unwrap();

    sqlx::query("UPDATE calls SET session_uuid = $2 WHERE uuid = $1")
        .bind(call.uuid)
        .bind(session_uuid)
        .execute(&ctx.rt.db)
        .await
        .unwrap();
    sqlx::query("UPDATE contacts SET current_session_uuid = $2 WHERE id = $1")
        .bind(contact.id)
        .bind(session_uuid)
        .execute(&ctx.rt.db)
        .await
        .unwrap();

    let mut conn = ctx.rt.db.acquire().await.unwrap();
    contact_fire::insert_contact_fires(
        &mut conn,
        &[ContactFire::for_session(
            ctx.org_id,
            contact.id,
            FireType::WaitExpiration,
            session_uuid,
            sprint_uuid,
            Utc::now() + Duration::hours(1),
        )],
    )
    .await
    .unwrap();

    session_uuid
}

async fn count_fires(ctx: &TestContext, contact: &Contact) -> i64 {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM contact_fires WHERE contact_id = $1")
        .bind(contact.id)
        .fetch_one(&ctx.rt.db)
        .await
        .unwrap();
    count
}

#[tokio::test]
async fn test_interrupt_sessions_for_channel() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let other = ctx.create_channel("Twilio", &["tel"]).await;
    let ann = ctx.create_contact("Ann", &["tel:+16055741111"]).await;
    let bob = ctx.create_contact("Bob", &["tel:+16055742222"]).await;
    let cat = ctx.create_contact("Cat", &["tel:+16055743333"]).await;

    let s1 = insert_call_session(&ctx, &ann, ctx.channel.id).await;
    let s2 = insert_call_session(&ctx, &bob, ctx.channel.id).await;
    let s3 = insert_call_session(&ctx, &cat, other.id).await;

    let count = session::interrupt_sessions_for_channel(&ctx.rt.db, ctx.channel.id)
        .await
        .expect("Failed to interrupt sessions");
    assert_eq!(count, 2);

    for uuid in [s1, s2] {
        let s = session::load_session(&ctx.rt.db, uuid).await.unwrap().unwrap();
        assert_eq!(s.status, SessionStatus::Interrupted);
        assert!(s.ended_on.is_some());
    }
    let s = session::load_session(&ctx.rt.db, s3).await.unwrap().unwrap();
    assert_eq!(s.status, SessionStatus::Waiting);
    assert!(s.ended_on.is_none());

    for c in [&ann, &bob] {
        let c = ctx.load_contact(c).await;
        assert_eq!(c.current_session_uuid, None);
        assert_eq!(c.current_flow_id, FlowID(0));
        assert_eq!(count_fires(&ctx, &c).await, 0);
    }
    assert_eq!(ctx.load_contact(&cat).await.current_session_uuid, Some(s3));
    assert_eq!(count_fires(&ctx, &cat).await, 1);
}

#[tokio::test]
async fn test_interrupt_contacts_twice() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let ann = ctx.create_contact("Ann", &["tel:+16055741111"]).await;
    let s1 = insert_call_session(&ctx, &ann, ctx.channel.id).await;

    let first = session::interrupt_contacts(&ctx.rt.db, &[ann.id], SessionStatus::Interrupted)
        .await
        .unwrap();
    let after_first = session::load_session(&ctx.rt.db, s1).await.unwrap().unwrap();

    let second = session::interrupt_contacts(&ctx.rt.db, &[ann.id], SessionStatus::Interrupted)
        .await
        .unwrap();
    let after_second = session::load_session(&ctx.rt.db, s1).await.unwrap().unwrap();

    assert_eq!(first, 1);
    assert_eq!(second, 0);
    assert_eq!(after_first, after_second);
    assert_eq!(after_second.status, SessionStatus::Interrupted);
}
