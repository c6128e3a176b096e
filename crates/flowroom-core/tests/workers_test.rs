// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the background workers.

#[macro_use]
mod common;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use common::{TestContext, send_msg_node};
use flowroom_core::audience::{self, Audience};
use flowroom_core::engine::{Trigger, TriggerKind};
use flowroom_core::models::contact::Contact;
use flowroom_core::models::contact_fire::{self, ContactFire};
use flowroom_core::models::flow_start::{self, Exclusions, FlowStart, StartStatus, StartType};
use flowroom_core::models::ids::{FlowID, NIL_START_ID, PointID};
use flowroom_core::runner;
use flowroom_core::workers::{
    FireScheduler, FireSchedulerConfig, MessageRetrierConfig, PointScheduler, PointSchedulerConfig, QueueConfig,
    StartProcessor, WebhookHealthConfig,
};

#[test]
fn test_worker_config_defaults() {
    let fires = FireSchedulerConfig::default();
    assert_eq!(fires.poll_interval, Duration::from_secs(10));
    assert_eq!(fires.batch_size, 500);

    let retries = MessageRetrierConfig::default();
    assert_eq!(retries.poll_interval, Duration::from_secs(60));
    assert_eq!(retries.batch_size, 1000);

    let queues = QueueConfig::default();
    assert_eq!(queues.poll_interval, Duration::from_secs(5));
    assert_eq!(queues.batch_size, 10);

    assert_eq!(WebhookHealthConfig::default().poll_interval, Duration::from_secs(60));

    let points = PointSchedulerConfig::default();
    assert_eq!(points.poll_interval, Duration::from_secs(15));
    assert_eq!(points.batch_size, 10);
}

#[tokio::test]
async fn test_stale_campaign_fire_is_deleted() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let ann = ctx.create_contact("Ann", &["tel:+16055741111"]).await;

    // a fire for a point that doesn't exist
    let mut conn = ctx.rt.db.acquire().await.unwrap();
    contact_fire::insert_contact_fires(
        &mut conn,
        &[ContactFire::for_campaign(
            ctx.org_id,
            ann.id,
            PointID(i64::MAX),
            1,
            Utc::now() - chrono::Duration::minutes(5),
        )],
    )
    .await
    .unwrap();
    drop(conn);

    let scheduler = FireScheduler::new(ctx.rt.clone(), FireSchedulerConfig::default());
    let claimed = scheduler
        .process_due_fires()
        .await
        .expect("Failed to process due fires");
    assert!(claimed >= 1);

    let (remaining,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM contact_fires WHERE contact_id = $1")
        .bind(ann.id)
        .fetch_one(&ctx.rt.db)
        .await
        .unwrap();
    assert_eq!(remaining, 0);
}

#[tokio::test]
async fn test_process_flow_start() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let (flow_id, _) = ctx.create_flow("Greeting", "M", vec![send_msg_node("Hi there")]).await;
    let ann = ctx.create_contact("Ann", &["tel:+16055741111"]).await;
    let bob = ctx.create_contact("Bob", &["tel:+16055742222"]).await;

    let mut starts = [FlowStart::new(ctx.org_id, StartType::Manual, flow_id)
        .with_contact_ids(&[ann.id, bob.id])
        .with_created_by(ctx.user_id)];
    let mut conn = ctx.rt.db.acquire().await.unwrap();
    flow_start::insert_flow_starts(&mut conn, &mut starts).await.unwrap();
    drop(conn);
    let start_id = starts[0].id;

    // claimed as a worker would, so no running processor picks it up too
    sqlx::query("UPDATE flow_starts SET status = 'Q' WHERE id = $1")
        .bind(start_id)
        .execute(&ctx.rt.db)
        .await
        .unwrap();

    runner::process_flow_start(&ctx.rt, start_id)
        .await
        .expect("Failed to process flow start");

    assert_eq!(
        flow_start::start_status(&ctx.rt.db, start_id).await.unwrap(),
        StartStatus::Completed
    );

    let (sessions,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM flow_sessions WHERE contact_id = ANY($1)")
        .bind(vec![ann.id, bob.id])
        .fetch_one(&ctx.rt.db)
        .await
        .unwrap();
    assert_eq!(sessions, 2);

    let start = flow_start::load_flow_start(&ctx.rt.db, start_id).await.unwrap();
    assert_eq!(start.contact_count, Some(2));
}

#[tokio::test]
async fn test_start_processor_claims_pending_starts() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let (flow_id, _) = ctx.create_flow("Greeting", "M", vec![send_msg_node("Hi there")]).await;
    let ann = ctx.create_contact("Ann", &["tel:+16055741111"]).await;

    let mut starts = [FlowStart::new(ctx.org_id, StartType::Api, flow_id).with_contact_ids(&[ann.id])];
    let mut conn = ctx.rt.db.acquire().await.unwrap();
    flow_start::insert_flow_starts(&mut conn, &mut starts).await.unwrap();
    drop(conn);

    let processor = StartProcessor::new(ctx.rt.clone(), QueueConfig::default());
    let claimed = processor.process_pending().await.expect("Failed to process starts");
    assert!(claimed >= 1);

    assert_eq!(
        flow_start::start_status(&ctx.rt.db, starts[0].id).await.unwrap(),
        StartStatus::Completed
    );
}

/// Sets a contact's datetime field directly.
async fn set_datetime_field(ctx: &TestContext, c: &Contact, key: &str, value: &str) {
    sqlx::query("UPDATE contacts SET fields = $2 WHERE id = $1")
        .bind(c.id)
        .bind(json!({ key: {"text": value, "datetime": value} }))
        .execute(&ctx.rt.db)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_point_scheduler_backfills_points() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let joined = ctx.create_field("joined", "Joined", "D").await;
    let (members, _) = ctx.create_group("Members", None).await;
    let (reminder, _) = ctx.create_flow("Reminder", "M", vec![send_msg_node("Don't forget!")]).await;

    let ann = ctx.create_contact("Ann", &["tel:+16055741111"]).await;
    let bob = ctx.create_contact("Bob", &["tel:+16055742222"]).await;
    let cat = ctx.create_contact("Cat", &["tel:+16055743333"]).await;
    ctx.add_to_group(members, &[&ann, &bob]).await;

    // bob has no value to schedule from and cat isn't in the group
    set_datetime_field(&ctx, &ann, "joined", "2040-03-01T10:00:00Z").await;
    set_datetime_field(&ctx, &cat, "joined", "2040-03-01T10:00:00Z").await;

    let point_id = ctx.create_campaign_point(members, joined, reminder, 1, "S").await;

    let scheduler = PointScheduler::new(ctx.rt.clone(), PointSchedulerConfig::default());
    let scheduled = scheduler
        .schedule_pending_points()
        .await
        .expect("Failed to schedule points");
    assert!(scheduled >= 1);

    let (status,): (String,) = sqlx::query_as("SELECT status FROM campaign_points WHERE id = $1")
        .bind(point_id)
        .fetch_one(&ctx.rt.db)
        .await
        .unwrap();
    assert_eq!(status, "R");

    let fires: Vec<(String, DateTime<Utc>)> =
        sqlx::query_as("SELECT scope, fire_on FROM contact_fires WHERE contact_id = $1 AND fire_type = 'C'")
            .bind(ann.id)
            .fetch_all(&ctx.rt.db)
            .await
            .unwrap();
    assert_eq!(fires.len(), 1);
    assert_eq!(fires[0].0, format!("{}:1", point_id));
    let start = DateTime::parse_from_rfc3339("2040-03-01T10:00:00Z").unwrap().with_timezone(&Utc);
    let delay = fires[0].1 - start;
    assert!(delay >= chrono::Duration::hours(23) && delay <= chrono::Duration::hours(25));

    assert_eq!(ctx.count_campaign_fires(&bob).await, 0);
    assert_eq!(ctx.count_campaign_fires(&cat).await, 0);

    // nothing left to do on the next poll
    scheduler.schedule_pending_points().await.unwrap();
    assert_eq!(ctx.count_campaign_fires(&ann).await, 1);
}

#[tokio::test]
async fn test_start_exclusions() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let (flow_id, _) = ctx.create_flow("Greeting", "M", vec![send_msg_node("Hi there")]).await;
    let ann = ctx.create_contact("Ann", &["tel:+16055741111"]).await;
    let bob = ctx.create_contact("Bob", &["tel:+16055742222"]).await;
    let cat = ctx.create_contact("Cat", &["tel:+16055743333"]).await;
    let dan = ctx.create_contact("Dan", &["tel:+16055744444"]).await;
    let eve = ctx.create_contact("Eve", &["tel:+16055745555"]).await;

    // bob is waiting in some flow
    sqlx::query("UPDATE contacts SET current_session_uuid = $2 WHERE id = $1")
        .bind(bob.id)
        .bind(Uuid::new_v4())
        .execute(&ctx.rt.db)
        .await
        .unwrap();

    // cat has been through this flow before
    let oa = ctx.assets().await;
    let flow = oa.flows().iter().find(|f| f.id == flow_id).unwrap().clone();
    let trigger = Trigger::new(flow.reference(), TriggerKind::Manual { user: None });
    runner::start_sessions(&ctx.rt, &oa, vec![cat.clone()], vec![trigger], NIL_START_ID)
        .await
        .expect("Failed to start session");

    // dan was seen yesterday, eve two months ago
    for (c, days) in [(&dan, 1), (&eve, 60)] {
        sqlx::query("UPDATE contacts SET last_seen_on = NOW() - make_interval(days => $2) WHERE id = $1")
            .bind(c.id)
            .bind(days)
            .execute(&ctx.rt.db)
            .await
            .unwrap();
    }

    let everyone = [ann.id, bob.id, cat.id, dan.id, eve.id];
    let resolve = |exclusions: Exclusions| {
        let start = FlowStart::new(ctx.org_id, StartType::Manual, flow_id)
            .with_contact_ids(&everyone)
            .with_exclusions(exclusions);
        let oa = oa.clone();
        let rt = ctx.rt.clone();
        let user_id = ctx.user_id;
        async move {
            audience::resolve_recipients(&rt, &oa, &Audience::from(&start), user_id)
                .await
                .expect("Failed to resolve recipients")
        }
    };

    assert_eq!(resolve(Exclusions::default()).await, everyone.to_vec());

    let in_a_flow = resolve(Exclusions {
        in_a_flow: true,
        ..Default::default()
    })
    .await;
    assert_eq!(in_a_flow, vec![ann.id, cat.id, dan.id, eve.id]);

    let started_previously = resolve(Exclusions {
        started_previously: true,
        ..Default::default()
    })
    .await;
    assert_eq!(started_previously, vec![ann.id, bob.id, dan.id, eve.id]);

    let not_seen_since = resolve(Exclusions {
        not_seen_since_days: 30,
        ..Default::default()
    })
    .await;
    assert_eq!(not_seen_since, vec![ann.id, bob.id, cat.id, eve.id]);
}

#[tokio::test]
async fn test_failed_campaign_fire_is_retried() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    // a flow point without a flow can't be started
    let joined = ctx.create_field("joined", "Joined", "D").await;
    let (members, _) = ctx.create_group("Members", None).await;
    let point_id = ctx.create_campaign_point(members, joined, FlowID(0), 1, "R").await;

    let ann = ctx.create_contact("Ann", &["tel:+16055741111"]).await;
    let due = Utc::now() - chrono::Duration::minutes(1);
    let mut conn = ctx.rt.db.acquire().await.unwrap();
    contact_fire::insert_contact_fires(&mut conn, &[ContactFire::for_campaign(ctx.org_id, ann.id, point_id, 1, due)])
        .await
        .unwrap();
    drop(conn);

    let scheduler = FireScheduler::new(ctx.rt.clone(), FireSchedulerConfig::default());
    scheduler.process_due_fires().await.expect("Failed to process due fires");

    let fires: Vec<(String, DateTime<Utc>)> =
        sqlx::query_as("SELECT scope, fire_on FROM contact_fires WHERE contact_id = $1")
            .bind(ann.id)
            .fetch_all(&ctx.rt.db)
            .await
            .unwrap();
    assert_eq!(fires.len(), 1);
    assert_eq!(fires[0].0, format!("{}:1", point_id));
    assert!(fires[0].1 > Utc::now(), "fire should be pushed back, is at {}", fires[0].1);
}
