// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for creating contacts and moving URNs between them.

#[macro_use]
mod common;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use common::{TestContext, action_node, send_msg_node};
use flowroom_core::engine::{Trigger, TriggerKind};
use flowroom_core::error::CoreError;
use flowroom_core::models::contact::{self, Contact, ContactStatus, UrnChange};
use flowroom_core::models::ids::NIL_START_ID;
use flowroom_core::runner;

#[tokio::test]
async fn test_create_contact_reclaims_orphaned_urn() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let (kinyarwanda, _) = ctx.create_group("Kinyarwanda", Some(r#"language = "kin""#)).await;

    // an orphaned URN left behind by a deleted contact
    sqlx::query(
        r#"
        INSERT INTO contact_urns (org_id, contact_id, identity, scheme, path, priority)
        VALUES ($1, NULL, 'telegram:200002', 'telegram', '200002', 1000)
        "#,
    )
    .bind(ctx.org_id)
    .execute(&ctx.rt.db)
    .await
    .expect("Failed to insert orphaned URN");

    let oa = ctx.assets().await;
    let rich = contact::create_contact(
        &ctx.rt.db,
        ctx.rt.engine.as_ref(),
        &oa,
        ctx.user_id,
        Some("Rich"),
        Some("kin"),
        ContactStatus::Active,
        &["telegram:200001".to_string(), "telegram:200002".to_string()],
    )
    .await
    .expect("Failed to create contact");

    assert_eq!(rich.name.as_deref(), Some("Rich"));
    assert_eq!(rich.language.as_deref(), Some("kin"));

    let urns: Vec<(String, i32)> = rich.urns.iter().map(|u| (u.identity.clone(), u.priority)).collect();
    assert_eq!(
        urns,
        vec![
            ("telegram:200001".to_string(), 1000),
            ("telegram:200002".to_string(), 999),
        ]
    );

    // the orphaned row was reused rather than duplicated
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM contact_urns WHERE org_id = $1 AND identity = 'telegram:200002'")
            .bind(ctx.org_id)
            .fetch_one(&ctx.rt.db)
            .await
            .unwrap();
    assert_eq!(count, 1);

    assert!(rich.group_ids.contains(&kinyarwanda));
}

#[tokio::test]
async fn test_create_contact_with_taken_urn() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    ctx.create_contact("Ann", &["tel:+16055741111"]).await;

    let oa = ctx.assets().await;
    let err = contact::create_contact(
        &ctx.rt.db,
        ctx.rt.engine.as_ref(),
        &oa,
        ctx.user_id,
        Some("Bob"),
        None,
        ContactStatus::Active,
        &["tel:+16055742222".to_string(), "tel:+16055741111".to_string()],
    )
    .await
    .unwrap_err();

    assert!(matches!(err, CoreError::UrnTaken { index: 1 }));
}

#[tokio::test]
async fn test_create_contact_with_unknown_language() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let oa = ctx.assets().await;
    let err = contact::create_contact(
        &ctx.rt.db,
        ctx.rt.engine.as_ref(),
        &oa,
        ctx.user_id,
        None,
        Some("fra"),
        ContactStatus::Active,
        &[],
    )
    .await
    .unwrap_err();

    assert!(matches!(err, CoreError::UnknownLanguage(ref l) if l == "fra"));
}

#[tokio::test]
async fn test_update_contact_urns_steals_urn() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let ann = ctx.create_contact("Ann", &["tel:+16055742222"]).await;
    let bob = ctx.create_contact("Bob", &[]).await;
    let (no_urn, _) = ctx.create_group("No URN", Some(r#"urn = """#)).await;

    let oa = ctx.assets().await;
    let mut tx = ctx.rt.db.begin().await.unwrap();
    let affected = contact::update_contact_urns(
        &mut tx,
        ctx.rt.engine.as_ref(),
        &oa,
        &[UrnChange {
            contact_id: bob.id,
            urns: vec!["tel:+16055742222".to_string()],
        }],
    )
    .await
    .expect("Failed to update URNs");
    tx.commit().await.unwrap();

    assert_eq!(affected, vec![ann.id]);

    let bob = ctx.load_contact(&bob).await;
    assert_eq!(bob.urns.len(), 1);
    assert_eq!(bob.urns[0].identity, "tel:+16055742222");
    assert_eq!(bob.urns[0].priority, 1000);

    assert!(!bob.group_ids.contains(&no_urn));

    // losing its only URN moves ann into the query group
    let ann_after = ctx.load_contact(&ann).await;
    assert!(ann_after.urns.is_empty());
    assert!(ann_after.modified_on > ann.modified_on);
    assert_eq!(ann_after.group_ids, vec![no_urn]);
}

#[tokio::test]
async fn test_update_contact_urns_with_current_urns_is_noop() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let ann = ctx.create_contact("Ann", &["tel:+16055743333", "telegram:300001"]).await;

    let oa = ctx.assets().await;
    let mut tx = ctx.rt.db.begin().await.unwrap();
    let affected = contact::update_contact_urns(
        &mut tx,
        ctx.rt.engine.as_ref(),
        &oa,
        &[UrnChange {
            contact_id: ann.id,
            urns: vec!["tel:+16055743333".to_string(), "telegram:300001".to_string()],
        }],
    )
    .await
    .expect("Failed to update URNs");
    tx.commit().await.unwrap();

    assert!(affected.is_empty());

    let after = ctx.load_contact(&ann).await;
    assert_eq!(after.modified_on, ann.modified_on);
    assert_eq!(after.urns, ann.urns);
}

/// Starts a flow by name for a contact and returns the reloaded contact.
async fn run_flow(ctx: &TestContext, name: &str, c: &Contact) -> Contact {
    let oa = ctx.assets().await;
    let flow = oa.flows().iter().find(|f| f.name == name).unwrap().clone();
    let trigger = Trigger::new(flow.reference(), TriggerKind::Manual { user: None });
    runner::start_sessions(&ctx.rt, &oa, vec![c.clone()], vec![trigger], NIL_START_ID)
        .await
        .expect("Failed to start sessions");
    ctx.load_contact(c).await
}

async fn campaign_fire_times(ctx: &TestContext, c: &Contact) -> Vec<DateTime<Utc>> {
    let rows: Vec<(DateTime<Utc>,)> =
        sqlx::query_as("SELECT fire_on FROM contact_fires WHERE contact_id = $1 AND fire_type = 'C' ORDER BY id")
            .bind(c.id)
            .fetch_all(&ctx.rt.db)
            .await
            .unwrap();
    rows.into_iter().map(|(t,)| t).collect()
}

#[tokio::test]
async fn test_sprints_reschedule_campaign_fires() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let joined = ctx.create_field("joined", "Joined", "D").await;
    let (members, members_uuid) = ctx.create_group("Members", None).await;
    let (reminder, _) = ctx.create_flow("Reminder", "M", vec![send_msg_node("Don't forget!")]).await;
    ctx.create_campaign_point(members, joined, reminder, 1, "R").await;

    let group = json!([{"uuid": members_uuid, "name": "Members"}]);
    let field = json!({"key": "joined", "name": "Joined"});
    ctx.create_flow(
        "Join",
        "M",
        vec![
            action_node(json!({"type": "set_contact_field", "field": field, "value": "2040-03-01T10:00:00Z"})),
            action_node(json!({"type": "add_contact_groups", "groups": group})),
        ],
    )
    .await;
    ctx.create_flow(
        "Move",
        "M",
        vec![action_node(
            json!({"type": "set_contact_field", "field": field, "value": "2041-03-01T10:00:00Z"}),
        )],
    )
    .await;
    ctx.create_flow(
        "Leave",
        "M",
        vec![action_node(json!({"type": "remove_contact_groups", "groups": group}))],
    )
    .await;

    let ann = ctx.create_contact("Ann", &["tel:+16055741111"]).await;
    let start = |s: &str| DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc);

    // joining the group schedules a fire a day after the field
    let ann = run_flow(&ctx, "Join", &ann).await;
    assert_eq!(ann.group_ids, vec![members]);
    let fires = campaign_fire_times(&ctx, &ann).await;
    assert_eq!(fires.len(), 1);
    let delay = fires[0] - start("2040-03-01T10:00:00Z");
    assert!(delay >= Duration::hours(23) && delay <= Duration::hours(25), "fire is {} after", delay);

    // changing the field moves it
    let ann = run_flow(&ctx, "Move", &ann).await;
    let fires = campaign_fire_times(&ctx, &ann).await;
    assert_eq!(fires.len(), 1);
    assert!(fires[0] > start("2041-03-01T10:00:00Z"));

    // leaving the group removes it
    let ann = run_flow(&ctx, "Leave", &ann).await;
    assert!(ann.group_ids.is_empty());
    assert_eq!(ctx.count_campaign_fires(&ann).await, 0);
}
