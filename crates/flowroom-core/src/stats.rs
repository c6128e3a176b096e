// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Statistics recording.
//!
//! Counters are insert-only rows that a separate squasher job collapses. Recent contacts per
//! flow segment are kept in capped Redis sorted sets.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::Result;
use crate::models::ids::{ContactID, FlowID, OrgID, raw_ids};

/// Maximum members kept in each recent contacts set.
pub const RECENT_CONTACTS_CAP: isize = 5;
/// How long a recent contacts set lives after its last write.
pub const RECENT_CONTACTS_TTL_SECS: i64 = 24 * 3600;
/// Operands are truncated to this many characters.
pub const MAX_OPERAND_CHARS: usize = 100;

/// Node UI types whose operand is worth showing against recent contacts.
const OPERAND_UI_TYPES: &[&str] = &[
    "wait_for_response",
    "split_by_expression",
    "split_by_contact_field",
    "split_by_run_result",
];

/// The activity scope of a path segment.
pub fn segment_scope(exit_uuid: Uuid, dest_uuid: Uuid) -> String {
    format!("segment:{}:{}", exit_uuid, dest_uuid)
}

/// The Redis key of the recent contacts set for a path segment.
pub fn recent_contacts_key(exit_uuid: Uuid, dest_uuid: Uuid) -> String {
    format!("recent_contacts:{}:{}", exit_uuid, dest_uuid)
}

/// Accumulates counts keyed by flow and scope across a batch of sprints.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FlowActivity {
    counts: BTreeMap<(FlowID, String), i32>,
}

impl FlowActivity {
    pub fn add(&mut self, flow_id: FlowID, scope: String, delta: i32) {
        *self.counts.entry((flow_id, scope)).or_default() += delta;
    }

    pub fn is_empty(&self) -> bool {
        self.counts.values().all(|c| *c == 0)
    }

    pub fn counts(&self) -> impl Iterator<Item = (FlowID, &str, i32)> {
        self.counts
            .iter()
            .filter(|(_, c)| **c != 0)
            .map(|((f, s), c)| (*f, s.as_str(), *c))
    }
}

/// Accumulates result category counts across a batch of sprints.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FlowResults {
    counts: BTreeMap<(FlowID, String, String), i32>,
}

impl FlowResults {
    /// Records a category change, decrementing the previous category if there was one.
    pub fn record_change(
        &mut self,
        flow_id: FlowID,
        result_key: &str,
        previous: Option<&str>,
        category: &str,
    ) {
        if let Some(prev) = previous.filter(|p| !p.is_empty()) {
            *self
                .counts
                .entry((flow_id, result_key.to_string(), prev.to_string()))
                .or_default() -= 1;
        }
        if !category.is_empty() {
            *self
                .counts
                .entry((flow_id, result_key.to_string(), category.to_string()))
                .or_default() += 1;
        }
    }

    pub fn counts(&self) -> impl Iterator<Item = (FlowID, &str, &str, i32)> {
        self.counts
            .iter()
            .filter(|(_, c)| **c != 0)
            .map(|((f, r, cat), c)| (*f, r.as_str(), cat.as_str(), *c))
    }
}

/// Inserts flow activity counts.
pub async fn insert_flow_activity(conn: &mut PgConnection, activity: &FlowActivity) -> Result<()> {
    if activity.is_empty() {
        return Ok(());
    }

    let (mut flows, mut scopes, mut counts) = (Vec::new(), Vec::new(), Vec::new());
    for (flow_id, scope, count) in activity.counts() {
        flows.push(flow_id);
        scopes.push(scope);
        counts.push(count);
    }

    sqlx::query(
        r#"
        INSERT INTO flow_activity_counts (flow_id, scope, count)
        SELECT * FROM UNNEST($1::BIGINT[], $2::TEXT[], $3::INT[])
        "#,
    )
    .bind(raw_ids(&flows))
    .bind(scopes)
    .bind(counts)
    .execute(conn)
    .await?;

    Ok(())
}

/// Inserts flow result counts.
pub async fn insert_flow_results(conn: &mut PgConnection, results: &FlowResults) -> Result<()> {
    let (mut flows, mut keys, mut categories, mut counts) =
        (Vec::new(), Vec::new(), Vec::new(), Vec::new());
    for (flow_id, key, category, count) in results.counts() {
        flows.push(flow_id);
        keys.push(key);
        categories.push(category);
        counts.push(count);
    }
    if flows.is_empty() {
        return Ok(());
    }

    sqlx::query(
        r#"
        INSERT INTO flow_result_counts (flow_id, result, category, count)
        SELECT * FROM UNNEST($1::BIGINT[], $2::TEXT[], $3::TEXT[], $4::INT[])
        "#,
    )
    .bind(raw_ids(&flows))
    .bind(keys)
    .bind(categories)
    .bind(counts)
    .execute(conn)
    .await?;

    Ok(())
}

/// Inserts per-day counts for an org, e.g. `tickets:opened:{topicID}`.
pub async fn insert_daily_counts(
    conn: &mut PgConnection,
    org_id: OrgID,
    day: NaiveDate,
    counts: &BTreeMap<String, i32>,
) -> Result<()> {
    let (scopes, values): (Vec<&str>, Vec<i32>) = counts
        .iter()
        .filter(|(_, c)| **c != 0)
        .map(|(s, c)| (s.as_str(), *c))
        .unzip();
    if scopes.is_empty() {
        return Ok(());
    }

    sqlx::query(
        r#"
        INSERT INTO daily_counts (org_id, scope, day, count)
        SELECT $1, s, $2, c FROM UNNEST($3::TEXT[], $4::INT[]) AS t(s, c)
        "#,
    )
    .bind(org_id)
    .bind(day)
    .bind(scopes)
    .bind(values)
    .execute(conn)
    .await?;

    Ok(())
}

/// A contact passing through a segment, for the recent contacts sets.
#[derive(Debug, Clone, PartialEq)]
pub struct RecentContact {
    pub exit_uuid: Uuid,
    pub dest_uuid: Uuid,
    pub contact_id: ContactID,
    pub operand: String,
    pub time: DateTime<Utc>,
}

impl RecentContact {
    /// Builds an entry, only keeping the operand for node types that show it.
    pub fn new(
        exit_uuid: Uuid,
        dest_uuid: Uuid,
        contact_id: ContactID,
        ui_type: &str,
        operand: &str,
        time: DateTime<Utc>,
    ) -> Self {
        let operand = if OPERAND_UI_TYPES.contains(&ui_type) {
            operand.chars().take(MAX_OPERAND_CHARS).collect()
        } else {
            String::new()
        };
        Self {
            exit_uuid,
            dest_uuid,
            contact_id,
            operand,
            time,
        }
    }

    /// The sorted set member, `{nonce}|{contactID}|{operand}`.
    ///
    /// The nonce keeps repeat visits by the same contact distinct.
    pub fn member(&self, nonce: &str) -> String {
        format!("{}|{}|{}", nonce, self.contact_id, self.operand)
    }

    /// The sorted set score, UNIX time in seconds.
    pub fn score(&self) -> f64 {
        self.time.timestamp_micros() as f64 / 1_000_000.0
    }
}

/// Records recent contacts, capping each set and refreshing its expiry.
pub async fn record_recent_contacts(
    redis: &redis::Client,
    entries: &[RecentContact],
) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }

    let mut conn = redis.get_multiplexed_async_connection().await?;
    let mut pipe = redis::pipe();

    for entry in entries {
        let key = recent_contacts_key(entry.exit_uuid, entry.dest_uuid);
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(4)
            .map(char::from)
            .collect();

        pipe.cmd("ZADD")
            .arg(&key)
            .arg(entry.score())
            .arg(entry.member(&nonce))
            .ignore();
        pipe.cmd("ZREMRANGEBYRANK")
            .arg(&key)
            .arg(0)
            .arg(-(RECENT_CONTACTS_CAP + 1))
            .ignore();
        pipe.cmd("EXPIRE")
            .arg(&key)
            .arg(RECENT_CONTACTS_TTL_SECS)
            .ignore();
    }

    let _: () = pipe.query_async(&mut conn).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        let exit = Uuid::parse_str("5fd2e537-0534-4c12-8425-bef87af09d46").unwrap();
        let dest = Uuid::parse_str("c3d0b417-db75-417b-8050-33776ec8f620").unwrap();
        assert_eq!(
            segment_scope(exit, dest),
            "segment:5fd2e537-0534-4c12-8425-bef87af09d46:c3d0b417-db75-417b-8050-33776ec8f620"
        );
        assert_eq!(
            recent_contacts_key(exit, dest),
            "recent_contacts:5fd2e537-0534-4c12-8425-bef87af09d46:c3d0b417-db75-417b-8050-33776ec8f620"
        );
    }

    #[test]
    fn test_flow_results() {
        let mut results = FlowResults::default();
        results.record_change(FlowID(1), "color", None, "Red");
        results.record_change(FlowID(1), "color", Some("Red"), "Blue");
        results.record_change(FlowID(1), "color", None, "Blue");

        let counts: Vec<_> = results.counts().collect();
        assert_eq!(counts, vec![(FlowID(1), "color", "Blue", 2)]);
    }

    #[test]
    fn test_flow_activity() {
        let mut activity = FlowActivity::default();
        assert!(activity.is_empty());
        activity.add(FlowID(1), "segment:a:b".to_string(), 1);
        activity.add(FlowID(1), "segment:a:b".to_string(), 1);
        activity.add(FlowID(2), "segment:c:d".to_string(), 1);

        let counts: Vec<_> = activity.counts().collect();
        assert_eq!(
            counts,
            vec![(FlowID(1), "segment:a:b", 2), (FlowID(2), "segment:c:d", 1)]
        );
    }

    #[test]
    fn test_recent_contact_operand() {
        let now = Utc::now();
        let long = "x".repeat(150);

        let rc = RecentContact::new(Uuid::new_v4(), Uuid::new_v4(), ContactID(7), "wait_for_response", &long, now);
        assert_eq!(rc.operand.len(), 100);
        assert_eq!(rc.member("abcd"), format!("abcd|7|{}", "x".repeat(100)));

        let rc = RecentContact::new(Uuid::new_v4(), Uuid::new_v4(), ContactID(7), "execute_actions", "hi", now);
        assert_eq!(rc.operand, "");
        assert_eq!(rc.member("abcd"), "abcd|7|");
    }
}
