// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Incidents: org-level problems worth telling administrators about.
//!
//! The only incident raised from sprints is `webhooks:unhealthy`. Every webhook call is
//! counted as healthy or unhealthy per node in rolling 5-minute Redis buckets. A node that
//! looks unhealthy over the last 20 minutes opens (or joins) the org's incident, and the
//! incident ends once every node recorded against it looks healthy again.

use chrono::{DateTime, Duration, Timelike, Utc};
use sqlx::{PgConnection, PgExecutor, PgPool};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::http_log::{CallStatus, HttpTrace};
use super::ids::{ChannelID, IncidentID, OrgID};
use super::notification::{self, Notification};
use crate::assets::OrgAssets;
use crate::error::Result;

/// Calls slower than this count as unhealthy.
pub const WEBHOOK_SLOW_MS: i32 = 10_000;
/// Minimum unhealthy calls in the window before a node is considered unhealthy.
pub const UNHEALTHY_MIN_CALLS: i64 = 10;
/// Share of calls, in percent, that must be unhealthy for a node to be considered unhealthy.
pub const UNHEALTHY_MIN_PERCENT: i64 = 25;
/// How long the nodes of an incident are remembered after the last unhealthy call.
pub const INCIDENT_NODES_TTL_SECS: i64 = 30 * 60;

code_enum! {
    pub enum IncidentType {
        WebhooksUnhealthy = ("webhooks:unhealthy", "webhooks:unhealthy"),
        ChannelDisconnected = ("channel:disconnected", "channel:disconnected"),
        OrgFlagged = ("org:flagged", "org:flagged"),
        OrgSuspended = ("org:suspended", "org:suspended"),
    }
}

/// A row in `incidents`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Incident {
    pub id: IncidentID,
    pub org_id: OrgID,
    pub incident_type: IncidentType,
    pub scope: String,
    pub channel_id: ChannelID,
    pub started_on: DateTime<Utc>,
    pub ended_on: Option<DateTime<Utc>>,
}

/// A counter per field over fixed-length intervals, of which the last few are summed.
#[derive(Debug, Clone, Copy)]
pub struct IntervalSeries {
    pub key_base: &'static str,
    pub interval_secs: i64,
    pub intervals: i64,
}

/// Healthy webhook calls by node.
pub const WEBHOOKS_HEALTHY: IntervalSeries = IntervalSeries {
    key_base: "webhooks:healthy",
    interval_secs: 300,
    intervals: 4,
};

/// Unhealthy webhook calls by node.
pub const WEBHOOKS_UNHEALTHY: IntervalSeries = IntervalSeries {
    key_base: "webhooks:unhealthy",
    interval_secs: 300,
    intervals: 4,
};

impl IntervalSeries {
    /// The keys of the intervals making up the window ending at `now`, most recent first.
    pub fn keys(&self, now: DateTime<Utc>) -> Vec<String> {
        let start = now.timestamp() - now.timestamp().rem_euclid(self.interval_secs);
        (0..self.intervals)
            .filter_map(|i| DateTime::from_timestamp(start - i * self.interval_secs, 0))
            .map(|t| format!("{}:{}", self.key_base, t.format("%Y-%m-%dT%H:%M")))
            .collect()
    }

    /// Adds to the counts of fields in the current interval.
    pub async fn record(&self, redis: &redis::Client, fields: &[&str], now: DateTime<Utc>) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }

        let keys = self.keys(now);
        let Some(current) = keys.first() else {
            return Ok(());
        };

        let mut conn = redis.get_multiplexed_async_connection().await?;
        let mut pipe = redis::pipe();
        for field in fields {
            pipe.cmd("HINCRBY").arg(current).arg(*field).arg(1).ignore();
        }
        pipe.cmd("EXPIRE")
            .arg(current)
            .arg(self.interval_secs * self.intervals)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;

        Ok(())
    }

    /// The total of each field over the whole window.
    pub async fn totals(&self, redis: &redis::Client, fields: &[String], now: DateTime<Utc>) -> Result<Vec<i64>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = redis.get_multiplexed_async_connection().await?;
        let mut pipe = redis::pipe();
        for key in self.keys(now) {
            pipe.cmd("HMGET").arg(key).arg(fields);
        }
        let per_interval: Vec<Vec<Option<i64>>> = pipe.query_async(&mut conn).await?;

        let mut totals = vec![0; fields.len()];
        for counts in per_interval {
            for (total, count) in totals.iter_mut().zip(counts) {
                *total += count.unwrap_or(0);
            }
        }
        Ok(totals)
    }
}

/// Whether a webhook call counts as healthy.
pub fn is_healthy_call(trace: &HttpTrace) -> bool {
    trace.status == CallStatus::Success && trace.elapsed_ms <= WEBHOOK_SLOW_MS
}

/// Whether a node with these call counts looks unhealthy.
pub fn is_unhealthy_node(healthy: i64, unhealthy: i64) -> bool {
    unhealthy >= UNHEALTHY_MIN_CALLS && unhealthy * 100 >= (healthy + unhealthy) * UNHEALTHY_MIN_PERCENT
}

/// Key of the set of nodes recorded against an incident.
pub fn incident_nodes_key(id: IncidentID) -> String {
    format!("incident:{}:nodes", id)
}

/// Records webhook calls made at nodes, and returns the nodes which now look unhealthy.
pub async fn record_webhook_calls(
    redis: &redis::Client,
    calls: &[(Uuid, bool)],
    now: DateTime<Utc>,
) -> Result<Vec<Uuid>> {
    let healthy: Vec<String> = calls.iter().filter(|(_, h)| *h).map(|(n, _)| n.to_string()).collect();
    let unhealthy: Vec<String> = calls.iter().filter(|(_, h)| !*h).map(|(n, _)| n.to_string()).collect();

    WEBHOOKS_HEALTHY
        .record(redis, &healthy.iter().map(String::as_str).collect::<Vec<_>>(), now)
        .await?;
    WEBHOOKS_UNHEALTHY
        .record(redis, &unhealthy.iter().map(String::as_str).collect::<Vec<_>>(), now)
        .await?;

    let mut candidates = unhealthy;
    candidates.sort();
    candidates.dedup();

    let healthy_counts = WEBHOOKS_HEALTHY.totals(redis, &candidates, now).await?;
    let unhealthy_counts = WEBHOOKS_UNHEALTHY.totals(redis, &candidates, now).await?;

    Ok(candidates
        .iter()
        .zip(healthy_counts.iter().zip(&unhealthy_counts))
        .filter(|(_, (h, u))| is_unhealthy_node(**h, **u))
        .filter_map(|(n, _)| Uuid::parse_str(n).ok())
        .collect())
}

/// Gets the org's open incident of a type, creating it if there isn't one. Returns the
/// incident and whether it was created.
pub async fn get_or_create_incident(
    conn: &mut PgConnection,
    org_id: OrgID,
    incident_type: IncidentType,
    scope: &str,
    channel_id: ChannelID,
) -> Result<(Incident, bool)> {
    let created = sqlx::query_as::<_, Incident>(
        r#"
        INSERT INTO incidents (org_id, incident_type, scope, channel_id, started_on)
        VALUES ($1, $2, $3, $4, NOW())
        ON CONFLICT (org_id, incident_type, scope) WHERE ended_on IS NULL DO NOTHING
        RETURNING id, org_id, incident_type, scope, channel_id, started_on, ended_on
        "#,
    )
    .bind(org_id)
    .bind(incident_type)
    .bind(scope)
    .bind(channel_id)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(incident) = created {
        return Ok((incident, true));
    }

    let existing = sqlx::query_as::<_, Incident>(
        r#"
        SELECT id, org_id, incident_type, scope, channel_id, started_on, ended_on
        FROM incidents WHERE org_id = $1 AND incident_type = $2 AND scope = $3 AND ended_on IS NULL
        "#,
    )
    .bind(org_id)
    .bind(incident_type)
    .bind(scope)
    .fetch_one(&mut *conn)
    .await?;

    Ok((existing, false))
}

/// Opens or joins the org's unhealthy webhooks incident, recording the given nodes against it.
/// Administrators are notified when the incident is new.
#[instrument(skip_all, fields(org_id = %oa.org_id(), nodes = nodes.len()))]
pub async fn incident_webhooks_unhealthy(
    conn: &mut PgConnection,
    redis: &redis::Client,
    oa: &OrgAssets,
    nodes: &[Uuid],
) -> Result<IncidentID> {
    let (incident, created) =
        get_or_create_incident(conn, oa.org_id(), IncidentType::WebhooksUnhealthy, "", ChannelID(0)).await?;

    if created {
        info!(incident_id = %incident.id, "Webhooks unhealthy incident started");
        notification::insert_notifications(
            conn,
            &[Notification::incident_started(oa.org_id(), incident.id, oa.users())],
        )
        .await?;
    }

    if !nodes.is_empty() {
        let key = incident_nodes_key(incident.id);
        let mut rc = redis.get_multiplexed_async_connection().await?;
        let mut pipe = redis::pipe();
        pipe.cmd("SADD").arg(&key).arg(nodes.iter().map(Uuid::to_string).collect::<Vec<_>>()).ignore();
        pipe.cmd("EXPIRE").arg(&key).arg(INCIDENT_NODES_TTL_SECS).ignore();
        let _: () = pipe.query_async(&mut rc).await?;
    }

    Ok(incident.id)
}

/// Loads the open incidents of a type across all orgs.
pub async fn load_open_incidents<'e>(db: impl PgExecutor<'e>, incident_type: IncidentType) -> Result<Vec<Incident>> {
    let incidents = sqlx::query_as::<_, Incident>(
        r#"
        SELECT id, org_id, incident_type, scope, channel_id, started_on, ended_on
        FROM incidents WHERE incident_type = $1 AND ended_on IS NULL ORDER BY id
        "#,
    )
    .bind(incident_type)
    .fetch_all(db)
    .await?;

    Ok(incidents)
}

/// Ends incidents.
pub async fn end_incidents<'e>(db: impl PgExecutor<'e>, ids: &[IncidentID]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }

    sqlx::query("UPDATE incidents SET ended_on = NOW() WHERE id = ANY($1) AND ended_on IS NULL")
        .bind(super::ids::raw_ids(ids))
        .execute(db)
        .await?;

    Ok(())
}

/// Ends the unhealthy webhook incidents whose recorded nodes all look healthy again.
/// Returns the ids of the incidents ended.
#[instrument(skip_all)]
pub async fn check_webhook_health(db: &PgPool, redis: &redis::Client) -> Result<Vec<IncidentID>> {
    let incidents = load_open_incidents(db, IncidentType::WebhooksUnhealthy).await?;
    let now = Utc::now();
    let mut healed = Vec::new();

    for incident in &incidents {
        let mut rc = redis.get_multiplexed_async_connection().await?;
        let nodes: Vec<String> = redis::cmd("SMEMBERS")
            .arg(incident_nodes_key(incident.id))
            .query_async(&mut rc)
            .await?;

        let healthy = WEBHOOKS_HEALTHY.totals(redis, &nodes, now).await?;
        let unhealthy = WEBHOOKS_UNHEALTHY.totals(redis, &nodes, now).await?;

        let still_unhealthy = healthy
            .iter()
            .zip(&unhealthy)
            .any(|(h, u)| is_unhealthy_node(*h, *u));

        if !still_unhealthy {
            healed.push(incident.id);
        }
    }

    end_incidents(db, &healed).await?;
    debug!(checked = incidents.len(), ended = healed.len(), "Checked webhook incidents");
    Ok(healed)
}

/// The time a series interval starts, for logging.
pub fn interval_start(series: &IntervalSeries, now: DateTime<Utc>) -> DateTime<Utc> {
    let secs = now.num_seconds_from_midnight() as i64;
    now - Duration::seconds(secs.rem_euclid(series.interval_secs)) - Duration::nanoseconds(now.nanosecond() as i64)
}
