// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Campaigns and the scheduling of their points.
//!
//! A campaign owns its points by value. Anything that needs to get from a point back to its
//! campaign does so by id through [`find_point`], never through a stored reference.

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use tracing::debug;
use uuid::Uuid;

use super::broadcast::Translations;
use super::contact::{Contact, ContactStatus};
use super::contact_fire::{self, ContactFire, FireDelete};
use super::field::{CREATED_ON_KEY, LAST_SEEN_ON_KEY};
use super::ids::{CampaignID, ContactID, FieldID, FlowID, GroupID, OrgID, PointID};
use crate::error::Result;

/// Delivery hour meaning "whatever time the offset lands on".
pub const NO_DELIVERY_HOUR: i32 = -1;

code_enum! {
    /// What a point does when it fires.
    pub enum PointType {
        Flow = ("F", "flow"),
        Message = ("M", "message"),
    }
}

code_enum! {
    /// Whether a point's fires have been backfilled.
    pub enum PointStatus {
        Scheduling = ("S", "scheduling"),
        Ready = ("R", "ready"),
    }
}

code_enum! {
    /// How a flow point treats a contact who is already in a flow.
    pub enum StartMode {
        Interrupt = ("I", "interrupt"),
        Skip = ("S", "skip"),
        Background = ("P", "passive"),
    }
}

code_enum! {
    /// The unit of a point's offset.
    pub enum OffsetUnit {
        Minutes = ("M", "minutes"),
        Hours = ("H", "hours"),
        Days = ("D", "days"),
        Weeks = ("W", "weeks"),
    }
}

/// The date field a point is relative to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelativeTo {
    pub id: FieldID,
    pub key: String,
}

/// One scheduled event of a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignPoint {
    pub id: PointID,
    pub uuid: Uuid,
    pub campaign_id: CampaignID,
    pub point_type: PointType,
    pub status: PointStatus,
    pub fire_version: i32,
    pub start_mode: StartMode,
    pub relative_to: RelativeTo,
    pub offset: i32,
    pub unit: OffsetUnit,
    pub delivery_hour: i32,
    pub flow_id: FlowID,
    pub translations: Option<Translations>,
    pub base_language: Option<String>,
}

impl CampaignPoint {
    /// The instant this point would fire for a contact, if it qualifies and that is in the
    /// future.
    pub fn schedule_for_contact(
        &self,
        tz: Tz,
        now: DateTime<Utc>,
        contact: &Contact,
    ) -> Option<DateTime<Utc>> {
        let start = self.start_for_contact(contact)?;
        self.schedule_for_time(tz, now, start)
    }

    /// Whether a contact has a usable value for the field this point is relative to.
    pub fn qualifies_by_field(&self, contact: &Contact) -> bool {
        self.start_for_contact(contact).is_some()
    }

    fn start_for_contact(&self, contact: &Contact) -> Option<DateTime<Utc>> {
        match self.relative_to.key.as_str() {
            CREATED_ON_KEY => Some(contact.created_on),
            LAST_SEEN_ON_KEY => contact.last_seen_on,
            key => contact.fields.get(key).and_then(|v| v.datetime),
        }
    }

    /// Computes the fire time for a start instant.
    ///
    /// Minutes and hours add fixed durations. Days and weeks add calendar days in the org's
    /// timezone, so a DST change in between gives 23 or 25 hour days.
    pub fn schedule_for_time(
        &self,
        tz: Tz,
        now: DateTime<Utc>,
        start: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let mut local = start.with_timezone(&tz);

        // round up to the next minute
        if local.second() != 0 || local.nanosecond() != 0 {
            local = local.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        }

        let offset = self.offset as i64;
        let scheduled = match self.unit {
            OffsetUnit::Minutes => local + Duration::minutes(offset),
            OffsetUnit::Hours => local + Duration::hours(offset),
            OffsetUnit::Days => add_days(tz, local.naive_local(), offset)?,
            OffsetUnit::Weeks => add_days(tz, local.naive_local(), offset * 7)?,
        };

        let scheduled = if self.delivery_hour != NO_DELIVERY_HOUR {
            let naive = scheduled
                .date_naive()
                .and_hms_opt(self.delivery_hour.clamp(0, 23) as u32, 0, 0)?;
            resolve_local(tz, naive)?
        } else {
            scheduled
        };

        let scheduled = scheduled.with_timezone(&Utc);
        if scheduled < now { None } else { Some(scheduled) }
    }
}

fn add_days(tz: Tz, local: NaiveDateTime, days: i64) -> Option<DateTime<Tz>> {
    resolve_local(tz, local.checked_add_signed(Duration::days(days))?)
}

/// Resolves a wall clock time, taking the earlier instant when it's ambiguous and moving
/// forward over a gap.
fn resolve_local(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest(),
    }
}

/// A campaign with its points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignID,
    pub uuid: Uuid,
    pub name: String,
    pub group_id: GroupID,
    pub points: Vec<CampaignPoint>,
}

/// Finds a point and its campaign by point id.
pub fn find_point(campaigns: &[Campaign], point_id: PointID) -> Option<(&Campaign, &CampaignPoint)> {
    campaigns
        .iter()
        .find_map(|c| c.points.iter().find(|p| p.id == point_id).map(|p| (c, p)))
}

/// The campaigns bound to a group.
pub fn campaigns_for_group(campaigns: &[Campaign], group_id: GroupID) -> impl Iterator<Item = &Campaign> {
    campaigns.iter().filter(move |c| c.group_id == group_id)
}

/// Computes the fires a contact should get on joining the campaigns' groups.
pub fn fires_for_contact<'a>(
    campaigns: impl IntoIterator<Item = &'a Campaign>,
    org_id: OrgID,
    tz: Tz,
    now: DateTime<Utc>,
    contact: &Contact,
) -> Vec<ContactFire> {
    let mut fires = Vec::new();
    for campaign in campaigns {
        for point in &campaign.points {
            if !point.qualifies_by_field(contact) {
                continue;
            }
            if let Some(fire_on) = point.schedule_for_contact(tz, now, contact) {
                fires.push(ContactFire::for_campaign(
                    org_id,
                    contact.id,
                    point.id,
                    point.fire_version,
                    fire_on,
                ));
            }
        }
    }
    fires
}

/// Deletes the fires of contacts leaving a group for the campaigns bound to that group.
pub async fn delete_fires_for_group_leave(
    conn: &mut PgConnection,
    campaigns: &[Campaign],
    leaves: &[(ContactID, GroupID)],
) -> Result<u64> {
    let deletes: Vec<FireDelete> = leaves
        .iter()
        .flat_map(|(contact_id, group_id)| {
            campaigns_for_group(campaigns, *group_id).flat_map(move |c| {
                c.points.iter().map(move |p| FireDelete {
                    contact_id: *contact_id,
                    point_id: p.id,
                })
            })
        })
        .collect();

    contact_fire::delete_campaign_fires(conn, &deletes).await
}

/// Recomputes the fires of contacts joining groups for the campaigns bound to those groups.
pub async fn add_fires_for_group_join(
    conn: &mut PgConnection,
    campaigns: &[Campaign],
    org_id: OrgID,
    tz: Tz,
    joins: &[(&Contact, GroupID)],
) -> Result<()> {
    let leaves: Vec<(ContactID, GroupID)> = joins.iter().map(|(c, g)| (c.id, *g)).collect();
    delete_fires_for_group_leave(conn, campaigns, &leaves).await?;

    let now = Utc::now();
    let fires: Vec<ContactFire> = joins
        .iter()
        .flat_map(|(contact, group_id)| {
            fires_for_contact(campaigns_for_group(campaigns, *group_id), org_id, tz, now, contact)
        })
        .collect();

    debug!(org_id = %org_id, fires = fires.len(), "Scheduling campaign fires for group joins");
    contact_fire::insert_contact_fires(conn, &fires).await
}

#[derive(Deserialize)]
struct PointJson {
    id: PointID,
    uuid: Uuid,
    point_type: String,
    status: String,
    fire_version: i32,
    start_mode: String,
    relative_to_id: FieldID,
    relative_to_key: String,
    offset: i32,
    unit: String,
    delivery_hour: i32,
    flow_id: FlowID,
    translations: Option<Translations>,
    base_language: Option<String>,
}

#[derive(sqlx::FromRow)]
struct CampaignRow {
    id: CampaignID,
    uuid: Uuid,
    name: String,
    group_id: GroupID,
    points: Json<Vec<PointJson>>,
}

/// Loads the active campaigns of an org with their active points.
pub async fn load_campaigns(pool: &PgPool, org_id: OrgID) -> Result<Vec<Campaign>> {
    let rows = sqlx::query_as::<_, CampaignRow>(
        r#"
        SELECT c.id, c.uuid, c.name, c.group_id, COALESCE(
            jsonb_agg(jsonb_build_object(
                'id', p.id, 'uuid', p.uuid, 'point_type', p.point_type, 'status', p.status,
                'fire_version', p.fire_version, 'start_mode', p.start_mode,
                'relative_to_id', p.relative_to_id, 'relative_to_key', f.key,
                'offset', p."offset", 'unit', p.unit, 'delivery_hour', p.delivery_hour,
                'flow_id', p.flow_id, 'translations', p.translations, 'base_language', p.base_language
            ) ORDER BY p.id) FILTER (WHERE p.id IS NOT NULL),
            '[]'::jsonb
        ) AS points
        FROM campaigns c
        LEFT JOIN campaign_points p ON p.campaign_id = c.id AND p.is_active
        LEFT JOIN contact_fields f ON f.id = p.relative_to_id
        WHERE c.org_id = $1 AND c.is_active AND NOT c.is_archived
        GROUP BY c.id
        ORDER BY c.id
        "#,
    )
    .bind(org_id)
    .fetch_all(pool)
    .await?;

    let mut campaigns = Vec::with_capacity(rows.len());
    for row in rows {
        let mut points = Vec::with_capacity(row.points.0.len());
        for p in row.points.0 {
            let (Some(point_type), Some(status), Some(start_mode), Some(unit)) = (
                PointType::from_code(&p.point_type),
                PointStatus::from_code(&p.status),
                StartMode::from_code(&p.start_mode),
                OffsetUnit::from_code(&p.unit),
            ) else {
                return Err(crate::error::CoreError::Invariant(format!(
                    "campaign point {} has unknown codes",
                    p.id
                )));
            };

            points.push(CampaignPoint {
                id: p.id,
                uuid: p.uuid,
                campaign_id: row.id,
                point_type,
                status,
                fire_version: p.fire_version,
                start_mode,
                relative_to: RelativeTo {
                    id: p.relative_to_id,
                    key: p.relative_to_key,
                },
                offset: p.offset,
                unit,
                delivery_hour: p.delivery_hour,
                flow_id: p.flow_id,
                translations: p.translations,
                base_language: p.base_language,
            });
        }

        campaigns.push(Campaign {
            id: row.id,
            uuid: row.uuid,
            name: row.name,
            group_id: row.group_id,
            points,
        });
    }

    Ok(campaigns)
}

/// Marks a point as ready once its fires have been backfilled.
pub async fn mark_point_ready(conn: &mut PgConnection, point_id: PointID) -> Result<()> {
    sqlx::query("UPDATE campaign_points SET status = 'R' WHERE id = $1")
        .bind(point_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// A point waiting for its fires to be backfilled, with what's needed to find its contacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct SchedulingPoint {
    pub point_id: PointID,
    pub org_id: OrgID,
    pub group_id: GroupID,
}

/// Claims the next point still being scheduled. The row stays locked until `conn`'s
/// transaction ends, so other workers skip it.
pub async fn claim_scheduling_point(conn: &mut PgConnection) -> Result<Option<SchedulingPoint>> {
    let point = sqlx::query_as::<_, SchedulingPoint>(
        r#"
        SELECT p.id AS point_id, c.org_id, c.group_id
        FROM campaign_points p
        JOIN campaigns c ON c.id = p.campaign_id
        WHERE p.status = 'S' AND p.is_active AND c.is_active AND NOT c.is_archived
        ORDER BY p.id
        LIMIT 1
        FOR UPDATE OF p SKIP LOCKED
        "#,
    )
    .fetch_optional(conn)
    .await?;

    Ok(point)
}

/// Backfills fires for every eligible member of the point's group, then marks it ready.
/// Fires left over from earlier versions of the point are deleted.
pub async fn schedule_point(
    conn: &mut PgConnection,
    org_id: OrgID,
    tz: Tz,
    point: &CampaignPoint,
    contacts: &[Contact],
) -> Result<usize> {
    contact_fire::delete_stale_point_fires(conn, point.id, point.fire_version).await?;

    let now = Utc::now();
    let fires: Vec<ContactFire> = contacts
        .iter()
        .filter(|c| c.status == ContactStatus::Active)
        .filter(|c| point.qualifies_by_field(c))
        .filter_map(|c| {
            point.schedule_for_contact(tz, now, c).map(|fire_on| {
                ContactFire::for_campaign(org_id, c.id, point.id, point.fire_version, fire_on)
            })
        })
        .collect();

    contact_fire::insert_contact_fires(conn, &fires).await?;
    mark_point_ready(conn, point.id).await?;

    Ok(fires.len())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn point(offset: i32, unit: OffsetUnit, delivery_hour: i32) -> CampaignPoint {
        CampaignPoint {
            id: PointID(1),
            uuid: Uuid::new_v4(),
            campaign_id: CampaignID(1),
            point_type: PointType::Flow,
            status: PointStatus::Ready,
            fire_version: 1,
            start_mode: StartMode::Interrupt,
            relative_to: RelativeTo {
                id: FieldID(1),
                key: "joined".to_string(),
            },
            offset,
            unit,
            delivery_hour,
            flow_id: FlowID(1),
            translations: None,
            base_language: None,
        }
    }

    fn eastern(s: &str) -> DateTime<Utc> {
        let tz: Tz = "US/Eastern".parse().unwrap();
        let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap();
        tz.from_local_datetime(&naive).earliest().unwrap().with_timezone(&Utc)
    }

    fn past() -> DateTime<Utc> {
        eastern("2020-01-01 00:00:00")
    }

    #[test]
    fn test_schedule_across_dst_fall_back() {
        let tz: Tz = "US/Eastern".parse().unwrap();
        let start = eastern("2029-11-03 00:30:00");
        let scheduled = point(2, OffsetUnit::Days, NO_DELIVERY_HOUR)
            .schedule_for_time(tz, past(), start)
            .unwrap();

        assert_eq!(scheduled, eastern("2029-11-05 00:30:00"));
        assert_eq!(scheduled - start, Duration::hours(49));
    }

    #[test]
    fn test_schedule_across_dst_spring_forward() {
        let tz: Tz = "US/Eastern".parse().unwrap();
        let start = eastern("2029-03-10 00:30:00");
        let scheduled = point(2, OffsetUnit::Days, NO_DELIVERY_HOUR)
            .schedule_for_time(tz, past(), start)
            .unwrap();

        assert_eq!(scheduled, eastern("2029-03-12 00:30:00"));
        assert_eq!(scheduled - start, Duration::hours(47));
    }

    #[test]
    fn test_schedule_with_delivery_hour() {
        let tz: Tz = "US/Eastern".parse().unwrap();
        let start = eastern("2029-06-01 01:58:00");
        let scheduled = point(2, OffsetUnit::Weeks, 14)
            .schedule_for_time(tz, past(), start)
            .unwrap();

        assert_eq!(scheduled, eastern("2029-06-15 14:00:00"));
    }

    #[test]
    fn test_schedule_rounds_up_to_minute_and_fixed_units() {
        let tz: Tz = "US/Eastern".parse().unwrap();
        let start = eastern("2029-11-04 00:30:10");

        // hours are fixed durations even across the fall back
        let scheduled = point(3, OffsetUnit::Hours, NO_DELIVERY_HOUR)
            .schedule_for_time(tz, past(), start)
            .unwrap();
        assert_eq!(scheduled, eastern("2029-11-04 00:31:00") + Duration::hours(3));

        let scheduled = point(-10, OffsetUnit::Minutes, NO_DELIVERY_HOUR)
            .schedule_for_time(tz, past(), start)
            .unwrap();
        assert_eq!(scheduled, eastern("2029-11-04 00:21:00"));
    }

    #[test]
    fn test_schedule_in_past_is_none() {
        let tz: Tz = "US/Eastern".parse().unwrap();
        let start = eastern("2029-11-03 00:30:00");
        let now = eastern("2029-11-10 00:00:00");
        assert!(
            point(2, OffsetUnit::Days, NO_DELIVERY_HOUR)
                .schedule_for_time(tz, now, start)
                .is_none()
        );
    }

    #[test]
    fn test_find_point() {
        let mut p2 = point(1, OffsetUnit::Days, NO_DELIVERY_HOUR);
        p2.id = PointID(2);
        let campaigns = vec![Campaign {
            id: CampaignID(5),
            uuid: Uuid::new_v4(),
            name: "Reminders".to_string(),
            group_id: GroupID(3),
            points: vec![point(1, OffsetUnit::Days, NO_DELIVERY_HOUR), p2],
        }];

        let (campaign, p) = find_point(&campaigns, PointID(2)).unwrap();
        assert_eq!(campaign.id, CampaignID(5));
        assert_eq!(p.id, PointID(2));
        assert!(find_point(&campaigns, PointID(9)).is_none());
        assert_eq!(campaigns_for_group(&campaigns, GroupID(3)).count(), 1);
        assert_eq!(campaigns_for_group(&campaigns, GroupID(4)).count(), 0);
    }
}
