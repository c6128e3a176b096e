// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Working out who a flow start or broadcast goes to.

use std::collections::HashSet;

use chrono::{Duration, Utc};
use tracing::{debug, instrument, warn};

use crate::assets::OrgAssets;
use crate::error::Result;
use crate::models::broadcast::Broadcast;
use crate::models::contact::{self, ContactStatus};
use crate::models::flow_start::{Exclusions, FlowStart};
use crate::models::group;
use crate::models::ids::{ChannelID, ContactID, FlowID, GroupID, UserID, raw_ids};
use crate::runtime::Runtime;

/// The recipients of a start or broadcast as they were asked for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Audience {
    pub contact_ids: Vec<ContactID>,
    pub group_ids: Vec<GroupID>,
    pub urns: Vec<String>,
    pub query: Option<String>,
    pub exclude_group_ids: Vec<GroupID>,
    pub exclusions: Exclusions,
    pub create_contact: bool,
    /// The flow whose previous runs `started_previously` looks at.
    pub flow_id: FlowID,
}

impl From<&FlowStart> for Audience {
    fn from(s: &FlowStart) -> Self {
        Self {
            contact_ids: s.contact_ids.clone(),
            group_ids: s.group_ids.clone(),
            urns: s.urns.clone(),
            query: s.query.clone(),
            exclude_group_ids: s.exclude_group_ids.clone(),
            exclusions: s.exclusions.0.clone(),
            create_contact: s.create_contact,
            flow_id: s.flow_id,
        }
    }
}

impl From<&Broadcast> for Audience {
    fn from(b: &Broadcast) -> Self {
        Self {
            contact_ids: b.contact_ids.clone(),
            group_ids: b.group_ids.clone(),
            urns: b.urns.clone(),
            query: b.query.clone(),
            exclusions: b.exclusions.0.clone(),
            ..Default::default()
        }
    }
}

impl Audience {
    fn is_empty(&self) -> bool {
        self.contact_ids.is_empty()
            && self.group_ids.is_empty()
            && self.urns.is_empty()
            && self.query.is_none()
            && !self.create_contact
    }

    fn has_sql_exclusions(&self) -> bool {
        let e = &self.exclusions;
        e.non_active || e.in_a_flow || e.not_seen_since_days > 0
    }
}

/// Appends ids not already seen, keeping first-seen order.
fn union_into(ids: &mut Vec<ContactID>, seen: &mut HashSet<ContactID>, more: impl IntoIterator<Item = ContactID>) {
    for id in more {
        if seen.insert(id) {
            ids.push(id);
        }
    }
}

/// Resolves an audience to contact ids.
///
/// Contacts for URNs nobody owns are created, as is a new contact when `create_contact` is set.
/// Invalid URNs are skipped. Members of excluded groups are removed and then the exclusions are
/// applied. The result has no duplicates and keeps the order contacts were first found in.
#[instrument(skip_all, fields(org_id = %oa.org_id()))]
pub async fn resolve_recipients(
    rt: &Runtime,
    oa: &OrgAssets,
    audience: &Audience,
    user_id: UserID,
) -> Result<Vec<ContactID>> {
    if audience.is_empty() {
        return Ok(Vec::new());
    }

    let mut ids = Vec::new();
    let mut seen = HashSet::new();

    union_into(&mut ids, &mut seen, audience.contact_ids.iter().copied());

    if !audience.group_ids.is_empty() {
        let members = group::contact_ids_in_groups(&rt.readonly_db, &audience.group_ids).await?;
        union_into(&mut ids, &mut seen, members);
    }

    for urn in &audience.urns {
        match contact::get_or_create_contact(
            &rt.db,
            rt.engine.as_ref(),
            oa,
            std::slice::from_ref(urn),
            ChannelID(0),
        )
        .await
        {
            Ok((c, _)) => union_into(&mut ids, &mut seen, [c.id]),
            Err(e) if e.is_validation() => warn!(urn = %urn, error = %e, "Skipping invalid URN"),
            Err(e) => return Err(e),
        }
    }

    if audience.create_contact {
        let c = contact::create_contact(
            &rt.db,
            rt.engine.as_ref(),
            oa,
            user_id,
            None,
            None,
            ContactStatus::Active,
            &[],
        )
        .await?;
        union_into(&mut ids, &mut seen, [c.id]);
    }

    if let Some(query) = audience.query.as_deref().filter(|q| !q.is_empty()) {
        let matches = rt.search.contact_ids_for_query(oa, query, None).await?;
        union_into(&mut ids, &mut seen, matches);
    }

    if !audience.exclude_group_ids.is_empty() {
        let excluded: HashSet<ContactID> =
            group::contact_ids_in_groups(&rt.readonly_db, &audience.exclude_group_ids)
                .await?
                .into_iter()
                .collect();
        ids.retain(|id| !excluded.contains(id));
    }

    let ids = apply_exclusions(rt, audience, ids).await?;

    debug!(recipients = ids.len(), "Resolved audience");
    Ok(ids)
}

async fn apply_exclusions(rt: &Runtime, audience: &Audience, mut ids: Vec<ContactID>) -> Result<Vec<ContactID>> {
    if ids.is_empty() {
        return Ok(ids);
    }

    let exclusions = &audience.exclusions;

    if audience.has_sql_exclusions() {
        let cutoff = (exclusions.not_seen_since_days > 0)
            .then(|| Utc::now() - Duration::days(exclusions.not_seen_since_days as i64));

        let kept: HashSet<ContactID> = sqlx::query_scalar(
            r#"
            SELECT id FROM contacts
            WHERE id = ANY($1) AND is_active
              AND (NOT $2 OR status = 'A')
              AND (NOT $3 OR current_session_uuid IS NULL)
              AND ($4::TIMESTAMPTZ IS NULL OR last_seen_on IS NULL OR last_seen_on <= $4)
            "#,
        )
        .bind(raw_ids(&ids))
        .bind(exclusions.non_active)
        .bind(exclusions.in_a_flow)
        .bind(cutoff)
        .fetch_all(&rt.readonly_db)
        .await?
        .into_iter()
        .map(ContactID)
        .collect();

        ids.retain(|id| kept.contains(id));
    }

    if exclusions.started_previously && !audience.flow_id.is_nil() {
        let started = contact::contact_ids_started_flow(&rt.readonly_db, audience.flow_id, &ids).await?;
        ids.retain(|id| !started.contains(id));
    }

    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::broadcast::Translations;
    use crate::models::flow_start::StartType;
    use crate::models::ids::OrgID;

    #[test]
    fn test_union_keeps_first_seen_order() {
        let mut ids = Vec::new();
        let mut seen = HashSet::new();

        union_into(&mut ids, &mut seen, [ContactID(3), ContactID(1)]);
        union_into(&mut ids, &mut seen, [ContactID(1), ContactID(2), ContactID(3)]);

        assert_eq!(ids, vec![ContactID(3), ContactID(1), ContactID(2)]);
    }

    #[test]
    fn test_from_start_and_broadcast() {
        let start = FlowStart::new(OrgID(1), StartType::Manual, FlowID(4))
            .with_contact_ids(&[ContactID(5)])
            .with_query("age > 18")
            .with_exclusions(Exclusions {
                started_previously: true,
                ..Default::default()
            })
            .with_create_contact(true);

        let audience = Audience::from(&start);
        assert_eq!(audience.flow_id, FlowID(4));
        assert_eq!(audience.query.as_deref(), Some("age > 18"));
        assert!(audience.create_contact);
        assert!(!audience.has_sql_exclusions());
        assert!(!audience.is_empty());

        let broadcast = Broadcast::new(OrgID(1), Translations::new(), "eng").with_exclusions(Exclusions {
            not_seen_since_days: 90,
            ..Default::default()
        });
        let audience = Audience::from(&broadcast);
        assert!(audience.is_empty());
        assert!(audience.has_sql_exclusions());
        assert!(audience.flow_id.is_nil());
    }
}
