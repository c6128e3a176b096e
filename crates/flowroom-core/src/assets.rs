// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-org asset snapshots.
//!
//! An [`OrgAssets`] is an immutable snapshot of everything about an org that changes rarely.
//! The [`AssetCache`] hands out shared snapshots and replaces them wholesale: a refresh builds
//! a new snapshot off to the side, copying the parts that weren't asked for from the previous
//! one, then swaps it in. Readers holding the old snapshot keep using it until they drop it.

use std::collections::HashMap;
use std::ops::BitOr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::models::campaign::{self, Campaign, CampaignPoint};
use crate::models::channel::{self, Channel};
use crate::models::classifier::{self, Classifier, Llm};
use crate::models::field::{self, Field};
use crate::models::flow::{self, Flow};
use crate::models::group::{self, Group};
use crate::models::ids::{ChannelID, FieldID, FlowID, GroupID, LabelID, OptInID, OrgID, PointID, TemplateID, TopicID, UserID};
use crate::models::label::{self, Label};
use crate::models::location::{self, Location};
use crate::models::optin::{self, OptIn};
use crate::models::org::{self, Org, User};
use crate::models::template::{self, Template};
use crate::models::topic::{self, Topic};

/// Which parts of a snapshot to reload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Refresh(u32);

impl Refresh {
    pub const NONE: Refresh = Refresh(0);
    pub const ORG: Refresh = Refresh(1 << 0);
    pub const CHANNELS: Refresh = Refresh(1 << 1);
    pub const FIELDS: Refresh = Refresh(1 << 2);
    pub const GROUPS: Refresh = Refresh(1 << 3);
    pub const FLOWS: Refresh = Refresh(1 << 4);
    pub const CAMPAIGNS: Refresh = Refresh(1 << 5);
    pub const TEMPLATES: Refresh = Refresh(1 << 6);
    pub const TOPICS: Refresh = Refresh(1 << 7);
    pub const USERS: Refresh = Refresh(1 << 8);
    pub const LABELS: Refresh = Refresh(1 << 9);
    pub const CLASSIFIERS: Refresh = Refresh(1 << 10);
    pub const LLMS: Refresh = Refresh(1 << 11);
    pub const OPTINS: Refresh = Refresh(1 << 12);
    pub const LOCATIONS: Refresh = Refresh(1 << 13);
    pub const ALL: Refresh = Refresh((1 << 14) - 1);

    pub fn contains(self, other: Refresh) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Refresh {
    type Output = Refresh;

    fn bitor(self, rhs: Refresh) -> Refresh {
        Refresh(self.0 | rhs.0)
    }
}

/// An immutable snapshot of an org's assets.
#[derive(Debug, Clone)]
pub struct OrgAssets {
    loaded_on: Instant,
    org: Arc<Org>,
    users: Arc<Vec<User>>,
    channels: Arc<Vec<Channel>>,
    fields: Arc<Vec<Field>>,
    groups: Arc<Vec<Group>>,
    flows: Arc<Vec<Arc<Flow>>>,
    campaigns: Arc<Vec<Campaign>>,
    templates: Arc<Vec<Template>>,
    topics: Arc<Vec<Topic>>,
    labels: Arc<Vec<Label>>,
    classifiers: Arc<Vec<Classifier>>,
    llms: Arc<Vec<Llm>>,
    optins: Arc<Vec<OptIn>>,
    locations: Arc<Vec<Location>>,
}

impl OrgAssets {
    /// Loads a snapshot, reusing the parts of `prev` not flagged in `refresh`.
    pub async fn load(
        db: &PgPool,
        org_id: OrgID,
        prev: Option<&OrgAssets>,
        refresh: Refresh,
    ) -> Result<OrgAssets> {
        let refresh = if prev.is_none() { Refresh::ALL } else { refresh };
        let wants = |part: Refresh| refresh.contains(part);

        macro_rules! part {
            ($flag:expr, $field:ident, $load:expr) => {
                match prev {
                    Some(p) if !wants($flag) => p.$field.clone(),
                    _ => Arc::new($load.await?),
                }
            };
        }

        let org = match prev {
            Some(p) if !wants(Refresh::ORG) => p.org.clone(),
            _ => Arc::new(org::load_org(db, org_id).await?),
        };

        let flows = match prev {
            Some(p) if !wants(Refresh::FLOWS) => p.flows.clone(),
            _ => Arc::new(
                flow::load_flows(db, org_id)
                    .await?
                    .into_iter()
                    .map(Arc::new)
                    .collect(),
            ),
        };

        let assets = OrgAssets {
            loaded_on: Instant::now(),
            org,
            users: part!(Refresh::USERS, users, org::load_users(db, org_id)),
            channels: part!(Refresh::CHANNELS, channels, channel::load_channels(db, org_id)),
            fields: part!(Refresh::FIELDS, fields, field::load_fields(db, org_id)),
            groups: part!(Refresh::GROUPS, groups, group::load_groups(db, org_id)),
            flows,
            campaigns: part!(Refresh::CAMPAIGNS, campaigns, campaign::load_campaigns(db, org_id)),
            templates: part!(Refresh::TEMPLATES, templates, template::load_templates(db, org_id)),
            topics: part!(Refresh::TOPICS, topics, topic::load_topics(db, org_id)),
            labels: part!(Refresh::LABELS, labels, label::load_labels(db, org_id)),
            classifiers: part!(Refresh::CLASSIFIERS, classifiers, classifier::load_classifiers(db, org_id)),
            llms: part!(Refresh::LLMS, llms, classifier::load_llms(db, org_id)),
            optins: part!(Refresh::OPTINS, optins, optin::load_optins(db, org_id)),
            locations: part!(Refresh::LOCATIONS, locations, location::load_locations(db, org_id)),
        };

        Ok(assets)
    }

    pub fn org(&self) -> &Org {
        &self.org
    }

    pub fn org_id(&self) -> OrgID {
        self.org.id
    }

    pub fn tz(&self) -> Tz {
        self.org.tz()
    }

    /// The current date in the org's timezone.
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.tz()).date_naive()
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn user_by_id(&self, id: UserID) -> Option<&User> {
        self.users.iter().find(|u| u.id == id)
    }

    pub fn user_by_uuid(&self, uuid: Uuid) -> Option<&User> {
        self.users.iter().find(|u| u.uuid == uuid)
    }

    pub fn user_by_email(&self, email: &str) -> Option<&User> {
        self.users.iter().find(|u| u.email.eq_ignore_ascii_case(email))
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channel_by_id(&self, id: ChannelID) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == id)
    }

    pub fn channel_by_uuid(&self, uuid: Uuid) -> Option<&Channel> {
        self.channels.iter().find(|c| c.uuid == uuid)
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field_by_key(&self, key: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.key == key)
    }

    pub fn field_by_id(&self, id: FieldID) -> Option<&Field> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn group_by_id(&self, id: GroupID) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn group_by_uuid(&self, uuid: Uuid) -> Option<&Group> {
        self.groups.iter().find(|g| g.uuid == uuid)
    }

    pub fn flows(&self) -> &[Arc<Flow>] {
        &self.flows
    }

    pub fn flow_by_id(&self, id: FlowID) -> Option<Arc<Flow>> {
        self.flows.iter().find(|f| f.id == id).cloned()
    }

    pub fn flow_by_uuid(&self, uuid: Uuid) -> Option<Arc<Flow>> {
        self.flows.iter().find(|f| f.uuid == uuid).cloned()
    }

    /// Gets a flow by id, loading it from the database if it isn't active.
    ///
    /// Loaded flows are not added to the snapshot.
    pub async fn load_flow_by_id(&self, db: &PgPool, id: FlowID) -> Result<Arc<Flow>> {
        match self.flow_by_id(id) {
            Some(f) => Ok(f),
            None => Ok(Arc::new(flow::load_flow_by_id(db, self.org_id(), id).await?)),
        }
    }

    /// Gets a flow by UUID, loading it from the database if it isn't active.
    pub async fn load_flow_by_uuid(&self, db: &PgPool, uuid: Uuid) -> Result<Arc<Flow>> {
        match self.flow_by_uuid(uuid) {
            Some(f) => Ok(f),
            None => Ok(Arc::new(flow::load_flow_by_uuid(db, self.org_id(), uuid).await?)),
        }
    }

    pub fn campaigns(&self) -> &[Campaign] {
        &self.campaigns
    }

    pub fn campaign_point(&self, id: PointID) -> Option<(&Campaign, &CampaignPoint)> {
        campaign::find_point(&self.campaigns, id)
    }

    pub fn templates(&self) -> &[Template] {
        &self.templates
    }

    pub fn template_by_id(&self, id: TemplateID) -> Option<&Template> {
        self.templates.iter().find(|t| t.id == id)
    }

    pub fn template_by_uuid(&self, uuid: Uuid) -> Option<&Template> {
        self.templates.iter().find(|t| t.uuid == uuid)
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    pub fn topic_by_id(&self, id: TopicID) -> Option<&Topic> {
        self.topics.iter().find(|t| t.id == id)
    }

    pub fn topic_by_uuid(&self, uuid: Uuid) -> Option<&Topic> {
        self.topics.iter().find(|t| t.uuid == uuid)
    }

    /// The org's default ticket topic.
    pub fn default_topic(&self) -> Result<&Topic> {
        self.topics
            .iter()
            .find(|t| t.is_default)
            .ok_or_else(|| CoreError::Invariant(format!("org {} has no default topic", self.org_id())))
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub fn label_by_id(&self, id: LabelID) -> Option<&Label> {
        self.labels.iter().find(|l| l.id == id)
    }

    pub fn label_by_uuid(&self, uuid: Uuid) -> Option<&Label> {
        self.labels.iter().find(|l| l.uuid == uuid)
    }

    pub fn classifiers(&self) -> &[Classifier] {
        &self.classifiers
    }

    pub fn classifier_by_uuid(&self, uuid: Uuid) -> Option<&Classifier> {
        self.classifiers.iter().find(|c| c.uuid == uuid)
    }

    pub fn llms(&self) -> &[Llm] {
        &self.llms
    }

    pub fn llm_by_uuid(&self, uuid: Uuid) -> Option<&Llm> {
        self.llms.iter().find(|l| l.uuid == uuid)
    }

    pub fn optins(&self) -> &[OptIn] {
        &self.optins
    }

    pub fn optin_by_id(&self, id: OptInID) -> Option<&OptIn> {
        self.optins.iter().find(|o| o.id == id)
    }

    pub fn optin_by_uuid(&self, uuid: Uuid) -> Option<&OptIn> {
        self.optins.iter().find(|o| o.uuid == uuid)
    }

    pub fn locations(&self) -> &[Location] {
        &self.locations
    }

    fn age(&self) -> Duration {
        self.loaded_on.elapsed()
    }

    /// An empty snapshot for a UTC org, for unit tests.
    #[cfg(test)]
    pub(crate) fn for_tests() -> OrgAssets {
        use crate::models::org::DateFormat;

        OrgAssets {
            loaded_on: Instant::now(),
            org: Arc::new(Org {
                id: OrgID(1),
                uuid: Uuid::new_v4(),
                name: "UNICEF".to_string(),
                parent_id: OrgID(0),
                is_suspended: false,
                timezone: "UTC".to_string(),
                date_format: DateFormat::DayFirst,
                default_country: Some("US".to_string()),
                flow_languages: vec!["eng".to_string(), "kin".to_string()],
                redaction_policy: "none".to_string(),
                smtp_url: None,
                config: sqlx::types::Json(serde_json::json!({})),
                created_on: Utc::now(),
            }),
            users: Arc::default(),
            channels: Arc::default(),
            fields: Arc::default(),
            groups: Arc::default(),
            flows: Arc::default(),
            campaigns: Arc::default(),
            templates: Arc::default(),
            topics: Arc::default(),
            labels: Arc::default(),
            classifiers: Arc::default(),
            llms: Arc::default(),
            optins: Arc::default(),
            locations: Arc::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_flows(mut self, flows: Vec<Flow>) -> OrgAssets {
        self.flows = Arc::new(flows.into_iter().map(Arc::new).collect());
        self
    }

    #[cfg(test)]
    pub(crate) fn with_groups(mut self, groups: Vec<Group>) -> OrgAssets {
        self.groups = Arc::new(groups);
        self
    }

    #[cfg(test)]
    pub(crate) fn with_channels(mut self, channels: Vec<Channel>) -> OrgAssets {
        self.channels = Arc::new(channels);
        self
    }

    #[cfg(test)]
    pub(crate) fn with_fields(mut self, fields: Vec<Field>) -> OrgAssets {
        self.fields = Arc::new(fields);
        self
    }
}

/// Process-wide cache of org snapshots.
pub struct AssetCache {
    ttl: Duration,
    orgs: RwLock<HashMap<OrgID, Arc<OrgAssets>>>,
}

impl AssetCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            orgs: RwLock::new(HashMap::new()),
        }
    }

    /// Gets the snapshot for an org, reloading the flagged parts first if `refresh` isn't
    /// empty, or everything if the cached snapshot has expired.
    pub async fn get(&self, db: &PgPool, org_id: OrgID, refresh: Refresh) -> Result<Arc<OrgAssets>> {
        let cached = self.orgs.read().await.get(&org_id).cloned();

        let prev = match cached {
            Some(oa) if oa.age() < self.ttl => {
                if refresh.is_empty() {
                    return Ok(oa);
                }
                Some(oa)
            }
            _ => None,
        };

        let oa = Arc::new(OrgAssets::load(db, org_id, prev.as_deref(), refresh).await?);
        debug!(org_id = %org_id, partial = prev.is_some(), "Loaded org assets");

        self.orgs.write().await.insert(org_id, oa.clone());
        Ok(oa)
    }

    /// Drops the cached snapshot for an org.
    pub async fn evict(&self, org_id: OrgID) {
        self.orgs.write().await.remove(&org_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_flags() {
        let r = Refresh::FLOWS | Refresh::CAMPAIGNS;
        assert!(r.contains(Refresh::FLOWS));
        assert!(r.contains(Refresh::CAMPAIGNS));
        assert!(!r.contains(Refresh::GROUPS));
        assert!(!r.is_empty());
        assert!(Refresh::NONE.is_empty());
        assert!(Refresh::ALL.contains(Refresh::LOCATIONS | Refresh::ORG));
    }
}
