// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retrying outgoing messages that never reached the courier.
//!
//! Messages left initializing past their next attempt, and resends still pending, are claimed
//! and pushed back onto their channels' queues. Claiming bumps their next attempt, so a message
//! that fails to publish again is picked up on a later poll.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::courier;
use crate::error::Result;
use crate::models::contact;
use crate::models::ids::{ContactID, MsgID, OrgID, UrnID};
use crate::models::msg::{self, Msg, MsgStatus, OutgoingMsg};
use crate::runtime::Runtime;

/// Message retrier configuration.
#[derive(Debug, Clone)]
pub struct MessageRetrierConfig {
    /// How often to look for messages to retry
    pub poll_interval: Duration,
    /// Maximum messages claimed per poll
    pub batch_size: i64,
}

impl Default for MessageRetrierConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            batch_size: 1000,
        }
    }
}

/// A claimed message and whether it was a resend.
struct Claimed {
    msg: Msg,
    is_resend: bool,
}

/// Groups claimed messages by org, keeping claim order within each.
fn group_by_org(claimed: Vec<Claimed>) -> BTreeMap<OrgID, Vec<Claimed>> {
    let mut by_org: BTreeMap<OrgID, Vec<Claimed>> = BTreeMap::new();
    for c in claimed {
        by_org.entry(c.msg.org_id).or_default().push(c);
    }
    by_org
}

/// Re-queues stalled outgoing messages as a background task.
pub struct MessageRetrier {
    rt: Runtime,
    config: MessageRetrierConfig,
    shutdown: Arc<Notify>,
}

impl MessageRetrier {
    pub fn new(rt: Runtime, config: MessageRetrierConfig) -> Self {
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

    /// Run the retrier loop.
    pub async fn run(self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Message retrier started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Message retrier shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.retry_messages().await {
                        error!(error = %e, "Failed to retry messages");
                    }
                }
            }
        }
    }

    /// Claims and re-queues one batch of messages. Returns the ids handed to the courier.
    pub async fn retry_messages(&self) -> Result<Vec<MsgID>> {
        let claimed = {
            let mut tx = self.rt.db.begin().await?;
            let msgs = msg::load_messages_for_retry(&mut tx, self.config.batch_size).await?;
            let ids: Vec<MsgID> = msgs.iter().map(|m| m.id).collect();
            msg::mark_messages_for_requeuing(&mut *tx, &ids).await?;
            tx.commit().await?;

            msgs.into_iter()
                .map(|m| Claimed {
                    is_resend: m.status == MsgStatus::Pending,
                    msg: m,
                })
                .collect::<Vec<_>>()
        };

        if claimed.is_empty() {
            debug!("No messages to retry");
            return Ok(Vec::new());
        }

        let total = claimed.len();
        let mut queued = Vec::new();

        for (org_id, msgs) in group_by_org(claimed) {
            match self.requeue_org_messages(org_id, msgs).await {
                Ok(ids) => queued.extend(ids),
                Err(e) => error!(org_id = %org_id, error = %e, "Failed to re-queue messages for org"),
            }
        }

        info!(claimed = total, queued = queued.len(), "Retried messages");
        Ok(queued)
    }

    async fn requeue_org_messages(&self, org_id: OrgID, claimed: Vec<Claimed>) -> Result<Vec<MsgID>> {
        let oa = self.rt.org_assets(org_id).await?;

        let urn_ids: Vec<UrnID> = claimed.iter().map(|c| c.msg.contact_urn_id).collect();
        let urns: HashMap<UrnID, _> = msg::load_urns(&self.rt.db, &urn_ids)
            .await?
            .into_iter()
            .map(|u| (u.id, u))
            .collect();

        let contact_ids: Vec<ContactID> = claimed.iter().map(|c| c.msg.contact_id).collect();
        let contact_uuids = contact::load_contact_uuids(&self.rt.db, &contact_ids).await?;

        let mut outgoing = Vec::with_capacity(claimed.len());
        for Claimed { mut msg, is_resend } in claimed {
            let Some(contact_uuid) = contact_uuids.get(&msg.contact_id).copied() else {
                warn!(msg_id = %msg.id, "Message contact no longer exists, not retrying");
                continue;
            };

            msg.status = MsgStatus::Queued;
            outgoing.push(OutgoingMsg {
                urn: urns.get(&msg.contact_urn_id).cloned(),
                channel: oa.channel_by_id(msg.channel_id).cloned(),
                contact_uuid,
                reply_to: None,
                is_resend,
                msg,
            });
        }

        let refs: Vec<&OutgoingMsg> = outgoing.iter().collect();
        let published = courier::queue_messages(&self.rt, &oa, &refs).await?;
        msg::mark_messages_queued(&self.rt.db, &published).await?;

        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::msg::new_incoming_ivr;
    use crate::models::ids::ChannelID;

    fn claimed(id: i64, org_id: i64, status: MsgStatus) -> Claimed {
        let mut msg = new_incoming_ivr(OrgID(org_id), ChannelID(1), ContactID(id), UrnID(id), "hi", &[]);
        msg.id = MsgID(id);
        msg.status = status;
        Claimed {
            is_resend: status == MsgStatus::Pending,
            msg,
        }
    }

    #[test]
    fn test_group_by_org() {
        let grouped = group_by_org(vec![
            claimed(1, 2, MsgStatus::Initializing),
            claimed(2, 1, MsgStatus::Pending),
            claimed(3, 2, MsgStatus::Pending),
        ]);

        assert_eq!(grouped.keys().copied().collect::<Vec<_>>(), vec![OrgID(1), OrgID(2)]);

        let org2: Vec<(MsgID, bool)> = grouped[&OrgID(2)].iter().map(|c| (c.msg.id, c.is_resend)).collect();
        assert_eq!(org2, vec![(MsgID(1), false), (MsgID(3), true)]);
    }
}
