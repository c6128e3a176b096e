// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-contact advisory locks in Redis.
//!
//! Anything that loads or changes a contact holds its lock first. A lock is a key holding a
//! random value, so only the holder can release it, and it expires on its own if the holder
//! goes away.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::ids::{ContactID, OrgID};

/// How long a lock lives if it isn't released.
pub const LOCK_TTL: Duration = Duration::from_secs(300);

/// Pause between attempts on a lock that's held.
const RETRY_INTERVAL: Duration = Duration::from_millis(50);

const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// The Redis key of a contact's lock.
pub fn lock_key(org_id: OrgID, contact_id: ContactID) -> String {
    format!("lock:c:{}:{}", org_id, contact_id)
}

fn lock_value() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}

/// Locks held by this process, keyed by contact.
pub type ContactLocks = HashMap<ContactID, String>;

/// Releases whatever it holds if dropped before being disarmed, which is what happens when
/// the future acquiring locks is cancelled part way through.
struct ReleaseOnDrop {
    redis: redis::Client,
    org_id: OrgID,
    locks: ContactLocks,
}

impl ReleaseOnDrop {
    fn disarm(mut self) -> ContactLocks {
        std::mem::take(&mut self.locks)
    }
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        if self.locks.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let redis = self.redis.clone();
        let org_id = self.org_id;
        let locks = std::mem::take(&mut self.locks);
        handle.spawn(async move {
            if let Err(e) = unlock_contacts(&redis, org_id, &locks).await {
                warn!(error = %e, "Error releasing contact locks after cancellation");
            }
        });
    }
}

async fn try_lock(conn: &mut redis::aio::MultiplexedConnection, key: &str, value: &str) -> Result<bool> {
    let set: Option<String> = redis::cmd("SET")
        .arg(key)
        .arg(value)
        .arg("NX")
        .arg("PX")
        .arg(LOCK_TTL.as_millis() as u64)
        .query_async(conn)
        .await?;

    Ok(set.is_some())
}

/// Locks contacts, waiting up to `retry` for each lock that's already held.
///
/// Returns the locks acquired and the contacts that stayed locked by someone else. If this
/// future is dropped part way through, the locks it already acquired are released.
pub async fn lock_contacts(
    redis: &redis::Client,
    org_id: OrgID,
    contact_ids: &[ContactID],
    retry: Duration,
) -> Result<(ContactLocks, Vec<ContactID>)> {
    let mut conn = redis.get_multiplexed_async_connection().await?;
    let mut guard = ReleaseOnDrop {
        redis: redis.clone(),
        org_id,
        locks: HashMap::with_capacity(contact_ids.len()),
    };
    let mut skipped = Vec::new();

    for &contact_id in contact_ids {
        let key = lock_key(org_id, contact_id);
        let value = lock_value();
        let deadline = Instant::now() + retry;

        loop {
            if try_lock(&mut conn, &key, &value).await? {
                guard.locks.insert(contact_id, value);
                break;
            }
            if Instant::now() >= deadline {
                skipped.push(contact_id);
                break;
            }
            sleep(RETRY_INTERVAL).await;
        }
    }

    if !skipped.is_empty() {
        debug!(org_id = %org_id, skipped = skipped.len(), "Some contacts were already locked");
    }

    Ok((guard.disarm(), skipped))
}

/// Releases locks. Locks that expired, or were since taken by someone else, are left alone.
pub async fn unlock_contacts(redis: &redis::Client, org_id: OrgID, locks: &ContactLocks) -> Result<()> {
    if locks.is_empty() {
        return Ok(());
    }

    let mut conn = redis.get_multiplexed_async_connection().await?;
    let script = redis::Script::new(UNLOCK_SCRIPT);

    for (contact_id, value) in locks {
        let _: i64 = script
            .key(lock_key(org_id, *contact_id))
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key() {
        assert_eq!(lock_key(OrgID(1), ContactID(234)), "lock:c:1:234");
    }

    #[test]
    fn test_lock_values_differ() {
        let a = lock_value();
        assert_eq!(a.len(), 10);
        assert_ne!(a, lock_value());
    }
}
