// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The contact index, as far as audiences need it.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::assets::OrgAssets;
use crate::error::{CoreError, Result};
use crate::models::ids::{ContactID, OrgID};

/// Resolves contact queries to contact ids.
#[async_trait]
pub trait ContactSearch: Send + Sync {
    /// The ids of contacts matching a query, up to `limit` when it's given.
    async fn contact_ids_for_query(
        &self,
        oa: &OrgAssets,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ContactID>>;
}

/// A search with canned results per org and query.
#[derive(Default)]
pub struct StaticSearch {
    results: RwLock<HashMap<(OrgID, String), Vec<ContactID>>>,
}

impl StaticSearch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets what a query returns for an org.
    pub async fn set(&self, org_id: OrgID, query: &str, ids: &[ContactID]) {
        self.results
            .write()
            .await
            .insert((org_id, query.to_string()), ids.to_vec());
    }
}

#[async_trait]
impl ContactSearch for StaticSearch {
    async fn contact_ids_for_query(
        &self,
        oa: &OrgAssets,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ContactID>> {
        let results = self.results.read().await;
        let ids = results
            .get(&(oa.org_id(), query.to_string()))
            .ok_or_else(|| CoreError::Engine(format!("unsupported query: {}", query)))?;

        Ok(match limit {
            Some(limit) => ids.iter().take(limit).copied().collect(),
            None => ids.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_search() {
        let oa = OrgAssets::for_tests();
        let search = StaticSearch::new();
        search
            .set(oa.org_id(), "age > 18", &[ContactID(1), ContactID(2), ContactID(3)])
            .await;

        let ids = search.contact_ids_for_query(&oa, "age > 18", None).await.unwrap();
        assert_eq!(ids.len(), 3);

        let ids = search.contact_ids_for_query(&oa, "age > 18", Some(2)).await.unwrap();
        assert_eq!(ids, vec![ContactID(1), ContactID(2)]);

        let err = search.contact_ids_for_query(&oa, "name = bob", None).await.unwrap_err();
        assert_eq!(err.error_code(), "ENGINE_ERROR");
    }
}
