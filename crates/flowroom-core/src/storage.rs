// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Object storage for session outputs and attachments.
//!
//! [`S3Store`] is the production implementation. [`MemoryStore`] keeps objects in a map and is
//! what tests use.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::models::ids::OrgID;

/// Who can read a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acl {
    Private,
    PublicRead,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores an object and returns its URL.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        body: Vec<u8>,
        acl: Acl,
    ) -> Result<String>;

    /// Fetches an object.
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// The URL an object is served from.
    fn url(&self, bucket: &str, key: &str) -> String;

    /// The key of an object given its URL, if it lives in `bucket`.
    fn key_for_url(&self, bucket: &str, url: &str) -> Option<String> {
        url.strip_prefix(&self.url(bucket, "")).map(str::to_string)
    }
}

/// An S3 (or S3 compatible) object store.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    endpoint: Option<String>,
}

impl S3Store {
    pub fn new(client: aws_sdk_s3::Client, endpoint: Option<String>) -> Self {
        Self { client, endpoint }
    }

    /// Builds a client from the standard AWS environment.
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let endpoint = config.endpoint_url().map(str::to_string);
        Self::new(aws_sdk_s3::Client::new(&config), endpoint)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        body: Vec<u8>,
        acl: Acl,
    ) -> Result<String> {
        let acl = match acl {
            Acl::Private => ObjectCannedAcl::Private,
            Acl::PublicRead => ObjectCannedAcl::PublicRead,
        };

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .acl(acl)
            .send()
            .await
            .map_err(|e| CoreError::Storage(format!("error putting s3://{}/{}: {}", bucket, key, e)))?;

        debug!(bucket = bucket, key = key, "Stored object");
        Ok(self.url(bucket, key))
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| CoreError::Storage(format!("error getting s3://{}/{}: {}", bucket, key, e)))?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| CoreError::Storage(format!("error reading s3://{}/{}: {}", bucket, key, e)))?;

        Ok(data.into_bytes().to_vec())
    }

    fn url(&self, bucket: &str, key: &str) -> String {
        match &self.endpoint {
            Some(endpoint) => format!("{}/{}/{}", endpoint.trim_end_matches('/'), bucket, key),
            None => format!("https://{}.s3.amazonaws.com/{}", bucket, key),
        }
    }
}

/// An in-memory object store.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<(String, String), (String, Vec<u8>, Acl)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The content type and ACL of a stored object.
    pub async fn metadata(&self, bucket: &str, key: &str) -> Option<(String, Acl)> {
        self.objects
            .read()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .map(|(ct, _, acl)| (ct.clone(), *acl))
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        body: Vec<u8>,
        acl: Acl,
    ) -> Result<String> {
        self.objects.write().await.insert(
            (bucket.to_string(), key.to_string()),
            (content_type.to_string(), body, acl),
        );
        Ok(self.url(bucket, key))
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .map(|(_, body, _)| body.clone())
            .ok_or_else(|| CoreError::Storage(format!("no such object {}/{}", bucket, key)))
    }

    fn url(&self, bucket: &str, key: &str) -> String {
        format!("memory://{}/{}", bucket, key)
    }
}

/// The key a session output is stored under.
pub fn session_path(
    org_id: OrgID,
    contact_uuid: Uuid,
    session_uuid: Uuid,
    output: &str,
    now: DateTime<Utc>,
) -> String {
    let contact = contact_uuid.to_string();
    let hash = hex::encode(Md5::digest(output.as_bytes()));

    format!(
        "orgs/{}/c/{}/{}/{}_session_{}_{}.json",
        org_id,
        &contact[..4],
        contact,
        now.format("%Y%m%dT%H%M%S%.3fZ"),
        session_uuid,
        hash
    )
}

/// The key an attachment is stored under. Long filenames are spread over two directory levels.
pub fn attachment_path(org_id: OrgID, filename: &str) -> String {
    let chars: Vec<char> = filename.chars().collect();
    if chars.len() > 8 {
        let first: String = chars[..4].iter().collect();
        let second: String = chars[4..8].iter().collect();
        format!("attachments/{}/{}/{}/{}", org_id, first, second, filename)
    } else {
        format!("attachments/{}/{}", org_id, filename)
    }
}

/// Uploads an attachment with public read access, returning its URL.
pub async fn upload_attachment(
    store: &dyn ObjectStore,
    bucket: &str,
    org_id: OrgID,
    filename: &str,
    content_type: &str,
    body: Vec<u8>,
) -> Result<String> {
    let key = attachment_path(org_id, filename);
    store.put(bucket, &key, content_type, body, Acl::PublicRead).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_session_path() {
        let contact = Uuid::parse_str("5ee4b0a2-52e4-4f49-8c8d-c6d0e7c3d83b").unwrap();
        let session = Uuid::parse_str("c0d2d3b8-8f0a-4b0a-a8ab-4a7c9c6cb9bb").unwrap();
        let now = Utc.with_ymd_and_hms(2029, 11, 3, 4, 30, 0).unwrap();

        let path = session_path(OrgID(12), contact, session, "{}", now);
        assert_eq!(
            path,
            "orgs/12/c/5ee4/5ee4b0a2-52e4-4f49-8c8d-c6d0e7c3d83b/20291103T043000.000Z_session_c0d2d3b8-8f0a-4b0a-a8ab-4a7c9c6cb9bb_99914b932bd37a50b983c5e7c90ae93b.json"
        );
    }

    #[test]
    fn test_attachment_path() {
        assert_eq!(
            attachment_path(OrgID(3), "f82a1d4c-photo.jpg"),
            "attachments/3/f82a/1d4c/f82a1d4c-photo.jpg"
        );
        assert_eq!(attachment_path(OrgID(3), "a.jpg"), "attachments/3/a.jpg");
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        let url = upload_attachment(&store, "attachments", OrgID(1), "selfie.png", "image/png", vec![1, 2, 3])
            .await
            .unwrap();

        assert_eq!(url, "memory://attachments/attachments/1/self/ie.p/selfie.png");
        let key = store.key_for_url("attachments", &url).unwrap();
        assert_eq!(store.get("attachments", &key).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(
            store.metadata("attachments", &key).await,
            Some(("image/png".to_string(), Acl::PublicRead))
        );
        assert!(store.get("attachments", "missing").await.is_err());
    }
}
