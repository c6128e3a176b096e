// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Channel logs: the HTTP exchanges and errors of an interaction with a channel's provider.
//!
//! Logs live in a key-value store rather than Postgres. Each log is one item partitioned by
//! channel and hour, sorted by time. Payloads over [`COMPRESSION_THRESHOLD`] bytes are
//! gzipped into `DataGZ` and the plain `Data` map is left empty.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::channel::{Channel, LogPolicy};
use super::http_log::HttpTrace;
use super::ids::{ChannelID, OrgID};
use crate::error::{CoreError, Result};

/// Payloads larger than this many bytes are compressed.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// What a channel log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelLogType {
    MsgSend,
    MsgStatus,
    MsgReceive,
    EventReceive,
    IvrStart,
    IvrIncoming,
    IvrCallback,
    IvrStatus,
    IvrHangup,
    AttachmentFetch,
    TokenRefresh,
    WebhookVerify,
}

/// An error reported by a channel interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelError {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext_code: Option<String>,
    pub message: String,
}

impl ChannelError {
    pub fn new(code: &str, ext_code: Option<&str>, message: &str) -> Self {
        Self {
            code: code.to_string(),
            ext_code: ext_code.map(str::to_string),
            message: message.to_string(),
        }
    }
}

/// A log being built up during an interaction with a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelLog {
    pub uuid: Uuid,
    pub log_type: ChannelLogType,
    pub channel_uuid: Uuid,
    pub channel_id: ChannelID,
    pub http_logs: Vec<HttpTrace>,
    pub errors: Vec<ChannelError>,
    pub elapsed_ms: i64,
    pub created_on: DateTime<Utc>,
    log_policy: LogPolicy,
    redact_values: Vec<String>,
    started: std::time::Instant,
}

impl ChannelLog {
    /// Starts a log for an interaction with the given channel. The channel's secrets are
    /// redacted from every trace added.
    pub fn new(log_type: ChannelLogType, channel: &Channel) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            log_type,
            channel_uuid: channel.uuid,
            channel_id: channel.id,
            http_logs: Vec::new(),
            errors: Vec::new(),
            elapsed_ms: 0,
            created_on: Utc::now(),
            log_policy: channel.log_policy,
            redact_values: channel.secret_values(),
            started: std::time::Instant::now(),
        }
    }

    pub fn add_trace(&mut self, mut trace: HttpTrace) {
        trace.redact(&self.redact_values);
        self.http_logs.push(trace);
    }

    pub fn add_error(&mut self, error: ChannelError) {
        self.errors.push(error);
    }

    pub fn is_error(&self) -> bool {
        !self.errors.is_empty() || self.http_logs.iter().any(HttpTrace::is_error)
    }

    /// Records how long the interaction took.
    pub fn end(&mut self) {
        self.elapsed_ms = self.started.elapsed().as_millis() as i64;
    }

    /// Whether the channel's log policy wants this log kept.
    pub fn should_persist(&self) -> bool {
        match self.log_policy {
            LogPolicy::None => false,
            LogPolicy::Errors => self.is_error(),
            LogPolicy::All => true,
        }
    }

    /// The partition key: channel and hour of creation.
    pub fn partition_key(&self) -> String {
        format!("cha#{}#{}", self.channel_uuid, self.created_on.format("%Y-%m-%dT%H"))
    }

    /// The sort key: creation time then log UUID.
    pub fn sort_key(&self) -> String {
        format!("{}#{}", self.created_on.format("%Y-%m-%dT%H:%M:%S%.3fZ"), self.uuid)
    }

    /// Encodes this log as a store item, expiring after `ttl` when given.
    pub fn to_item(&self, org_id: OrgID, ttl: Option<Duration>) -> Result<LogItem> {
        let payload = LogPayload {
            uuid: self.uuid,
            log_type: self.log_type,
            channel_id: self.channel_id,
            http_logs: self.http_logs.clone(),
            errors: self.errors.clone(),
            elapsed_ms: self.elapsed_ms,
            created_on: self.created_on,
        };
        let encoded = serde_json::to_vec(&payload)?;

        let (data, data_gz) = if encoded.len() > COMPRESSION_THRESHOLD {
            (serde_json::Map::new(), Some(gzip(&encoded)?))
        } else {
            match serde_json::to_value(&payload)? {
                serde_json::Value::Object(map) => (map, None),
                _ => return Err(CoreError::Invariant("channel log payload isn't an object".to_string())),
            }
        };

        Ok(LogItem {
            pk: self.partition_key(),
            sk: self.sort_key(),
            org_id,
            ttl: ttl.map(|t| (self.created_on + chrono::Duration::seconds(t.as_secs() as i64)).timestamp()),
            data,
            data_gz,
        })
    }
}

/// The stored form of a log's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPayload {
    pub uuid: Uuid,
    #[serde(rename = "type")]
    pub log_type: ChannelLogType,
    pub channel_id: ChannelID,
    #[serde(default)]
    pub http_logs: Vec<HttpTrace>,
    #[serde(default)]
    pub errors: Vec<ChannelError>,
    pub elapsed_ms: i64,
    pub created_on: DateTime<Utc>,
}

/// A channel log as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogItem {
    #[serde(rename = "PK")]
    pub pk: String,
    #[serde(rename = "SK")]
    pub sk: String,
    #[serde(rename = "OrgID")]
    pub org_id: OrgID,
    #[serde(rename = "TTL", default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    #[serde(rename = "Data", default)]
    pub data: serde_json::Map<String, serde_json::Value>,
    #[serde(rename = "DataGZ", default, skip_serializing_if = "Option::is_none")]
    pub data_gz: Option<Vec<u8>>,
}

impl LogItem {
    /// Decodes the payload, from `DataGZ` when present and `Data` otherwise.
    pub fn payload(&self) -> Result<LogPayload> {
        match &self.data_gz {
            Some(gz) => Ok(serde_json::from_slice(&gunzip(gz)?)?),
            None => Ok(serde_json::from_value(serde_json::Value::Object(self.data.clone()))?),
        }
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| CoreError::Storage(format!("error compressing channel log: {}", e)))
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoded = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut decoded)
        .map_err(|e| CoreError::Storage(format!("error decompressing channel log: {}", e)))?;
    Ok(decoded)
}

/// Where channel logs are kept.
#[async_trait]
pub trait ChannelLogStore: Send + Sync {
    async fn put_items(&self, items: Vec<LogItem>) -> Result<()>;

    async fn get_item(&self, pk: &str, sk: &str) -> Result<Option<LogItem>>;
}

/// Writes the logs that their channels' log policies want kept. Returns how many were written.
pub async fn write_channel_logs(
    store: &dyn ChannelLogStore,
    org_id: OrgID,
    logs: &[ChannelLog],
    ttl: Duration,
) -> Result<usize> {
    let items = logs
        .iter()
        .filter(|l| l.should_persist())
        .map(|l| l.to_item(org_id, Some(ttl)))
        .collect::<Result<Vec<_>>>()?;
    let count = items.len();

    if count > 0 {
        store.put_items(items).await?;
    }

    debug!(org_id = %org_id, written = count, skipped = logs.len() - count, "Wrote channel logs");
    Ok(count)
}

/// Keeps log items in a map.
#[derive(Default)]
pub struct MemoryLogStore {
    items: RwLock<HashMap<(String, String), LogItem>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}

#[async_trait]
impl ChannelLogStore for MemoryLogStore {
    async fn put_items(&self, items: Vec<LogItem>) -> Result<()> {
        let mut stored = self.items.write().await;
        for item in items {
            stored.insert((item.pk.clone(), item.sk.clone()), item);
        }
        Ok(())
    }

    async fn get_item(&self, pk: &str, sk: &str) -> Result<Option<LogItem>> {
        Ok(self
            .items
            .read()
            .await
            .get(&(pk.to_string(), sk.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::channel::tests::channel;
    use crate::models::http_log::CallStatus;
    use chrono::TimeZone;

    fn trace(url: &str, response: &str) -> HttpTrace {
        HttpTrace {
            url: url.to_string(),
            status: CallStatus::Success,
            status_code: 200,
            request: format!("POST {} HTTP/1.1\r\n\r\n", url),
            response: response.to_string(),
            elapsed_ms: 12,
            retries: 0,
            created_on: Utc::now(),
        }
    }

    #[test]
    fn test_keys_and_redaction() {
        let ch = channel(1, "T", &["tel"], "SR");
        let mut log = ChannelLog::new(ChannelLogType::MsgSend, &ch);
        log.created_on = Utc.with_ymd_and_hms(2029, 11, 3, 4, 30, 15).unwrap();
        log.add_trace(trace("https://api.example.com/send?token=sesame", "ok"));

        assert_eq!(log.partition_key(), format!("cha#{}#2029-11-03T04", ch.uuid));
        assert_eq!(log.sort_key(), format!("2029-11-03T04:30:15.000Z#{}", log.uuid));
        assert_eq!(log.http_logs[0].url, "https://api.example.com/send?token=******");
        assert!(!log.is_error());
    }

    #[test]
    fn test_small_and_large_items() {
        let ch = channel(1, "T", &["tel"], "SR");
        let mut log = ChannelLog::new(ChannelLogType::MsgSend, &ch);
        log.add_trace(trace("https://api.example.com/send", "ok"));
        log.add_error(ChannelError::new("response_status_code", Some("400"), "bad request"));
        log.end();

        let item = log.to_item(OrgID(1), Some(Duration::from_secs(3600))).unwrap();
        assert!(item.data_gz.is_none());
        assert_eq!(item.data["type"], "msg_send");
        assert_eq!(item.ttl, Some(log.created_on.timestamp() + 3600));
        assert_eq!(item.payload().unwrap().errors.len(), 1);

        log.add_trace(trace("https://api.example.com/send", &"x".repeat(5000)));
        let item = log.to_item(OrgID(1), None).unwrap();
        assert!(item.data.is_empty());
        assert!(item.data_gz.as_ref().unwrap().len() < 5000);
        assert_eq!(item.ttl, None);

        let payload = item.payload().unwrap();
        assert_eq!(payload.uuid, log.uuid);
        assert_eq!(payload.http_logs.len(), 2);
        assert_eq!(payload.http_logs[1].response.len(), 5000);
    }

    #[tokio::test]
    async fn test_write_respects_policy() {
        let store = MemoryLogStore::new();

        let mut errors_only = channel(1, "T", &["tel"], "SR");
        errors_only.log_policy = LogPolicy::Errors;
        let all = channel(2, "T", &["tel"], "SR");

        let quiet = ChannelLog::new(ChannelLogType::MsgSend, &errors_only);
        let mut failed = ChannelLog::new(ChannelLogType::MsgSend, &errors_only);
        failed.add_error(ChannelError::new("timeout", None, "timed out"));
        let normal = ChannelLog::new(ChannelLogType::MsgStatus, &all);

        let written = write_channel_logs(&store, OrgID(1), &[quiet, failed.clone(), normal], Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(store.len().await, 2);

        let item = store
            .get_item(&failed.partition_key(), &failed.sort_key())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.payload().unwrap().errors[0].code, "timeout");
    }
}
