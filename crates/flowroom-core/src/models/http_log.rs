// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP logs of calls to external services, and airtime transfers.
//!
//! Failures of external services never abort a sprint. They are written here and
//! reported back to the flow as the status of the event that made the call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use uuid::Uuid;

use super::ids::{AirtimeTransferID, ClassifierID, ContactID, FlowID, LlmID, OrgID};
use crate::error::Result;

/// Request and response bodies are cut to this many characters.
pub const MAX_BODY_CHARS: usize = 10_000;

/// Outcome of an HTTP call made by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    ResponseError,
    ConnectionError,
    SubscriberGone,
}

/// One HTTP request and its response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpTrace {
    pub url: String,
    pub status: CallStatus,
    #[serde(default)]
    pub status_code: i32,
    pub request: String,
    #[serde(default)]
    pub response: String,
    pub elapsed_ms: i32,
    #[serde(default)]
    pub retries: i32,
    pub created_on: DateTime<Utc>,
}

impl HttpTrace {
    pub fn is_error(&self) -> bool {
        self.status != CallStatus::Success
    }

    /// Replaces every occurrence of the given secrets with asterisks.
    pub fn redact(&mut self, secrets: &[String]) {
        for secret in secrets.iter().filter(|s| !s.is_empty()) {
            let mask = "*".repeat(secret.chars().count().min(8));
            self.url = self.url.replace(secret.as_str(), &mask);
            self.request = self.request.replace(secret.as_str(), &mask);
            self.response = self.response.replace(secret.as_str(), &mask);
        }
    }
}

/// What kind of service call a log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpLogType {
    WebhookCalled,
    ClassifierCalled,
    LlmCalled,
    AirtimeTransferred,
}

impl HttpLogType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebhookCalled => "webhook_called",
            Self::ClassifierCalled => "classifier_called",
            Self::LlmCalled => "llm_called",
            Self::AirtimeTransferred => "airtime_transferred",
        }
    }
}

/// A row in `http_logs`.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpLog {
    pub org_id: OrgID,
    pub log_type: HttpLogType,
    pub url: String,
    pub status_code: Option<i32>,
    pub request: String,
    pub response: Option<String>,
    pub is_error: bool,
    pub request_time: i32,
    pub num_retries: i32,
    pub flow_id: FlowID,
    pub classifier_id: ClassifierID,
    pub airtime_transfer_id: AirtimeTransferID,
    pub llm_id: LlmID,
    pub created_on: DateTime<Utc>,
}

impl HttpLog {
    pub fn from_trace(org_id: OrgID, log_type: HttpLogType, trace: &HttpTrace) -> Self {
        Self {
            org_id,
            log_type,
            url: trace.url.clone(),
            status_code: (trace.status_code > 0).then_some(trace.status_code),
            request: truncate(&trace.request),
            response: (!trace.response.is_empty()).then(|| truncate(&trace.response)),
            is_error: trace.is_error(),
            request_time: trace.elapsed_ms,
            num_retries: trace.retries,
            flow_id: FlowID(0),
            classifier_id: ClassifierID(0),
            airtime_transfer_id: AirtimeTransferID(0),
            llm_id: LlmID(0),
            created_on: trace.created_on,
        }
    }
}

fn truncate(s: &str) -> String {
    if s.chars().count() <= MAX_BODY_CHARS {
        s.to_string()
    } else {
        s.chars().take(MAX_BODY_CHARS).collect()
    }
}

/// Inserts HTTP logs.
pub async fn insert_http_logs(conn: &mut PgConnection, logs: &[HttpLog]) -> Result<()> {
    for log in logs {
        sqlx::query(
            r#"
            INSERT INTO http_logs (org_id, log_type, url, status_code, request, response, is_error,
                                   request_time, num_retries, flow_id, classifier_id,
                                   airtime_transfer_id, llm_id, created_on)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(log.org_id)
        .bind(log.log_type.as_str())
        .bind(&log.url)
        .bind(log.status_code)
        .bind(&log.request)
        .bind(&log.response)
        .bind(log.is_error)
        .bind(log.request_time)
        .bind(log.num_retries)
        .bind(log.flow_id)
        .bind(log.classifier_id)
        .bind(log.airtime_transfer_id)
        .bind(log.llm_id)
        .bind(log.created_on)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

code_enum! {
    pub enum AirtimeStatus {
        Success = ("S", "success"),
        Failed = ("F", "failed"),
    }
}

/// An airtime top-up sent to a contact, with the logs of the provider calls it took.
#[derive(Debug, Clone, PartialEq)]
pub struct AirtimeTransfer {
    pub id: AirtimeTransferID,
    pub uuid: Uuid,
    pub org_id: OrgID,
    pub status: AirtimeStatus,
    pub contact_id: ContactID,
    pub sender: Option<String>,
    pub recipient: String,
    pub currency: Option<String>,
    pub desired_amount: f64,
    pub actual_amount: f64,
    pub external_id: Option<String>,
    pub created_on: DateTime<Utc>,
    pub logs: Vec<HttpLog>,
}

/// Inserts airtime transfers and then their logs, linked by the new transfer ids.
pub async fn insert_airtime_transfers(
    conn: &mut PgConnection,
    transfers: &mut [AirtimeTransfer],
) -> Result<()> {
    for t in transfers.iter_mut() {
        let (id,): (AirtimeTransferID,) = sqlx::query_as(
            r#"
            INSERT INTO airtime_transfers (uuid, org_id, status, contact_id, sender, recipient,
                                           currency, desired_amount, actual_amount, external_id,
                                           created_on)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            "#,
        )
        .bind(t.uuid)
        .bind(t.org_id)
        .bind(t.status)
        .bind(t.contact_id)
        .bind(&t.sender)
        .bind(&t.recipient)
        .bind(&t.currency)
        .bind(t.desired_amount)
        .bind(t.actual_amount)
        .bind(&t.external_id)
        .bind(t.created_on)
        .fetch_one(&mut *conn)
        .await?;

        t.id = id;
        for log in t.logs.iter_mut() {
            log.airtime_transfer_id = id;
        }
        insert_http_logs(conn, &t.logs).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(status: CallStatus, status_code: i32) -> HttpTrace {
        HttpTrace {
            url: "https://api.example.com/hook?key=sesame".to_string(),
            status,
            status_code,
            request: "POST /hook?key=sesame HTTP/1.1\r\n\r\n".to_string(),
            response: String::new(),
            elapsed_ms: 120,
            retries: 1,
            created_on: Utc::now(),
        }
    }

    #[test]
    fn test_from_trace() {
        let log = HttpLog::from_trace(OrgID(1), HttpLogType::WebhookCalled, &trace(CallStatus::Success, 200));
        assert!(!log.is_error);
        assert_eq!(log.status_code, Some(200));
        assert_eq!(log.response, None);
        assert_eq!(log.num_retries, 1);

        let log = HttpLog::from_trace(OrgID(1), HttpLogType::WebhookCalled, &trace(CallStatus::ConnectionError, 0));
        assert!(log.is_error);
        assert_eq!(log.status_code, None);
        assert_eq!(log.log_type.as_str(), "webhook_called");
    }

    #[test]
    fn test_redact_and_truncate() {
        let mut t = trace(CallStatus::Success, 200);
        t.redact(&["sesame".to_string(), String::new()]);
        assert_eq!(t.url, "https://api.example.com/hook?key=******");
        assert!(!t.request.contains("sesame"));

        t.request = "x".repeat(MAX_BODY_CHARS + 5);
        let log = HttpLog::from_trace(OrgID(1), HttpLogType::ClassifierCalled, &t);
        assert_eq!(log.request.len(), MAX_BODY_CHARS);
    }
}
