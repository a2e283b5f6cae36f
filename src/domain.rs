//! Core data model (spec §3.1): the entities that flow through every
//! component of the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An opaque, JSON-compatible structured value, with object keys held in a
/// `BTreeMap` so canonicalization (spec §4.H) is a property of the type
/// itself rather than a serialization-time concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DetailsValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<DetailsValue>),
    Object(BTreeMap<String, DetailsValue>),
}

impl Default for DetailsValue {
    fn default() -> Self {
        DetailsValue::Object(BTreeMap::new())
    }
}

impl From<serde_json::Value> for DetailsValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => DetailsValue::Null,
            serde_json::Value::Bool(b) => DetailsValue::Bool(b),
            serde_json::Value::Number(n) => DetailsValue::Number(n),
            serde_json::Value::String(s) => DetailsValue::String(s),
            serde_json::Value::Array(a) => DetailsValue::Array(a.into_iter().map(Into::into).collect()),
            serde_json::Value::Object(o) => {
                DetailsValue::Object(o.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<DetailsValue> for serde_json::Value {
    fn from(v: DetailsValue) -> Self {
        match v {
            DetailsValue::Null => serde_json::Value::Null,
            DetailsValue::Bool(b) => serde_json::Value::Bool(b),
            DetailsValue::Number(n) => serde_json::Value::Number(n),
            DetailsValue::String(s) => serde_json::Value::String(s),
            DetailsValue::Array(a) => serde_json::Value::Array(a.into_iter().map(Into::into).collect()),
            DetailsValue::Object(o) => {
                serde_json::Value::Object(o.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Attempt,
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataClassification {
    Public,
    Internal,
    Confidential,
    Phi,
}

impl Default for DataClassification {
    fn default() -> Self {
        DataClassification::Internal
    }
}

/// The unit of work ingested by the pipeline (spec §3.1 `AuditEvent`).
///
/// `hash`/`hash_algorithm` are set once by the Integrity Verifier and must
/// not change afterward; everything else is caller-supplied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub tenant_id: String,
    pub principal_id: Option<String>,
    pub action: String,
    pub target_type: Option<String>,
    pub target_id: Option<String>,
    pub status: EventStatus,
    pub outcome_description: Option<String>,
    #[serde(default)]
    pub data_classification: DataClassification,
    #[serde(default = "default_retention_policy")]
    pub retention_policy: String,
    pub correlation_id: Option<String>,
    #[serde(default = "default_event_version")]
    pub event_version: String,
    #[serde(default)]
    pub details: DetailsValue,
    pub hash: Option<String>,
    pub hash_algorithm: Option<String>,
}

fn default_retention_policy() -> String {
    "standard".to_string()
}

fn default_event_version() -> String {
    "1.0".to_string()
}

impl AuditEvent {
    pub fn new(tenant_id: impl Into<String>, action: impl Into<String>, status: EventStatus) -> Self {
        Self {
            timestamp: truncate_to_millis(Utc::now()),
            tenant_id: tenant_id.into(),
            principal_id: None,
            action: action.into(),
            target_type: None,
            target_id: None,
            status,
            outcome_description: None,
            data_classification: DataClassification::default(),
            retention_policy: default_retention_policy(),
            correlation_id: None,
            event_version: default_event_version(),
            details: DetailsValue::default(),
            hash: None,
            hash_algorithm: None,
        }
    }
}

/// Truncate to millisecond precision, per spec §3.1.
pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    let millis = ts.timestamp_millis();
    DateTime::from_timestamp_millis(millis).unwrap_or(ts)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub name: String,
    pub retention_days: u32,
    pub archive_after_days: Option<u32>,
    pub classification: DataClassification,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VerificationStatus {
    Success,
    Failure,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityVerification {
    pub event_ref: i64,
    pub verified_at: DateTime<Utc>,
    pub status: VerificationStatus,
    pub computed_hash: String,
    pub expected_hash: Option<String>,
    pub verifier_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryHistoryEntry {
    pub attempt: usize,
    pub timestamp: DateTime<Utc>,
    pub error_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: Option<i64>,
    pub original_event: AuditEvent,
    pub failure_reason: String,
    pub failure_count: u32,
    pub first_failure_at: DateTime<Utc>,
    pub last_failure_at: DateTime<Utc>,
    pub original_job_id: String,
    pub original_queue_name: String,
    pub error_stack: Option<String>,
    pub retry_history: Vec<RetryHistoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionDescriptor {
    pub parent_table: String,
    pub partition_name: String,
    pub range_start_inclusive: DateTime<Utc>,
    pub range_end_exclusive: DateTime<Utc>,
    pub size_bytes: i64,
    pub approx_row_count: i64,
}
