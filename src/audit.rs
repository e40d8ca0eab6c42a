//! Audit attestations
//!
//! One record per gated call, attached to the response metadata when audit
//! is enabled. Emission only; delivery (webhooks, digests) is the host's
//! concern.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Ok,
    Denied,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub audit_id: String,
    pub gate_id: String,
    pub tool: String,
    pub permission: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    pub status: AuditStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denial_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
}

impl AuditRecord {
    pub fn new(gate_id: &str, tool: &str, permission: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            audit_id: format!("aud_{}", Uuid::new_v4().simple()),
            gate_id: gate_id.to_string(),
            tool: tool.to_string(),
            permission: permission.to_string(),
            session_id: None,
            subject_id: None,
            status: AuditStatus::Ok,
            denial_code: None,
            duration_ms: None,
            timestamp,
            inputs: None,
            outputs: None,
        }
    }

    pub fn denied(mut self, code: &str) -> Self {
        self.status = AuditStatus::Denied;
        self.denial_code = Some(code.to_string());
        self
    }

    pub fn errored(mut self) -> Self {
        self.status = AuditStatus::Error;
        self
    }
}
