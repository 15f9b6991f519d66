use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How requests against a scope get authorized.
///
/// Only `Auto` proceeds synchronously through the proxy; `Manual` and
/// `Pending` both route callers to the pending-request queue, `Pending`
/// marking a scope whose first approval is still outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    Auto,
    Manual,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    BearerToken,
    CustomHeader,
    Cookie,
    BasicAuth,
}

impl CredentialType {
    pub fn label(&self) -> &'static str {
        match self {
            CredentialType::BearerToken => "bearer_token",
            CredentialType::CustomHeader => "custom_header",
            CredentialType::Cookie => "cookie",
            CredentialType::BasicAuth => "basic_auth",
        }
    }
}

/// One configured credential scope: which upstream hosts it may reach, how
/// its secret is attached, and how requests against it are approved.
///
/// `priority` is 1-based and kept dense by the store; array order in the
/// store always equals priority order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopePolicy {
    pub id: String,
    pub service_name: String,
    pub scope: String,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    pub approval_mode: ApprovalMode,
    #[serde(default)]
    pub has_secret: bool,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default)]
    pub priority: u32,
    pub credential_type: CredentialType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_header_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred_for: Vec<String>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<i64>,
}

fn default_true() -> bool {
    true
}

impl ScopePolicy {
    /// A fresh policy defaults to manual approval; granting automatic access
    /// is an explicit operator decision.
    pub fn new(
        service_name: impl Into<String>,
        scope: impl Into<String>,
        credential_type: CredentialType,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            service_name: service_name.into(),
            scope: scope.into(),
            allowed_domains: Vec::new(),
            approval_mode: ApprovalMode::Manual,
            has_secret: false,
            is_enabled: true,
            priority: 0,
            credential_type,
            custom_header_name: None,
            preferred_for: Vec::new(),
            created_at: Utc::now().timestamp_millis(),
            last_used_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Approved,
    Denied,
    Error,
}

/// One line of the append-only audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    pub ts_ms: i64,
    pub scope: String,
    pub requesting_host: String,
    pub reason: String,
    pub result: AuditResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditEntry {
    pub fn new(
        scope: impl Into<String>,
        requesting_host: impl Into<String>,
        reason: impl Into<String>,
        result: AuditResult,
        detail: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ts_ms: Utc::now().timestamp_millis(),
            scope: scope.into(),
            requesting_host: requesting_host.into(),
            reason: reason.into(),
            result,
            detail,
        }
    }
}

/// A request parked for operator review. Settling it (approve or deny)
/// removes it and synthesizes the matching audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub id: String,
    pub scope: String,
    pub requesting_host: String,
    pub reason: String,
    pub requested_at: i64,
}

impl PendingRequest {
    pub fn new(
        scope: impl Into<String>,
        requesting_host: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            scope: scope.into(),
            requesting_host: requesting_host.into(),
            reason: reason.into(),
            requested_at: Utc::now().timestamp_millis(),
        }
    }
}

/// Wire shape accepted by POST /proxy and the keygate_proxy tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRequest {
    pub scope: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Wire shape returned for every proxy call, success or failure. The broker
/// always answers; transport-level errors surface as `statusCode` 502 with
/// `error` set, never as a dropped connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProxyResponse {
    pub fn failure(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code,
            headers: HashMap::new(),
            body: None,
            error: Some(message.into()),
        }
    }
}

/// Usability of a scope's credential, derived from its most recent exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Dead,
    Unreachable,
    Unknown,
}
