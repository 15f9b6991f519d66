use std::collections::HashMap;
use std::error::Error;

use base64::Engine;
use reqwest::header::HeaderMap;

use crate::model::{CredentialType, HealthState, ScopePolicy};

const DEFAULT_CUSTOM_HEADER: &str = "X-API-Key";

/// Subdomain-inclusive allowlist rule: the target host must equal an allowed
/// domain or end with `".{domain}"`. Arbitrarily deep subdomains match.
pub fn host_allowed(allowed_domains: &[String], host: &str) -> bool {
    let host = host.trim().to_ascii_lowercase();
    allowed_domains.iter().any(|domain| {
        let domain = domain.trim().to_ascii_lowercase();
        if domain.is_empty() {
            return false;
        }
        host == domain || host.ends_with(&format!(".{}", domain))
    })
}

/// Copy caller headers verbatim, except `Authorization` and `Cookie`: the
/// broker is the sole author of authentication headers, so an agent cannot
/// forge or override identity.
pub(super) fn sanitize_caller_headers(
    headers: Option<&HashMap<String, String>>,
) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Some(headers) = headers else {
        return out;
    };
    for (name, value) in headers {
        let lower = name.trim().to_ascii_lowercase();
        if lower.is_empty() || lower == "authorization" || lower == "cookie" {
            continue;
        }
        out.insert(name.trim().to_string(), value.clone());
    }
    out
}

pub(super) fn has_header(headers: &HashMap<String, String>, name: &str) -> bool {
    headers.keys().any(|k| k.eq_ignore_ascii_case(name))
}

/// Attach the retrieved secret according to the policy's credential type.
pub(super) fn inject_credential(
    policy: &ScopePolicy,
    secret: &str,
    headers: &mut HashMap<String, String>,
) {
    match policy.credential_type {
        CredentialType::BearerToken => {
            headers.insert("Authorization".to_string(), format!("Bearer {}", secret));
        }
        CredentialType::BasicAuth => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(secret);
            headers.insert("Authorization".to_string(), format!("Basic {}", encoded));
        }
        CredentialType::Cookie => {
            headers.insert("Cookie".to_string(), secret.to_string());
        }
        CredentialType::CustomHeader => {
            let name = policy
                .custom_header_name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CUSTOM_HEADER.to_string());
            headers.insert(name, secret.to_string());
        }
    }
}

/// Strip upstream headers that leak session state or credential hints back
/// to the agent.
pub(super) fn sanitize_response_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for (name, value) in headers {
        let lower = name.as_str().to_ascii_lowercase();
        if lower == "set-cookie" || lower == "www-authenticate" {
            continue;
        }
        if let Ok(value) = value.to_str() {
            out.insert(name.as_str().to_string(), value.to_string());
        }
    }
    out
}

pub(super) fn describe_reqwest_error(error: &reqwest::Error) -> String {
    let mut message = error.to_string();
    let mut current: Option<&(dyn Error + 'static)> = error.source();
    while let Some(source) = current {
        message.push_str(": ");
        message.push_str(&source.to_string());
        current = source.source();
    }
    message
}

// 429 bodies that speak of quota or billing mean the key itself is spent;
// a plain rate limit means the key is still good.
const QUOTA_NEEDLES: &[&str] = &["quota", "billing", "exceeded", "limit reached", "limit-reached"];

/// Pure classification of a credential's usability from an HTTP exchange.
pub fn classify_health(status: u16, body: Option<&str>) -> HealthState {
    match status {
        200..=299 => HealthState::Healthy,
        401 | 402 | 403 => HealthState::Dead,
        404 => HealthState::Healthy,
        429 => {
            let body = body.unwrap_or_default().to_ascii_lowercase();
            if QUOTA_NEEDLES.iter().any(|needle| body.contains(needle)) {
                HealthState::Dead
            } else {
                HealthState::Healthy
            }
        }
        500..=599 => HealthState::Unreachable,
        _ => HealthState::Unreachable,
    }
}
