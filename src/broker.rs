use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::redirect::Policy as RedirectPolicy;

use crate::model::{AuditEntry, AuditResult, ProxyRequest, ProxyResponse};
use crate::secrets::SecretStore;
use crate::store::PolicyStore;

mod helpers;

pub use self::helpers::{classify_health, host_allowed};

pub const UPSTREAM_TIMEOUT_SECS: u64 = 30;

/// Why a request did not reach the upstream.
///
/// `Denied` is a policy decision (403) the user can change; `Errored` is a
/// broker infrastructure failure (500 for store/url problems, 502 for
/// transport failures) and deliberately distinct in the audit trail.
enum Halt {
    Denied { message: String },
    Errored { status: u16, message: String },
}

impl Halt {
    fn denied(message: impl Into<String>) -> Self {
        Halt::Denied {
            message: message.into(),
        }
    }

    fn errored(status: u16, message: impl Into<String>) -> Self {
        Halt::Errored {
            status,
            message: message.into(),
        }
    }
}

/// The authorization and credential-injection pipeline, shared by the raw
/// HTTP path and the JSON-RPC tool path.
pub struct Broker {
    store: Arc<PolicyStore>,
    secrets: Arc<dyn SecretStore>,
    client: Client,
}

impl Broker {
    pub fn new(store: Arc<PolicyStore>, secrets: Arc<dyn SecretStore>) -> Result<Self, String> {
        let client = Client::builder()
            .redirect(RedirectPolicy::none())
            .timeout(Duration::from_secs(UPSTREAM_TIMEOUT_SECS))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            store,
            secrets,
            client,
        })
    }

    /// Run one proxy request end to end. Every exit path, success or
    /// failure, records exactly one audit entry before returning.
    pub fn handle(&self, request: &ProxyRequest, requesting_host: &str) -> ProxyResponse {
        let reason = request
            .reason
            .clone()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "unspecified".to_string());

        match self.run_pipeline(request) {
            Ok(response) => {
                self.store.add_audit_entry(AuditEntry::new(
                    &request.scope,
                    requesting_host,
                    reason,
                    AuditResult::Approved,
                    Some(format!(
                        "Proxied {} {} → {}",
                        request.method.to_uppercase(),
                        request.url,
                        response.status_code
                    )),
                ));
                self.store.mark_used(&request.scope);
                response
            }
            Err(Halt::Denied { message }) => {
                self.store.add_audit_entry(AuditEntry::new(
                    &request.scope,
                    requesting_host,
                    reason,
                    AuditResult::Denied,
                    Some(message.clone()),
                ));
                ProxyResponse::failure(403, message)
            }
            Err(Halt::Errored { status, message }) => {
                self.store.add_audit_entry(AuditEntry::new(
                    &request.scope,
                    requesting_host,
                    reason,
                    AuditResult::Error,
                    Some(message.clone()),
                ));
                ProxyResponse::failure(status, message)
            }
        }
    }

    fn run_pipeline(&self, request: &ProxyRequest) -> Result<ProxyResponse, Halt> {
        // 1. Policy lookup.
        let policy = self
            .store
            .policy_for_scope(&request.scope)
            .ok_or_else(|| Halt::denied(format!("no policy for scope '{}'", request.scope)))?;

        // 2. Enabled check.
        if !policy.is_enabled {
            return Err(Halt::denied(format!(
                "scope '{}' is disabled",
                request.scope
            )));
        }

        // 3. Domain allowlist. A URL we cannot parse is an infrastructure
        // error, not a policy decision.
        let url = reqwest::Url::parse(request.url.trim())
            .map_err(|e| Halt::errored(500, format!("malformed target url: {}", e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| Halt::errored(500, "target url has no host".to_string()))?;
        if !policy.allowed_domains.is_empty()
            && !host_allowed(&policy.allowed_domains, host)
        {
            return Err(Halt::denied(format!(
                "domain '{}' is not allowed for scope '{}'",
                host, request.scope
            )));
        }

        // 4. Approval mode gate: only auto proceeds synchronously.
        if policy.approval_mode != crate::model::ApprovalMode::Auto {
            return Err(Halt::denied(format!(
                "scope '{}' requires manual approval; submit a pending request and wait for an operator decision",
                request.scope
            )));
        }

        // 5. Secret retrieval. A secret that is supposed to exist but can't
        // be read is a store malfunction.
        let secret = if policy.has_secret {
            match self.secrets.retrieve(&policy.scope) {
                Ok(Some(secret)) => Some(secret),
                Ok(None) => {
                    return Err(Halt::errored(
                        500,
                        format!("secret for scope '{}' is missing from the store", request.scope),
                    ));
                }
                Err(err) => {
                    return Err(Halt::errored(500, format!("secret store failure: {}", err)));
                }
            }
        } else {
            None
        };

        // 6. Outbound construction: the broker is the sole author of
        // authentication headers.
        let mut headers = helpers::sanitize_caller_headers(request.headers.as_ref());
        if let Some(secret) = &secret {
            helpers::inject_credential(&policy, secret, &mut headers);
        }
        if request.body.is_some() && !helpers::has_header(&headers, "content-type") {
            headers.insert("Content-Type".to_string(), "application/json".to_string());
        }

        // 7. Forward with a bounded timeout.
        let method = reqwest::Method::from_bytes(request.method.trim().to_uppercase().as_bytes())
            .map_err(|_| Halt::errored(500, format!("invalid method '{}'", request.method)))?;
        let mut outbound = self.client.request(method, url);
        for (name, value) in &headers {
            outbound = outbound.header(name, value);
        }
        if let Some(body) = &request.body {
            outbound = outbound.body(body.clone());
        }

        let upstream = outbound.send().map_err(|err| {
            Halt::errored(502, format!("upstream request failed: {}", helpers::describe_reqwest_error(&err)))
        })?;

        // 8. Response sanitization: session state and credential hints stay
        // on this side of the boundary.
        let status_code = upstream.status().as_u16();
        let headers = helpers::sanitize_response_headers(upstream.headers());
        let body = upstream.text().unwrap_or_default();

        Ok(ProxyResponse {
            status_code,
            headers,
            body: if body.is_empty() { None } else { Some(body) },
            error: None,
        })
    }
}

/// One-shot synchronous authorization decision for non-networked callers
/// (the `issue` subcommand). Runs the policy checks without forwarding.
///
/// Auto scopes are approved and audited immediately; manual/pending scopes
/// queue a PendingRequest whose later approve/deny synthesizes the audit
/// entry.
pub enum IssueOutcome {
    Approved,
    Queued { request_id: String },
    Denied { message: String },
}

pub fn issue_decision(
    store: &PolicyStore,
    scope: &str,
    requesting_host: &str,
    reason: &str,
) -> IssueOutcome {
    let deny = |message: String| {
        store.add_audit_entry(AuditEntry::new(
            scope,
            requesting_host,
            reason,
            AuditResult::Denied,
            Some(message.clone()),
        ));
        IssueOutcome::Denied { message }
    };

    let Some(policy) = store.policy_for_scope(scope) else {
        return deny(format!("no policy for scope '{}'", scope));
    };
    if !policy.is_enabled {
        return deny(format!("scope '{}' is disabled", scope));
    }

    match policy.approval_mode {
        crate::model::ApprovalMode::Auto => {
            store.add_audit_entry(AuditEntry::new(
                scope,
                requesting_host,
                reason,
                AuditResult::Approved,
                Some("issued via cli".to_string()),
            ));
            IssueOutcome::Approved
        }
        _ => {
            let request = store.add_pending_request(scope, requesting_host, reason);
            IssueOutcome::Queued {
                request_id: request.id,
            }
        }
    }
}
