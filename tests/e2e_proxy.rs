use std::net::{SocketAddr, TcpListener};
use std::sync::{mpsc, Arc};
use std::thread;

use axum::http::HeaderMap;
use axum::routing::any;
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::runtime::Builder as TokioRuntimeBuilder;

use keygate::broker::Broker;
use keygate::model::{ApprovalMode, CredentialType, ScopePolicy};
use keygate::secrets::{MemorySecretStore, SecretStore};
use keygate::server;
use keygate::store::PolicyStore;
use keygate::sync::NullConfigSync;

/// Stub upstream that echoes back what authentication it saw.
fn start_upstream() -> SocketAddr {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let runtime = TokioRuntimeBuilder::new_multi_thread()
            .enable_all()
            .build()
            .expect("build tokio runtime");
        runtime.block_on(async move {
            let app = Router::new().fallback(any(|headers: HeaderMap| async move {
                let authorization = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                Json(json!({ "ok": true, "authorization": authorization }))
            }));
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("bind upstream");
            tx.send(listener.local_addr().expect("upstream addr"))
                .expect("send addr");
            axum::serve(listener, app).await.expect("serve upstream");
        });
    });
    rx.recv().expect("upstream addr")
}

struct BrokerHarness {
    _dir: TempDir,
    store: Arc<PolicyStore>,
    secrets: Arc<MemorySecretStore>,
    base: String,
}

impl BrokerHarness {
    fn start() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let secrets = Arc::new(MemorySecretStore::new());
        let store = Arc::new(
            PolicyStore::open_under(dir.path(), secrets.clone(), Box::new(NullConfigSync))
                .expect("open store"),
        );
        let broker = Arc::new(Broker::new(store.clone(), secrets.clone()).expect("build broker"));

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind broker listener");
        let addr = listener.local_addr().expect("broker addr");
        let serve_store = store.clone();
        thread::spawn(move || {
            let _ = server::serve_on(listener, broker, serve_store);
        });

        Self {
            _dir: dir,
            store,
            secrets,
            base: format!("http://{}", addr),
        }
    }

    fn add_auto_scope(&self, scope: &str, domains: &[&str], secret: Option<&str>) {
        let mut policy = ScopePolicy::new(scope.to_uppercase(), scope, CredentialType::BearerToken);
        policy.approval_mode = ApprovalMode::Auto;
        policy.allowed_domains = domains.iter().map(|d| d.to_string()).collect();
        policy.has_secret = secret.is_some();
        self.store.add_policy(policy).expect("add policy");
        if let Some(secret) = secret {
            self.secrets.save(scope, secret).expect("save secret");
        }
    }
}

fn client() -> reqwest::blocking::Client {
    reqwest::blocking::Client::new()
}

#[test]
fn health_endpoint_reports_ok_and_port() {
    let harness = BrokerHarness::start();
    let port: u16 = harness.base.rsplit(':').next().unwrap().parse().unwrap();

    let response = client()
        .get(format!("{}/health", harness.base))
        .send()
        .expect("health request");
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().expect("health body");
    assert_eq!(body["status"], json!("ok"));
    assert_eq!(body["port"], json!(port));
}

#[test]
fn proxy_injects_the_scopes_bearer_token_and_relays_the_upstream_body() {
    let upstream = start_upstream();
    let harness = BrokerHarness::start();
    harness.add_auto_scope("openai", &["127.0.0.1"], Some("sk-test"));

    let response = client()
        .post(format!("{}/proxy", harness.base))
        .json(&json!({
            "scope": "openai",
            "method": "GET",
            "url": format!("http://{}/v1/models", upstream),
            "reason": "list models",
        }))
        .send()
        .expect("proxy request");
    assert_eq!(response.status().as_u16(), 200);

    let envelope: Value = response.json().expect("proxy envelope");
    assert_eq!(envelope["statusCode"], json!(200));
    assert!(envelope.get("error").is_none());
    let upstream_body: Value =
        serde_json::from_str(envelope["body"].as_str().unwrap()).expect("upstream body");
    assert_eq!(upstream_body["authorization"], json!("Bearer sk-test"));

    let audit = harness.store.recent_audit(10);
    assert_eq!(audit.len(), 1);
    assert!(audit[0].detail.as_deref().unwrap().contains("→ 200"));
}

#[test]
fn proxy_denies_domains_outside_the_allowlist() {
    let upstream = start_upstream();
    let harness = BrokerHarness::start();
    harness.add_auto_scope("openai", &["api.openai.com"], Some("sk-test"));

    let response = client()
        .post(format!("{}/proxy", harness.base))
        .json(&json!({
            "scope": "openai",
            "url": format!("http://{}/v1/models", upstream),
        }))
        .send()
        .expect("proxy request");
    // The transport always answers 200; the denial lives in the envelope.
    assert_eq!(response.status().as_u16(), 200);

    let envelope: Value = response.json().expect("proxy envelope");
    assert_eq!(envelope["statusCode"], json!(403));
    assert!(envelope["error"].as_str().unwrap().contains("not allowed"));

    let audit = harness.store.recent_audit(10);
    assert_eq!(audit.len(), 1);
}

#[test]
fn malformed_proxy_body_is_a_400_without_an_audit_entry() {
    let harness = BrokerHarness::start();
    let response = client()
        .post(format!("{}/proxy", harness.base))
        .header("content-type", "application/json")
        .body("{\"method\":\"GET\"}")
        .send()
        .expect("proxy request");
    assert_eq!(response.status().as_u16(), 400);
    let body: Value = response.json().expect("error body");
    assert!(body["error"].as_str().unwrap().contains("invalid proxy request"));
    assert!(harness.store.recent_audit(10).is_empty());
}

#[test]
fn mcp_initialize_round_trips_over_http() {
    let harness = BrokerHarness::start();
    let response = client()
        .post(format!("{}/mcp", harness.base))
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {},
        }))
        .send()
        .expect("mcp request");
    assert_eq!(response.status().as_u16(), 200);
    let reply: Value = response.json().expect("mcp reply");
    assert_eq!(reply["result"]["serverInfo"]["name"], json!("keygate"));
    assert_eq!(reply["result"]["protocolVersion"], json!("2024-11-05"));
}

#[test]
fn mcp_notification_gets_an_empty_202() {
    let harness = BrokerHarness::start();
    let response = client()
        .post(format!("{}/mcp", harness.base))
        .json(&json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized",
        }))
        .send()
        .expect("mcp notification");
    assert_eq!(response.status().as_u16(), 202);
    assert!(response.text().expect("body").is_empty());
}

#[test]
fn options_mcp_answers_cors_preflight() {
    let harness = BrokerHarness::start();
    let response = client()
        .request(reqwest::Method::OPTIONS, format!("{}/mcp", harness.base))
        .send()
        .expect("preflight");
    assert_eq!(response.status().as_u16(), 204);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
}

#[test]
fn unknown_route_is_a_404_json_error() {
    let harness = BrokerHarness::start();
    let response = client()
        .get(format!("{}/nope", harness.base))
        .send()
        .expect("request");
    assert_eq!(response.status().as_u16(), 404);
    let body: Value = response.json().expect("body");
    assert_eq!(body["error"], json!("not found"));
}
