//! Integration tests for the link-to-tunnel pipeline and the control API
//!
//! The engine is replaced by an in-process backend; everything else is the
//! real implementation (env-file platform, YAML profile store, resolver with
//! IPv4 literals).

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use pulse_tunnel::config::builder::{document_for_link, extract_proxy_ports, normalize};
use pulse_tunnel::config::{ConfigDocument, InboundKind};
use pulse_tunnel::dns::SystemResolver;
use pulse_tunnel::engine::{CallResponse, EngineAdapter, EngineBackend, StartRequest};
use pulse_tunnel::hub::{create_router, AppState};
use pulse_tunnel::platform::{EnvFilePlatform, NoReachability};
use pulse_tunnel::rule::RoutingPolicy;
use pulse_tunnel::store::{ProfileStore, YamlProfileStore};
use pulse_tunnel::tunnel::{ManagerOptions, TunnelManager, TunnelSource, TunnelState};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const LINK: &str = "vless://11111111-1111-1111-1111-111111111111@203.0.113.7:443\
?security=reality&sni=www.example.com&pbk=PUBKEY&sid=ab&fp=chrome&type=tcp#edge-1";

/// Engine backend that records requests and answers from a script
#[derive(Default)]
struct ScriptedEngine {
    fail_with: Option<String>,
    reject_documents: Option<String>,
    start_delay: Duration,
    starts: Mutex<Vec<StartRequest>>,
    stops: Mutex<usize>,
    version_calls: Mutex<usize>,
}

impl EngineBackend for ScriptedEngine {
    fn run_from_json(&self, request: &str) -> String {
        std::thread::sleep(self.start_delay);
        if let Ok(decoded) = StartRequest::decode(request) {
            self.starts.lock().push(decoded);
        }
        match &self.fail_with {
            Some(reason) => CallResponse::fail(reason.clone()).encode(),
            None => CallResponse::ok(None).encode(),
        }
    }

    fn stop(&self) -> String {
        *self.stops.lock() += 1;
        CallResponse::ok(None).encode()
    }

    fn version(&self) -> String {
        *self.version_calls.lock() += 1;
        CallResponse::ok(Some("25.1.30".to_string())).encode()
    }

    fn test_config(&self, _request: &str) -> String {
        match &self.reject_documents {
            Some(reason) => CallResponse::fail(reason.clone()).encode(),
            None => CallResponse::ok(None).encode(),
        }
    }
}

struct Harness {
    dir: TempDir,
    engine: Arc<ScriptedEngine>,
    manager: Arc<TunnelManager>,
}

fn harness(engine: ScriptedEngine) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(engine);
    let options = ManagerOptions {
        data_dir: dir.path().to_path_buf(),
        matcher_cache: None,
        start_timeout: Duration::from_secs(5),
        stop_timeout: Duration::from_secs(1),
    };
    let manager = TunnelManager::new(
        EngineAdapter::new(engine.clone()),
        Arc::new(EnvFilePlatform::new(dir.path().join("proxy.env"))),
        Arc::new(SystemResolver::with_nameservers(&[])),
        Arc::new(NoReachability),
        options,
    )
    .with_store(Arc::new(YamlProfileStore::new(dir.path().join("profile.yaml"))));

    Harness {
        dir,
        engine,
        manager: Arc::new(manager),
    }
}

async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
    let response = create_router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[test]
fn test_link_to_document_pipeline() {
    let policy = RoutingPolicy {
        country_code: Some("de".to_string()),
        custom_domains: vec!["*.Bank.example".to_string()],
        bypass_tld: true,
        bypass_government: true,
        ..Default::default()
    };

    let (descriptor, document) = document_for_link(LINK, &policy).unwrap();
    assert_eq!(descriptor.address.to_host(), "203.0.113.7");

    let value: Value = serde_json::from_str(&document.to_json().unwrap()).unwrap();
    assert_eq!(value["log"]["loglevel"], "warning");
    assert_eq!(value["outbounds"][0]["protocol"], "vless");
    assert_eq!(value["outbounds"][0]["streamSettings"]["security"], "reality");
    assert_eq!(
        value["outbounds"][0]["streamSettings"]["realitySettings"]["publicKey"],
        "PUBKEY"
    );

    let rules = value["routing"]["rules"].as_array().unwrap();
    assert_eq!(rules[0]["domain"], json!(["domain:bank.example"]));
    assert_eq!(rules[1]["domain"], json!(["domain:de"]));
    assert_eq!(rules[2]["ip"], json!(["geoip:de"]));
    assert_eq!(rules.last().unwrap()["outboundTag"], "proxy");

    let normalized = normalize(document.clone());
    assert_eq!(normalize(normalized.clone()), normalized);
    assert_eq!(extract_proxy_ports(&normalized), (10808, 10809));
}

#[test]
fn test_subscription_blob_uses_first_link() {
    let blob = base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        format!("# comment\n{}\nvless://x@other.example:8443#second\n", LINK),
    );
    let (descriptor, _) = document_for_link(&blob, &RoutingPolicy::default()).unwrap();
    assert_eq!(descriptor.display_name(), "edge-1");
}

#[tokio::test]
async fn test_connect_and_stop_through_api() {
    let h = harness(ScriptedEngine::default());
    let state = AppState::new(String::new(), h.manager.clone());

    let (status, body) = send(&state, post_json("/tunnel", json!({ "link": LINK }))).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["state"], "running");
    assert_eq!(body["attempt"]["server-address"], "203.0.113.7");
    assert_eq!(body["attempt"]["socks-port"], 10808);

    // Engine saw the data dir and a document with both listeners
    {
        let starts = h.engine.starts.lock();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].dat_dir, h.dir.path().to_string_lossy());
        let document = ConfigDocument::from_json(&starts[0].config_json).unwrap();
        assert!(document.inbound(InboundKind::Socks).is_some());
        assert!(document.inbound(InboundKind::Http).is_some());
    }

    // Proxy exports written and profile remembered
    let env = std::fs::read_to_string(h.dir.path().join("proxy.env")).unwrap();
    assert!(env.contains("http://127.0.0.1:10809"));
    let store = YamlProfileStore::new(h.dir.path().join("profile.yaml"));
    let saved = store.load().await.unwrap().unwrap();
    let descriptor = saved.descriptor().unwrap().unwrap();
    assert_eq!(descriptor.address.to_host(), "203.0.113.7");
    assert_eq!(descriptor.remark, "edge-1");

    // Already running
    let (status, _) = send(&state, post_json("/tunnel", json!({ "link": LINK }))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&state, Request::delete("/tunnel").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(*h.engine.stops.lock(), 1);
    assert!(!h.dir.path().join("proxy.env").exists());

    let (status, body) = send(&state, Request::get("/tunnel").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "idle");
    assert_eq!(body["attempt"], Value::Null);

    // Saved profile reconnects with an empty body
    let (status, body) = send(&state, Request::post("/tunnel").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(h.manager.state(), TunnelState::Running);
    h.manager.stop().await;
}

#[tokio::test]
async fn test_connect_without_profile_is_bad_request() {
    let h = harness(ScriptedEngine::default());
    let state = AppState::new(String::new(), h.manager.clone());

    let (status, body) = send(&state, Request::post("/tunnel").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "no-configuration");
    assert_eq!(h.manager.state(), TunnelState::Failed);
}

#[tokio::test]
async fn test_engine_failure_maps_to_bad_gateway() {
    let h = harness(ScriptedEngine {
        fail_with: Some("failed to load config: bad outbound\nstack...".to_string()),
        ..Default::default()
    });
    let state = AppState::new(String::new(), h.manager.clone());

    let (status, body) = send(&state, post_json("/tunnel", json!({ "link": LINK }))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["kind"], "engine-start-failed");
    assert!(!body["message"].as_str().unwrap().contains("stack"));
    assert!(!h.dir.path().join("proxy.env").exists());

    // A failed attempt does not block the next one
    assert_eq!(h.manager.state(), TunnelState::Failed);
    let (status, _) = send(&state, post_json("/tunnel", json!({ "link": LINK }))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_connect_rejects_link_and_document_together() {
    let h = harness(ScriptedEngine::default());
    let state = AppState::new(String::new(), h.manager.clone());

    let (status, _) = send(
        &state,
        post_json("/tunnel", json!({ "link": LINK, "document": {} })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &state,
        Request::post("/tunnel").body(Body::from("{not json")).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(h.manager.state(), TunnelState::Idle);
}

#[tokio::test]
async fn test_preview_endpoint() {
    let h = harness(ScriptedEngine::default());
    let state = AppState::new(String::new(), h.manager.clone());

    let (status, body) = send(
        &state,
        post_json(
            "/config/preview",
            json!({ "link": LINK, "routing": { "country-code": "GB", "bypass-tld": true } }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["routing"]["rules"][0]["domain"], json!(["domain:uk"]));
    assert_eq!(body["inbounds"][0]["port"], 10808);

    let (status, body) = send(
        &state,
        post_json("/config/preview", json!({ "link": "trojan://x@h:1" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().is_some());
    assert!(h.engine.starts.lock().is_empty());
}

#[tokio::test]
async fn test_auth_required_with_secret() {
    let h = harness(ScriptedEngine::default());
    let state = AppState::new("s3cret".to_string(), h.manager.clone());

    let (status, body) = send(&state, Request::get("/").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["hello"], "pulse-tunnel");

    let (status, body) = send(&state, Request::get("/version").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["engine"], "25.1.30");

    let (status, _) = send(&state, Request::get("/tunnel").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &state,
        Request::get("/tunnel")
            .header(header::AUTHORIZATION, "Bearer wrong")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(
        &state,
        Request::get("/tunnel")
            .header(header::AUTHORIZATION, "Bearer s3cret")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "idle");
}

#[tokio::test]
async fn test_document_source_skips_profile_save() {
    let h = harness(ScriptedEngine::default());
    let (_, document) = document_for_link(LINK, &RoutingPolicy::default()).unwrap();

    let status = h
        .manager
        .connect(TunnelSource::Document(document))
        .await
        .unwrap();
    assert_eq!(status.state, TunnelState::Running);
    assert!(!h.dir.path().join("profile.yaml").exists());
    h.manager.stop().await;
    assert_eq!(h.manager.state(), TunnelState::Idle);
}

#[tokio::test]
async fn test_version_queries_engine_once() {
    let h = harness(ScriptedEngine::default());
    let state = AppState::new("s3cret".to_string(), h.manager.clone());

    for _ in 0..3 {
        let (status, body) = send(&state, Request::get("/version").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["engine"], "25.1.30");
    }
    assert_eq!(*h.engine.version_calls.lock(), 1);
}

#[tokio::test]
async fn test_preview_check_uses_engine() {
    let h = harness(ScriptedEngine {
        reject_documents: Some("unknown field realitySettings".to_string()),
        ..Default::default()
    });
    let state = AppState::new(String::new(), h.manager.clone());

    // Unchecked preview never reaches the engine
    let (status, _) = send(&state, post_json("/config/preview", json!({ "link": LINK }))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &state,
        post_json("/config/preview", json!({ "link": LINK, "check": true })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["message"].as_str().unwrap().contains("realitySettings"));
    assert!(h.engine.starts.lock().is_empty());
    assert_eq!(h.manager.state(), TunnelState::Idle);
}

#[tokio::test]
async fn test_connect_survives_client_hangup() {
    let h = harness(ScriptedEngine {
        start_delay: Duration::from_millis(300),
        ..Default::default()
    });
    let state = AppState::new(String::new(), h.manager.clone());

    // Client gives up while the engine is still starting
    let hung_up = tokio::time::timeout(
        Duration::from_millis(100),
        send(&state, post_json("/tunnel", json!({ "link": LINK }))),
    )
    .await;
    assert!(hung_up.is_err());

    // The attempt keeps the operation lock until it ends
    let (status, _) = send(&state, Request::delete("/tunnel").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::CONFLICT);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.manager.state(), TunnelState::Running);

    let (status, _) = send(&state, Request::delete("/tunnel").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(h.manager.state(), TunnelState::Idle);
    assert!(!h.dir.path().join("proxy.env").exists());
}
