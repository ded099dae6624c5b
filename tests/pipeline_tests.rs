//! End-to-end tests of the security pipeline over real HTTP.
//!
//! Each fixture serves the full router on an ephemeral port with the
//! in-memory store and a keyring in a temporary directory, then drives it
//! with `reqwest`. No external services are required.
//!
//! Run with: `cargo test --test pipeline_tests`
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::{Value, json};

use gatekeeper::authz::Role;
use gatekeeper::clock::SystemClock;
use gatekeeper::ratelimit::{RateLimitPolicy, RateLimitRule, RuleMatcher, StrategyKind};
use gatekeeper::token::TokenPair;
use gatekeeper::validation::ValidationMode;
use gatekeeper::{AppState, Config, build_router};

/// Running server plus the state behind it.
struct TestApp {
    base_url: String,
    client: Client,
    state: AppState,
    _keyring_dir: tempfile::TempDir,
}

impl TestApp {
    async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    async fn spawn_with(configure: impl FnOnce(&mut Config)) -> Self {
        let keyring_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut config = Config {
            jwt_secret: "pipeline-integration-secret-0123456789".to_string(),
            master_key: "pipeline-integration-master".to_string(),
            encryption_keys_file: keyring_dir.path().join("keys.json"),
            metrics_port: 0,
            ..Config::default()
        };
        configure(&mut config);
        config.validate().expect("Test config should be valid");

        let state = AppState::from_config(config, SystemClock::shared())
            .await
            .expect("Failed to build state");
        let app = build_router(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to ephemeral port");
        let addr = listener.local_addr().expect("Failed to get local address");

        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .expect("Server error");
        });

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: format!("http://{addr}"),
            client,
            state,
            _keyring_dir: keyring_dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn login(&self, subject: &str, roles: &[Role]) -> TokenPair {
        self.state
            .tokens
            .issue_for_roles(subject, roles)
            .expect("Failed to issue tokens")
    }

    async fn get(&self, path: &str, token: Option<&str>) -> reqwest::Response {
        let mut req = self.client.get(self.url(path));
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        req.send().await.expect("Request failed")
    }

    async fn post(&self, path: &str, token: Option<&str>, body: &Value) -> reqwest::Response {
        let mut req = self.client.post(self.url(path)).json(body);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        req.send().await.expect("Request failed")
    }
}

// =============================================================================
// Probes
// =============================================================================

#[tokio::test]
async fn test_probes_are_public() {
    let app = TestApp::spawn().await;

    let health = app.get("/health", None).await;
    assert_eq!(health.status(), StatusCode::OK);
    let body: Value = health.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["store_backend"], "memory");
    assert_eq!(body["keyring_keys"], 1);

    let ready = app.get("/ready", None).await;
    assert_eq!(ready.status(), StatusCode::OK);
}

// =============================================================================
// Authentication
// =============================================================================

#[tokio::test]
async fn test_protected_route_requires_bearer_token() {
    let app = TestApp::spawn().await;

    let response = app.get("/auth/whoami", None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers()["www-authenticate"], "Bearer");

    let response = app.get("/auth/whoami", Some("not.a.jwt")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let challenge = response.headers()["www-authenticate"].to_str().unwrap().to_string();
    assert!(challenge.contains("invalid_token"));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "invalid_token");
}

#[tokio::test]
async fn test_whoami_reports_frozen_scopes() {
    let app = TestApp::spawn().await;
    let pair = app.login("alice", &[Role::User]);

    let response = app.get("/auth/whoami", Some(&pair.access_token)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-ratelimit-limit"));

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["subject"], "alice");
    let scopes: Vec<&str> = body["scopes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s.as_str().unwrap())
        .collect();
    assert!(scopes.contains(&"read:profile"));
    assert!(!scopes.contains(&"admin"));
}

#[tokio::test]
async fn test_refresh_rotates_and_rejects_replay() {
    let app = TestApp::spawn().await;
    let pair = app.login("alice", &[Role::User]);

    let response = app
        .post("/auth/refresh", None, &json!({ "refresh_token": pair.refresh_token }))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let next: Value = response.json().await.unwrap();
    assert_eq!(next["token_type"], "bearer");
    let new_access = next["access_token"].as_str().unwrap();

    let replay = app
        .post("/auth/refresh", None, &json!({ "refresh_token": pair.refresh_token }))
        .await;
    assert_eq!(replay.status(), StatusCode::UNAUTHORIZED);

    // An access token is not a refresh token
    let wrong_kind = app
        .post("/auth/refresh", None, &json!({ "refresh_token": new_access }))
        .await;
    assert_eq!(wrong_kind.status(), StatusCode::UNAUTHORIZED);

    let whoami = app.get("/auth/whoami", Some(new_access)).await;
    assert_eq!(whoami.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_revoked_access_token_is_rejected() {
    let app = TestApp::spawn().await;
    let pair = app.login("alice", &[Role::User]);

    let response = app
        .post(
            "/auth/revoke",
            Some(&pair.access_token),
            &json!({ "token": pair.access_token }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["revoked"], true);

    let response = app.get("/auth/whoami", Some(&pair.access_token)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "invalid_token");
}

#[tokio::test]
async fn test_revoking_another_subjects_token_needs_admin() {
    let app = TestApp::spawn().await;
    let alice = app.login("alice", &[Role::User]);
    let mallory = app.login("mallory", &[Role::User]);
    let admin = app.login("root", &[Role::Admin]);

    let response = app
        .post(
            "/auth/revoke",
            Some(&mallory.access_token),
            &json!({ "token": alice.refresh_token }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .post(
            "/auth/revoke",
            Some(&admin.access_token),
            &json!({ "token": alice.refresh_token }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let refresh = app
        .post("/auth/refresh", None, &json!({ "refresh_token": alice.refresh_token }))
        .await;
    assert_eq!(refresh.status(), StatusCode::UNAUTHORIZED);
}

// =============================================================================
// Authorization and encryption
// =============================================================================

#[tokio::test]
async fn test_vault_round_trip_and_tamper_rejection() {
    let app = TestApp::spawn().await;
    let pair = app.login("alice", &[Role::User]);
    let token = Some(pair.access_token.as_str());

    let response = app
        .post("/vault/encrypt", token, &json!({ "plaintext": "card 4111 1111" }))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let payload: Value = response.json().await.unwrap();
    for field in ["kid", "iv", "ct", "tag"] {
        assert!(payload[field].is_string(), "missing {field}");
    }

    let response = app.post("/vault/decrypt", token, &payload).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["plaintext"], "card 4111 1111");

    // A genuine tag, but for a different ciphertext
    let other: Value = app
        .post("/vault/encrypt", token, &json!({ "plaintext": "card 4111 1112" }))
        .await
        .json()
        .await
        .unwrap();
    let mut tampered = payload.clone();
    tampered["tag"] = other["tag"].clone();
    let response = app.post("/vault/decrypt", token, &tampered).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "decryption_failed");
}

#[tokio::test]
async fn test_key_admin_requires_scope_and_keeps_old_payloads() {
    let app = TestApp::spawn().await;
    let user = app.login("alice", &[Role::User]);
    let superadmin = app.login("ops", &[Role::SuperAdmin]);

    let response = app.get("/admin/keys", Some(&user.access_token)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(
        response.headers()["www-authenticate"]
            .to_str()
            .unwrap()
            .contains("admin:keys")
    );

    let old = app
        .post(
            "/vault/encrypt",
            Some(&user.access_token),
            &json!({ "plaintext_b64": "AAEC" }),
        )
        .await
        .json::<Value>()
        .await
        .unwrap();

    let rotated = app
        .post("/admin/keys/rotate", Some(&superadmin.access_token), &json!({}))
        .await;
    assert_eq!(rotated.status(), StatusCode::CREATED);
    let rotated: Value = rotated.json().await.unwrap();
    assert_eq!(rotated["keys"], 2);
    assert_ne!(rotated["current"], old["kid"]);

    let listed: Value = app
        .get("/admin/keys", Some(&superadmin.access_token))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(listed["current"], rotated["current"]);
    assert_eq!(listed["keys"].as_array().unwrap().len(), 2);
    assert!(!listed.to_string().contains("secret"));

    let decrypted: Value = app
        .post("/vault/decrypt", Some(&user.access_token), &old)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(decrypted["plaintext_b64"], "AAEC");
}

// =============================================================================
// Validation
// =============================================================================

#[tokio::test]
async fn test_injection_is_blocked_before_authentication() {
    let app = TestApp::spawn().await;

    let response = app
        .post(
            "/vault/encrypt",
            None,
            &json!({ "plaintext": "x' OR 1=1 --" }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "validation_violation");
    assert_eq!(body["details"][0]["rule"], "sql_injection");
    assert_eq!(body["details"][0]["field"], "plaintext");
    // The offending value is never echoed back
    assert!(!body.to_string().contains("1=1"));

    let response = app.get("/health?next=%3Cscript%3Ealert(1)%3C/script%3E", None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_monitor_mode_lets_flagged_input_through() {
    let app = TestApp::spawn_with(|c| c.validation_mode = ValidationMode::Monitor).await;
    let pair = app.login("alice", &[Role::User]);

    let response = app
        .post(
            "/vault/encrypt",
            Some(&pair.access_token),
            &json!({ "plaintext": "<script>alert(1)</script>" }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let app = TestApp::spawn_with(|c| c.max_request_body_size = 64).await;
    let pair = app.login("alice", &[Role::User]);

    let response = app
        .post(
            "/vault/encrypt",
            Some(&pair.access_token),
            &json!({ "plaintext": "a".repeat(256) }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

// =============================================================================
// Rate limiting
// =============================================================================

#[tokio::test]
async fn test_rate_limit_per_client_with_retry_after() {
    let app = TestApp::spawn_with(|c| {
        c.rate_limit_policy = RateLimitPolicy::new(None).with_rule(
            RuleMatcher::parse("/health").unwrap(),
            RateLimitRule::new(3, Duration::from_secs(60), StrategyKind::Sliding),
        );
    })
    .await;

    let hit = |ip: &'static str| {
        app.client
            .get(app.url("/health"))
            .header("x-forwarded-for", ip)
            .send()
    };

    for remaining in (0..3).rev() {
        let response = hit("203.0.113.1").await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["x-ratelimit-remaining"],
            remaining.to_string().as_str()
        );
    }

    let limited = hit("203.0.113.1").await.unwrap();
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = limited.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));

    // Another client has its own budget
    let other = hit("203.0.113.2").await.unwrap();
    assert_eq!(other.status(), StatusCode::OK);

    // Routes without a rule are not limited
    let ready = app.get("/ready", None).await;
    assert_eq!(ready.status(), StatusCode::OK);
    assert!(!ready.headers().contains_key("x-ratelimit-limit"));
}
