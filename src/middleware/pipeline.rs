//! The security pipeline as a tower layer.
//!
//! Each request runs through the configured stages in order, stopping at the
//! first rejection:
//!
//! ```text
//! Request → validate → authenticate → authorize → rate_limit → Handler
//!              ↓             ↓             ↓            ↓
//!          400 / 413        401           403       429 / 503
//! ```
//!
//! On success the resolved [`Principal`] is placed in the request extensions
//! for handlers to extract, and admitted responses carry
//! `X-RateLimit-Limit` / `X-RateLimit-Remaining` when a rule applied.
//!
//! Textual bodies are buffered (up to the configured cap) for inspection and
//! handed on intact, so handlers can still read them.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderValue, Method, Request, Response, header};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::{debug, error, warn};

use super::ip::{TrustedProxyConfig, client_ip};
use crate::authz::{Principal, RouteScopes, path_has_prefix, require_scopes};
use crate::config::Config;
use crate::error::AppError;
use crate::metrics;
use crate::ratelimit::{RateLimitDecision, RateLimiter};
use crate::store::StoreFailurePolicy;
use crate::token::{TokenKind, TokenService, parse_bearer};
use crate::validation::{BodyKind, InputValidator, ValidationMode, Violation};

pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// One step of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Validate,
    Authenticate,
    Authorize,
    RateLimit,
}

impl Stage {
    pub const DEFAULT_ORDER: [Stage; 4] = [
        Stage::Validate,
        Stage::Authenticate,
        Stage::Authorize,
        Stage::RateLimit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Authenticate => "authenticate",
            Stage::Authorize => "authorize",
            Stage::RateLimit => "rate_limit",
        }
    }

    /// Each stage at most once, and `authorize` only after `authenticate`.
    pub fn validate_order(order: &[Stage]) -> Result<(), String> {
        for (i, stage) in order.iter().enumerate() {
            if order.iter().skip(i + 1).any(|s| s == stage) {
                return Err(format!("stage '{stage}' listed more than once"));
            }
        }

        let position = |stage: Stage| order.iter().position(|s| *s == stage);
        if let Some(authorize) = position(Stage::Authorize) {
            match position(Stage::Authenticate) {
                Some(authenticate) if authenticate < authorize => {}
                _ => return Err("'authorize' must come after 'authenticate'".to_string()),
            }
        }
        Ok(())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "validate" => Ok(Stage::Validate),
            "authenticate" => Ok(Stage::Authenticate),
            "authorize" => Ok(Stage::Authorize),
            "rate_limit" => Ok(Stage::RateLimit),
            other => Err(format!(
                "unknown pipeline stage '{other}' (expected validate|authenticate|authorize|rate_limit)"
            )),
        }
    }
}

/// Pipeline behaviour that is not owned by one of the components.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub order: Vec<Stage>,
    pub validation_mode: ValidationMode,
    pub max_body_size: usize,
    pub public_paths: Vec<String>,
    pub public_prefixes: Vec<String>,
    pub route_scopes: RouteScopes,
    pub failure_policy: StoreFailurePolicy,
    pub trusted_proxies: TrustedProxyConfig,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            order: config.pipeline_order.clone(),
            validation_mode: config.validation_mode,
            max_body_size: config.max_request_body_size,
            public_paths: config.auth_public_paths.clone(),
            public_prefixes: config.auth_public_prefixes.clone(),
            route_scopes: config.route_scopes.clone(),
            failure_policy: config.store_failure_policy,
            trusted_proxies: TrustedProxyConfig::new(&config.trusted_proxies),
        }
    }

    /// Exact public path, or under a public prefix.
    pub fn is_public(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| p == path)
            || self
                .public_prefixes
                .iter()
                .any(|prefix| path_has_prefix(path, prefix))
    }
}

/// The components the pipeline composes.
pub struct SecurityPipeline {
    tokens: Arc<TokenService>,
    limiter: Option<RateLimiter>,
    validator: Arc<InputValidator>,
    settings: PipelineSettings,
}

impl fmt::Debug for SecurityPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityPipeline")
            .field("settings", &self.settings)
            .field("rate_limiting", &self.limiter.is_some())
            .finish_non_exhaustive()
    }
}

/// What a rejected stage hands back.
type Rejection = Response<Body>;

impl SecurityPipeline {
    pub fn new(
        tokens: Arc<TokenService>,
        limiter: Option<RateLimiter>,
        validator: Arc<InputValidator>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            tokens,
            limiter,
            validator,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run every stage. On success returns the (possibly rebuilt) request and
    /// the rate-limit decision, if a rule applied.
    pub async fn admit(
        &self,
        req: Request<Body>,
    ) -> Result<(Request<Body>, Option<RateLimitDecision>), Rejection> {
        let path = req.uri().path().to_string();
        let client = client_ip(&req, &self.settings.trusted_proxies).into_owned();
        let public = self.settings.is_public(&path);

        let mut req = req;
        let mut principal: Option<Principal> = None;
        let mut decision = None;

        for stage in &self.settings.order {
            match stage {
                Stage::Validate => {
                    req = self.validate(req, &client, &path).await?;
                }
                Stage::Authenticate if !public => {
                    let resolved = self.authenticate(req.headers(), &client, &path).await?;
                    req.extensions_mut().insert(resolved.clone());
                    principal = Some(resolved);
                }
                Stage::Authorize => {
                    if let Some(principal) = &principal {
                        self.authorize(principal, &client, &path)?;
                    }
                }
                Stage::RateLimit => {
                    decision = self.rate_limit(&client, req.method(), &path).await?;
                }
                Stage::Authenticate => {}
            }
        }

        Ok((req, decision))
    }

    async fn validate(
        &self,
        req: Request<Body>,
        client: &str,
        path: &str,
    ) -> Result<Request<Body>, Rejection> {
        let mode = self.settings.validation_mode;
        if mode == ValidationMode::Off {
            return Ok(req);
        }

        let uri = req.uri().to_string();
        let mut violations = self.validator.check_url(&uri);
        if let Some(query) = req.uri().query() {
            violations.extend(self.validator.inspect_query(query));
        }

        let body_kind = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(BodyKind::from_content_type);

        let req = match body_kind {
            Some(kind) => {
                let (req, body_violations) = self.inspect_body(req, kind, client, path).await?;
                violations.extend(body_violations);
                req
            }
            None => req,
        };

        if violations.is_empty() {
            return Ok(req);
        }

        let action = if mode == ValidationMode::Block { "blocked" } else { "logged" };
        for violation in &violations {
            metrics::record_validation_violation(violation.rule.as_str(), action);
        }
        warn!(
            client_ip = %client,
            path = %path,
            mode = %mode,
            violations = ?violations,
            "Input validation violations"
        );

        if mode == ValidationMode::Block {
            Err(AppError::ValidationViolation(violations).into_response())
        } else {
            Ok(req)
        }
    }

    /// Buffer and inspect a textual body, then put it back.
    async fn inspect_body(
        &self,
        req: Request<Body>,
        kind: BodyKind,
        client: &str,
        path: &str,
    ) -> Result<(Request<Body>, Vec<Violation>), Rejection> {
        let limit = self.settings.max_body_size;

        let declared = req
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if let Some(len) = declared
            && len > limit
        {
            if self.settings.validation_mode == ValidationMode::Block {
                warn!(client_ip = %client, path = %path, content_length = len, limit, "Request body too large");
                return Err(AppError::PayloadTooLarge(format!(
                    "Request body exceeds {limit} bytes"
                ))
                .into_response());
            }
            // Monitor mode: pass the body through untouched, uninspected
            warn!(client_ip = %client, path = %path, content_length = len, limit, "Request body too large to inspect");
            return Ok((req, Vec::new()));
        }

        let (parts, body) = req.into_parts();
        // A partially read body cannot be handed on, so the cap applies in
        // every mode once buffering has started.
        let bytes: Bytes = axum::body::to_bytes(body, limit).await.map_err(|e| {
            warn!(client_ip = %client, path = %path, error = %e, limit, "Failed to buffer request body");
            AppError::PayloadTooLarge(format!("Request body exceeds {limit} bytes")).into_response()
        })?;

        let violations = self.validator.inspect_body(kind, &bytes);
        Ok((Request::from_parts(parts, Body::from(bytes)), violations))
    }

    /// Takes the headers rather than the request: `Body` is not `Sync`, so a
    /// borrowed request cannot be held across the store lookup.
    async fn authenticate(
        &self,
        headers: &HeaderMap,
        client: &str,
        path: &str,
    ) -> Result<Principal, Rejection> {
        let reject = |err: AppError| {
            metrics::record_auth_failure(err.reason());
            warn!(client_ip = %client, path = %path, reason = err.reason(), error = %err, "Authentication failed");
            err.into_response()
        };

        let Some(value) = headers.get(header::AUTHORIZATION) else {
            return Err(reject(AppError::MissingCredentials(
                "Authentication required".to_string(),
            )));
        };
        let token = value.to_str().ok().and_then(parse_bearer).ok_or_else(|| {
            reject(AppError::MissingCredentials(
                "Invalid authorization header format".to_string(),
            ))
        })?;

        match self.tokens.verify(token, TokenKind::Access).await {
            Ok(claims) => {
                debug!(client_ip = %client, sub = %claims.sub, jti = %claims.jti, "Authenticated");
                Ok(Principal::from(claims))
            }
            Err(err @ AppError::StoreUnavailable(_)) => {
                metrics::record_store_failure("revocation_lookup");
                error!(client_ip = %client, path = %path, error = %err, "Revocation store unavailable, rejecting request");
                Err(err.into_response())
            }
            Err(err) => Err(reject(err)),
        }
    }

    fn authorize(&self, principal: &Principal, client: &str, path: &str) -> Result<(), Rejection> {
        let required = self.settings.route_scopes.required_for(path);
        require_scopes(principal, required).map_err(|err| {
            metrics::record_auth_failure(err.reason());
            warn!(
                client_ip = %client,
                path = %path,
                sub = %principal.subject,
                required = ?required,
                "Insufficient scope"
            );
            err.into_response()
        })
    }

    async fn rate_limit(
        &self,
        client: &str,
        method: &Method,
        path: &str,
    ) -> Result<Option<RateLimitDecision>, Rejection> {
        let Some(limiter) = &self.limiter else {
            return Ok(None);
        };

        match limiter.check(client, method, path).await {
            Ok(None) => Ok(None),
            Ok(Some(outcome)) if outcome.decision.limited => {
                let rule = outcome.rule.to_string();
                metrics::record_rate_limited(&rule);
                warn!(
                    client_ip = %client,
                    path = %path,
                    rule = %rule,
                    retry_after_secs = outcome.decision.retry_after_secs,
                    "Rate limit exceeded"
                );
                let mut response = AppError::RateLimited {
                    retry_after_secs: outcome.decision.retry_after_secs,
                }
                .into_response();
                apply_rate_limit_headers(&mut response, &outcome.decision);
                Err(response)
            }
            Ok(Some(outcome)) => Ok(Some(outcome.decision)),
            Err(e) => {
                metrics::record_store_failure("rate_limit");
                match self.settings.failure_policy {
                    StoreFailurePolicy::FailClosed => {
                        error!(client_ip = %client, path = %path, error = %e, "Rate-limit store unavailable, rejecting request");
                        Err(AppError::from(e).into_response())
                    }
                    StoreFailurePolicy::FailOpen => {
                        error!(client_ip = %client, path = %path, error = %e, "Rate-limit store unavailable, admitting request under fail-open policy");
                        Ok(None)
                    }
                }
            }
        }
    }
}

fn apply_rate_limit_headers(response: &mut Response<Body>, decision: &RateLimitDecision) {
    let headers = response.headers_mut();
    headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(
        RATE_LIMIT_REMAINING_HEADER,
        HeaderValue::from(decision.remaining),
    );
}

/// Tower layer running a [`SecurityPipeline`] in front of the wrapped service.
///
/// # Example
///
/// ```rust,ignore
/// let pipeline = Arc::new(SecurityPipeline::new(tokens, limiter, validator, settings));
/// let app = Router::new()
///     .route("/vault/encrypt", post(handler))
///     .layer(SecurityLayer::new(pipeline));
/// ```
#[derive(Clone)]
pub struct SecurityLayer {
    pipeline: Arc<SecurityPipeline>,
}

impl SecurityLayer {
    pub fn new(pipeline: Arc<SecurityPipeline>) -> Self {
        Self { pipeline }
    }
}

impl<S> Layer<S> for SecurityLayer {
    type Service = SecurityService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SecurityService {
            inner,
            pipeline: self.pipeline.clone(),
        }
    }
}

#[derive(Clone)]
pub struct SecurityService<S> {
    inner: S,
    pipeline: Arc<SecurityPipeline>,
}

impl<S> Service<Request<Body>> for SecurityService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let pipeline = self.pipeline.clone();
        // Take the service that was driven to readiness, leave a clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let started = Instant::now();
            let method = req.method().clone();

            let response = match pipeline.admit(req).await {
                Ok((req, decision)) => {
                    let mut response = inner.call(req).await?;
                    if let Some(decision) = decision {
                        apply_rate_limit_headers(&mut response, &decision);
                    }
                    response
                }
                Err(rejection) => rejection,
            };

            metrics::record_request_duration(
                method.as_str(),
                response.status().as_u16(),
                started.elapsed().as_secs_f64(),
            );
            Ok(response)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use tower::ServiceExt;

    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::{RateLimitPolicy, RateLimitRule, StrategyKind};
    use crate::store::{CounterStore, MemoryStore, RevocationStore, UnreachableStore};
    use crate::token::TokenSettings;

    struct Harness {
        tokens: Arc<TokenService>,
        pipeline: Arc<SecurityPipeline>,
        app: Router,
    }

    fn harness(max: u64, mode: ValidationMode, order: Vec<Stage>) -> Harness {
        let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        build_harness(store, clock, StoreFailurePolicy::FailClosed, max, mode, order)
    }

    /// Every store call fails; `policy` decides what the pipeline does about it.
    fn outage_harness(policy: StoreFailurePolicy) -> Harness {
        let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
        build_harness(
            Arc::new(UnreachableStore),
            clock,
            policy,
            100,
            ValidationMode::Block,
            Stage::DEFAULT_ORDER.to_vec(),
        )
    }

    fn build_harness<S>(
        store: Arc<S>,
        clock: Arc<ManualClock>,
        policy: StoreFailurePolicy,
        max: u64,
        mode: ValidationMode,
        order: Vec<Stage>,
    ) -> Harness
    where
        S: RevocationStore + CounterStore + 'static,
    {
        let tokens = Arc::new(
            TokenService::new(
                &TokenSettings {
                    secret: "pipeline-test-secret-0123456789abcdef".to_string(),
                    access_ttl: Duration::from_secs(600),
                    refresh_ttl: Duration::from_secs(3600),
                },
                store.clone(),
                clock.clone(),
            )
            .with_failure_policy(policy),
        );
        let rate_policy = RateLimitPolicy::new(Some(RateLimitRule::new(
            max,
            Duration::from_secs(60),
            StrategyKind::Fixed,
        )));
        let limiter = RateLimiter::new(rate_policy, store, clock);

        let settings = PipelineSettings {
            order,
            validation_mode: mode,
            max_body_size: 256,
            public_paths: vec!["/health".to_string()],
            public_prefixes: vec!["/public".to_string()],
            route_scopes: RouteScopes::parse("/admin=admin").unwrap(),
            failure_policy: policy,
            trusted_proxies: TrustedProxyConfig::default(),
        };
        let pipeline = Arc::new(SecurityPipeline::new(
            tokens.clone(),
            Some(limiter),
            Arc::new(InputValidator::with_defaults().unwrap()),
            settings,
        ));

        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/public/info", get(|| async { "info" }))
            .route(
                "/whoami",
                get(|principal: Principal| async move { principal.subject }),
            )
            .route("/admin/thing", get(|| async { "admin" }))
            .route("/echo", post(|body: String| async move { body }))
            .layer(SecurityLayer::new(pipeline.clone()));

        Harness {
            tokens,
            pipeline,
            app,
        }
    }

    fn default_harness() -> Harness {
        harness(100, ValidationMode::Block, Stage::DEFAULT_ORDER.to_vec())
    }

    fn bearer(tokens: &TokenService, scopes: &[&str]) -> String {
        let token = tokens
            .issue("alice", scopes.iter().copied(), TokenKind::Access)
            .unwrap();
        format!("Bearer {}", token.encoded)
    }

    async fn send(app: &Router, req: Request<Body>) -> Response<Body> {
        app.clone().oneshot(req).await.unwrap()
    }

    async fn body_string(response: Response<Body>) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_public_paths_skip_authentication() {
        let h = default_harness();
        for path in ["/health", "/public/info"] {
            let req = Request::get(path).body(Body::empty()).unwrap();
            assert_eq!(send(&h.app, req).await.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_missing_token_is_401_with_challenge() {
        let h = default_harness();
        let req = Request::get("/whoami").body(Body::empty()).unwrap();
        let response = send(&h.app, req).await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
    }

    #[tokio::test]
    async fn test_malformed_header_is_401() {
        let h = default_harness();
        let req = Request::get("/whoami")
            .header(header::AUTHORIZATION, "Token abc def")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&h.app, req).await.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_principal_reaches_handler() {
        let h = default_harness();
        let req = Request::get("/whoami")
            .header(header::AUTHORIZATION, bearer(&h.tokens, &["read"]))
            .body(Body::empty())
            .unwrap();
        let response = send(&h.app, req).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(RATE_LIMIT_LIMIT_HEADER).unwrap(), "100");
        assert_eq!(response.headers().get(RATE_LIMIT_REMAINING_HEADER).unwrap(), "99");
        assert_eq!(body_string(response).await, "alice");
    }

    #[tokio::test]
    async fn test_revoked_token_reads_as_invalid() {
        let h = default_harness();
        let token = h.tokens.issue("alice", ["read"], TokenKind::Access).unwrap();
        h.tokens.revoke(token.as_str()).await.unwrap();

        let req = Request::get("/whoami")
            .header(header::AUTHORIZATION, format!("Bearer {}", token.encoded))
            .body(Body::empty())
            .unwrap();
        let response = send(&h.app, req).await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_string(response).await;
        assert!(body.contains("invalid_token"));
        assert!(!body.to_lowercase().contains("revoked"));
    }

    #[tokio::test]
    async fn test_refresh_token_rejected_as_access() {
        let h = default_harness();
        let token = h.tokens.issue("alice", ["read"], TokenKind::Refresh).unwrap();
        let req = Request::get("/whoami")
            .header(header::AUTHORIZATION, format!("Bearer {}", token.encoded))
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&h.app, req).await.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_insufficient_scope_is_403() {
        let h = default_harness();
        let req = Request::get("/admin/thing")
            .header(header::AUTHORIZATION, bearer(&h.tokens, &["read"]))
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&h.app, req).await.status(), StatusCode::FORBIDDEN);

        let req = Request::get("/admin/thing")
            .header(header::AUTHORIZATION, bearer(&h.tokens, &["admin"]))
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&h.app, req).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rate_limit_is_429_with_retry_after() {
        let h = harness(2, ValidationMode::Block, Stage::DEFAULT_ORDER.to_vec());
        for _ in 0..2 {
            let req = Request::get("/health").body(Body::empty()).unwrap();
            assert_eq!(send(&h.app, req).await.status(), StatusCode::OK);
        }

        let req = Request::get("/health").body(Body::empty()).unwrap();
        let response = send(&h.app, req).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry: u64 = response
            .headers()
            .get(header::RETRY_AFTER)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=60).contains(&retry));
        assert_eq!(response.headers().get(RATE_LIMIT_REMAINING_HEADER).unwrap(), "0");
    }

    #[tokio::test]
    async fn test_validation_blocks_and_body_survives() {
        let h = default_harness();
        let auth = bearer(&h.tokens, &["read"]);

        let req = Request::post("/echo")
            .header(header::AUTHORIZATION, &auth)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"q": "1 UNION SELECT secret"}"#))
            .unwrap();
        let response = send(&h.app, req).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("sql_injection"));

        let clean = r#"{"q": "hello"}"#;
        let req = Request::post("/echo")
            .header(header::AUTHORIZATION, &auth)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(clean))
            .unwrap();
        let response = send(&h.app, req).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, clean);
    }

    #[tokio::test]
    async fn test_monitor_mode_logs_and_allows() {
        let h = harness(100, ValidationMode::Monitor, Stage::DEFAULT_ORDER.to_vec());
        let payload = r#"{"q": "<script>alert(1)</script>"}"#;
        let req = Request::post("/echo")
            .header(header::AUTHORIZATION, bearer(&h.tokens, &["read"]))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(payload))
            .unwrap();
        let response = send(&h.app, req).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, payload);
    }

    #[tokio::test]
    async fn test_oversized_body_is_413() {
        let h = default_harness();
        let req = Request::post("/echo")
            .header(header::AUTHORIZATION, bearer(&h.tokens, &["read"]))
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from("a".repeat(1024)))
            .unwrap();
        assert_eq!(send(&h.app, req).await.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_stage_order_decides_first_rejection() {
        // Validation first: bad input without credentials is a 400
        let h = default_harness();
        let req = Request::get("/whoami?q=%3Cscript%3E").body(Body::empty()).unwrap();
        assert_eq!(send(&h.app, req).await.status(), StatusCode::BAD_REQUEST);

        // Authentication first: the same request is a 401
        let h = harness(
            100,
            ValidationMode::Block,
            vec![Stage::Authenticate, Stage::Validate, Stage::RateLimit],
        );
        let req = Request::get("/whoami?q=%3Cscript%3E").body(Body::empty()).unwrap();
        assert_eq!(send(&h.app, req).await.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_admit_future_is_send() {
        fn assert_send<T: Send>(_: T) {}

        let h = default_harness();
        let req = Request::get("/whoami")
            .header(header::AUTHORIZATION, bearer(&h.tokens, &["read"]))
            .body(Body::empty())
            .unwrap();
        assert_send(h.pipeline.admit(req));
    }

    #[tokio::test]
    async fn test_store_outage_fail_closed_is_503() {
        let h = outage_harness(StoreFailurePolicy::FailClosed);

        // Revocation lookup
        let req = Request::get("/whoami")
            .header(header::AUTHORIZATION, bearer(&h.tokens, &["read"]))
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&h.app, req).await.status(), StatusCode::SERVICE_UNAVAILABLE);

        // Rate-limit counter on a public path
        let req = Request::get("/health").body(Body::empty()).unwrap();
        let response = send(&h.app, req).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(body_string(response).await.contains("store_unavailable"));
    }

    #[tokio::test]
    async fn test_store_outage_fail_open_admits() {
        let h = outage_harness(StoreFailurePolicy::FailOpen);

        let req = Request::get("/whoami")
            .header(header::AUTHORIZATION, bearer(&h.tokens, &["read"]))
            .body(Body::empty())
            .unwrap();
        let response = send(&h.app, req).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(RATE_LIMIT_LIMIT_HEADER).is_none());
        assert_eq!(body_string(response).await, "alice");

        let req = Request::get("/health").body(Body::empty()).unwrap();
        assert_eq!(send(&h.app, req).await.status(), StatusCode::OK);

        // Without the store a bad token is still rejected
        let req = Request::get("/whoami")
            .header(header::AUTHORIZATION, "Bearer not.a.token")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&h.app, req).await.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_stage_order_validation() {
        assert!(Stage::validate_order(&Stage::DEFAULT_ORDER).is_ok());
        assert!(Stage::validate_order(&[Stage::Validate, Stage::RateLimit]).is_ok());
        assert!(Stage::validate_order(&[Stage::Authorize, Stage::Authenticate]).is_err());
        assert!(Stage::validate_order(&[Stage::Authorize]).is_err());
        assert!(Stage::validate_order(&[Stage::Validate, Stage::Validate]).is_err());
        assert_eq!("rate_limit".parse::<Stage>().unwrap(), Stage::RateLimit);
        assert!("firewall".parse::<Stage>().is_err());
    }

    #[test]
    fn test_public_path_matching() {
        let settings = PipelineSettings {
            order: Stage::DEFAULT_ORDER.to_vec(),
            validation_mode: ValidationMode::Block,
            max_body_size: 1,
            public_paths: vec!["/health".to_string()],
            public_prefixes: vec!["/docs".to_string()],
            route_scopes: RouteScopes::default(),
            failure_policy: StoreFailurePolicy::FailClosed,
            trusted_proxies: TrustedProxyConfig::default(),
        };
        assert!(settings.is_public("/health"));
        assert!(!settings.is_public("/health/"));
        assert!(settings.is_public("/docs/api"));
        assert!(!settings.is_public("/docsx"));
    }
}
