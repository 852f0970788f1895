//! HTTP surface of the pipeline: the auth endpoints, their error type and
//! the router that puts the request gate in front of everything.
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::{
    adapters::{
        guard_layer::ApiGuardLayer,
        middleware::{request_gate_middleware, request_id_middleware},
    },
    config::AdminConfig,
    core::{
        GuardOptions, SessionClaims, SessionIdentity, SharedSecurity,
        events::Severity,
        guard::InternalErrorDetail,
        sanitizer,
        session::{self, ClientIp},
    },
    metrics,
};

/// Errors returned by the pipeline's own handlers.
///
/// Every variant renders as `{success:false, error, message}`. `Internal`
/// keeps its detail server-side and answers with a generic 500.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Too many login attempts. Please try again later.")]
    RateLimited { retry_after: u64 },

    #[error("{0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    pub fn status(&self) -> StatusCode {
        match self {
            HandlerError::Unauthorized | HandlerError::InvalidCredentials => {
                StatusCode::UNAUTHORIZED
            }
            HandlerError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            HandlerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HandlerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code of the JSON body.
    pub fn code(&self) -> &'static str {
        match self {
            HandlerError::Unauthorized => "UNAUTHORIZED",
            HandlerError::InvalidCredentials => "INVALID_CREDENTIALS",
            HandlerError::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            HandlerError::BadRequest(_) => "BAD_REQUEST",
            HandlerError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        match self {
            HandlerError::Internal(detail) => {
                tracing::error!(error = %detail, "Handler failed");
                let mut response = internal_error_response();
                response.extensions_mut().insert(InternalErrorDetail(detail));
                response
            }
            HandlerError::RateLimited { retry_after } => {
                let mut response =
                    json_error(self.status(), self.code(), &self.to_string());
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
                response
            }
            other => json_error(other.status(), other.code(), &other.to_string()),
        }
    }
}

/// `{success:false, error, message}` with the given status.
pub fn json_error(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "success": false,
            "error": code,
            "message": message,
        })),
    )
        .into_response()
}

/// The only 500 body a caller ever sees.
pub fn internal_error_response() -> Response {
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "Internal server error",
    )
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn credentials_match(admin: &AdminConfig, username: &str, password: &str) -> bool {
    let user_ok = admin.username.as_bytes().ct_eq(username.as_bytes());
    let password_ok = admin.password.as_bytes().ct_eq(password.as_bytes());
    (user_ok & password_ok).into()
}

fn user_json(identity: &SessionIdentity) -> Value {
    json!({
        "id": identity.subject_id,
        "username": identity.username,
        "role": identity.role,
    })
}

/// `POST /api/auth/login`
///
/// Attempts are counted per `ip + username` before the credentials are
/// checked, so a throttled caller learns nothing about the password. A
/// successful login clears the counter.
pub async fn login(
    State(shared): State<SharedSecurity>,
    ClientIp(ip): ClientIp,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Response, HandlerError> {
    let Json(payload) = payload.map_err(|e| HandlerError::BadRequest(e.body_text()))?;
    let security = shared.load_full();

    let username = sanitizer::sanitize_text(&payload.username);
    if username.is_empty() || payload.password.is_empty() {
        return Err(HandlerError::BadRequest(
            "Username and password are required".to_string(),
        ));
    }

    let settings = &security.config().rate_limit;
    let window = settings
        .login_window_duration()
        .unwrap_or(Duration::from_secs(15 * 60));
    let key = format!("login:{ip}:{username}");
    let decision = security
        .limiter()
        .check(&key, settings.login_max_attempts, window)
        .await;

    if !decision.allowed {
        security.events().log(
            "login_rate_limited",
            Severity::High,
            json!({
                "ip": ip,
                "username": username,
                "resetAt": decision.reset_at.to_rfc3339(),
            }),
        );
        metrics::increment_rate_limit_rejection("login");
        return Err(HandlerError::RateLimited {
            retry_after: decision.retry_after_secs(),
        });
    }

    let admin = &security.config().admin;
    if !credentials_match(admin, &username, &payload.password) {
        security.events().log(
            "login_failed",
            Severity::Medium,
            json!({
                "ip": ip,
                "username": username,
                "remainingAttempts": decision.remaining,
            }),
        );
        return Err(HandlerError::InvalidCredentials);
    }

    let identity = SessionIdentity::new(&admin.user_id, &admin.username, &admin.role);
    let token = security
        .tokens()
        .issue(&identity)
        .map_err(|e| HandlerError::Internal(e.to_string()))?;
    let ttl = security.tokens().ttl();
    let cookie = session::session_cookie(&token, ttl, security.environment().is_production())
        .ok_or_else(|| HandlerError::Internal("session cookie is not a valid header".to_string()))?;

    security.limiter().reset(&key).await;
    security.events().log(
        "login_success",
        Severity::Low,
        json!({"ip": ip, "username": identity.username}),
    );

    let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
    let mut response = Json(json!({
        "success": true,
        "user": user_json(&identity),
        "expiresAt": expires_at.to_rfc3339(),
    }))
    .into_response();
    response.headers_mut().insert(header::SET_COOKIE, cookie);
    Ok(response)
}

/// `POST /api/auth/logout`
pub async fn logout(
    State(shared): State<SharedSecurity>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
) -> Response {
    let security = shared.load_full();
    let username = session::session_token(&headers)
        .and_then(|token| security.tokens().verify(&token).ok())
        .map(|claims| claims.username);

    security.events().log(
        "logout",
        Severity::Low,
        json!({"ip": ip, "username": username}),
    );

    let mut response = Json(json!({"success": true})).into_response();
    if let Some(cleared) = session::clear_session_cookie(security.environment().is_production()) {
        response.headers_mut().insert(header::SET_COOKIE, cleared);
    }
    response
}

/// `GET /api/auth/session`. Mounted behind a guard that requires auth, which
/// provides the claims.
pub async fn current_session(
    axum::Extension(claims): axum::Extension<SessionClaims>,
) -> Json<Value> {
    Json(json!({
        "success": true,
        "user": user_json(&claims.identity()),
        "expiresAt": claims.exp,
    }))
}

/// `GET /api/public/health`
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

/// The auth and public endpoints, each with its guard.
///
/// Login is deliberately unguarded: body sanitization would alter passwords.
/// It has its own attempt counter instead of the API limit.
pub fn auth_routes(shared: SharedSecurity) -> Router {
    let logout_guard = ApiGuardLayer::new(
        shared.clone(),
        GuardOptions::new()
            .methods([Method::POST])
            .without_rate_limit(),
    );
    let session_guard = ApiGuardLayer::new(
        shared.clone(),
        GuardOptions::new().methods([Method::GET]).require_auth(true),
    );

    Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout).layer(logout_guard))
        .route("/api/auth/session", get(current_session).layer(session_guard))
        .route("/api/public/health", get(health))
        .with_state(shared)
}

/// Put the request gate, request IDs and request tracing in front of `app`.
pub fn secure_router(shared: SharedSecurity, app: Router) -> Router {
    app.layer(middleware::from_fn_with_state(
        shared,
        request_gate_middleware,
    ))
    .layer(middleware::from_fn(request_id_middleware))
    .layer(TraceLayer::new_for_http())
}

/// The complete service: auth endpoints plus a 404 fallback, all gated.
pub fn build_router(shared: SharedSecurity) -> Router {
    let app = auth_routes(shared.clone()).fallback(not_found);
    secure_router(shared, app)
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        config::{Environment, SecurityConfig},
        core::SecurityService,
    };

    fn shared() -> SharedSecurity {
        let config = SecurityConfig::builder()
            .environment(Environment::Test)
            .jwt_secret("handler-test-secret-handler-test!")
            .admin("root", "hunter2-hunter2")
            .build()
            .unwrap();
        SecurityService::with_defaults(config).unwrap().into_shared()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn login_request(username: &str, password: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header("content-type", "application/json")
            .header("x-forwarded-for", "203.0.113.7")
            .body(Body::from(
                json!({"username": username, "password": password}).to_string(),
            ))
            .unwrap()
    }

    #[test]
    fn test_error_codes_and_statuses() {
        assert_eq!(HandlerError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(HandlerError::InvalidCredentials.code(), "INVALID_CREDENTIALS");
        assert_eq!(
            HandlerError::RateLimited { retry_after: 3 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            HandlerError::BadRequest("x".to_string()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_internal_error_hides_detail() {
        let response = HandlerError::Internal("db password is wrong".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.extensions().get::<InternalErrorDetail>().is_some());

        let body = body_json(response).await;
        assert_eq!(body["error"], "INTERNAL_ERROR");
        assert_eq!(body["message"], "Internal server error");
        assert!(!body.to_string().contains("db password"));
    }

    #[tokio::test]
    async fn test_rate_limited_sets_retry_after() {
        let response = HandlerError::RateLimited { retry_after: 42 }.into_response();
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");
        assert_eq!(body_json(response).await["error"], "RATE_LIMIT_EXCEEDED");
    }

    #[test]
    fn test_credentials_match() {
        let admin = AdminConfig {
            username: "root".to_string(),
            password: "pw".to_string(),
            ..AdminConfig::default()
        };
        assert!(credentials_match(&admin, "root", "pw"));
        assert!(!credentials_match(&admin, "root", "pw2"));
        assert!(!credentials_match(&admin, "admin", "pw"));
        assert!(!credentials_match(&admin, "", ""));
    }

    #[tokio::test]
    async fn test_login_sets_cookie() {
        let app = build_router(shared());
        let response = app
            .oneshot(login_request("root", "hunter2-hunter2"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        assert!(cookie.starts_with("auth-token="));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Strict"));
        assert!(cookie.contains("Max-Age=7200"));
        assert!(!cookie.contains("Secure"));

        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["user"]["username"], "root");
    }

    #[tokio::test]
    async fn test_login_wrong_password() {
        let app = build_router(shared());
        let response = app.oneshot(login_request("root", "nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get(header::SET_COOKIE).is_none());
        assert_eq!(body_json(response).await["error"], "INVALID_CREDENTIALS");
    }

    #[tokio::test]
    async fn test_login_requires_fields() {
        let app = build_router(shared());
        let response = app.oneshot(login_request("   ", "x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let shared = shared();
        let app = build_router(shared.clone());

        let login = app
            .clone()
            .oneshot(login_request("root", "hunter2-hunter2"))
            .await
            .unwrap();
        let cookie = login.headers()[header::SET_COOKIE].to_str().unwrap();
        let pair = cookie.split(';').next().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/auth/session")
                    .header("cookie", pair)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["user"]["role"], "admin");

        let anonymous = app
            .oneshot(
                Request::builder()
                    .uri("/api/auth/session")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_logout_clears_cookie() {
        let app = build_router(shared());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/auth/logout")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::SET_COOKIE]
            .to_str()
            .unwrap()
            .contains("Max-Age=0"));
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let app = build_router(shared());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/public/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-frame-options"], "DENY");
        assert_eq!(body_json(response).await["status"], "healthy");
    }
}
