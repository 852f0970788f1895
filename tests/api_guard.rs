// API guard mounted on application routes behind the request gate
#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use axum::{
        Extension, Json, Router,
        body::{Body, to_bytes},
        http::{Method, Request, StatusCode, header},
        routing::post,
    };
    use portcullis::{
        ApiGuardLayer, GuardOptions, SecurityService, SharedSecurity,
        config::{Environment, SecurityConfig},
        core::{SanitizedPayload, Severity, events::MemoryEventSink, rate_limiter::RateLimiter},
        secure_router,
    };
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn shared() -> (SharedSecurity, Arc<MemoryEventSink>) {
        let config = SecurityConfig::builder()
            .environment(Environment::Test)
            .jwt_secret("guard-integration-secret-guard-integration")
            .admin("root", "pw")
            .build()
            .unwrap();
        let sink = Arc::new(MemoryEventSink::new());
        let shared = SecurityService::new(
            config,
            RateLimiter::in_memory(Duration::from_secs(60)),
            sink.clone(),
        )
        .unwrap()
        .into_shared();
        (shared, sink)
    }

    async fn create_video(Extension(SanitizedPayload(payload)): Extension<SanitizedPayload>) -> Json<Value> {
        Json(json!({"success": true, "video": payload}))
    }

    fn app(shared: SharedSecurity, options: GuardOptions) -> Router {
        let guard = ApiGuardLayer::new(shared.clone(), options);
        let routes = Router::new().route("/api/videos", post(create_video).layer(guard));
        secure_router(shared, routes)
    }

    fn post_json(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/videos")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_handler_sees_sanitized_payload() {
        let (shared, sink) = shared();
        let app = app(shared, GuardOptions::new().methods([Method::POST]));

        let response = app
            .oneshot(post_json(json!({"title": "  Launch   trailer  ", "views": 3})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "100");
        assert_eq!(response.headers()["x-frame-options"], "DENY");
        let body = json_body(response).await;
        assert_eq!(body["video"]["title"], "Launch trailer");
        assert_eq!(body["video"]["views"], 3);
        assert_eq!(sink.named("api_access").len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sql_injection_is_rejected_and_logged() {
        let (shared, sink) = shared();
        let app = app(shared, GuardOptions::new().methods([Method::POST]));

        let response = app
            .oneshot(post_json(json!({"title": "x' OR '1'='1"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"], "VALIDATION_FAILED");

        let threats = sink.named("api_security_threat");
        assert_eq!(threats.len(), 1);
        assert_eq!(threats[0].severity, Severity::High);
        assert_eq!(threats[0].detail_str("path"), Some("/api/videos"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_route_limit_override() {
        let (shared, sink) = shared();
        let app = app(
            shared,
            GuardOptions::new()
                .methods([Method::POST])
                .rate_limit(2, Duration::from_secs(60)),
        );

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(post_json(json!({"title": "ok"})))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let refused = app.oneshot(post_json(json!({"title": "ok"}))).await.unwrap();
        assert_eq!(refused.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(refused.headers()["x-ratelimit-remaining"], "0");
        assert_eq!(sink.named("rate_limit_exceeded").len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_auth_required_without_session() {
        let (shared, _) = shared();
        let app = app(
            shared,
            GuardOptions::new().methods([Method::POST]).require_auth(true),
        );

        let response = app.oneshot(post_json(json!({"title": "ok"}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"], "UNAUTHORIZED");
    }
}
