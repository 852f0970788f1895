//! Tower layer wrapping a single route with the API guard.
//!
//! Order of checks: method allow-list, API rate limit, body read and
//! validation, authentication, then the inner handler. The inner handler sees
//! the sanitized JSON body and the verified claims as request extensions.
//! Panics and [`InternalErrorDetail`] responses from the handler are logged
//! with their detail and replaced by the generic 500.
use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::Arc,
    task::{Context, Poll},
};

use axum::{
    body::{Body, Bytes},
    extract::Request,
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures_util::{FutureExt, future::BoxFuture};
use serde_json::json;
use tower::{Layer, Service};

use crate::{
    adapters::{
        http_handler::{internal_error_response, json_error},
        middleware::{request_origin, resolve_client_ip, set_identity_headers},
    },
    core::{
        GuardOptions, RateLimitDecision, SanitizedPayload, SecurityService, SessionClaims,
        SharedSecurity,
        events::Severity,
        guard::{self, GuardPolicy, InternalErrorDetail, ValidationInput},
        session::{self, ClientIp},
    },
    metrics::{self, RequestTimer},
};

/// Wraps a route with the API guard.
#[derive(Clone)]
pub struct ApiGuardLayer {
    shared: SharedSecurity,
    options: Arc<GuardOptions>,
}

impl ApiGuardLayer {
    pub fn new(shared: SharedSecurity, options: GuardOptions) -> Self {
        Self {
            shared,
            options: Arc::new(options),
        }
    }
}

impl<S> Layer<S> for ApiGuardLayer {
    type Service = ApiGuardService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ApiGuardService {
            inner,
            shared: self.shared.clone(),
            options: self.options.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ApiGuardService<S> {
    inner: S,
    shared: SharedSecurity,
    options: Arc<GuardOptions>,
}

impl<S> Service<Request> for ApiGuardService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        // the clone may not be ready; keep the one that was polled
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let security = self.shared.load_full();
        let options = self.options.clone();

        Box::pin(guard_request(inner, security, options, req))
    }
}

/// Request facts logged with every `api_access` event.
struct AccessContext {
    method: Method,
    path: String,
    ip: String,
    origin: Option<String>,
}

async fn guard_request<S>(
    mut inner: S,
    security: Arc<SecurityService>,
    options: Arc<GuardOptions>,
    req: Request,
) -> Result<Response, S::Error>
where
    S: Service<Request, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
{
    let timer = RequestTimer::new("guard");
    let policy = options.resolve(security.config());
    let ClientIp(ip) = resolve_client_ip(req.headers(), req.extensions());
    let ctx = AccessContext {
        method: req.method().clone(),
        path: req.uri().path().to_owned(),
        origin: request_origin(req.headers()),
        ip,
    };

    let mut rate_limit = None;
    let mut user = None;

    let mut response = match screen(req, &security, &policy, &ctx).await {
        Screened::Rejected(response) => response,
        Screened::RateLimited(response, decision) => {
            rate_limit = Some(decision);
            response
        }
        Screened::Passed {
            request,
            decision,
            claims,
        } => {
            rate_limit = decision;
            user = claims.map(|c| c.username);
            run_inner(&mut inner, request, &security, &ctx).await?
        }
    };

    security.finish_response(response.headers_mut(), ctx.origin.as_deref());
    if let Some(decision) = &rate_limit {
        apply_rate_limit_headers(response.headers_mut(), decision);
    }

    let status = response.status();
    security.events().log(
        "api_access",
        guard::access_severity(status),
        json!({
            "method": ctx.method.as_str(),
            "path": ctx.path,
            "status": status.as_u16(),
            "ip": ctx.ip,
            "user": user,
            "durationMs": timer.elapsed().as_millis() as u64,
        }),
    );

    Ok(response)
}

enum Screened {
    Rejected(Response),
    RateLimited(Response, RateLimitDecision),
    Passed {
        request: Request,
        decision: Option<RateLimitDecision>,
        claims: Option<SessionClaims>,
    },
}

async fn screen(
    req: Request,
    security: &SecurityService,
    policy: &GuardPolicy,
    ctx: &AccessContext,
) -> Screened {
    if ctx.method == Method::OPTIONS {
        return Screened::Rejected(security.cors().preflight(ctx.origin.as_deref()));
    }

    if !policy.allows_method(&ctx.method) {
        let mut response = json_error(
            StatusCode::METHOD_NOT_ALLOWED,
            "METHOD_NOT_ALLOWED",
            &format!("Method {} not allowed", ctx.method),
        );
        if let Ok(allow) = HeaderValue::from_str(&policy.allow_header()) {
            response.headers_mut().insert(header::ALLOW, allow);
        }
        return Screened::Rejected(response);
    }

    let decision = match policy.rate_limit {
        Some((max_requests, window)) => {
            let decision = security
                .limiter()
                .check(&format!("api:{}", ctx.ip), max_requests, window)
                .await;
            if !decision.allowed {
                security.events().log(
                    "rate_limit_exceeded",
                    Severity::Medium,
                    json!({
                        "ip": ctx.ip,
                        "path": ctx.path,
                        "method": ctx.method.as_str(),
                        "limit": decision.limit,
                    }),
                );
                metrics::increment_rate_limit_rejection("api");
                let mut response = json_error(
                    StatusCode::TOO_MANY_REQUESTS,
                    "RATE_LIMIT_EXCEEDED",
                    "Too many requests. Please try again later.",
                );
                response.headers_mut().insert(
                    header::RETRY_AFTER,
                    HeaderValue::from(decision.retry_after_secs()),
                );
                return Screened::RateLimited(response, decision);
            }
            Some(decision)
        }
        None => None,
    };

    let (mut parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, policy.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let too_large = std::error::Error::source(&e)
                .is_some_and(|source| source.is::<http_body_util::LengthLimitError>());
            let response = if too_large {
                payload_too_large(policy.max_body_bytes)
            } else {
                json_error(
                    StatusCode::BAD_REQUEST,
                    "BAD_REQUEST",
                    "Failed to read request body",
                )
            };
            return Screened::Rejected(response);
        }
    };

    let validation = guard::validate_request(
        ValidationInput {
            method: &parts.method,
            path: &ctx.path,
            query: parts.uri.query(),
            headers: &parts.headers,
            body: &bytes,
            client_ip: &ctx.ip,
        },
        policy,
        security.events(),
    );

    if validation.too_large {
        return Screened::Rejected(payload_too_large(policy.max_body_bytes));
    }
    if !validation.is_valid {
        let response = (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({
                "success": false,
                "error": "VALIDATION_FAILED",
                "message": "Request validation failed",
                "errors": validation.errors,
                "threats": validation.threats,
            })),
        )
            .into_response();
        return Screened::Rejected(response);
    }

    let claims = if policy.require_auth {
        let verified = session::bearer_or_cookie_token(&parts.headers)
            .map(|token| security.tokens().verify(&token));
        match verified {
            Some(Ok(claims)) => Some(claims),
            Some(Err(e)) => {
                tracing::debug!(path = %ctx.path, error = %e, "Guard rejected token");
                return Screened::Rejected(unauthorized());
            }
            None => return Screened::Rejected(unauthorized()),
        }
    } else {
        parts.extensions.get::<SessionClaims>().cloned()
    };

    let body = match validation.sanitized {
        Some(value) => {
            let rewritten = serde_json::to_vec(&value).map(Bytes::from).unwrap_or(bytes);
            parts
                .headers
                .insert(header::CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
            parts.extensions.insert(SanitizedPayload(value));
            Body::from(rewritten)
        }
        None => Body::from(bytes),
    };

    if let Some(claims) = &claims {
        set_identity_headers(&mut parts.headers, claims);
        parts.extensions.insert(claims.clone());
    }
    parts.extensions.insert(ClientIp(ctx.ip.clone()));

    Screened::Passed {
        request: Request::from_parts(parts, body),
        decision,
        claims,
    }
}

async fn run_inner<S>(
    inner: &mut S,
    request: Request,
    security: &SecurityService,
    ctx: &AccessContext,
) -> Result<Response, S::Error>
where
    S: Service<Request, Response = Response>,
{
    let failure = match AssertUnwindSafe(inner.call(request)).catch_unwind().await {
        Ok(Ok(mut response)) => match response.extensions_mut().remove::<InternalErrorDetail>() {
            Some(InternalErrorDetail(detail)) => detail,
            None => return Ok(response),
        },
        Ok(Err(e)) => return Err(e),
        Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
    };

    security.events().log(
        "api_internal_error",
        Severity::High,
        json!({
            "method": ctx.method.as_str(),
            "path": ctx.path,
            "ip": ctx.ip,
            "error": failure,
        }),
    );
    Ok(internal_error_response())
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn unauthorized() -> Response {
    json_error(
        StatusCode::UNAUTHORIZED,
        "UNAUTHORIZED",
        "Authentication required",
    )
}

fn payload_too_large(limit: usize) -> Response {
    json_error(
        StatusCode::PAYLOAD_TOO_LARGE,
        "PAYLOAD_TOO_LARGE",
        &format!("Request body exceeds {limit} bytes"),
    )
}

fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(decision.reset_epoch_secs()));
}
