//! Axum middleware for the coarse request gate.
//!
//! [`request_gate_middleware`] runs in front of every route. It loads the
//! current [`SecurityService`](crate::core::SecurityService) snapshot, asks the
//! gate for a decision and turns that decision into a response or lets the
//! request through with the verified identity attached. Whatever happens, the
//! outgoing response carries the security headers and CORS headers.
use std::{convert::Infallible, net::SocketAddr};

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};

use crate::{
    adapters::http_handler::json_error,
    core::{
        GateDecision, SessionClaims, SharedSecurity,
        gate::GateRequest,
        session::{self, ClientIp},
    },
    metrics::{self, RequestTimer},
    tracing_setup,
};

/// Client address for a request: the gate's resolution when present,
/// otherwise forwarding headers and the socket peer.
pub fn resolve_client_ip(headers: &HeaderMap, extensions: &http::Extensions) -> ClientIp {
    if let Some(ip) = extensions.get::<ClientIp>() {
        return ip.clone();
    }
    let peer = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    ClientIp(session::client_ip(headers, peer))
}

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(resolve_client_ip(&parts.headers, &parts.extensions))
    }
}

/// The request's `Origin` header, if it is valid text.
pub fn request_origin(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

/// Replace the identity headers with the verified claims.
pub fn set_identity_headers(headers: &mut HeaderMap, claims: &SessionClaims) {
    let pairs = [
        (session::USER_ID_HEADER, claims.sub.as_str()),
        (session::USER_USERNAME_HEADER, claims.username.as_str()),
        (session::USER_ROLE_HEADER, claims.role.as_str()),
    ];
    for (name, value) in pairs {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(_) => tracing::warn!(header = name, "Claim is not a valid header value"),
        }
    }
}

fn strip_identity_headers(headers: &mut HeaderMap) {
    for name in session::IDENTITY_HEADERS {
        headers.remove(name);
    }
}

/// Run the request gate.
///
/// Identity headers sent by the client are always dropped; only the gate
/// may set them, and only from a verified token.
pub async fn request_gate_middleware(
    State(shared): State<SharedSecurity>,
    mut req: Request,
    next: Next,
) -> Response {
    let _timer = RequestTimer::new("gate");
    let security = shared.load_full();

    let ClientIp(ip) = resolve_client_ip(req.headers(), req.extensions());
    strip_identity_headers(req.headers_mut());
    let origin = request_origin(req.headers());
    let secure_cookie = security.environment().is_production();

    let decision = security.gate().evaluate(
        GateRequest {
            method: req.method(),
            path: req.uri().path(),
            headers: req.headers(),
            client_ip: &ip,
        },
        security.tokens(),
        security.events(),
    );
    metrics::increment_request_outcome(decision.outcome());
    tracing::debug!(
        path = %req.uri().path(),
        outcome = decision.outcome(),
        "Request gate decision"
    );

    let mut response = match decision {
        GateDecision::Block { status, body } => (status, body).into_response(),
        GateDecision::Preflight => security.cors().preflight(origin.as_deref()),
        GateDecision::Redirect {
            location,
            clear_cookie,
        } => {
            let mut response = Redirect::temporary(&location).into_response();
            if let Some(cleared) = clear_cookie
                .then(|| session::clear_session_cookie(secure_cookie))
                .flatten()
            {
                response.headers_mut().insert(header::SET_COOKIE, cleared);
            }
            response
        }
        GateDecision::Unauthorized { clear_cookie } => {
            let mut response = json_error(
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Authentication required",
            );
            if let Some(cleared) = clear_cookie
                .then(|| session::clear_session_cookie(secure_cookie))
                .flatten()
            {
                response.headers_mut().insert(header::SET_COOKIE, cleared);
            }
            response
        }
        GateDecision::Bypass | GateDecision::Proceed(None) => {
            req.extensions_mut().insert(ClientIp(ip));
            next.run(req).await
        }
        GateDecision::Proceed(Some(claims)) => {
            set_identity_headers(req.headers_mut(), &claims);
            req.extensions_mut().insert(ClientIp(ip));
            req.extensions_mut().insert(claims);
            next.run(req).await
        }
    };

    security.finish_response(response.headers_mut(), origin.as_deref());
    response
}

/// Tag each request with a UUID, exposed as a tracing span and `X-Request-ID`.
pub async fn request_id_middleware(req: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let ClientIp(ip) = resolve_client_ip(req.headers(), req.extensions());
    let span = tracing_setup::create_request_span(
        &request_id,
        req.method().as_str(),
        req.uri().path(),
        &ip,
    );

    let mut response = tracing::Instrument::instrument(next.run(req), span.clone()).await;
    span.record("http.status_code", response.status().as_u16());

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}
