//! Session cookie and caller identification helpers shared by the gate, the
//! API guard and the auth handlers.
use std::{net::SocketAddr, time::Duration};

use cookie::{Cookie, CookieBuilder, SameSite, time::Duration as CookieDuration};
use http::{HeaderMap, HeaderValue, header};

pub use crate::config::SESSION_COOKIE_NAME;

/// Headers carrying the verified identity to downstream handlers.
pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_USERNAME_HEADER: &str = "x-user-username";
pub const USER_ROLE_HEADER: &str = "x-user-role";

pub const IDENTITY_HEADERS: [&str; 3] = [USER_ID_HEADER, USER_USERNAME_HEADER, USER_ROLE_HEADER];

/// Caller address resolved once by the gate and shared with later stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

/// Value of cookie `name` from the request's `Cookie` headers, with any
/// surrounding double quotes removed.
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(Result::ok)
        .find(|cookie| cookie.name() == name)
        .map(|cookie| cookie.value_trimmed().trim().to_string())
        .filter(|value| !value.is_empty())
}

/// The session token carried in the `auth-token` cookie, if any.
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    read_cookie(headers, SESSION_COOKIE_NAME)
}

/// Token from `Authorization: Bearer ...`, falling back to the session cookie.
pub fn bearer_or_cookie_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
        })
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .or_else(|| session_token(headers))
}

fn session_cookie_builder(value: &str, secure: bool) -> CookieBuilder<'_> {
    Cookie::build((SESSION_COOKIE_NAME, value))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Strict)
}

fn to_header(cookie: Cookie<'_>) -> Option<HeaderValue> {
    HeaderValue::from_str(&cookie.to_string()).ok()
}

/// `Set-Cookie` value installing a session token.
pub fn session_cookie(token: &str, max_age: Duration, secure: bool) -> Option<HeaderValue> {
    let seconds = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
    to_header(
        session_cookie_builder(token, secure)
            .max_age(CookieDuration::seconds(seconds))
            .build(),
    )
}

/// `Set-Cookie` value deleting the session cookie (`Max-Age=0`).
pub fn clear_session_cookie(secure: bool) -> Option<HeaderValue> {
    to_header(
        session_cookie_builder("", secure)
            .max_age(CookieDuration::ZERO)
            .build(),
    )
}

/// Best-effort caller address: first `X-Forwarded-For` hop, then
/// `X-Real-IP`, then the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    forwarded
        .or_else(real_ip)
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_read_cookie() {
        let h = headers(&[("cookie", "theme=dark; auth-token=abc.def.ghi; lang=en")]);
        assert_eq!(session_token(&h).as_deref(), Some("abc.def.ghi"));
        assert_eq!(read_cookie(&h, "lang").as_deref(), Some("en"));
        assert_eq!(read_cookie(&h, "missing"), None);

        let empty = headers(&[("cookie", "auth-token=")]);
        assert_eq!(session_token(&empty), None);
    }

    #[test]
    fn test_quoted_cookie_value_is_unquoted() {
        let h = headers(&[("cookie", "auth-token=\"abc.def.ghi\"")]);
        assert_eq!(session_token(&h).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn test_cookie_across_multiple_headers() {
        let h = headers(&[("cookie", "theme=dark"), ("cookie", "auth-token=second")]);
        assert_eq!(session_token(&h).as_deref(), Some("second"));
    }

    #[test]
    fn test_bearer_wins_over_cookie() {
        let h = headers(&[
            ("authorization", "Bearer from-header"),
            ("cookie", "auth-token=from-cookie"),
        ]);
        assert_eq!(bearer_or_cookie_token(&h).as_deref(), Some("from-header"));

        let cookie_only = headers(&[("cookie", "auth-token=from-cookie")]);
        assert_eq!(bearer_or_cookie_token(&cookie_only).as_deref(), Some("from-cookie"));
    }

    #[test]
    fn test_cookie_attributes() {
        let prod = session_cookie("t0k", Duration::from_secs(7200), true).unwrap();
        let parsed = Cookie::parse(prod.to_str().unwrap().to_string()).unwrap();
        assert_eq!(parsed.name(), SESSION_COOKIE_NAME);
        assert_eq!(parsed.value(), "t0k");
        assert_eq!(parsed.path(), Some("/"));
        assert_eq!(parsed.http_only(), Some(true));
        assert_eq!(parsed.secure(), Some(true));
        assert_eq!(parsed.same_site(), Some(SameSite::Strict));
        assert_eq!(parsed.max_age(), Some(CookieDuration::seconds(7200)));

        let dev = session_cookie("t0k", Duration::from_secs(7200), false).unwrap();
        assert!(!dev.to_str().unwrap().contains("Secure"));
    }

    #[test]
    fn test_clear_cookie() {
        let cleared = clear_session_cookie(true).unwrap();
        let parsed = Cookie::parse(cleared.to_str().unwrap().to_string()).unwrap();
        assert_eq!(parsed.name(), SESSION_COOKIE_NAME);
        assert_eq!(parsed.value(), "");
        assert_eq!(parsed.max_age(), Some(CookieDuration::ZERO));
        assert_eq!(parsed.path(), Some("/"));
        assert_eq!(parsed.secure(), Some(true));
    }

    #[test]
    fn test_client_ip_precedence() {
        let peer: SocketAddr = "10.1.1.1:5555".parse().unwrap();
        let h = headers(&[("x-forwarded-for", "203.0.113.7, 10.0.0.1"), ("x-real-ip", "198.51.100.2")]);
        assert_eq!(client_ip(&h, Some(peer)), "203.0.113.7");

        let h = headers(&[("x-real-ip", "198.51.100.2")]);
        assert_eq!(client_ip(&h, Some(peer)), "198.51.100.2");

        assert_eq!(client_ip(&HeaderMap::new(), Some(peer)), "10.1.1.1");
        assert_eq!(client_ip(&HeaderMap::new(), None), "unknown");
    }
}
