//! Session token issuing and verification (HS256 JWT).
//!
//! Tokens bind a subject, username and role to a fixed issuer and audience and
//! expire after a short lifetime (two hours by default). Verification is pure
//! and synchronous so any pipeline stage can call it.
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
    errors::ErrorKind,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::JwtConfig;

/// Why a token was refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Token expired")]
    Expired,

    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Token rejected: {0}")]
    Rejected(String),

    #[error("Token signing failed: {0}")]
    Signing(String),
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => TokenError::Expired,
            ErrorKind::InvalidToken
            | ErrorKind::InvalidSignature
            | ErrorKind::InvalidAlgorithm
            | ErrorKind::InvalidAlgorithmName
            | ErrorKind::MissingAlgorithm
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_) => TokenError::Malformed(err.to_string()),
            _ => TokenError::Rejected(err.to_string()),
        }
    }
}

/// The identity a session token vouches for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub subject_id: String,
    pub username: String,
    pub role: String,
}

impl SessionIdentity {
    pub fn new(
        subject_id: impl Into<String>,
        username: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            username: username.into(),
            role: role.into(),
        }
    }
}

/// Decoded session token claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject (user ID)
    pub sub: String,
    pub username: String,
    pub role: String,
    /// Issued at (seconds since epoch)
    pub iat: i64,
    /// Expiration (seconds since epoch)
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

impl SessionClaims {
    pub fn identity(&self) -> SessionIdentity {
        SessionIdentity::new(&self.sub, &self.username, &self.role)
    }
}

/// Issues and verifies session tokens with one process-wide secret.
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    audience: String,
    ttl: Duration,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("ttl", &self.ttl)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl TokenService {
    /// Create a token service
    pub fn new(
        secret: &str,
        issuer: impl Into<String>,
        audience: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let issuer = issuer.into();
        let audience = audience.into();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&issuer]);
        validation.set_audience(&[&audience]);
        validation.set_required_spec_claims(&["exp", "iat", "iss", "aud", "sub"]);
        validation.validate_exp = true;
        validation.leeway = 0;

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            issuer,
            audience,
            ttl,
        }
    }

    /// Build from the `[jwt]` configuration section.
    pub fn from_config(config: &JwtConfig) -> eyre::Result<Self> {
        let ttl = config
            .ttl_duration()
            .map_err(|e| eyre::eyre!("Invalid jwt.ttl '{}': {}", config.ttl, e))?;
        Ok(Self::new(
            &config.secret,
            config.issuer.clone(),
            config.audience.clone(),
            ttl,
        ))
    }

    /// Token lifetime
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Sign a new token for `identity`, valid for the configured lifetime.
    pub fn issue(&self, identity: &SessionIdentity) -> Result<String, TokenError> {
        let now = Utc::now().timestamp();
        let claims = SessionClaims {
            sub: identity.subject_id.clone(),
            username: identity.username.clone(),
            role: identity.role.clone(),
            iat: now,
            exp: now + self.ttl.as_secs() as i64,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };
        self.encode_claims(&claims)
    }

    fn encode_claims(&self, claims: &SessionClaims) -> Result<String, TokenError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }

    /// Verify signature, expiry, issuer and audience; return the claims unchanged.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, TokenError> {
        if token.trim().is_empty() {
            return Err(TokenError::Malformed("empty token".to_string()));
        }

        let data = decode::<SessionClaims>(token, &self.decoding_key, &self.validation)?;
        let claims = data.claims;

        // jsonwebtoken treats exp == now as still valid; a token is dead at its expiry second
        if claims.exp <= Utc::now().timestamp() {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }

    /// True when the token cannot be verified for any reason.
    pub fn is_expired(&self, token: &str) -> bool {
        self.verify(token).is_err()
    }
}
