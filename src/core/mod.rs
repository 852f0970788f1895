pub mod events;
pub mod gate;
pub mod guard;
pub mod headers;
pub mod rate_limiter;
pub mod sanitizer;
pub mod security_service;
pub mod session;
pub mod token;

pub use events::{SecurityEvent, SecurityEventLog, Severity};
pub use gate::{GateDecision, RequestGate};
pub use guard::{GuardOptions, SanitizedPayload};
pub use rate_limiter::{RateLimitDecision, RateLimiter};
pub use security_service::{SecurityService, SharedSecurity};
pub use token::{SessionClaims, SessionIdentity, TokenError, TokenService};
