pub mod audit;
pub mod credential;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod lockout;
pub mod notify;
pub mod oauth;
pub mod rate_limit;
pub mod store;
pub mod token;
pub mod two_factor;

pub use audit::{AuditSink, MemoryAuditSink, TracingAuditSink};
pub use credential::{Argon2Verifier, CredentialVerifier};
pub use directory::{IdentityDirectory, MemoryDirectory};
pub use error::GatewayError;
pub use gateway::{
    AccountStatus, AuthGateway, LoginOutcome, LoginRequest, OAuthCallback, TwoFactorChallenge,
};
pub use lockout::{FailureRecord, LockoutTracker};
pub use notify::{LoggingNotifier, MemoryNotifier, OutboundNotifier};
pub use oauth::{OAuthLinker, OAuthResolution};
pub use rate_limit::{EndpointClass, RateDecision, RateLimiter, RateScope};
pub use store::{AuthStore, CasOutcome, MemoryStore, RedisStore};
pub use token::TokenLifecycleManager;
pub use two_factor::TwoFactorEngine;
