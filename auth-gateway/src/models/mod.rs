pub mod audit_event;
pub mod identity;
pub mod lockout;
pub mod oauth_identity;
pub mod token;
pub mod totp;

pub use audit_event::{AuditEvent, AuditEventKind, AuditOutcome};
pub use identity::Identity;
pub use lockout::LockoutState;
pub use oauth_identity::{OAuthIdentity, OAuthProvider};
pub use token::{Claims, TokenPair, TokenType};
pub use totp::{BackupCodeSet, BackupCodeStatus, TotpSecret};
