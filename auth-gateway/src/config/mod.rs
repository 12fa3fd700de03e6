use std::env;

use serde::Deserialize;

use crate::services::rate_limit::EndpointClass;
use crate::services::GatewayError;

/// Immutable configuration handed to each component at construction.
/// Nothing reads ambient global state after startup.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub environment: Environment,
    /// Issuer label embedded in TOTP provisioning URIs.
    pub issuer: String,
    pub token: TokenConfig,
    pub rate_limit: RateLimitConfig,
    pub lockout: LockoutConfig,
    pub totp: TotpConfig,
    pub store: StoreConfig,
    /// Lifetime of a pending two-factor challenge, in seconds.
    pub challenge_ttl_secs: i64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub signing_secret: String,
    pub access_ttl_minutes: i64,
    pub refresh_ttl_days: i64,
}

impl TokenConfig {
    pub fn access_ttl_seconds(&self) -> i64 {
        self.access_ttl_minutes * 60
    }

    pub fn refresh_ttl_seconds(&self) -> i64 {
        self.refresh_ttl_days * 86_400
    }
}

/// Window and thresholds for one endpoint class.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateRule {
    pub window_secs: i64,
    pub ip_threshold: u32,
    pub identity_threshold: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub login: RateRule,
    pub refresh: RateRule,
    pub two_factor: RateRule,
    pub password_reset: RateRule,
    pub oauth_callback: RateRule,
}

impl RateLimitConfig {
    pub fn rule(&self, class: EndpointClass) -> RateRule {
        match class {
            EndpointClass::Login => self.login,
            EndpointClass::Refresh => self.refresh,
            EndpointClass::TwoFactorVerify => self.two_factor,
            EndpointClass::PasswordReset => self.password_reset,
            EndpointClass::OauthCallback => self.oauth_callback,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockoutConfig {
    /// Consecutive failures within `window_secs` that trigger a lock.
    pub threshold: u32,
    pub window_secs: i64,
    /// First lock duration. Repeated lockout cycles escalate from here.
    pub base_lock_secs: i64,
    pub backoff_factor: u32,
    pub max_lock_secs: i64,
    /// How long a lockout cycle counts toward escalation.
    pub cycle_ttl_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TotpConfig {
    pub digits: usize,
    pub period_secs: u64,
    /// Accepted clock-skew tolerance, in time steps either side of now.
    pub skew_steps: u8,
    pub backup_code_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub op_timeout_ms: u64,
    /// When the backing store is unreachable after the retry, `true` admits
    /// the request and `false` denies it. The choice is always explicit.
    pub fail_open: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Dev,
            issuer: "auth-gateway".to_string(),
            token: TokenConfig {
                signing_secret: "dev-signing-secret-change-me-0123456789".to_string(),
                access_ttl_minutes: 15,
                refresh_ttl_days: 7,
            },
            rate_limit: RateLimitConfig {
                login: RateRule {
                    window_secs: 900,
                    ip_threshold: 20,
                    identity_threshold: 10,
                },
                refresh: RateRule {
                    window_secs: 60,
                    ip_threshold: 30,
                    identity_threshold: 30,
                },
                two_factor: RateRule {
                    window_secs: 300,
                    ip_threshold: 15,
                    identity_threshold: 10,
                },
                password_reset: RateRule {
                    window_secs: 3600,
                    ip_threshold: 5,
                    identity_threshold: 3,
                },
                oauth_callback: RateRule {
                    window_secs: 900,
                    ip_threshold: 20,
                    identity_threshold: 20,
                },
            },
            lockout: LockoutConfig {
                threshold: 5,
                window_secs: 900,
                base_lock_secs: 300,
                backoff_factor: 2,
                max_lock_secs: 14_400,
                cycle_ttl_secs: 86_400,
            },
            totp: TotpConfig {
                digits: 6,
                period_secs: 30,
                skew_steps: 1,
                backup_code_count: 8,
            },
            store: StoreConfig {
                op_timeout_ms: 1500,
                fail_open: false,
            },
            challenge_ttl_secs: 300,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, GatewayError> {
        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| GatewayError::Config(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;
        let defaults = GatewayConfig::default();

        let config = GatewayConfig {
            environment,
            issuer: get_env("GATEWAY_ISSUER", Some(&defaults.issuer), is_prod)?,
            token: TokenConfig {
                signing_secret: get_env("TOKEN_SIGNING_SECRET", None, true)?,
                access_ttl_minutes: parse_env("ACCESS_TOKEN_TTL_MINUTES", 15, is_prod)?,
                refresh_ttl_days: parse_env("REFRESH_TOKEN_TTL_DAYS", 7, is_prod)?,
            },
            rate_limit: RateLimitConfig {
                login: RateRule {
                    window_secs: parse_env("RATE_LIMIT_LOGIN_WINDOW_SECONDS", 900, is_prod)?,
                    ip_threshold: parse_env("RATE_LIMIT_LOGIN_IP_THRESHOLD", 20, is_prod)?,
                    identity_threshold: parse_env("RATE_LIMIT_LOGIN_IDENTITY_THRESHOLD", 10, is_prod)?,
                },
                refresh: RateRule {
                    window_secs: parse_env("RATE_LIMIT_REFRESH_WINDOW_SECONDS", 60, is_prod)?,
                    ip_threshold: parse_env("RATE_LIMIT_REFRESH_IP_THRESHOLD", 30, is_prod)?,
                    identity_threshold: parse_env("RATE_LIMIT_REFRESH_IDENTITY_THRESHOLD", 30, is_prod)?,
                },
                two_factor: RateRule {
                    window_secs: parse_env("RATE_LIMIT_2FA_WINDOW_SECONDS", 300, is_prod)?,
                    ip_threshold: parse_env("RATE_LIMIT_2FA_IP_THRESHOLD", 15, is_prod)?,
                    identity_threshold: parse_env("RATE_LIMIT_2FA_IDENTITY_THRESHOLD", 10, is_prod)?,
                },
                password_reset: RateRule {
                    window_secs: parse_env("RATE_LIMIT_RESET_WINDOW_SECONDS", 3600, is_prod)?,
                    ip_threshold: parse_env("RATE_LIMIT_RESET_IP_THRESHOLD", 5, is_prod)?,
                    identity_threshold: parse_env("RATE_LIMIT_RESET_IDENTITY_THRESHOLD", 3, is_prod)?,
                },
                oauth_callback: RateRule {
                    window_secs: parse_env("RATE_LIMIT_OAUTH_WINDOW_SECONDS", 900, is_prod)?,
                    ip_threshold: parse_env("RATE_LIMIT_OAUTH_IP_THRESHOLD", 20, is_prod)?,
                    identity_threshold: parse_env("RATE_LIMIT_OAUTH_IDENTITY_THRESHOLD", 20, is_prod)?,
                },
            },
            lockout: LockoutConfig {
                threshold: parse_env("LOCKOUT_THRESHOLD", 5, is_prod)?,
                window_secs: parse_env("LOCKOUT_WINDOW_SECONDS", 900, is_prod)?,
                base_lock_secs: parse_env("LOCKOUT_BASE_SECONDS", 300, is_prod)?,
                backoff_factor: parse_env("LOCKOUT_BACKOFF_FACTOR", 2, is_prod)?,
                max_lock_secs: parse_env("LOCKOUT_MAX_SECONDS", 14_400, is_prod)?,
                cycle_ttl_secs: parse_env("LOCKOUT_CYCLE_TTL_SECONDS", 86_400, is_prod)?,
            },
            totp: TotpConfig {
                digits: parse_env("TOTP_DIGITS", 6, is_prod)?,
                period_secs: parse_env("TOTP_PERIOD_SECONDS", 30, is_prod)?,
                skew_steps: parse_env("TOTP_SKEW_STEPS", 1, is_prod)?,
                backup_code_count: parse_env("BACKUP_CODE_COUNT", 8, is_prod)?,
            },
            store: StoreConfig {
                op_timeout_ms: parse_env("STORE_OP_TIMEOUT_MS", 1500, is_prod)?,
                fail_open: parse_env("STORE_FAIL_OPEN", false, is_prod)?,
            },
            challenge_ttl_secs: parse_env("TWO_FACTOR_CHALLENGE_TTL_SECONDS", 300, is_prod)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.token.access_ttl_minutes <= 0 {
            return Err(GatewayError::Config(anyhow::anyhow!(
                "ACCESS_TOKEN_TTL_MINUTES must be positive"
            )));
        }
        if self.token.refresh_ttl_days <= 0 {
            return Err(GatewayError::Config(anyhow::anyhow!(
                "REFRESH_TOKEN_TTL_DAYS must be positive"
            )));
        }
        if self.lockout.threshold == 0 {
            return Err(GatewayError::Config(anyhow::anyhow!(
                "LOCKOUT_THRESHOLD must be at least 1"
            )));
        }
        if self.lockout.backoff_factor == 0 {
            return Err(GatewayError::Config(anyhow::anyhow!(
                "LOCKOUT_BACKOFF_FACTOR must be at least 1"
            )));
        }
        if self.totp.period_secs == 0 {
            return Err(GatewayError::Config(anyhow::anyhow!(
                "TOTP_PERIOD_SECONDS must be positive"
            )));
        }
        if self.environment == Environment::Prod && self.token.signing_secret.len() < 32 {
            return Err(GatewayError::Config(anyhow::anyhow!(
                "TOKEN_SIGNING_SECRET must be at least 32 bytes in production"
            )));
        }
        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, GatewayError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(GatewayError::Config(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(GatewayError::Config(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: T, _is_prod: bool) -> Result<T, GatewayError>
where
    T: std::str::FromStr + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val.parse().map_err(|e: T::Err| {
            GatewayError::Config(anyhow::anyhow!("invalid {}: {}", key, e))
        }),
        Err(_) => Ok(default),
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
