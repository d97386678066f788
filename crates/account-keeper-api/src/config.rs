//! Configuration types for the HTTP service

use crate::errors::ConfigError;
use account_keeper_core::{
    webhook::SigningSecret, AuthWebhookProvider, BillingWebhookProvider, ReconcilerPolicy,
    UnknownProfilePolicy,
};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, time::Duration};

const REDACTED: &str = "<REDACTED>";

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// HTTP server settings
    pub server: ServerConfig,

    /// Auth provider (user lifecycle) webhook settings
    pub auth_provider: ProviderConfig,

    /// Billing provider (customers, subscriptions) webhook settings
    pub billing_provider: ProviderConfig,

    pub reconciler: ReconcilerConfig,

    pub store: StoreConfig,

    pub dead_letter: DeadLetterConfig,

    pub billing: BillingConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl ServiceConfig {
    /// Check the configuration for values the service cannot start with.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Missing`] for an empty signing secret or database URL
    /// - [`ConfigError::Invalid`] for zero ports, tolerances or limits, a
    ///   request timeout not longer than the store timeout, and a checkout
    ///   link that is not an absolute URL
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.auth_provider.validate("auth_provider")?;
        self.billing_provider.validate("billing_provider")?;
        self.reconciler.validate()?;
        if self.server.timeout_seconds.saturating_mul(1000) <= self.reconciler.store_timeout_ms {
            return Err(ConfigError::Invalid {
                message: format!(
                    "server.timeout_seconds ({}s) must exceed reconciler.store_timeout_ms ({}ms)",
                    self.server.timeout_seconds, self.reconciler.store_timeout_ms
                ),
            });
        }
        self.store.validate()?;
        self.dead_letter.validate()?;
        self.billing.validate()?;
        Ok(())
    }

    /// Build the auth provider verifier from `auth_provider`.
    ///
    /// Secrets carrying the `whsec_` prefix are base64-decoded; anything
    /// else is used as raw key bytes.
    pub fn build_auth_provider(&self) -> Result<AuthWebhookProvider, ConfigError> {
        let secret = SigningSecret::from_prefixed_base64(&self.auth_provider.signing_secret)
            .map_err(|e| ConfigError::Invalid {
                message: format!("auth_provider.signing_secret: {}", e),
            })?;
        Ok(AuthWebhookProvider::new(
            secret,
            self.auth_provider.tolerance(),
        ))
    }

    /// Build the billing provider verifier from `billing_provider`.
    ///
    /// The billing secret is the HMAC key verbatim, prefix included.
    pub fn build_billing_provider(&self) -> Result<BillingWebhookProvider, ConfigError> {
        if self.billing_provider.signing_secret.is_empty() {
            return Err(ConfigError::Missing {
                key: "billing_provider.signing_secret".to_string(),
            });
        }
        let secret = SigningSecret::from_raw(self.billing_provider.signing_secret.as_bytes());
        Ok(BillingWebhookProvider::new(
            secret,
            self.billing_provider.tolerance(),
        ))
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Request timeout in seconds
    pub timeout_seconds: u64,

    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_seconds: u64,

    /// Maximum request size in bytes
    pub max_body_size: usize,
}

impl ServerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Missing {
                key: "server.host".to_string(),
            });
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid {
                message: "server.port must be non-zero".to_string(),
            });
        }
        if self.timeout_seconds == 0 {
            return Err(ConfigError::Invalid {
                message: "server.timeout_seconds must be non-zero".to_string(),
            });
        }
        if self.max_body_size == 0 {
            return Err(ConfigError::Invalid {
                message: "server.max_body_size must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            timeout_seconds: 30,
            shutdown_timeout_seconds: 30,
            max_body_size: 1024 * 1024, // 1MB
        }
    }
}

/// Webhook signing settings for one provider
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Shared secret used to verify webhook signatures
    pub signing_secret: String,

    /// Maximum accepted distance between the signed timestamp and now
    pub tolerance_seconds: u64,
}

impl ProviderConfig {
    pub fn tolerance(&self) -> Duration {
        Duration::from_secs(self.tolerance_seconds)
    }

    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.signing_secret.is_empty() {
            return Err(ConfigError::Missing {
                key: format!("{}.signing_secret", section),
            });
        }
        if self.tolerance_seconds == 0 {
            return Err(ConfigError::Invalid {
                message: format!("{}.tolerance_seconds must be non-zero", section),
            });
        }
        Ok(())
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            signing_secret: String::new(),
            tolerance_seconds: 300,
        }
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("signing_secret", &REDACTED)
            .field("tolerance_seconds", &self.tolerance_seconds)
            .finish()
    }
}

/// Reconciliation policy knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Cancel a live subscription when its user is deleted
    pub cascade_cancel_on_delete: bool,

    /// What to do with `user.updated` for a user never seen before
    pub unknown_profile_update: UnknownProfilePolicy,

    pub max_conflict_retries: u32,

    /// Upper bound for each account store call, in milliseconds
    pub store_timeout_ms: u64,
}

impl ReconcilerConfig {
    pub fn to_policy(&self) -> ReconcilerPolicy {
        ReconcilerPolicy {
            cascade_cancel_on_delete: self.cascade_cancel_on_delete,
            unknown_profile_update: self.unknown_profile_update,
            max_conflict_retries: self.max_conflict_retries,
            store_timeout: Duration::from_millis(self.store_timeout_ms),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                message: "reconciler.store_timeout_ms must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        let policy = ReconcilerPolicy::default();
        Self {
            cascade_cancel_on_delete: policy.cascade_cancel_on_delete,
            unknown_profile_update: policy.unknown_profile_update,
            max_conflict_retries: policy.max_conflict_retries,
            store_timeout_ms: policy.store_timeout.as_millis() as u64,
        }
    }
}

/// Account store backend selection
#[derive(Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Process-local store; contents are lost on restart
    #[default]
    Memory,

    /// PostgreSQL via a connection pool
    Postgres {
        url: String,

        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

fn default_max_connections() -> u32 {
    10
}

impl StoreConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Memory => Ok(()),
            Self::Postgres {
                url,
                max_connections,
            } => {
                if url.is_empty() {
                    return Err(ConfigError::Missing {
                        key: "store.url".to_string(),
                    });
                }
                if *max_connections == 0 {
                    return Err(ConfigError::Invalid {
                        message: "store.max_connections must be non-zero".to_string(),
                    });
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("Memory"),
            // The URL usually embeds credentials
            Self::Postgres {
                max_connections, ..
            } => f
                .debug_struct("Postgres")
                .field("url", &REDACTED)
                .field("max_connections", max_connections)
                .finish(),
        }
    }
}

/// Dead-letter sink selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeadLetterConfig {
    /// Records kept in memory; useful for tests only
    Memory,

    /// One JSON file per record under `root`
    Filesystem { root: PathBuf },
}

impl DeadLetterConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Filesystem { root } if root.as_os_str().is_empty() => {
                Err(ConfigError::Missing {
                    key: "dead_letter.root".to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self::Filesystem {
            root: PathBuf::from("./data"),
        }
    }
}

/// Billing surface settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BillingConfig {
    /// Hosted checkout page the `/billing/checkout` route redirects to
    pub checkout_link: Option<String>,
}

impl BillingConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let Some(link) = &self.checkout_link else {
            return Ok(());
        };
        let parsed = url::Url::parse(link).map_err(|e| ConfigError::Invalid {
            message: format!("billing.checkout_link is not a valid URL: {}", e),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid {
                message: format!(
                    "billing.checkout_link must use http or https, got '{}'",
                    parsed.scheme()
                ),
            });
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level
    pub level: String,

    /// Enable JSON structured logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
