//! Upstream Authentication Port (Driven Port)
//!
//! Interface for exchanging broker credentials for the short-lived approval
//! key the real-time channel requires.

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;

/// Broker credentials supplied by a client in an `auth` message.
///
/// Held only in memory for the lifetime of a session.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct BrokerCredentials {
    /// Application key issued by the broker.
    #[serde(rename = "kis_app_key")]
    pub app_key: String,
    /// Application secret issued by the broker.
    #[serde(rename = "kis_secret")]
    pub app_secret: String,
    /// Trading account number, if supplied.
    #[serde(rename = "kis_account", default)]
    pub account: Option<String>,
}

impl BrokerCredentials {
    /// Create credentials without an account number.
    #[must_use]
    pub fn new(app_key: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            app_secret: app_secret.into(),
            account: None,
        }
    }

    /// Whether both key and secret are present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.app_key.trim().is_empty() && !self.app_secret.trim().is_empty()
    }
}

impl fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerCredentials")
            .field("app_key", &"[REDACTED]")
            .field("app_secret", &"[REDACTED]")
            .field("account", &self.account.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Short-lived token authorizing one real-time connection.
#[derive(Clone, PartialEq, Eq)]
pub struct ApprovalKey(String);

impl ApprovalKey {
    /// Wrap a raw approval key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The raw key, for building wire messages.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApprovalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApprovalKey([REDACTED])")
    }
}

/// Upstream authentication error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Credentials were missing or empty.
    #[error("Missing broker credentials")]
    MissingCredentials,

    /// The broker rejected the credentials.
    #[error("Upstream rejected credentials: {message}")]
    Rejected {
        /// Error details.
        message: String,
    },

    /// The approval endpoint could not be reached.
    #[error("Approval request failed: {message}")]
    Transport {
        /// Error details.
        message: String,
    },
}

/// Port for obtaining approval keys.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamAuthenticator: Send + Sync {
    /// Exchange credentials for a fresh approval key.
    ///
    /// # Errors
    ///
    /// Returns error if the credentials are rejected or the request fails.
    async fn approval_key(&self, credentials: &BrokerCredentials) -> Result<ApprovalKey, AuthError>;
}
