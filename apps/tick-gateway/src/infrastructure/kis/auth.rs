//! KIS Approval Key Client
//!
//! The real-time channel does not accept app keys directly. Each connection
//! needs an approval key obtained from the REST API first.
//!
//! # Authentication Flow
//!
//! 1. `POST {rest_url}/oauth2/Approval` with
//!    `{"grant_type":"client_credentials","appkey":...,"secretkey":...}`
//! 2. Receive `{"approval_key":"..."}` or an error document
//! 3. Put the key in the header of every subscribe/unsubscribe request

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::application::ports::{ApprovalKey, AuthError, BrokerCredentials, UpstreamAuthenticator};

// =============================================================================
// Constants
// =============================================================================

/// Production REST endpoint.
pub const DEFAULT_REST_URL: &str = "https://openapi.koreainvestment.com:9443";

/// Timeout for the approval request.
pub const APPROVAL_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Serialize)]
struct ApprovalRequest<'a> {
    grant_type: &'a str,
    appkey: &'a str,
    secretkey: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApprovalResponse {
    #[serde(default)]
    approval_key: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    msg1: Option<String>,
}

impl ApprovalResponse {
    fn rejection_message(self) -> String {
        self.error_description
            .or(self.msg1)
            .unwrap_or_else(|| "approval_key missing from response".to_string())
    }
}

// =============================================================================
// Client
// =============================================================================

/// REST client issuing approval keys.
#[derive(Debug, Clone)]
pub struct KisApprovalClient {
    client: reqwest::Client,
    rest_url: String,
}

impl KisApprovalClient {
    /// Create a client against `rest_url`.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn new(rest_url: impl Into<String>) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(APPROVAL_TIMEOUT)
            .build()
            .map_err(|e| AuthError::Transport {
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            rest_url: rest_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl UpstreamAuthenticator for KisApprovalClient {
    async fn approval_key(&self, credentials: &BrokerCredentials) -> Result<ApprovalKey, AuthError> {
        if !credentials.is_complete() {
            return Err(AuthError::MissingCredentials);
        }

        let url = format!("{}/oauth2/Approval", self.rest_url);
        let response = self
            .client
            .post(&url)
            .json(&ApprovalRequest {
                grant_type: "client_credentials",
                appkey: &credentials.app_key,
                secretkey: &credentials.app_secret,
            })
            .send()
            .await
            .map_err(|e| AuthError::Transport {
                message: e.to_string(),
            })?;

        let status = response.status();
        let body: ApprovalResponse = response.json().await.map_err(|e| AuthError::Transport {
            message: format!("HTTP {status}: {e}"),
        })?;

        match body.approval_key {
            Some(key) if !key.is_empty() => Ok(ApprovalKey::new(key)),
            _ => Err(AuthError::Rejected {
                message: body.rejection_message(),
            }),
        }
    }
}
