use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::monitor::types::{AccessAttempt, AccessStats, UserSummary};

/// Request body for the verification service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationRequest {
    pub template: String,
    pub quality: u32,
    pub device_id: String,
    pub capture_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_context: Option<String>,
}

/// Resolved outcome of a verification call. A denial is still an
/// outcome; only a failed call is an error.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationOutcome {
    pub access_granted: bool,
    /// None means the template matched no known user
    pub user: Option<UserSummary>,
    pub confidence_score: f64,
    pub denial_reason: Option<String>,
    pub membership_status: Option<String>,
}

/// The verification call itself failed; no access decision was made.
/// Never folded into denial counters.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("verification request failed: {0}")]
    Request(String),
    #[error("verification service reported failure: {0}")]
    Service(String),
    #[error("verification response was malformed: {0}")]
    Malformed(String),
}

/// Seam for the external verification service
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(
        &self,
        request: VerificationRequest,
    ) -> Result<VerificationOutcome, VerificationError>;
}

#[derive(Debug, Deserialize)]
struct VerifyResponseBody {
    success: bool,
    #[serde(default)]
    access_granted: Option<bool>,
    #[serde(default)]
    user: Option<UserSummary>,
    #[serde(default)]
    confidence_score: Option<f64>,
    #[serde(default)]
    denial_reason: Option<String>,
    #[serde(default)]
    membership_status: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client for the verification service. One request per captured
/// sample, no internal retry; a retry is a new capture.
#[derive(Debug, Clone)]
pub struct VerificationClient {
    client: Client,
    verify_url: String,
}

impl VerificationClient {
    pub fn new(verify_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build verification HTTP client")?;

        Ok(Self {
            client,
            verify_url: verify_url.into(),
        })
    }
}

#[async_trait]
impl Verifier for VerificationClient {
    async fn verify(
        &self,
        request: VerificationRequest,
    ) -> Result<VerificationOutcome, VerificationError> {
        let response = self
            .client
            .post(&self.verify_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| VerificationError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(VerificationError::Request(format!(
                "verification service returned status {}",
                response.status()
            )));
        }

        let body: VerifyResponseBody = response
            .json()
            .await
            .map_err(|e| VerificationError::Malformed(e.to_string()))?;

        if !body.success {
            return Err(VerificationError::Service(
                body.error
                    .unwrap_or_else(|| "unspecified service error".to_string()),
            ));
        }

        Ok(VerificationOutcome {
            access_granted: body.access_granted.unwrap_or(false),
            user: body.user,
            confidence_score: body.confidence_score.unwrap_or(0.0),
            denial_reason: body.denial_reason,
            membership_status: body.membership_status,
        })
    }
}

/// Payload of the recent-attempts endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecentAttempts {
    #[serde(default)]
    pub attempts: Vec<AccessAttempt>,
    #[serde(default)]
    pub stats: AccessStats,
}

/// Client for the access API's recent-attempts endpoint, used to seed
/// and refresh the aggregator from the authoritative store.
#[derive(Debug, Clone)]
pub struct AccessApiClient {
    client: Client,
    recent_attempts_url: String,
}

impl AccessApiClient {
    pub fn new(recent_attempts_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build access API HTTP client")?;

        Ok(Self {
            client,
            recent_attempts_url: recent_attempts_url.into(),
        })
    }

    pub async fn fetch_recent(&self) -> Result<RecentAttempts> {
        let response = self
            .client
            .get(&self.recent_attempts_url)
            .send()
            .await
            .context("Failed to fetch recent access attempts")?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Recent attempts endpoint returned status: {}",
                response.status()
            ));
        }

        response
            .json()
            .await
            .context("Failed to parse recent access attempts")
    }
}
