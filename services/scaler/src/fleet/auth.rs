//! OAuth access tokens for the Compute API.
//!
//! Either a static token supplied by the operator, or one fetched from the
//! GCE metadata server and cached until shortly before it expires.

use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::FleetError;

/// Metadata server token endpoint for the default service account.
pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh this long before the reported expiry.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Where access tokens come from.
pub enum TokenSource {
    /// Operator-supplied token, used as-is.
    Static(String),

    /// Default service account token from the metadata server.
    Metadata {
        client: reqwest::Client,
        url: String,
        cached: Mutex<Option<CachedToken>>,
    },
}

pub struct CachedToken {
    token: String,
    refresh_at: Instant,
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

impl TokenSource {
    /// Token source backed by the metadata server at `url`.
    pub fn metadata(url: impl Into<String>) -> Result<Self, FleetError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| FleetError::Auth(e.to_string()))?;

        Ok(Self::Metadata {
            client,
            url: url.into(),
            cached: Mutex::new(None),
        })
    }

    /// Static token if one is configured, otherwise the metadata server.
    pub fn from_config(token: Option<&str>) -> Result<Self, FleetError> {
        match token {
            Some(token) => Ok(Self::Static(token.to_string())),
            None => Self::metadata(METADATA_TOKEN_URL),
        }
    }

    /// Return a valid access token.
    pub async fn token(&self) -> Result<String, FleetError> {
        match self {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::Metadata {
                client,
                url,
                cached,
            } => {
                let mut cached = cached.lock().await;
                if let Some(entry) = cached.as_ref() {
                    if Instant::now() < entry.refresh_at {
                        return Ok(entry.token.clone());
                    }
                }

                let fetched = fetch_metadata_token(client, url).await?;
                let lifetime = Duration::from_secs(fetched.expires_in);
                debug!(expires_in_secs = fetched.expires_in, "Fetched metadata access token");

                *cached = Some(CachedToken {
                    token: fetched.access_token.clone(),
                    refresh_at: Instant::now() + lifetime.saturating_sub(REFRESH_MARGIN),
                });
                Ok(fetched.access_token)
            }
        }
    }
}

async fn fetch_metadata_token(
    client: &reqwest::Client,
    url: &str,
) -> Result<MetadataToken, FleetError> {
    let response = client
        .get(url)
        .header("Metadata-Flavor", "Google")
        .send()
        .await
        .map_err(|e| FleetError::Auth(format!("metadata request failed: {}", e)))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(FleetError::Auth(format!(
            "metadata server returned {}: {}",
            status, body
        )));
    }

    response
        .json()
        .await
        .map_err(|e| FleetError::Auth(format!("invalid metadata token response: {}", e)))
}
