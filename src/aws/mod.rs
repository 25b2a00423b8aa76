// AWS plumbing: credentials, role assumption, SigV4 signing and event-stream framing

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use std::fmt;

use crate::error::{GatewayError, Result};

pub mod event_stream;
pub mod sigv4;
pub mod sts;

const CONTAINER_METADATA_ENDPOINT: &str = "http://169.254.170.2";
const DEFAULT_REGION: &str = "us-east-1";

/// Refresh this long before the reported expiry
const EXPIRY_MARGIN_SECS: i64 = 300;

#[derive(Clone, PartialEq)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
}

impl AwsCredentials {
    pub fn is_expiring(&self, now: DateTime<Utc>) -> bool {
        match self.expiration {
            Some(expiration) => expiration - Duration::seconds(EXPIRY_MARGIN_SECS) <= now,
            None => false,
        }
    }

    fn from_env() -> Option<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok().filter(|v| !v.is_empty())?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok().filter(|v| !v.is_empty())?;
        Some(Self {
            access_key_id,
            secret_access_key,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok().filter(|v| !v.is_empty()),
            expiration: None,
        })
    }
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .field("session_token", &self.session_token.as_ref().map(|_| "***"))
            .field("expiration", &self.expiration)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerCredentials {
    access_key_id: String,
    secret_access_key: String,
    token: Option<String>,
    expiration: Option<DateTime<Utc>>,
}

/// Process-wide AWS credential chain with an explicit cache.
///
/// Resolution order: container task role (remote deployments only), then the
/// `AWS_ACCESS_KEY_ID`/`AWS_SECRET_ACCESS_KEY` environment. Fetched credentials
/// are cached until shortly before they expire; the process environment is
/// never written.
pub struct AwsCredentialsProvider {
    http: reqwest::Client,
    is_remote: bool,
    metadata_endpoint: String,
    relative_uri: Option<String>,
    env_credentials: Option<AwsCredentials>,
    region: String,
    cached: Mutex<Option<AwsCredentials>>,
}

impl AwsCredentialsProvider {
    pub fn new(
        http: reqwest::Client,
        is_remote: bool,
        relative_uri: Option<String>,
        env_credentials: Option<AwsCredentials>,
    ) -> Self {
        Self {
            http,
            is_remote,
            metadata_endpoint: CONTAINER_METADATA_ENDPOINT.to_string(),
            relative_uri,
            env_credentials,
            region: DEFAULT_REGION.to_string(),
            cached: Mutex::new(None),
        }
    }

    pub fn from_env(http: reqwest::Client, is_remote: bool) -> Self {
        let relative_uri = std::env::var("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI")
            .ok()
            .filter(|v| !v.is_empty());
        let region = std::env::var("AWS_REGION")
            .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
            .ok()
            .filter(|v| !v.is_empty());
        let provider = Self::new(http, is_remote, relative_uri, AwsCredentials::from_env());
        match region {
            Some(region) => provider.with_region(region),
            None => provider,
        }
    }

    pub fn with_region(mut self, region: String) -> Self {
        self.region = region;
        self
    }

    pub fn with_metadata_endpoint(mut self, endpoint: String) -> Self {
        self.metadata_endpoint = endpoint.trim_end_matches('/').to_string();
        self
    }

    /// Region of the process identity, used when signing calls outside Bedrock
    pub fn region(&self) -> &str {
        &self.region
    }

    pub async fn credentials(&self) -> Result<AwsCredentials> {
        let cached = self.cached.lock().clone();
        if let Some(cached) = cached {
            if !cached.is_expiring(Utc::now()) {
                return Ok(cached.clone());
            }
        }

        if self.is_remote {
            if let Some(relative_uri) = &self.relative_uri {
                let credentials = self.fetch_container_credentials(relative_uri).await?;
                *self.cached.lock() = Some(credentials.clone());
                return Ok(credentials);
            }
            tracing::warn!("Running remote without AWS_CONTAINER_CREDENTIALS_RELATIVE_URI, falling back to environment credentials");
        }

        self.env_credentials
            .clone()
            .ok_or_else(|| GatewayError::internal("no AWS credentials available"))
    }

    async fn fetch_container_credentials(&self, relative_uri: &str) -> Result<AwsCredentials> {
        let url = format!("{}{}", self.metadata_endpoint, relative_uri);
        tracing::debug!("Fetching AWS credentials from container metadata");

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(GatewayError::internal(format!(
                "container credentials endpoint returned {}",
                response.status()
            )));
        }
        let body: ContainerCredentials = response.json().await?;

        tracing::info!(
            "Refreshed AWS credentials for {} (expires {:?})",
            body.access_key_id,
            body.expiration
        );
        Ok(AwsCredentials {
            access_key_id: body.access_key_id,
            secret_access_key: body.secret_access_key,
            session_token: body.token,
            expiration: body.expiration,
        })
    }
}
