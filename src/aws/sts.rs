// STS AssumeRole for Bedrock configs that name a role to act as

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

use super::sigv4::{self, SigningRequest};
use super::AwsCredentials;
use crate::error::{GatewayError, Result};

const STS_VERSION: &str = "2011-06-15";
const SESSION_NAME: &str = "ModelGatewayBedrockSession";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";

/// Shortest session STS hands out; assumed when the response carries no parsable expiry
const MIN_SESSION_MINUTES: i64 = 15;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleEnvelope {
    assume_role_response: AssumeRoleResponse,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleResponse {
    assume_role_result: AssumeRoleResult,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleResult {
    credentials: RoleCredentials,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: String,
    #[serde(default)]
    expiration: Value,
}

/// Exchanges a source identity for temporary role credentials, cached per role and region
pub struct RoleAssumer {
    http: reqwest::Client,
    endpoint: Option<String>,
    cache: Mutex<HashMap<String, AwsCredentials>>,
}

impl RoleAssumer {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            endpoint: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Fixed STS endpoint instead of `https://sts.{region}.amazonaws.com`
    pub fn with_endpoint(mut self, endpoint: String) -> Self {
        self.endpoint = Some(endpoint.trim_end_matches('/').to_string());
        self
    }

    pub async fn assume_role(
        &self,
        source: &AwsCredentials,
        role_arn: &str,
        region: &str,
    ) -> Result<AwsCredentials> {
        let key = format!("{}|{}", role_arn, region);
        let cached = self.cache.lock().get(&key).cloned();
        if let Some(cached) = cached {
            if !cached.is_expiring(Utc::now()) {
                return Ok(cached);
            }
        }

        let credentials = self.request(source, role_arn, region).await?;
        let now = Utc::now();
        let mut cache = self.cache.lock();
        cache.retain(|_, c| !c.is_expiring(now));
        cache.insert(key, credentials.clone());
        Ok(credentials)
    }

    async fn request(&self, source: &AwsCredentials, role_arn: &str, region: &str) -> Result<AwsCredentials> {
        let endpoint = self
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://sts.{}.amazonaws.com", region));
        let url = reqwest::Url::parse(&format!("{}/", endpoint))
            .map_err(|e| GatewayError::internal(format!("invalid STS endpoint {}: {}", endpoint, e)))?;
        let host = sigv4::host_header(&url).ok_or_else(|| GatewayError::internal("STS URL has no host"))?;
        let body = format!(
            "Action=AssumeRole&Version={}&RoleArn={}&RoleSessionName={}",
            STS_VERSION,
            urlencoding::encode(role_arn),
            SESSION_NAME
        );

        let signed = sigv4::sign(
            &SigningRequest {
                method: "POST",
                url: &url,
                headers: &[
                    ("accept", "application/json"),
                    ("content-type", FORM_CONTENT_TYPE),
                    ("host", host.as_str()),
                ],
                body: body.as_bytes(),
            },
            source,
            region,
            "sts",
            Utc::now(),
        );

        let mut request = self
            .http
            .post(url)
            .header("accept", "application/json")
            .header("content-type", FORM_CONTENT_TYPE);
        for (name, value) in signed {
            request = request.header(name, value);
        }

        let response = request.body(body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::internal(format!(
                "STS AssumeRole for {} failed: {} {}",
                role_arn, status, body
            )));
        }

        let envelope: AssumeRoleEnvelope = response.json().await?;
        let credentials = envelope.assume_role_response.assume_role_result.credentials;
        let expiration = parse_expiration(&credentials.expiration)
            .unwrap_or_else(|| Utc::now() + Duration::minutes(MIN_SESSION_MINUTES));

        tracing::info!("Assumed role {} (expires {})", role_arn, expiration);
        Ok(AwsCredentials {
            access_key_id: credentials.access_key_id,
            secret_access_key: credentials.secret_access_key,
            session_token: Some(credentials.session_token),
            expiration: Some(expiration),
        })
    }
}

/// The JSON protocol reports epoch seconds; the query protocol an ISO 8601 timestamp
fn parse_expiration(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single()),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|d| d.with_timezone(&Utc)),
        _ => None,
    }
}
