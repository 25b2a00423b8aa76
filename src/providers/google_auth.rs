// Google access tokens through workload identity federation with AWS credentials
//
// Flow: sign an AWS STS GetCallerIdentity request, exchange it at Google STS
// for a federated token, then impersonate the configured service account.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;

use super::GoogleProviderConfig;
use crate::aws::sigv4::{self, SigningRequest};
use crate::aws::{AwsCredentials, AwsCredentialsProvider};
use crate::error::{GatewayError, Result};

const GOOGLE_STS_URL: &str = "https://sts.googleapis.com/v1/token";
const IAM_CREDENTIALS_URL: &str = "https://iamcredentials.googleapis.com/v1";
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";
const AWS_SUBJECT_TOKEN_TYPE: &str = "urn:ietf:params:aws:token-type:aws4_request";

/// Refresh this long before the reported expiry
const REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct StsTokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateAccessTokenResponse {
    access_token: String,
    expire_time: DateTime<Utc>,
}

pub struct GoogleTokenSource {
    http: reqwest::Client,
    sts_url: String,
    iam_url: String,
    cache: Mutex<HashMap<String, CachedToken>>,
}

impl GoogleTokenSource {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            sts_url: GOOGLE_STS_URL.to_string(),
            iam_url: IAM_CREDENTIALS_URL.to_string(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_endpoints(mut self, sts_url: String, iam_url: String) -> Self {
        self.sts_url = sts_url;
        self.iam_url = iam_url.trim_end_matches('/').to_string();
        self
    }

    /// Access token for the configured service account, cached per audience and account
    pub async fn access_token(
        &self,
        config: &GoogleProviderConfig,
        aws: &AwsCredentialsProvider,
    ) -> Result<String> {
        let key = format!("{}|{}", config.audience, config.service_account_email);
        let cached = self.cache.lock().get(&key).cloned();
        if let Some(cached) = cached {
            if cached.expires_at - Duration::seconds(REFRESH_MARGIN_SECS) > Utc::now() {
                return Ok(cached.token.clone());
            }
        }

        let credentials = aws.credentials().await?;
        let subject_token = aws_subject_token(&credentials, aws.region(), &config.audience, Utc::now())?;
        let federated = self.exchange(&config.audience, &subject_token).await?;
        let token = self
            .impersonate(&config.service_account_email, &federated)
            .await?;

        tracing::info!(
            "Obtained Google access token for {} (expires {})",
            config.service_account_email,
            token.expires_at
        );
        let access_token = token.token.clone();
        let now = Utc::now();
        let mut cache = self.cache.lock();
        cache.retain(|_, cached| cached.expires_at > now);
        cache.insert(key, token);
        Ok(access_token)
    }

    async fn exchange(&self, audience: &str, subject_token: &str) -> Result<String> {
        let response = self
            .http
            .post(&self.sts_url)
            .form(&[
                ("grant_type", TOKEN_EXCHANGE_GRANT),
                ("audience", audience),
                ("scope", CLOUD_PLATFORM_SCOPE),
                ("requested_token_type", ACCESS_TOKEN_TYPE),
                ("subject_token", subject_token),
                ("subject_token_type", AWS_SUBJECT_TOKEN_TYPE),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::internal(format!(
                "Google STS token exchange failed: {} {}",
                status, body
            )));
        }
        let body: StsTokenResponse = response.json().await?;
        Ok(body.access_token)
    }

    async fn impersonate(&self, service_account_email: &str, federated_token: &str) -> Result<CachedToken> {
        let url = format!(
            "{}/projects/-/serviceAccounts/{}:generateAccessToken",
            self.iam_url,
            urlencoding::encode(service_account_email)
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(federated_token)
            .json(&json!({ "scope": [CLOUD_PLATFORM_SCOPE] }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::internal(format!(
                "service account impersonation failed: {} {}",
                status, body
            )));
        }
        let body: GenerateAccessTokenResponse = response.json().await?;
        Ok(CachedToken {
            token: body.access_token,
            expires_at: body.expire_time,
        })
    }
}

/// Serialized, signed GetCallerIdentity request that Google STS replays against AWS
pub fn aws_subject_token(
    credentials: &AwsCredentials,
    region: &str,
    audience: &str,
    now: DateTime<Utc>,
) -> Result<String> {
    let host = format!("sts.{}.amazonaws.com", region);
    let url = format!("https://{}?Action=GetCallerIdentity&Version=2011-06-15", host);
    let parsed = reqwest::Url::parse(&url)
        .map_err(|e| GatewayError::internal(format!("invalid STS URL {}: {}", url, e)))?;

    let signed = sigv4::sign(
        &SigningRequest {
            method: "POST",
            url: &parsed,
            headers: &[
                ("host", host.as_str()),
                ("x-goog-cloud-target-resource", audience),
            ],
            body: b"",
        },
        credentials,
        region,
        "sts",
        now,
    );

    let mut headers = vec![
        json!({ "key": "host", "value": host }),
        json!({ "key": "x-goog-cloud-target-resource", "value": audience }),
    ];
    for (name, value) in signed {
        let key = if name == "authorization" {
            "Authorization".to_string()
        } else {
            name
        };
        headers.push(json!({ "key": key, "value": value }));
    }

    let token = json!({
        "url": url,
        "method": "POST",
        "headers": headers,
    });
    Ok(urlencoding::encode(&token.to_string()).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const AUDIENCE: &str =
        "//iam.googleapis.com/projects/123/locations/global/workloadIdentityPools/pool/providers/aws";

    fn credentials() -> AwsCredentials {
        AwsCredentials {
            access_key_id: "ASIAEXAMPLE".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: Some("session".to_string()),
            expiration: None,
        }
    }

    fn config() -> GoogleProviderConfig {
        GoogleProviderConfig {
            service_account_email: "gateway@proj.iam.gserviceaccount.com".to_string(),
            audience: AUDIENCE.to_string(),
            location: "us-central1".to_string(),
            project: "proj".to_string(),
            base_url: None,
        }
    }

    #[test]
    fn test_subject_token_is_signed_caller_identity() {
        let token = aws_subject_token(&credentials(), "eu-west-1", AUDIENCE, Utc::now()).unwrap();
        let decoded = urlencoding::decode(&token).unwrap();
        let parsed: Value = serde_json::from_str(&decoded).unwrap();

        assert_eq!(
            parsed["url"],
            "https://sts.eu-west-1.amazonaws.com?Action=GetCallerIdentity&Version=2011-06-15"
        );
        assert_eq!(parsed["method"], "POST");
        let keys: Vec<&str> = parsed["headers"]
            .as_array()
            .unwrap()
            .iter()
            .map(|h| h["key"].as_str().unwrap())
            .collect();
        assert_eq!(
            keys,
            vec![
                "host",
                "x-goog-cloud-target-resource",
                "x-amz-date",
                "x-amz-security-token",
                "Authorization"
            ]
        );
        let authorization = parsed["headers"][4]["value"].as_str().unwrap();
        assert!(authorization.contains("/eu-west-1/sts/aws4_request"));
        assert!(authorization
            .contains("SignedHeaders=host;x-amz-date;x-amz-security-token;x-goog-cloud-target-resource"));
    }

    #[tokio::test]
    async fn test_access_token_exchange_and_cache() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/token"))
            .and(body_string_contains("subject_token_type=urn%3Aietf%3Aparams%3Aaws%3Atoken-type%3Aaws4_request"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "federated-token",
                "issued_token_type": ACCESS_TOKEN_TYPE,
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;
        let expire_time = (Utc::now() + Duration::hours(1)).to_rfc3339();
        Mock::given(method("POST"))
            .and(path(
                "/v1/projects/-/serviceAccounts/gateway%40proj.iam.gserviceaccount.com:generateAccessToken",
            ))
            .and(header("authorization", "Bearer federated-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "accessToken": "ya29.service-account",
                "expireTime": expire_time
            })))
            .expect(1)
            .mount(&server)
            .await;

        let source = GoogleTokenSource::new(reqwest::Client::new())
            .with_endpoints(format!("{}/v1/token", server.uri()), format!("{}/v1", server.uri()));
        let aws = AwsCredentialsProvider::new(reqwest::Client::new(), false, None, Some(credentials()));

        let first = source.access_token(&config(), &aws).await.unwrap();
        assert_eq!(first, "ya29.service-account");
        let second = source.access_token(&config(), &aws).await.unwrap();
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_expired_tokens_are_evicted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "federated"})))
            .mount(&server)
            .await;
        let expired = (Utc::now() - Duration::minutes(1)).to_rfc3339();
        Mock::given(method("POST"))
            .and(path("/v1/projects/-/serviceAccounts/old%40proj.iam.gserviceaccount.com:generateAccessToken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "accessToken": "ya29.old",
                "expireTime": expired
            })))
            .mount(&server)
            .await;
        let valid = (Utc::now() + Duration::hours(1)).to_rfc3339();
        Mock::given(method("POST"))
            .and(path("/v1/projects/-/serviceAccounts/new%40proj.iam.gserviceaccount.com:generateAccessToken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "accessToken": "ya29.new",
                "expireTime": valid
            })))
            .mount(&server)
            .await;

        let source = GoogleTokenSource::new(reqwest::Client::new())
            .with_endpoints(format!("{}/v1/token", server.uri()), format!("{}/v1", server.uri()));
        let aws = AwsCredentialsProvider::new(reqwest::Client::new(), false, None, Some(credentials()));
        let account = |email: &str| GoogleProviderConfig {
            service_account_email: email.to_string(),
            ..config()
        };

        source.access_token(&account("old@proj.iam.gserviceaccount.com"), &aws).await.unwrap();
        assert_eq!(source.cache.lock().len(), 1);

        let token = source
            .access_token(&account("new@proj.iam.gserviceaccount.com"), &aws)
            .await
            .unwrap();
        assert_eq!(token, "ya29.new");
        let cache = source.cache.lock();
        assert_eq!(cache.len(), 1);
        assert!(cache.contains_key(&format!("{}|new@proj.iam.gserviceaccount.com", AUDIENCE)));
    }

    #[tokio::test]
    async fn test_exchange_failure_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let source = GoogleTokenSource::new(reqwest::Client::new())
            .with_endpoints(format!("{}/v1/token", server.uri()), format!("{}/v1", server.uri()));
        let aws = AwsCredentialsProvider::new(reqwest::Client::new(), false, None, Some(credentials()));

        let err = source.access_token(&config(), &aws).await.unwrap_err();
        assert!(err.to_string().contains("invalid_grant"));
    }
}
