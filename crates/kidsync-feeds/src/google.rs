//! Google credentials and the Custom Search client used for competitor lookups.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use kidsync_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{classify_fetch_error, json_i64, json_str, SearchError, SearchResult, SiteSearch};

pub const CSE_SCOPE: &str = "https://www.googleapis.com/auth/cse";
pub const YOUTUBE_SCOPE: &str = "https://www.googleapis.com/auth/youtube.readonly";
pub const CUSTOM_SEARCH_URL: &str = "https://www.googleapis.com/customsearch/v1";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_LIFETIME_SECS: i64 = 3600;
/// Refresh this long before the upstream expiry.
const TOKEN_SKEW_SECS: i64 = 60;

/// The fields of a service-account key file that token exchange needs.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key", &"<redacted>")
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading service account key {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing service account key {}", path.display()))
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ServiceAccountAuth {
    key: ServiceAccountKey,
    scope: String,
    http: HttpFetcher,
    cached: Mutex<Option<CachedToken>>,
}

impl ServiceAccountAuth {
    fn signed_assertion(&self, now: DateTime<Utc>) -> Result<String, SearchError> {
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            scope: &self.scope,
            aud: &self.key.token_uri,
            iat: now.timestamp(),
            exp: now.timestamp() + TOKEN_LIFETIME_SECS,
        };
        let key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|e| SearchError::Auth(format!("invalid private key: {e}")))?;
        encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| SearchError::Auth(format!("signing assertion: {e}")))
    }

    async fn access_token(&self) -> Result<String, SearchError> {
        let mut cached = self.cached.lock().await;
        let now = Utc::now();
        if let Some(token) = cached.as_ref().filter(|t| t.expires_at > now) {
            return Ok(token.access_token.clone());
        }

        let assertion = self.signed_assertion(now)?;
        let body = self
            .http
            .post_form_json(
                &self.key.token_uri,
                &[("grant_type", JWT_BEARER_GRANT), ("assertion", &assertion)],
            )
            .await
            .map_err(|e| SearchError::Auth(e.to_string()))?;
        let token = parse_token_response(&body, now)?;
        info!(scope = %self.scope, expires_at = %token.expires_at, "refreshed google access token");
        let access_token = token.access_token.clone();
        *cached = Some(token);
        Ok(access_token)
    }
}

fn parse_token_response(body: &JsonValue, now: DateTime<Utc>) -> Result<CachedToken, SearchError> {
    let access_token = json_str(body, &["access_token"])
        .ok_or_else(|| SearchError::Auth("token response has no access_token".into()))?;
    let lifetime = json_i64(body, &["expires_in"]).unwrap_or(TOKEN_LIFETIME_SECS);
    Ok(CachedToken {
        access_token: access_token.to_string(),
        expires_at: now + chrono::Duration::seconds((lifetime - TOKEN_SKEW_SECS).max(0)),
    })
}

/// How a request authenticates: `key=` query parameter or bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    ApiKey(String),
    Bearer(String),
}

/// Credential handle built once from configuration and shared by the clients.
#[derive(Debug)]
pub enum GoogleAuth {
    ApiKey(String),
    ServiceAccount(ServiceAccountAuth),
}

impl GoogleAuth {
    pub fn api_key(key: impl Into<String>) -> Self {
        GoogleAuth::ApiKey(key.into())
    }

    pub fn service_account(
        key: ServiceAccountKey,
        scope: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout,
            user_agent: None,
            backoff: BackoffPolicy::none(),
        })?;
        Ok(GoogleAuth::ServiceAccount(ServiceAccountAuth {
            key,
            scope: scope.into(),
            http,
            cached: Mutex::new(None),
        }))
    }

    pub async fn credential(&self) -> Result<Credential, SearchError> {
        match self {
            GoogleAuth::ApiKey(key) => Ok(Credential::ApiKey(key.clone())),
            GoogleAuth::ServiceAccount(sa) => sa.access_token().await.map(Credential::Bearer),
        }
    }
}

/// Append the credential to `params` and return the bearer token, if any.
pub(crate) fn apply_credential(
    credential: &Credential,
    params: &mut Vec<(&'static str, String)>,
) -> Option<String> {
    match credential {
        Credential::ApiKey(key) => {
            params.push(("key", key.clone()));
            None
        }
        Credential::Bearer(token) => Some(token.clone()),
    }
}

pub fn parse_search_items(body: &JsonValue) -> Vec<SearchResult> {
    body.get("items")
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| SearchResult {
                    title: json_str(item, &["title"]).unwrap_or_default().to_string(),
                    snippet: json_str(item, &["snippet"]).unwrap_or_default().to_string(),
                    link: json_str(item, &["link"]).unwrap_or_default().to_string(),
                })
                .filter(|r| !r.link.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Programmable Search Engine client. Never retries: every request is billed.
#[derive(Debug, Clone)]
pub struct CustomSearchClient {
    http: HttpFetcher,
    auth: Arc<GoogleAuth>,
    engine_id: Option<String>,
    endpoint: String,
}

impl CustomSearchClient {
    pub fn new(
        auth: Arc<GoogleAuth>,
        engine_id: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout,
            user_agent: None,
            backoff: BackoffPolicy::none(),
        })?;
        Ok(Self {
            http,
            auth,
            engine_id,
            endpoint: CUSTOM_SEARCH_URL.to_string(),
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl SiteSearch for CustomSearchClient {
    async fn search(
        &self,
        query: &str,
        site_domain: &str,
        num: u32,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let engine_id = self
            .engine_id
            .as_deref()
            .ok_or(SearchError::NotConfigured("GOOGLE_SEARCH_ENGINE_ID"))?;
        let credential = self.auth.credential().await?;
        let mut params = vec![
            ("cx", engine_id.to_string()),
            ("q", query.to_string()),
            ("siteSearch", site_domain.to_string()),
            ("num", num.to_string()),
        ];
        let bearer = apply_credential(&credential, &mut params);
        let body = self
            .http
            .get_json(&self.endpoint, &params, bearer.as_deref())
            .await
            .map_err(|e| classify_fetch_error("custom search", e))?;
        let results = parse_search_items(&body);
        debug!(site = site_domain, count = results.len(), "site search");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn search_items_skip_entries_without_links() {
        let body = json!({"items": [
            {"title": "שלגיה - כרטיסים", "snippet": "היכל", "link": "https://eventer.co.il/event/123"},
            {"title": "no link"}
        ]});
        let results = parse_search_items(&body);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].link, "https://eventer.co.il/event/123");
        assert!(parse_search_items(&json!({"searchInformation": {}})).is_empty());
    }

    #[test]
    fn token_response_is_cached_with_skew() {
        let now = Utc::now();
        let token = parse_token_response(&json!({"access_token": "t", "expires_in": 3599}), now)
            .unwrap();
        assert_eq!(token.access_token, "t");
        assert_eq!(token.expires_at, now + chrono::Duration::seconds(3539));
        assert!(parse_token_response(&json!({}), now).is_err());
    }

    #[test]
    fn api_key_goes_into_query() {
        let mut params = Vec::new();
        let bearer = apply_credential(&Credential::ApiKey("k".into()), &mut params);
        assert!(bearer.is_none());
        assert_eq!(params, vec![("key", "k".to_string())]);
        let bearer = apply_credential(&Credential::Bearer("b".into()), &mut params);
        assert_eq!(bearer.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn search_without_engine_id_is_not_configured() {
        let client = CustomSearchClient::new(
            Arc::new(GoogleAuth::api_key("k")),
            None,
            Duration::from_secs(1),
        )
        .unwrap();
        let err = client.search("שלגיה", "eventer.co.il", 3).await.unwrap_err();
        assert!(matches!(err, SearchError::NotConfigured(_)));
    }
}
