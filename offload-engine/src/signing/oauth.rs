//! OAuth 2 bearer tokens with refresh-token renewal.

use super::SigningStrategy;
use crate::transfer::http::HttpTransport;
use crate::{OffloadError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Seconds before expiry at which a token is treated as stale.
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct OAuthCredentials {
    #[serde(default)]
    pub access_token: String,

    #[serde(default)]
    pub refresh_token: String,

    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    /// Epoch seconds; 0 when unknown
    #[serde(default)]
    pub expires_at: i64,
}

impl std::fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("has_access_token", &!self.access_token.is_empty())
            .field("can_refresh", &self.can_refresh())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl OAuthCredentials {
    pub fn can_refresh(&self) -> bool {
        !self.refresh_token.is_empty() && !self.client_id.is_empty()
    }

    pub fn is_configured(&self) -> bool {
        !self.access_token.is_empty() || self.can_refresh()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: i64,
}

/// Hands out a valid bearer strategy, refreshing the token when it is stale.
#[derive(Debug)]
pub struct TokenSource {
    creds: OAuthCredentials,
    token_url: String,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    pub fn new(creds: OAuthCredentials, token_url: impl Into<String>) -> Self {
        let cached = (!creds.access_token.is_empty()).then(|| CachedToken {
            token: creds.access_token.clone(),
            expires_at: creds.expires_at,
        });
        Self {
            creds,
            token_url: token_url.into(),
            cached: Mutex::new(cached),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.creds.is_configured()
    }

    pub async fn strategy(&self, http: &HttpTransport) -> Result<SigningStrategy> {
        let now = http.now();
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            let fresh = token.expires_at == 0 || token.expires_at > now + EXPIRY_SKEW_SECS;
            if fresh || !self.creds.can_refresh() {
                return Ok(SigningStrategy::Bearer(token.token.clone()));
            }
        }

        if !self.creds.can_refresh() {
            return Err(OffloadError::NotConfigured("access token or refresh token".into()));
        }

        debug!(token_url = %self.token_url, "Refreshing OAuth access token");
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", self.creds.refresh_token.as_str()),
            ("client_id", self.creds.client_id.as_str()),
        ];
        if !self.creds.client_secret.is_empty() {
            form.push(("client_secret", self.creds.client_secret.as_str()));
        }

        let response = http
            .client()
            .post(&self.token_url)
            .form(&form)
            .send()
            .await?;
        let response = HttpTransport::ensure_success(response).await?;
        let body: TokenResponse = response.json().await?;

        let expires_at = body.expires_in.map(|secs| now + secs).unwrap_or(0);
        info!(expires_at, "OAuth access token refreshed");
        let token = body.access_token;
        *cached = Some(CachedToken {
            token: token.clone(),
            expires_at,
        });
        Ok(SigningStrategy::Bearer(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use crate::host::FixedClock;
    use std::sync::Arc;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport(now: i64) -> HttpTransport {
        HttpTransport::new(&TransferConfig::default(), Arc::new(FixedClock::new(now))).unwrap()
    }

    #[tokio::test]
    async fn test_unexpired_token_is_used_as_is() {
        let source = TokenSource::new(
            OAuthCredentials {
                access_token: "live".into(),
                expires_at: 10_000,
                ..Default::default()
            },
            "http://unused.invalid/token",
        );
        let strategy = source.strategy(&transport(1_000)).await.unwrap();
        assert!(matches!(strategy, SigningStrategy::Bearer(t) if t == "live"));
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let source = TokenSource::new(
            OAuthCredentials {
                access_token: "stale".into(),
                refresh_token: "refresh".into(),
                client_id: "client".into(),
                expires_at: 1_010,
                ..Default::default()
            },
            format!("{}/token", server.uri()),
        );
        let http = transport(1_000);
        let strategy = source.strategy(&http).await.unwrap();
        assert!(matches!(strategy, SigningStrategy::Bearer(ref t) if t == "fresh"));

        // Second call hits the cache.
        let strategy = source.strategy(&http).await.unwrap();
        assert!(matches!(strategy, SigningStrategy::Bearer(ref t) if t == "fresh"));
    }

    #[tokio::test]
    async fn test_nothing_configured() {
        let source = TokenSource::new(OAuthCredentials::default(), "http://unused.invalid/token");
        assert!(!source.is_configured());
        assert!(matches!(
            source.strategy(&transport(0)).await,
            Err(OffloadError::NotConfigured(_))
        ));
    }
}
