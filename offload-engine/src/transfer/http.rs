//! Shared HTTP plumbing for the REST providers.
//!
//! A provider describes a request as a [`ProviderRequest`] and hands it to the
//! transport together with its [`SigningStrategy`]. The transport signs it with
//! the injected clock, sends it with bounded timeouts and maps failures onto
//! the engine's error taxonomy.

use crate::config::TransferConfig;
use crate::host::Clock;
use crate::signing::{HeaderMap, Payload, RequestParts, SigningStrategy};
use crate::{OffloadError, Result};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Method;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use url::Url;

/// Longest provider error body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Bytes(Bytes),
    /// Streamed from disk without hashing.
    File { path: PathBuf, len: u64 },
}

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

impl ProviderRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = RequestBody::Bytes(body.into());
        self
    }

    pub fn json(self, value: &serde_json::Value) -> Self {
        self.header("content-type", "application/json")
            .bytes(value.to_string())
    }

    pub fn file(mut self, path: PathBuf, len: u64) -> Self {
        self.body = RequestBody::File { path, len };
        self
    }
}

#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport").finish_non_exhaustive()
    }
}

impl HttpTransport {
    pub fn new(config: &TransferConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(concat!("offload-engine/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| OffloadError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, clock })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    fn signing_time(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.clock.now(), 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Sign and send; any status is returned to the caller.
    pub async fn execute(&self, request: ProviderRequest, signer: &SigningStrategy) -> Result<reqwest::Response> {
        let payload = match &request.body {
            RequestBody::Empty => Payload::Bytes(b""),
            RequestBody::Bytes(bytes) => Payload::Bytes(bytes.as_ref()),
            RequestBody::File { len, .. } => Payload::Unsigned { len: *len },
        };
        let parts = RequestParts {
            method: request.method.as_str(),
            url: &request.url,
            headers: &request.headers,
            payload,
        };
        let signed = signer.sign(&parts, self.signing_time())?;

        let mut builder = self.client.request(request.method.clone(), request.url.clone());
        for (name, value) in &signed {
            // reqwest derives Host from the URL
            if name == "host" {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Bytes(bytes) => builder.body(bytes),
            RequestBody::File { path, len } => {
                let file = tokio::fs::File::open(&path).await?;
                builder
                    .header("content-length", len.to_string())
                    .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            }
        };

        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                OffloadError::Transport(format!("request timed out: {e}"))
            } else {
                OffloadError::Transport(e.to_string())
            }
        })
    }

    /// Sign, send and require a 2xx status.
    pub async fn send(&self, request: ProviderRequest, signer: &SigningStrategy) -> Result<reqwest::Response> {
        let response = self.execute(request, signer).await?;
        Self::ensure_success(response).await
    }

    /// Sign, send, require 2xx and decode a JSON body.
    pub async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: ProviderRequest,
        signer: &SigningStrategy,
    ) -> Result<T> {
        let response = self.send(request, signer).await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| OffloadError::transfer(status, format!("Malformed JSON response: {e}")))
    }

    /// Turn a non-2xx response into a `Transfer` error carrying the body.
    pub async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(OffloadError::transfer(status.as_u16(), error_message(status, &body)))
    }
}

pub fn error_message(status: reqwest::StatusCode, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        return status
            .canonical_reason()
            .unwrap_or("Unexpected status")
            .to_string();
    }
    let mut end = body.len().min(MAX_ERROR_BODY);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

/// Parse a configured endpoint, rejecting anything that is not http(s).
pub fn parse_endpoint(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim_end_matches('/'))
        .map_err(|e| OffloadError::Config(format!("invalid endpoint {raw}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(OffloadError::Config(format!("unsupported endpoint scheme: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FixedClock;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport() -> HttpTransport {
        HttpTransport::new(&TransferConfig::default(), Arc::new(FixedClock::new(1_700_000_000))).unwrap()
    }

    #[tokio::test]
    async fn test_non_2xx_becomes_transfer_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/thing"))
            .respond_with(ResponseTemplate::new(403).set_body_string("AccessDenied"))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/thing", server.uri())).unwrap();
        let err = transport()
            .send(ProviderRequest::new(Method::GET, url), &SigningStrategy::None)
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), Some(403));
        assert!(err.to_string().contains("AccessDenied"));
    }

    #[tokio::test]
    async fn test_signed_headers_are_sent() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/up"))
            .and(header("authorization", "Bearer abc"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/up", server.uri())).unwrap();
        let response = transport()
            .send(
                ProviderRequest::new(Method::PUT, url).bytes("payload"),
                &SigningStrategy::Bearer("abc".into()),
            )
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 201);
    }

    #[tokio::test]
    async fn test_connection_failure_is_transport_error() {
        let url = Url::parse("http://127.0.0.1:1/unreachable").unwrap();
        let err = transport()
            .send(ProviderRequest::new(Method::GET, url), &SigningStrategy::None)
            .await
            .unwrap_err();
        assert!(matches!(err, OffloadError::Transport(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_parse_endpoint() {
        assert!(parse_endpoint("https://s3.wasabisys.com/").is_ok());
        assert!(parse_endpoint("ftp://example.com").is_err());
    }
}
