//! Request signing strategies.
//!
//! Every provider authenticates with one [`SigningStrategy`] value. Signing is
//! a pure function of the request parts, the credentials and the timestamp:
//! the same inputs always produce the same headers.

pub mod oauth;
pub mod shared_key;
pub mod sigv4;

use crate::{OffloadError, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use url::Url;

pub use shared_key::SharedKeyCredentials;
pub use sigv4::SigV4Credentials;

/// Header map used throughout signing. Keys are lower-case header names.
pub type HeaderMap = BTreeMap<String, String>;

/// What the signer knows about the request body.
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    Bytes(&'a [u8]),
    /// Body is streamed and not hashed (`UNSIGNED-PAYLOAD` for SigV4).
    Unsigned { len: u64 },
}

impl Payload<'_> {
    pub fn len(&self) -> u64 {
        match self {
            Payload::Bytes(b) => b.len() as u64,
            Payload::Unsigned { len } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The parts of an HTTP request a signer may look at.
#[derive(Debug, Clone, Copy)]
pub struct RequestParts<'a> {
    pub method: &'a str,
    pub url: &'a Url,
    pub headers: &'a HeaderMap,
    pub payload: Payload<'a>,
}

#[derive(Clone)]
pub enum SigningStrategy {
    /// AWS Signature Version 4 (S3 and S3-compatible stores)
    SigV4(SigV4Credentials),
    /// Azure Storage SharedKey
    SharedKey(SharedKeyCredentials),
    /// OAuth 2 bearer token
    Bearer(String),
    /// Raw token in a provider-defined header
    TokenHeader { name: String, value: String },
    /// HTTP basic auth (B2 account authorization)
    Basic { user: String, password: String },
    None,
}

impl std::fmt::Debug for SigningStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            SigningStrategy::SigV4(_) => "SigV4",
            SigningStrategy::SharedKey(_) => "SharedKey",
            SigningStrategy::Bearer(_) => "Bearer",
            SigningStrategy::TokenHeader { .. } => "TokenHeader",
            SigningStrategy::Basic { .. } => "Basic",
            SigningStrategy::None => "None",
        };
        f.write_str(kind)
    }
}

impl SigningStrategy {
    /// Return `parts.headers` plus the authentication headers for this strategy.
    pub fn sign(&self, parts: &RequestParts<'_>, now: DateTime<Utc>) -> Result<HeaderMap> {
        let mut headers = parts.headers.clone();
        match self {
            SigningStrategy::SigV4(creds) => {
                headers.extend(sigv4::sign(creds, parts, now)?);
            }
            SigningStrategy::SharedKey(creds) => {
                headers.extend(shared_key::sign(creds, parts, now)?);
            }
            SigningStrategy::Bearer(token) => {
                if token.is_empty() {
                    return Err(OffloadError::NotConfigured("access token".into()));
                }
                headers.insert("authorization".into(), format!("Bearer {token}"));
            }
            SigningStrategy::TokenHeader { name, value } => {
                if value.is_empty() {
                    return Err(OffloadError::NotConfigured(format!("{name} token")));
                }
                headers.insert(name.to_ascii_lowercase(), value.clone());
            }
            SigningStrategy::Basic { user, password } => {
                if user.is_empty() || password.is_empty() {
                    return Err(OffloadError::NotConfigured("account credentials".into()));
                }
                let raw = format!("{user}:{password}");
                headers.insert(
                    "authorization".into(),
                    format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(raw)),
                );
            }
            SigningStrategy::None => {}
        }
        Ok(headers)
    }
}

/// Characters left alone by RFC 3986 URI encoding: `A-Z a-z 0-9 - . _ ~`
const URI_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

const URI_RESERVED_KEEP_SLASH: &AsciiSet = &URI_RESERVED.remove(b'/');

/// RFC 3986 encoding as required by SigV4. `/` is kept when `keep_slash`.
pub fn uri_encode(value: &str, keep_slash: bool) -> String {
    let set = if keep_slash {
        URI_RESERVED_KEEP_SLASH
    } else {
        URI_RESERVED
    };
    utf8_percent_encode(value, set).to_string()
}

pub fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so new_from_slice cannot fail here.
    let mut mac = match Hmac::<Sha256>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC-SHA256 accepts any key length"),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// `host[:port]` as it appears in the Host header.
pub fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts<'a>(url: &'a Url, headers: &'a HeaderMap) -> RequestParts<'a> {
        RequestParts {
            method: "GET",
            url,
            headers,
            payload: Payload::Bytes(b""),
        }
    }

    #[test]
    fn test_bearer_adds_authorization() {
        let url = Url::parse("https://api.example.com/x").unwrap();
        let headers = HeaderMap::new();
        let signed = SigningStrategy::Bearer("tok".into())
            .sign(&parts(&url, &headers), Utc::now())
            .unwrap();
        assert_eq!(signed["authorization"], "Bearer tok");
    }

    #[test]
    fn test_empty_bearer_is_not_configured() {
        let url = Url::parse("https://api.example.com/x").unwrap();
        let headers = HeaderMap::new();
        let err = SigningStrategy::Bearer(String::new())
            .sign(&parts(&url, &headers), Utc::now())
            .unwrap_err();
        assert!(matches!(err, OffloadError::NotConfigured(_)));
    }

    #[test]
    fn test_basic_and_token_header() {
        let url = Url::parse("https://api.example.com/x").unwrap();
        let headers = HeaderMap::new();
        let signed = SigningStrategy::Basic {
            user: "key".into(),
            password: "secret".into(),
        }
        .sign(&parts(&url, &headers), Utc::now())
        .unwrap();
        assert_eq!(signed["authorization"], "Basic a2V5OnNlY3JldA==");

        let signed = SigningStrategy::TokenHeader {
            name: "Authorization".into(),
            value: "4_abc".into(),
        }
        .sign(&parts(&url, &headers), Utc::now())
        .unwrap();
        assert_eq!(signed["authorization"], "4_abc");
    }

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode("a b/c~d", true), "a%20b/c~d");
        assert_eq!(uri_encode("a b/c", false), "a%20b%2Fc");
        assert_eq!(uri_encode("test$file.text", true), "test%24file.text");
    }

    #[test]
    fn test_host_header_includes_non_default_port() {
        let url = Url::parse("http://127.0.0.1:9000/bucket").unwrap();
        assert_eq!(host_header(&url), "127.0.0.1:9000");
        let url = Url::parse("https://s3.amazonaws.com/bucket").unwrap();
        assert_eq!(host_header(&url), "s3.amazonaws.com");
    }
}
