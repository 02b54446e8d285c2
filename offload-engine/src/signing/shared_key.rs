//! Azure Storage SharedKey authorization.

use super::{hmac_sha256, HeaderMap, RequestParts};
use crate::{OffloadError, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const API_VERSION: &str = "2021-08-06";

/// Standard headers that take part in the string-to-sign, in order.
const STANDARD_HEADERS: [&str; 11] = [
    "content-encoding",
    "content-language",
    "content-length",
    "content-md5",
    "content-type",
    "date",
    "if-modified-since",
    "if-match",
    "if-none-match",
    "if-unmodified-since",
    "range",
];

#[derive(Clone, Serialize, Deserialize)]
pub struct SharedKeyCredentials {
    pub account: String,
    /// Base64 account key as shown in the portal
    pub key: String,
}

/// Headers added by SharedKey: `x-ms-date`, `x-ms-version`, `authorization`.
pub fn sign(creds: &SharedKeyCredentials, parts: &RequestParts<'_>, now: DateTime<Utc>) -> Result<HeaderMap> {
    if creds.account.is_empty() || creds.key.is_empty() {
        return Err(OffloadError::NotConfigured("storage account / access key".into()));
    }
    let key = base64::engine::general_purpose::STANDARD
        .decode(creds.key.trim())
        .map_err(|e| OffloadError::NotConfigured(format!("access key is not valid base64: {e}")))?;

    let mut headers = parts.headers.clone();
    headers.insert("x-ms-date".into(), now.format("%a, %d %b %Y %H:%M:%S GMT").to_string());
    headers
        .entry("x-ms-version".into())
        .or_insert_with(|| API_VERSION.to_string());

    let string_to_sign = string_to_sign(&creds.account, parts, &headers);
    let signature = base64::engine::general_purpose::STANDARD
        .encode(hmac_sha256(&key, string_to_sign.as_bytes()));

    let mut out = HeaderMap::new();
    out.insert("x-ms-date".into(), headers["x-ms-date"].clone());
    out.insert("x-ms-version".into(), headers["x-ms-version"].clone());
    out.insert(
        "authorization".into(),
        format!("SharedKey {}:{signature}", creds.account),
    );
    Ok(out)
}

/// String-to-sign for service version 2015-02-21 and later.
pub fn string_to_sign(account: &str, parts: &RequestParts<'_>, headers: &HeaderMap) -> String {
    let mut lines = vec![parts.method.to_string()];
    for name in STANDARD_HEADERS {
        let value = if name == "content-length" {
            match parts.payload.len() {
                0 => String::new(),
                n => n.to_string(),
            }
        } else {
            headers.get(name).cloned().unwrap_or_default()
        };
        lines.push(value);
    }

    let canonical_headers: String = headers
        .iter()
        .filter(|(k, _)| k.starts_with("x-ms-"))
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();

    format!(
        "{}\n{}{}",
        lines.join("\n"),
        canonical_headers,
        canonical_resource(account, parts.url)
    )
}

fn canonical_resource(account: &str, url: &url::Url) -> String {
    let mut resource = format!("/{account}{}", url.path());
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (k, v) in url.query_pairs() {
        params
            .entry(k.to_ascii_lowercase())
            .or_default()
            .push(v.into_owned());
    }
    for (name, mut values) in params {
        values.sort();
        resource.push_str(&format!("\n{name}:{}", values.join(",")));
    }
    resource
}
