//! pCloud HTTP JSON API.
//!
//! pCloud answers 200 for almost everything and reports failures in the
//! `result` field, so every response goes through [`check_result`].

use super::DestinationContext;
use crate::signing::SigningStrategy;
use crate::transfer::http::{parse_endpoint, ProviderRequest};
use crate::transfer::{file_name, DeleteOutcome, Destination, RemoteObject, StorageUsage};
use crate::{OffloadError, Result};
use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info};
use url::Url;

/// `deletefile` on a missing file
const RESULT_FILE_NOT_FOUND: i64 = 2009;
/// `listfolder` on a missing folder
const RESULT_DIR_NOT_FOUND: i64 = 2005;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PCloudRegion {
    #[default]
    Us,
    Eu,
}

impl PCloudRegion {
    fn api_host(self) -> &'static str {
        match self {
            PCloudRegion::Us => "https://api.pcloud.com",
            PCloudRegion::Eu => "https://eapi.pcloud.com",
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct PCloudConfig {
    #[serde(default)]
    pub access_token: String,

    #[serde(default)]
    pub region: PCloudRegion,

    /// Absolute folder path, e.g. `/Backups`
    #[serde(default)]
    pub folder: String,

    #[serde(default)]
    pub endpoint: Option<String>,
}

impl std::fmt::Debug for PCloudConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PCloudConfig")
            .field("region", &self.region)
            .field("folder", &self.folder)
            .finish_non_exhaustive()
    }
}

impl PCloudConfig {
    pub fn is_connected(&self) -> bool {
        !self.access_token.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct FolderListing {
    metadata: FolderMetadata,
}

#[derive(Debug, Deserialize)]
struct FolderMetadata {
    #[serde(default)]
    contents: Vec<Item>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
struct Item {
    name: String,
    #[serde(default)]
    isfolder: bool,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    modified: Option<String>,
    #[serde(default)]
    fileid: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    #[serde(default)]
    usedquota: u64,
    #[serde(default)]
    quota: Option<u64>,
}

/// Map a non-zero `result` onto a transfer error.
fn check_result(body: &Value) -> Result<i64> {
    let code = body.get("result").and_then(Value::as_i64).unwrap_or(0);
    if code == 0 {
        return Ok(0);
    }
    let message = body
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("pCloud request failed");
    Err(OffloadError::transfer(200, format!("pCloud error {code}: {message}")))
}

fn result_code(body: &Value) -> i64 {
    body.get("result").and_then(Value::as_i64).unwrap_or(0)
}

#[derive(Debug)]
pub struct PCloudDestination {
    id: String,
    name: String,
    config: PCloudConfig,
    ctx: DestinationContext,
}

impl PCloudDestination {
    pub fn new(id: &str, name: &str, config: PCloudConfig, ctx: DestinationContext) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            config,
            ctx,
        }
    }

    fn signer(&self) -> SigningStrategy {
        SigningStrategy::Bearer(self.config.access_token.clone())
    }

    fn method_url(&self, method: &str, params: &[(&str, &str)]) -> Result<Url> {
        let host = self
            .config
            .endpoint
            .as_deref()
            .unwrap_or_else(|| self.config.region.api_host());
        let mut url = parse_endpoint(host)?;
        url.set_path(&format!("/{method}"));
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        Ok(url)
    }

    fn folder(&self) -> String {
        format!("/{}", self.config.folder.trim_matches('/'))
    }

    fn file_path(&self, filename: &str) -> String {
        match self.config.folder.trim_matches('/') {
            "" => format!("/{filename}"),
            folder => format!("/{folder}/{filename}"),
        }
    }

    async fn call(&self, method: Method, url: Url) -> Result<Value> {
        self.ctx
            .http
            .send_json(ProviderRequest::new(method, url), &self.signer())
            .await
    }
}

#[async_trait]
impl Destination for PCloudDestination {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.config.is_connected()
    }

    async fn upload(&self, local_path: &Path, task_id: &str) -> Result<()> {
        let filename = file_name(local_path)?;
        let len = tokio::fs::metadata(local_path).await?.len();
        info!(destination = %self.id, task_id, file = %filename, bytes = len, "Uploading to pCloud");

        let folder = self.folder();
        let url = self.method_url(
            "uploadfile",
            &[("path", folder.as_str()), ("filename", filename.as_str()), ("nopartial", "1")],
        )?;
        let request = ProviderRequest::new(Method::PUT, url)
            .header("content-type", "application/octet-stream")
            .file(local_path.to_path_buf(), len);
        let body: Value = self.ctx.http.send_json(request, &self.signer()).await?;
        check_result(&body)?;
        Ok(())
    }

    async fn try_list_remote_backups(&self) -> Result<Vec<RemoteObject>> {
        let folder = self.folder();
        let body = self
            .call(Method::GET, self.method_url("listfolder", &[("path", folder.as_str())])?)
            .await?;
        if result_code(&body) == RESULT_DIR_NOT_FOUND {
            return Ok(Vec::new());
        }
        check_result(&body)?;
        let listing: FolderListing = serde_json::from_value(body)?;

        Ok(listing
            .metadata
            .contents
            .into_iter()
            .filter(|item| !item.isfolder)
            .map(|item| RemoteObject {
                modified_at: item
                    .modified
                    .as_deref()
                    .and_then(|s| chrono::DateTime::parse_from_rfc2822(s).ok())
                    .map(|dt| dt.timestamp())
                    .unwrap_or(0),
                id: item.fileid.map(|id| id.to_string()),
                name: item.name,
                size_bytes: item.size,
            })
            .collect())
    }

    async fn delete_remote_backup_by_name(&self, filename: &str) -> Result<DeleteOutcome> {
        let path = self.file_path(filename);
        let body = self
            .call(Method::GET, self.method_url("deletefile", &[("path", path.as_str())])?)
            .await?;
        if result_code(&body) == RESULT_FILE_NOT_FOUND {
            return Ok(DeleteOutcome::already_absent(filename));
        }
        check_result(&body)?;
        debug!(destination = %self.id, path = %path, "Deleted pCloud file");
        Ok(DeleteOutcome::deleted(filename))
    }

    async fn provider_storage_usage(&self, now: i64) -> Result<Option<StorageUsage>> {
        let body = self.call(Method::GET, self.method_url("userinfo", &[])?).await?;
        check_result(&body)?;
        let info: UserInfo = serde_json::from_value(body)?;
        Ok(Some(StorageUsage::from_provider(info.usedquota, info.quota, now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use crate::host::FixedClock;
    use crate::transfer::http::HttpTransport;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn destination(server: &MockServer) -> PCloudDestination {
        let transfer = TransferConfig::default();
        let http = HttpTransport::new(&transfer, Arc::new(FixedClock::new(0))).unwrap();
        PCloudDestination::new(
            "pcloud",
            "pCloud",
            PCloudConfig {
                access_token: "tok".into(),
                region: PCloudRegion::Eu,
                folder: "Backups".into(),
                endpoint: Some(server.uri()),
            },
            DestinationContext { http, transfer },
        )
    }

    #[test]
    fn test_region_hosts() {
        assert_eq!(PCloudRegion::Eu.api_host(), "https://eapi.pcloud.com");
        let config: PCloudConfig = serde_json::from_value(json!({ "access_token": "t", "region": "eu" })).unwrap();
        assert_eq!(config.region, PCloudRegion::Eu);
    }

    #[tokio::test]
    async fn test_upload_checks_result_field() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/uploadfile"))
            .and(query_param("path", "/Backups"))
            .and(query_param("filename", "a.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": 2003, "error": "Access denied."
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.zip");
        std::fs::write(&file, b"x").unwrap();
        let err = destination(&server).upload(&file, "t").await.unwrap_err();
        assert!(err.to_string().contains("Access denied"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_delete_missing_file_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/deletefile"))
            .and(query_param("path", "/Backups/a.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": 2009, "error": "File not found."
            })))
            .expect(2)
            .mount(&server)
            .await;

        let dest = destination(&server);
        assert!(dest.delete_remote_backup_by_name("a.zip").await.unwrap().success);
        assert!(dest.delete_remote_backup_by_name("a.zip").await.unwrap().success);
    }

    #[tokio::test]
    async fn test_list_skips_folders() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/listfolder"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": 0,
                "metadata": { "contents": [
                    { "name": "a.zip", "isfolder": false, "size": 4, "fileid": 11,
                      "modified": "Mon, 01 Jan 2024 00:00:00 +0000" },
                    { "name": "old", "isfolder": true }
                ]}
            })))
            .mount(&server)
            .await;

        let objects = destination(&server).try_list_remote_backups().await.unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].id.as_deref(), Some("11"));
        assert_eq!(objects[0].modified_at, 1_704_067_200);
    }

    #[tokio::test]
    async fn test_usage_from_userinfo() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": 0, "usedquota": 10, "quota": 100
            })))
            .mount(&server)
            .await;

        let usage = destination(&server).get_storage_usage(0).await.unwrap();
        assert_eq!(usage.used_bytes, 10);
        assert_eq!(usage.quota_bytes, Some(100));
    }
}
