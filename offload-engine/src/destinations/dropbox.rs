//! Dropbox API v2.

use super::DestinationContext;
use crate::signing::oauth::{OAuthCredentials, TokenSource};
use crate::transfer::http::{parse_endpoint, ProviderRequest};
use crate::transfer::{file_name, DeleteOutcome, Destination, RemoteObject, StorageUsage};
use crate::{OffloadError, Result};
use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use tracing::{debug, info};
use url::Url;

const API_HOST: &str = "https://api.dropboxapi.com";
const CONTENT_HOST: &str = "https://content.dropboxapi.com";

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct DropboxConfig {
    #[serde(default)]
    pub access_token: String,

    #[serde(default)]
    pub refresh_token: String,

    /// App key
    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    #[serde(default)]
    pub expires_at: i64,

    /// Folder inside the app folder, e.g. `/backups`
    #[serde(default)]
    pub folder: String,

    /// Replaces both API hosts (used against local mocks)
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl std::fmt::Debug for DropboxConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DropboxConfig")
            .field("folder", &self.folder)
            .field("oauth", &self.oauth())
            .finish_non_exhaustive()
    }
}

impl DropboxConfig {
    pub fn oauth(&self) -> OAuthCredentials {
        OAuthCredentials {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            expires_at: self.expires_at,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.oauth().is_configured()
    }
}

#[derive(Debug, Deserialize)]
struct ListFolderResult {
    #[serde(default)]
    entries: Vec<Entry>,
    #[serde(default)]
    cursor: String,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct Entry {
    #[serde(rename = ".tag")]
    tag: String,
    name: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    server_modified: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SpaceUsage {
    used: u64,
    #[serde(default)]
    allocation: Option<Allocation>,
}

#[derive(Debug, Deserialize)]
struct Allocation {
    #[serde(default)]
    allocated: Option<u64>,
}

#[derive(Debug)]
pub struct DropboxDestination {
    id: String,
    name: String,
    config: DropboxConfig,
    ctx: DestinationContext,
    tokens: TokenSource,
}

impl DropboxDestination {
    pub fn new(id: &str, name: &str, config: DropboxConfig, ctx: DestinationContext) -> Self {
        let token_url = format!("{}/oauth2/token", config.endpoint.as_deref().unwrap_or(API_HOST));
        let tokens = TokenSource::new(config.oauth(), token_url);
        Self {
            id: id.to_string(),
            name: name.to_string(),
            config,
            ctx,
            tokens,
        }
    }

    fn url(&self, host: &str, path: &str) -> Result<Url> {
        let mut url = parse_endpoint(self.config.endpoint.as_deref().unwrap_or(host))?;
        url.set_path(path);
        Ok(url)
    }

    fn remote_path(&self, filename: &str) -> String {
        match self.config.folder.trim_matches('/') {
            "" => format!("/{filename}"),
            folder => format!("/{folder}/{filename}"),
        }
    }

    /// `list_folder` wants "" for the app root.
    fn folder_path(&self) -> String {
        match self.config.folder.trim_matches('/') {
            "" => String::new(),
            folder => format!("/{folder}"),
        }
    }

    async fn rpc(&self, path: &str, body: &Value) -> Result<reqwest::Response> {
        let signer = self.tokens.strategy(&self.ctx.http).await?;
        let request = ProviderRequest::new(Method::POST, self.url(API_HOST, path)?).json(body);
        self.ctx.http.execute(request, &signer).await
    }
}

/// JSON for the `Dropbox-API-Arg` header, with non-ASCII escaped as `\uXXXX`.
pub fn api_arg(value: &Value) -> String {
    let raw = value.to_string();
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    out
}

#[async_trait]
impl Destination for DropboxDestination {
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
        let signer = self.tokens.strategy(&self.ctx.http).await?;
        let remote = self.remote_path(&file_name(local_path)?);
        let len = tokio::fs::metadata(local_path).await?.len();
        info!(destination = %self.id, task_id, path = %remote, bytes = len, "Uploading to Dropbox");

        let arg = json!({ "path": remote, "mode": "overwrite", "autorename": false, "mute": true });
        let request = ProviderRequest::new(Method::POST, self.url(CONTENT_HOST, "/2/files/upload")?)
            .header("dropbox-api-arg", api_arg(&arg))
            .header("content-type", "application/octet-stream")
            .file(local_path.to_path_buf(), len);
        self.ctx.http.send(request, &signer).await?;
        Ok(())
    }

    async fn try_list_remote_backups(&self) -> Result<Vec<RemoteObject>> {
        let mut objects = Vec::new();
        let mut response = self
            .rpc("/2/files/list_folder", &json!({ "path": self.folder_path() }))
            .await?;

        loop {
            let status = response.status().as_u16();
            let body = response.text().await?;
            if status == 409 && body.contains("not_found") {
                // Folder not created yet
                return Ok(objects);
            }
            if !(200..300).contains(&status) {
                return Err(OffloadError::transfer(status, body));
            }
            let page: ListFolderResult = serde_json::from_str(&body)?;
            for entry in page.entries.into_iter().filter(|e| e.tag == "file") {
                objects.push(RemoteObject {
                    name: entry.name,
                    size_bytes: entry.size,
                    modified_at: entry
                        .server_modified
                        .as_deref()
                        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                        .map(|dt| dt.timestamp())
                        .unwrap_or(0),
                    id: entry.id,
                });
            }
            if !page.has_more {
                return Ok(objects);
            }
            response = self
                .rpc("/2/files/list_folder/continue", &json!({ "cursor": page.cursor }))
                .await?;
        }
    }

    async fn delete_remote_backup_by_name(&self, filename: &str) -> Result<DeleteOutcome> {
        let remote = self.remote_path(filename);
        let response = self.rpc("/2/files/delete_v2", &json!({ "path": remote })).await?;
        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            debug!(destination = %self.id, path = %remote, "Deleted Dropbox file");
            return Ok(DeleteOutcome::deleted(filename));
        }
        let body = response.text().await.unwrap_or_default();
        if status == 409 && body.contains("not_found") {
            return Ok(DeleteOutcome::already_absent(filename));
        }
        Err(OffloadError::transfer(status, body))
    }

    async fn provider_storage_usage(&self, now: i64) -> Result<Option<StorageUsage>> {
        let signer = self.tokens.strategy(&self.ctx.http).await?;
        // RPC endpoints without arguments take a JSON null body.
        let request = ProviderRequest::new(Method::POST, self.url(API_HOST, "/2/users/get_space_usage")?)
            .json(&Value::Null);
        let usage: SpaceUsage = self.ctx.http.send_json(request, &signer).await?;
        let quota = usage.allocation.and_then(|a| a.allocated);
        Ok(Some(StorageUsage::from_provider(usage.used, quota, now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use crate::host::FixedClock;
    use crate::transfer::http::HttpTransport;
    use crate::transfer::UsageSource;
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn destination(server: &MockServer) -> DropboxDestination {
        let transfer = TransferConfig::default();
        let http = HttpTransport::new(&transfer, Arc::new(FixedClock::new(1_000))).unwrap();
        DropboxDestination::new(
            "dropbox",
            "Dropbox",
            DropboxConfig {
                access_token: "tok".into(),
                folder: "/backups/".into(),
                endpoint: Some(server.uri()),
                ..Default::default()
            },
            DestinationContext { http, transfer },
        )
    }

    #[test]
    fn test_api_arg_escapes_non_ascii() {
        assert_eq!(api_arg(&json!({ "path": "/é" })), "{\"path\":\"/\\u00e9\"}");
    }

    #[tokio::test]
    async fn test_upload_sends_path_in_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/files/upload"))
            .and(header("authorization", "Bearer tok"))
            .and(header_exists("dropbox-api-arg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "a.zip" })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.zip");
        std::fs::write(&file, b"data").unwrap();
        destination(&server).upload(&file, "t").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_follows_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/files/list_folder"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "entries": [
                    { ".tag": "file", "name": "a.zip", "id": "id:a", "size": 5,
                      "server_modified": "2024-01-01T00:00:00Z" },
                    { ".tag": "folder", "name": "nested", "id": "id:n" }
                ],
                "cursor": "c1",
                "has_more": true
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/files/list_folder/continue"))
            .and(body_partial_json(json!({ "cursor": "c1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "entries": [{ ".tag": "file", "name": "b.zip", "size": 6 }],
                "cursor": "c2",
                "has_more": false
            })))
            .mount(&server)
            .await;

        let objects = destination(&server).try_list_remote_backups().await.unwrap();
        let names: Vec<&str> = objects.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["a.zip", "b.zip"]);
        assert_eq!(objects[0].modified_at, 1_704_067_200);
    }

    #[tokio::test]
    async fn test_delete_not_found_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/files/delete_v2"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "error_summary": "path_lookup/not_found/..",
                "error": { ".tag": "path_lookup", "path_lookup": { ".tag": "not_found" } }
            })))
            .expect(2)
            .mount(&server)
            .await;

        let dest = destination(&server);
        assert!(dest.delete_remote_backup_by_name("a.zip").await.unwrap().success);
        assert!(dest.delete_remote_backup_by_name("a.zip").await.unwrap().success);
    }

    #[tokio::test]
    async fn test_delete_other_conflict_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/files/delete_v2"))
            .respond_with(ResponseTemplate::new(409).set_body_string("{\"error_summary\": \"too_many_write_operations\"}"))
            .mount(&server)
            .await;

        let err = destination(&server).delete_remote_backup_by_name("a.zip").await.unwrap_err();
        assert_eq!(err.http_status(), Some(409));
    }

    #[tokio::test]
    async fn test_space_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/users/get_space_usage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "used": 300,
                "allocation": { ".tag": "individual", "allocated": 1000 }
            })))
            .mount(&server)
            .await;

        let usage = destination(&server).get_storage_usage(1_000).await.unwrap();
        assert_eq!(usage.source, UsageSource::Provider);
        assert_eq!(usage.free_bytes, Some(700));
    }
}
