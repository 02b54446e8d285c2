//! Google Drive v3 with resumable uploads.

use super::DestinationContext;
use crate::signing::oauth::{OAuthCredentials, TokenSource};
use crate::transfer::chunked::{self, ChunkReceipt, ChunkSink, ChunkSpec};
use crate::transfer::http::{parse_endpoint, HttpTransport, ProviderRequest};
use crate::transfer::{file_name, DeleteOutcome, Destination, RemoteObject, StorageUsage};
use crate::{OffloadError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use std::path::Path;
use tracing::{debug, info};
use url::Url;

const API_BASE: &str = "https://www.googleapis.com";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Status Drive uses for "chunk accepted, send the next one".
const RESUME_INCOMPLETE: u16 = 308;

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct GoogleDriveConfig {
    #[serde(default)]
    pub access_token: String,

    #[serde(default)]
    pub refresh_token: String,

    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    #[serde(default)]
    pub expires_at: i64,

    /// Parent folder id; `root` when empty
    #[serde(default)]
    pub folder_id: String,

    #[serde(default)]
    pub endpoint: Option<String>,
}

impl std::fmt::Debug for GoogleDriveConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleDriveConfig")
            .field("folder_id", &self.folder_id)
            .field("oauth", &self.oauth())
            .finish_non_exhaustive()
    }
}

impl GoogleDriveConfig {
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

    fn parent(&self) -> &str {
        if self.folder_id.is_empty() {
            "root"
        } else {
            &self.folder_id
        }
    }
}

/// Drive encodes int64 fields as JSON strings.
fn u64_from_string<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| s.parse().ok()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    #[serde(default, deserialize_with = "u64_from_string")]
    size: Option<u64>,
    #[serde(default)]
    modified_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct About {
    storage_quota: StorageQuota,
}

#[derive(Debug, Deserialize)]
struct StorageQuota {
    #[serde(default, deserialize_with = "u64_from_string")]
    limit: Option<u64>,
    #[serde(default, deserialize_with = "u64_from_string")]
    usage: Option<u64>,
}

#[derive(Debug)]
pub struct GoogleDriveDestination {
    id: String,
    name: String,
    config: GoogleDriveConfig,
    ctx: DestinationContext,
    tokens: TokenSource,
}

impl GoogleDriveDestination {
    pub fn new(id: &str, name: &str, config: GoogleDriveConfig, ctx: DestinationContext) -> Self {
        let token_url = match config.endpoint.as_deref() {
            Some(endpoint) => format!("{endpoint}/token"),
            None => TOKEN_URL.to_string(),
        };
        let tokens = TokenSource::new(config.oauth(), token_url);
        Self {
            id: id.to_string(),
            name: name.to_string(),
            config,
            ctx,
            tokens,
        }
    }

    fn url(&self, path: &str, params: &[(&str, &str)]) -> Result<Url> {
        let mut url = parse_endpoint(self.config.endpoint.as_deref().unwrap_or(API_BASE))?;
        url.set_path(path);
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        Ok(url)
    }

    async fn find_by_name(&self, filename: &str) -> Result<Vec<DriveFile>> {
        let signer = self.tokens.strategy(&self.ctx.http).await?;
        let query = format!(
            "name = '{}' and '{}' in parents and trashed = false",
            escape_query(filename),
            escape_query(self.config.parent())
        );
        let url = self.url(
            "/drive/v3/files",
            &[("q", query.as_str()), ("fields", "files(id,name,size,modifiedTime)")],
        )?;
        let list: FileList = self
            .ctx
            .http
            .send_json(ProviderRequest::new(Method::GET, url), &signer)
            .await?;
        Ok(list.files)
    }
}

fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

#[async_trait]
impl Destination for GoogleDriveDestination {
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
        info!(destination = %self.id, task_id, file = %filename, "Uploading to Google Drive");
        let sink = ResumableUpload { dest: self, filename };
        chunked::upload_chunked(
            &sink,
            local_path,
            self.ctx.transfer.chunk_size,
            self.ctx.transfer.part_retries,
        )
        .await
    }

    async fn try_list_remote_backups(&self) -> Result<Vec<RemoteObject>> {
        let signer = self.tokens.strategy(&self.ctx.http).await?;
        let query = format!(
            "'{}' in parents and trashed = false and mimeType != 'application/vnd.google-apps.folder'",
            escape_query(self.config.parent())
        );

        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![
                ("q", query.as_str()),
                ("fields", "nextPageToken,files(id,name,size,modifiedTime)"),
                ("pageSize", "1000"),
            ];
            if let Some(token) = page_token.as_deref() {
                params.push(("pageToken", token));
            }
            let url = self.url("/drive/v3/files", &params)?;
            let page: FileList = self
                .ctx
                .http
                .send_json(ProviderRequest::new(Method::GET, url), &signer)
                .await?;

            for file in page.files {
                objects.push(RemoteObject {
                    name: file.name,
                    size_bytes: file.size.unwrap_or(0),
                    modified_at: file
                        .modified_time
                        .as_deref()
                        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                        .map(|dt| dt.timestamp())
                        .unwrap_or(0),
                    id: Some(file.id),
                });
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(objects)
    }

    async fn delete_remote_backup_by_name(&self, filename: &str) -> Result<DeleteOutcome> {
        let matches = self.find_by_name(filename).await?;
        if matches.is_empty() {
            return Ok(DeleteOutcome::already_absent(filename));
        }
        let signer = self.tokens.strategy(&self.ctx.http).await?;
        for file in matches {
            let url = self.url(&format!("/drive/v3/files/{}", file.id), &[])?;
            let response = self
                .ctx
                .http
                .execute(ProviderRequest::new(Method::DELETE, url), &signer)
                .await?;
            if response.status().as_u16() != 404 {
                HttpTransport::ensure_success(response).await?;
            }
            debug!(destination = %self.id, file_id = %file.id, "Deleted Drive file");
        }
        Ok(DeleteOutcome::deleted(filename))
    }

    async fn provider_storage_usage(&self, now: i64) -> Result<Option<StorageUsage>> {
        let signer = self.tokens.strategy(&self.ctx.http).await?;
        let url = self.url("/drive/v3/about", &[("fields", "storageQuota")])?;
        let about: About = self
            .ctx
            .http
            .send_json(ProviderRequest::new(Method::GET, url), &signer)
            .await?;
        Ok(Some(StorageUsage::from_provider(
            about.storage_quota.usage.unwrap_or(0),
            about.storage_quota.limit,
            now,
        )))
    }
}

struct ResumableUpload<'a> {
    dest: &'a GoogleDriveDestination,
    filename: String,
}

/// Session URI plus the total length every `Content-Range` needs.
struct DriveSession {
    uri: Url,
    total: u64,
}

#[async_trait]
impl ChunkSink for ResumableUpload<'_> {
    type Session = DriveSession;

    async fn begin(&self, total: u64) -> Result<DriveSession> {
        let signer = self.dest.tokens.strategy(&self.dest.ctx.http).await?;
        let url = self.dest.url("/upload/drive/v3/files", &[("uploadType", "resumable")])?;
        let metadata = json!({ "name": self.filename, "parents": [self.dest.config.parent()] });
        let request = ProviderRequest::new(Method::POST, url)
            .header("x-upload-content-type", "application/octet-stream")
            .header("x-upload-content-length", total.to_string())
            .json(&metadata);
        let response = self.dest.ctx.http.send(request, &signer).await?;
        let location = response
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| OffloadError::transfer(response.status().as_u16(), "resumable session without Location"))?;
        Ok(DriveSession {
            uri: parse_endpoint(location)?,
            total,
        })
    }

    async fn put_chunk(&self, session: &DriveSession, chunk: ChunkSpec, data: Bytes) -> Result<ChunkReceipt> {
        let signer = self.dest.tokens.strategy(&self.dest.ctx.http).await?;
        let end = chunk.offset + chunk.len - 1;
        let request = ProviderRequest::new(Method::PUT, session.uri.clone())
            .header("content-range", format!("bytes {}-{end}/{}", chunk.offset, session.total))
            .bytes(data);
        let response = self.dest.ctx.http.execute(request, &signer).await?;
        if response.status().as_u16() != RESUME_INCOMPLETE {
            HttpTransport::ensure_success(response).await?;
        }
        Ok(ChunkReceipt {
            index: chunk.index,
            id: format!("{}-{end}", chunk.offset),
            size: chunk.len,
        })
    }

    /// The final chunk completes the file; only an empty file needs an explicit finish.
    async fn commit(&self, session: &DriveSession, receipts: &[ChunkReceipt]) -> Result<()> {
        if !receipts.is_empty() {
            return Ok(());
        }
        let signer = self.dest.tokens.strategy(&self.dest.ctx.http).await?;
        let request = ProviderRequest::new(Method::PUT, session.uri.clone()).header("content-range", "bytes */0");
        self.dest.ctx.http.send(request, &signer).await?;
        Ok(())
    }
}
