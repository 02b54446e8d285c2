//! Backblaze B2 native API.

use super::DestinationContext;
use crate::signing::{uri_encode, SigningStrategy};
use crate::transfer::chunked::{self, ChunkReceipt, ChunkSink, ChunkSpec};
use crate::transfer::http::{parse_endpoint, ProviderRequest};
use crate::transfer::{file_name, join_remote, DeleteOutcome, Destination, RemoteObject};
use crate::{OffloadError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use std::path::Path;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const DEFAULT_API: &str = "https://api.backblazeb2.com";
const CONTENT_TYPE_AUTO: &str = "b2/x-auto";

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct B2Config {
    #[serde(default)]
    pub key_id: String,

    #[serde(default)]
    pub application_key: String,

    #[serde(default)]
    pub bucket_id: String,

    #[serde(default)]
    pub prefix: String,

    /// Authorization host; defaults to the public B2 API
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl std::fmt::Debug for B2Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("B2Config")
            .field("key_id", &self.key_id)
            .field("bucket_id", &self.bucket_id)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl B2Config {
    pub fn is_connected(&self) -> bool {
        !self.key_id.is_empty() && !self.application_key.is_empty() && !self.bucket_id.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Authorization {
    authorization_token: String,
    api_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadTarget {
    upload_url: String,
    authorization_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileVersion {
    file_id: String,
    file_name: String,
    #[serde(default)]
    content_length: u64,
    #[serde(default)]
    upload_timestamp: i64,
    #[serde(default)]
    action: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<FileVersion>,
    #[serde(default)]
    next_file_name: Option<String>,
}

#[derive(Debug)]
pub struct B2Destination {
    id: String,
    name: String,
    config: B2Config,
    ctx: DestinationContext,
    auth: Mutex<Option<Authorization>>,
}

impl B2Destination {
    pub fn new(id: &str, name: &str, config: B2Config, ctx: DestinationContext) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            config,
            ctx,
            auth: Mutex::new(None),
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.config.is_connected() {
            Ok(())
        } else {
            Err(OffloadError::NotConfigured(format!("{}: key id, application key and bucket id", self.id)))
        }
    }

    async fn authorize(&self) -> Result<Authorization> {
        let mut cached = self.auth.lock().await;
        if let Some(auth) = cached.as_ref() {
            return Ok(auth.clone());
        }

        let base = self.config.endpoint.as_deref().filter(|e| !e.is_empty()).unwrap_or(DEFAULT_API);
        let mut url = parse_endpoint(base)?;
        url.set_path("/b2api/v2/b2_authorize_account");
        let signer = SigningStrategy::Basic {
            user: self.config.key_id.clone(),
            password: self.config.application_key.clone(),
        };
        let auth: Authorization = self
            .ctx
            .http
            .send_json(ProviderRequest::new(Method::GET, url), &signer)
            .await?;
        debug!(destination = %self.id, api_url = %auth.api_url, "B2 account authorized");
        *cached = Some(auth.clone());
        Ok(auth)
    }

    /// POST a JSON call to `/b2api/v2/{op}`, re-authorizing once on 401.
    async fn api<T: DeserializeOwned>(&self, op: &str, body: Value) -> Result<T> {
        let mut reauthorized = false;
        loop {
            let auth = self.authorize().await?;
            let mut url = parse_endpoint(&auth.api_url)?;
            url.set_path(&format!("/b2api/v2/{op}"));
            let signer = SigningStrategy::TokenHeader {
                name: "Authorization".into(),
                value: auth.authorization_token.clone(),
            };
            match self
                .ctx
                .http
                .send_json(ProviderRequest::new(Method::POST, url).json(&body), &signer)
                .await
            {
                Err(e) if e.http_status() == Some(401) && !reauthorized => {
                    warn!(destination = %self.id, "B2 authorization expired, re-authorizing");
                    *self.auth.lock().await = None;
                    reauthorized = true;
                }
                other => return other,
            }
        }
    }

    fn remote_name(&self, filename: &str) -> String {
        join_remote(&self.config.prefix, filename)
    }

    async fn upload_small(&self, local_path: &Path, remote: &str, len: u64) -> Result<()> {
        let target: UploadTarget = self
            .api("b2_get_upload_url", json!({ "bucketId": self.config.bucket_id }))
            .await?;
        let sha1 = sha1_file(local_path).await?;
        let request = ProviderRequest::new(Method::POST, parse_endpoint(&target.upload_url)?)
            .header("x-bz-file-name", uri_encode(remote, true))
            .header("content-type", CONTENT_TYPE_AUTO)
            .header("x-bz-content-sha1", sha1)
            .file(local_path.to_path_buf(), len);
        let signer = SigningStrategy::TokenHeader {
            name: "Authorization".into(),
            value: target.authorization_token,
        };
        self.ctx.http.send(request, &signer).await?;
        Ok(())
    }

    async fn versions_of(&self, remote: &str) -> Result<Vec<FileVersion>> {
        let list: FileList = self
            .api(
                "b2_list_file_versions",
                json!({
                    "bucketId": self.config.bucket_id,
                    "startFileName": remote,
                    "prefix": remote,
                    "maxFileCount": 100,
                }),
            )
            .await?;
        Ok(list.files.into_iter().filter(|f| f.file_name == remote).collect())
    }
}

#[async_trait]
impl Destination for B2Destination {
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
        self.ensure_connected()?;
        let remote = self.remote_name(&file_name(local_path)?);
        let len = tokio::fs::metadata(local_path).await?.len();
        info!(destination = %self.id, task_id, file = %remote, bytes = len, "Uploading to B2");

        if len <= self.ctx.transfer.multipart_threshold {
            return self.upload_small(local_path, &remote, len).await;
        }
        let sink = LargeFileUpload { dest: self, remote };
        chunked::upload_chunked(
            &sink,
            local_path,
            self.ctx.transfer.chunk_size,
            self.ctx.transfer.part_retries,
        )
        .await
    }

    async fn try_list_remote_backups(&self) -> Result<Vec<RemoteObject>> {
        self.ensure_connected()?;
        let prefix = match self.config.prefix.trim_matches('/') {
            "" => String::new(),
            p => format!("{p}/"),
        };

        let mut objects = Vec::new();
        let mut start: Option<String> = None;
        loop {
            let mut body = json!({
                "bucketId": self.config.bucket_id,
                "prefix": prefix,
                "delimiter": "/",
                "maxFileCount": 1000,
            });
            if let Some(s) = &start {
                body["startFileName"] = json!(s);
            }
            let page: FileList = self.api("b2_list_file_names", body).await?;
            for file in page.files {
                if file.action != "upload" {
                    continue;
                }
                let Some(name) = file.file_name.strip_prefix(&prefix) else {
                    continue;
                };
                objects.push(RemoteObject {
                    name: name.to_string(),
                    size_bytes: file.content_length,
                    modified_at: file.upload_timestamp / 1000,
                    id: Some(file.file_id),
                });
            }
            match page.next_file_name {
                Some(next) => start = Some(next),
                None => break,
            }
        }
        Ok(objects)
    }

    async fn delete_remote_backup_by_name(&self, filename: &str) -> Result<DeleteOutcome> {
        self.ensure_connected()?;
        let remote = self.remote_name(filename);
        let versions = self.versions_of(&remote).await?;
        if versions.is_empty() {
            return Ok(DeleteOutcome::already_absent(filename));
        }
        for version in &versions {
            let _: Value = self
                .api(
                    "b2_delete_file_version",
                    json!({ "fileName": version.file_name, "fileId": version.file_id }),
                )
                .await?;
        }
        debug!(destination = %self.id, file = %remote, versions = versions.len(), "Deleted B2 file versions");
        Ok(DeleteOutcome::deleted(filename))
    }
}

struct LargeFileUpload<'a> {
    dest: &'a B2Destination,
    remote: String,
}

#[async_trait]
impl ChunkSink for LargeFileUpload<'_> {
    /// B2 file id of the large file
    type Session = String;

    /// Always a new large file. Unfinished ones left under the same name by
    /// an earlier call may hold parts of different content.
    async fn begin(&self, _total: u64) -> Result<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Started {
            file_id: String,
        }
        let started: Started = self
            .dest
            .api(
                "b2_start_large_file",
                json!({
                    "bucketId": self.dest.config.bucket_id,
                    "fileName": self.remote,
                    "contentType": CONTENT_TYPE_AUTO,
                }),
            )
            .await?;
        Ok(started.file_id)
    }

    async fn put_chunk(&self, file_id: &String, chunk: ChunkSpec, data: Bytes) -> Result<ChunkReceipt> {
        let target: UploadTarget = self
            .dest
            .api("b2_get_upload_part_url", json!({ "fileId": file_id }))
            .await?;
        let sha1 = hex::encode(Sha1::digest(&data));
        let request = ProviderRequest::new(Method::POST, parse_endpoint(&target.upload_url)?)
            .header("x-bz-part-number", (chunk.index + 1).to_string())
            .header("x-bz-content-sha1", sha1.clone())
            .bytes(data);
        let signer = SigningStrategy::TokenHeader {
            name: "Authorization".into(),
            value: target.authorization_token,
        };
        self.dest.ctx.http.send(request, &signer).await?;
        Ok(ChunkReceipt {
            index: chunk.index,
            id: sha1,
            size: chunk.len,
        })
    }

    async fn commit(&self, file_id: &String, receipts: &[ChunkReceipt]) -> Result<()> {
        let sha1s: Vec<&str> = receipts.iter().map(|r| r.id.as_str()).collect();
        let _: Value = self
            .dest
            .api(
                "b2_finish_large_file",
                json!({ "fileId": file_id, "partSha1Array": sha1s }),
            )
            .await?;
        Ok(())
    }

    async fn abort(&self, file_id: &String) -> Result<()> {
        let _: Value = self
            .dest
            .api("b2_cancel_large_file", json!({ "fileId": file_id }))
            .await?;
        info!(file = %self.remote, file_id = %file_id, "Cancelled B2 large file");
        Ok(())
    }
}

/// Hex SHA-1 of a whole file.
async fn sha1_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
