//! S3 and S3-compatible object stores (AWS, Wasabi, DigitalOcean Spaces, custom).

use super::DestinationContext;
use crate::signing::{uri_encode, SigV4Credentials, SigningStrategy};
use crate::transfer::chunked::{self, ChunkReceipt, ChunkSink, ChunkSpec};
use crate::transfer::http::{parse_endpoint, ProviderRequest};
use crate::transfer::{file_name, join_remote, DeleteOutcome, Destination, RemoteObject};
use crate::{OffloadError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum S3Preset {
    #[default]
    AwsS3,
    Wasabi,
    DigitaloceanSpaces,
    S3Compatible,
}

impl S3Preset {
    fn default_region(self) -> &'static str {
        match self {
            S3Preset::DigitaloceanSpaces => "nyc3",
            _ => "us-east-1",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            S3Preset::AwsS3 => "Amazon S3",
            S3Preset::Wasabi => "Wasabi",
            S3Preset::DigitaloceanSpaces => "DigitalOcean Spaces",
            S3Preset::S3Compatible => "S3 Compatible",
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct S3Config {
    #[serde(default)]
    pub preset: S3Preset,

    #[serde(default)]
    pub access_key: String,

    #[serde(default)]
    pub secret_key: String,

    #[serde(default)]
    pub bucket: String,

    /// Empty means the preset's default region
    #[serde(default)]
    pub region: String,

    /// Key prefix ("folder") inside the bucket
    #[serde(default)]
    pub prefix: String,

    /// Custom endpoint; forces path-style addressing
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("preset", &self.preset)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("prefix", &self.prefix)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl S3Config {
    pub fn is_connected(&self) -> bool {
        let endpoint_ok = self.preset != S3Preset::S3Compatible
            || self.endpoint.as_deref().is_some_and(|e| !e.is_empty());
        !self.access_key.is_empty() && !self.secret_key.is_empty() && !self.bucket.is_empty() && endpoint_ok
    }

    fn region(&self) -> &str {
        if self.region.is_empty() {
            self.preset.default_region()
        } else {
            &self.region
        }
    }
}

#[derive(Debug)]
pub struct S3Destination {
    id: String,
    name: String,
    config: S3Config,
    ctx: DestinationContext,
}

impl S3Destination {
    pub fn new(id: &str, name: &str, config: S3Config, ctx: DestinationContext) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            config,
            ctx,
        }
    }

    fn signer(&self) -> SigningStrategy {
        SigningStrategy::SigV4(SigV4Credentials::new(
            &self.config.access_key,
            &self.config.secret_key,
            self.config.region(),
            "s3",
        ))
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.config.is_connected() {
            Ok(())
        } else {
            Err(OffloadError::NotConfigured(format!("{}: access key, secret key and bucket", self.id)))
        }
    }

    /// Service base URL and whether the bucket goes in the path.
    fn base_url(&self) -> Result<(Url, bool)> {
        if let Some(endpoint) = self.config.endpoint.as_deref().filter(|e| !e.is_empty()) {
            return Ok((parse_endpoint(endpoint)?, true));
        }
        let region = self.config.region();
        let (raw, path_style) = match self.config.preset {
            S3Preset::AwsS3 => (
                format!("https://{}.s3.{region}.amazonaws.com", self.config.bucket),
                false,
            ),
            S3Preset::Wasabi => (format!("https://s3.{region}.wasabisys.com"), true),
            S3Preset::DigitaloceanSpaces => (format!("https://{region}.digitaloceanspaces.com"), true),
            S3Preset::S3Compatible => {
                return Err(OffloadError::NotConfigured(format!("{}: endpoint", self.id)));
            }
        };
        Ok((parse_endpoint(&raw)?, path_style))
    }

    fn key_for(&self, filename: &str) -> String {
        join_remote(&self.config.prefix, filename)
    }

    fn object_url(&self, key: &str, query: Option<&str>) -> Result<Url> {
        let (mut url, path_style) = self.base_url()?;
        let path = if path_style {
            format!("/{}/{}", uri_encode(&self.config.bucket, false), uri_encode(key, true))
        } else {
            format!("/{}", uri_encode(key, true))
        };
        url.set_path(&path);
        url.set_query(query);
        Ok(url)
    }

    fn bucket_url(&self, query: &str) -> Result<Url> {
        let (mut url, path_style) = self.base_url()?;
        if path_style {
            url.set_path(&format!("/{}", uri_encode(&self.config.bucket, false)));
        } else {
            url.set_path("/");
        }
        url.set_query(Some(query));
        Ok(url)
    }

    async fn put_object(&self, path: &Path, key: &str, len: u64) -> Result<()> {
        let url = self.object_url(key, None)?;
        let request = ProviderRequest::new(Method::PUT, url)
            .header("content-type", "application/octet-stream")
            .file(path.to_path_buf(), len);
        self.ctx.http.send(request, &self.signer()).await?;
        Ok(())
    }
}

#[async_trait]
impl Destination for S3Destination {
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
        let filename = file_name(local_path)?;
        let key = self.key_for(&filename);
        let len = tokio::fs::metadata(local_path).await?.len();

        info!(destination = %self.id, task_id, key = %key, bytes = len, "Uploading to S3");
        if len > self.ctx.transfer.multipart_threshold {
            let sink = MultipartUpload { dest: self, key };
            chunked::upload_chunked(
                &sink,
                local_path,
                self.ctx.transfer.chunk_size,
                self.ctx.transfer.part_retries,
            )
            .await
        } else {
            self.put_object(local_path, &key, len).await
        }
    }

    async fn try_list_remote_backups(&self) -> Result<Vec<RemoteObject>> {
        self.ensure_connected()?;
        let prefix = match self.config.prefix.trim_matches('/') {
            "" => String::new(),
            p => format!("{p}/"),
        };

        let mut objects = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut query = format!("list-type=2&prefix={}", uri_encode(&prefix, false));
            if let Some(t) = &token {
                query.push_str(&format!("&continuation-token={}", uri_encode(t, false)));
            }
            let url = self.bucket_url(&query)?;
            let response = self
                .ctx
                .http
                .send(ProviderRequest::new(Method::GET, url), &self.signer())
                .await?;
            let body = response.text().await?;
            let page: ListBucketResult = quick_xml::de::from_str(&body)?;

            for item in page.contents {
                let Some(name) = item.key.strip_prefix(&prefix) else {
                    continue;
                };
                // Only direct children of the prefix.
                if name.is_empty() || name.contains('/') {
                    continue;
                }
                objects.push(RemoteObject {
                    name: name.to_string(),
                    size_bytes: item.size,
                    modified_at: parse_timestamp(&item.last_modified),
                    id: None,
                });
            }

            match page.next_continuation_token {
                Some(next) if page.is_truncated => token = Some(next),
                _ => break,
            }
        }
        Ok(objects)
    }

    async fn delete_remote_backup_by_name(&self, filename: &str) -> Result<DeleteOutcome> {
        self.ensure_connected()?;
        let url = self.object_url(&self.key_for(filename), None)?;
        let response = self
            .ctx
            .http
            .execute(ProviderRequest::new(Method::DELETE, url), &self.signer())
            .await?;

        // S3 answers 204 whether or not the key existed.
        if response.status().as_u16() == 404 {
            return Ok(DeleteOutcome::already_absent(filename));
        }
        crate::transfer::http::HttpTransport::ensure_success(response).await?;
        debug!(destination = %self.id, file = %filename, "Deleted remote object");
        Ok(DeleteOutcome::deleted(filename))
    }
}

struct MultipartUpload<'a> {
    dest: &'a S3Destination,
    key: String,
}

#[async_trait]
impl ChunkSink for MultipartUpload<'_> {
    type Session = String;

    async fn begin(&self, _total: u64) -> Result<String> {
        let url = self.dest.object_url(&self.key, Some("uploads"))?;
        let response = self
            .dest
            .ctx
            .http
            .send(ProviderRequest::new(Method::POST, url), &self.dest.signer())
            .await?;
        let body = response.text().await?;
        let initiated: InitiateMultipartUploadResult = quick_xml::de::from_str(&body)?;
        debug!(key = %self.key, upload_id = %initiated.upload_id, "Multipart upload started");
        Ok(initiated.upload_id)
    }

    async fn put_chunk(&self, upload_id: &String, chunk: ChunkSpec, data: Bytes) -> Result<ChunkReceipt> {
        let query = format!("partNumber={}&uploadId={}", chunk.index + 1, uri_encode(upload_id, false));
        let url = self.dest.object_url(&self.key, Some(&query))?;
        let response = self
            .dest
            .ctx
            .http
            .send(ProviderRequest::new(Method::PUT, url).bytes(data), &self.dest.signer())
            .await?;
        let etag = response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| OffloadError::transfer(response.status().as_u16(), "part response without ETag"))?
            .to_string();
        Ok(ChunkReceipt {
            index: chunk.index,
            id: etag,
            size: chunk.len,
        })
    }

    async fn commit(&self, upload_id: &String, receipts: &[ChunkReceipt]) -> Result<()> {
        let query = format!("uploadId={}", uri_encode(upload_id, false));
        let url = self.dest.object_url(&self.key, Some(&query))?;
        let response = self
            .dest
            .ctx
            .http
            .send(
                ProviderRequest::new(Method::POST, url)
                    .header("content-type", "application/xml")
                    .bytes(complete_multipart_body(receipts)),
                &self.dest.signer(),
            )
            .await?;
        // CompleteMultipartUpload can fail with a 200 and an <Error> body.
        let status = response.status().as_u16();
        let body = response.text().await?;
        if body.contains("<Error>") {
            return Err(OffloadError::transfer(status, body));
        }
        Ok(())
    }

    async fn abort(&self, upload_id: &String) -> Result<()> {
        let query = format!("uploadId={}", uri_encode(upload_id, false));
        let url = self.dest.object_url(&self.key, Some(&query))?;
        self.dest
            .ctx
            .http
            .send(ProviderRequest::new(Method::DELETE, url), &self.dest.signer())
            .await?;
        Ok(())
    }
}

fn complete_multipart_body(receipts: &[ChunkReceipt]) -> String {
    let parts: String = receipts
        .iter()
        .map(|r| {
            format!(
                "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
                r.index + 1,
                xml_escape(&r.id)
            )
        })
        .collect();
    format!("<CompleteMultipartUpload>{parts}</CompleteMultipartUpload>")
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn parse_timestamp(raw: &str) -> i64 {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp())
        .unwrap_or(0)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    is_truncated: bool,
    #[serde(default)]
    contents: Vec<ListedObject>,
    #[serde(default)]
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedObject {
    key: String,
    #[serde(default)]
    last_modified: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateMultipartUploadResult {
    upload_id: String,
}
