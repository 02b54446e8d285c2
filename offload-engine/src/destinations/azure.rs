//! Azure Blob Storage with SharedKey authorization and resumable block uploads.

use super::DestinationContext;
use crate::signing::{uri_encode, SharedKeyCredentials, SigningStrategy};
use crate::transfer::chunked::{self, ChunkReceipt, ChunkSink, ChunkSpec};
use crate::transfer::http::{parse_endpoint, HttpTransport, ProviderRequest};
use crate::transfer::{file_name, join_remote, DeleteOutcome, Destination, RemoteObject};
use crate::{OffloadError, Result};
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};
use url::Url;

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AzureConfig {
    #[serde(default)]
    pub account: String,

    /// Base64 storage account key
    #[serde(default)]
    pub access_key: String,

    #[serde(default)]
    pub container: String,

    #[serde(default)]
    pub prefix: String,

    /// Overrides `https://{account}.blob.core.windows.net`
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl std::fmt::Debug for AzureConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureConfig")
            .field("account", &self.account)
            .field("container", &self.container)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl AzureConfig {
    pub fn is_connected(&self) -> bool {
        !self.account.is_empty() && !self.access_key.is_empty() && !self.container.is_empty()
    }
}

/// Fixed-width block id so every id in a blob has the same length.
pub fn block_id(index: u32) -> String {
    base64::engine::general_purpose::STANDARD.encode(format!("{index:06}"))
}

#[derive(Debug)]
pub struct AzureDestination {
    id: String,
    name: String,
    config: AzureConfig,
    ctx: DestinationContext,
}

impl AzureDestination {
    pub fn new(id: &str, name: &str, config: AzureConfig, ctx: DestinationContext) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            config,
            ctx,
        }
    }

    fn signer(&self) -> SigningStrategy {
        SigningStrategy::SharedKey(SharedKeyCredentials {
            account: self.config.account.clone(),
            key: self.config.access_key.clone(),
        })
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.config.is_connected() {
            Ok(())
        } else {
            Err(OffloadError::NotConfigured(format!("{}: account, access key and container", self.id)))
        }
    }

    fn base_url(&self) -> Result<Url> {
        match self.config.endpoint.as_deref().filter(|e| !e.is_empty()) {
            Some(endpoint) => parse_endpoint(endpoint),
            None => parse_endpoint(&format!("https://{}.blob.core.windows.net", self.config.account)),
        }
    }

    fn blob_url(&self, filename: &str, query: Option<&str>) -> Result<Url> {
        let mut url = self.base_url()?;
        let blob = join_remote(&self.config.prefix, filename);
        url.set_path(&format!(
            "/{}/{}",
            uri_encode(&self.config.container, false),
            uri_encode(&blob, true)
        ));
        url.set_query(query);
        Ok(url)
    }

    fn container_url(&self, query: &str) -> Result<Url> {
        let mut url = self.base_url()?;
        url.set_path(&format!("/{}", uri_encode(&self.config.container, false)));
        url.set_query(Some(query));
        Ok(url)
    }
}

#[async_trait]
impl Destination for AzureDestination {
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
        let len = tokio::fs::metadata(local_path).await?.len();
        info!(destination = %self.id, task_id, file = %filename, bytes = len, "Uploading to Azure Blob");

        if len <= self.ctx.transfer.chunk_size {
            let request = ProviderRequest::new(Method::PUT, self.blob_url(&filename, None)?)
                .header("x-ms-blob-type", "BlockBlob")
                .header("content-type", "application/octet-stream")
                .file(local_path.to_path_buf(), len);
            self.ctx.http.send(request, &self.signer()).await?;
            return Ok(());
        }

        let sink = BlockUpload { dest: self, filename };
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
        let mut marker: Option<String> = None;
        loop {
            let mut query = format!("restype=container&comp=list&prefix={}", uri_encode(&prefix, false));
            if let Some(m) = &marker {
                query.push_str(&format!("&marker={}", uri_encode(m, false)));
            }
            let response = self
                .ctx
                .http
                .send(ProviderRequest::new(Method::GET, self.container_url(&query)?), &self.signer())
                .await?;
            let body = response.text().await?;
            let page: EnumerationResults = quick_xml::de::from_str(&body)?;

            for blob in page.blobs.blob {
                let Some(name) = blob.name.strip_prefix(&prefix) else {
                    continue;
                };
                if name.is_empty() || name.contains('/') {
                    continue;
                }
                objects.push(RemoteObject {
                    name: name.to_string(),
                    size_bytes: blob.properties.content_length,
                    modified_at: chrono::DateTime::parse_from_rfc2822(&blob.properties.last_modified)
                        .map(|dt| dt.timestamp())
                        .unwrap_or(0),
                    id: None,
                });
            }

            match page.next_marker.filter(|m| !m.is_empty()) {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        Ok(objects)
    }

    async fn delete_remote_backup_by_name(&self, filename: &str) -> Result<DeleteOutcome> {
        self.ensure_connected()?;
        let response = self
            .ctx
            .http
            .execute(
                ProviderRequest::new(Method::DELETE, self.blob_url(filename, None)?),
                &self.signer(),
            )
            .await?;
        if response.status().as_u16() == 404 {
            return Ok(DeleteOutcome::already_absent(filename));
        }
        HttpTransport::ensure_success(response).await?;
        debug!(destination = %self.id, file = %filename, "Deleted blob");
        Ok(DeleteOutcome::deleted(filename))
    }
}

struct BlockUpload<'a> {
    dest: &'a AzureDestination,
    filename: String,
}

#[async_trait]
impl ChunkSink for BlockUpload<'_> {
    type Session = ();

    /// Blocks left uncommitted by an earlier call are never looked at; the
    /// block list committed at the end replaces them.
    async fn begin(&self, _total: u64) -> Result<()> {
        Ok(())
    }

    async fn put_chunk(&self, _session: &(), chunk: ChunkSpec, data: Bytes) -> Result<ChunkReceipt> {
        let id = block_id(chunk.index);
        let query = format!("comp=block&blockid={}", uri_encode(&id, false));
        let url = self.dest.blob_url(&self.filename, Some(&query))?;
        self.dest
            .ctx
            .http
            .send(ProviderRequest::new(Method::PUT, url).bytes(data), &self.dest.signer())
            .await?;
        Ok(ChunkReceipt {
            index: chunk.index,
            id,
            size: chunk.len,
        })
    }

    async fn commit(&self, _session: &(), receipts: &[ChunkReceipt]) -> Result<()> {
        let latest: String = receipts
            .iter()
            .map(|r| format!("<Latest>{}</Latest>", r.id))
            .collect();
        let body = format!("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>{latest}</BlockList>");
        let url = self.dest.blob_url(&self.filename, Some("comp=blocklist"))?;
        self.dest
            .ctx
            .http
            .send(
                ProviderRequest::new(Method::PUT, url)
                    .header("content-type", "application/xml")
                    .bytes(body),
                &self.dest.signer(),
            )
            .await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EnumerationResults {
    #[serde(default)]
    blobs: BlobSet,
    #[serde(default)]
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BlobSet {
    #[serde(rename = "Blob", default)]
    blob: Vec<BlobItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobItem {
    name: String,
    properties: BlobProperties,
}

#[derive(Debug, Deserialize)]
struct BlobProperties {
    #[serde(rename = "Last-Modified", default)]
    last_modified: String,
    #[serde(rename = "Content-Length", default)]
    content_length: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use crate::host::FixedClock;
    use std::io::Write;
    use std::sync::Arc;
    use wiremock::matchers::{body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn destination(endpoint: &str) -> AzureDestination {
        let transfer = TransferConfig {
            chunk_size: 8,
            ..Default::default()
        };
        let http = HttpTransport::new(&transfer, Arc::new(FixedClock::new(1_700_000_000))).unwrap();
        AzureDestination::new(
            "azure",
            "Azure Blob",
            AzureConfig {
                account: "acct".into(),
                access_key: base64::engine::general_purpose::STANDARD.encode(b"key"),
                container: "backups".into(),
                prefix: "site".into(),
                endpoint: Some(endpoint.to_string()),
            },
            DestinationContext { http, transfer },
        )
    }

    fn archive(len: usize) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zip");
        std::fs::File::create(&path).unwrap().write_all(&vec![1u8; len]).unwrap();
        (dir, path)
    }

    #[test]
    fn test_block_ids_are_fixed_width() {
        assert_eq!(block_id(0).len(), block_id(999_999).len());
        let raw = base64::engine::general_purpose::STANDARD.decode(block_id(42)).unwrap();
        assert_eq!(raw, b"000042");
    }

    #[tokio::test]
    async fn test_small_file_is_single_put() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/backups/site/a.zip"))
            .and(header("x-ms-blob-type", "BlockBlob"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let (_dir, file) = archive(8);
        destination(&server.uri()).upload(&file, "t").await.unwrap();
    }

    #[tokio::test]
    async fn test_chunked_upload_stages_every_block_fresh() {
        let server = MockServer::start().await;
        // Uncommitted blocks from an earlier attempt are never consulted.
        Mock::given(method("GET"))
            .and(path("/backups/site/a.zip"))
            .and(query_param("comp", "blocklist"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/backups/site/a.zip"))
            .and(query_param("comp", "block"))
            .respond_with(ResponseTemplate::new(201))
            .expect(3)
            .mount(&server)
            .await;
        let expected = format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList><Latest>{}</Latest><Latest>{}</Latest><Latest>{}</Latest></BlockList>",
            block_id(0),
            block_id(1),
            block_id(2)
        );
        Mock::given(method("PUT"))
            .and(path("/backups/site/a.zip"))
            .and(query_param("comp", "blocklist"))
            .and(body_string(expected))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let (_dir, file) = archive(20);
        destination(&server.uri()).upload(&file, "t").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_blobs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/backups"))
            .and(query_param("comp", "list"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<?xml version=\"1.0\" encoding=\"utf-8\"?><EnumerationResults><Blobs>\
                 <Blob><Name>site/a.zip</Name><Properties><Last-Modified>Mon, 01 Jan 2024 00:00:00 GMT</Last-Modified><Content-Length>12</Content-Length></Properties></Blob>\
                 </Blobs><NextMarker /></EnumerationResults>",
            ))
            .mount(&server)
            .await;

        let objects = destination(&server.uri()).try_list_remote_backups().await.unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].name, "a.zip");
        assert_eq!(objects[0].size_bytes, 12);
        assert_eq!(objects[0].modified_at, 1_704_067_200);
    }

    #[tokio::test]
    async fn test_delete_missing_blob_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/backups/site/gone.zip"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let outcome = destination(&server.uri())
            .delete_remote_backup_by_name("gone.zip")
            .await
            .unwrap();
        assert!(outcome.success);
    }
}
