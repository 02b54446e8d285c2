//! OneDrive through Microsoft Graph.

use super::DestinationContext;
use crate::signing::oauth::{OAuthCredentials, TokenSource};
use crate::signing::uri_encode;
use crate::transfer::http::{parse_endpoint, HttpTransport, ProviderRequest};
use crate::transfer::{file_name, join_remote, DeleteOutcome, Destination, RemoteObject, StorageUsage};
use crate::Result;
use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};
use url::Url;

const GRAPH_BASE: &str = "https://graph.microsoft.com";
const TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct OneDriveConfig {
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

    /// Folder under the drive root
    #[serde(default)]
    pub folder: String,

    #[serde(default)]
    pub endpoint: Option<String>,
}

impl std::fmt::Debug for OneDriveConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneDriveConfig")
            .field("folder", &self.folder)
            .field("oauth", &self.oauth())
            .finish_non_exhaustive()
    }
}

impl OneDriveConfig {
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
struct Children {
    #[serde(default)]
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    id: String,
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    last_modified_date_time: Option<String>,
    #[serde(default)]
    file: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Drive {
    quota: Quota,
}

#[derive(Debug, Deserialize)]
struct Quota {
    #[serde(default)]
    used: u64,
    #[serde(default)]
    total: Option<u64>,
}

#[derive(Debug)]
pub struct OneDriveDestination {
    id: String,
    name: String,
    config: OneDriveConfig,
    ctx: DestinationContext,
    tokens: TokenSource,
}

impl OneDriveDestination {
    pub fn new(id: &str, name: &str, config: OneDriveConfig, ctx: DestinationContext) -> Self {
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

    fn url(&self, path: &str) -> Result<Url> {
        let mut url = parse_endpoint(self.config.endpoint.as_deref().unwrap_or(GRAPH_BASE))?;
        url.set_path(&format!("/v1.0{path}"));
        Ok(url)
    }

    /// `/me/drive/root:/{folder}/{file}` style item path.
    fn item_path(&self, filename: &str) -> String {
        let relative = join_remote(&self.config.folder, filename);
        format!("/me/drive/root:/{}", uri_encode(&relative, true))
    }

    fn children_path(&self) -> String {
        match self.config.folder.trim_matches('/') {
            "" => "/me/drive/root/children".to_string(),
            folder => format!("/me/drive/root:/{}:/children", uri_encode(folder, true)),
        }
    }
}

#[async_trait]
impl Destination for OneDriveDestination {
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
        let filename = file_name(local_path)?;
        let len = tokio::fs::metadata(local_path).await?.len();
        info!(destination = %self.id, task_id, file = %filename, bytes = len, "Uploading to OneDrive");

        let url = self.url(&format!("{}:/content", self.item_path(&filename)))?;
        let request = ProviderRequest::new(Method::PUT, url)
            .header("content-type", "application/octet-stream")
            .file(local_path.to_path_buf(), len);
        self.ctx.http.send(request, &signer).await?;
        Ok(())
    }

    async fn try_list_remote_backups(&self) -> Result<Vec<RemoteObject>> {
        let signer = self.tokens.strategy(&self.ctx.http).await?;
        let mut objects = Vec::new();
        let mut next = Some(self.url(&self.children_path())?);

        while let Some(url) = next.take() {
            let response = self
                .ctx
                .http
                .execute(ProviderRequest::new(Method::GET, url), &signer)
                .await?;
            if response.status().as_u16() == 404 {
                break;
            }
            let response = HttpTransport::ensure_success(response).await?;
            let page: Children = response.json().await?;

            for item in page.value.into_iter().filter(|i| i.file.is_some()) {
                objects.push(RemoteObject {
                    name: item.name,
                    size_bytes: item.size,
                    modified_at: item
                        .last_modified_date_time
                        .as_deref()
                        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                        .map(|dt| dt.timestamp())
                        .unwrap_or(0),
                    id: Some(item.id),
                });
            }
            next = match page.next_link {
                Some(link) => Some(parse_endpoint(&link)?),
                None => None,
            };
        }
        Ok(objects)
    }

    async fn delete_remote_backup_by_name(&self, filename: &str) -> Result<DeleteOutcome> {
        let signer = self.tokens.strategy(&self.ctx.http).await?;
        let url = self.url(&self.item_path(filename))?;
        let response = self
            .ctx
            .http
            .execute(ProviderRequest::new(Method::DELETE, url), &signer)
            .await?;
        if response.status().as_u16() == 404 {
            return Ok(DeleteOutcome::already_absent(filename));
        }
        HttpTransport::ensure_success(response).await?;
        debug!(destination = %self.id, file = %filename, "Deleted OneDrive item");

        // Best effort, the delete already went through.
        let quota = match self.provider_storage_usage(self.ctx.http.now()).await {
            Ok(quota) => quota,
            Err(e) => {
                debug!(destination = %self.id, error = %e, "Could not read quota after delete");
                None
            }
        };
        Ok(DeleteOutcome::deleted(filename).with_quota(quota))
    }

    async fn provider_storage_usage(&self, now: i64) -> Result<Option<StorageUsage>> {
        let signer = self.tokens.strategy(&self.ctx.http).await?;
        let drive: Drive = self
            .ctx
            .http
            .send_json(ProviderRequest::new(Method::GET, self.url("/me/drive")?), &signer)
            .await?;
        Ok(Some(StorageUsage::from_provider(drive.quota.used, drive.quota.total, now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use crate::host::FixedClock;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn destination(server: &MockServer, config: OneDriveConfig) -> OneDriveDestination {
        let transfer = TransferConfig::default();
        let http = HttpTransport::new(&transfer, Arc::new(FixedClock::new(5_000))).unwrap();
        OneDriveDestination::new(
            "onedrive",
            "OneDrive",
            OneDriveConfig {
                endpoint: Some(server.uri()),
                folder: "Backups".into(),
                ..config
            },
            DestinationContext { http, transfer },
        )
    }

    fn token() -> OneDriveConfig {
        OneDriveConfig {
            access_token: "tok".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_upload_puts_content() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1.0/me/drive/root:/Backups/a.zip:/content"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "1" })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.zip");
        std::fs::write(&file, b"abc").unwrap();
        destination(&server, token()).upload(&file, "t").await.unwrap();
    }

    #[tokio::test]
    async fn test_refreshes_expired_token_before_listing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("refresh_token=r1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh", "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me/drive/root:/Backups:/children"))
            .and(wiremock::matchers::header("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    { "id": "1", "name": "a.zip", "size": 3, "file": {},
                      "lastModifiedDateTime": "2024-01-01T00:00:00Z" },
                    { "id": "2", "name": "sub", "folder": { "childCount": 0 } }
                ]
            })))
            .mount(&server)
            .await;

        let config = OneDriveConfig {
            access_token: "old".into(),
            refresh_token: "r1".into(),
            client_id: "cid".into(),
            expires_at: 4_000,
            ..Default::default()
        };
        let objects = destination(&server, config).try_list_remote_backups().await.unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].name, "a.zip");
    }

    #[tokio::test]
    async fn test_delete_404_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1.0/me/drive/root:/Backups/a.zip"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let outcome = destination(&server, token())
            .delete_remote_backup_by_name("a.zip")
            .await
            .unwrap();
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn test_delete_reports_quota_after_removal() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1.0/me/drive/root:/Backups/a.zip"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me/drive"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "quota": { "used": 400, "total": 1000 }
            })))
            .mount(&server)
            .await;

        let outcome = destination(&server, token())
            .delete_remote_backup_by_name("a.zip")
            .await
            .unwrap();
        assert!(outcome.success);
        let quota = outcome.quota.unwrap();
        assert_eq!(quota.used_bytes, 400);
        assert_eq!(quota.free_bytes, Some(600));
        assert_eq!(quota.refreshed_at, 5_000);
    }

    #[tokio::test]
    async fn test_delete_succeeds_when_quota_lookup_fails() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1.0/me/drive/root:/Backups/a.zip"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me/drive"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let outcome = destination(&server, token())
            .delete_remote_backup_by_name("a.zip")
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(outcome.quota.is_none());
    }

    #[tokio::test]
    async fn test_quota_from_drive() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me/drive"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "quota": { "used": 950, "total": 1000, "remaining": 50 }
            })))
            .mount(&server)
            .await;

        let usage = destination(&server, token()).get_storage_usage(5_000).await.unwrap();
        assert_eq!(usage.ratio(), Some(0.95));
    }
}
