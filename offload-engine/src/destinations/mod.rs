//! Provider backends.
//!
//! Each provider is plain data (a config struct and a signing strategy) plus
//! one `Destination` impl. [`build_destination`] turns a `[destinations.<id>]`
//! table into a ready destination.

pub mod azure;
pub mod b2;
pub mod dropbox;
pub mod gdrive;
pub mod onedrive;
pub mod pcloud;
pub mod s3;
pub mod sftp;

use crate::config::{DestinationConfig, TransferConfig};
use crate::transfer::http::HttpTransport;
use crate::transfer::Destination;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub use azure::{AzureConfig, AzureDestination};
pub use b2::{B2Config, B2Destination};
pub use dropbox::{DropboxConfig, DropboxDestination};
pub use gdrive::{GoogleDriveConfig, GoogleDriveDestination};
pub use onedrive::{OneDriveConfig, OneDriveDestination};
pub use pcloud::{PCloudConfig, PCloudDestination, PCloudRegion};
pub use s3::{S3Config, S3Destination, S3Preset};
pub use sftp::{SftpConfig, SftpDestination};

/// Provider-specific connection settings, tagged by `provider`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum ProviderConfig {
    S3(S3Config),
    Azure(AzureConfig),
    B2(B2Config),
    Dropbox(DropboxConfig),
    #[serde(rename = "onedrive")]
    OneDrive(OneDriveConfig),
    #[serde(rename = "pcloud")]
    PCloud(PCloudConfig),
    Sftp(SftpConfig),
    GoogleDrive(GoogleDriveConfig),
}

impl ProviderConfig {
    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderConfig::S3(c) => c.preset.display_name(),
            ProviderConfig::Azure(_) => "Azure Blob Storage",
            ProviderConfig::B2(_) => "Backblaze B2",
            ProviderConfig::Dropbox(_) => "Dropbox",
            ProviderConfig::OneDrive(_) => "OneDrive",
            ProviderConfig::PCloud(_) => "pCloud",
            ProviderConfig::Sftp(_) => "SFTP",
            ProviderConfig::GoogleDrive(_) => "Google Drive",
        }
    }

    /// Required connection fields are all filled in.
    pub fn is_connected(&self) -> bool {
        match self {
            ProviderConfig::S3(c) => c.is_connected(),
            ProviderConfig::Azure(c) => c.is_connected(),
            ProviderConfig::B2(c) => c.is_connected(),
            ProviderConfig::Dropbox(c) => c.is_connected(),
            ProviderConfig::OneDrive(c) => c.is_connected(),
            ProviderConfig::PCloud(c) => c.is_connected(),
            ProviderConfig::Sftp(c) => c.is_connected(),
            ProviderConfig::GoogleDrive(c) => c.is_connected(),
        }
    }
}

/// Shared services every destination is built with.
#[derive(Debug, Clone)]
pub struct DestinationContext {
    pub http: HttpTransport,
    pub transfer: TransferConfig,
}

/// Construct the destination described by `config` under `id`.
pub fn build_destination(id: &str, config: &DestinationConfig, ctx: &DestinationContext) -> Result<Arc<dyn Destination>> {
    let name = config
        .name
        .clone()
        .unwrap_or_else(|| config.provider.display_name().to_string());
    let ctx = ctx.clone();

    let destination: Arc<dyn Destination> = match &config.provider {
        ProviderConfig::S3(c) => Arc::new(S3Destination::new(id, &name, c.clone(), ctx)),
        ProviderConfig::Azure(c) => Arc::new(AzureDestination::new(id, &name, c.clone(), ctx)),
        ProviderConfig::B2(c) => Arc::new(B2Destination::new(id, &name, c.clone(), ctx)),
        ProviderConfig::Dropbox(c) => Arc::new(DropboxDestination::new(id, &name, c.clone(), ctx)),
        ProviderConfig::OneDrive(c) => Arc::new(OneDriveDestination::new(id, &name, c.clone(), ctx)),
        ProviderConfig::PCloud(c) => Arc::new(PCloudDestination::new(id, &name, c.clone(), ctx)),
        ProviderConfig::Sftp(c) => Arc::new(SftpDestination::new(
            id,
            &name,
            c.clone(),
            Duration::from_secs(ctx.transfer.connect_timeout_secs),
        )),
        ProviderConfig::GoogleDrive(c) => Arc::new(GoogleDriveDestination::new(id, &name, c.clone(), ctx)),
    };
    Ok(destination)
}
