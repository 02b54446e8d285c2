//! Transfer engine: the uniform contract every destination implements.

pub mod chunked;
pub mod http;
pub mod usage;

use crate::retention::{self, RetentionPolicy};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{error, info, warn};

/// One listed remote file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub name: String,
    pub size_bytes: u64,
    /// Epoch seconds
    pub modified_at: i64,
    /// Provider file id where the provider has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Result of a delete call that reached the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteOutcome {
    pub success: bool,
    pub message: String,
    /// Usage after the delete, for providers that report it cheaply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<StorageUsage>,
}

impl DeleteOutcome {
    pub fn deleted(filename: &str) -> Self {
        Self {
            success: true,
            message: format!("Deleted {filename}"),
            quota: None,
        }
    }

    /// The object was not there; deletes are idempotent so this is a success.
    pub fn already_absent(filename: &str) -> Self {
        Self {
            success: true,
            message: format!("{filename} already deleted"),
            quota: None,
        }
    }

    /// The provider answered but refused the delete.
    pub fn refused(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            quota: None,
        }
    }

    pub fn with_quota(mut self, quota: Option<StorageUsage>) -> Self {
        self.quota = quota;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageSource {
    Provider,
    Estimate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageUsage {
    pub used_bytes: u64,
    pub quota_bytes: Option<u64>,
    pub free_bytes: Option<u64>,
    pub source: UsageSource,
    pub refreshed_at: i64,
}

impl StorageUsage {
    pub fn from_provider(used_bytes: u64, quota_bytes: Option<u64>, refreshed_at: i64) -> Self {
        Self {
            used_bytes,
            quota_bytes,
            free_bytes: quota_bytes.map(|q| q.saturating_sub(used_bytes)),
            source: UsageSource::Provider,
            refreshed_at,
        }
    }

    pub fn estimate(objects: &[RemoteObject], refreshed_at: i64) -> Self {
        Self {
            used_bytes: objects.iter().map(|o| o.size_bytes).sum(),
            quota_bytes: None,
            free_bytes: None,
            source: UsageSource::Estimate,
            refreshed_at,
        }
    }

    /// used / quota, when a non-zero quota is known
    pub fn ratio(&self) -> Option<f64> {
        match self.quota_bytes {
            Some(quota) if quota > 0 => Some(self.used_bytes as f64 / quota as f64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PruneReport {
    pub inspected: usize,
    pub deleted: usize,
    pub deleted_items: Vec<String>,
    pub errors: Vec<String>,
}

impl PruneReport {
    /// Some deletions failed while others went through.
    pub fn is_partial_failure(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[async_trait]
pub trait Destination: Send + Sync {
    /// Stable slug, e.g. `aws_s3`
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    /// True when every required connection field is filled in.
    fn is_connected(&self) -> bool;

    /// Upload one local archive.
    async fn upload(&self, local_path: &Path, task_id: &str) -> Result<()>;

    /// List archives in the destination folder, propagating errors.
    async fn try_list_remote_backups(&self) -> Result<Vec<RemoteObject>>;

    /// Delete one archive by file name. Deleting a missing file succeeds.
    async fn delete_remote_backup_by_name(&self, filename: &str) -> Result<DeleteOutcome>;

    /// Provider-native usage, when the provider exposes it.
    async fn provider_storage_usage(&self, _now: i64) -> Result<Option<StorageUsage>> {
        Ok(None)
    }

    /// Advisory listing: errors are logged and yield an empty list.
    async fn list_remote_backups(&self) -> Vec<RemoteObject> {
        match self.try_list_remote_backups().await {
            Ok(objects) => objects,
            Err(e) => {
                error!(destination = %self.id(), error = %e, "Failed to list remote backups");
                Vec::new()
            }
        }
    }

    /// Provider usage if available, otherwise the sum of listed sizes.
    async fn get_storage_usage(&self, now: i64) -> Result<StorageUsage> {
        match self.provider_storage_usage(now).await {
            Ok(Some(usage)) => return Ok(usage),
            Ok(None) => {}
            Err(e) => {
                warn!(destination = %self.id(), error = %e, "Provider usage endpoint failed, estimating from listing");
            }
        }
        let objects = self.try_list_remote_backups().await?;
        Ok(StorageUsage::estimate(&objects, now))
    }

    /// Apply a retention policy to the remote folder, continuing past failures.
    async fn prune_remote_backups(&self, policy: RetentionPolicy, now: i64) -> PruneReport {
        let mut report = PruneReport::default();
        let objects = match self.try_list_remote_backups().await {
            Ok(objects) => objects,
            Err(e) => {
                report.errors.push(format!("list: {e}"));
                return report;
            }
        };
        report.inspected = objects.len();

        let plan = retention::plan(&objects, policy, now);
        for object in plan.delete {
            match self.delete_remote_backup_by_name(&object.name).await {
                Ok(outcome) if outcome.success => {
                    report.deleted += 1;
                    report.deleted_items.push(object.name);
                }
                Ok(outcome) => {
                    warn!(destination = %self.id(), file = %object.name, message = %outcome.message, "Provider refused prune delete");
                    report.errors.push(format!("{}: {}", object.name, outcome.message));
                }
                Err(e) => {
                    warn!(destination = %self.id(), file = %object.name, error = %e, "Failed to prune remote backup");
                    report.errors.push(format!("{}: {e}", object.name));
                }
            }
        }

        info!(
            destination = %self.id(),
            inspected = report.inspected,
            deleted = report.deleted,
            errors = report.errors.len(),
            "Remote retention applied"
        );
        report
    }
}

/// File name component of a local path.
pub fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            crate::OffloadError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not a file path: {}", path.display()),
            ))
        })
}

/// Join a folder/prefix and a file name with exactly one `/`.
pub fn join_remote(prefix: &str, filename: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        filename.to_string()
    } else {
        format!("{prefix}/{filename}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OffloadError;
    use std::sync::Mutex;

    const DAY: i64 = 86_400;
    const NOW: i64 = 1_700_000_000;

    /// Lists a fixed folder; deletes answer by file name.
    struct Folder {
        objects: Vec<RemoteObject>,
        deleted: Mutex<Vec<String>>,
    }

    impl Folder {
        fn aged(days: &[(&str, i64)]) -> Self {
            Self {
                objects: days
                    .iter()
                    .map(|(name, age)| RemoteObject {
                        name: name.to_string(),
                        size_bytes: 1,
                        modified_at: NOW - age * DAY,
                        id: None,
                    })
                    .collect(),
                deleted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Destination for Folder {
        fn id(&self) -> &str {
            "folder"
        }

        fn name(&self) -> &str {
            "Folder"
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn upload(&self, _local_path: &Path, _task_id: &str) -> Result<()> {
            Ok(())
        }

        async fn try_list_remote_backups(&self) -> Result<Vec<RemoteObject>> {
            Ok(self.objects.clone())
        }

        async fn delete_remote_backup_by_name(&self, filename: &str) -> Result<DeleteOutcome> {
            match filename {
                "locked.zip" => Ok(DeleteOutcome::refused("locked.zip is under legal hold")),
                "flaky.zip" => Err(OffloadError::transfer(503, "Service Unavailable")),
                _ => {
                    self.deleted.lock().unwrap().push(filename.to_string());
                    Ok(DeleteOutcome::deleted(filename))
                }
            }
        }
    }

    #[tokio::test]
    async fn test_prune_continues_past_failed_delete() {
        let folder = Folder::aged(&[
            ("new.zip", 1),
            ("old-1.zip", 30),
            ("flaky.zip", 40),
            ("old-2.zip", 50),
        ]);

        let report = folder
            .prune_remote_backups(RetentionPolicy::new(1, 0), NOW)
            .await;

        assert_eq!(report.inspected, 4);
        assert_eq!(report.deleted, 2);
        assert_eq!(report.deleted_items, vec!["old-1.zip", "old-2.zip"]);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("flaky.zip: "));
        assert!(report.is_partial_failure());
        assert_eq!(*folder.deleted.lock().unwrap(), vec!["old-1.zip", "old-2.zip"]);
    }

    #[tokio::test]
    async fn test_prune_counts_refused_delete_as_error() {
        let folder = Folder::aged(&[("new.zip", 1), ("locked.zip", 30), ("old.zip", 40)]);

        let report = folder
            .prune_remote_backups(RetentionPolicy::new(1, 0), NOW)
            .await;

        assert_eq!(report.inspected, 3);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.deleted_items, vec!["old.zip"]);
        assert_eq!(report.errors, vec!["locked.zip: locked.zip is under legal hold".to_string()]);
    }

    #[test]
    fn test_delete_outcome_quota_is_optional_on_the_wire() {
        let plain = serde_json::to_value(DeleteOutcome::deleted("a.zip")).unwrap();
        assert!(plain.get("quota").is_none());

        let usage = StorageUsage::from_provider(10, Some(100), 7);
        let outcome = DeleteOutcome::deleted("a.zip").with_quota(Some(usage.clone()));
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["quota"]["used_bytes"], 10);

        let parsed: DeleteOutcome = serde_json::from_str(r#"{"success":true,"message":"ok"}"#).unwrap();
        assert!(parsed.quota.is_none());
    }

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote("", "a.zip"), "a.zip");
        assert_eq!(join_remote("/site/", "a.zip"), "site/a.zip");
        assert_eq!(join_remote("site/daily", "a.zip"), "site/daily/a.zip");
    }

    #[test]
    fn test_usage_ratio_and_free() {
        let usage = StorageUsage::from_provider(900, Some(1000), 0);
        assert_eq!(usage.free_bytes, Some(100));
        assert_eq!(usage.ratio(), Some(0.9));

        let usage = StorageUsage::from_provider(900, Some(0), 0);
        assert_eq!(usage.ratio(), None);
    }

    #[test]
    fn test_estimate_sums_sizes() {
        let objects = vec![
            RemoteObject { name: "a".into(), size_bytes: 10, modified_at: 0, id: None },
            RemoteObject { name: "b".into(), size_bytes: 32, modified_at: 0, id: None },
        ];
        let usage = StorageUsage::estimate(&objects, 7);
        assert_eq!(usage.used_bytes, 42);
        assert_eq!(usage.source, UsageSource::Estimate);
        assert_eq!(usage.refreshed_at, 7);
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name(Path::new("/tmp/archive.zip")).unwrap(), "archive.zip");
        assert!(file_name(Path::new("/")).is_err());
    }
}
