//! Backup manifest persisted through the host store.
//!
//! All mutation goes through [`ManifestStore::update`]: load, change in
//! memory, save once.

use crate::host::{self, HostStore};
use crate::purge::queue::{QueueEntry, QueueStatus};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

pub const MANIFEST_OPTION: &str = "offload_backup_manifest";
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FullBackup {
    pub file: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncrementalBackup {
    pub file: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub timestamp: i64,
    /// Full archive this increment builds on
    #[serde(default)]
    pub base: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub full_backup: Option<FullBackup>,
    #[serde(default)]
    pub incremental_backups: Vec<IncrementalBackup>,
    /// Relative path → content hash
    #[serde(default)]
    pub file_hashes: BTreeMap<String, String>,
    /// Table name → checksum
    #[serde(default)]
    pub database_checksums: BTreeMap<String, String>,
    #[serde(default)]
    pub remote_purge_queue: Vec<QueueEntry>,
    #[serde(default)]
    pub last_scan: i64,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    MANIFEST_VERSION
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            full_backup: None,
            incremental_backups: Vec::new(),
            file_hashes: BTreeMap::new(),
            database_checksums: BTreeMap::new(),
            remote_purge_queue: Vec::new(),
            last_scan: 0,
            version: MANIFEST_VERSION,
        }
    }
}

impl Manifest {
    pub fn queue_entry(&self, file: &str) -> Option<&QueueEntry> {
        self.remote_purge_queue.iter().find(|e| e.file == file)
    }

    pub fn queue_entry_mut(&mut self, file: &str) -> Option<&mut QueueEntry> {
        self.remote_purge_queue.iter_mut().find(|e| e.file == file)
    }

    /// Queue `file` for removal from `destinations`, merging into an existing entry.
    /// Returns `true` when a new entry was created.
    pub fn register_purge(&mut self, file: &str, destinations: &[String], now: i64) -> bool {
        if let Some(entry) = self.queue_entry_mut(file) {
            entry.merge_destinations(destinations);
            return false;
        }
        let entry = QueueEntry::new(file, destinations, now);
        if entry.destinations.is_empty() {
            return false;
        }
        self.remote_purge_queue.push(entry);
        true
    }

    /// Drop the entry for `file`. Returns whether one existed.
    pub fn remove_entry(&mut self, file: &str) -> bool {
        let before = self.remote_purge_queue.len();
        self.remote_purge_queue.retain(|e| e.file != file);
        before != self.remote_purge_queue.len()
    }

    /// Fold the entries a purge pass worked on back into this (freshly loaded)
    /// manifest, matched by file.
    ///
    /// Entries registered while the pass was running are left alone, and
    /// destinations merged into a processed entry meanwhile survive: a
    /// completed entry keeps them as a new pending entry, any other outcome
    /// carries them forward. An entry that vanished is not brought back.
    pub fn apply_attempts(&mut self, attempted: Vec<QueueEntry>) {
        for outcome in attempted {
            let Some(index) = self.remote_purge_queue.iter().position(|e| e.file == outcome.file) else {
                debug!(file = %outcome.file, "Purge entry removed during pass, dropping outcome");
                continue;
            };
            let current = &mut self.remote_purge_queue[index];
            let added: Vec<String> = current
                .destinations
                .iter()
                .filter(|d| !outcome.destinations.contains(d))
                .cloned()
                .collect();

            if outcome.status == QueueStatus::Completed {
                if added.is_empty() {
                    self.remote_purge_queue.remove(index);
                } else {
                    current.destinations = added;
                    current.reset(outcome.last_attempt_at);
                }
                continue;
            }

            let mut next = outcome;
            next.merge_destinations(&added);
            *current = next;
        }
    }

    /// Record a new full backup. The superseded archive, if any, is returned
    /// along with the incrementals that depended on it.
    pub fn replace_full_backup(&mut self, backup: FullBackup) -> Vec<String> {
        let mut superseded = Vec::new();
        if let Some(previous) = self.full_backup.take() {
            if previous.file != backup.file {
                superseded.push(previous.file);
            }
        }
        superseded.extend(self.incremental_backups.drain(..).map(|i| i.file));
        self.full_backup = Some(backup);
        superseded
    }
}

pub struct ManifestStore {
    store: Arc<dyn HostStore>,
}

impl ManifestStore {
    pub fn new(store: Arc<dyn HostStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self) -> Result<Manifest> {
        let mut manifest: Manifest = host::load_or_default(self.store.as_ref(), MANIFEST_OPTION).await?;
        if manifest.version < MANIFEST_VERSION {
            debug!(from = manifest.version, to = MANIFEST_VERSION, "Upgrading manifest version");
            manifest.version = MANIFEST_VERSION;
        }
        Ok(manifest)
    }

    pub async fn save(&self, manifest: &Manifest) -> Result<bool> {
        host::save(self.store.as_ref(), MANIFEST_OPTION, manifest).await
    }

    /// Load, apply `mutate`, save. The closure's result is handed back.
    pub async fn update<F, T>(&self, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut Manifest) -> T + Send,
        T: Send,
    {
        let mut manifest = self.load().await?;
        let out = mutate(&mut manifest);
        self.save(&manifest).await?;
        Ok(out)
    }

    pub async fn register_purge(&self, file: &str, destinations: &[String], now: i64) -> Result<bool> {
        let created = self
            .update(|m| m.register_purge(file, destinations, now))
            .await?;
        info!(file = %file, destinations = ?destinations, created, "Registered remote purge");
        Ok(created)
    }

    /// Store `backup` as the current full backup and queue every archive it
    /// supersedes for removal from `destinations`.
    pub async fn record_full_backup(
        &self,
        backup: FullBackup,
        destinations: &[String],
        now: i64,
    ) -> Result<Vec<String>> {
        let superseded = self
            .update(|m| {
                let superseded = m.replace_full_backup(backup);
                for file in &superseded {
                    m.register_purge(file, destinations, now);
                }
                superseded
            })
            .await?;
        if !superseded.is_empty() {
            info!(superseded = ?superseded, "Queued superseded archives for remote purge");
        }
        Ok(superseded)
    }
}
