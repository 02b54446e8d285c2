//! Destination registry: id → constructed destination.
//!
//! Built from the configured destination tables. Overrides substitute a
//! destination (tests, extensions), `disable` hides one, and an optional
//! filter gets the final say on every resolution.

use crate::config::Config;
use crate::destinations::{build_destination, DestinationContext};
use crate::transfer::Destination;
use crate::{OffloadError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tracing::warn;

type Filter = Arc<dyn Fn(&str, Arc<dyn Destination>) -> Option<Arc<dyn Destination>> + Send + Sync>;

#[derive(Default)]
pub struct DestinationRegistry {
    built: BTreeMap<String, Arc<dyn Destination>>,
    overrides: RwLock<BTreeMap<String, Arc<dyn Destination>>>,
    disabled: RwLock<BTreeSet<String>>,
    filter: RwLock<Option<Filter>>,
}

impl std::fmt::Debug for DestinationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationRegistry")
            .field("ids", &self.ids())
            .finish_non_exhaustive()
    }
}

impl DestinationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One destination per `[destinations.<id>]` table.
    pub fn from_config(config: &Config, ctx: &DestinationContext) -> Result<Self> {
        let mut registry = Self::new();
        for (id, dest_config) in &config.destinations {
            let destination = build_destination(id, dest_config, ctx)?;
            registry.built.insert(id.clone(), destination);
        }
        Ok(registry)
    }

    /// Register or replace the destination served for `id`.
    pub fn override_with(&self, id: &str, destination: Arc<dyn Destination>) {
        if let Ok(mut overrides) = self.overrides.write() {
            overrides.insert(id.to_string(), destination);
        }
        if let Ok(mut disabled) = self.disabled.write() {
            disabled.remove(id);
        }
    }

    pub fn disable(&self, id: &str) {
        if let Ok(mut disabled) = self.disabled.write() {
            disabled.insert(id.to_string());
        }
    }

    /// Install a hook that may swap or drop (`None`) any resolved destination.
    pub fn set_filter<F>(&self, filter: F)
    where
        F: Fn(&str, Arc<dyn Destination>) -> Option<Arc<dyn Destination>> + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.filter.write() {
            *slot = Some(Arc::new(filter));
        }
    }

    pub fn resolve(&self, id: &str) -> Result<Arc<dyn Destination>> {
        let not_found = || OffloadError::NotFound(id.to_string());

        if self.disabled.read().map(|d| d.contains(id)).unwrap_or(false) {
            return Err(not_found());
        }

        let overridden = self.overrides.read().ok().and_then(|o| o.get(id).cloned());
        let destination = overridden
            .or_else(|| self.built.get(id).cloned())
            .ok_or_else(not_found)?;

        let filter = self.filter.read().ok().and_then(|f| f.clone());
        match filter {
            Some(filter) => filter(id, destination).ok_or_else(|| {
                warn!(destination = %id, "Destination removed by registry filter");
                not_found()
            }),
            None => Ok(destination),
        }
    }

    /// Every id that currently resolves.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: BTreeSet<String> = self.built.keys().cloned().collect();
        if let Ok(overrides) = self.overrides.read() {
            ids.extend(overrides.keys().cloned());
        }
        ids.into_iter().filter(|id| self.resolve(id).is_ok()).collect()
    }

    pub fn connected_ids(&self) -> Vec<String> {
        self.ids()
            .into_iter()
            .filter(|id| self.resolve(id).map(|d| d.is_connected()).unwrap_or(false))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::SystemClock;
    use crate::transfer::http::HttpTransport;
    use crate::transfer::{DeleteOutcome, RemoteObject};
    use async_trait::async_trait;
    use std::path::Path;

    struct Stub(&'static str, bool);

    #[async_trait]
    impl Destination for Stub {
        fn id(&self) -> &str {
            self.0
        }
        fn name(&self) -> &str {
            "Stub"
        }
        fn is_connected(&self) -> bool {
            self.1
        }
        async fn upload(&self, _local_path: &Path, _task_id: &str) -> Result<()> {
            Ok(())
        }
        async fn try_list_remote_backups(&self) -> Result<Vec<RemoteObject>> {
            Ok(Vec::new())
        }
        async fn delete_remote_backup_by_name(&self, filename: &str) -> Result<DeleteOutcome> {
            Ok(DeleteOutcome::deleted(filename))
        }
    }

    fn configured() -> DestinationRegistry {
        let config = Config::from_toml(
            r#"
            [destinations.aws_s3]
            provider = "s3"
            access_key = "a"
            secret_key = "b"
            bucket = "c"

            [destinations.dropbox]
            provider = "dropbox"
            "#,
        )
        .unwrap();
        let ctx = DestinationContext {
            http: HttpTransport::new(&config.transfer, Arc::new(SystemClock)).unwrap(),
            transfer: config.transfer.clone(),
        };
        DestinationRegistry::from_config(&config, &ctx).unwrap()
    }

    #[test]
    fn test_resolve_and_unknown_id() {
        let registry = configured();
        assert_eq!(registry.resolve("aws_s3").unwrap().id(), "aws_s3");
        assert!(matches!(registry.resolve("nope"), Err(OffloadError::NotFound(_))));
        assert_eq!(registry.ids(), vec!["aws_s3", "dropbox"]);
        assert_eq!(registry.connected_ids(), vec!["aws_s3"]);
    }

    #[test]
    fn test_override_and_disable() {
        let registry = configured();
        registry.override_with("aws_s3", Arc::new(Stub("fake", true)));
        assert_eq!(registry.resolve("aws_s3").unwrap().id(), "fake");

        registry.disable("aws_s3");
        assert!(registry.resolve("aws_s3").is_err());

        registry.override_with("custom", Arc::new(Stub("custom", false)));
        assert!(registry.ids().contains(&"custom".to_string()));
    }

    #[test]
    fn test_filter_can_drop() {
        let registry = configured();
        registry.set_filter(|id, dest| (id != "dropbox").then_some(dest));
        assert!(registry.resolve("aws_s3").is_ok());
        assert!(matches!(registry.resolve("dropbox"), Err(OffloadError::NotFound(_))));
    }
}
