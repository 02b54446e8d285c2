//! Cached storage usage snapshots and quota warnings.

use super::{Destination, StorageUsage};
use crate::config::TransferConfig;
use crate::events::{EventSink, OffloadEvent};
use crate::host::{self, HostStore};
use crate::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Host option holding the per-destination snapshots.
pub const USAGE_OPTION: &str = "offload_storage_usage";

type UsageCache = BTreeMap<String, StorageUsage>;

pub struct UsageMonitor {
    store: Arc<dyn HostStore>,
    events: Arc<dyn EventSink>,
    ttl_secs: i64,
    warning_ratio: f64,
}

impl UsageMonitor {
    pub fn new(store: Arc<dyn HostStore>, events: Arc<dyn EventSink>, config: &TransferConfig) -> Self {
        Self {
            store,
            events,
            ttl_secs: config.usage_cache_ttl_secs,
            warning_ratio: config.usage_warning_ratio,
        }
    }

    /// Usage for `destination`, served from cache while it is younger than the TTL.
    pub async fn usage(&self, destination: &dyn Destination, now: i64, force_refresh: bool) -> Result<StorageUsage> {
        let mut cache: UsageCache = host::load_or_default(self.store.as_ref(), USAGE_OPTION).await?;

        if !force_refresh {
            if let Some(cached) = cache.get(destination.id()) {
                if now - cached.refreshed_at < self.ttl_secs {
                    debug!(destination = %destination.id(), "Using cached storage usage");
                    return Ok(cached.clone());
                }
            }
        }

        let fresh = destination.get_storage_usage(now).await?;
        self.check_warning(destination.id(), &fresh);
        cache.insert(destination.id().to_string(), fresh.clone());
        host::save(self.store.as_ref(), USAGE_OPTION, &cache).await?;
        Ok(fresh)
    }

    pub async fn cached(&self, destination_id: &str) -> Result<Option<StorageUsage>> {
        let cache: UsageCache = host::load_or_default(self.store.as_ref(), USAGE_OPTION).await?;
        Ok(cache.get(destination_id).cloned())
    }

    fn check_warning(&self, destination_id: &str, usage: &StorageUsage) {
        let (Some(ratio), Some(quota)) = (usage.ratio(), usage.quota_bytes) else {
            return;
        };
        if ratio >= self.warning_ratio {
            warn!(destination = %destination_id, ratio, used = usage.used_bytes, quota, "Remote storage nearly full");
            self.events.emit(OffloadEvent::StorageUsageWarning {
                destination_id: destination_id.to_string(),
                ratio,
                used_bytes: usage.used_bytes,
                quota_bytes: quota,
            });
        }
    }
}
