//! Persistence contract consumed from the host environment.
//!
//! The engine never owns storage. Everything durable (manifest, SLA metrics,
//! usage snapshots, the task lock) goes through a [`HostStore`], and every
//! notion of "now" goes through a [`Clock`] so tests can pin time.

use crate::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// Named JSON blob storage plus one-shot scheduling.
#[async_trait]
pub trait HostStore: Send + Sync {
    /// Read a named blob. `None` when it was never written (or was cleared).
    async fn get_json(&self, name: &str) -> Result<Option<Value>>;

    /// Write a named blob. Writing `Value::Null` clears it.
    async fn set_json(&self, name: &str, value: &Value) -> Result<bool>;

    /// Ask the host to invoke `hook` with `args` at `timestamp` (epoch seconds).
    async fn schedule_once(&self, timestamp: i64, hook: &str, args: Value) -> Result<()>;
}

/// Typed read with a default for missing or null blobs.
pub async fn load_or_default<T>(store: &dyn HostStore, name: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    match store.get_json(name).await? {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => Ok(serde_json::from_value(value)?),
    }
}

/// Typed write.
pub async fn save<T: Serialize + Sync>(store: &dyn HostStore, name: &str, value: &T) -> Result<bool> {
    let value = serde_json::to_value(value)?;
    store.set_json(name, &value).await
}

/// Source of epoch seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug, Default)]
pub struct FixedClock {
    now: AtomicI64,
}

impl FixedClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// A callback the host was asked to fire later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub run_at: i64,
    pub hook: String,
    pub args: Value,
}

/// In-process host used by tests and embedders that bring their own durability.
#[derive(Debug, Default)]
pub struct MemoryHost {
    options: Mutex<HashMap<String, Value>>,
    scheduled: Mutex<Vec<ScheduledEvent>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events requested through `schedule_once`, oldest request first.
    pub fn scheduled(&self) -> Vec<ScheduledEvent> {
        self.scheduled
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    fn poisoned() -> crate::OffloadError {
        crate::OffloadError::Persistence("memory host lock poisoned".into())
    }
}

#[async_trait]
impl HostStore for MemoryHost {
    async fn get_json(&self, name: &str) -> Result<Option<Value>> {
        let options = self.options.lock().map_err(|_| Self::poisoned())?;
        Ok(options.get(name).cloned())
    }

    async fn set_json(&self, name: &str, value: &Value) -> Result<bool> {
        let mut options = self.options.lock().map_err(|_| Self::poisoned())?;
        if value.is_null() {
            options.remove(name);
        } else {
            options.insert(name.to_string(), value.clone());
        }
        Ok(true)
    }

    async fn schedule_once(&self, timestamp: i64, hook: &str, args: Value) -> Result<()> {
        let mut scheduled = self.scheduled.lock().map_err(|_| Self::poisoned())?;
        let event = ScheduledEvent {
            run_at: timestamp,
            hook: hook.to_string(),
            args,
        };
        // One pending event per hook+args, like a single-event scheduler.
        if let Some(existing) = scheduled
            .iter_mut()
            .find(|e| e.hook == event.hook && e.args == event.args)
        {
            existing.run_at = existing.run_at.min(event.run_at);
        } else {
            scheduled.push(event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_host_roundtrip_and_clear() {
        let host = MemoryHost::new();
        assert!(host.get_json("missing").await.unwrap().is_none());

        host.set_json("opt", &json!({"a": 1})).await.unwrap();
        assert_eq!(host.get_json("opt").await.unwrap(), Some(json!({"a": 1})));

        host.set_json("opt", &Value::Null).await.unwrap();
        assert!(host.get_json("opt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_schedule_once_keeps_earliest() {
        let host = MemoryHost::new();
        host.schedule_once(500, "tick", json!({})).await.unwrap();
        host.schedule_once(200, "tick", json!({})).await.unwrap();
        host.schedule_once(900, "other", json!({})).await.unwrap();

        let scheduled = host.scheduled();
        assert_eq!(scheduled.len(), 2);
        assert_eq!(scheduled[0].run_at, 200);
    }

    #[test]
    fn test_fixed_clock() {
        let clock = FixedClock::new(1_000);
        clock.advance(30);
        assert_eq!(clock.now(), 1_030);
        clock.set(5);
        assert_eq!(clock.now(), 5);
    }

    #[tokio::test]
    async fn test_load_or_default() {
        let host = MemoryHost::new();
        let v: Vec<u32> = load_or_default(&host, "nums").await.unwrap();
        assert!(v.is_empty());
        save(&host, "nums", &vec![1u32, 2]).await.unwrap();
        let v: Vec<u32> = load_or_default(&host, "nums").await.unwrap();
        assert_eq!(v, vec![1, 2]);
    }
}
