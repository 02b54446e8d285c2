//! SQLite implementation of the engine's persistence contract.

use crate::db::connection::DbPool;
use crate::models::{option, scheduled_event};
use async_trait::async_trait;
use offload_engine::host::HostStore;
use offload_engine::{OffloadError, Result};
use serde_json::Value;

#[derive(Clone)]
pub struct SqliteHost {
    db: DbPool,
}

impl SqliteHost {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Run `f` with a pooled connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut rusqlite::Connection) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.get()?;
            f(&mut *conn)
        })
        .await
        .map_err(|e| OffloadError::Persistence(format!("blocking task failed: {e}")))?
        .map_err(|e| OffloadError::Persistence(format!("{e:#}")))
    }
}

#[async_trait]
impl HostStore for SqliteHost {
    async fn get_json(&self, name: &str) -> Result<Option<Value>> {
        let name = name.to_string();
        self.with_conn(move |conn| option::get(conn, &name)).await
    }

    async fn set_json(&self, name: &str, value: &Value) -> Result<bool> {
        let name = name.to_string();
        let value = value.clone();
        self.with_conn(move |conn| {
            if value.is_null() {
                option::delete(conn, &name)?;
            } else {
                option::set(conn, &name, &value)?;
            }
            Ok(true)
        })
        .await
    }

    async fn schedule_once(&self, timestamp: i64, hook: &str, args: Value) -> Result<()> {
        let hook = hook.to_string();
        self.with_conn(move |conn| scheduled_event::schedule(conn, timestamp, &hook, &args))
            .await?;
        tracing::debug!(run_at = timestamp, "Scheduled event stored");
        Ok(())
    }
}
