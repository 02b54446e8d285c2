use crate::config::AppConfig;
use crate::db::connection::DbPool;
use crate::host::SqliteHost;
use offload_engine::destinations::DestinationContext;
use offload_engine::transfer::http::HttpTransport;
use offload_engine::transfer::usage::UsageMonitor;
use offload_engine::{BroadcastSink, Clock, Config, DestinationRegistry, PurgeWorker, SystemClock};
use std::sync::Arc;

pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    pub engine: Config,
    pub clock: Arc<dyn Clock>,
    pub events: BroadcastSink,
    pub registry: Arc<DestinationRegistry>,
    pub worker: Arc<PurgeWorker>,
    pub usage: UsageMonitor,
}

impl AppState {
    pub fn new(db: DbPool, config: AppConfig, engine: Config) -> anyhow::Result<Self> {
        let host = Arc::new(SqliteHost::new(db.clone()));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let events = BroadcastSink::new();

        let ctx = DestinationContext {
            http: HttpTransport::new(&engine.transfer, clock.clone())?,
            transfer: engine.transfer.clone(),
        };
        let registry = Arc::new(DestinationRegistry::from_config(&engine, &ctx)?);

        let worker = Arc::new(PurgeWorker::new(
            host.clone(),
            registry.clone(),
            clock.clone(),
            Arc::new(events.clone()),
            &engine.purge,
        ));
        let usage = UsageMonitor::new(host.clone(), Arc::new(events.clone()), &engine.transfer);

        Ok(Self {
            db,
            config,
            engine,
            clock,
            events,
            registry,
            worker,
            usage,
        })
    }
}
