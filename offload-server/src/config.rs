use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    /// TOML file with the engine's `[transfer]`, `[purge]` and `[destinations.*]` tables
    pub config_path: PathBuf,
    pub log_level: Option<String>,
    pub dispatch_interval_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".into()));

        Self {
            db_path: std::env::var("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("offload.db")),
            config_path: std::env::var("CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("offload.toml")),
            data_dir,
            log_level: std::env::var("LOG_LEVEL").ok(),
            dispatch_interval_secs: std::env::var("DISPATCH_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }
}
