pub mod data;
pub mod engine;
pub mod errors;
pub mod models;
pub mod query;
pub mod utils;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::data::calendar::TradingCalendar;
use crate::data::provider::{CalendarSource, DataProvider};
use crate::engine::coordinator::UpdateCoordinator;
use crate::errors::AppError;
use crate::models::config::AppConfig;
use crate::query::QueryExporter;

const DATABASE_FILE: &str = "trendsight.db";

/// Shared handles for one open cache.
pub struct AppState {
    pub db: Arc<Mutex<Connection>>,
    pub calendar: Arc<TradingCalendar>,
    pub config: AppConfig,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Open (or create) the cache described by `config` and load the trading calendar.
    ///
    /// The default data directory is only resolved when no database path is configured.
    pub fn open(config: AppConfig) -> Result<Self, AppError> {
        config.validate()?;
        let (data_dir, db_path) = match &config.database_path {
            Some(path) => (
                path.parent().map(Path::to_path_buf).unwrap_or_default(),
                path.clone(),
            ),
            None => {
                let dir = get_data_dir();
                let path = dir.join(DATABASE_FILE);
                (dir, path)
            }
        };

        let conn = data::storage::initialize_database(&db_path)?;
        let calendar = TradingCalendar::load(&conn)?;
        info!(
            "Cache ready at {} ({} known trading dates)",
            db_path.display(),
            calendar.len()
        );

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            calendar: Arc::new(calendar),
            config,
            data_dir,
        })
    }

    /// Open the cache configured through `TRENDSIGHT_CONFIG` / `TRENDSIGHT_DB`.
    pub fn from_env() -> Result<Self, AppError> {
        Self::open(AppConfig::from_env()?)
    }

    pub fn coordinator(
        &self,
        provider: Arc<dyn DataProvider>,
        calendar_source: Arc<dyn CalendarSource>,
    ) -> UpdateCoordinator {
        UpdateCoordinator::new(
            self.db.clone(),
            self.calendar.clone(),
            provider,
            calendar_source,
            self.config.clone(),
        )
    }

    pub fn exporter(&self) -> QueryExporter {
        QueryExporter::new(self.db.clone(), self.config.session_prefixes.clone())
    }
}

/// Install the fmt subscriber. `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

/// Resolve the data directory and ensure it exists.
fn get_data_dir() -> PathBuf {
    let dir = resolve_data_path().unwrap_or_else(|| PathBuf::from("./data"));
    fs::create_dir_all(&dir).ok();
    dir
}

/// `TRENDSIGHT_DATA_DIR`, else a `data` directory beside the executable.
fn resolve_data_path() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("TRENDSIGHT_DATA_DIR") {
        return Some(PathBuf::from(dir));
    }
    let exe = std::env::current_exe().ok()?;
    Some(exe.parent()?.join("data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_creates_schema_and_shares_connection() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::standard();
        config.database_path = Some(dir.path().join("nested").join("cache.db"));

        let state = AppState::open(config).unwrap();
        assert!(dir.path().join("nested").join("cache.db").exists());
        assert_eq!(state.data_dir, dir.path().join("nested"));
        assert!(state.calendar.is_empty());

        let status = state.exporter().cache_status().await.unwrap();
        assert_eq!(status.price_bars, 0);
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let mut config = AppConfig::standard();
        config.indicators.rsi_period = 0;
        assert!(matches!(AppState::open(config), Err(AppError::InvalidConfig(_))));
    }
}
