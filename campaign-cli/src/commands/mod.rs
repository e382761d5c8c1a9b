//! Subcommand implementations.

pub mod alerts;
pub mod config;
pub mod cycle;
pub mod ingest;
pub mod report;
pub mod test;
pub mod watch;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use campaign_engine::{EngineConfig, TursoEventStore};
use tracing::debug;

use crate::config::ConfigLoader;

/// Global options shared by every subcommand.
pub struct Context {
    db: Option<PathBuf>,
    config: Option<PathBuf>,
}

impl Context {
    pub fn new(db: Option<PathBuf>, config: Option<PathBuf>) -> Self {
        Self { db, config }
    }

    /// Merged, validated engine configuration.
    pub fn load_config(&self) -> Result<EngineConfig> {
        ConfigLoader::load(self.config.as_deref())
    }

    /// Explicit config file passed on the command line, if any.
    pub fn config_path(&self) -> Option<&std::path::Path> {
        self.config.as_deref()
    }

    /// Database file from `--db`, else the platform default.
    pub fn db_path(&self) -> Result<PathBuf> {
        match &self.db {
            Some(path) => Ok(path.clone()),
            None => ConfigLoader::default_db_path()
                .ok_or_else(|| anyhow::anyhow!("Could not determine data directory, pass --db")),
        }
    }

    /// Open the event store, creating the database file if needed.
    pub async fn open_store(&self) -> Result<Arc<TursoEventStore>> {
        let path = self.db_path()?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        debug!(path = %path.display(), "opening event store");
        let store = TursoEventStore::new_local(&path)
            .await
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        Ok(Arc::new(store))
    }
}
