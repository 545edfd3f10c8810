pub mod activity;
pub mod config;
pub mod gemini;
pub mod ops;
pub mod scan;
pub mod scheduler;
pub mod state;
pub mod tasks;
pub mod verify;

use std::path::Path;

use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use activity::ActivityLog;
use config::{load_or_create_config, resolve_path};
use library::MetadataStore;
use state::AppState;

/// Installs the fmt subscriber plus the activity mirror.
pub fn init_tracing(activity: &ActivityLog) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(activity.layer())
        .init();
}

/// Loads configuration, opens the metadata cache and restores the working set.
pub fn bootstrap(
    config_path: &Path,
    activity: ActivityLog,
) -> Result<AppState, Box<dyn std::error::Error>> {
    let (config, created) = load_or_create_config(config_path)?;
    if created {
        info!("Created default config at {:?}", config_path);
    } else {
        info!("Loaded config from {:?}", config_path);
    }

    let index_path = resolve_path(config_path, config.index_path.trim());
    let store = MetadataStore::open(&index_path)?;
    let state = AppState::new(config_path.to_path_buf(), config, store, activity)?;

    match scan::load_working_set(&state) {
        Ok(count) => info!("Restored {} cached records", count),
        Err(err) => warn!("Failed to restore cached records: {}", err),
    }
    Ok(state)
}
