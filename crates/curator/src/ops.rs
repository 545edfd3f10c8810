use std::path::{Component, Path};

use common::FileRecord;
use library::edit::{self, DeleteReport};
use metadata::TagWrite;
use tokio_cron_scheduler::JobSchedulerError;
use tracing::{info, warn};

use crate::config::{save_config, AppConfig, ConfigError};
use crate::gemini::{GeminiClient, SuggestedTags};
use crate::scheduler;
use crate::state::AppState;
use crate::verify::VerifyError;

#[derive(Debug)]
pub enum OpsError {
    OutsideLibrary(String),
    NotFound(String),
    Verify(VerifyError),
    Join(tokio::task::JoinError),
    Config(ConfigError),
    Client(reqwest::Error),
    Scheduler(JobSchedulerError),
}

impl std::fmt::Display for OpsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpsError::OutsideLibrary(path) => write!(f, "{} is outside the music directory", path),
            OpsError::NotFound(path) => write!(f, "{} not found", path),
            OpsError::Verify(err) => write!(f, "{}", err),
            OpsError::Join(err) => write!(f, "worker failed: {}", err),
            OpsError::Config(err) => write!(f, "{}", err),
            OpsError::Client(err) => write!(f, "http client error: {}", err),
            OpsError::Scheduler(err) => write!(f, "scheduler error: {}", err),
        }
    }
}

impl std::error::Error for OpsError {}

impl From<VerifyError> for OpsError {
    fn from(err: VerifyError) -> Self {
        OpsError::Verify(err)
    }
}

impl From<tokio::task::JoinError> for OpsError {
    fn from(err: tokio::task::JoinError) -> Self {
        OpsError::Join(err)
    }
}

impl From<ConfigError> for OpsError {
    fn from(err: ConfigError) -> Self {
        OpsError::Config(err)
    }
}

impl From<reqwest::Error> for OpsError {
    fn from(err: reqwest::Error) -> Self {
        OpsError::Client(err)
    }
}

impl From<JobSchedulerError> for OpsError {
    fn from(err: JobSchedulerError) -> Self {
        OpsError::Scheduler(err)
    }
}

/// True when `path` sits below `root` without climbing out through `..`.
pub fn is_within(root: &Path, path: &Path) -> bool {
    path.is_absolute()
        && !path.components().any(|c| matches!(c, Component::ParentDir))
        && path.starts_with(root)
}

/// Deletes files inside the music directory; anything else is reported as failed.
pub async fn delete_files(state: &AppState, paths: Vec<String>) -> Result<DeleteReport, OpsError> {
    let root = state.music_dir();
    let (allowed, refused): (Vec<String>, Vec<String>) = paths
        .into_iter()
        .partition(|p| is_within(&root, Path::new(p)));
    for path in &refused {
        warn!("Refusing to delete {} outside {:?}", path, root);
    }

    let store = state.store.clone();
    let mut report = tokio::task::spawn_blocking(move || edit::delete_files(&store, &allowed)).await?;
    state.working.write().prune_paths(&report.deleted);
    report.failed.extend(refused);
    Ok(report)
}

pub async fn rename_files(
    state: &AppState,
    paths: Vec<String>,
    pattern: String,
) -> Result<Vec<(String, FileRecord)>, OpsError> {
    let store = state.store.clone();
    let renamed =
        tokio::task::spawn_blocking(move || edit::rename_files(&store, &paths, &pattern)).await?;
    {
        let mut working = state.working.write();
        for (old_path, record) in &renamed {
            working.apply_rename(old_path, record);
        }
    }
    info!("Renamed {} files", renamed.len());
    Ok(renamed)
}

pub async fn update_tags(
    state: &AppState,
    paths: Vec<String>,
    update: TagWrite,
) -> Result<Vec<FileRecord>, OpsError> {
    let store = state.store.clone();
    let updated =
        tokio::task::spawn_blocking(move || edit::update_tags(&store, &paths, &update)).await?;
    state.working.write().replace_records(&updated);
    Ok(updated)
}

/// Asks the model for corrected tags and writes them to `path`.
pub async fn fix_metadata_with_ai(state: &AppState, path: String) -> Result<SuggestedTags, OpsError> {
    let file = Path::new(&path);
    if !file.exists() {
        return Err(OpsError::NotFound(path));
    }
    let (api_key, model) = {
        let config = state.config.read();
        (config.api_key.clone(), config.model_name.clone())
    };
    let client = GeminiClient::new(state.client(), &api_key, &model)?;

    let probe = file.to_path_buf();
    let record = tokio::task::spawn_blocking(move || library::extract(&probe)).await?;
    let suggested = client.suggest_tags(&record).await?;
    info!("Model suggested tags for {}: {:?}", path, suggested);

    let update = TagWrite {
        artist: suggested.artist.clone(),
        album_artist: suggested.album_artist.clone(),
        title: suggested.title.clone(),
        album: suggested.album.clone(),
    };
    update_tags(state, vec![path], update).await?;
    Ok(suggested)
}

/// Persists a new configuration, then rebuilds the HTTP client and cron triggers.
pub async fn update_config(state: &AppState, config: AppConfig) -> Result<(), OpsError> {
    save_config(&state.config_path, &config)?;
    *state.config.write() = config;
    state.refresh_client()?;
    scheduler::reconcile_state(state).await?;
    info!("Configuration saved to {:?}", state.config_path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::{record, state_in};
    use std::fs;

    #[test]
    fn containment_rejects_escapes() {
        let root = Path::new("/music");
        assert!(is_within(root, Path::new("/music/a/b.mp3")));
        assert!(!is_within(root, Path::new("/musicx/b.mp3")));
        assert!(!is_within(root, Path::new("/music/../etc/passwd")));
        assert!(!is_within(root, Path::new("music/a.mp3")));
    }

    #[tokio::test]
    async fn delete_refuses_paths_outside_music_dir() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let music = state.music_dir();
        fs::create_dir_all(&music).unwrap();
        let inside = music.join("a.mp3");
        let outside = dir.path().join("keep.mp3");
        fs::write(&inside, b"x").unwrap();
        fs::write(&outside, b"x").unwrap();
        let inside = inside.to_string_lossy().to_string();
        let outside_path = outside.to_string_lossy().to_string();
        state.working.write().files.push(record(&inside));

        let report = delete_files(&state, vec![inside.clone(), outside_path.clone()])
            .await
            .unwrap();
        assert_eq!(report.deleted, vec![inside]);
        assert_eq!(report.failed, vec![outside_path]);
        assert!(outside.exists());
        assert!(state.working.read().files.is_empty());
    }

    #[tokio::test]
    async fn rename_updates_working_set() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let music = state.music_dir();
        fs::create_dir_all(&music).unwrap();
        let old = music.join("Artist - Song.mp3");
        fs::write(&old, b"x").unwrap();
        let old_path = old.to_string_lossy().to_string();
        state.working.write().files.push(record(&old_path));

        let renamed = rename_files(&state, vec![old_path.clone()], "{title}".to_string())
            .await
            .unwrap();
        assert_eq!(renamed.len(), 1);
        let working = state.working.read();
        assert_eq!(working.files.len(), 1);
        assert_eq!(working.files[0].filename, "Song.mp3");
    }

    #[tokio::test]
    async fn ai_fix_requires_existing_file_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let missing = fix_metadata_with_ai(&state, "/nope/x.mp3".to_string()).await;
        assert!(matches!(missing, Err(OpsError::NotFound(_))));

        let file = dir.path().join("x.mp3");
        fs::write(&file, b"x").unwrap();
        let no_key = fix_metadata_with_ai(&state, file.to_string_lossy().to_string()).await;
        assert!(matches!(no_key, Err(OpsError::Verify(VerifyError::MissingApiKey))));
    }
}
