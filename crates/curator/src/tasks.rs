use library::maintenance::{self, JobReport};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::activity::timestamp;
use crate::config::{save_config, ConfigError, TaskId};
use crate::state::{AdmissionError, AppState, ScanStatus};

#[derive(Debug)]
pub enum TaskError {
    Busy,
    Admission(AdmissionError),
    Join(tokio::task::JoinError),
    Config(ConfigError),
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::Busy => write!(f, "another maintenance job is running"),
            TaskError::Admission(err) => write!(f, "{}", err),
            TaskError::Join(err) => write!(f, "job panicked: {}", err),
            TaskError::Config(err) => write!(f, "config error: {}", err),
        }
    }
}

impl std::error::Error for TaskError {}

impl From<tokio::task::JoinError> for TaskError {
    fn from(err: tokio::task::JoinError) -> Self {
        TaskError::Join(err)
    }
}

impl From<AdmissionError> for TaskError {
    fn from(err: AdmissionError) -> Self {
        TaskError::Admission(err)
    }
}

impl From<ConfigError> for TaskError {
    fn from(err: ConfigError) -> Self {
        TaskError::Config(err)
    }
}

/// Runs one maintenance job against the task target and records `last_run`.
pub async fn run_task(state: &AppState, id: TaskId) -> Result<JobReport, TaskError> {
    let _permit = state
        .job_gate
        .clone()
        .try_lock_owned()
        .map_err(|_| TaskError::Busy)?;

    let previous = state.scan_state().status;
    state.begin(ScanStatus::Maintaining, &format!("Running {}", id))?;

    let target = state.task_target();
    let (min_duration, workers) = {
        let config = state.config.read();
        let min_duration = config
            .task(TaskId::CleanShort)
            .min_duration
            .unwrap_or(maintenance::DEFAULT_MIN_DURATION_SECS);
        (min_duration, config.dedupe_workers)
    };
    info!("Starting task {} on {:?}", id, target);

    let store = state.store.clone();
    let job_target = target.clone();
    let outcome = tokio::task::spawn_blocking(move || match id {
        TaskId::DedupeQuality => maintenance::dedupe_quality(&job_target, &store, workers),
        TaskId::CleanShort => maintenance::purge_short(&job_target, &store, min_duration),
        TaskId::ExtractMeta => maintenance::materialize(&job_target, &store),
        TaskId::CleanJunk => maintenance::clean_junk(&job_target),
    })
    .await;
    let report = match outcome {
        Ok(report) => report,
        Err(err) => {
            state.finish(ScanStatus::Error, format!("Task {} failed: {}", id, err));
            return Err(err.into());
        }
    };

    state.working.write().prune_paths(&report.deleted);
    state.finish(
        previous,
        format!("Task {} finished: {} deleted", id, report.deleted.len()),
    );

    let snapshot = {
        let mut config = state.config.write();
        let mut task = config.task(id);
        task.last_run = Some(timestamp(OffsetDateTime::now_utc()));
        config.tasks_config.insert(id.as_str().to_string(), task);
        config.clone()
    };
    save_config(&state.config_path, &snapshot)?;

    info!(
        "Task {} finished: {} deleted, {} written, {} failed",
        id,
        report.deleted.len(),
        report.written.len(),
        report.failed.len()
    );
    Ok(report)
}

/// Cron entry point; a run that finds another job active is skipped.
pub async fn run_scheduled(state: AppState, id: TaskId) {
    match run_task(&state, id).await {
        Ok(_) => {}
        Err(TaskError::Busy) => warn!("Skipping scheduled {}: another job is running", id),
        Err(TaskError::Admission(err)) => warn!("Skipping scheduled {}: {}", id, err),
        Err(err) => warn!("Scheduled {} failed: {}", id, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_or_create_config;
    use crate::state::testing::state_in;
    use std::fs;

    #[tokio::test]
    async fn run_stamps_last_run_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let music = state.music_dir();
        fs::create_dir_all(music.join("empty/deeper")).unwrap();
        fs::write(music.join("empty/deeper/cover.jpg"), b"img").unwrap();

        let report = run_task(&state, TaskId::CleanJunk).await.unwrap();
        assert_eq!(report.deleted.len(), 1);
        assert!(!music.join("empty").exists());
        assert!(music.exists());

        let last_run = state.config.read().task(TaskId::CleanJunk).last_run;
        let stamp = last_run.unwrap();
        assert_eq!(stamp.len(), "2024-01-01 00:00:00".len());

        let (saved, _) = load_or_create_config(&state.config_path).unwrap();
        assert_eq!(saved.task(TaskId::CleanJunk).last_run, Some(stamp));
    }

    #[tokio::test]
    async fn second_job_is_rejected_while_gate_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let _held = state.job_gate.clone().try_lock_owned().unwrap();
        let result = run_task(&state, TaskId::ExtractMeta).await;
        assert!(matches!(result, Err(TaskError::Busy)));
    }

    #[tokio::test]
    async fn job_waits_for_running_scan() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let music = state.music_dir();
        fs::create_dir_all(&music).unwrap();
        fs::write(music.join("a.mp3"), vec![0u8; 64]).unwrap();
        fs::write(music.join("a.flac"), vec![0u8; 32]).unwrap();

        state.begin(ScanStatus::Scanning, "scanning").unwrap();
        let result = run_task(&state, TaskId::DedupeQuality).await;
        assert!(matches!(
            result,
            Err(TaskError::Admission(AdmissionError::Busy(ScanStatus::Scanning)))
        ));
        assert!(music.join("a.mp3").exists());
        assert_eq!(state.scan_state().status, ScanStatus::Scanning);
        assert!(state.job_gate.try_lock().is_ok());
    }

    #[tokio::test]
    async fn scan_is_refused_while_job_runs() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        state.begin(ScanStatus::Maintaining, "Running clean_junk").unwrap();
        assert!(matches!(
            crate::scan::start_scan(&state, None),
            Err(AdmissionError::Busy(ScanStatus::Maintaining))
        ));
        state.config.write().api_key = "k3y".to_string();
        assert!(matches!(
            crate::scan::start_analysis(&state),
            Err(AdmissionError::Busy(ScanStatus::Maintaining))
        ));
    }

    #[tokio::test]
    async fn finished_job_restores_previous_status() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        state.begin(ScanStatus::Analyzing, "analyzing").unwrap();
        state.finish(ScanStatus::Done, "analysis done".to_string());

        run_task(&state, TaskId::CleanJunk).await.unwrap();
        let scan = state.scan_state();
        assert_eq!(scan.status, ScanStatus::Done);
        assert!(scan.message.starts_with("Task clean_junk finished"));
    }

    #[tokio::test]
    async fn dedupe_prunes_working_set() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let music = state.music_dir();
        fs::create_dir_all(&music).unwrap();
        fs::write(music.join("a.mp3"), vec![0u8; 64]).unwrap();
        fs::write(music.join("a.flac"), vec![0u8; 32]).unwrap();
        let mp3 = music.join("a.mp3").to_string_lossy().to_string();
        let flac = music.join("a.flac").to_string_lossy().to_string();
        {
            let mut working = state.working.write();
            working.files.push(crate::state::testing::record(&mp3));
            working.files.push(crate::state::testing::record(&flac));
        }

        let report = run_task(&state, TaskId::DedupeQuality).await.unwrap();
        assert_eq!(report.deleted, vec![mp3]);
        let working = state.working.read();
        assert_eq!(working.files.len(), 1);
        assert_eq!(working.files[0].path, flac);
    }
}
