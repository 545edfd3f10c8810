use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::{CandidateGroup, ConfirmedDuplicate, FileRecord};
use library::MetadataStore;
use parking_lot::RwLock;
use reqwest::{Client, Proxy};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;

use crate::activity::ActivityLog;
use crate::config::{resolve_path, AppConfig};
use crate::scheduler::TaskScheduler;

/// Shared process context. Cloning is cheap; every field is reference counted.
#[derive(Clone)]
pub struct AppState {
    pub config_path: PathBuf,
    pub config: Arc<RwLock<AppConfig>>,
    pub store: MetadataStore,
    pub scan: Arc<RwLock<ScanState>>,
    pub working: Arc<RwLock<WorkingSet>>,
    pub activity: ActivityLog,
    pub http: Arc<RwLock<Client>>,
    pub scheduler: Arc<AsyncMutex<Option<TaskScheduler>>>,
    pub job_gate: Arc<AsyncMutex<()>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Idle,
    Scanning,
    Analyzing,
    Maintaining,
    Done,
    Error,
}

impl ScanStatus {
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            ScanStatus::Scanning | ScanStatus::Analyzing | ScanStatus::Maintaining
        )
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ScanState {
    pub status: ScanStatus,
    pub progress: usize,
    pub total: usize,
    pub message: String,
}

impl Default for ScanState {
    fn default() -> Self {
        Self {
            status: ScanStatus::Idle,
            progress: 0,
            total: 0,
            message: String::new(),
        }
    }
}

/// Records of the current library view plus the products of the last analysis.
#[derive(Clone, Debug, Default)]
pub struct WorkingSet {
    pub files: Vec<FileRecord>,
    pub candidates: Vec<CandidateGroup>,
    pub results: Vec<ConfirmedDuplicate>,
}

impl WorkingSet {
    pub fn prune_under(&mut self, root: &Path) {
        self.files.retain(|f| !Path::new(&f.path).starts_with(root));
    }

    /// Drops deleted paths from files and candidates; groups left with one member vanish.
    pub fn prune_paths(&mut self, paths: &[String]) {
        if paths.is_empty() {
            return;
        }
        let gone: HashSet<&str> = paths.iter().map(String::as_str).collect();
        self.files.retain(|f| !gone.contains(f.path.as_str()));
        for group in &mut self.candidates {
            group.files.retain(|f| !gone.contains(f.path.as_str()));
        }
        self.candidates.retain(|group| group.len() > 1);
    }

    pub fn replace_records(&mut self, records: &[FileRecord]) {
        for record in records {
            match self.files.iter_mut().find(|f| f.path == record.path) {
                Some(existing) => *existing = record.clone(),
                None => self.files.push(record.clone()),
            }
        }
    }

    pub fn apply_rename(&mut self, old_path: &str, record: &FileRecord) {
        match self.files.iter_mut().find(|f| f.path == old_path) {
            Some(existing) => *existing = record.clone(),
            None => self.files.push(record.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    Busy(ScanStatus),
    MissingApiKey,
}

impl std::fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionError::Busy(status) => write!(f, "busy: {:?} in progress", status),
            AdmissionError::MissingApiKey => write!(f, "api key not configured"),
        }
    }
}

impl std::error::Error for AdmissionError {}

impl AppState {
    pub fn new(
        config_path: PathBuf,
        config: AppConfig,
        store: MetadataStore,
        activity: ActivityLog,
    ) -> Result<Self, reqwest::Error> {
        let http = build_client(&config)?;
        Ok(Self {
            config_path,
            config: Arc::new(RwLock::new(config)),
            store,
            scan: Arc::new(RwLock::new(ScanState::default())),
            working: Arc::new(RwLock::new(WorkingSet::default())),
            activity,
            http: Arc::new(RwLock::new(http)),
            scheduler: Arc::new(AsyncMutex::new(None)),
            job_gate: Arc::new(AsyncMutex::new(())),
        })
    }

    /// Claims the scan slot for `status`, rejecting while another scan or analysis runs.
    pub fn begin(&self, status: ScanStatus, message: &str) -> Result<(), AdmissionError> {
        let mut guard = self.scan.write();
        if guard.status.is_busy() {
            return Err(AdmissionError::Busy(guard.status));
        }
        *guard = ScanState {
            status,
            progress: 0,
            total: 0,
            message: message.to_string(),
        };
        Ok(())
    }

    pub fn finish(&self, status: ScanStatus, message: String) {
        let mut guard = self.scan.write();
        guard.status = status;
        guard.message = message;
    }

    pub fn set_progress(&self, progress: usize, total: usize, message: String) {
        let mut guard = self.scan.write();
        guard.progress = progress;
        guard.total = total;
        guard.message = message;
    }

    pub fn scan_state(&self) -> ScanState {
        self.scan.read().clone()
    }

    pub fn client(&self) -> Client {
        self.http.read().clone()
    }

    pub fn music_dir(&self) -> PathBuf {
        let config = self.config.read();
        resolve_path(&self.config_path, config.music_dir.trim())
    }

    /// `task_target_path` when it exists on disk, otherwise the music directory.
    pub fn task_target(&self) -> PathBuf {
        let target = self.config.read().task_target_path.trim().to_string();
        if !target.is_empty() {
            let path = resolve_path(&self.config_path, &target);
            if path.exists() {
                return path;
            }
        }
        self.music_dir()
    }

    pub fn refresh_client(&self) -> Result<(), reqwest::Error> {
        let client = build_client(&self.config.read())?;
        *self.http.write() = client;
        Ok(())
    }
}

pub fn build_client(config: &AppConfig) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder()
        .user_agent("music-curator/0.1")
        .timeout(Duration::from_secs(config.request_timeout_secs.max(1)));
    let proxy = config.proxy_url.trim();
    if !proxy.is_empty() {
        builder = builder.proxy(Proxy::all(proxy)?);
    }
    builder.build()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn state_in(dir: &Path) -> AppState {
        let config_path = dir.join("config.json");
        let config = AppConfig {
            music_dir: dir.join("music").to_string_lossy().to_string(),
            ..AppConfig::default()
        };
        let store = MetadataStore::open(&dir.join("metadata.redb")).unwrap();
        AppState::new(config_path, config, store, ActivityLog::default()).unwrap()
    }

    pub fn record(path: &str) -> FileRecord {
        let mut record = FileRecord {
            path: path.to_string(),
            filename: common::file_name(Path::new(path)),
            ..FileRecord::default()
        };
        record.refresh_search_text();
        record
    }
}
