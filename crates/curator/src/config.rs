use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_MUSIC_DIR: &str = "/music";
pub const DEFAULT_INDEX_PATH: &str = "metadata.redb";

/// Maintenance jobs known to the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskId {
    DedupeQuality,
    CleanShort,
    ExtractMeta,
    CleanJunk,
}

impl TaskId {
    pub const ALL: [TaskId; 4] = [
        TaskId::DedupeQuality,
        TaskId::CleanShort,
        TaskId::ExtractMeta,
        TaskId::CleanJunk,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskId::DedupeQuality => "dedupe_quality",
            TaskId::CleanShort => "clean_short",
            TaskId::ExtractMeta => "extract_meta",
            TaskId::CleanJunk => "clean_junk",
        }
    }

    pub fn parse(value: &str) -> Option<TaskId> {
        TaskId::ALL
            .into_iter()
            .find(|id| id.as_str() == value.trim())
    }

    fn default_cron(self) -> &'static str {
        match self {
            TaskId::DedupeQuality => "0 2 * * *",
            TaskId::CleanShort => "0 3 * * *",
            TaskId::ExtractMeta => "0 4 * * *",
            TaskId::CleanJunk => "0 5 * * *",
        }
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cron: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_duration: Option<u32>,
    #[serde(default)]
    pub last_run: Option<String>,
}

impl TaskConfig {
    pub fn default_for(id: TaskId) -> Self {
        Self {
            enabled: false,
            cron: id.default_cron().to_string(),
            min_duration: match id {
                TaskId::CleanShort => Some(library::maintenance::DEFAULT_MIN_DURATION_SECS),
                _ => None,
            },
            last_run: None,
        }
    }
}

pub fn default_tasks() -> BTreeMap<String, TaskConfig> {
    TaskId::ALL
        .into_iter()
        .map(|id| (id.as_str().to_string(), TaskConfig::default_for(id)))
        .collect()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub api_key: String,
    pub model_name: String,
    pub proxy_url: String,
    pub music_dir: String,
    pub task_target_path: String,
    pub index_path: String,
    pub scan_batch_size: usize,
    pub cluster_threshold: u8,
    pub verify_batch_size: usize,
    pub verify_delay_ms: u64,
    pub verify_max_group_members: usize,
    pub verify_max_batch_members: usize,
    pub request_timeout_secs: u64,
    pub dedupe_workers: usize,
    pub tasks_config: BTreeMap<String, TaskConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model_name: DEFAULT_MODEL.to_string(),
            proxy_url: String::new(),
            music_dir: DEFAULT_MUSIC_DIR.to_string(),
            task_target_path: String::new(),
            index_path: DEFAULT_INDEX_PATH.to_string(),
            scan_batch_size: library::scanner::DEFAULT_BATCH_SIZE,
            cluster_threshold: library::cluster::DEFAULT_THRESHOLD,
            verify_batch_size: 3,
            verify_delay_ms: 1000,
            verify_max_group_members: 20,
            verify_max_batch_members: 60,
            request_timeout_secs: 60,
            dedupe_workers: library::maintenance::DEFAULT_DEDUPE_WORKERS,
            tasks_config: default_tasks(),
        }
    }
}

impl AppConfig {
    pub fn task(&self, id: TaskId) -> TaskConfig {
        self.tasks_config
            .get(id.as_str())
            .cloned()
            .unwrap_or_else(|| TaskConfig::default_for(id))
    }

    fn normalize(&mut self) {
        let mut tasks = default_tasks();
        for (key, saved) in std::mem::take(&mut self.tasks_config) {
            match TaskId::parse(&key) {
                Some(id) => {
                    tasks.insert(id.as_str().to_string(), saved);
                }
                None => warn!("Ignoring unknown task {:?} in config", key),
            }
        }
        self.tasks_config = tasks;
        if self.model_name.trim().is_empty() {
            self.model_name = DEFAULT_MODEL.to_string();
        }
        if self.music_dir.trim().is_empty() {
            self.music_dir = DEFAULT_MUSIC_DIR.to_string();
        }
        if self.index_path.trim().is_empty() {
            self.index_path = DEFAULT_INDEX_PATH.to_string();
        }
        if self.scan_batch_size == 0 {
            self.scan_batch_size = library::scanner::DEFAULT_BATCH_SIZE;
        }
        if self.verify_batch_size == 0 {
            self.verify_batch_size = 3;
        }
        if self.verify_max_group_members < 2 {
            self.verify_max_group_members = 20;
        }
        if self.verify_max_batch_members == 0 {
            self.verify_max_batch_members = 60;
        }
        if self.dedupe_workers == 0 {
            self.dedupe_workers = library::maintenance::DEFAULT_DEDUPE_WORKERS;
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "io error: {}", err),
            ConfigError::Json(err) => write!(f, "json error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Json(err)
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("CURATOR_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json")),
        Err(_) => PathBuf::from("config.json"),
    }
}

/// Loads the config, writing defaults when the file is missing. The flag reports creation.
pub fn load_or_create_config(path: &Path) -> Result<(AppConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config = match serde_json::from_str::<AppConfig>(&contents) {
            Ok(config) => config,
            Err(err) => {
                warn!("Failed to parse {:?} ({}); using defaults", path, err);
                AppConfig::default()
            }
        };
        config.normalize();
        return Ok((config, false));
    }

    let config = AppConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

/// Writes `config` over the existing JSON object so keys this build does not know survive.
pub fn save_config(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut merged = match fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        },
        Err(_) => serde_json::Map::new(),
    };
    if let Value::Object(fields) = serde_json::to_value(config)? {
        for (key, value) in fields {
            merged.insert(key, value);
        }
    }
    let contents = serde_json::to_string_pretty(&Value::Object(merged))?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}
