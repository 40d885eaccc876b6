//! Runtime settings: compiled defaults, overridden by a TOML file, overridden by the
//! command line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::services::policy_service::PolicyThresholds;

const APP_NAME: &str = "stager";
const CONFIG_FILE_NAME: &str = "config.toml";
const DB_FILE_NAME: &str = "stager.db";
const QUARANTINE_DIR_NAME: &str = "quarantine";

pub const DEFAULT_MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_WORKER_COUNT: usize = 4;
pub const DEFAULT_CLASSIFY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_RETENTION_DAYS: i64 = 30;
pub const DEFAULT_RECOVERY_GRACE_SECS: i64 = 300;
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_SCAN_MAX_DEPTH: usize = 5;
pub const DEFAULT_MAX_BIAS: f64 = 0.05;
pub const DEFAULT_BIAS_MIN_SAMPLES: u64 = 10;
pub const DEFAULT_STATS_CHECKPOINT_EVERY: u64 = 100;

const DEFAULT_BLOCKED_EXTENSIONS: &[&str] = &[
    "app", "dll", "dylib", "exe", "so", "sys", "msi", "iso", "dmg",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub library_root: PathBuf,
    pub staging_dirs: Vec<PathBuf>,
    pub max_file_bytes: u64,
    pub blocked_extensions: Vec<String>,
    pub thresholds: PolicyThresholds,
    pub max_bias: f64,
    pub bias_min_samples: u64,
    pub worker_count: usize,
    pub classify_timeout_secs: u64,
    pub retention_days: i64,
    pub recovery_grace_secs: i64,
    pub scan_interval_secs: u64,
    pub scan_max_depth: usize,
    pub stats_checkpoint_every: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = directories::ProjectDirs::from("", "", APP_NAME)
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".").join(format!(".{APP_NAME}")));
        let library_root = directories::UserDirs::new()
            .and_then(|dirs| dirs.document_dir().map(|d| d.join("Filed")))
            .unwrap_or_else(|| data_dir.join("library"));
        let staging_dirs = directories::UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
            .into_iter()
            .collect();

        Self {
            data_dir,
            library_root,
            staging_dirs,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            blocked_extensions: DEFAULT_BLOCKED_EXTENSIONS
                .iter()
                .map(|e| e.to_string())
                .collect(),
            thresholds: PolicyThresholds::default(),
            max_bias: DEFAULT_MAX_BIAS,
            bias_min_samples: DEFAULT_BIAS_MIN_SAMPLES,
            worker_count: DEFAULT_WORKER_COUNT,
            classify_timeout_secs: DEFAULT_CLASSIFY_TIMEOUT_SECS,
            retention_days: DEFAULT_RETENTION_DAYS,
            recovery_grace_secs: DEFAULT_RECOVERY_GRACE_SECS,
            scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
            scan_max_depth: DEFAULT_SCAN_MAX_DEPTH,
            stats_checkpoint_every: DEFAULT_STATS_CHECKPOINT_EVERY,
        }
    }
}

impl Settings {
    /// Settings rooted in `data_dir`, with the library beneath it. Used by tests and
    /// portable installs.
    pub fn rooted_at(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            library_root: data_dir.join("library"),
            staging_dirs: Vec::new(),
            ..Self::default()
        }
    }

    /// Loads `path` if given (it must exist), else the per-user config file if present,
    /// else compiled defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let candidate = match path {
            Some(p) => {
                if !p.is_file() {
                    return Err(AppError::Config(format!(
                        "config file not found: {}",
                        p.display()
                    )));
                }
                Some(p.to_path_buf())
            }
            None => default_config_path().filter(|p| p.is_file()),
        };

        let settings = match candidate {
            Some(p) => {
                let text = std::fs::read_to_string(&p)?;
                let parsed = Self::from_toml(&text)?;
                tracing::info!(path = %p.display(), "loaded configuration");
                parsed
            }
            None => Self::default(),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml(text: &str) -> Result<Self, AppError> {
        toml::from_str(text).map_err(|e| AppError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), AppError> {
        self.thresholds.validate()?;
        if self.worker_count == 0 {
            return Err(AppError::Config("worker_count must be at least 1".into()));
        }
        if self.classify_timeout_secs == 0 {
            return Err(AppError::Config(
                "classify_timeout_secs must be at least 1".into(),
            ));
        }
        if !(0.0..=0.25).contains(&self.max_bias) {
            return Err(AppError::Config(format!(
                "max_bias must be within [0, 0.25], got {}",
                self.max_bias
            )));
        }
        if self.retention_days < 0 || self.recovery_grace_secs < 0 {
            return Err(AppError::Config(
                "retention_days and recovery_grace_secs must not be negative".into(),
            ));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.data_dir.join(QUARANTINE_DIR_NAME)
    }

    pub fn classify_timeout(&self) -> Duration {
        Duration::from_secs(self.classify_timeout_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }

    pub fn recovery_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.recovery_grace_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME)
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}
