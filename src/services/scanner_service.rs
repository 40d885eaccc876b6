use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::Settings;
use crate::models::staging::{Admission, ScanCandidate};
use crate::scope_path::path_within;
use crate::services::file_service::modified_time;

const SKIP_DIRS: &[&str] = &[
    "node_modules",
    "target",
    "__pycache__",
    "venv",
    "Pods",
    "DerivedData",
    "$RECYCLE.BIN",
    "System Volume Information",
];

/// In-progress downloads and editor lock files; they are never stable enough to file.
const PARTIAL_EXTENSIONS: &[&str] = &["crdownload", "part", "partial", "download", "tmp", "swp"];

/// Size and type limits applied before any classification.
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    pub max_file_bytes: u64,
    blocked_extensions: Vec<String>,
}

impl AdmissionPolicy {
    pub fn new(max_file_bytes: u64, blocked_extensions: &[String]) -> Self {
        Self {
            max_file_bytes,
            blocked_extensions: blocked_extensions
                .iter()
                .map(|e| e.trim().trim_start_matches('.').to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    pub fn check(&self, path: &Path, size_bytes: u64) -> Admission {
        if size_bytes > self.max_file_bytes {
            return Admission::Rejected(format!(
                "file is {size_bytes} bytes, above the {} byte limit",
                self.max_file_bytes
            ));
        }
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if !extension.is_empty() && self.blocked_extensions.contains(&extension) {
            return Admission::Rejected(format!("extension .{extension} is blocked"));
        }
        Admission::Admitted
    }
}

/// Discovers staging candidates. Holds configuration only; nothing touches the disk
/// until a scan iterator is driven.
pub struct Scanner {
    excluded: Vec<PathBuf>,
    max_depth: usize,
    policy: AdmissionPolicy,
    generation: AtomicU64,
}

impl Scanner {
    pub fn new(settings: &Settings) -> Self {
        Self {
            excluded: vec![settings.data_dir.clone(), settings.library_root.clone()],
            max_depth: settings.scan_max_depth.max(1),
            policy: AdmissionPolicy::new(settings.max_file_bytes, &settings.blocked_extensions),
            generation: AtomicU64::new(0),
        }
    }

    /// Continues numbering from a generation persisted by an earlier run.
    pub fn resume_generation(&self, last: u64) {
        self.generation.fetch_max(last, Ordering::SeqCst);
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn should_skip(&self, entry: &walkdir::DirEntry) -> bool {
        // The scan roots themselves are never filtered, whatever their names.
        if entry.depth() == 0 {
            return false;
        }
        let name = entry.file_name().to_string_lossy();
        if name.starts_with('.') || name.starts_with("~$") {
            return true;
        }
        if self.excluded.iter().any(|root| path_within(entry.path(), root)) {
            return true;
        }

        if entry.file_type().is_dir() {
            return SKIP_DIRS.iter().any(|&d| name == d)
                || name.ends_with(".app")
                || name.ends_with(".bundle");
        }

        Path::new(name.as_ref())
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                PARTIAL_EXTENSIONS
                    .iter()
                    .any(|p| p.eq_ignore_ascii_case(ext))
            })
    }

    /// Lazily walks `dirs`, yielding every regular file with its admission verdict.
    /// Each call takes a new, strictly larger scan generation.
    pub fn scan<'a>(&'a self, dirs: &'a [PathBuf]) -> impl Iterator<Item = ScanCandidate> + 'a {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(generation, dirs = dirs.len(), "scan started");

        dirs.iter()
            .filter(|dir| !self.excluded.iter().any(|root| path_within(dir, root)))
            .flat_map(move |dir| {
                walkdir::WalkDir::new(dir)
                    .min_depth(1)
                    .max_depth(self.max_depth)
                    .follow_links(false)
                    .into_iter()
                    .filter_entry(move |e| !self.should_skip(e))
                    .filter_map(|e| match e {
                        Ok(entry) => Some(entry),
                        Err(err) => {
                            tracing::debug!(error = %err, "skipping unreadable entry");
                            None
                        }
                    })
            })
            .filter(|entry| entry.file_type().is_file())
            .filter_map(move |entry| {
                let metadata = entry.metadata().ok()?;
                let size_bytes = metadata.len();
                Some(ScanCandidate {
                    path: entry.path().to_string_lossy().to_string(),
                    size_bytes,
                    modified_at: modified_time(&metadata),
                    scan_generation: generation,
                    admission: self.policy.check(entry.path(), size_bytes),
                })
            })
    }
}
