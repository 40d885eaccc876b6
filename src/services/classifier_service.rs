use std::future::Future;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::error::AppError;
use crate::models::classification::{Category, ClassificationResult, Modality};

const SNIPPET_BYTES: usize = 4096;
const EXTENSION_WEIGHT: f64 = 0.55;
const PATH_KEYWORD_WEIGHT: f64 = 0.15;
const NAME_KEYWORD_WEIGHT: f64 = 0.5;
const SNIPPET_WEIGHT: f64 = 0.1;
const MAX_HEURISTIC_CONFIDENCE: f64 = 0.95;

pub type ClassifyFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ClassificationResult, AppError>> + Send + 'a>>;

/// Anything that can turn a file into a [`ClassificationResult`]. Implementations may be
/// slow and may fail with `AnalyzerUnavailable`; callers bound them with a timeout.
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    fn classify<'a>(&'a self, path: &'a Path) -> ClassifyFuture<'a>;
}

pub type ClassifierFactory = Box<dyn Fn() -> Result<Arc<dyn Classifier>, AppError> + Send + Sync>;

/// Builds its inner classifier on first use and keeps it. Construction is free, so
/// startup never pays for loading an analyzer.
pub struct LazyClassifier {
    factory: ClassifierFactory,
    inner: OnceCell<Arc<dyn Classifier>>,
}

impl LazyClassifier {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn Classifier>, AppError> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            inner: OnceCell::new(),
        }
    }

    pub fn heuristic() -> Self {
        Self::new(|| Ok(Arc::new(HeuristicClassifier) as Arc<dyn Classifier>))
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized()
    }

    async fn get(&self) -> Result<Arc<dyn Classifier>, AppError> {
        let inner = self
            .inner
            .get_or_try_init(|| async {
                tracing::info!("initializing content classifier");
                (self.factory)().map_err(|e| match e {
                    AppError::AnalyzerUnavailable(_) => e,
                    other => AppError::AnalyzerUnavailable(other.to_string()),
                })
            })
            .await?;
        Ok(inner.clone())
    }
}

impl Classifier for LazyClassifier {
    fn name(&self) -> &str {
        "lazy"
    }

    fn classify<'a>(&'a self, path: &'a Path) -> ClassifyFuture<'a> {
        Box::pin(async move {
            let inner = self.get().await?;
            inner.classify(path).await
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Financial,
    Document,
    Spreadsheet,
    Code,
    Data,
    Image,
    Video,
    Audio,
    Archive,
    Design,
}

/// Fixed order; ties go to the earlier kind.
const KINDS: [FileKind; 10] = [
    FileKind::Financial,
    FileKind::Document,
    FileKind::Spreadsheet,
    FileKind::Code,
    FileKind::Data,
    FileKind::Image,
    FileKind::Video,
    FileKind::Audio,
    FileKind::Archive,
    FileKind::Design,
];

impl FileKind {
    fn category(self) -> &'static str {
        match self {
            Self::Financial => "financial",
            Self::Document => "documents",
            Self::Spreadsheet => "spreadsheets",
            Self::Code => "code",
            Self::Data => "data",
            Self::Image => "images",
            Self::Video => "videos",
            Self::Audio => "audio",
            Self::Archive => "archives",
            Self::Design => "design",
        }
    }

    fn modality(self) -> Modality {
        match self {
            Self::Image | Self::Design => Modality::Image,
            Self::Video => Modality::Video,
            Self::Audio => Modality::Audio,
            Self::Archive => Modality::Unknown,
            _ => Modality::Text,
        }
    }

    fn index(self) -> usize {
        KINDS.iter().position(|k| *k == self).unwrap_or(0)
    }
}

fn kind_from_extension(extension: &str) -> Option<FileKind> {
    match extension {
        "rs" | "js" | "jsx" | "ts" | "tsx" | "py" | "go" | "java" | "kt" | "swift" | "c" | "cc"
        | "cpp" | "h" | "hpp" | "sh" | "zsh" | "bash" | "ps1" | "toml" | "yaml" | "yml" | "ini" => {
            Some(FileKind::Code)
        }
        "txt" | "md" | "doc" | "docx" | "pdf" | "rtf" | "odt" | "pages" | "eml" | "msg" | "ppt"
        | "pptx" | "key" => Some(FileKind::Document),
        "csv" | "tsv" | "xls" | "xlsx" | "ods" | "numbers" => Some(FileKind::Spreadsheet),
        "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" | "heic" | "tif" | "tiff" => {
            Some(FileKind::Image)
        }
        "mp4" | "mov" | "avi" | "mkv" | "webm" | "m4v" => Some(FileKind::Video),
        "mp3" | "wav" | "aac" | "flac" | "ogg" | "m4a" => Some(FileKind::Audio),
        "zip" | "rar" | "7z" | "tar" | "gz" | "bz2" | "xz" => Some(FileKind::Archive),
        "json" | "jsonl" | "parquet" | "feather" | "sqlite" | "log" | "ndjson" | "xml" => {
            Some(FileKind::Data)
        }
        "fig" | "xd" | "sketch" | "ai" | "psd" | "eps" | "svg" => Some(FileKind::Design),
        _ => None,
    }
}

const FINANCIAL_NAME_WORDS: &[&str] = &[
    "invoice", "receipt", "statement", "payslip", "paystub", "bank", "tax", "bill", "quote",
];
const FINANCIAL_SNIPPET_WORDS: &[&str] = &[
    "invoice", "subtotal", "total due", "amount due", "vat", "receipt", "balance",
];

const PATH_KEYWORDS: &[(FileKind, &[&str])] = &[
    (FileKind::Financial, &["finance", "accounting", "budget", "taxes"]),
    (FileKind::Document, &["docs", "notes", "writing", "drafts", "letters"]),
    (FileKind::Code, &["src", "code", "repo", "projects"]),
    (FileKind::Data, &["data", "dataset", "exports", "logs"]),
    (FileKind::Image, &["photos", "pictures", "screenshots", "images"]),
    (FileKind::Video, &["videos", "movies", "footage"]),
    (FileKind::Audio, &["music", "podcasts", "recordings"]),
    (FileKind::Archive, &["backup", "backups", "archive"]),
    (FileKind::Design, &["design", "assets", "mockups"]),
];

fn contains_any<'a>(text: &str, needles: &[&'a str]) -> Option<&'a str> {
    needles.iter().copied().find(|n| text.contains(n))
}

/// Signals gathered from one file, before scoring.
#[derive(Debug, Default)]
struct FileSignals {
    file_name: String,
    extension: String,
    parent_dirs: Vec<String>,
    snippet: Option<String>,
}

impl FileSignals {
    fn gather(path: &Path) -> Result<Self, AppError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let parent_dirs = path
            .parent()
            .map(|p| {
                p.components()
                    .rev()
                    .take(3)
                    .map(|c| c.as_os_str().to_string_lossy().to_lowercase())
                    .collect()
            })
            .unwrap_or_default();

        let reads_text = matches!(
            kind_from_extension(&extension),
            None | Some(FileKind::Document | FileKind::Code | FileKind::Data | FileKind::Spreadsheet)
        );
        let snippet = if reads_text {
            read_snippet(path)?
        } else {
            None
        };

        Ok(Self {
            file_name,
            extension,
            parent_dirs,
            snippet,
        })
    }
}

fn read_snippet(path: &Path) -> Result<Option<String>, AppError> {
    let file = std::fs::File::open(path)
        .map_err(|e| AppError::AnalyzerUnavailable(format!("cannot read {}: {e}", path.display())))?;
    let mut buf = Vec::with_capacity(SNIPPET_BYTES);
    file.take(SNIPPET_BYTES as u64)
        .read_to_end(&mut buf)
        .map_err(|e| AppError::AnalyzerUnavailable(format!("cannot read {}: {e}", path.display())))?;

    // A multi-byte character may be cut at the buffer end; anything else is binary.
    let text = match std::str::from_utf8(&buf) {
        Ok(text) => text,
        Err(e) if e.error_len().is_none() => {
            std::str::from_utf8(&buf[..e.valid_up_to()]).unwrap_or_default()
        }
        Err(_) => return Ok(None),
    };
    if text.contains('\0') {
        return Ok(None);
    }
    let compact = text.split_whitespace().collect::<Vec<_>>().join(" ");
    Ok((!compact.is_empty()).then(|| compact.to_lowercase()))
}

fn score(signals: &FileSignals) -> ClassificationResult {
    let mut scores = [0.0_f64; KINDS.len()];
    let mut reasons: Vec<Vec<String>> = vec![Vec::new(); KINDS.len()];
    let mut add = |kind: FileKind, weight: f64, reason: String| {
        let i = kind.index();
        scores[i] = (scores[i] + weight).min(1.0);
        reasons[i].push(reason);
    };

    let extension_kind = kind_from_extension(&signals.extension);
    if let Some(kind) = extension_kind {
        add(kind, EXTENSION_WEIGHT, format!("extension .{}", signals.extension));
    }

    if let Some(word) = contains_any(&signals.file_name, FINANCIAL_NAME_WORDS) {
        add(
            FileKind::Financial,
            NAME_KEYWORD_WEIGHT,
            format!("file name mentions \"{word}\""),
        );
        if matches!(extension_kind, Some(FileKind::Document | FileKind::Spreadsheet)) {
            add(
                FileKind::Financial,
                PATH_KEYWORD_WEIGHT,
                "financial documents are usually PDFs or sheets".to_string(),
            );
        }
    }

    for dir in &signals.parent_dirs {
        for (kind, words) in PATH_KEYWORDS {
            if words.iter().any(|w| dir == w) {
                add(*kind, PATH_KEYWORD_WEIGHT, format!("stored under \"{dir}\""));
            }
        }
    }

    if let Some(snippet) = signals.snippet.as_deref() {
        if let Some(word) = contains_any(snippet, FINANCIAL_SNIPPET_WORDS) {
            add(
                FileKind::Financial,
                SNIPPET_WEIGHT * 2.0,
                format!("content mentions \"{word}\""),
            );
        }
        if contains_any(snippet, &["traceback", "stack trace", "select ", "timestamp"]).is_some() {
            add(FileKind::Data, SNIPPET_WEIGHT, "content looks like data or logs".to_string());
        }
        if extension_kind.is_none() {
            add(FileKind::Document, SNIPPET_WEIGHT * 2.0, "readable text content".to_string());
        }
    }

    let best = KINDS
        .iter()
        .copied()
        .fold(None::<(FileKind, f64)>, |best, kind| {
            let s = scores[kind.index()];
            match best {
                Some((_, top)) if top >= s => best,
                _ if s > 0.0 => Some((kind, s)),
                _ => best,
            }
        });

    match best {
        Some((kind, s)) => ClassificationResult::new(
            Category::lenient(kind.category()),
            s.min(MAX_HEURISTIC_CONFIDENCE),
            format!(
                "Looks like {}: {}.",
                kind.category(),
                reasons[kind.index()].join(", ")
            ),
            kind.modality(),
        ),
        None => ClassificationResult::new(
            Category::unknown(),
            0.0,
            "No extension, location or content signal matched a known category.",
            if signals.snippet.is_some() {
                Modality::Text
            } else {
                Modality::Unknown
            },
        ),
    }
}

/// Extension, location and snippet heuristics. Used when no remote analyzer is
/// configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicClassifier;

impl Classifier for HeuristicClassifier {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn classify<'a>(&'a self, path: &'a Path) -> ClassifyFuture<'a> {
        let owned: PathBuf = path.to_path_buf();
        Box::pin(async move {
            let signals = tokio::task::spawn_blocking(move || FileSignals::gather(&owned))
                .await
                .map_err(|e| AppError::AnalyzerUnavailable(format!("analyzer task failed: {e}")))??;
            Ok(score(&signals))
        })
    }
}

#[cfg(test)]
pub mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    #[derive(Debug, Clone)]
    pub enum Scripted {
        Result(ClassificationResult),
        Unavailable(String),
        Hang,
    }

    /// Classifier whose answers are keyed by file name. Unscripted names are `unknown`.
    #[derive(Default)]
    pub struct ScriptedClassifier {
        answers: Mutex<HashMap<String, Scripted>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedClassifier {
        pub fn answer(&self, file_name: &str, category: &str, confidence: f64, modality: Modality) {
            self.script(
                file_name,
                Scripted::Result(ClassificationResult::new(
                    Category::lenient(category),
                    confidence,
                    format!("Scripted answer for {file_name}."),
                    modality,
                )),
            );
        }

        pub fn script(&self, file_name: &str, answer: Scripted) {
            self.answers
                .lock()
                .unwrap()
                .insert(file_name.to_string(), answer);
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Classifier for ScriptedClassifier {
        fn name(&self) -> &str {
            "scripted"
        }

        fn classify<'a>(&'a self, path: &'a Path) -> ClassifyFuture<'a> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                let answer = self.answers.lock().unwrap().get(&name).cloned();
                match answer {
                    Some(Scripted::Result(result)) => Ok(result),
                    Some(Scripted::Unavailable(msg)) => Err(AppError::AnalyzerUnavailable(msg)),
                    Some(Scripted::Hang) => {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Err(AppError::AnalyzerUnavailable("woke up".to_string()))
                    }
                    None => Ok(ClassificationResult::new(
                        Category::unknown(),
                        0.0,
                        "Nothing scripted.",
                        Modality::Unknown,
                    )),
                }
            })
        }
    }
}
