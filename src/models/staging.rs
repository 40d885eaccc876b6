use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::classification::{Category, ClassificationResult};

/// Where a staged file is in the per-file pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileState {
    Discovered,
    Classifying,
    Decided,
    Executing,
    Journaled,
    Learned,
    AwaitingUser,
    Skipped,
}

impl FileState {
    /// Terminal for the scanner: the entry no longer occupies the active staging set.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Journaled | Self::Learned | Self::Skipped)
    }
}

impl std::fmt::Display for FileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discovered => write!(f, "discovered"),
            Self::Classifying => write!(f, "classifying"),
            Self::Decided => write!(f, "decided"),
            Self::Executing => write!(f, "executing"),
            Self::Journaled => write!(f, "journaled"),
            Self::Learned => write!(f, "learned"),
            Self::AwaitingUser => write!(f, "awaiting_user"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for FileState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovered" => Ok(Self::Discovered),
            "classifying" => Ok(Self::Classifying),
            "decided" => Ok(Self::Decided),
            "executing" => Ok(Self::Executing),
            "journaled" => Ok(Self::Journaled),
            "learned" => Ok(Self::Learned),
            "awaiting_user" => Ok(Self::AwaitingUser),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("unknown file state: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingEntry {
    pub id: String,
    pub path: String,
    pub first_seen: DateTime<Utc>,
    pub scan_generation: u64,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub state: FileState,
    pub result: Option<ClassificationResult>,
    pub reasoning: Option<String>,
    pub operation_id: Option<String>,
}

/// Verdict of the admission gate for one scanned file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum Admission {
    Admitted,
    Rejected(String),
}

/// A file the scanner found, before it is admitted to the staging set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanCandidate {
    pub path: String,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub scan_generation: u64,
    pub admission: Admission,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewItem {
    pub file_id: String,
    pub path: String,
    pub result: Option<ClassificationResult>,
    pub reasoning: String,
    pub first_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "choice", content = "category", rename_all = "snake_case")]
pub enum ReviewChoice {
    /// File under the category the classifier proposed.
    Accept,
    /// File under a category the user picked instead.
    Reclassify(Category),
    Skip,
}
