use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::classification::ClassificationResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Move,
    Copy,
    Delete,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Move => write!(f, "move"),
            Self::Copy => write!(f, "copy"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

impl std::str::FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "move" => Ok(Self::Move),
            "copy" => Ok(Self::Copy),
            "delete" => Ok(Self::Delete),
            _ => Err(format!("unknown operation kind: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    Applied,
    Undone,
    Permanent,
    /// A PENDING record that recovery found had never touched the filesystem.
    Discarded,
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Applied => write!(f, "applied"),
            Self::Undone => write!(f, "undone"),
            Self::Permanent => write!(f, "permanent"),
            Self::Discarded => write!(f, "discarded"),
        }
    }
}

impl std::str::FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "applied" => Ok(Self::Applied),
            "undone" => Ok(Self::Undone),
            "permanent" => Ok(Self::Permanent),
            "discarded" => Ok(Self::Discarded),
            _ => Err(format!("unknown operation status: {s}")),
        }
    }
}

/// What the journal remembers about a file so it can tell whether it changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub hash: String,
}

impl FileFingerprint {
    /// Human-readable list of differences between a recorded fingerprint and `current`.
    pub fn diff(&self, current: &FileFingerprint) -> Vec<String> {
        let mut changes = Vec::new();
        if self.size != current.size {
            changes.push(format!("size {} -> {}", self.size, current.size));
        }
        if self.modified_at != current.modified_at {
            changes.push(format!(
                "modified {} -> {}",
                describe_time(self.modified_at),
                describe_time(current.modified_at)
            ));
        }
        if self.hash != current.hash {
            changes.push(format!(
                "content hash {} -> {}",
                short_hash(&self.hash),
                short_hash(&current.hash)
            ));
        }
        changes
    }
}

fn describe_time(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string())
}

fn short_hash(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub kind: OperationKind,
    pub source: String,
    pub destination: Option<String>,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source_fingerprint: Option<FileFingerprint>,
    pub destination_fingerprint: Option<FileFingerprint>,
    /// Set on undo records: the operation this record reverses.
    pub reverts: Option<String>,
    pub classification: Option<ClassificationResult>,
}

/// One row of the append-only transition log kept beside each operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationTransition {
    pub operation_id: String,
    pub from_status: Option<OperationStatus>,
    pub to_status: OperationStatus,
    pub at: DateTime<Utc>,
    pub note: Option<String>,
}

pub const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub path_prefix: Option<String>,
    pub status: Option<OperationStatus>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPage {
    pub operations: Vec<Operation>,
    pub total: usize,
    pub offset: usize,
    pub has_more: bool,
}
