use serde::{Deserialize, Serialize};

use super::classification::ClassificationResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceMode {
    Never,
    Minimal,
    #[default]
    Smart,
    Always,
}

impl ConfidenceMode {
    pub const ALL: [ConfidenceMode; 4] = [Self::Never, Self::Minimal, Self::Smart, Self::Always];
}

impl std::fmt::Display for ConfidenceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Never => write!(f, "never"),
            Self::Minimal => write!(f, "minimal"),
            Self::Smart => write!(f, "smart"),
            Self::Always => write!(f, "always"),
        }
    }
}

impl std::str::FromStr for ConfidenceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "never" => Ok(Self::Never),
            "minimal" => Ok(Self::Minimal),
            "smart" => Ok(Self::Smart),
            "always" => Ok(Self::Always),
            _ => Err(format!("unknown confidence mode: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionAction {
    AutoFile,
    AskUser,
    Skip,
}

impl std::fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AutoFile => write!(f, "auto_file"),
            Self::AskUser => write!(f, "ask_user"),
            Self::Skip => write!(f, "skip"),
        }
    }
}

impl std::str::FromStr for DecisionAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto_file" => Ok(Self::AutoFile),
            "ask_user" => Ok(Self::AskUser),
            "skip" => Ok(Self::Skip),
            _ => Err(format!("unknown decision action: {s}")),
        }
    }
}

/// Output of the policy engine. `threshold_used` is `None` when no threshold could
/// ever be met (NEVER mode, or an `unknown` category).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,
    pub threshold_used: Option<f64>,
    pub result: ClassificationResult,
}
