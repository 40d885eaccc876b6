use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

const MAX_CATEGORY_CHARS: usize = 50;
const UNKNOWN_CATEGORY: &str = "unknown";
const DEFAULT_REASONING: &str = "No reasoning was provided by the analyzer.";

/// Categories every fresh install offers as hints.
pub const DEFAULT_CATEGORIES: &[&str] = &[
    "archives",
    "audio",
    "code",
    "data",
    "design",
    "documents",
    "financial",
    "images",
    "spreadsheets",
    "videos",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
    Audio,
    Video,
    Unknown,
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Image => write!(f, "image"),
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for Modality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("unknown modality: {s}")),
        }
    }
}

/// A category label from the open taxonomy. Always lowercase `snake_case`,
/// non-empty and at most fifty characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Category(String);

impl Category {
    pub fn new(raw: &str) -> Result<Self, AppError> {
        let normalized = normalize_label(raw);
        if normalized.is_empty() {
            return Err(AppError::General(format!("invalid category: {raw:?}")));
        }
        Ok(Self(normalized.chars().take(MAX_CATEGORY_CHARS).collect()))
    }

    /// Like [`Category::new`], but labels that normalize to nothing become `unknown`.
    pub fn lenient(raw: &str) -> Self {
        Self::new(raw).unwrap_or_else(|_| Self::unknown())
    }

    pub fn unknown() -> Self {
        Self(UNKNOWN_CATEGORY.to_string())
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_CATEGORY
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Category {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Category> for String {
    fn from(value: Category) -> Self {
        value.0
    }
}

fn normalize_label(label: &str) -> String {
    label
        .trim()
        .to_lowercase()
        .chars()
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() {
                Some(c)
            } else if matches!(c, ' ' | '-' | '_' | '/' | '\\' | '.') {
                Some('_')
            } else {
                None
            }
        })
        .collect::<String>()
        .split('_')
        .filter(|token| !token.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Output of one classification attempt. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub category: Category,
    pub confidence: f64,
    pub reasoning: String,
    pub modality: Modality,
}

impl ClassificationResult {
    /// Clamps confidence into `[0, 1]` (NaN becomes 0) and guarantees a reasoning sentence.
    pub fn new(
        category: Category,
        confidence: f64,
        reasoning: impl Into<String>,
        modality: Modality,
    ) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        let reasoning = reasoning.into();
        let reasoning = if reasoning.trim().is_empty() {
            DEFAULT_REASONING.to_string()
        } else {
            reasoning
        };
        Self {
            category,
            confidence,
            reasoning,
            modality,
        }
    }

    /// Same result with a different confidence; used when learning bias is applied.
    pub fn with_confidence(&self, confidence: f64) -> Self {
        Self::new(
            self.category.clone(),
            confidence,
            self.reasoning.clone(),
            self.modality,
        )
    }
}

/// Known categories offered to the UI as hints. Never used to reject a category.
#[derive(Debug, Clone, Default)]
pub struct CategoryRegistry {
    known: BTreeSet<Category>,
}

impl CategoryRegistry {
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        for name in DEFAULT_CATEGORIES {
            registry.observe(&Category::lenient(name));
        }
        registry
    }

    pub fn observe(&mut self, category: &Category) {
        if !category.is_unknown() {
            self.known.insert(category.clone());
        }
    }

    pub fn contains(&self, category: &Category) -> bool {
        self.known.contains(category)
    }

    pub fn suggest(&self, prefix: &str) -> Vec<Category> {
        let prefix = normalize_label(prefix);
        self.known
            .iter()
            .filter(|c| c.as_str().starts_with(&prefix))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_normalizes_labels() {
        assert_eq!(Category::new("  Tax Returns ").unwrap().as_str(), "tax_returns");
        assert_eq!(Category::new("photos/2024").unwrap().as_str(), "photos_2024");
        assert!(Category::new("!!!").is_err());
        assert!(Category::lenient("").is_unknown());
        assert!(Category::new("UNKNOWN").unwrap().is_unknown());
    }

    #[test]
    fn category_truncates_long_labels() {
        let long = "a".repeat(80);
        assert_eq!(Category::new(&long).unwrap().as_str().len(), MAX_CATEGORY_CHARS);
    }

    #[test]
    fn category_deserializes_through_validation() {
        let ok: Category = serde_json::from_str("\"Financial\"").unwrap();
        assert_eq!(ok.as_str(), "financial");
        assert!(serde_json::from_str::<Category>("\"***\"").is_err());
    }

    #[test]
    fn result_clamps_confidence_and_fills_reasoning() {
        let result =
            ClassificationResult::new(Category::lenient("images"), 1.7, "  ", Modality::Image);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.reasoning, DEFAULT_REASONING);

        let nan = ClassificationResult::new(Category::unknown(), f64::NAN, "x.", Modality::Text);
        assert_eq!(nan.confidence, 0.0);
    }

    #[test]
    fn registry_ignores_unknown_and_suggests_by_prefix() {
        let mut registry = CategoryRegistry::with_defaults();
        registry.observe(&Category::unknown());
        registry.observe(&Category::lenient("Fitness Plans"));

        assert!(!registry.contains(&Category::unknown()));
        let suggestions: Vec<String> = registry
            .suggest("fi")
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(suggestions, vec!["financial", "fitness_plans"]);
    }
}
