use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::classification::{Category, Modality};
use super::decision::DecisionAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// Decided from a classifier result.
    Classifier,
    /// Rejected by the admission gate before any classification.
    Admission,
    /// Filed or skipped by the user without a usable classifier result.
    Manual,
    /// The user reverted a filing they had not overridden.
    Undo,
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Classifier => write!(f, "classifier"),
            Self::Admission => write!(f, "admission"),
            Self::Manual => write!(f, "manual"),
            Self::Undo => write!(f, "undo"),
        }
    }
}

impl std::str::FromStr for EventSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "classifier" => Ok(Self::Classifier),
            "admission" => Ok(Self::Admission),
            "manual" => Ok(Self::Manual),
            "undo" => Ok(Self::Undo),
            _ => Err(format!("unknown event source: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningEvent {
    pub file_path: String,
    pub category: Category,
    pub modality: Modality,
    /// Absent for admission skips and manual filings.
    pub confidence: Option<f64>,
    pub action: DecisionAction,
    pub overridden: bool,
    pub source: EventSource,
    pub recorded_at: DateTime<Utc>,
}

impl LearningEvent {
    pub fn admission_skip(file_path: &str) -> Self {
        Self {
            file_path: file_path.to_string(),
            category: Category::unknown(),
            modality: Modality::Unknown,
            confidence: None,
            action: DecisionAction::Skip,
            overridden: false,
            source: EventSource::Admission,
            recorded_at: Utc::now(),
        }
    }

    pub fn undone_filing(file_path: &str, category: Category, modality: Modality) -> Self {
        Self {
            file_path: file_path.to_string(),
            category,
            modality,
            confidence: None,
            action: DecisionAction::AutoFile,
            overridden: true,
            source: EventSource::Undo,
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub events: u64,
    pub accepted: u64,
    pub overridden: u64,
}

impl OutcomeCounts {
    fn apply(&mut self, event: &LearningEvent) {
        self.events += 1;
        if event.source == EventSource::Undo {
            // Turns an earlier acceptance into an override.
            self.accepted = self.accepted.saturating_sub(1);
            self.overridden += 1;
        } else if event.overridden {
            self.overridden += 1;
        } else if event.action == DecisionAction::AutoFile {
            self.accepted += 1;
        }
    }

    pub fn decided(&self) -> u64 {
        self.accepted + self.overridden
    }
}

/// Aggregate over the learning event log. A pure projection: applying the events in
/// log order always produces the same value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearningStats {
    pub total_events: u64,
    pub admission_skips: u64,
    pub by_modality: BTreeMap<Modality, OutcomeCounts>,
    pub by_category: BTreeMap<Category, OutcomeCounts>,
    pub confidence_sum: f64,
    pub confidence_count: u64,
    /// Id of the last event folded into this aggregate.
    pub last_event_id: i64,
}

impl LearningStats {
    pub fn apply(&mut self, event_id: i64, event: &LearningEvent) {
        self.total_events += 1;
        self.last_event_id = self.last_event_id.max(event_id);

        if event.source == EventSource::Admission {
            self.admission_skips += 1;
            return;
        }

        self.by_modality
            .entry(event.modality)
            .or_default()
            .apply(event);
        self.by_category
            .entry(event.category.clone())
            .or_default()
            .apply(event);

        if let Some(confidence) = event.confidence {
            self.confidence_sum += confidence;
            self.confidence_count += 1;
        }
    }

    pub fn average_confidence(&self) -> Option<f64> {
        (self.confidence_count > 0).then(|| self.confidence_sum / self.confidence_count as f64)
    }

    pub fn category(&self, category: &Category) -> Option<&OutcomeCounts> {
        self.by_category.get(category)
    }

    pub fn modality(&self, modality: Modality) -> Option<&OutcomeCounts> {
        self.by_modality.get(&modality)
    }
}
