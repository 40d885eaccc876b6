use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::classification::ClassificationResult;
use crate::models::decision::{ConfidenceMode, Decision, DecisionAction};

pub const DEFAULT_MINIMAL_AUTO: f64 = 0.95;
pub const DEFAULT_SMART_AUTO: f64 = 0.70;
pub const DEFAULT_SMART_ASK_FLOOR: f64 = 0.40;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyThresholds {
    pub minimal_auto: f64,
    pub smart_auto: f64,
    /// Below this SMART skips instead of asking. Also the floor under which learning
    /// bias may not raise a confidence.
    pub smart_ask_floor: f64,
}

impl Default for PolicyThresholds {
    fn default() -> Self {
        Self {
            minimal_auto: DEFAULT_MINIMAL_AUTO,
            smart_auto: DEFAULT_SMART_AUTO,
            smart_ask_floor: DEFAULT_SMART_ASK_FLOOR,
        }
    }
}

impl PolicyThresholds {
    pub fn validate(&self) -> Result<(), AppError> {
        for (name, value) in [
            ("minimal_auto", self.minimal_auto),
            ("smart_auto", self.smart_auto),
            ("smart_ask_floor", self.smart_ask_floor),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(AppError::Config(format!(
                    "threshold {name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.smart_ask_floor > self.smart_auto {
            return Err(AppError::Config(format!(
                "smart_ask_floor ({}) must not exceed smart_auto ({})",
                self.smart_ask_floor, self.smart_auto
            )));
        }
        Ok(())
    }

    /// The confidence a mode requires for AUTO_FILE, or `None` if it never auto-files.
    pub fn auto_threshold(&self, mode: ConfidenceMode) -> Option<f64> {
        match mode {
            ConfidenceMode::Never => None,
            ConfidenceMode::Minimal => Some(self.minimal_auto),
            ConfidenceMode::Smart => Some(self.smart_auto),
            ConfidenceMode::Always => Some(0.0),
        }
    }
}

pub fn decide(
    result: &ClassificationResult,
    mode: ConfidenceMode,
    thresholds: &PolicyThresholds,
) -> Decision {
    let confidence = result.confidence;

    // An unknown category can be asked about or skipped, never filed.
    if result.category.is_unknown() {
        let action = if mode == ConfidenceMode::Smart && confidence < thresholds.smart_ask_floor
        {
            DecisionAction::Skip
        } else {
            DecisionAction::AskUser
        };
        return Decision {
            action,
            threshold_used: None,
            result: result.clone(),
        };
    }

    let threshold = thresholds.auto_threshold(mode);
    let action = match threshold {
        Some(t) if confidence >= t => DecisionAction::AutoFile,
        _ if mode == ConfidenceMode::Smart && confidence < thresholds.smart_ask_floor => {
            DecisionAction::Skip
        }
        _ => DecisionAction::AskUser,
    };

    Decision {
        action,
        threshold_used: threshold,
        result: result.clone(),
    }
}
