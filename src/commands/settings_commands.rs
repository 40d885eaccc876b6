use crate::error::AppError;
use crate::models::decision::ConfidenceMode;
use crate::models::learning::LearningStats;
use crate::state::AppState;

#[derive(Debug, serde::Serialize)]
pub struct ConfidenceModeResponse {
    pub mode: ConfidenceMode,
    /// Confidence needed to auto-file in this mode; `None` when it never auto-files.
    pub auto_threshold: Option<f64>,
}

fn describe_mode(mode: ConfidenceMode, state: &AppState) -> ConfidenceModeResponse {
    ConfidenceModeResponse {
        mode,
        auto_threshold: state.settings.thresholds.auto_threshold(mode),
    }
}

pub fn get_confidence_mode(state: &AppState) -> Result<ConfidenceModeResponse, AppError> {
    Ok(describe_mode(state.confidence_mode.get(), state))
}

pub fn set_confidence_mode(mode: String, state: &AppState) -> Result<ConfidenceModeResponse, AppError> {
    let mode = mode.parse::<ConfidenceMode>().map_err(|e| {
        let accepted: Vec<String> = ConfidenceMode::ALL.iter().map(|m| m.to_string()).collect();
        AppError::General(format!("{e} (expected one of: {})", accepted.join(", ")))
    })?;
    state.confidence_mode.set(mode)?;
    Ok(describe_mode(mode, state))
}

pub fn learning_stats(state: &AppState) -> Result<LearningStats, AppError> {
    Ok(state.learning.stats())
}

pub fn rebuild_learning_stats(state: &AppState) -> Result<LearningStats, AppError> {
    state.learning.rebuild()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Settings;
    use crate::data;
    use crate::services::classifier_service::testing::ScriptedClassifier;

    fn state_in(dir: &std::path::Path) -> AppState {
        AppState::with_connection(
            Settings::rooted_at(dir),
            data::test_db(),
            Arc::new(ScriptedClassifier::default()),
        )
        .unwrap()
    }

    #[test]
    fn test_set_confidence_mode_reports_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());

        let response = set_confidence_mode("MINIMAL".to_string(), &state).unwrap();
        assert_eq!(response.mode, ConfidenceMode::Minimal);
        assert_eq!(response.auto_threshold, Some(0.95));

        let never = set_confidence_mode("never".to_string(), &state).unwrap();
        assert_eq!(never.auto_threshold, None);
        assert_eq!(get_confidence_mode(&state).unwrap().mode, ConfidenceMode::Never);
    }

    #[test]
    fn test_set_confidence_mode_rejects_unknown_value() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let err = set_confidence_mode("sometimes".to_string(), &state).unwrap_err();
        assert!(err.to_string().contains("smart"));
        assert_eq!(get_confidence_mode(&state).unwrap().mode, ConfidenceMode::Smart);
    }

    #[test]
    fn test_rebuild_on_empty_log() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        assert_eq!(rebuild_learning_stats(&state).unwrap(), LearningStats::default());
        assert_eq!(learning_stats(&state).unwrap().total_events, 0);
    }
}
