use std::sync::{Arc, RwLock};

use crate::config::Settings;
use crate::data::{self, repository, Db};
use crate::error::AppError;
use crate::models::decision::ConfidenceMode;
use crate::services::classifier_service::Classifier;
use crate::services::journal_service::Journal;
use crate::services::learning_service::{BiasConfig, LearningStore};
use crate::services::orchestrator_service::Orchestrator;

const CONFIDENCE_MODE_KEY: &str = "confidence_mode";

/// The process-wide confidence mode. Read on every decision; [`ConfidenceModeCell::set`]
/// is the only way to change it, and it persists the choice.
pub struct ConfidenceModeCell {
    db: Db,
    mode: RwLock<ConfidenceMode>,
}

impl ConfidenceModeCell {
    pub fn load(db: Db) -> Result<Self, AppError> {
        let stored = repository::get_setting(&data::lock(&db), CONFIDENCE_MODE_KEY)?;
        let mode = match stored.as_deref().map(str::parse::<ConfidenceMode>) {
            Some(Ok(mode)) => mode,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "ignoring stored confidence mode");
                ConfidenceMode::default()
            }
            None => ConfidenceMode::default(),
        };
        Ok(Self {
            db,
            mode: RwLock::new(mode),
        })
    }

    pub fn get(&self) -> ConfidenceMode {
        *self.mode.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set(&self, mode: ConfidenceMode) -> Result<(), AppError> {
        repository::set_setting(&data::lock(&self.db), CONFIDENCE_MODE_KEY, &mode.to_string())?;
        let mut current = self
            .mode
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = std::mem::replace(&mut *current, mode);
        tracing::info!(%previous, %mode, "confidence mode changed");
        Ok(())
    }
}

pub struct AppState {
    pub db: Db,
    pub settings: Settings,
    pub confidence_mode: Arc<ConfidenceModeCell>,
    pub journal: Arc<Journal>,
    pub learning: Arc<LearningStore>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    /// Opens the database under `settings.data_dir` and wires every service. The
    /// classifier is not built here; `LazyClassifier` defers that to first use.
    pub fn open(settings: Settings, classifier: Arc<dyn Classifier>) -> Result<Self, AppError> {
        let conn = data::open_database(&settings.db_path())?;
        Self::with_connection(settings, Arc::new(std::sync::Mutex::new(conn)), classifier)
    }

    pub fn with_connection(
        settings: Settings,
        db: Db,
        classifier: Arc<dyn Classifier>,
    ) -> Result<Self, AppError> {
        settings.validate()?;
        let confidence_mode = Arc::new(ConfidenceModeCell::load(db.clone())?);
        let journal = Arc::new(Journal::new(
            db.clone(),
            settings.quarantine_dir(),
            settings.retention(),
        ));
        let learning = Arc::new(LearningStore::open(
            db.clone(),
            BiasConfig {
                max_bias: settings.max_bias,
                min_samples: settings.bias_min_samples,
                checkpoint_every: settings.stats_checkpoint_every,
            },
        )?);
        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            settings.clone(),
            classifier,
            journal.clone(),
            learning.clone(),
            confidence_mode.clone(),
        )?);

        tracing::info!(
            data_dir = %settings.data_dir.display(),
            library = %settings.library_root.display(),
            mode = %confidence_mode.get(),
            "application state ready"
        );
        Ok(Self {
            db,
            settings,
            confidence_mode,
            journal,
            learning,
            orchestrator,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::classifier_service::LazyClassifier;

    #[test]
    fn confidence_mode_persists_across_reload() {
        let db = data::test_db();
        let cell = ConfidenceModeCell::load(db.clone()).unwrap();
        assert_eq!(cell.get(), ConfidenceMode::Smart);

        cell.set(ConfidenceMode::Never).unwrap();
        assert_eq!(cell.get(), ConfidenceMode::Never);
        assert_eq!(
            ConfidenceModeCell::load(db).unwrap().get(),
            ConfidenceMode::Never
        );
    }

    #[test]
    fn corrupt_stored_mode_falls_back_to_default() {
        let db = data::test_db();
        repository::set_setting(&data::lock(&db), CONFIDENCE_MODE_KEY, "yolo").unwrap();
        assert_eq!(
            ConfidenceModeCell::load(db).unwrap().get(),
            ConfidenceMode::Smart
        );
    }

    #[test]
    fn open_does_not_build_the_classifier() {
        let dir = tempfile::tempdir().unwrap();
        let classifier = Arc::new(LazyClassifier::heuristic());
        let state = AppState::open(Settings::rooted_at(dir.path()), classifier.clone()).unwrap();

        assert!(!classifier.is_initialized());
        assert!(state.settings.db_path().exists());
    }
}
