use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::Settings;
use crate::data::{self, repository, repository::AdmitOutcome, Db};
use crate::error::AppError;
use crate::models::classification::{Category, CategoryRegistry, ClassificationResult};
use crate::models::decision::{Decision, DecisionAction};
use crate::models::learning::{EventSource, LearningEvent};
use crate::models::operation::Operation;
use crate::models::staging::{Admission, FileState, ReviewChoice, ReviewItem, StagingEntry};
use crate::services::classifier_service::Classifier;
use crate::services::journal_service::{Journal, PurgeReport, RecoveryReport};
use crate::services::learning_service::LearningStore;
use crate::services::policy_service;
use crate::services::scanner_service::Scanner;
use crate::state::ConfidenceModeCell;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);
const SCAN_GENERATION_KEY: &str = "scan_generation";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanReport {
    pub generation: u64,
    pub discovered: usize,
    pub admission_skips: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub processed: usize,
    pub auto_filed: usize,
    pub awaiting_user: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FileOutcome {
    Filed { operation_id: String, destination: String },
    AwaitingUser { reasoning: String },
    Skipped { reasoning: String },
    Cancelled,
    /// Another worker owns the file.
    NotClaimed,
}

impl BatchReport {
    fn count(&mut self, outcome: &FileOutcome) {
        match outcome {
            FileOutcome::NotClaimed => return,
            FileOutcome::Filed { .. } => self.auto_filed += 1,
            FileOutcome::AwaitingUser { .. } => self.awaiting_user += 1,
            FileOutcome::Skipped { .. } => self.skipped += 1,
            FileOutcome::Cancelled => self.cancelled += 1,
        }
        self.processed += 1;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoverySummary {
    pub journal: RecoveryReport,
    pub requeued: usize,
    pub interrupted: usize,
}

pub struct Orchestrator {
    db: Db,
    settings: Settings,
    scanner: Scanner,
    classifier: Arc<dyn Classifier>,
    journal: Arc<Journal>,
    learning: Arc<LearningStore>,
    mode: Arc<ConfidenceModeCell>,
    registry: RwLock<CategoryRegistry>,
    cancel_flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
    batch_cancelled: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        db: Db,
        settings: Settings,
        classifier: Arc<dyn Classifier>,
        journal: Arc<Journal>,
        learning: Arc<LearningStore>,
        mode: Arc<ConfidenceModeCell>,
    ) -> Result<Self, AppError> {
        let scanner = Scanner::new(&settings);
        let last_generation = repository::get_setting(&data::lock(&db), SCAN_GENERATION_KEY)?
            .and_then(|g| g.parse::<u64>().ok())
            .unwrap_or(0);
        scanner.resume_generation(last_generation);

        let mut registry = CategoryRegistry::with_defaults();
        for category in learning.known_categories() {
            registry.observe(&category);
        }

        Ok(Self {
            db,
            settings,
            scanner,
            classifier,
            journal,
            learning,
            mode,
            registry: RwLock::new(registry),
            cancel_flags: Mutex::new(HashMap::new()),
            batch_cancelled: AtomicBool::new(false),
        })
    }

    // --- Scanning ---

    /// Oversized and blocked files are settled as SKIPPED here and never reach the
    /// classifier.
    pub fn trigger_scan(&self, dirs: &[PathBuf]) -> Result<ScanReport, AppError> {
        let dirs = if dirs.is_empty() {
            self.settings.staging_dirs.as_slice()
        } else {
            dirs
        };

        // Walk without holding the database lock; workers may be settling entries.
        let candidates: Vec<_> = self.scanner.scan(dirs).collect();
        let mut report = ScanReport {
            generation: self.scanner.current_generation(),
            ..ScanReport::default()
        };
        let mut skipped_paths = Vec::new();
        {
            let conn = data::lock(&self.db);
            for candidate in &candidates {
                report.generation = report.generation.max(candidate.scan_generation);
                let rejection = match &candidate.admission {
                    Admission::Admitted => None,
                    Admission::Rejected(reason) => {
                        Some(AppError::AdmissionRejected(reason.clone()).to_string())
                    }
                };
                let state = if rejection.is_some() {
                    FileState::Skipped
                } else {
                    FileState::Discovered
                };
                match repository::admit_candidate(&conn, candidate, state, rejection.as_deref())? {
                    AdmitOutcome::Inserted(_) | AdmitOutcome::Readmitted(_) => {
                        if state == FileState::Skipped {
                            report.admission_skips += 1;
                            skipped_paths.push(candidate.path.clone());
                        } else {
                            report.discovered += 1;
                        }
                    }
                    AdmitOutcome::AlreadyStaged | AdmitOutcome::Unchanged => report.unchanged += 1,
                }
            }
            repository::set_setting(&conn, SCAN_GENERATION_KEY, &report.generation.to_string())?;
        }

        for path in skipped_paths {
            tracing::debug!(%path, "skipped by admission gate");
            self.learning.record(&LearningEvent::admission_skip(&path))?;
        }
        tracing::info!(
            generation = report.generation,
            discovered = report.discovered,
            admission_skips = report.admission_skips,
            "scan finished"
        );
        Ok(report)
    }

    // --- Processing ---

    pub async fn process_staged(self: &Arc<Self>) -> Result<BatchReport, AppError> {
        self.batch_cancelled.store(false, Ordering::SeqCst);
        let entries = {
            let conn = data::lock(&self.db);
            repository::list_staging_by_state(&conn, FileState::Discovered)?
        };
        let mut report = BatchReport::default();
        if entries.is_empty() {
            return Ok(report);
        }

        let semaphore = Arc::new(Semaphore::new(self.settings.worker_count.max(1)));
        let mut join_set: JoinSet<(String, Result<FileOutcome, AppError>)> = JoinSet::new();

        for entry in entries {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| AppError::General("worker pool closed".to_string()))?;
            if self.batch_cancelled.load(Ordering::SeqCst) {
                drop(permit);
                let outcome = self.cancel_queued(&entry)?;
                report.count(&outcome);
                continue;
            }
            let this = Arc::clone(self);
            join_set.spawn(async move {
                let _permit = permit;
                let id = entry.id.clone();
                (id, this.process_entry(entry).await)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => report.count(&outcome),
                Ok((file_id, Err(e))) => {
                    tracing::warn!(%file_id, error = %e, "file failed in pipeline");
                    report.failed += 1;
                }
                Err(join_err) => {
                    tracing::warn!(error = %join_err, "pipeline task failed");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            processed = report.processed,
            auto_filed = report.auto_filed,
            awaiting_user = report.awaiting_user,
            skipped = report.skipped,
            cancelled = report.cancelled,
            failed = report.failed,
            "batch finished"
        );
        Ok(report)
    }

    fn cancel_queued(&self, entry: &StagingEntry) -> Result<FileOutcome, AppError> {
        let conn = data::lock(&self.db);
        if !repository::claim_staging_entry(&conn, &entry.id, FileState::Discovered, FileState::Skipped)? {
            return Ok(FileOutcome::NotClaimed);
        }
        repository::update_staging_entry(
            &conn,
            &entry.id,
            FileState::Skipped,
            None,
            Some("Cancelled before classification."),
            None,
        )?;
        Ok(FileOutcome::Cancelled)
    }

    pub async fn process_entry(&self, entry: StagingEntry) -> Result<FileOutcome, AppError> {
        {
            let conn = data::lock(&self.db);
            if !repository::claim_staging_entry(
                &conn,
                &entry.id,
                FileState::Discovered,
                FileState::Classifying,
            )? {
                return Ok(FileOutcome::NotClaimed);
            }
        }

        let flag = self.register_cancel_flag(&entry.id);
        let outcome = self.classify_and_route(&entry, &flag).await;
        self.clear_cancel_flag(&entry.id);
        outcome
    }

    async fn classify_and_route(
        &self,
        entry: &StagingEntry,
        flag: &AtomicBool,
    ) -> Result<FileOutcome, AppError> {
        let path = PathBuf::from(&entry.path);
        let raw = match self.classify_bounded(&path, flag).await {
            Ok(result) => result,
            Err(AppError::Cancelled(note)) => {
                let reasoning = format!("Cancelled: {note}");
                self.settle(&entry.id, FileState::Skipped, None, &reasoning, None)?;
                tracing::info!(file_id = %entry.id, path = %entry.path, "classification cancelled");
                return Ok(FileOutcome::Cancelled);
            }
            Err(e) => {
                let reasoning = format!("Classification failed: {e}");
                self.settle(&entry.id, FileState::AwaitingUser, None, &reasoning, None)?;
                if e.is_analyzer_failure() {
                    tracing::warn!(
                        file_id = %entry.id,
                        path = %entry.path,
                        classifier = self.classifier.name(),
                        error = %e,
                        "analyzer failed"
                    );
                } else {
                    tracing::warn!(file_id = %entry.id, path = %entry.path, error = %e, "classification failed");
                }
                return Ok(FileOutcome::AwaitingUser { reasoning });
            }
        };

        let decision = self.decide(&raw);
        self.registry
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .observe(&raw.category);
        self.settle(&entry.id, FileState::Decided, Some(&raw), &raw.reasoning, None)?;

        if flag.load(Ordering::SeqCst) {
            let reasoning = "Cancelled before filing.".to_string();
            self.settle(&entry.id, FileState::Skipped, None, &reasoning, None)?;
            return Ok(FileOutcome::Cancelled);
        }

        match decision.action {
            DecisionAction::AutoFile => {
                let event = classifier_event(&entry.path, &raw, DecisionAction::AutoFile, false);
                self.file_entry(entry, &raw, event).await
            }
            DecisionAction::AskUser => {
                self.settle(&entry.id, FileState::AwaitingUser, None, &raw.reasoning, None)?;
                Ok(FileOutcome::AwaitingUser {
                    reasoning: raw.reasoning.clone(),
                })
            }
            DecisionAction::Skip => {
                let reasoning = format!("Confidence too low to file or ask. {}", raw.reasoning);
                self.settle(&entry.id, FileState::Skipped, None, &reasoning, None)?;
                self.learning
                    .record(&classifier_event(&entry.path, &raw, DecisionAction::Skip, false))?;
                Ok(FileOutcome::Skipped { reasoning })
            }
        }
    }

    /// Applies the learned bias and the current mode. The stored result stays raw.
    fn decide(&self, raw: &ClassificationResult) -> Decision {
        let thresholds = &self.settings.thresholds;
        let adjusted = self.learning.adjust(raw, thresholds.smart_ask_floor);
        let mode = self.mode.get();
        let decision = policy_service::decide(&adjusted, mode, thresholds);
        tracing::debug!(
            category = %raw.category,
            raw = raw.confidence,
            adjusted = adjusted.confidence,
            %mode,
            action = %decision.action,
            "decided"
        );
        decision
    }

    async fn classify_bounded(
        &self,
        path: &Path,
        flag: &AtomicBool,
    ) -> Result<ClassificationResult, AppError> {
        let timeout = self.settings.classify_timeout();
        let mut classify = self.classifier.classify(path);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(CANCEL_POLL_INTERVAL);

        loop {
            tokio::select! {
                result = &mut classify => return result,
                _ = &mut deadline => {
                    return Err(AppError::AnalyzerTimeout(self.settings.classify_timeout_secs));
                }
                _ = poll.tick() => {
                    if flag.load(Ordering::SeqCst) {
                        return Err(AppError::Cancelled("stopped during classification".to_string()));
                    }
                }
            }
        }
    }

    async fn file_entry(
        &self,
        entry: &StagingEntry,
        result: &ClassificationResult,
        event: LearningEvent,
    ) -> Result<FileOutcome, AppError> {
        {
            let conn = data::lock(&self.db);
            if !repository::claim_staging_entry(
                &conn,
                &entry.id,
                FileState::Decided,
                FileState::Executing,
            )? {
                return Ok(FileOutcome::NotClaimed);
            }
        }

        let source = PathBuf::from(&entry.path);
        let target_dir = self.settings.library_root.join(result.category.as_str());
        let journal = self.journal.clone();
        let classification = result.clone();
        let executed = tokio::task::spawn_blocking(move || {
            journal.execute_into(&source, &target_dir, Some(&classification))
        })
        .await
        .map_err(|e| AppError::General(format!("filing task failed: {e}")))?;

        let op = match executed {
            Ok(op) => op,
            Err(failure) => {
                let reasoning = format!("Filing failed: {}", failure.error);
                if matches!(failure.error, AppError::Journal(_)) {
                    tracing::error!(file_id = %entry.id, error = %failure.error, "journal refused filing");
                } else {
                    tracing::warn!(file_id = %entry.id, error = %failure.error, "filing failed");
                }
                self.settle(
                    &entry.id,
                    FileState::AwaitingUser,
                    None,
                    &reasoning,
                    failure.operation_id.as_deref(),
                )?;
                return Ok(FileOutcome::AwaitingUser { reasoning });
            }
        };

        let destination = op.destination.clone().unwrap_or_default();
        self.settle(
            &entry.id,
            FileState::Journaled,
            None,
            &format!("Filed to {destination}."),
            Some(&op.id),
        )?;
        match self.learning.record(&event) {
            Ok(_) => self.settle(&entry.id, FileState::Learned, None, &result.reasoning, None)?,
            // The operation is durable; a missing outcome only delays learning.
            Err(e) => tracing::warn!(file_id = %entry.id, error = %e, "could not record outcome"),
        }

        tracing::info!(
            file_id = %entry.id,
            operation_id = %op.id,
            category = %result.category,
            %destination,
            "file filed"
        );
        Ok(FileOutcome::Filed {
            operation_id: op.id,
            destination,
        })
    }

    fn settle(
        &self,
        file_id: &str,
        state: FileState,
        result: Option<&ClassificationResult>,
        reasoning: &str,
        operation_id: Option<&str>,
    ) -> Result<(), AppError> {
        let conn = data::lock(&self.db);
        repository::update_staging_entry(&conn, file_id, state, result, Some(reasoning), operation_id)
    }

    // --- User review ---

    pub fn pending_reviews(&self) -> Result<Vec<ReviewItem>, AppError> {
        let conn = data::lock(&self.db);
        let entries = repository::list_staging_by_state(&conn, FileState::AwaitingUser)?;
        Ok(entries
            .into_iter()
            .map(|e| ReviewItem {
                reasoning: e
                    .reasoning
                    .clone()
                    .unwrap_or_else(|| "Waiting for a decision.".to_string()),
                file_id: e.id,
                path: e.path,
                result: e.result,
                first_seen: e.first_seen,
            })
            .collect())
    }

    pub async fn resolve_review(
        &self,
        file_id: &str,
        choice: ReviewChoice,
    ) -> Result<FileOutcome, AppError> {
        let entry = {
            let conn = data::lock(&self.db);
            let entry = repository::get_staging_entry(&conn, file_id)?
                .ok_or_else(|| AppError::General(format!("unknown staged file: {file_id}")))?;
            if entry.state != FileState::AwaitingUser {
                return Err(AppError::General(format!(
                    "file {file_id} is {}, not awaiting review",
                    entry.state
                )));
            }
            if matches!(choice, ReviewChoice::Accept) && entry.result.is_none() {
                return Err(AppError::General(format!(
                    "file {file_id} has no classification to accept; pick a category instead"
                )));
            }
            if !repository::claim_staging_entry(
                &conn,
                file_id,
                FileState::AwaitingUser,
                FileState::Decided,
            )? {
                return Ok(FileOutcome::NotClaimed);
            }
            entry
        };
        let proposed = entry.result.clone();

        match choice {
            ReviewChoice::Accept => {
                let result = proposed.ok_or_else(|| {
                    AppError::General(format!("file {file_id} has no classification"))
                })?;
                let event = classifier_event(&entry.path, &result, DecisionAction::AutoFile, false);
                self.file_entry(&entry, &result, event).await
            }
            ReviewChoice::Reclassify(category) => {
                self.registry
                    .write()
                    .unwrap_or_else(|p| p.into_inner())
                    .observe(&category);
                let (result, event) = reclassified(&entry.path, proposed.as_ref(), category);
                self.file_entry(&entry, &result, event).await
            }
            ReviewChoice::Skip => {
                let reasoning = "Skipped by user.".to_string();
                self.settle(&entry.id, FileState::Skipped, None, &reasoning, None)?;
                let event = match proposed.as_ref() {
                    Some(result) => classifier_event(&entry.path, result, DecisionAction::Skip, false),
                    None => manual_event(&entry.path, &Category::unknown(), DecisionAction::Skip),
                };
                self.learning.record(&event)?;
                Ok(FileOutcome::Skipped { reasoning })
            }
        }
    }

    pub fn category_hints(&self, prefix: &str) -> Vec<Category> {
        self.registry
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .suggest(prefix)
    }

    // --- Cancellation ---

    fn register_cancel_flag(&self, file_id: &str) -> Arc<AtomicBool> {
        let mut flags = self
            .cancel_flags
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let flag = flags
            .entry(file_id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone();
        flag.store(self.batch_cancelled.load(Ordering::SeqCst), Ordering::SeqCst);
        flag
    }

    fn clear_cancel_flag(&self, file_id: &str) {
        self.cancel_flags
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(file_id);
    }

    /// False once the file is past DECIDED; filing is never interrupted.
    pub fn cancel_file(&self, file_id: &str) -> Result<bool, AppError> {
        let in_flight = self
            .cancel_flags
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(file_id)
            .cloned();
        let conn = data::lock(&self.db);
        if let Some(flag) = in_flight {
            let state = repository::get_staging_entry(&conn, file_id)?.map(|e| e.state);
            let cancelled = match state {
                Some(FileState::Classifying) => true,
                // Taking DECIDED here makes the worker's claim on EXECUTING fail.
                Some(FileState::Decided) => {
                    let taken = repository::claim_staging_entry(
                        &conn,
                        file_id,
                        FileState::Decided,
                        FileState::Skipped,
                    )?;
                    if taken {
                        repository::update_staging_entry(
                            &conn,
                            file_id,
                            FileState::Skipped,
                            None,
                            Some("Cancelled before filing."),
                            None,
                        )?;
                    }
                    taken
                }
                _ => false,
            };
            if cancelled {
                flag.store(true, Ordering::SeqCst);
            } else {
                tracing::debug!(file_id, state = ?state, "file is past the point of cancelling");
            }
            return Ok(cancelled);
        }

        let queued = repository::claim_staging_entry(&conn, file_id, FileState::Discovered, FileState::Skipped)?;
        if queued {
            repository::update_staging_entry(
                &conn,
                file_id,
                FileState::Skipped,
                None,
                Some("Cancelled before classification."),
                None,
            )?;
        }
        Ok(queued)
    }

    pub fn cancel_all(&self) -> usize {
        self.batch_cancelled.store(true, Ordering::SeqCst);
        let flags = self
            .cancel_flags
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for flag in flags.values() {
            flag.store(true, Ordering::SeqCst);
        }
        tracing::info!(in_flight = flags.len(), "cancelling all files");
        flags.len()
    }

    // --- Maintenance ---

    pub fn recover(&self) -> Result<RecoverySummary, AppError> {
        let grace = self.settings.recovery_grace();
        let journal = self.journal.recover(grace)?;
        let cutoff = Utc::now() - grace;
        let conn = data::lock(&self.db);
        let requeued = repository::reset_interrupted_staging(&conn, cutoff)?;
        let interrupted = repository::park_interrupted_executions(
            &conn,
            "Interrupted while filing; check the operation history before retrying.",
            cutoff,
        )?;
        Ok(RecoverySummary {
            journal,
            requeued,
            interrupted,
        })
    }

    pub fn undo(&self, operation_id: &str) -> Result<Operation, AppError> {
        let original = self.journal.get(operation_id)?;
        let undone = self.journal.undo(operation_id)?;

        let entry = {
            let conn = data::lock(&self.db);
            repository::find_staging_by_operation(&conn, operation_id)?
        };
        let Some(entry) = entry else {
            return Ok(undone);
        };
        let accepted = match (&entry.result, &original.classification) {
            (Some(proposed), Some(filed)) => proposed.category == filed.category,
            _ => false,
        };
        self.settle(&entry.id, FileState::Skipped, None, "Filing undone by the user.", None)?;
        if accepted {
            if let Some(filed) = &original.classification {
                let event =
                    LearningEvent::undone_filing(&entry.path, filed.category.clone(), filed.modality);
                self.learning.record(&event)?;
            }
        }
        tracing::info!(file_id = %entry.id, operation_id, learned = accepted, "filing undone");
        Ok(undone)
    }

    pub fn purge_expired(&self) -> Result<PurgeReport, AppError> {
        let report = self.journal.purge_expired()?;
        if !report.purged.is_empty() {
            tracing::info!(purged = report.purged.len(), at = %Utc::now(), "purged expired quarantine");
        }
        Ok(report)
    }

    pub async fn run_scheduled<F>(self: Arc<Self>, shutdown: F) -> Result<(), AppError>
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.settings.scan_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("scheduled scanning stopped");
                    self.cancel_all();
                    return self.learning.checkpoint();
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!(error = %e, "scheduled scan failed");
                    }
                }
            }
        }
    }

    async fn tick(self: &Arc<Self>) -> Result<(), AppError> {
        let recovered = self.journal.recover(self.settings.recovery_grace())?;
        if !recovered.applied.is_empty() || !recovered.discarded.is_empty() {
            tracing::info!(
                applied = recovered.applied.len(),
                discarded = recovered.discarded.len(),
                "settled stale operations"
            );
        }
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || this.trigger_scan(&[]))
            .await
            .map_err(|e| AppError::General(format!("scan task failed: {e}")))??;
        self.process_staged().await?;
        self.purge_expired()?;
        Ok(())
    }
}

fn classifier_event(
    path: &str,
    result: &ClassificationResult,
    action: DecisionAction,
    overridden: bool,
) -> LearningEvent {
    LearningEvent {
        file_path: path.to_string(),
        category: result.category.clone(),
        modality: result.modality,
        confidence: Some(result.confidence),
        action,
        overridden,
        source: EventSource::Classifier,
        recorded_at: Utc::now(),
    }
}

fn manual_event(path: &str, category: &Category, action: DecisionAction) -> LearningEvent {
    LearningEvent {
        file_path: path.to_string(),
        category: category.clone(),
        modality: crate::models::classification::Modality::Unknown,
        confidence: None,
        action,
        overridden: false,
        source: EventSource::Manual,
        recorded_at: Utc::now(),
    }
}

fn reclassified(
    path: &str,
    proposed: Option<&ClassificationResult>,
    category: Category,
) -> (ClassificationResult, LearningEvent) {
    match proposed {
        Some(original) if original.category != category => (
            ClassificationResult::new(
                category.clone(),
                1.0,
                format!(
                    "Filed as {category} by the user; the analyzer proposed {}.",
                    original.category
                ),
                original.modality,
            ),
            classifier_event(path, original, DecisionAction::AutoFile, true),
        ),
        Some(original) => (
            original.clone(),
            classifier_event(path, original, DecisionAction::AutoFile, false),
        ),
        None => (
            ClassificationResult::new(
                category.clone(),
                1.0,
                format!("Filed as {category} by the user."),
                crate::models::classification::Modality::Unknown,
            ),
            manual_event(path, &category, DecisionAction::AutoFile),
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::models::classification::Modality;
    use crate::models::decision::ConfidenceMode;
    use crate::models::operation::{HistoryFilter, OperationKind, OperationStatus};
    use crate::services::file_service;
    use crate::services::classifier_service::testing::{Scripted, ScriptedClassifier};
    use crate::services::learning_service::BiasConfig;

    struct Harness {
        _dir: tempfile::TempDir,
        staging: PathBuf,
        settings: Settings,
        classifier: Arc<ScriptedClassifier>,
        mode: Arc<ConfidenceModeCell>,
        learning: Arc<LearningStore>,
        journal: Arc<Journal>,
        db: Db,
        orchestrator: Arc<Orchestrator>,
    }

    fn harness_with(configure: impl FnOnce(&mut Settings)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        fs::create_dir_all(&staging).unwrap();
        let mut settings = Settings::rooted_at(&dir.path().join("data"));
        settings.staging_dirs = vec![staging.clone()];
        configure(&mut settings);

        let db = data::test_db();
        let classifier = Arc::new(ScriptedClassifier::default());
        let mode = Arc::new(ConfidenceModeCell::load(db.clone()).unwrap());
        let journal = Arc::new(Journal::new(
            db.clone(),
            settings.quarantine_dir(),
            settings.retention(),
        ));
        let learning = Arc::new(
            LearningStore::open(
                db.clone(),
                BiasConfig {
                    max_bias: settings.max_bias,
                    min_samples: settings.bias_min_samples,
                    checkpoint_every: settings.stats_checkpoint_every,
                },
            )
            .unwrap(),
        );
        let orchestrator = Arc::new(
            Orchestrator::new(
                db.clone(),
                settings.clone(),
                classifier.clone(),
                journal.clone(),
                learning.clone(),
                mode.clone(),
            )
            .unwrap(),
        );
        Harness {
            _dir: dir,
            staging,
            settings,
            classifier,
            mode,
            learning,
            journal,
            db,
            orchestrator,
        }
    }

    fn harness() -> Harness {
        harness_with(|_| {})
    }

    fn entry_for(h: &Harness, name: &str) -> StagingEntry {
        let conn = data::lock(&h.db);
        [
            FileState::Discovered,
            FileState::AwaitingUser,
            FileState::Skipped,
            FileState::Learned,
            FileState::Journaled,
        ]
        .into_iter()
        .flat_map(|s| repository::list_staging_by_state(&conn, s).unwrap())
        .find(|e| e.path.ends_with(name))
        .unwrap()
    }

    #[tokio::test]
    async fn invoice_is_auto_filed_and_undo_restores_it() {
        let h = harness();
        let invoice = h.staging.join("invoice.pdf");
        fs::write(&invoice, "Invoice 2024-001 total due 120.00").unwrap();
        let hash_before = file_service::stat_file(&invoice).unwrap().hash;
        h.classifier.answer("invoice.pdf", "financial", 0.92, Modality::Text);

        let scan = h.orchestrator.trigger_scan(&[]).unwrap();
        assert_eq!(scan.discovered, 1);
        let batch = h.orchestrator.process_staged().await.unwrap();
        assert_eq!(batch.auto_filed, 1);

        let filed = h.settings.library_root.join("financial/invoice.pdf");
        assert!(filed.exists());
        assert!(!invoice.exists());

        let page = h.journal.history(&HistoryFilter::default()).unwrap();
        assert_eq!(page.total, 1);
        let op = &page.operations[0];
        assert_eq!(op.kind, OperationKind::Move);
        assert_eq!(op.status, OperationStatus::Applied);
        assert_eq!(op.destination.as_deref(), Some(&*filed.to_string_lossy()));

        let entry = entry_for(&h, "invoice.pdf");
        assert_eq!(entry.state, FileState::Learned);
        assert_eq!(entry.operation_id.as_deref(), Some(op.id.as_str()));
        assert_eq!(h.learning.stats().total_events, 1);

        h.journal.undo(&op.id).unwrap();
        assert!(invoice.exists());
        assert_eq!(file_service::stat_file(&invoice).unwrap().hash, hash_before);
    }

    #[tokio::test]
    async fn oversized_file_is_skipped_without_classification() {
        let h = harness();
        let big = fs::File::create(h.staging.join("footage.mov")).unwrap();
        big.set_len(50 * 1024 * 1024).unwrap();

        let scan = h.orchestrator.trigger_scan(&[]).unwrap();
        assert_eq!(scan.admission_skips, 1);
        assert_eq!(scan.discovered, 0);
        h.orchestrator.process_staged().await.unwrap();
        assert_eq!(h.classifier.call_count(), 0);

        let entry = entry_for(&h, "footage.mov");
        assert_eq!(entry.state, FileState::Skipped);
        let reasoning = entry.reasoning.unwrap();
        assert!(reasoning.starts_with("Admission rejected"), "{reasoning}");
        assert!(reasoning.contains("limit"));

        let events = repository::list_learning_events_after(&data::lock(&h.db), 0).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1.source, EventSource::Admission);
        assert_eq!(events[0].1.confidence, None);
        assert_eq!(h.learning.stats().admission_skips, 1);

        // A second scan of the unchanged file records nothing new.
        h.orchestrator.trigger_scan(&[]).unwrap();
        assert_eq!(h.learning.stats().total_events, 1);
    }

    #[tokio::test]
    async fn analyzer_timeout_goes_to_review_without_operation() {
        let h = harness_with(|s| s.classify_timeout_secs = 1);
        fs::write(h.staging.join("slow.txt"), "text").unwrap();
        h.classifier.script("slow.txt", Scripted::Hang);

        h.orchestrator.trigger_scan(&[]).unwrap();
        let batch = h.orchestrator.process_staged().await.unwrap();
        assert_eq!(batch.awaiting_user, 1);

        let reviews = h.orchestrator.pending_reviews().unwrap();
        assert_eq!(reviews.len(), 1);
        assert!(reviews[0].reasoning.contains("timed out"), "{}", reviews[0].reasoning);
        assert_eq!(h.journal.history(&HistoryFilter::default()).unwrap().total, 0);
    }

    #[tokio::test]
    async fn unavailable_analyzer_reports_cause() {
        let h = harness();
        fs::write(h.staging.join("scan.png"), "png").unwrap();
        h.classifier
            .script("scan.png", Scripted::Unavailable("vision model offline".into()));

        h.orchestrator.trigger_scan(&[]).unwrap();
        h.orchestrator.process_staged().await.unwrap();

        let reviews = h.orchestrator.pending_reviews().unwrap();
        assert!(reviews[0].reasoning.contains("vision model offline"));
        assert!(reviews[0].result.is_none());
    }

    #[tokio::test]
    async fn unknown_category_is_never_auto_filed() {
        let h = harness();
        h.mode.set(ConfidenceMode::Always).unwrap();
        fs::write(h.staging.join("mystery.dat"), "??").unwrap();
        h.classifier.answer("mystery.dat", "unknown", 0.99, Modality::Unknown);

        h.orchestrator.trigger_scan(&[]).unwrap();
        let batch = h.orchestrator.process_staged().await.unwrap();
        assert_eq!(batch.auto_filed, 0);
        assert_eq!(batch.awaiting_user, 1);
        assert!(h.staging.join("mystery.dat").exists());
    }

    #[tokio::test]
    async fn low_confidence_in_smart_mode_is_skipped_and_learned() {
        let h = harness();
        fs::write(h.staging.join("blurry.jpg"), "jpg").unwrap();
        h.classifier.answer("blurry.jpg", "images", 0.2, Modality::Image);

        h.orchestrator.trigger_scan(&[]).unwrap();
        let batch = h.orchestrator.process_staged().await.unwrap();
        assert_eq!(batch.skipped, 1);
        assert_eq!(entry_for(&h, "blurry.jpg").state, FileState::Skipped);
        let stats = h.learning.stats();
        assert_eq!(stats.total_events, 1);
        assert_eq!(stats.average_confidence(), Some(0.2));
    }

    #[tokio::test]
    async fn reclassified_review_files_under_user_category() {
        let h = harness();
        fs::write(h.staging.join("w2.pdf"), "wages").unwrap();
        h.classifier.answer("w2.pdf", "documents", 0.55, Modality::Text);

        h.orchestrator.trigger_scan(&[]).unwrap();
        h.orchestrator.process_staged().await.unwrap();
        let review = h.orchestrator.pending_reviews().unwrap().remove(0);
        assert_eq!(review.result.as_ref().unwrap().category.as_str(), "documents");

        let outcome = h
            .orchestrator
            .resolve_review(&review.file_id, ReviewChoice::Reclassify(Category::lenient("Taxes")))
            .await
            .unwrap();
        assert!(matches!(outcome, FileOutcome::Filed { .. }));
        assert!(h.settings.library_root.join("taxes/w2.pdf").exists());

        let documents = h.learning.stats();
        let counts = documents.category(&Category::lenient("documents")).unwrap();
        assert_eq!(counts.overridden, 1);
        assert!(h
            .orchestrator
            .category_hints("ta")
            .contains(&Category::lenient("taxes")));

        // Resolving twice is refused.
        assert!(h
            .orchestrator
            .resolve_review(&review.file_id, ReviewChoice::Skip)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn accept_without_result_is_refused() {
        let h = harness();
        fs::write(h.staging.join("x.txt"), "x").unwrap();
        h.classifier.script("x.txt", Scripted::Unavailable("down".into()));
        h.orchestrator.trigger_scan(&[]).unwrap();
        h.orchestrator.process_staged().await.unwrap();
        let review = h.orchestrator.pending_reviews().unwrap().remove(0);

        assert!(h
            .orchestrator
            .resolve_review(&review.file_id, ReviewChoice::Accept)
            .await
            .is_err());
        assert_eq!(entry_for(&h, "x.txt").state, FileState::AwaitingUser);
    }

    #[tokio::test]
    async fn rescans_do_not_duplicate_work() {
        let h = harness();
        fs::write(h.staging.join("a.txt"), "a").unwrap();

        let first = h.orchestrator.trigger_scan(&[]).unwrap();
        let second = h.orchestrator.trigger_scan(&[]).unwrap();
        assert_eq!(first.discovered, 1);
        assert_eq!(second.discovered, 0);
        assert_eq!(second.unchanged, 1);
        assert!(second.generation > first.generation);
    }

    #[tokio::test]
    async fn name_collisions_get_a_counter() {
        let h = harness();
        let existing = h.settings.library_root.join("financial/invoice.pdf");
        fs::create_dir_all(existing.parent().unwrap()).unwrap();
        fs::write(&existing, "older").unwrap();
        fs::write(h.staging.join("invoice.pdf"), "newer").unwrap();
        h.classifier.answer("invoice.pdf", "financial", 0.99, Modality::Text);

        h.orchestrator.trigger_scan(&[]).unwrap();
        h.orchestrator.process_staged().await.unwrap();

        assert_eq!(fs::read_to_string(&existing).unwrap(), "older");
        assert!(h
            .settings
            .library_root
            .join("financial/invoice (1).pdf")
            .exists());
    }

    #[tokio::test]
    async fn cancel_all_skips_in_flight_files() {
        let h = harness();
        fs::write(h.staging.join("stuck.txt"), "x").unwrap();
        h.classifier.script("stuck.txt", Scripted::Hang);
        h.orchestrator.trigger_scan(&[]).unwrap();

        let orchestrator = h.orchestrator.clone();
        let batch = tokio::spawn(async move { orchestrator.process_staged().await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.orchestrator.cancel_all(), 1);

        let report = batch.await.unwrap().unwrap();
        assert_eq!(report.cancelled, 1);
        let entry = entry_for(&h, "stuck.txt");
        assert_eq!(entry.state, FileState::Skipped);
        assert!(entry.reasoning.unwrap().starts_with("Cancelled"));
        assert_eq!(h.journal.history(&HistoryFilter::default()).unwrap().total, 0);
    }

    #[tokio::test]
    async fn cancel_file_skips_queued_entry() {
        let h = harness();
        fs::write(h.staging.join("later.txt"), "x").unwrap();
        h.orchestrator.trigger_scan(&[]).unwrap();
        let id = entry_for(&h, "later.txt").id;

        assert!(h.orchestrator.cancel_file(&id).unwrap());
        assert!(!h.orchestrator.cancel_file(&id).unwrap());
        let batch = h.orchestrator.process_staged().await.unwrap();
        assert_eq!(batch.processed, 0);
        assert_eq!(h.classifier.call_count(), 0);
    }

    #[tokio::test]
    async fn scheduled_tick_scans_and_files() {
        let h = harness();
        fs::write(h.staging.join("song.mp3"), "ID3").unwrap();
        h.classifier.answer("song.mp3", "audio", 0.9, Modality::Audio);

        h.orchestrator
            .clone()
            .run_scheduled(tokio::time::sleep(Duration::from_millis(500)))
            .await
            .unwrap();

        assert!(h.settings.library_root.join("audio/song.mp3").exists());
        let checkpoint = repository::load_stats_checkpoint(&data::lock(&h.db))
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.total_events, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_named_files_from_several_dirs_are_all_filed() {
        let h = harness();
        let dirs: Vec<PathBuf> = (0..4)
            .map(|i| {
                let dir = h._dir.path().join(format!("downloads-{i}"));
                fs::create_dir_all(&dir).unwrap();
                fs::write(dir.join("invoice.pdf"), format!("invoice {i}")).unwrap();
                dir
            })
            .collect();
        h.classifier.answer("invoice.pdf", "financial", 0.99, Modality::Text);

        assert_eq!(h.orchestrator.trigger_scan(&dirs).unwrap().discovered, 4);
        let batch = h.orchestrator.process_staged().await.unwrap();
        assert_eq!(batch.auto_filed, 4, "{batch:?}");
        assert_eq!(batch.awaiting_user, 0);

        let filed = h.settings.library_root.join("financial");
        for name in ["invoice.pdf", "invoice (1).pdf", "invoice (2).pdf", "invoice (3).pdf"] {
            assert!(filed.join(name).exists(), "missing {name}");
        }
        let pending = h
            .journal
            .history(&HistoryFilter {
                status: Some(OperationStatus::Pending),
                ..HistoryFilter::default()
            })
            .unwrap();
        assert_eq!(pending.total, 0);
    }

    #[tokio::test]
    async fn undoing_auto_filings_lowers_the_bias() {
        let h = harness();
        let financial = Category::lenient("financial");
        for i in 0..10 {
            let name = format!("statement-{i}.pdf");
            fs::write(h.staging.join(&name), format!("statement {i}")).unwrap();
            h.classifier.answer(&name, "financial", 0.92, Modality::Text);
        }
        h.orchestrator.trigger_scan(&[]).unwrap();
        assert_eq!(h.orchestrator.process_staged().await.unwrap().auto_filed, 10);
        assert!((h.learning.bias(&financial, Modality::Text) - 0.05).abs() < 1e-9);

        let filings = h.journal.history(&HistoryFilter::default()).unwrap().operations;
        assert_eq!(filings.len(), 10);
        for op in &filings {
            h.orchestrator.undo(&op.id).unwrap();
        }
        assert!(h.learning.bias(&financial, Modality::Text) < 0.0);
        let counts = h.learning.stats().category(&financial).cloned().unwrap();
        assert_eq!(counts.accepted, 0);
        assert_eq!(counts.overridden, 10);

        let undone = entry_for(&h, "statement-0.pdf");
        assert_eq!(undone.state, FileState::Skipped);
        assert!(h.staging.join("statement-0.pdf").exists());

        fs::write(h.staging.join("receipt.pdf"), "receipt").unwrap();
        h.classifier.answer("receipt.pdf", "financial", 0.66, Modality::Text);
        h.orchestrator.trigger_scan(&[]).unwrap();
        h.orchestrator.process_staged().await.unwrap();
        assert_eq!(entry_for(&h, "receipt.pdf").state, FileState::AwaitingUser);
        assert!(h.staging.join("receipt.pdf").exists());
    }

    #[tokio::test]
    async fn undoing_a_user_reclassified_filing_learns_nothing_new() {
        let h = harness();
        fs::write(h.staging.join("w2.pdf"), "wages").unwrap();
        h.classifier.answer("w2.pdf", "documents", 0.55, Modality::Text);
        h.orchestrator.trigger_scan(&[]).unwrap();
        h.orchestrator.process_staged().await.unwrap();
        let review = h.orchestrator.pending_reviews().unwrap().remove(0);
        let FileOutcome::Filed { operation_id, .. } = h
            .orchestrator
            .resolve_review(&review.file_id, ReviewChoice::Reclassify(Category::lenient("taxes")))
            .await
            .unwrap()
        else {
            panic!("expected a filing");
        };
        let events_before = h.learning.stats().total_events;

        h.orchestrator.undo(&operation_id).unwrap();
        assert_eq!(h.learning.stats().total_events, events_before);
        assert!(h.staging.join("w2.pdf").exists());
    }

    #[tokio::test]
    async fn cancel_file_refuses_once_filing_started() {
        let h = harness();
        fs::write(h.staging.join("busy.txt"), "x").unwrap();
        h.orchestrator.trigger_scan(&[]).unwrap();
        let id = entry_for(&h, "busy.txt").id;
        let flag = h.orchestrator.register_cancel_flag(&id);
        {
            let conn = data::lock(&h.db);
            repository::update_staging_entry(&conn, &id, FileState::Executing, None, None, None)
                .unwrap();
        }

        assert!(!h.orchestrator.cancel_file(&id).unwrap());
        assert!(!flag.load(Ordering::SeqCst));

        {
            let conn = data::lock(&h.db);
            repository::update_staging_entry(&conn, &id, FileState::Decided, None, None, None)
                .unwrap();
        }
        assert!(h.orchestrator.cancel_file(&id).unwrap());
        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(entry_for(&h, "busy.txt").state, FileState::Skipped);

        // A worker reaching filing afterwards loses its claim.
        let entry = entry_for(&h, "busy.txt");
        let result = ClassificationResult::new(
            Category::lenient("documents"),
            0.99,
            "Text.",
            Modality::Text,
        );
        let event = classifier_event(&entry.path, &result, DecisionAction::AutoFile, false);
        let outcome = h.orchestrator.file_entry(&entry, &result, event).await.unwrap();
        assert_eq!(outcome, FileOutcome::NotClaimed);
        assert!(h.staging.join("busy.txt").exists());
        assert_eq!(h.journal.history(&HistoryFilter::default()).unwrap().total, 0);
    }

    #[tokio::test]
    async fn recover_leaves_fresh_entries_to_their_worker() {
        let h = harness();
        fs::write(h.staging.join("fresh.txt"), "a").unwrap();
        h.orchestrator.trigger_scan(&[]).unwrap();
        let id = entry_for(&h, "fresh.txt").id;
        {
            let conn = data::lock(&h.db);
            repository::claim_staging_entry(&conn, &id, FileState::Discovered, FileState::Classifying)
                .unwrap();
        }

        let summary = h.orchestrator.recover().unwrap();
        assert_eq!(summary.requeued, 0);
        assert_eq!(summary.interrupted, 0);
        let conn = data::lock(&h.db);
        let entry = repository::get_staging_entry(&conn, &id).unwrap().unwrap();
        assert_eq!(entry.state, FileState::Classifying);
    }

    #[tokio::test]
    async fn recover_requeues_interrupted_entries() {
        let h = harness_with(|s| s.recovery_grace_secs = 0);
        fs::write(h.staging.join("a.txt"), "a").unwrap();
        h.orchestrator.trigger_scan(&[]).unwrap();
        let id = entry_for(&h, "a.txt").id;
        {
            let conn = data::lock(&h.db);
            repository::claim_staging_entry(&conn, &id, FileState::Discovered, FileState::Classifying)
                .unwrap();
        }

        let summary = h.orchestrator.recover().unwrap();
        assert_eq!(summary.requeued, 1);
        assert_eq!(entry_for(&h, "a.txt").state, FileState::Discovered);
    }
}
