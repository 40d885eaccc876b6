use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::data::{self, repository, Db};
use crate::error::{AppError, JournalError};
use crate::models::classification::ClassificationResult;
use crate::models::operation::{
    FileFingerprint, HistoryFilter, HistoryPage, Operation, OperationKind, OperationStatus,
    OperationTransition,
};
use crate::safety::validate_mutable;
use crate::scope_path::path_within;
use crate::services::file_service;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub applied: Vec<String>,
    pub discarded: Vec<String>,
}

/// A failed [`Journal::execute`]. `operation_id` is set once a record was written.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct ExecuteFailure {
    pub operation_id: Option<String>,
    pub error: AppError,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PurgeReport {
    pub purged: Vec<String>,
    pub failed: Vec<String>,
}

pub struct Journal {
    db: Db,
    quarantine_dir: PathBuf,
    retention: chrono::Duration,
    // path -> id of the unresolved operation holding it
    in_flight: Mutex<HashMap<String, String>>,
}

enum Target<'a> {
    Path(&'a Path),
    Quarantine,
    UniqueIn(&'a Path),
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn invalid_transition(op: &Operation, expected: OperationStatus) -> AppError {
    JournalError::InvalidTransition {
        id: op.id.clone(),
        expected: expected.to_string(),
        actual: op.status.to_string(),
    }
    .into()
}

impl Journal {
    pub fn new(db: Db, quarantine_dir: PathBuf, retention: chrono::Duration) -> Self {
        Self {
            db,
            quarantine_dir,
            retention,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn claims(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, operation_id: &str) {
        self.claims().retain(|_, id| id != operation_id);
    }

    fn load(&self, operation_id: &str) -> Result<Operation, AppError> {
        let conn = data::lock(&self.db);
        repository::get_operation(&conn, operation_id)?
            .ok_or_else(|| JournalError::UnknownOperation(operation_id.to_string()).into())
    }

    /// Writes a PENDING record and claims both paths. Nothing on disk changes.
    pub fn begin(
        &self,
        kind: OperationKind,
        source: &Path,
        destination: Option<&Path>,
        classification: Option<&ClassificationResult>,
    ) -> Result<Operation, AppError> {
        let target = match (kind, destination) {
            (OperationKind::Delete, _) => Target::Quarantine,
            (_, Some(dest)) => Target::Path(dest),
            (_, None) => {
                return Err(AppError::General(format!(
                    "{kind} of {} needs a destination",
                    source.display()
                )))
            }
        };
        self.begin_record(kind, source, target, classification, None)
    }

    fn begin_record(
        &self,
        kind: OperationKind,
        source: &Path,
        target: Target<'_>,
        classification: Option<&ClassificationResult>,
        reverts: Option<&str>,
    ) -> Result<Operation, AppError> {
        validate_mutable(source)?;
        let source_fingerprint = file_service::stat_file(source)?;
        let id = uuid::Uuid::new_v4().to_string();

        let key = path_key(source);
        let mut claims = self.claims();
        if claims.contains_key(&key) {
            return Err(JournalError::PathBusy(key).into());
        }
        let destination = match target {
            Target::Path(dest) => dest.to_path_buf(),
            Target::Quarantine => file_service::quarantine_path(&self.quarantine_dir, &id, source),
            Target::UniqueIn(dir) => {
                let file_name = source
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| id.clone());
                file_service::unique_destination(dir, &file_name, |p| {
                    claims.contains_key(&path_key(p))
                })
            }
        };
        validate_mutable(&destination)?;
        let destination_key = path_key(&destination);
        if claims.contains_key(&destination_key) {
            return Err(JournalError::PathBusy(destination_key).into());
        }
        let now = Utc::now();
        let op = Operation {
            id,
            kind,
            source: key.clone(),
            destination: Some(destination_key.clone()),
            status: OperationStatus::Pending,
            created_at: now,
            updated_at: now,
            source_fingerprint: Some(source_fingerprint),
            destination_fingerprint: None,
            reverts: reverts.map(str::to_string),
            classification: classification.cloned(),
        };
        {
            let conn = data::lock(&self.db);
            if repository::find_pending_for_source(&conn, &key)?.is_some() {
                return Err(JournalError::PathBusy(key).into());
            }
            let note = if reverts.is_some() { "begin undo" } else { "begin" };
            repository::insert_operation(&conn, &op, Some(note))?;
        }
        claims.insert(key, op.id.clone());
        claims.insert(destination_key, op.id.clone());
        drop(claims);

        tracing::info!(
            operation_id = %op.id,
            kind = %op.kind,
            source = %op.source,
            destination = ?op.destination,
            "operation begun"
        );
        Ok(op)
    }

    pub fn perform(&self, op: &Operation) -> Result<(), AppError> {
        if op.status != OperationStatus::Pending {
            return Err(invalid_transition(op, OperationStatus::Pending));
        }
        let source = Path::new(&op.source);
        let destination = op
            .destination
            .as_deref()
            .map(Path::new)
            .ok_or_else(|| AppError::General(format!("operation {} has no destination", op.id)))?;

        match op.kind {
            OperationKind::Move if path_within(source, &self.quarantine_dir) => {
                file_service::restore_from_quarantine(source, destination)
            }
            OperationKind::Move => file_service::move_file(source, destination),
            OperationKind::Copy => file_service::copy_file(source, destination),
            OperationKind::Delete => file_service::quarantine_file(source, destination),
        }
    }

    fn took_effect(&self, op: &Operation) -> bool {
        let Some(destination) = op.destination.as_deref().map(Path::new) else {
            return false;
        };
        let source = Path::new(&op.source);
        match op.kind {
            OperationKind::Move | OperationKind::Delete => {
                destination.is_file() && !source.exists()
            }
            OperationKind::Copy => match (&op.source_fingerprint, file_service::stat_file(destination)) {
                (Some(expected), Ok(actual)) => expected.hash == actual.hash,
                _ => false,
            },
        }
    }

    fn destination_fingerprint(op: &Operation) -> Result<FileFingerprint, AppError> {
        let destination = op
            .destination
            .as_deref()
            .ok_or_else(|| AppError::General(format!("operation {} has no destination", op.id)))?;
        file_service::stat_file(Path::new(destination))
    }

    /// PENDING -> APPLIED, only once the effect is verified on disk.
    pub fn commit(&self, operation_id: &str) -> Result<Operation, AppError> {
        let op = self.load(operation_id)?;
        if op.status != OperationStatus::Pending {
            tracing::error!(operation_id, status = %op.status, "commit of non-pending operation");
            return Err(invalid_transition(&op, OperationStatus::Pending));
        }
        if !self.took_effect(&op) {
            tracing::error!(operation_id, "commit before the mutation took effect");
            return Err(JournalError::NotVerified(op.id.clone()).into());
        }
        let fingerprint = Self::destination_fingerprint(&op)?;
        let result = self.finish(&op, &fingerprint, "commit");
        self.release(&op.id);
        result
    }

    fn finish(
        &self,
        op: &Operation,
        fingerprint: &FileFingerprint,
        note: &str,
    ) -> Result<Operation, AppError> {
        let conn = data::lock(&self.db);
        let changed = match op.reverts.as_deref() {
            Some(original) => {
                repository::complete_undo(&conn, &op.id, fingerprint, original, Some(note))?
            }
            None => repository::transition_operation(
                &conn,
                &op.id,
                OperationStatus::Pending,
                OperationStatus::Applied,
                Some(fingerprint),
                Some(note),
            )?,
        };
        let current = repository::get_operation(&conn, &op.id)?
            .ok_or_else(|| AppError::from(JournalError::UnknownOperation(op.id.clone())))?;
        if !changed {
            tracing::error!(operation_id = %op.id, status = %current.status, "lost the race to apply");
            return Err(invalid_transition(&current, OperationStatus::Pending));
        }
        tracing::info!(operation_id = %op.id, kind = %op.kind, note, "operation applied");
        Ok(current)
    }

    /// Releases the claim after a failed filesystem call. The record stays PENDING.
    pub fn fail(&self, operation_id: &str, cause: &AppError) -> Result<(), AppError> {
        let op = self.load(operation_id)?;
        self.release(&op.id);
        tracing::warn!(
            operation_id,
            source = %op.source,
            error = %cause,
            "operation failed; left pending for retry or recovery"
        );
        Ok(())
    }

    fn discard(&self, op: &Operation, cause: &AppError) {
        let note = format!("discarded: {cause}");
        let discarded = {
            let conn = data::lock(&self.db);
            repository::transition_operation(
                &conn,
                &op.id,
                OperationStatus::Pending,
                OperationStatus::Discarded,
                None,
                Some(&note),
            )
        };
        match discarded {
            Ok(true) => tracing::warn!(operation_id = %op.id, error = %cause, "operation discarded"),
            Ok(false) => {}
            Err(e) => tracing::error!(operation_id = %op.id, error = %e, "could not discard operation"),
        }
        self.release(&op.id);
    }

    fn preflight(op: &Operation) -> Result<(), AppError> {
        if !Path::new(&op.source).is_file() {
            return Err(AppError::Filesystem(format!(
                "source does not exist: {}",
                op.source
            )));
        }
        match op.destination.as_deref() {
            Some(dest) if Path::new(dest).exists() => Err(AppError::Filesystem(format!(
                "destination already exists: {dest}"
            ))),
            Some(_) => Ok(()),
            None => Err(AppError::General(format!(
                "operation {} has no destination",
                op.id
            ))),
        }
    }

    pub fn execute(
        &self,
        kind: OperationKind,
        source: &Path,
        destination: Option<&Path>,
        classification: Option<&ClassificationResult>,
    ) -> Result<Operation, ExecuteFailure> {
        let op = self
            .begin(kind, source, destination, classification)
            .map_err(|error| ExecuteFailure {
                operation_id: None,
                error,
            })?;
        self.run(op)
    }

    pub fn execute_into(
        &self,
        source: &Path,
        dir: &Path,
        classification: Option<&ClassificationResult>,
    ) -> Result<Operation, ExecuteFailure> {
        let op = self
            .begin_record(
                OperationKind::Move,
                source,
                Target::UniqueIn(dir),
                classification,
                None,
            )
            .map_err(|error| ExecuteFailure {
                operation_id: None,
                error,
            })?;
        self.run(op)
    }

    fn run(&self, op: Operation) -> Result<Operation, ExecuteFailure> {
        if let Err(error) = Self::preflight(&op) {
            self.discard(&op, &error);
            return Err(ExecuteFailure {
                operation_id: Some(op.id),
                error,
            });
        }
        let outcome = self.perform(&op).and_then(|()| self.commit(&op.id));
        outcome.map_err(|error| {
            if let Err(fail_err) = self.fail(&op.id, &error) {
                tracing::error!(operation_id = %op.id, error = %fail_err, "could not release failed operation");
            }
            ExecuteFailure {
                operation_id: Some(op.id.clone()),
                error,
            }
        })
    }

    pub fn undo(&self, operation_id: &str) -> Result<Operation, AppError> {
        let original = self.load(operation_id)?;
        if original.status != OperationStatus::Applied {
            tracing::error!(operation_id, status = %original.status, "undo of non-applied operation");
            return Err(invalid_transition(&original, OperationStatus::Applied));
        }
        let destination = original.destination.clone().ok_or_else(|| AppError::NotReversible {
            operation_id: original.id.clone(),
            diff: vec!["no destination was recorded".to_string()],
        })?;

        let current = file_service::stat_file(Path::new(&destination)).map_err(|_| {
            AppError::NotReversible {
                operation_id: original.id.clone(),
                diff: vec![format!("{destination} no longer exists")],
            }
        })?;
        if let Some(expected) = &original.destination_fingerprint {
            let diff = expected.diff(&current);
            if !diff.is_empty() {
                return Err(AppError::NotReversible {
                    operation_id: original.id.clone(),
                    diff,
                });
            }
        }
        if original.kind != OperationKind::Copy && Path::new(&original.source).exists() {
            return Err(AppError::NotReversible {
                operation_id: original.id.clone(),
                diff: vec![format!("{} is occupied", original.source)],
            });
        }

        let (kind, restore_to) = match original.kind {
            OperationKind::Move | OperationKind::Delete => {
                (OperationKind::Move, Some(PathBuf::from(&original.source)))
            }
            OperationKind::Copy => (OperationKind::Delete, None),
        };
        let target = match restore_to.as_deref() {
            Some(path) => Target::Path(path),
            None => Target::Quarantine,
        };
        let record = self.begin_record(
            kind,
            Path::new(&destination),
            target,
            original.classification.as_ref(),
            Some(&original.id),
        )?;

        let outcome = self
            .perform(&record)
            .and_then(|()| self.verify_restored(&original, &record))
            .and_then(|fingerprint| self.finish(&record, &fingerprint, "undo"));
        match outcome {
            Ok(applied) => {
                self.release(&record.id);
                tracing::info!(operation_id, undo_id = %applied.id, "operation undone");
                Ok(applied)
            }
            Err(e) => {
                self.fail(&record.id, &e)?;
                Err(e)
            }
        }
    }

    fn verify_restored(
        &self,
        original: &Operation,
        record: &Operation,
    ) -> Result<FileFingerprint, AppError> {
        if !self.took_effect(record) {
            return Err(JournalError::NotVerified(record.id.clone()).into());
        }
        let restored = Self::destination_fingerprint(record)?;
        let expected = match original.kind {
            OperationKind::Copy => original.destination_fingerprint.as_ref(),
            _ => original.source_fingerprint.as_ref(),
        };
        if let Some(expected) = expected {
            if expected.hash != restored.hash {
                return Err(AppError::NotReversible {
                    operation_id: original.id.clone(),
                    diff: vec![format!(
                        "restored content hash {} does not match {}",
                        &restored.hash[..restored.hash.len().min(12)],
                        &expected.hash[..expected.hash.len().min(12)]
                    )],
                });
            }
        }
        Ok(restored)
    }

    pub fn retry(&self, operation_id: &str) -> Result<Operation, AppError> {
        let op = self.load(operation_id)?;
        if op.status != OperationStatus::Pending {
            return Err(invalid_transition(&op, OperationStatus::Pending));
        }
        {
            let mut claims = self.claims();
            let paths: Vec<&String> = std::iter::once(&op.source).chain(&op.destination).collect();
            if let Some(busy) = paths.iter().find(|p| claims.contains_key(p.as_str())) {
                return Err(JournalError::PathBusy((*busy).clone()).into());
            }
            for path in paths {
                claims.insert(path.clone(), op.id.clone());
            }
        }

        let outcome = if self.took_effect(&op) {
            Ok(())
        } else {
            if let Err(e) = self.check_source_unchanged(&op) {
                self.fail(&op.id, &e)?;
                return Err(e);
            }
            if let Err(e) = Self::preflight(&op) {
                self.discard(&op, &e);
                return Err(e);
            }
            self.perform(&op)
        };
        let outcome = outcome
            .and_then(|()| Self::destination_fingerprint(&op))
            .and_then(|fingerprint| self.finish(&op, &fingerprint, "retry"));
        match outcome {
            Ok(applied) => {
                self.release(&op.id);
                Ok(applied)
            }
            Err(e) => {
                self.fail(&op.id, &e)?;
                Err(e)
            }
        }
    }

    fn check_source_unchanged(&self, op: &Operation) -> Result<(), AppError> {
        let Some(expected) = &op.source_fingerprint else {
            return Ok(());
        };
        let current = file_service::stat_file(Path::new(&op.source))?;
        if expected.hash != current.hash || expected.size != current.size {
            return Err(AppError::Filesystem(format!(
                "{} changed since operation {} was begun",
                op.source, op.id
            )));
        }
        Ok(())
    }

    pub fn history(&self, filter: &HistoryFilter) -> Result<HistoryPage, AppError> {
        let conn = data::lock(&self.db);
        repository::query_history(&conn, filter)
    }

    pub fn get(&self, operation_id: &str) -> Result<Operation, AppError> {
        self.load(operation_id)
    }

    pub fn transitions(&self, operation_id: &str) -> Result<Vec<OperationTransition>, AppError> {
        self.load(operation_id)?;
        let conn = data::lock(&self.db);
        repository::list_transitions(&conn, operation_id)
    }

    pub fn recover(&self, grace: chrono::Duration) -> Result<RecoveryReport, AppError> {
        self.recover_at(grace, Utc::now())
    }

    pub fn recover_at(
        &self,
        grace: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<RecoveryReport, AppError> {
        let stale = {
            let conn = data::lock(&self.db);
            repository::list_pending_before(&conn, now - grace)?
        };
        let mut report = RecoveryReport::default();

        for op in stale {
            if self.claims().values().any(|id| id == &op.id) {
                continue;
            }
            if self.took_effect(&op) {
                let applied = Self::destination_fingerprint(&op).and_then(|fingerprint| {
                    self.finish(&op, &fingerprint, "recovered: mutation found on disk")
                });
                match applied {
                    Ok(_) => report.applied.push(op.id),
                    Err(e) => {
                        tracing::warn!(operation_id = %op.id, error = %e, "could not recover operation")
                    }
                }
            } else {
                let conn = data::lock(&self.db);
                if repository::transition_operation(
                    &conn,
                    &op.id,
                    OperationStatus::Pending,
                    OperationStatus::Discarded,
                    None,
                    Some("recovered: mutation not found on disk"),
                )? {
                    tracing::info!(operation_id = %op.id, "discarded unapplied operation");
                    report.discarded.push(op.id);
                }
            }
        }

        if !report.applied.is_empty() || !report.discarded.is_empty() {
            tracing::info!(
                applied = report.applied.len(),
                discarded = report.discarded.len(),
                "journal recovery finished"
            );
        }
        Ok(report)
    }

    pub fn purge_expired(&self) -> Result<PurgeReport, AppError> {
        self.purge_expired_at(Utc::now())
    }

    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> Result<PurgeReport, AppError> {
        let expired = {
            let conn = data::lock(&self.db);
            repository::list_expired_deletes(&conn, now - self.retention)?
        };
        let mut report = PurgeReport::default();

        for op in expired {
            let purged = op
                .destination
                .as_deref()
                .map(|d| file_service::purge_quarantined(Path::new(d)))
                .unwrap_or(Ok(()));
            if let Err(e) = purged {
                tracing::warn!(operation_id = %op.id, error = %e, "could not purge quarantined file");
                report.failed.push(op.id);
                continue;
            }
            let conn = data::lock(&self.db);
            if repository::transition_operation(
                &conn,
                &op.id,
                OperationStatus::Applied,
                OperationStatus::Permanent,
                None,
                Some("retention expired"),
            )? {
                report.purged.push(op.id);
            }
        }
        Ok(report)
    }
}
