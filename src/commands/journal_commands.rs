use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::models::operation::{
    HistoryFilter, HistoryPage, Operation, OperationStatus, OperationTransition,
};
use crate::services::journal_service::PurgeReport;
use crate::services::orchestrator_service::RecoverySummary;
use crate::state::AppState;

/// Journal contract violations point at a caller bug; they are logged loudly before
/// being returned.
fn log_journal_error<T>(action: &str, result: Result<T, AppError>) -> Result<T, AppError> {
    if let Err(AppError::Journal(e)) = &result {
        tracing::error!(action, error = %e, "journal contract violated");
    }
    result
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub path_prefix: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl HistoryRequest {
    fn into_filter(self) -> Result<HistoryFilter, AppError> {
        let status = self
            .status
            .map(|s| s.parse::<OperationStatus>())
            .transpose()
            .map_err(AppError::General)?;
        Ok(HistoryFilter {
            since: self.since,
            until: self.until,
            path_prefix: self.path_prefix,
            status,
            limit: self.limit,
            offset: self.offset.unwrap_or(0),
        })
    }
}

pub fn operation_history(request: HistoryRequest, state: &AppState) -> Result<HistoryPage, AppError> {
    state.journal.history(&request.into_filter()?)
}

pub fn get_operation(operation_id: String, state: &AppState) -> Result<Operation, AppError> {
    log_journal_error("get", state.journal.get(&operation_id))
}

pub fn undo_operation(operation_id: String, state: &AppState) -> Result<Operation, AppError> {
    log_journal_error("undo", state.orchestrator.undo(&operation_id))
}

pub fn retry_operation(operation_id: String, state: &AppState) -> Result<Operation, AppError> {
    log_journal_error("retry", state.journal.retry(&operation_id))
}

pub fn operation_transitions(
    operation_id: String,
    state: &AppState,
) -> Result<Vec<OperationTransition>, AppError> {
    log_journal_error("transitions", state.journal.transitions(&operation_id))
}

pub fn recover(state: &AppState) -> Result<RecoverySummary, AppError> {
    log_journal_error("recover", state.orchestrator.recover())
}

pub fn purge_expired(state: &AppState) -> Result<PurgeReport, AppError> {
    log_journal_error("purge", state.orchestrator.purge_expired())
}
