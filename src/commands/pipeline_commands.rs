use std::path::PathBuf;

use crate::error::AppError;
use crate::models::classification::Category;
use crate::models::staging::{ReviewChoice, ReviewItem};
use crate::services::orchestrator_service::{BatchReport, FileOutcome, ScanReport};
use crate::state::AppState;

pub fn trigger_scan(dirs: Vec<String>, state: &AppState) -> Result<ScanReport, AppError> {
    let dirs: Vec<PathBuf> = dirs.into_iter().map(PathBuf::from).collect();
    for dir in &dirs {
        if !dir.is_dir() {
            return Err(AppError::General(format!(
                "not a directory: {}",
                dir.display()
            )));
        }
    }
    state.orchestrator.trigger_scan(&dirs)
}

pub async fn process_staged(state: &AppState) -> Result<BatchReport, AppError> {
    state.orchestrator.process_staged().await
}

pub fn pending_reviews(state: &AppState) -> Result<Vec<ReviewItem>, AppError> {
    state.orchestrator.pending_reviews()
}

/// `category` set means reclassify; otherwise `skip` decides between skipping and
/// accepting the proposal.
pub async fn resolve_review(
    file_id: String,
    category: Option<String>,
    skip: bool,
    state: &AppState,
) -> Result<FileOutcome, AppError> {
    let choice = match (category, skip) {
        (Some(_), true) => {
            return Err(AppError::General(
                "choose either a category or skip, not both".to_string(),
            ))
        }
        (Some(raw), false) => ReviewChoice::Reclassify(Category::new(&raw)?),
        (None, true) => ReviewChoice::Skip,
        (None, false) => ReviewChoice::Accept,
    };
    state.orchestrator.resolve_review(&file_id, choice).await
}

pub fn cancel_file(file_id: String, state: &AppState) -> Result<bool, AppError> {
    state.orchestrator.cancel_file(&file_id)
}

pub fn cancel_all(state: &AppState) -> Result<usize, AppError> {
    Ok(state.orchestrator.cancel_all())
}

pub fn category_hints(prefix: Option<String>, state: &AppState) -> Result<Vec<Category>, AppError> {
    Ok(state
        .orchestrator
        .category_hints(prefix.as_deref().unwrap_or("")))
}
