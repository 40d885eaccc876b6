pub mod classifier_service;
pub mod file_service;
pub mod journal_service;
pub mod learning_service;
pub mod orchestrator_service;
pub mod policy_service;
pub mod scanner_service;
