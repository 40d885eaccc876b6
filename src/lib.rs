pub mod commands;
pub mod config;
pub mod data;
pub mod error;
pub mod models;
pub mod safety;
pub(crate) mod scope_path;
pub mod services;
pub mod state;

pub use config::Settings;
pub use error::AppError;
pub use state::AppState;
