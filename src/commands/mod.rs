pub mod journal_commands;
pub mod pipeline_commands;
pub mod settings_commands;
