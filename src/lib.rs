// Takeout Migrate - Library Entry Point

pub mod archive;
pub mod catalog;
pub mod config;
pub mod constants;
pub mod error;
pub mod hash;
pub mod import;
pub mod jobs;
pub mod metadata;
pub mod pipeline;
pub mod tools;

pub use config::{RunMode, Settings};
pub use error::{MigrateError, Result};
pub use pipeline::{Pipeline, RunOutcome, RunSummary};
