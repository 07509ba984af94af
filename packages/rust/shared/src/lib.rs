//! Shared types, error model, and configuration for LeadScout.
//!
//! This crate is the foundation depended on by all other LeadScout crates.
//! It provides:
//! - [`LeadScoutError`], the unified error type
//! - Domain types ([`ResearchJob`], [`CandidateRecord`], [`PersistedRecord`], [`Locality`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DatabaseConfig, DEFAULT_PROMPT_TEMPLATE, GeminiConfig, PollConfig, ResearchConfig,
    config_dir, config_file_path, init_config, load_config, load_config_from, validate_api_key,
};
pub use error::{LeadScoutError, Result};
pub use types::{
    AI_RESEARCH_SOURCE, CandidateRecord, JobId, JobStatus, Locality, ParseTier, PersistedRecord,
    ResearchJob, Temperature, is_blank,
};
