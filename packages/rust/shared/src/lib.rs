//! Shared types, error model, and configuration for recsync.
//!
//! This crate is the foundation depended on by all other recsync crates.
//! It provides:
//! - [`RecsyncError`]: the unified error type
//! - Domain types ([`RecordIdentity`], [`FieldMap`], [`FilterSetting`], [`ProgressEvent`])
//! - Configuration ([`AppConfig`], [`RunConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AgentConfig, AppConfig, OutputConfig, RunConfig, RunSection, SettingsConfig, config_dir,
    config_file_path, expand_home, init_config, load_config, load_config_from,
};
pub use error::{RecsyncError, Result};
pub use types::{
    BasicRecord, DEFAULT_DETAIL_SUFFIX, FieldMap, FilterOperator, FilterSetting, FilterSettings,
    ProgressEvent, ProgressLevel, RecordIdentity, RunId, detail_column_name, is_detail_column,
};
