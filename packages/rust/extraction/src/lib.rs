//! Record extraction agents.
//!
//! This crate provides:
//! - [`ExtractionAgent`]: the contract the retry orchestrator drives
//! - [`ExtractionError`]: transient (retryable) vs fatal fetch failures
//! - [`HttpTableAgent`]: fetches HTML list/detail pages and reads their tables
//! - [`ScriptedAgent`]: deterministic per-record responses

pub mod agent;
pub mod http;
pub mod scripted;

pub use agent::{ExtractionAgent, ExtractionError};
pub use http::{HttpTableAgent, parse_basic_list, parse_detail};
pub use scripted::ScriptedAgent;
