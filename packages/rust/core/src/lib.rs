//! Reconciliation engine for recsync.
//!
//! This crate ties the extraction agent, the row store, and the settings
//! store together:
//! - [`retry`] drives an agent over a record set with bounded, pass-based retries
//! - [`filter`] evaluates filter predicates and builds filtered exports
//! - [`controller`] sequences a whole run and reports progress
//! - [`progress`] is the observer contract for rendering progress events

pub mod controller;
pub mod filter;
pub mod progress;
pub mod retry;

pub use controller::{
    ExportReport, RecipientReport, RunController, RunReport, RunStatus, export_filtered,
};
pub use filter::{ColumnLookup, ExportTable, export, matches, predicate_holds};
pub use progress::{ProgressObserver, RecordingProgress, SilentProgress};
pub use retry::{
    PermanentFailure, RecordSink, RecordState, RetryOrchestrator, RetryOutcome, RetryPolicy,
};
