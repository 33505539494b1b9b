//! Artifact and settings storage for recsync.
//!
//! - [`SchemaRegistry`]: append-only ordered column set
//! - [`RowStore`]: composite-key upserts over a delimited artifact file,
//!   rewritten whole after every successful record
//! - [`FileSettingsStore`]: column visibility, filter settings, and default
//!   headers kept as flat delimited files

pub mod rows;
pub mod schema;
pub mod settings;

pub use rows::{IdentityColumns, RowStore, RowView, UpsertOutcome, UpsertReport};
pub use schema::SchemaRegistry;
pub use settings::{
    BUILTIN_DEFAULT_HEADERS, ColumnVisibility, FileSettingsStore, SettingsStore,
    default_column_visibility, default_filter_settings, is_visible,
};
