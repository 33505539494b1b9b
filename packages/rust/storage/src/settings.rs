//! Flat-file configuration store for column visibility, filters, and default headers.
//!
//! Loading never fails: a missing file is created with built-in defaults, and
//! an unreadable or malformed file is replaced in memory by the defaults with
//! a warning. Saving reports errors to the caller.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use recsync_shared::{FilterOperator, FilterSetting, FilterSettings, RecsyncError, Result};
use tracing::{debug, info, warn};

const VISIBILITY_FILE: &str = "column_visibility.csv";
const FILTERS_FILE: &str = "filters.csv";
const DEFAULT_HEADERS_FILE: &str = "default_headers.csv";

/// Columns shown in a fresh installation, in artifact order.
pub const BUILTIN_DEFAULT_HEADERS: [&str; 9] = [
    "Email",
    "Application Number",
    "Action",
    "Chapter",
    "Due Date",
    "Received Date",
    "Status",
    "Comments",
    "Checkbox",
];

/// `column -> visible` mapping.
pub type ColumnVisibility = IndexMap<String, bool>;

/// Whether `column` is visible. Columns never configured default to visible.
pub fn is_visible(visibility: &ColumnVisibility, column: &str) -> bool {
    visibility.get(column).copied().unwrap_or(true)
}

/// Persistent user settings consumed by the run controller and the CLI.
pub trait SettingsStore: Send + Sync {
    fn load_column_visibility(&self) -> ColumnVisibility;
    fn save_column_visibility(&self, visibility: &ColumnVisibility) -> Result<()>;
    fn load_filter_settings(&self) -> FilterSettings;
    fn save_filter_settings(&self, filters: &FilterSettings) -> Result<()>;
    fn load_default_headers(&self) -> Vec<String>;
}

/// Built-in column visibility: every default header visible.
pub fn default_column_visibility() -> ColumnVisibility {
    BUILTIN_DEFAULT_HEADERS
        .iter()
        .map(|h| (h.to_string(), true))
        .collect()
}

/// Built-in filters: every default header present but disabled.
pub fn default_filter_settings() -> FilterSettings {
    BUILTIN_DEFAULT_HEADERS
        .iter()
        .map(|h| (h.to_string(), FilterSetting::default()))
        .collect()
}

fn default_headers() -> Vec<String> {
    BUILTIN_DEFAULT_HEADERS.iter().map(|h| h.to_string()).collect()
}

/// [`SettingsStore`] backed by delimited files in one directory.
#[derive(Debug, Clone)]
pub struct FileSettingsStore {
    dir: PathBuf,
}

impl FileSettingsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    /// Read `file`, or create it from `defaults` when it does not exist.
    ///
    /// `parse` returns `None` for malformed content, which falls back to the defaults.
    fn load_or_default<T>(
        &self,
        file: &str,
        defaults: impl FnOnce() -> T,
        parse: impl FnOnce(Vec<Vec<String>>) -> Option<T>,
        write: impl FnOnce(&Self, &T) -> Result<()>,
    ) -> T {
        let path = self.path(file);
        if !path.exists() {
            let value = defaults();
            match write(self, &value) {
                Ok(()) => info!(path = %path.display(), "created default settings file"),
                Err(e) => warn!(path = %path.display(), error = %e, "could not create default settings file"),
            }
            return value;
        }

        match read_records(&path) {
            Ok(records) => match parse(records) {
                Some(value) => {
                    debug!(path = %path.display(), "loaded settings");
                    value
                }
                None => {
                    warn!(path = %path.display(), "malformed settings file, using defaults");
                    defaults()
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read settings file, using defaults");
                defaults()
            }
        }
    }
}

impl SettingsStore for FileSettingsStore {
    fn load_column_visibility(&self) -> ColumnVisibility {
        self.load_or_default(
            VISIBILITY_FILE,
            default_column_visibility,
            parse_visibility,
            |store, v| store.save_column_visibility(v),
        )
    }

    fn save_column_visibility(&self, visibility: &ColumnVisibility) -> Result<()> {
        let records = visibility
            .iter()
            .map(|(column, visible)| vec![column.clone(), if *visible { "1" } else { "0" }.into()]);
        write_records(&self.path(VISIBILITY_FILE), records)
    }

    fn load_filter_settings(&self) -> FilterSettings {
        self.load_or_default(
            FILTERS_FILE,
            default_filter_settings,
            parse_filters,
            |store, f| store.save_filter_settings(f),
        )
    }

    fn save_filter_settings(&self, filters: &FilterSettings) -> Result<()> {
        let records = filters.iter().map(|(column, setting)| {
            vec![
                column.clone(),
                setting.operator.to_string(),
                setting.value.clone(),
            ]
        });
        write_records(&self.path(FILTERS_FILE), records)
    }

    fn load_default_headers(&self) -> Vec<String> {
        self.load_or_default(
            DEFAULT_HEADERS_FILE,
            default_headers,
            parse_headers,
            |store, headers| {
                write_records(&store.path(DEFAULT_HEADERS_FILE), std::iter::once(headers.clone()))
            },
        )
    }
}

fn parse_visibility(records: Vec<Vec<String>>) -> Option<ColumnVisibility> {
    let mut visibility = ColumnVisibility::new();
    for record in records {
        let [column, flag] = <[String; 2]>::try_from(record).ok()?;
        let visible = match flag.trim().to_ascii_lowercase().as_str() {
            "1" | "true" => true,
            "0" | "false" => false,
            _ => return None,
        };
        visibility.insert(column, visible);
    }
    Some(visibility)
}

fn parse_filters(records: Vec<Vec<String>>) -> Option<FilterSettings> {
    let mut filters = FilterSettings::new();
    for mut record in records {
        let value = match record.len() {
            3 => record.pop().unwrap_or_default(),
            2 => String::new(),
            _ => return None,
        };
        let operator: FilterOperator = record[1].parse().unwrap_or_default();
        if let FilterOperator::Unknown(name) = &operator {
            warn!(column = %record[0], operator = %name, "unknown filter operator in settings");
        }
        filters.insert(record[0].clone(), FilterSetting::new(operator, value));
    }
    Some(filters)
}

fn parse_headers(records: Vec<Vec<String>>) -> Option<Vec<String>> {
    let headers: Vec<String> = records
        .into_iter()
        .next()?
        .into_iter()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .collect();
    (!headers.is_empty()).then_some(headers)
}

fn read_records(path: &Path) -> Result<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| RecsyncError::Storage(format!("{}: {e}", path.display())))?;

    reader
        .records()
        .map(|record| {
            record
                .map(|r| r.iter().map(str::to_string).collect())
                .map_err(|e| RecsyncError::Storage(format!("{}: {e}", path.display())))
        })
        .collect()
}

fn write_records(path: &Path, records: impl IntoIterator<Item = Vec<String>>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| RecsyncError::io(parent, e))?;
    }
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| RecsyncError::Storage(format!("{}: {e}", path.display())))?;
    for record in records {
        writer
            .write_record(&record)
            .map_err(|e| RecsyncError::Storage(format!("{}: {e}", path.display())))?;
    }
    writer.flush().map_err(|e| RecsyncError::io(path, e))
}
