//! Filter predicate evaluation and filtered export.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Local};
use tracing::{debug, instrument, warn};

use recsync_shared::{FieldMap, FilterOperator, FilterSettings, RecsyncError, Result};
use recsync_storage::{ColumnVisibility, RowStore, RowView, is_visible};

/// Stem of filtered export file names.
const EXPORT_FILE_PREFIX: &str = "filtered_record_list";

/// Read access to a row's values by column name.
pub trait ColumnLookup {
    /// Value of `column`, or `None` when the row has no such column.
    fn lookup(&self, column: &str) -> Option<&str>;
}

impl ColumnLookup for RowView<'_> {
    fn lookup(&self, column: &str) -> Option<&str> {
        self.get(column)
    }
}

impl ColumnLookup for FieldMap {
    fn lookup(&self, column: &str) -> Option<&str> {
        self.get(column).map(String::as_str)
    }
}

/// Evaluate one operator against a cell value.
///
/// `Unknown` operators never match. `None` always does: it is a disabled filter.
pub fn predicate_holds(operator: &FilterOperator, cell: &str, value: &str) -> bool {
    match operator {
        FilterOperator::None => true,
        FilterOperator::Is => cell == value,
        FilterOperator::Blank => cell.trim().is_empty(),
        FilterOperator::Contains => cell.contains(value),
        FilterOperator::StartsWith => cell.starts_with(value),
        FilterOperator::EndsWith => cell.ends_with(value),
        FilterOperator::Unknown(_) => false,
    }
}

/// Whether `row` satisfies every active filter. Missing columns read as `""`.
pub fn matches<R: ColumnLookup + ?Sized>(row: &R, filters: &FilterSettings) -> bool {
    filters
        .iter()
        .filter(|(_, setting)| setting.operator.is_active())
        .all(|(column, setting)| {
            predicate_holds(
                &setting.operator,
                row.lookup(column).unwrap_or(""),
                &setting.value,
            )
        })
}

/// Log each filter whose operator is not recognised, once per operator name.
///
/// Returns the offending column names.
pub fn warn_unknown_operators(filters: &FilterSettings) -> Vec<String> {
    let mut reported = HashSet::new();
    let mut columns = Vec::new();
    for (column, setting) in filters {
        if let FilterOperator::Unknown(name) = &setting.operator {
            if reported.insert(name.as_str()) {
                warn!(
                    column = %column,
                    operator = %name,
                    "unknown filter operator, rows will not match"
                );
            }
            columns.push(column.clone());
        }
    }
    columns
}

/// Rows selected for export, restricted to visible columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Select the rows matching `filters`, keeping the visible columns in schema order.
#[instrument(skip_all, fields(rows = store.len(), columns = store.schema().len()))]
pub fn export(
    store: &RowStore,
    filters: &FilterSettings,
    visibility: &ColumnVisibility,
) -> ExportTable {
    warn_unknown_operators(filters);

    let selected: Vec<(usize, &String)> = store
        .schema()
        .columns()
        .iter()
        .enumerate()
        .filter(|(_, column)| is_visible(visibility, column))
        .collect();

    let rows: Vec<Vec<String>> = store
        .rows()
        .filter(|row| matches(row, filters))
        .map(|row| {
            selected
                .iter()
                .map(|(i, _)| row.values().get(*i).cloned().unwrap_or_default())
                .collect()
        })
        .collect();

    debug!(selected_rows = rows.len(), visible_columns = selected.len(), "export selected");
    ExportTable {
        headers: selected.into_iter().map(|(_, c)| c.clone()).collect(),
        rows,
    }
}

/// File name for an export taken at `at`.
pub fn export_file_name(at: DateTime<Local>) -> String {
    format!("{EXPORT_FILE_PREFIX}_{}.csv", at.format("%Y%m%d_%H%M%S"))
}

/// Write `table` as a delimited file, creating parent directories.
pub fn write_export(path: &Path, table: &ExportTable) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| RecsyncError::io(parent, e))?;
    }
    let storage_error = |e: csv::Error| RecsyncError::Storage(format!("{}: {e}", path.display()));

    let mut writer = csv::Writer::from_path(path).map_err(storage_error)?;
    writer.write_record(&table.headers).map_err(storage_error)?;
    for row in &table.rows {
        writer.write_record(row).map_err(storage_error)?;
    }
    writer.flush().map_err(|e| RecsyncError::io(path, e))
}
