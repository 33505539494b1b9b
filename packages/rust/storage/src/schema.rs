//! Append-only registry of artifact column names.

use std::collections::HashMap;

/// Ordered set of known columns.
///
/// Columns are only ever appended: existing names keep their position for
/// the lifetime of the registry, so rows stored positionally stay aligned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaRegistry {
    columns: Vec<String>,
    positions: HashMap<String, usize>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from an ordered column list, dropping repeated names.
    pub fn from_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut registry = Self::new();
        registry.ensure(columns);
        registry
    }

    /// Append every name not yet present, in order of first appearance.
    ///
    /// Returns the newly appended names (empty when the schema did not grow).
    pub fn ensure<I, S>(&mut self, columns: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut appended = Vec::new();
        for column in columns {
            let column = column.as_ref();
            if self.positions.contains_key(column) {
                continue;
            }
            self.positions.insert(column.to_string(), self.columns.len());
            self.columns.push(column.to_string());
            appended.push(column.to_string());
        }
        appended
    }

    /// Position of `column`, if known.
    pub fn position(&self, column: &str) -> Option<usize> {
        self.positions.get(column).copied()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.positions.contains_key(column)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}
