//! Core domain types for record reconciliation runs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved suffix marking columns sourced from the per-record detail fetch.
pub const DEFAULT_DETAIL_SUFFIX: &str = "_AD";

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Composite upsert key: at most one row per `(recipient, record_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordIdentity {
    /// Owner/subscriber context, typically an email address.
    pub recipient: String,
    /// External record number.
    pub record_id: String,
}

impl RecordIdentity {
    pub fn new(recipient: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            record_id: record_id.into(),
        }
    }
}

impl fmt::Display for RecordIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.recipient, self.record_id)
    }
}

/// Ordered column name -> value mapping produced by one successful fetch.
pub type FieldMap = IndexMap<String, String>;

/// One entry of a recipient's basic list: the record-id plus its base fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicRecord {
    pub record_id: String,
    pub fields: FieldMap,
}

impl BasicRecord {
    pub fn new(record_id: impl Into<String>, fields: FieldMap) -> Self {
        Self {
            record_id: record_id.into(),
            fields,
        }
    }
}

/// Build a detail column name from a raw label, e.g. `"Title"` -> `"Title_AD"`.
///
/// Labels that already carry the suffix are returned trimmed but otherwise unchanged.
pub fn detail_column_name(label: &str, suffix: &str) -> String {
    let label = label.trim();
    if label.ends_with(suffix) {
        label.to_string()
    } else {
        format!("{label}{suffix}")
    }
}

/// Whether `column` belongs to the detail namespace.
pub fn is_detail_column(column: &str, suffix: &str) -> bool {
    !suffix.is_empty() && column.ends_with(suffix)
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Condition applied to a single column when selecting rows for export.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FilterOperator {
    /// Filter disabled.
    #[default]
    None,
    Is,
    Blank,
    Contains,
    StartsWith,
    EndsWith,
    /// Operator name read from configuration that this version does not know.
    Unknown(String),
}

impl FilterOperator {
    /// Canonical operator names accepted on the command line and in settings files.
    pub const NAMES: [&'static str; 6] =
        ["NONE", "IS", "BLANK", "CONTAINS", "STARTS_WITH", "ENDS_WITH"];

    /// Whether the filter takes part in evaluation.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::None)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::None => "NONE",
            Self::Is => "IS",
            Self::Blank => "BLANK",
            Self::Contains => "CONTAINS",
            Self::StartsWith => "STARTS_WITH",
            Self::EndsWith => "ENDS_WITH",
            Self::Unknown(raw) => raw,
        }
    }
}

impl FromStr for FilterOperator {
    type Err = std::convert::Infallible;

    /// Parsing never fails: unrecognised names become [`FilterOperator::Unknown`].
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace([' ', '-'], "_");
        Ok(match normalized.as_str() {
            "" | "NONE" => Self::None,
            "IS" => Self::Is,
            "BLANK" => Self::Blank,
            "CONTAINS" => Self::Contains,
            "STARTS_WITH" => Self::StartsWith,
            "ENDS_WITH" => Self::EndsWith,
            _ => Self::Unknown(s.trim().to_string()),
        })
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator and comparison value configured for one column.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilterSetting {
    pub operator: FilterOperator,
    pub value: String,
}

impl FilterSetting {
    pub fn new(operator: FilterOperator, value: impl Into<String>) -> Self {
        Self {
            operator,
            value: value.into(),
        }
    }
}

/// Typed `column -> FilterSetting` mapping, in configuration order.
pub type FilterSettings = IndexMap<String, FilterSetting>;

// ---------------------------------------------------------------------------
// Progress events
// ---------------------------------------------------------------------------

/// Category of a progress event, mirrored by the observer's rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressLevel {
    Status,
    Success,
    Warning,
    Error,
}

impl fmt::Display for ProgressLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Status => "STATUS",
            Self::Success => "SUCCESS",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// A structured progress message emitted by the run controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub level: ProgressLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(level: ProgressLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_parsing_accepts_spaced_and_lowercase_names() {
        assert_eq!("IS".parse::<FilterOperator>().unwrap(), FilterOperator::Is);
        assert_eq!(
            "starts with".parse::<FilterOperator>().unwrap(),
            FilterOperator::StartsWith
        );
        assert_eq!(
            "ENDS_WITH".parse::<FilterOperator>().unwrap(),
            FilterOperator::EndsWith
        );
        assert_eq!("".parse::<FilterOperator>().unwrap(), FilterOperator::None);
        assert_eq!(
            "GREATER".parse::<FilterOperator>().unwrap(),
            FilterOperator::Unknown("GREATER".into())
        );
    }

    #[test]
    fn operator_display_uses_canonical_names() {
        for name in FilterOperator::NAMES {
            let op: FilterOperator = name.parse().unwrap();
            assert_eq!(op.to_string(), name);
        }
    }

    #[test]
    fn detail_column_names() {
        assert_eq!(detail_column_name(" Title ", "_AD"), "Title_AD");
        assert_eq!(detail_column_name("Title_AD", "_AD"), "Title_AD");
        assert!(is_detail_column("Title_AD", "_AD"));
        assert!(!is_detail_column("Status", "_AD"));
        assert!(!is_detail_column("Status", ""));
    }

    #[test]
    fn run_id_is_unique() {
        assert_ne!(RunId::new(), RunId::new());
    }
}
