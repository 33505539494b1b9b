//! Row reconciliation store backed by a delimited artifact file.
//!
//! The store holds the whole artifact in memory: a [`SchemaRegistry`] for the
//! header and one value vector per record, positionally aligned to it. Every
//! mutation keeps `row.len() == schema.len()` for all rows, and rows are keyed
//! by [`RecordIdentity`] so there is never more than one row per identity.
//!
//! The artifact file is owned by a single writer for the duration of a run.
//! Other processes writing the same file concurrently produce undefined results.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use recsync_shared::{FieldMap, RecordIdentity, RecsyncError, Result};
use tracing::{debug, info, instrument};

use crate::schema::SchemaRegistry;

const UTF8_BOM: char = '\u{feff}';

/// Names of the two columns forming the composite identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityColumns {
    pub recipient: String,
    pub record_id: String,
}

impl IdentityColumns {
    pub fn new(recipient: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            record_id: record_id.into(),
        }
    }

    fn is_identity(&self, column: &str) -> bool {
        column == self.recipient || column == self.record_id
    }
}

/// Whether an upsert created a row or modified an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Result of a single upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertReport {
    pub outcome: UpsertOutcome,
    /// Columns appended to the schema by this upsert.
    pub new_columns: Vec<String>,
}

/// Read-only view of one stored row.
#[derive(Debug, Clone, Copy)]
pub struct RowView<'a> {
    schema: &'a SchemaRegistry,
    values: &'a [String],
}

impl<'a> RowView<'a> {
    /// Value of `column`, or `None` when the column is not in the schema.
    pub fn get(&self, column: &str) -> Option<&'a str> {
        self.schema
            .position(column)
            .and_then(|i| self.values.get(i))
            .map(String::as_str)
    }

    /// Values in schema order.
    pub fn values(&self) -> &'a [String] {
        self.values
    }
}

/// Flat table keyed by `(recipient, record_id)` with an append-only schema.
#[derive(Debug, Clone)]
pub struct RowStore {
    path: PathBuf,
    identity: IdentityColumns,
    schema: SchemaRegistry,
    rows: Vec<Vec<String>>,
    index: HashMap<RecordIdentity, usize>,
}

impl RowStore {
    /// Create an empty in-memory store whose schema starts with the identity
    /// columns followed by `seed_columns`. Nothing is written until [`persist`](Self::persist).
    pub fn create<I, S>(path: &Path, identity: IdentityColumns, seed_columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut schema =
            SchemaRegistry::from_columns([identity.recipient.as_str(), identity.record_id.as_str()]);
        schema.ensure(seed_columns);

        Self {
            path: path.to_path_buf(),
            identity,
            schema,
            rows: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Load the artifact at `path` if it has a header row, otherwise create a
    /// fresh store seeded with `seed_columns`.
    pub fn open<I, S>(path: &Path, identity: IdentityColumns, seed_columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let existing = match std::fs::metadata(path) {
            Ok(_) => Self::read(path, &identity)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(RecsyncError::io(path, e)),
        };

        match existing {
            Some(store) => Ok(store),
            None => {
                debug!(path = %path.display(), "no existing artifact, starting empty store");
                Ok(Self::create(path, identity, seed_columns))
            }
        }
    }

    /// Read the whole artifact: header row, then one row per record.
    ///
    /// Fails closed on any structural inconsistency instead of padding or
    /// truncating: mismatched field counts, duplicate header names, missing
    /// identity columns, and repeated identities are all integrity errors.
    /// A file without a header row loads as an empty store.
    pub fn load(path: &Path, identity: IdentityColumns) -> Result<Self> {
        match Self::read(path, &identity)? {
            Some(store) => Ok(store),
            None => Ok(Self::create(path, identity, std::iter::empty::<&str>())),
        }
    }

    /// `None` when the file holds no header row (zero bytes or blank lines).
    #[instrument(skip_all, fields(path = %path.display()))]
    fn read(path: &Path, identity: &IdentityColumns) -> Result<Option<Self>> {
        let bytes = std::fs::read(path).map_err(|e| RecsyncError::io(path, e))?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes.as_slice());

        let mut records = reader.records();
        let header = match records.next() {
            Some(record) => record.map_err(|e| storage_error(path, e))?,
            None => return Ok(None),
        };

        let header: Vec<String> = header
            .iter()
            .enumerate()
            .map(|(i, name)| {
                if i == 0 {
                    name.trim_start_matches(UTF8_BOM).to_string()
                } else {
                    name.to_string()
                }
            })
            .collect();

        let schema = SchemaRegistry::from_columns(&header);
        if schema.len() != header.len() {
            return Err(RecsyncError::integrity(path, "header contains duplicate column names"));
        }
        let recipient_pos = schema.position(&identity.recipient).ok_or_else(|| {
            RecsyncError::integrity(
                path,
                format!("header is missing identity column '{}'", identity.recipient),
            )
        })?;
        let record_pos = schema.position(&identity.record_id).ok_or_else(|| {
            RecsyncError::integrity(
                path,
                format!("header is missing identity column '{}'", identity.record_id),
            )
        })?;

        let mut rows = Vec::new();
        let mut index = HashMap::new();
        for record in records {
            let record = record.map_err(|e| storage_error(path, e))?;
            let line = record.position().map(|p| p.line()).unwrap_or_default();
            if record.len() != schema.len() {
                return Err(RecsyncError::integrity(
                    path,
                    format!(
                        "line {line} has {} fields, header has {}",
                        record.len(),
                        schema.len()
                    ),
                ));
            }

            let values: Vec<String> = record.iter().map(str::to_string).collect();
            let key = RecordIdentity::new(&values[recipient_pos], &values[record_pos]);
            if index.insert(key.clone(), rows.len()).is_some() {
                return Err(RecsyncError::integrity(
                    path,
                    format!("line {line} repeats identity {key}"),
                ));
            }
            rows.push(values);
        }

        info!(columns = schema.len(), rows = rows.len(), "loaded artifact");

        Ok(Some(Self {
            path: path.to_path_buf(),
            identity: identity.clone(),
            schema,
            rows,
            index,
        }))
    }

    /// Rewrite the whole artifact.
    ///
    /// Content goes to a sibling temporary file, synced to disk, which is then
    /// renamed over the target. Readers only ever see a complete previous or
    /// new version.
    pub fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| RecsyncError::io(parent, e))?;
        }

        let tmp_path = temp_sibling(&self.path);
        {
            let mut writer =
                csv::Writer::from_path(&tmp_path).map_err(|e| storage_error(&tmp_path, e))?;
            writer
                .write_record(self.schema.columns())
                .map_err(|e| storage_error(&tmp_path, e))?;
            for row in &self.rows {
                writer
                    .write_record(row)
                    .map_err(|e| storage_error(&tmp_path, e))?;
            }
            let file = writer
                .into_inner()
                .map_err(|e| RecsyncError::io(&tmp_path, e.into_error()))?;
            file.sync_all().map_err(|e| RecsyncError::io(&tmp_path, e))?;
        }

        std::fs::rename(&tmp_path, &self.path).map_err(|e| RecsyncError::io(&self.path, e))?;
        debug!(
            path = %self.path.display(),
            rows = self.rows.len(),
            columns = self.schema.len(),
            "persisted artifact"
        );
        Ok(())
    }

    /// Grow the schema and pad every stored row with empty values for the
    /// appended columns. Returns the appended names.
    pub fn ensure_columns<I, S>(&mut self, columns: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let appended = self.schema.ensure(columns);
        if !appended.is_empty() {
            let width = self.schema.len();
            for row in &mut self.rows {
                row.resize(width, String::new());
            }
            debug!(new_columns = ?appended, width, "schema grew");
        }
        appended
    }

    /// Insert or update the row for `identity`.
    ///
    /// Only the columns named in `fields` are written; every other value of an
    /// existing row is left untouched. A present-but-empty value does overwrite.
    /// Entries naming an identity column are ignored: the identity is the key.
    pub fn upsert(&mut self, identity: &RecordIdentity, fields: &FieldMap) -> UpsertReport {
        let candidates: Vec<&String> = fields
            .keys()
            .filter(|column| !self.identity.is_identity(column))
            .collect();
        let new_columns = self.ensure_columns(candidates);

        let (row_index, outcome) = match self.index.get(identity) {
            Some(&i) => (i, UpsertOutcome::Updated),
            None => {
                let mut row = vec![String::new(); self.schema.len()];
                row[self.identity_position(&self.identity.recipient)] =
                    identity.recipient.clone();
                row[self.identity_position(&self.identity.record_id)] =
                    identity.record_id.clone();
                self.rows.push(row);
                let i = self.rows.len() - 1;
                self.index.insert(identity.clone(), i);
                (i, UpsertOutcome::Inserted)
            }
        };

        let row = &mut self.rows[row_index];
        for (column, value) in fields {
            if self.identity.is_identity(column) {
                continue;
            }
            if let Some(pos) = self.schema.position(column) {
                row[pos] = value.clone();
            }
        }

        UpsertReport {
            outcome,
            new_columns,
        }
    }

    /// [`upsert`](Self::upsert) followed by an immediate [`persist`](Self::persist).
    pub fn upsert_and_persist(
        &mut self,
        identity: &RecordIdentity,
        fields: &FieldMap,
    ) -> Result<UpsertReport> {
        let report = self.upsert(identity, fields);
        self.persist()?;
        Ok(report)
    }

    /// Look up the row for `identity`.
    pub fn get(&self, identity: &RecordIdentity) -> Option<RowView<'_>> {
        self.index.get(identity).map(|&i| RowView {
            schema: &self.schema,
            values: &self.rows[i],
        })
    }

    /// All rows in insertion (file) order.
    pub fn rows(&self) -> impl Iterator<Item = RowView<'_>> {
        self.rows.iter().map(|values| RowView {
            schema: &self.schema,
            values,
        })
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    pub fn identity_columns(&self) -> &IdentityColumns {
        &self.identity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn identity_position(&self, column: &str) -> usize {
        // Identity columns are registered at construction or verified on load.
        self.schema.position(column).unwrap_or_default()
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name: OsString = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("artifact"));
    name.push(".tmp");
    path.with_file_name(name)
}

fn storage_error(path: &Path, e: csv::Error) -> RecsyncError {
    RecsyncError::Storage(format!("{}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("recsync-rows-{}", Uuid::now_v7()))
            .join(name)
    }

    fn identity_columns() -> IdentityColumns {
        IdentityColumns::new("Email", "Application Number")
    }

    fn fields(pairs: &[(&str, &str)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn cleanup(path: &Path) {
        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    fn assert_aligned(store: &RowStore) {
        for row in store.rows() {
            assert_eq!(row.values().len(), store.schema().len());
        }
    }

    #[test]
    fn insert_creates_row_with_identity_and_empty_defaults() {
        let path = temp_path("records.csv");
        let mut store = RowStore::create(&path, identity_columns(), ["Status", "Comments"]);

        let id = RecordIdentity::new("a@example.com", "A1");
        let report = store.upsert(&id, &fields(&[("Status", "New")]));
        assert_eq!(report.outcome, UpsertOutcome::Inserted);
        assert!(report.new_columns.is_empty());

        let row = store.get(&id).expect("row exists");
        assert_eq!(row.get("Email"), Some("a@example.com"));
        assert_eq!(row.get("Application Number"), Some("A1"));
        assert_eq!(row.get("Status"), Some("New"));
        assert_eq!(row.get("Comments"), Some(""));
        assert_eq!(row.get("Missing"), None);
    }

    #[test]
    fn schema_growth_pads_existing_rows() {
        let path = temp_path("records.csv");
        let mut store = RowStore::create(&path, identity_columns(), std::iter::empty::<&str>());

        store.upsert(&RecordIdentity::new("r", "A1"), &fields(&[("Status", "New")]));
        let report = store.upsert(
            &RecordIdentity::new("r", "A2"),
            &fields(&[("Title_AD", "Foo"), ("Agent_AD", "Bar")]),
        );
        assert_eq!(report.new_columns, vec!["Title_AD", "Agent_AD"]);

        assert_aligned(&store);
        let a1 = store.get(&RecordIdentity::new("r", "A1")).unwrap();
        assert_eq!(a1.get("Title_AD"), Some(""));
        assert_eq!(a1.get("Status"), Some("New"));
    }

    #[test]
    fn partial_update_preserves_omitted_columns() {
        let path = temp_path("records.csv");
        let mut store = RowStore::create(&path, identity_columns(), std::iter::empty::<&str>());
        let id = RecordIdentity::new("r", "A1");

        store.upsert(&id, &fields(&[("Status", "New"), ("Title_AD", "Widget")]));
        let report = store.upsert(&id, &fields(&[("Status", "Closed")]));
        assert_eq!(report.outcome, UpsertOutcome::Updated);

        let row = store.get(&id).unwrap();
        assert_eq!(row.get("Status"), Some("Closed"));
        assert_eq!(row.get("Title_AD"), Some("Widget"));
    }

    #[test]
    fn present_but_empty_value_overwrites() {
        let path = temp_path("records.csv");
        let mut store = RowStore::create(&path, identity_columns(), std::iter::empty::<&str>());
        let id = RecordIdentity::new("r", "A1");

        store.upsert(&id, &fields(&[("Comments", "call back")]));
        store.upsert(&id, &fields(&[("Comments", "")]));
        assert_eq!(store.get(&id).unwrap().get("Comments"), Some(""));
    }

    #[test]
    fn composite_key_is_unique_per_recipient_and_record() {
        let path = temp_path("records.csv");
        let mut store = RowStore::create(&path, identity_columns(), std::iter::empty::<&str>());

        for _ in 0..3 {
            store.upsert(&RecordIdentity::new("a@example.com", "A1"), &FieldMap::new());
            store.upsert(&RecordIdentity::new("b@example.com", "A1"), &FieldMap::new());
        }
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn identity_columns_in_field_map_are_ignored() {
        let path = temp_path("records.csv");
        let mut store = RowStore::create(&path, identity_columns(), std::iter::empty::<&str>());
        let id = RecordIdentity::new("r", "A1");

        store.upsert(
            &id,
            &fields(&[("Application Number", "SOMETHING ELSE"), ("Status", "New")]),
        );
        let row = store.get(&id).unwrap();
        assert_eq!(row.get("Application Number"), Some("A1"));
        assert_eq!(store.schema().columns(), ["Email", "Application Number", "Status"]);
    }

    #[test]
    fn persist_then_load_round_trips() {
        let path = temp_path("records.csv");
        let mut store = RowStore::create(&path, identity_columns(), ["Comments"]);
        store.upsert(
            &RecordIdentity::new("a@example.com", "A1"),
            &fields(&[("Comments", "line one\nline two, with comma"), ("Status", "\"quoted\"")]),
        );
        store.upsert(
            &RecordIdentity::new("a@example.com", "A2"),
            &fields(&[("Title_AD", "Widget Assembly")]),
        );
        store.persist().expect("persist");

        let loaded = RowStore::load(&path, identity_columns()).expect("load");
        assert_eq!(loaded.schema().columns(), store.schema().columns());
        let original: Vec<_> = store.rows().map(|r| r.values().to_vec()).collect();
        let reloaded: Vec<_> = loaded.rows().map(|r| r.values().to_vec()).collect();
        assert_eq!(original, reloaded);
        assert!(!temp_sibling(&path).exists());

        cleanup(&path);
    }

    #[test]
    fn reload_appends_new_columns_after_existing_header() {
        let path = temp_path("records.csv");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "Application Number,Status,Email\nA1,New,r\n").unwrap();

        let mut store = RowStore::open(&path, identity_columns(), ["Ignored"]).expect("open");
        store
            .upsert_and_persist(&RecordIdentity::new("r", "A1"), &fields(&[("Title_AD", "Foo")]))
            .expect("upsert");

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("Application Number,Status,Email,Title_AD"));
        assert_eq!(lines.next(), Some("A1,New,r,Foo"));

        cleanup(&path);
    }

    #[test]
    fn load_rejects_row_length_mismatch() {
        let path = temp_path("records.csv");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "Email,Application Number,Status\nr,A1\n").unwrap();

        let err = RowStore::load(&path, identity_columns()).unwrap_err();
        assert!(matches!(err, RecsyncError::Integrity { .. }));
        assert!(err.to_string().contains("2 fields"));

        cleanup(&path);
    }

    #[test]
    fn load_rejects_missing_identity_column_and_duplicates() {
        let path = temp_path("records.csv");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();

        std::fs::write(&path, "Application Number,Status\nA1,New\n").unwrap();
        let err = RowStore::load(&path, identity_columns()).unwrap_err();
        assert!(err.to_string().contains("missing identity column 'Email'"));

        std::fs::write(&path, "Email,Application Number,Email\nr,A1,r\n").unwrap();
        let err = RowStore::load(&path, identity_columns()).unwrap_err();
        assert!(err.to_string().contains("duplicate column"));

        std::fs::write(&path, "Email,Application Number\nr,A1\nr,A1\n").unwrap();
        let err = RowStore::load(&path, identity_columns()).unwrap_err();
        assert!(err.to_string().contains("repeats identity"));

        cleanup(&path);
    }

    #[test]
    fn open_treats_empty_file_as_new_and_strips_bom() {
        let path = temp_path("records.csv");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();

        std::fs::write(&path, "").unwrap();
        let store = RowStore::open(&path, identity_columns(), ["Status"]).expect("open empty");
        assert_eq!(store.schema().columns(), ["Email", "Application Number", "Status"]);

        std::fs::write(&path, "\u{feff}Email,Application Number\nr,A1\n").unwrap();
        let store = RowStore::open(&path, identity_columns(), ["Status"]).expect("open bom");
        assert_eq!(store.schema().columns(), ["Email", "Application Number"]);
        assert!(store.get(&RecordIdentity::new("r", "A1")).is_some());

        cleanup(&path);
    }

    #[test]
    fn header_less_file_is_seeded_like_an_empty_one() {
        let path = temp_path("records.csv");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();

        for content in ["\n", "\r\n\n"] {
            std::fs::write(&path, content).unwrap();
            let store = RowStore::open(&path, identity_columns(), ["Status", "Comments"])
                .expect("open blank");
            assert_eq!(
                store.schema().columns(),
                ["Email", "Application Number", "Status", "Comments"]
            );
            assert!(store.is_empty());
        }

        cleanup(&path);
    }

    #[test]
    fn persist_replaces_previous_artifact_whole() {
        let path = temp_path("records.csv");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "Email,Application Number
old,Z9
").unwrap();

        let mut store = RowStore::create(&path, identity_columns(), ["Status"]);
        store
            .upsert_and_persist(&RecordIdentity::new("r", "A1"), &fields(&[("Status", "New")]))
            .expect("persist");

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "Email,Application Number,Status\nr,A1,New\n");
        assert!(!temp_sibling(&path).exists());

        cleanup(&path);
    }
}
