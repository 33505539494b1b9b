//! Run controller: record set → retries → upserts → (on demand) filtered export.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use recsync_extraction::{ExtractionAgent, ExtractionError};
use recsync_shared::{
    BasicRecord, FieldMap, RecordIdentity, RecsyncError, Result, RunConfig, RunId,
};
use recsync_storage::{IdentityColumns, RowStore, SettingsStore};

use crate::filter::{self, ExportTable};
use crate::progress::ProgressObserver;
use crate::retry::{RecordSink, RetryOrchestrator, RetryOutcome, RetryPolicy, wait_backoff};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Overall result of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every record was saved.
    Completed,
    /// The run finished but some records or recipients failed.
    CompletedWithFailures,
    /// Stopped by the user before finishing.
    Aborted,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::CompletedWithFailures => "completed with failures",
            Self::Aborted => "aborted by user",
        })
    }
}

/// What happened for one recipient.
#[derive(Debug, Clone, Serialize)]
pub struct RecipientReport {
    pub recipient: String,
    /// Set when the record set for this recipient could not be obtained.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_error: Option<String>,
    pub records: usize,
    pub outcome: RetryOutcome,
}

/// Summary of a completed or aborted run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub status: RunStatus,
    pub artifact_path: PathBuf,
    pub recipients: Vec<RecipientReport>,
    /// Recipients never reached because the run was cancelled.
    pub not_started: Vec<String>,
    /// Columns the run appended to the artifact schema.
    pub new_columns: Vec<String>,
    pub rows: usize,
    pub columns: usize,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    pub fn succeeded(&self) -> usize {
        self.recipients.iter().map(|r| r.outcome.succeeded.len()).sum()
    }

    pub fn permanently_failed(&self) -> usize {
        self.recipients
            .iter()
            .map(|r| r.outcome.permanently_failed.len())
            .sum()
    }

    pub fn aborted(&self) -> usize {
        self.recipients.iter().map(|r| r.outcome.aborted.len()).sum()
    }
}

/// Result of a filtered export.
#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub path: PathBuf,
    pub rows: usize,
    pub columns: usize,
}

// ---------------------------------------------------------------------------
// Store sink
// ---------------------------------------------------------------------------

/// Merges base and detail fields and persists each record as it arrives.
struct StoreSink<'a> {
    store: &'a mut RowStore,
    recipient: &'a str,
    base: &'a IndexMap<String, FieldMap>,
    new_columns: &'a mut Vec<String>,
}

impl RecordSink for StoreSink<'_> {
    fn accept(&mut self, record_id: &str, detail: FieldMap) -> Result<()> {
        let mut fields = self.base.get(record_id).cloned().unwrap_or_default();
        fields.extend(detail);

        let identity = RecordIdentity::new(self.recipient, record_id);
        let report = self.store.upsert_and_persist(&identity, &fields)?;
        if !report.new_columns.is_empty() {
            info!(record_id, new_columns = ?report.new_columns, "schema extended");
            self.new_columns.extend(report.new_columns);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Owns one run: the agent session, the cancellation token, and progress reporting.
pub struct RunController<A> {
    config: RunConfig,
    agent: A,
    settings: Arc<dyn SettingsStore>,
    progress: Arc<dyn ProgressObserver>,
    cancel: CancellationToken,
}

impl<A: ExtractionAgent> RunController<A> {
    pub fn new(
        config: RunConfig,
        agent: A,
        settings: Arc<dyn SettingsStore>,
        progress: Arc<dyn ProgressObserver>,
    ) -> Self {
        Self {
            config,
            agent,
            settings,
            progress,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the run at the next record boundary when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    /// Execute the run over every configured recipient.
    ///
    /// Per-record failures are reported, not returned; an `Err` means the
    /// artifact could not be loaded or written.
    #[instrument(skip_all, fields(run_id))]
    pub async fn run(&mut self) -> Result<RunReport> {
        let start = Instant::now();
        let run_id = RunId::new();
        tracing::Span::current().record("run_id", tracing::field::display(&run_id));

        self.config.validate()?;
        info!(
            %run_id,
            recipients = self.config.recipients.len(),
            artifact = %self.config.artifact_path.display(),
            "starting run"
        );

        let identity = IdentityColumns::new(
            self.config.recipient_column.clone(),
            self.config.record_id_column.clone(),
        );
        let seed = self.settings.load_default_headers();
        let mut store = match RowStore::open(&self.config.artifact_path, identity, &seed) {
            Ok(store) => store,
            Err(e) => {
                self.progress.error(&format!("Cannot load artifact: {e}"));
                return Err(e);
            }
        };
        self.progress.status(&format!(
            "Loaded {} ({} rows, {} columns)",
            self.config.artifact_path.display(),
            store.len(),
            store.schema().len()
        ));

        let policy = RetryPolicy::from(&self.config);
        let mut reports = Vec::new();
        let mut new_columns = Vec::new();
        let mut not_started = Vec::new();
        let mut cancelled = false;

        let recipients = self.config.recipients.clone();
        for recipient in &recipients {
            if cancelled || self.cancel.is_cancelled() {
                cancelled = true;
                not_started.push(recipient.clone());
                continue;
            }
            self.progress.status(&format!("Processing {recipient}"));

            let records = match self.record_set(recipient, &policy).await {
                RecordSet::Records(records) => records,
                RecordSet::Failed(err) => {
                    self.progress
                        .error(&format!("Skipping {recipient}: could not list records: {err}"));
                    reports.push(RecipientReport {
                        recipient: recipient.clone(),
                        list_error: Some(err.to_string()),
                        records: 0,
                        outcome: RetryOutcome::default(),
                    });
                    continue;
                }
                RecordSet::Cancelled => {
                    cancelled = true;
                    not_started.push(recipient.clone());
                    continue;
                }
            };

            let mut base: IndexMap<String, FieldMap> = IndexMap::new();
            for record in records {
                if base.contains_key(&record.record_id) {
                    warn!(recipient = %recipient, record_id = %record.record_id, "duplicate record in list, keeping first");
                    continue;
                }
                base.insert(record.record_id, record.fields);
            }
            let record_ids: Vec<String> = base.keys().cloned().collect();
            self.progress
                .status(&format!("Found {} record(s) for {recipient}", record_ids.len()));

            let orchestrator =
                RetryOrchestrator::new(policy, self.cancel.clone(), self.progress.as_ref());
            let mut sink = StoreSink {
                store: &mut store,
                recipient,
                base: &base,
                new_columns: &mut new_columns,
            };
            let outcome = orchestrator
                .run(&record_ids, &mut self.agent, &mut sink)
                .await?;

            cancelled |= outcome.cancelled;
            reports.push(RecipientReport {
                recipient: recipient.clone(),
                list_error: None,
                records: record_ids.len(),
                outcome,
            });
        }

        let failed = reports
            .iter()
            .any(|r| r.list_error.is_some() || !r.outcome.permanently_failed.is_empty());
        let status = if cancelled {
            RunStatus::Aborted
        } else if failed {
            RunStatus::CompletedWithFailures
        } else {
            RunStatus::Completed
        };

        let report = RunReport {
            run_id,
            status,
            artifact_path: self.config.artifact_path.clone(),
            recipients: reports,
            not_started,
            new_columns,
            rows: store.len(),
            columns: store.schema().len(),
            elapsed_ms: start.elapsed().as_millis() as u64,
        };

        let summary = format!(
            "Run {status}: {} saved, {} permanently failed, {} aborted",
            report.succeeded(),
            report.permanently_failed(),
            report.aborted()
        );
        match status {
            RunStatus::Completed => self.progress.success(&summary),
            RunStatus::CompletedWithFailures => self.progress.warning(&summary),
            RunStatus::Aborted => self.progress.warning(&summary),
        }
        info!(
            %status,
            succeeded = report.succeeded(),
            permanently_failed = report.permanently_failed(),
            aborted = report.aborted(),
            rows = report.rows,
            elapsed_ms = report.elapsed_ms,
            "run finished"
        );

        Ok(report)
    }

    /// Write the rows matching the saved filters to a new timestamped file.
    pub fn export_filtered(&self) -> Result<ExportReport> {
        export_filtered(&self.config, self.settings.as_ref(), self.progress.as_ref())
    }

    /// Explicit record-ids win over the recipient's basic list.
    async fn record_set(&mut self, recipient: &str, policy: &RetryPolicy) -> RecordSet {
        if !self.config.record_ids.is_empty() {
            return RecordSet::Records(
                self.config
                    .record_ids
                    .iter()
                    .map(|id| BasicRecord::new(id.clone(), FieldMap::new()))
                    .collect(),
            );
        }
        fetch_list_with_retry(
            &mut self.agent,
            recipient,
            policy,
            &self.cancel,
            self.progress.as_ref(),
        )
        .await
    }
}

enum RecordSet {
    Records(Vec<BasicRecord>),
    Failed(ExtractionError),
    Cancelled,
}

/// Fetch a recipient's basic list under the same pass/backoff policy as records.
async fn fetch_list_with_retry<A: ExtractionAgent + ?Sized>(
    agent: &mut A,
    recipient: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    progress: &dyn ProgressObserver,
) -> RecordSet {
    let final_pass = policy.passes();
    let mut last_error = ExtractionError::fatal("basic list was never attempted");

    for attempt in 1..=final_pass {
        if !wait_backoff(policy, attempt, cancel).await {
            return RecordSet::Cancelled;
        }
        match agent.fetch_basic_list(recipient).await {
            Ok(records) => return RecordSet::Records(records),
            Err(err) => {
                warn!(
                    recipient,
                    attempt,
                    operation = "fetch_basic_list",
                    error = %err,
                    "basic list fetch failed"
                );
                let retryable = err.is_retryable();
                last_error = err;
                if !retryable {
                    break;
                }
                if attempt < final_pass {
                    progress.warning(&format!(
                        "Listing records for {recipient} failed (attempt {attempt}), retrying"
                    ));
                }
            }
        }
    }
    RecordSet::Failed(last_error)
}

/// Export the artifact described by `config` through the saved filters and
/// column visibility into `results_dir`.
#[instrument(skip_all, fields(artifact = %config.artifact_path.display()))]
pub fn export_filtered(
    config: &RunConfig,
    settings: &dyn SettingsStore,
    progress: &dyn ProgressObserver,
) -> Result<ExportReport> {
    if !config.artifact_path.exists() {
        let err = RecsyncError::validation(format!(
            "no artifact at {}; run a sync first",
            config.artifact_path.display()
        ));
        progress.error(&err.to_string());
        return Err(err);
    }

    let identity = IdentityColumns::new(
        config.recipient_column.clone(),
        config.record_id_column.clone(),
    );
    let store = RowStore::load(&config.artifact_path, identity)?;
    let filters = settings.load_filter_settings();
    let visibility = settings.load_column_visibility();

    let unknown = filter::warn_unknown_operators(&filters);
    if !unknown.is_empty() {
        progress.warning(&format!(
            "Unknown filter operator on {}; those filters match nothing",
            unknown.join(", ")
        ));
    }

    let table: ExportTable = filter::export(&store, &filters, &visibility);
    let path = config
        .results_dir
        .join(filter::export_file_name(chrono::Local::now()));
    filter::write_export(&path, &table)?;

    let report = ExportReport {
        path,
        rows: table.rows.len(),
        columns: table.headers.len(),
    };
    if report.rows == 0 {
        progress.warning("No rows matched the current filters");
    }
    progress.success(&format!(
        "Exported {} of {} row(s) to {}",
        report.rows,
        store.len(),
        report.path.display()
    ));
    info!(rows = report.rows, columns = report.columns, path = %report.path.display(), "filtered export written");
    Ok(report)
}
