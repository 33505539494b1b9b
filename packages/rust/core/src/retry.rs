//! Pass-based retry orchestration over a record set.
//!
//! Every record-id moves through a small state machine:
//!
//! ```text
//! Pending ──fetch ok──────────────► Succeeded
//!    │
//!    └──fetch err──► FailedAttempt ──(next pass)──► ... ──final pass──► PermanentlyFailed
//! ```
//!
//! A pass iterates an immutable snapshot of the working set; the records that
//! failed during the pass form the snapshot of the next one. Cancellation
//! leaves every unfinished record in `Aborted`.

use std::time::Duration;

use indexmap::IndexMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use recsync_extraction::{ExtractionAgent, ExtractionError};
use recsync_shared::{FieldMap, Result, RunConfig};

use crate::progress::ProgressObserver;

/// Longest shift applied when doubling the backoff.
const MAX_BACKOFF_DOUBLINGS: u32 = 16;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// How many passes to make and how long to wait between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first pass.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    /// Policy without delays between passes.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
        }
    }

    /// Total number of passes (`max_retries + 1`).
    pub fn passes(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before `pass` (1-based). The first pass starts immediately; pass
    /// `n + 1` waits `min(base * 2^(n-1), max)`.
    pub fn backoff_before(&self, pass: u32) -> Duration {
        if pass <= 1 {
            return Duration::ZERO;
        }
        let doublings = (pass - 2).min(MAX_BACKOFF_DOUBLINGS);
        self.backoff_base
            .saturating_mul(1 << doublings)
            .min(self.backoff_max)
    }
}

impl From<&RunConfig> for RetryPolicy {
    fn from(config: &RunConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_base: config.backoff_base,
            backoff_max: config.backoff_max,
        }
    }
}

/// Wait out the backoff before `pass`. Returns `false` if cancelled meanwhile.
pub(crate) async fn wait_backoff(
    policy: &RetryPolicy,
    pass: u32,
    cancel: &CancellationToken,
) -> bool {
    let delay = policy.backoff_before(pass);
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    debug!(pass, delay_ms = delay.as_millis() as u64, "backing off before next pass");
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Per-record state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordState {
    Pending,
    FailedAttempt,
    Succeeded,
    PermanentlyFailed,
    Aborted,
}

impl RecordState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::PermanentlyFailed | Self::Aborted
        )
    }
}

/// A record that exhausted its attempts or failed fatally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermanentFailure {
    pub record_id: String,
    pub attempts: u32,
    pub last_error: String,
}

/// Result of one orchestrator run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryOutcome {
    /// Record-ids fetched and handed to the sink, in completion order.
    pub succeeded: Vec<String>,
    pub permanently_failed: Vec<PermanentFailure>,
    /// Record-ids left unfinished by cancellation, in input order.
    pub aborted: Vec<String>,
    /// Passes actually started.
    pub passes: u32,
    pub cancelled: bool,
}

impl RetryOutcome {
    /// Terminal state of `record_id`, if it was part of the run.
    pub fn state_of(&self, record_id: &str) -> Option<RecordState> {
        if self.succeeded.iter().any(|id| id == record_id) {
            Some(RecordState::Succeeded)
        } else if self
            .permanently_failed
            .iter()
            .any(|f| f.record_id == record_id)
        {
            Some(RecordState::PermanentlyFailed)
        } else if self.aborted.iter().any(|id| id == record_id) {
            Some(RecordState::Aborted)
        } else {
            None
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.permanently_failed.len() + self.aborted.len()
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Consumer of successfully fetched field maps.
///
/// An error from the sink is not a fetch failure: it stops the run.
pub trait RecordSink: Send {
    fn accept(&mut self, record_id: &str, fields: FieldMap) -> Result<()>;
}

#[derive(Debug)]
struct Tracker {
    state: RecordState,
    attempts: u32,
    last_error: Option<String>,
}

/// Drives an [`ExtractionAgent`] over a record set with bounded retries.
pub struct RetryOrchestrator<'a> {
    policy: RetryPolicy,
    cancel: CancellationToken,
    progress: &'a dyn ProgressObserver,
}

impl<'a> RetryOrchestrator<'a> {
    pub fn new(
        policy: RetryPolicy,
        cancel: CancellationToken,
        progress: &'a dyn ProgressObserver,
    ) -> Self {
        Self {
            policy,
            cancel,
            progress,
        }
    }

    /// Fetch the detail of every record-id, retrying failures pass by pass.
    ///
    /// Repeated record-ids are processed once. Successful field maps go to
    /// `sink` immediately, one at a time, in fetch order.
    #[instrument(skip_all, fields(records = record_ids.len(), agent = agent.name()))]
    pub async fn run<A, S>(
        &self,
        record_ids: &[String],
        agent: &mut A,
        sink: &mut S,
    ) -> Result<RetryOutcome>
    where
        A: ExtractionAgent + ?Sized,
        S: RecordSink + ?Sized,
    {
        let mut trackers: IndexMap<String, Tracker> = IndexMap::new();
        for id in record_ids {
            trackers.entry(id.clone()).or_insert(Tracker {
                state: RecordState::Pending,
                attempts: 0,
                last_error: None,
            });
        }

        let mut outcome = RetryOutcome::default();
        let mut working: Vec<String> = trackers.keys().cloned().collect();
        let final_pass = self.policy.passes();

        'passes: for pass in 1..=final_pass {
            if working.is_empty() {
                break;
            }
            if pass > 1 {
                self.progress.status(&format!(
                    "Retrying {} record(s), pass {pass} of {final_pass}",
                    working.len()
                ));
                if !wait_backoff(&self.policy, pass, &self.cancel).await {
                    outcome.cancelled = true;
                    break 'passes;
                }
            }
            outcome.passes = pass;
            info!(pass, records = working.len(), "starting pass");

            let snapshot = std::mem::take(&mut working);
            for record_id in &snapshot {
                if self.cancel.is_cancelled() {
                    outcome.cancelled = true;
                    break 'passes;
                }

                let Some(tracker) = trackers.get_mut(record_id) else {
                    continue;
                };
                if tracker.state == RecordState::Succeeded {
                    continue;
                }
                tracker.attempts += 1;
                let attempt = tracker.attempts;

                match agent.fetch_detail(record_id).await {
                    Ok(fields) => {
                        debug!(record_id = %record_id, attempt, fields = fields.len(), "fetched");
                        sink.accept(record_id, fields)?;
                        tracker.state = RecordState::Succeeded;
                        outcome.succeeded.push(record_id.clone());
                        self.progress.success(&format!("{record_id} saved"));
                    }
                    Err(err) => {
                        let permanent = !err.is_retryable() || pass == final_pass;
                        tracker.last_error = Some(err.to_string());
                        if permanent {
                            tracker.state = RecordState::PermanentlyFailed;
                            log_permanent(record_id, attempt, &err);
                            self.progress.error(&format!(
                                "{record_id} permanently failed after {attempt} attempt(s): {err}"
                            ));
                        } else {
                            tracker.state = RecordState::FailedAttempt;
                            warn!(
                                record_id = %record_id,
                                attempt,
                                operation = "fetch_detail",
                                error = %err,
                                "fetch failed, will retry"
                            );
                            self.progress
                                .warning(&format!("{record_id} failed (attempt {attempt}): {err}"));
                            working.push(record_id.clone());
                        }
                    }
                }
            }
        }

        for (id, tracker) in trackers.iter_mut() {
            match tracker.state {
                RecordState::PermanentlyFailed => {
                    outcome.permanently_failed.push(PermanentFailure {
                        record_id: id.clone(),
                        attempts: tracker.attempts,
                        last_error: tracker.last_error.take().unwrap_or_default(),
                    });
                }
                state if !state.is_terminal() => {
                    tracker.state = RecordState::Aborted;
                    outcome.aborted.push(id.clone());
                }
                _ => {}
            }
        }

        if outcome.cancelled {
            warn!(aborted = outcome.aborted.len(), "run aborted by user");
        }
        info!(
            succeeded = outcome.succeeded.len(),
            permanently_failed = outcome.permanently_failed.len(),
            aborted = outcome.aborted.len(),
            passes = outcome.passes,
            "record set finished"
        );
        Ok(outcome)
    }
}

fn log_permanent(record_id: &str, attempts: u32, err: &ExtractionError) {
    error!(
        record_id,
        attempts,
        operation = "fetch_detail",
        retryable = err.is_retryable(),
        error = %err,
        "permanent failure"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{RecordingProgress, SilentProgress};
    use recsync_extraction::ScriptedAgent;
    use recsync_shared::{ProgressLevel, RecsyncError};

    #[derive(Default)]
    struct CollectingSink {
        accepted: Vec<(String, FieldMap)>,
        fail_on: Option<String>,
    }

    impl RecordSink for CollectingSink {
        fn accept(&mut self, record_id: &str, fields: FieldMap) -> Result<()> {
            if self.fail_on.as_deref() == Some(record_id) {
                return Err(RecsyncError::Storage("disk full".into()));
            }
            self.accepted.push((record_id.to_string(), fields));
            Ok(())
        }
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn status(value: &str) -> FieldMap {
        FieldMap::from([("Status".to_string(), value.to_string())])
    }

    fn transient() -> std::result::Result<FieldMap, ExtractionError> {
        Err(ExtractionError::transient("timeout"))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_millis(1_500),
        };
        assert_eq!(policy.passes(), 6);
        assert_eq!(policy.backoff_before(1), Duration::ZERO);
        assert_eq!(policy.backoff_before(2), Duration::from_millis(500));
        assert_eq!(policy.backoff_before(3), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_before(4), Duration::from_millis(1_500));
        assert_eq!(policy.backoff_before(60), Duration::from_millis(1_500));
    }

    #[tokio::test]
    async fn second_record_succeeds_on_third_pass() {
        let mut agent = ScriptedAgent::new()
            .with_detail("A1", vec![Ok(status("New"))])
            .with_detail(
                "A2",
                vec![transient(), transient(), Ok(status("Closed"))],
            );
        let mut sink = CollectingSink::default();
        let progress = RecordingProgress::new();
        let orchestrator =
            RetryOrchestrator::new(RetryPolicy::immediate(2), CancellationToken::new(), &progress);

        let outcome = orchestrator
            .run(&ids(&["A1", "A2"]), &mut agent, &mut sink)
            .await
            .unwrap();

        assert_eq!(outcome.succeeded, ["A1", "A2"]);
        assert!(outcome.permanently_failed.is_empty());
        assert!(outcome.aborted.is_empty());
        assert_eq!(outcome.passes, 3);
        assert_eq!(agent.detail_calls("A1"), 1);
        assert_eq!(agent.detail_calls("A2"), 3);
        assert_eq!(sink.accepted[1].1["Status"], "Closed");
        assert_eq!(progress.messages(ProgressLevel::Warning).len(), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_become_permanent_failures() {
        let mut agent = ScriptedAgent::new()
            .with_detail("A1", vec![transient(), transient(), transient(), Ok(status("late"))])
            .with_detail("A2", vec![Ok(status("New"))]);
        let mut sink = CollectingSink::default();
        let orchestrator =
            RetryOrchestrator::new(RetryPolicy::immediate(2), CancellationToken::new(), &SilentProgress);

        let outcome = orchestrator
            .run(&ids(&["A1", "A2"]), &mut agent, &mut sink)
            .await
            .unwrap();

        assert_eq!(outcome.passes, 3);
        assert_eq!(outcome.succeeded, ["A2"]);
        assert_eq!(
            outcome.permanently_failed,
            [PermanentFailure {
                record_id: "A1".into(),
                attempts: 3,
                last_error: "transient: timeout".into(),
            }]
        );
        assert_eq!(outcome.state_of("A1"), Some(RecordState::PermanentlyFailed));
        assert_eq!(agent.detail_calls("A1"), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let mut agent = ScriptedAgent::new()
            .with_detail("A1", vec![Err(ExtractionError::fatal("malformed page"))]);
        let mut sink = CollectingSink::default();
        let orchestrator =
            RetryOrchestrator::new(RetryPolicy::immediate(2), CancellationToken::new(), &SilentProgress);

        let outcome = orchestrator
            .run(&ids(&["A1"]), &mut agent, &mut sink)
            .await
            .unwrap();

        assert_eq!(outcome.passes, 1);
        assert_eq!(outcome.permanently_failed[0].attempts, 1);
        assert_eq!(agent.detail_calls("A1"), 1);
    }

    #[tokio::test]
    async fn every_record_ends_in_exactly_one_terminal_state() {
        let scripts: Vec<(&str, Vec<std::result::Result<FieldMap, ExtractionError>>)> = vec![
            ("R1", vec![Ok(status("a"))]),
            ("R2", vec![transient(), Ok(status("b"))]),
            ("R3", vec![transient(), transient(), Ok(status("c"))]),
            ("R4", vec![transient(), transient(), transient()]),
            ("R5", vec![Err(ExtractionError::fatal("gone"))]),
        ];
        let mut agent = ScriptedAgent::new();
        for (id, script) in scripts {
            agent = agent.with_detail(id, script);
        }
        let mut sink = CollectingSink::default();
        let orchestrator =
            RetryOrchestrator::new(RetryPolicy::immediate(2), CancellationToken::new(), &SilentProgress);

        let all = ids(&["R1", "R2", "R3", "R4", "R5", "R2"]);
        let outcome = orchestrator.run(&all, &mut agent, &mut sink).await.unwrap();

        assert!(outcome.passes <= 3);
        assert_eq!(outcome.total(), 5);
        for id in ["R1", "R2", "R3"] {
            assert_eq!(outcome.state_of(id), Some(RecordState::Succeeded));
        }
        for id in ["R4", "R5"] {
            assert_eq!(outcome.state_of(id), Some(RecordState::PermanentlyFailed));
        }
        assert_eq!(agent.detail_calls("R2"), 2);
    }

    #[tokio::test]
    async fn cancellation_leaves_unfinished_records_aborted() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut agent = ScriptedAgent::new()
            .with_detail("A1", vec![Ok(status("New"))])
            .with_detail("A2", vec![Ok(status("New"))])
            .with_detail("A3", vec![Ok(status("New"))])
            .with_detail_hook(move |id| {
                if id == "A1" {
                    trigger.cancel();
                }
            });
        let mut sink = CollectingSink::default();
        let orchestrator = RetryOrchestrator::new(RetryPolicy::immediate(2), cancel, &SilentProgress);

        let outcome = orchestrator
            .run(&ids(&["A1", "A2", "A3"]), &mut agent, &mut sink)
            .await
            .unwrap();

        // The in-flight fetch completes; nothing after it starts.
        assert!(outcome.cancelled);
        assert_eq!(outcome.succeeded, ["A1"]);
        assert_eq!(outcome.aborted, ["A2", "A3"]);
        assert!(outcome.permanently_failed.is_empty());
        assert_eq!(agent.detail_calls("A2"), 0);
    }

    #[tokio::test]
    async fn cancellation_during_backoff_aborts_pending_retries() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut agent = ScriptedAgent::new()
            .with_detail("A1", vec![transient(), Ok(status("New"))])
            .with_detail_hook(move |_| trigger.cancel());
        let policy = RetryPolicy {
            max_retries: 2,
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(30),
        };
        let mut sink = CollectingSink::default();
        let orchestrator = RetryOrchestrator::new(policy, cancel, &SilentProgress);

        let outcome = orchestrator
            .run(&ids(&["A1"]), &mut agent, &mut sink)
            .await
            .unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.passes, 1);
        assert_eq!(outcome.aborted, ["A1"]);
        assert!(sink.accepted.is_empty());
    }

    #[tokio::test]
    async fn sink_errors_stop_the_run() {
        let mut agent = ScriptedAgent::new()
            .with_detail("A1", vec![Ok(status("New"))])
            .with_detail("A2", vec![Ok(status("New"))]);
        let mut sink = CollectingSink {
            fail_on: Some("A1".into()),
            ..CollectingSink::default()
        };
        let orchestrator =
            RetryOrchestrator::new(RetryPolicy::immediate(2), CancellationToken::new(), &SilentProgress);

        let err = orchestrator
            .run(&ids(&["A1", "A2"]), &mut agent, &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, RecsyncError::Storage(_)));
        assert_eq!(agent.detail_calls("A2"), 0);
    }
}
