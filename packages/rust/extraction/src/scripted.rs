//! Deterministic agent driven by per-record response scripts.
//!
//! Used by tests and dry runs: each record-id gets a queue of responses
//! consumed one per fetch, so a script like `[Transient, Ok]` models a
//! record that succeeds on its second attempt.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use recsync_shared::{BasicRecord, FieldMap};
use tracing::debug;

use crate::agent::{ExtractionAgent, ExtractionError};

type DetailHook = Box<dyn FnMut(&str) + Send>;

/// [`ExtractionAgent`] answering from pre-recorded scripts.
#[derive(Default)]
pub struct ScriptedAgent {
    lists: HashMap<String, VecDeque<Result<Vec<BasicRecord>, ExtractionError>>>,
    details: HashMap<String, VecDeque<Result<FieldMap, ExtractionError>>>,
    detail_calls: HashMap<String, u32>,
    list_calls: HashMap<String, u32>,
    on_detail: Option<DetailHook>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every basic-list request for `recipient` with `records`.
    pub fn with_list(self, recipient: impl Into<String>, records: Vec<BasicRecord>) -> Self {
        self.with_list_steps(recipient, vec![Ok(records)])
    }

    /// Script successive basic-list responses for `recipient`. The last
    /// successful response is repeated once the script runs out.
    pub fn with_list_steps(
        mut self,
        recipient: impl Into<String>,
        steps: Vec<Result<Vec<BasicRecord>, ExtractionError>>,
    ) -> Self {
        self.lists.insert(recipient.into(), steps.into());
        self
    }

    /// Script successive detail responses for `record_id`.
    pub fn with_detail(
        mut self,
        record_id: impl Into<String>,
        steps: Vec<Result<FieldMap, ExtractionError>>,
    ) -> Self {
        self.details.insert(record_id.into(), steps.into());
        self
    }

    /// Run `hook` with the record-id at the start of every detail fetch.
    pub fn with_detail_hook(mut self, hook: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_detail = Some(Box::new(hook));
        self
    }

    /// Number of detail fetches issued for `record_id`.
    pub fn detail_calls(&self, record_id: &str) -> u32 {
        self.detail_calls.get(record_id).copied().unwrap_or(0)
    }

    /// Number of basic-list fetches issued for `recipient`.
    pub fn list_calls(&self, recipient: &str) -> u32 {
        self.list_calls.get(recipient).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ExtractionAgent for ScriptedAgent {
    async fn fetch_basic_list(
        &mut self,
        recipient: &str,
    ) -> Result<Vec<BasicRecord>, ExtractionError> {
        *self.list_calls.entry(recipient.to_string()).or_default() += 1;

        let Some(script) = self.lists.get_mut(recipient) else {
            return Err(ExtractionError::fatal(format!("no records for recipient {recipient}")));
        };
        match script.len() {
            0 => Err(ExtractionError::fatal(format!("list script for {recipient} exhausted"))),
            // Keep the final step so repeated runs see a stable list.
            1 => script
                .front()
                .cloned()
                .unwrap_or_else(|| Err(ExtractionError::fatal("empty list script"))),
            _ => script
                .pop_front()
                .unwrap_or_else(|| Err(ExtractionError::fatal("empty list script"))),
        }
    }

    async fn fetch_detail(&mut self, record_id: &str) -> Result<FieldMap, ExtractionError> {
        if let Some(hook) = self.on_detail.as_mut() {
            hook(record_id);
        }
        let calls = self.detail_calls.entry(record_id.to_string()).or_default();
        *calls += 1;
        debug!(record_id, attempt = *calls, "scripted detail fetch");

        self.details
            .get_mut(record_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                Err(ExtractionError::fatal(format!(
                    "no scripted response for {record_id}"
                )))
            })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detail(title: &str) -> FieldMap {
        FieldMap::from([("Title_AD".to_string(), title.to_string())])
    }

    #[tokio::test]
    async fn detail_script_is_consumed_in_order() {
        let mut agent = ScriptedAgent::new().with_detail(
            "A1",
            vec![Err(ExtractionError::transient("timeout")), Ok(detail("Widget"))],
        );

        assert!(agent.fetch_detail("A1").await.unwrap_err().is_retryable());
        assert_eq!(agent.fetch_detail("A1").await.unwrap()["Title_AD"], "Widget");
        // Exhausted scripts fail permanently.
        assert!(!agent.fetch_detail("A1").await.unwrap_err().is_retryable());
        assert_eq!(agent.detail_calls("A1"), 3);
        assert_eq!(agent.detail_calls("A2"), 0);
    }

    #[tokio::test]
    async fn list_repeats_final_step() {
        let records = vec![BasicRecord::new("A1", FieldMap::new())];
        let mut agent = ScriptedAgent::new().with_list_steps(
            "r",
            vec![Err(ExtractionError::transient("busy")), Ok(records.clone())],
        );

        assert!(agent.fetch_basic_list("r").await.is_err());
        assert_eq!(agent.fetch_basic_list("r").await.unwrap(), records);
        assert_eq!(agent.fetch_basic_list("r").await.unwrap(), records);
        assert_eq!(agent.list_calls("r"), 3);
        assert!(agent.fetch_basic_list("other").await.is_err());
    }

    #[tokio::test]
    async fn hook_sees_every_detail_fetch() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut agent = ScriptedAgent::new()
            .with_detail("A1", vec![Ok(detail("x"))])
            .with_detail_hook(move |id| sink.lock().unwrap().push(id.to_string()));

        agent.fetch_detail("A1").await.unwrap();
        let _ = agent.fetch_detail("B2").await;
        assert_eq!(*seen.lock().unwrap(), vec!["A1", "B2"]);
    }
}
