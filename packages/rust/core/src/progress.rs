//! Progress reporting contract between the engine and whatever renders it.

use std::sync::Mutex;

use recsync_shared::{ProgressEvent, ProgressLevel};

/// Receives structured progress events from a run.
///
/// The engine makes no assumption about rendering: implementations may draw a
/// spinner, append to a log pane, or drop events entirely.
pub trait ProgressObserver: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);

    fn status(&self, message: &str) {
        self.on_event(&ProgressEvent::new(ProgressLevel::Status, message));
    }

    fn success(&self, message: &str) {
        self.on_event(&ProgressEvent::new(ProgressLevel::Success, message));
    }

    fn warning(&self, message: &str) {
        self.on_event(&ProgressEvent::new(ProgressLevel::Warning, message));
    }

    fn error(&self, message: &str) {
        self.on_event(&ProgressEvent::new(ProgressLevel::Error, message));
    }
}

/// No-op observer for headless/test usage.
pub struct SilentProgress;

impl ProgressObserver for SilentProgress {
    fn on_event(&self, _event: &ProgressEvent) {}
}

/// Observer that keeps every event in memory.
#[derive(Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events received so far.
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Messages of every event at `level`, in arrival order.
    pub fn messages(&self, level: ProgressLevel) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.level == level)
            .map(|e| e.message)
            .collect()
    }
}

impl ProgressObserver for RecordingProgress {
    fn on_event(&self, event: &ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
