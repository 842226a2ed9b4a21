//! Warning sinks
//!
//! Recovery code reports what it repaired through a [`WarnSink`] handed to it
//! at construction. A sink must never write into the queue being recovered:
//! logging into a half-repaired segment could corrupt it again.

use parking_lot::Mutex;
use std::sync::Arc;

/// Receiver of recovery and listing warnings.
pub trait WarnSink: Send + Sync {
    /// Report one warning
    fn warn(&self, component: &'static str, message: &str);
}

/// Shared handle to a sink
pub type SharedWarnSink = Arc<dyn WarnSink>;

/// Sends warnings to `tracing` under the `strata_queue::recovery` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingWarnSink;

impl WarnSink for TracingWarnSink {
    fn warn(&self, component: &'static str, message: &str) {
        tracing::warn!(target: "strata_queue::recovery", component, "{}", message);
    }
}

/// Keeps every warning in memory, for tests and monitoring tools.
#[derive(Debug, Default)]
pub struct CollectingWarnSink {
    messages: Mutex<Vec<String>>,
}

impl CollectingWarnSink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything reported so far
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    /// Number of warnings containing `needle`
    pub fn count_containing(&self, needle: &str) -> usize {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.contains(needle))
            .count()
    }

    /// Number of warnings reported
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    /// True when nothing was reported
    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

impl WarnSink for CollectingWarnSink {
    fn warn(&self, component: &'static str, message: &str) {
        self.messages.lock().push(format!("{}: {}", component, message));
    }
}

/// The default sink as a shared handle.
pub fn tracing_sink() -> SharedWarnSink {
    Arc::new(TracingWarnSink)
}
