//! Process-ending conditions
//!
//! Library code never panics on a fatal condition. It reports the reason to a
//! [`FatalHandler`] which decides how the process ends.

use parking_lot::Mutex;
use tracing::error;

pub trait FatalHandler: Send + Sync {
    /// Terminate the local process. Implementations used outside tests do
    /// not return.
    fn crash_local(&self, reason: &str);
}

/// Logs the reason and exits with a non-zero status
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExit;

impl FatalHandler for ProcessExit {
    fn crash_local(&self, reason: &str) {
        error!("Fatal error, terminating: {}", reason);
        std::process::exit(1);
    }
}

/// Records fatal reasons instead of exiting
#[derive(Debug, Default)]
pub struct RecordingFatalHandler {
    reasons: Mutex<Vec<String>>,
}

impl RecordingFatalHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.reasons.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.reasons.lock().len()
    }
}

impl FatalHandler for RecordingFatalHandler {
    fn crash_local(&self, reason: &str) {
        error!("Fatal error recorded: {}", reason);
        self.reasons.lock().push(reason.to_string());
    }
}
