//! Bounds consecutive dispatches under one tracing span by item count and
//! elapsed time, so a busy environment doesn't produce one span per message.

use crate::model::AuthenticatedEnvironment;
use crate::trace_recorder::{TraceRecorder, WindowSpan};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct TraceWindowConfig {
    pub max_items: u32,
    pub window_timeout: Duration,
}

impl Default for TraceWindowConfig {
    fn default() -> Self {
        Self {
            max_items: 1000,
            window_timeout: Duration::from_secs(60),
        }
    }
}

/// Owns at most one open span at a time. Every dispatched message is counted
/// in exactly one window; rollover closes the current span before opening
/// the next one, so spans are never nested.
pub struct TraceWindow {
    recorder: Arc<dyn TraceRecorder>,
    config: TraceWindowConfig,
    span: Option<Box<dyn WindowSpan>>,
    remaining_items: u32,
    opened_at: Option<Instant>,
    successes: u64,
    failures: u64,
    force_rollover: bool,
}

impl TraceWindow {
    pub fn new(recorder: Arc<dyn TraceRecorder>, config: TraceWindowConfig) -> Self {
        Self {
            recorder,
            config,
            span: None,
            remaining_items: 0,
            opened_at: None,
            successes: 0,
            failures: 0,
            force_rollover: false,
        }
    }

    /// Roll over if any bound is crossed, then open a span if none is open.
    /// Must be called before each dispatch iteration.
    pub fn ensure_open(&mut self, environment: &AuthenticatedEnvironment) {
        if self.should_roll_over() {
            self.close();
        }
        if self.span.is_none() {
            self.span = Some(self.recorder.start_window_span(environment));
            self.remaining_items = self.config.max_items;
            self.opened_at = Some(Instant::now());
            self.successes = 0;
            self.failures = 0;
            self.force_rollover = false;
        }
    }

    fn should_roll_over(&self) -> bool {
        if self.span.is_none() {
            return false;
        }
        if self.remaining_items == 0 {
            return true;
        }
        if let Some(opened_at) = self.opened_at {
            if opened_at.elapsed() > self.config.window_timeout {
                return true;
            }
        }
        self.force_rollover
    }

    pub fn record_dispatch(&mut self) {
        self.remaining_items = self.remaining_items.saturating_sub(1);
    }

    pub fn record_success(&mut self) {
        self.successes += 1;
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
    }

    /// Record a transport exception on the current span and force the next
    /// `ensure_open` to roll over, even if the count/time bounds aren't hit.
    pub fn record_exception(&mut self, message: &str) {
        if let Some(span) = self.span.as_mut() {
            span.record_exception(message);
        }
        self.force_rollover = true;
    }

    #[cfg(test)]
    pub fn successes_for_test(&self) -> u64 {
        self.successes
    }

    #[cfg(test)]
    pub fn failures_for_test(&self) -> u64 {
        self.failures
    }

    fn close(&mut self) {
        if let Some(span) = self.span.take() {
            span.end(self.successes, self.failures);
        }
    }
}

impl Drop for TraceWindow {
    fn drop(&mut self) {
        self.close();
    }
}
