//! Dispatcher configuration, loaded from environment variables with defaults.
//!
//! A serde-derived settings struct, populated by reading `std::env::var` and
//! falling back to hardcoded defaults rather than failing when a variable is
//! absent.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bound on iterations per trace window (`maximumItemsPerTrace`).
const DEFAULT_MAX_ITEMS_PER_TRACE: u32 = 1000;
/// Wall-clock bound per trace window, in seconds (`traceTimeoutSeconds`).
const DEFAULT_TRACE_TIMEOUT_SECONDS: u64 = 60;
/// Resumption delay after an empty dequeue.
const DEFAULT_EMPTY_DEQUEUE_DELAY_MS: u64 = 1000;
/// Resumption delay after a handled (poison/ack/nack) iteration.
const DEFAULT_SHORT_RESUME_DELAY_MS: u64 = 100;
/// Default visibility extension granted by a heartbeat.
const DEFAULT_HEARTBEAT_EXTEND_SECONDS: u64 = 60;

/// Runtime-tunable dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub max_items_per_trace: u32,
    pub trace_timeout: Duration,
    pub empty_dequeue_delay: Duration,
    pub short_resume_delay: Duration,
    pub heartbeat_extend: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_items_per_trace: DEFAULT_MAX_ITEMS_PER_TRACE,
            trace_timeout: Duration::from_secs(DEFAULT_TRACE_TIMEOUT_SECONDS),
            empty_dequeue_delay: Duration::from_millis(DEFAULT_EMPTY_DEQUEUE_DELAY_MS),
            short_resume_delay: Duration::from_millis(DEFAULT_SHORT_RESUME_DELAY_MS),
            heartbeat_extend: Duration::from_secs(DEFAULT_HEARTBEAT_EXTEND_SECONDS),
        }
    }
}

impl DispatcherConfig {
    /// Build configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("DISPATCHER_MAX_ITEMS_PER_TRACE") {
            if let Ok(parsed) = raw.parse() {
                config.max_items_per_trace = parsed;
            }
        }
        if let Ok(raw) = std::env::var("DISPATCHER_TRACE_TIMEOUT_SECONDS") {
            if let Ok(parsed) = raw.parse() {
                config.trace_timeout = Duration::from_secs(parsed);
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = DispatcherConfig::default();
        assert_eq!(config.max_items_per_trace, 1000);
        assert_eq!(config.trace_timeout, Duration::from_secs(60));
    }

    #[test]
    fn env_override() {
        std::env::set_var("DISPATCHER_MAX_ITEMS_PER_TRACE", "42");
        let config = DispatcherConfig::from_env();
        assert_eq!(config.max_items_per_trace, 42);
        std::env::remove_var("DISPATCHER_MAX_ITEMS_PER_TRACE");
    }
}
