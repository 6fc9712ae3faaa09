//! Messenger configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a messenger endpoint.
///
/// Durations are stored in milliseconds so the config can be loaded from
/// JSON as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MessengerConfig {
    /// How long a connection check waits for the background to answer.
    pub connect_timeout_ms: u64,

    /// Ceiling for ordinary method calls. `None` waits until the target
    /// replies or disconnects.
    pub call_timeout_ms: Option<u64>,
}

impl MessengerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 1000,
            call_timeout_ms: None,
        }
    }
}
