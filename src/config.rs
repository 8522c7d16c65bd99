use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::wire::{DEFAULT_INITIAL_BUFFER_SIZE, DEFAULT_MAX_BUFFER_SIZE};

/// Default period of the dispatch timer.
pub const DEFAULT_SEND_INTERVAL: Duration = Duration::from_millis(50);

/// Dispatcher settings.
///
/// Deserializable so it can be embedded in a service configuration file;
/// missing fields take their default values and the send interval is given in
/// milliseconds:
///
/// ```json
/// { "send_interval_ms": 50, "initial_buffer_size": 1024 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Period of the timer that dispatches one queued message per tick.
    #[serde(rename = "send_interval_ms", deserialize_with = "millis")]
    pub send_interval: Duration,
    /// Size of the first buffer a message is encoded into.
    pub initial_buffer_size: usize,
    /// Largest encode buffer; bigger messages are released unsent.
    pub max_buffer_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            send_interval: DEFAULT_SEND_INTERVAL,
            initial_buffer_size: DEFAULT_INITIAL_BUFFER_SIZE,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }
}

impl DispatcherConfig {
    pub fn with_send_interval(mut self, interval: Duration) -> Self {
        self.send_interval = interval;
        self
    }

    pub fn with_initial_buffer_size(mut self, size: usize) -> Self {
        self.initial_buffer_size = size;
        self
    }

    pub fn with_max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    /// Timer period actually used; a zero interval is bumped to one
    /// millisecond.
    pub(crate) fn tick_period(&self) -> Duration {
        self.send_interval.max(Duration::from_millis(1))
    }
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}
