//! Write pipeline configuration.

use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Multipliers applied to the client pause on successive retries.
pub const RETRY_BACKOFF: [u32; 11] = [1, 1, 1, 2, 2, 4, 4, 8, 16, 32, 64];

/// What a buffer does when a flush would exceed its in-flight limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressurePolicy {
    /// Wait for the oldest in-flight flush to finish.
    #[default]
    Block,
    /// Fail the flush with `Rejected`, keeping the rows buffered.
    Reject,
}

/// Flush thresholds of one call buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfiguration {
    /// Flush once the encoded size of buffered rows reaches this many bytes.
    pub max_heap_size: usize,
    /// Flush once this many rows are buffered.
    pub max_entries: usize,
    /// Maximum flushes of one buffer in flight at once.
    pub max_flushes_per_region: usize,
}

impl Default for BufferConfiguration {
    fn default() -> Self {
        PipelineConfig::default().buffer_configuration()
    }
}

impl BufferConfiguration {
    /// Sets the row count threshold. Zero is treated as one.
    #[must_use]
    pub const fn max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = if max_entries == 0 { 1 } else { max_entries };
        self
    }

    /// Sets the byte size threshold.
    #[must_use]
    pub const fn max_heap_size(mut self, bytes: usize) -> Self {
        self.max_heap_size = bytes;
        self
    }

    /// Sets the in-flight flush limit. Zero is treated as one.
    #[must_use]
    pub const fn max_flushes_per_region(mut self, limit: usize) -> Self {
        self.max_flushes_per_region = if limit == 0 { 1 } else { limit };
        self
    }

    /// Raises zero row and in-flight limits to one. Applied by every buffer,
    /// so a configuration built as a struct literal behaves like one built
    /// through the setters.
    #[must_use]
    pub const fn normalized(self) -> Self {
        self.max_entries(self.max_entries)
            .max_flushes_per_region(self.max_flushes_per_region)
    }
}

/// Configuration of a [`WriteCoordinator`](crate::WriteCoordinator).
///
/// Deserializes from the camelCase option names, with `clientPause` given in
/// milliseconds:
///
/// ```rust
/// use sitx_pipeline::{BackpressurePolicy, PipelineConfig};
///
/// let config: PipelineConfig = serde_json::from_str(
///     r#"{"maxBufferEntries": 10, "clientPause": 5, "backpressure": "reject"}"#,
/// ).unwrap();
/// assert_eq!(config.max_buffer_entries, 10);
/// assert_eq!(config.backpressure, BackpressurePolicy::Reject);
/// assert_eq!(config.max_retries, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    /// Row count flush threshold.
    pub max_buffer_entries: usize,
    /// Byte size flush threshold.
    pub max_buffer_heap_size: usize,
    /// Retries per row before its last status is surfaced.
    pub max_retries: u32,
    /// Base pause between retries.
    #[serde(deserialize_with = "millis")]
    pub client_pause: Duration,
    /// In-flight flush limit per buffer.
    pub write_max_flushes_per_region: usize,
    /// Size limit of the async worker pool.
    pub max_async_threads: usize,
    /// Behaviour at the in-flight flush limit.
    pub backpressure: BackpressurePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_buffer_entries: 1000,
            max_buffer_heap_size: 3 * 1024 * 1024,
            max_retries: 5,
            client_pause: Duration::from_millis(1000),
            write_max_flushes_per_region: 5,
            max_async_threads: 100,
            backpressure: BackpressurePolicy::Block,
        }
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the row count flush threshold.
    #[must_use]
    pub const fn max_buffer_entries(mut self, value: usize) -> Self {
        self.max_buffer_entries = value;
        self
    }

    /// Sets the byte size flush threshold.
    #[must_use]
    pub const fn max_buffer_heap_size(mut self, value: usize) -> Self {
        self.max_buffer_heap_size = value;
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub const fn max_retries(mut self, value: u32) -> Self {
        self.max_retries = value;
        self
    }

    /// Sets the base retry pause.
    #[must_use]
    pub const fn client_pause(mut self, value: Duration) -> Self {
        self.client_pause = value;
        self
    }

    /// Sets the in-flight flush limit per buffer.
    #[must_use]
    pub const fn write_max_flushes_per_region(mut self, value: usize) -> Self {
        self.write_max_flushes_per_region = value;
        self
    }

    /// Sets the async worker pool size.
    #[must_use]
    pub const fn max_async_threads(mut self, value: usize) -> Self {
        self.max_async_threads = value;
        self
    }

    /// Sets the backpressure policy.
    #[must_use]
    pub const fn backpressure(mut self, value: BackpressurePolicy) -> Self {
        self.backpressure = value;
        self
    }

    /// Thresholds handed to every buffer this configuration creates.
    #[must_use]
    pub fn buffer_configuration(&self) -> BufferConfiguration {
        BufferConfiguration {
            max_heap_size: self.max_buffer_heap_size,
            max_entries: self.max_buffer_entries.max(1),
            max_flushes_per_region: self.write_max_flushes_per_region.max(1),
        }
    }

    /// Pause before retry number `attempt` (zero-based).
    #[must_use]
    pub fn pause_for(&self, attempt: u32) -> Duration {
        let index = (attempt as usize).min(RETRY_BACKOFF.len() - 1);
        self.client_pause.saturating_mul(RETRY_BACKOFF[index])
    }
}
