//! Transaction store configuration.

use std::time::Duration;

/// Configuration for a transaction store.
#[derive(Debug, Clone)]
pub struct TxnConfig {
    /// Whether to flush the transaction log after every record.
    pub sync_on_commit: bool,

    /// How long an active transaction may go without a keep-alive before
    /// readers treat it as rolled back.
    pub transaction_timeout: Duration,

    /// Number of partitions for [`PartitionedTxnStore`](crate::PartitionedTxnStore).
    pub partitions: usize,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            sync_on_commit: true,
            transaction_timeout: Duration::from_secs(60),
            partitions: 16,
        }
    }
}

impl TxnConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to flush the log after every record.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the keep-alive timeout.
    #[must_use]
    pub const fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    /// Sets the partition count.
    #[must_use]
    pub const fn partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }

    pub(crate) fn timeout_millis(&self) -> u64 {
        u64::try_from(self.transaction_timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = TxnConfig::default();
        assert!(config.sync_on_commit);
        assert_eq!(config.transaction_timeout, Duration::from_secs(60));
        assert_eq!(config.partitions, 16);
    }

    #[test]
    fn builder_pattern() {
        let config = TxnConfig::new()
            .sync_on_commit(false)
            .transaction_timeout(Duration::from_millis(250))
            .partitions(4);

        assert!(!config.sync_on_commit);
        assert_eq!(config.timeout_millis(), 250);
        assert_eq!(config.partitions, 4);
    }
}
