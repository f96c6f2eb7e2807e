//! Runtime tuning for the duplicate-resolution pipeline.

use std::time::Duration;

/// Tuning knobs. Defaults are conservative; an embedding node binary maps
/// its CLI/env settings onto this struct.
#[derive(Clone, Debug)]
pub struct Config {
    /// Delay before an unanswered duplicate request is retransmitted.
    pub transaction_retry_interval: Duration,
    /// End-to-end transaction deadline.
    pub transaction_max: Duration,
    /// How often the retransmit sweep scans the in-flight table.
    pub retransmit_scan_interval: Duration,
    /// Partition count per namespace.
    pub n_partitions: u32,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            transaction_retry_interval: Duration::from_millis(1000),
            transaction_max: Duration::from_millis(1000),
            retransmit_scan_interval: Duration::from_millis(100),
            n_partitions: 256,
        }
    }
}
