//! Log configuration.

use std::path::PathBuf;

/// Configuration for a [`Log`](crate::Log).
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory where segment files are stored.
    pub directory: PathBuf,
    /// Maximum data size of each segment in bytes.
    pub max_segment_size: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            directory: PathBuf::from("./replog"),
            max_segment_size: 64 * 1024 * 1024, // 64MB default
        }
    }
}
