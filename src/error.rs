//! Error types for the replicated log.

use std::io;

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for log storage and replication operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Operation on a closed or un-connected component.
    #[error("component is not open")]
    NotOpen,

    /// A higher term was observed and the leader stepped down.
    #[error("not the leader (observed term {term})")]
    NotLeader {
        /// Term observed from the remote peer.
        term: u64,
    },

    /// Attempt to append at an index that has already been written.
    #[error("cannot modify committed entry: index {index} is below next index {next_index}")]
    CommittedEntryModified {
        /// Index that was requested.
        index: u64,
        /// Next writable index of the segment.
        next_index: u64,
    },

    /// Attempt to append past the next writable index.
    #[error("non-monotonic append: index {index} is beyond next index {next_index}")]
    NonMonotonicIndex {
        /// Index that was requested.
        index: u64,
        /// Next writable index of the segment.
        next_index: u64,
    },

    /// Read with an index outside the segment or log bounds.
    #[error("index {index} out of range (valid range: {first}..={last})")]
    OutOfRange {
        /// Requested index.
        index: u64,
        /// First valid index.
        first: u64,
        /// Last valid index.
        last: u64,
    },

    /// Operation cancelled because the component was closed.
    #[error("operation cancelled by close")]
    Closed,

    /// Transport-layer failure; retryable at the caller's discretion.
    #[error("transport error: {0}")]
    Transport(String),

    /// Unknown record type byte, length mismatch or failed checksum.
    #[error("corrupted data: {0}")]
    Corruption(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_display() {
        let err = Error::CommittedEntryModified {
            index: 3,
            next_index: 5,
        };
        assert_eq!(
            err.to_string(),
            "cannot modify committed entry: index 3 is below next index 5"
        );

        let err = Error::OutOfRange {
            index: 9,
            first: 1,
            last: 4,
        };
        assert_eq!(err.to_string(), "index 9 out of range (valid range: 1..=4)");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();

        match err {
            Error::Io(_) => {}
            _ => panic!("Expected Io error variant"),
        }
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }
}
