//! Transport interface and AppendEntries wire types.
//!
//! The replication engine consumes the transport by interface only; an
//! RPC implementation lives outside this crate.

use crate::{Entry, MemberId, Result};
use async_trait::async_trait;

/// AppendEntries request - sent by the leader to replicate log entries;
/// also used as heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendEntriesRequest {
    /// Correlation id tying the response back to this request.
    pub correlation_id: u64,
    /// Leader's term.
    pub term: u64,
    /// Leader identity, so the follower can redirect clients.
    pub leader: MemberId,
    /// Index of the log entry immediately preceding the new ones.
    pub prev_log_index: u64,
    /// Term of the entry at `prev_log_index`, or 0 at the start of the log.
    pub prev_log_term: u64,
    /// Entries to store; empty for a heartbeat.
    pub entries: Vec<Entry>,
    /// Leader's commit index.
    pub leader_commit: u64,
}

impl AppendEntriesRequest {
    /// Creates a heartbeat request carrying no entries.
    pub fn heartbeat(
        correlation_id: u64,
        term: u64,
        leader: MemberId,
        prev_log_index: u64,
        prev_log_term: u64,
        leader_commit: u64,
    ) -> Self {
        AppendEntriesRequest {
            correlation_id,
            term,
            leader,
            prev_log_index,
            prev_log_term,
            entries: Vec::new(),
            leader_commit,
        }
    }

    /// Returns true if this request carries no entries.
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of entries in this request.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

/// Outcome category of an AppendEntries exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    /// The follower processed the request.
    Ok,
    /// The follower failed before processing; see the error field.
    Error,
}

/// AppendEntries response.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendEntriesResponse {
    /// Outcome category.
    pub status: ResponseStatus,
    /// Follower's current term, for the leader to update itself.
    pub term: u64,
    /// True if the follower matched `prev_log_index`/`prev_log_term` and
    /// stored the entries.
    pub succeeded: bool,
    /// Follower's last log index, used to regress quickly after a reject.
    pub last_log_index: u64,
    /// Error description when `status` is [`ResponseStatus::Error`].
    pub error: Option<String>,
}

impl AppendEntriesResponse {
    /// Creates a successful response.
    pub fn success(term: u64, last_log_index: u64) -> Self {
        AppendEntriesResponse {
            status: ResponseStatus::Ok,
            term,
            succeeded: true,
            last_log_index,
            error: None,
        }
    }

    /// Creates a logical-failure response (the follower's log diverged).
    pub fn failure(term: u64, last_log_index: u64) -> Self {
        AppendEntriesResponse {
            status: ResponseStatus::Ok,
            term,
            succeeded: false,
            last_log_index,
            error: None,
        }
    }

    /// Creates an error response.
    pub fn error(term: u64, message: impl Into<String>) -> Self {
        AppendEntriesResponse {
            status: ResponseStatus::Error,
            term,
            succeeded: false,
            last_log_index: 0,
            error: Some(message.into()),
        }
    }
}

/// Client side of the transport to one remote member.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Establishes the connection.
    async fn connect(&self) -> Result<()>;

    /// Releases the connection.
    async fn close(&self) -> Result<()>;

    /// Sends an AppendEntries request and awaits the response.
    async fn append_entries(&self, request: AppendEntriesRequest) -> Result<AppendEntriesResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_request() {
        let heartbeat = AppendEntriesRequest::heartbeat(7, 2, 100, 5, 1, 3);
        assert_eq!(heartbeat.correlation_id, 7);
        assert_eq!(heartbeat.term, 2);
        assert_eq!(heartbeat.leader, 100);
        assert_eq!(heartbeat.prev_log_index, 5);
        assert_eq!(heartbeat.prev_log_term, 1);
        assert_eq!(heartbeat.leader_commit, 3);
        assert!(heartbeat.is_heartbeat());
        assert_eq!(heartbeat.entry_count(), 0);
    }

    #[test]
    fn test_entry_request() {
        let entries = vec![
            Entry::new(1, 1, b"cmd1".to_vec()),
            Entry::new(1, 2, b"cmd2".to_vec()),
        ];
        let request = AppendEntriesRequest {
            correlation_id: 1,
            term: 1,
            leader: 100,
            prev_log_index: 0,
            prev_log_term: 0,
            entries,
            leader_commit: 0,
        };
        assert!(!request.is_heartbeat());
        assert_eq!(request.entry_count(), 2);
    }

    #[test]
    fn test_response_constructors() {
        let success = AppendEntriesResponse::success(5, 10);
        assert_eq!(success.status, ResponseStatus::Ok);
        assert!(success.succeeded);
        assert_eq!(success.last_log_index, 10);

        let failure = AppendEntriesResponse::failure(6, 8);
        assert_eq!(failure.status, ResponseStatus::Ok);
        assert!(!failure.succeeded);
        assert_eq!(failure.last_log_index, 8);

        let error = AppendEntriesResponse::error(6, "connection reset");
        assert_eq!(error.status, ResponseStatus::Error);
        assert_eq!(error.error.as_deref(), Some("connection reset"));
    }
}
