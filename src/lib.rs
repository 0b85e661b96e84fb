//! A replicated, crash-durable command log.
//!
//! This crate provides the storage and replication kernel of a
//! leader-driven consensus system in the Raft family:
//!
//! - A [`Log`] of fixed-capacity, append-only [`Segment`]s, each with an
//!   auxiliary [`OffsetIndex`] mapping offsets to record positions. The
//!   log supports append, random read, truncate, skip and recovery from
//!   disk.
//! - A per-follower [`Replicator`] that batches entries into
//!   AppendEntries requests, keeps one append in flight, coalesces
//!   heartbeats and resolves commit futures in index order.
//! - A [`ReplicationGroup`] that fans out across followers and resolves
//!   commits once a majority of the cluster holds an entry of the
//!   current term.
//!
//! Transport, leader election, membership and state machine application
//! are consumed by interface only; see [`TransportClient`] and
//! [`ConsensusContext`].

pub mod config;
pub mod consensus;
pub mod descriptor;
pub mod entry;
pub mod error;
pub mod group;
pub mod io;
pub mod log;
pub mod offset_index;
pub mod replica_state;
pub mod replicator;
pub mod segment;
pub mod transport;

pub use config::LogConfig;
pub use consensus::{ConsensusContext, ConsensusState, MemberId, Role};
pub use descriptor::SegmentDescriptor;
pub use entry::{Entry, EntryKind};
pub use error::{Error, Result};
pub use group::ReplicationGroup;
pub use offset_index::OffsetIndex;
pub use replica_state::ReplicaState;
pub use replicator::{ProgressObserver, Replicator, BATCH_SIZE, COMMIT_WINDOW};
pub use segment::Segment;
pub use transport::{
    AppendEntriesRequest, AppendEntriesResponse, ResponseStatus, TransportClient,
};

pub use crate::log::Log;
