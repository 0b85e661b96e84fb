//! Shared consensus state.
//!
//! The replication engine mutates global consensus state on stepdown but
//! is itself owned transitively by it. The [`ConsensusContext`] trait is
//! the capability handle that breaks that cycle: replicators hold it to
//! read the term, allocate correlation ids and trigger the follower
//! transition without a raw reference to the owning server.

use log::info;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Identifier of a cluster member.
pub type MemberId = u64;

/// Role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Passive state, receives entries from the leader.
    Follower,
    /// Actively seeking votes to become leader.
    Candidate,
    /// Accepts client commands and replicates the log.
    Leader,
}

/// Capability handle to the consensus state consumed by the replication
/// engine.
pub trait ConsensusContext: Send + Sync {
    /// Returns the current term.
    fn current_term(&self) -> u64;

    /// Returns the current commit index.
    fn commit_index(&self) -> u64;

    /// Advances the commit index, never regressing it. Returns the commit
    /// index after the update.
    fn advance_commit_index(&self, index: u64) -> u64;

    /// Returns the current role.
    fn role(&self) -> Role;

    /// Returns the identity of the local member.
    fn local_member(&self) -> MemberId;

    /// Allocates the next request correlation id.
    fn next_correlation_id(&self) -> u64;

    /// Returns the member currently believed to be leader.
    fn leader(&self) -> Option<MemberId>;

    /// Records the member currently believed to be leader.
    fn set_leader(&self, leader: Option<MemberId>);

    /// Handles observing a term higher than our own: adopts the term,
    /// clears the leader and transitions to follower, all atomically.
    fn observe_term(&self, term: u64);
}

/// Concrete consensus state record.
///
/// Word-sized fields are atomics for lock-free reads; transitions happen
/// under a single lock so that term, leader and role change together.
#[derive(Debug)]
pub struct ConsensusState {
    local: MemberId,
    current_term: AtomicU64,
    commit_index: AtomicU64,
    correlation: AtomicU64,
    transition: Mutex<TransitionState>,
}

#[derive(Debug)]
struct TransitionState {
    leader: Option<MemberId>,
    role: Role,
}

impl ConsensusState {
    /// Creates consensus state for the given local member, starting as a
    /// follower in the given term.
    pub fn new(local: MemberId, term: u64) -> Self {
        ConsensusState {
            local,
            current_term: AtomicU64::new(term),
            commit_index: AtomicU64::new(0),
            correlation: AtomicU64::new(0),
            transition: Mutex::new(TransitionState {
                leader: None,
                role: Role::Follower,
            }),
        }
    }

    /// Transitions this node to leader for the given term. Used by the
    /// election machinery when a vote majority is won.
    pub fn become_leader(&self, term: u64) {
        let mut transition = self.transition.lock().unwrap();
        self.current_term.store(term, Ordering::SeqCst);
        transition.leader = Some(self.local);
        transition.role = Role::Leader;
        info!("member {} became leader for term {}", self.local, term);
    }
}

impl ConsensusContext for ConsensusState {
    fn current_term(&self) -> u64 {
        self.current_term.load(Ordering::SeqCst)
    }

    fn commit_index(&self) -> u64 {
        self.commit_index.load(Ordering::SeqCst)
    }

    fn advance_commit_index(&self, index: u64) -> u64 {
        self.commit_index
            .fetch_max(index, Ordering::SeqCst)
            .max(index)
    }

    fn role(&self) -> Role {
        self.transition.lock().unwrap().role
    }

    fn local_member(&self) -> MemberId {
        self.local
    }

    fn next_correlation_id(&self) -> u64 {
        self.correlation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn leader(&self) -> Option<MemberId> {
        self.transition.lock().unwrap().leader
    }

    fn set_leader(&self, leader: Option<MemberId>) {
        self.transition.lock().unwrap().leader = leader;
    }

    fn observe_term(&self, term: u64) {
        let mut transition = self.transition.lock().unwrap();
        if term > self.current_term.load(Ordering::SeqCst) {
            info!(
                "member {} observed higher term {}, stepping down to follower",
                self.local, term
            );
            self.current_term.store(term, Ordering::SeqCst);
            transition.leader = None;
            transition.role = Role::Follower;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = ConsensusState::new(1, 1);
        assert_eq!(state.current_term(), 1);
        assert_eq!(state.commit_index(), 0);
        assert_eq!(state.local_member(), 1);
        assert_eq!(state.role(), Role::Follower);
        assert_eq!(state.leader(), None);
    }

    #[test]
    fn test_become_leader() {
        let state = ConsensusState::new(1, 1);
        state.become_leader(2);
        assert_eq!(state.role(), Role::Leader);
        assert_eq!(state.current_term(), 2);
        assert_eq!(state.leader(), Some(1));
    }

    #[test]
    fn test_observe_higher_term_steps_down() {
        let state = ConsensusState::new(1, 1);
        state.become_leader(2);

        state.observe_term(3);
        assert_eq!(state.current_term(), 3);
        assert_eq!(state.role(), Role::Follower);
        assert_eq!(state.leader(), None);
    }

    #[test]
    fn test_observe_stale_term_is_ignored() {
        let state = ConsensusState::new(1, 5);
        state.become_leader(5);

        state.observe_term(4);
        assert_eq!(state.current_term(), 5);
        assert_eq!(state.role(), Role::Leader);
    }

    #[test]
    fn test_commit_index_never_regresses() {
        let state = ConsensusState::new(1, 1);
        assert_eq!(state.advance_commit_index(10), 10);
        assert_eq!(state.advance_commit_index(5), 10);
        assert_eq!(state.commit_index(), 10);
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        let state = ConsensusState::new(1, 1);
        let a = state.next_correlation_id();
        let b = state.next_correlation_id();
        assert!(b > a);
    }
}
