//! Per-follower replication engine.
//!
//! A replicator owns the leader's view of one follower: it batches log
//! entries into AppendEntries requests, keeps at most one append in
//! flight, coalesces heartbeats, and resolves commit futures in index
//! order as the follower acknowledges progress. Observing a higher term
//! in any response triggers stepdown through the consensus handle.

use crate::transport::ResponseStatus;
use crate::{
    AppendEntriesRequest, ConsensusContext, Error, Log, MemberId, ReplicaState, Result, Role,
    TransportClient,
};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::oneshot;

/// Maximum number of entries walked per AppendEntries batch.
pub const BATCH_SIZE: u64 = 100;

/// How far past the log tail a commit may be registered before it is
/// rejected. Bounds the pending-future map under a stalled peer.
pub const COMMIT_WINDOW: u64 = 1024;

/// Receives progress notifications as follower acknowledgements arrive.
pub trait ProgressObserver: Send + Sync {
    /// Called after the match index for `member` advanced.
    fn match_index_advanced(&self, member: MemberId, match_index: u64);
}

/// Replicates the log to a single follower.
///
/// All progress mutation is serialized behind one lock; transport
/// exchanges run on spawned tasks and re-enter through the same lock, so
/// the replicator behaves as a single-writer actor. The lock is never
/// held across an await point.
#[derive(Clone)]
pub struct Replicator {
    shared: Arc<Shared>,
}

struct Shared {
    member: MemberId,
    consensus: Arc<dyn ConsensusContext>,
    log: Arc<RwLock<Log>>,
    transport: Arc<dyn TransportClient>,
    observer: Option<Arc<dyn ProgressObserver>>,
    state: Mutex<State>,
}

struct State {
    open: bool,
    closed: bool,
    progress: ReplicaState,
    /// A heartbeat is in flight; concurrent pings attach to it.
    pinging: bool,
    /// An append is in flight; drive() is re-entered on its response.
    appending: bool,
    ping_waiters: Vec<oneshot::Sender<Result<u64>>>,
    commit_waiters: BTreeMap<u64, Vec<oneshot::Sender<Result<u64>>>>,
}

impl State {
    fn fail_pings(&mut self, make: &dyn Fn() -> Error) {
        for waiter in self.ping_waiters.drain(..) {
            let _ = waiter.send(Err(make()));
        }
    }

    fn fail_commit_range(&mut self, start: u64, end: u64, make: &dyn Fn() -> Error) {
        if end < start {
            return;
        }
        let keys: Vec<u64> = self
            .commit_waiters
            .range(start..=end)
            .map(|(key, _)| *key)
            .collect();
        for key in keys {
            if let Some(waiters) = self.commit_waiters.remove(&key) {
                for waiter in waiters {
                    let _ = waiter.send(Err(make()));
                }
            }
        }
    }

    fn fail_all(&mut self, make: &dyn Fn() -> Error) {
        self.fail_pings(make);
        let waiters = std::mem::take(&mut self.commit_waiters);
        for (_, senders) in waiters {
            for sender in senders {
                let _ = sender.send(Err(make()));
            }
        }
    }

    /// Resolves commit futures up to the match index, in index order.
    fn resolve_commits_up_to(&mut self, match_index: u64) {
        let pending = self.commit_waiters.split_off(&(match_index + 1));
        let resolved = std::mem::replace(&mut self.commit_waiters, pending);
        for (index, waiters) in resolved {
            for waiter in waiters {
                let _ = waiter.send(Ok(index));
            }
        }
    }
}

impl Replicator {
    /// Creates a replicator for the given follower, probing from the
    /// leader's current last log index.
    pub fn new(
        member: MemberId,
        consensus: Arc<dyn ConsensusContext>,
        log: Arc<RwLock<Log>>,
        transport: Arc<dyn TransportClient>,
    ) -> Self {
        Self::build(member, consensus, log, transport, None)
    }

    /// Creates a replicator that reports progress to the given observer.
    pub fn with_observer(
        member: MemberId,
        consensus: Arc<dyn ConsensusContext>,
        log: Arc<RwLock<Log>>,
        transport: Arc<dyn TransportClient>,
        observer: Arc<dyn ProgressObserver>,
    ) -> Self {
        Self::build(member, consensus, log, transport, Some(observer))
    }

    fn build(
        member: MemberId,
        consensus: Arc<dyn ConsensusContext>,
        log: Arc<RwLock<Log>>,
        transport: Arc<dyn TransportClient>,
        observer: Option<Arc<dyn ProgressObserver>>,
    ) -> Self {
        let last_log_index = log.read().unwrap().last_index();
        Replicator {
            shared: Arc::new(Shared {
                member,
                consensus,
                log,
                transport,
                observer,
                state: Mutex::new(State {
                    open: false,
                    closed: false,
                    progress: ReplicaState::new(last_log_index),
                    pinging: false,
                    appending: false,
                    ping_waiters: Vec::new(),
                    commit_waiters: BTreeMap::new(),
                }),
            }),
        }
    }

    /// Returns the follower this replicator drives.
    pub fn member(&self) -> MemberId {
        self.shared.member
    }

    /// Returns the highest index known replicated to the follower.
    pub fn match_index(&self) -> u64 {
        self.shared.state.lock().unwrap().progress.match_index()
    }

    /// Returns the next index the leader intends to send.
    pub fn next_index(&self) -> u64 {
        self.shared.state.lock().unwrap().progress.next_index()
    }

    /// Returns true once the transport connection is established.
    pub fn is_open(&self) -> bool {
        self.shared.state.lock().unwrap().open
    }

    /// Connects the transport. All operations fail with
    /// [`Error::NotOpen`] until this succeeds.
    pub async fn open(&self) -> Result<()> {
        self.shared.transport.connect().await?;
        let mut state = self.shared.state.lock().unwrap();
        if state.closed {
            return Err(Error::Closed);
        }
        state.open = true;
        debug!("replicator for member {} opened", self.shared.member);
        Ok(())
    }

    /// Closes the replicator, failing all outstanding futures with
    /// [`Error::Closed`]. Responses of requests still in flight are
    /// discarded.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.open = false;
            state.fail_all(&|| Error::Closed);
        }
        info!("replicator for member {} closed", self.shared.member);
        self.shared.transport.close().await
    }

    /// Sends a heartbeat and resolves with the observed match index.
    ///
    /// Concurrent pings coalesce onto the single in-flight heartbeat and
    /// all resolve when its response arrives.
    pub async fn ping(&self) -> Result<u64> {
        let receiver = {
            let mut state = self.shared.state.lock().unwrap();
            if !state.open {
                return Err(Error::NotOpen);
            }
            if self.shared.consensus.role() != Role::Leader {
                return Err(Error::NotLeader {
                    term: self.shared.consensus.current_term(),
                });
            }

            let (sender, receiver) = oneshot::channel();
            state.ping_waiters.push(sender);
            if !state.pinging {
                state.pinging = true;
                let request = self.shared.build_heartbeat(&state);
                Shared::spawn_ping(&self.shared, request);
            }
            receiver
        };
        receiver.await.map_err(|_| Error::Closed)?
    }

    /// Registers interest in the given index being replicated to this
    /// follower. Resolves with the index once the match index reaches it.
    ///
    /// An index at or below the current match index resolves immediately.
    /// An index further than [`COMMIT_WINDOW`] past the log tail is
    /// rejected rather than queued.
    pub async fn commit(&self, index: u64) -> Result<u64> {
        let receiver = {
            let mut state = self.shared.state.lock().unwrap();
            if !state.open {
                return Err(Error::NotOpen);
            }
            if self.shared.consensus.role() != Role::Leader {
                return Err(Error::NotLeader {
                    term: self.shared.consensus.current_term(),
                });
            }
            if index <= state.progress.match_index() {
                return Ok(index);
            }
            let last_index = self.shared.log.read().unwrap().last_index();
            if index > last_index + COMMIT_WINDOW {
                return Err(Error::OutOfRange {
                    index,
                    first: 1,
                    last: last_index + COMMIT_WINDOW,
                });
            }

            let (sender, receiver) = oneshot::channel();
            state.commit_waiters.entry(index).or_default().push(sender);
            if index >= state.progress.send_index() {
                Shared::drive(&self.shared, &mut state);
            }
            receiver
        };
        receiver.await.map_err(|_| Error::Closed)?
    }
}

impl Shared {
    fn build_heartbeat(&self, state: &State) -> AppendEntriesRequest {
        let match_index = state.progress.match_index();
        let log = self.log.read().unwrap();
        let prev_log_term = if log.contains_entry(match_index) {
            log.get(match_index)
                .ok()
                .flatten()
                .map(|entry| entry.term())
                .unwrap_or(0)
        } else {
            0
        };
        AppendEntriesRequest::heartbeat(
            self.consensus.next_correlation_id(),
            self.consensus.current_term(),
            self.consensus.local_member(),
            match_index,
            prev_log_term,
            self.consensus.commit_index(),
        )
    }

    fn spawn_ping(shared: &Arc<Shared>, request: AppendEntriesRequest) {
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            let result = shared.transport.append_entries(request).await;
            shared.handle_ping_response(result);
        });
    }

    fn handle_ping_response(&self, result: Result<crate::AppendEntriesResponse>) {
        let mut state = self.state.lock().unwrap();
        state.pinging = false;
        if state.closed {
            return;
        }
        match result {
            Err(err) => {
                warn!("ping to member {} failed: {}", self.member, err);
                let message = err.to_string();
                state.fail_pings(&|| Error::Transport(message.clone()));
            }
            Ok(response) => match response.status {
                ResponseStatus::Error => {
                    let message = response
                        .error
                        .unwrap_or_else(|| "remote error".to_string());
                    state.fail_pings(&|| Error::Transport(message.clone()));
                }
                ResponseStatus::Ok => {
                    if response.term > self.consensus.current_term() {
                        self.step_down(&mut state, response.term);
                    } else {
                        let match_index = state.progress.match_index();
                        for waiter in state.ping_waiters.drain(..) {
                            let _ = waiter.send(Ok(match_index));
                        }
                    }
                }
            },
        }
    }

    /// Builds and sends the next batch of entries if any are pending and
    /// no append is already in flight. Called with the state lock held.
    fn drive(shared: &Arc<Shared>, state: &mut State) {
        if state.appending || !state.open || state.closed {
            return;
        }
        if shared.consensus.role() != Role::Leader {
            return;
        }

        let (request, prev_index, count) = {
            let log = shared.log.read().unwrap();
            let last_index = log.last_index();
            if state.progress.send_index() > last_index {
                return;
            }
            let prev_index = state.progress.send_index() - 1;
            let prev_log_term = if prev_index == 0 {
                0
            } else {
                log.get(prev_index)
                    .ok()
                    .flatten()
                    .map(|entry| entry.term())
                    .unwrap_or(0)
            };

            let mut entries = Vec::new();
            let batch_end = (state.progress.send_index() + BATCH_SIZE).min(last_index);
            for index in state.progress.send_index()..=batch_end {
                let entry = match log.get(index) {
                    Ok(Some(entry)) => entry,
                    _ => break,
                };
                if entry.is_snapshot() {
                    // A snapshot occupies a request of its own. Flush the
                    // batch accumulated so far; the snapshot goes out in
                    // the next cycle.
                    if entries.is_empty() {
                        entries.push(entry);
                    }
                    break;
                }
                entries.push(entry);
            }
            if entries.is_empty() {
                return;
            }

            let count = entries.len() as u64;
            let request = AppendEntriesRequest {
                correlation_id: shared.consensus.next_correlation_id(),
                term: shared.consensus.current_term(),
                leader: shared.consensus.local_member(),
                prev_log_index: prev_index,
                prev_log_term,
                entries,
                leader_commit: shared.consensus.commit_index(),
            };
            (request, prev_index, count)
        };

        // Advance the in-flight cursor before the request completes so a
        // concurrent commit() does not re-send the same range.
        state.progress.record_sent(prev_index, count);
        state.appending = true;
        debug!(
            "member {}: sending {} entries after index {}",
            shared.member, count, prev_index
        );

        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            let result = shared.transport.append_entries(request).await;
            Shared::handle_append_response(&shared, prev_index, count, result);
        });
    }

    fn handle_append_response(
        shared: &Arc<Shared>,
        prev_index: u64,
        count: u64,
        result: Result<crate::AppendEntriesResponse>,
    ) {
        let advanced = {
            let mut state = shared.state.lock().unwrap();
            state.appending = false;
            if state.closed {
                return;
            }
            let mut advanced = None;
            match result {
                Err(err) => {
                    // No automatic retry; the next commit() re-drives.
                    warn!("append to member {} failed: {}", shared.member, err);
                    let message = err.to_string();
                    state.fail_commit_range(prev_index + 1, prev_index + count, &|| {
                        Error::Transport(message.clone())
                    });
                }
                Ok(response) => match response.status {
                    ResponseStatus::Error => {
                        let message = response
                            .error
                            .unwrap_or_else(|| "remote error".to_string());
                        state.fail_commit_range(prev_index + 1, prev_index + count, &|| {
                            Error::Transport(message.clone())
                        });
                    }
                    ResponseStatus::Ok => {
                        if response.term > shared.consensus.current_term() {
                            shared.step_down(&mut state, response.term);
                        } else if response.succeeded {
                            if count > 0 {
                                state.progress.record_matched(prev_index, count);
                                let match_index = state.progress.match_index();
                                state.resolve_commits_up_to(match_index);
                                advanced = Some(match_index);
                                Shared::drive(shared, &mut state);
                            }
                        } else {
                            state.progress.regress(response.last_log_index);
                            warn!(
                                "member {} rejected entries after index {}, regressing to {}",
                                shared.member,
                                prev_index,
                                state.progress.next_index()
                            );
                            Shared::drive(shared, &mut state);
                        }
                    }
                },
            }
            advanced
        };

        if let (Some(match_index), Some(observer)) = (advanced, shared.observer.as_ref()) {
            observer.match_index_advanced(shared.member, match_index);
        }
    }

    fn step_down(&self, state: &mut State, term: u64) {
        info!(
            "member {} reported term {} above ours, stepping down",
            self.member, term
        );
        self.consensus.observe_term(term);
        state.fail_all(&|| Error::NotLeader { term });
    }
}
