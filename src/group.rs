//! Leader-side replication fan-out.
//!
//! The group maintains one [`Replicator`] per non-local cluster member
//! and resolves commits once a majority of the cluster, leader included,
//! has replicated an entry of the current term. Entries from earlier
//! terms are never committed by counting replicas; they commit indirectly
//! once a current-term entry reaches majority.

use crate::replicator::ProgressObserver;
use crate::{
    ConsensusContext, Error, Log, MemberId, Replicator, Result, Role, TransportClient,
    COMMIT_WINDOW,
};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};

/// Tracks per-member match indexes and resolves group commit futures
/// whenever the majority index advances.
struct CommitTracker {
    consensus: Arc<dyn ConsensusContext>,
    log: Arc<RwLock<Log>>,
    inner: Mutex<TrackerInner>,
}

struct TrackerInner {
    match_indexes: HashMap<MemberId, u64>,
    waiters: BTreeMap<u64, Vec<oneshot::Sender<Result<u64>>>>,
    closed: bool,
}

impl CommitTracker {
    fn new(consensus: Arc<dyn ConsensusContext>, log: Arc<RwLock<Log>>) -> Self {
        CommitTracker {
            consensus,
            log,
            inner: Mutex::new(TrackerInner {
                match_indexes: HashMap::new(),
                waiters: BTreeMap::new(),
                closed: false,
            }),
        }
    }

    fn add_member(&self, member: MemberId) {
        self.inner
            .lock()
            .unwrap()
            .match_indexes
            .entry(member)
            .or_insert(0);
    }

    fn remove_member(&self, member: MemberId) {
        let mut inner = self.inner.lock().unwrap();
        inner.match_indexes.remove(&member);
        // The quorum shrank; the majority index may have moved forward.
        self.recompute_locked(&mut inner);
    }

    fn register(&self, index: u64) -> Result<oneshot::Receiver<Result<u64>>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(Error::Closed);
        }
        let last_index = self.log.read().unwrap().last_index();
        if index > last_index + COMMIT_WINDOW {
            return Err(Error::OutOfRange {
                index,
                first: 1,
                last: last_index + COMMIT_WINDOW,
            });
        }
        let (sender, receiver) = oneshot::channel();
        inner.waiters.entry(index).or_default().push(sender);
        Ok(receiver)
    }

    fn recompute(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.recompute_locked(&mut inner);
    }

    /// Recomputes the majority index and resolves every waiter at or
    /// below the new commit index.
    fn recompute_locked(&self, inner: &mut TrackerInner) {
        let log = self.log.read().unwrap();
        let leader_match = log.last_index();

        let mut matches: Vec<u64> = inner.match_indexes.values().copied().collect();
        matches.push(leader_match);
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let majority = matches[matches.len() / 2];
        if majority == 0 {
            return;
        }

        // Only an entry of the current term may commit by counting
        // replicas.
        let current_term = self.consensus.current_term();
        let term_matches = log
            .get(majority)
            .ok()
            .flatten()
            .map(|entry| entry.term() == current_term)
            .unwrap_or(false);
        drop(log);
        if !term_matches {
            return;
        }

        let commit_index = self.consensus.advance_commit_index(majority);
        debug!("commit index advanced to {}", commit_index);

        let pending = inner.waiters.split_off(&(commit_index + 1));
        let resolved = std::mem::replace(&mut inner.waiters, pending);
        for (index, waiters) in resolved {
            for waiter in waiters {
                let _ = waiter.send(Ok(index));
            }
        }
    }

    fn fail_all(&self, make: &dyn Fn() -> Error) {
        let mut inner = self.inner.lock().unwrap();
        let waiters = std::mem::take(&mut inner.waiters);
        for (_, senders) in waiters {
            for sender in senders {
                let _ = sender.send(Err(make()));
            }
        }
    }

    fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        let waiters = std::mem::take(&mut inner.waiters);
        for (_, senders) in waiters {
            for sender in senders {
                let _ = sender.send(Err(Error::Closed));
            }
        }
    }
}

impl ProgressObserver for CommitTracker {
    fn match_index_advanced(&self, member: MemberId, match_index: u64) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.match_indexes.entry(member).or_insert(0);
        *entry = (*entry).max(match_index);
        self.recompute_locked(&mut inner);
    }
}

/// Replicates the log to every other member of the cluster.
pub struct ReplicationGroup {
    consensus: Arc<dyn ConsensusContext>,
    log: Arc<RwLock<Log>>,
    replicators: Mutex<HashMap<MemberId, Replicator>>,
    tracker: Arc<CommitTracker>,
}

impl ReplicationGroup {
    /// Creates a group with one replicator per peer. Call [`open`] before
    /// committing.
    ///
    /// [`open`]: ReplicationGroup::open
    pub fn new(
        consensus: Arc<dyn ConsensusContext>,
        log: Arc<RwLock<Log>>,
        peers: Vec<(MemberId, Arc<dyn TransportClient>)>,
    ) -> Self {
        let tracker = Arc::new(CommitTracker::new(Arc::clone(&consensus), Arc::clone(&log)));

        let mut replicators = HashMap::new();
        for (member, transport) in peers {
            tracker.add_member(member);
            let replicator = Replicator::with_observer(
                member,
                Arc::clone(&consensus),
                Arc::clone(&log),
                transport,
                Arc::clone(&tracker) as Arc<dyn ProgressObserver>,
            );
            replicators.insert(member, replicator);
        }

        ReplicationGroup {
            consensus,
            log,
            replicators: Mutex::new(replicators),
            tracker,
        }
    }

    /// Connects every replicator. A peer that cannot be reached is left
    /// un-opened; its operations fail until the membership store replaces
    /// it.
    pub async fn open(&self) -> Result<()> {
        let replicators: Vec<Replicator> =
            self.replicators.lock().unwrap().values().cloned().collect();
        for replicator in replicators {
            if let Err(err) = replicator.open().await {
                warn!(
                    "failed to open replicator for member {}: {}",
                    replicator.member(),
                    err
                );
            }
        }
        Ok(())
    }

    /// Closes every replicator and fails all pending group commits.
    pub async fn close(&self) -> Result<()> {
        let replicators: Vec<Replicator> = {
            let mut map = self.replicators.lock().unwrap();
            map.drain().map(|(_, replicator)| replicator).collect()
        };
        for replicator in replicators {
            let _ = replicator.close().await;
        }
        self.tracker.close();
        info!("replication group closed");
        Ok(())
    }

    /// Returns a future that resolves once a majority of the cluster,
    /// leader included, has replicated the entry at `index` and that
    /// entry carries the current term.
    pub async fn commit(&self, index: u64) -> Result<u64> {
        if self.consensus.role() != Role::Leader {
            return Err(Error::NotLeader {
                term: self.consensus.current_term(),
            });
        }
        if self.consensus.commit_index() >= index {
            return Ok(index);
        }

        let receiver = self.tracker.register(index)?;

        let replicators: Vec<Replicator> =
            self.replicators.lock().unwrap().values().cloned().collect();
        for replicator in replicators {
            let tracker = Arc::clone(&self.tracker);
            tokio::spawn(async move {
                match replicator.commit(index).await {
                    Err(Error::NotLeader { term }) => {
                        tracker.fail_all(&|| Error::NotLeader { term });
                    }
                    Err(err) => {
                        debug!(
                            "commit of index {} on member {} failed: {}",
                            index,
                            replicator.member(),
                            err
                        );
                    }
                    Ok(_) => {}
                }
            });
        }

        // A majority may already hold the entry, or the leader alone may
        // be the majority.
        self.tracker.recompute();

        receiver.await.map_err(|_| Error::Closed)?
    }

    /// Broadcasts a heartbeat and resolves once a majority of the
    /// cluster, leader included, responded with a matching term.
    pub async fn ping(&self) -> Result<()> {
        if self.consensus.role() != Role::Leader {
            return Err(Error::NotLeader {
                term: self.consensus.current_term(),
            });
        }

        let replicators: Vec<Replicator> =
            self.replicators.lock().unwrap().values().cloned().collect();
        let cluster_size = replicators.len() + 1;
        let needed_acks = cluster_size / 2;
        if needed_acks == 0 {
            return Ok(());
        }

        let (sender, mut receiver) = mpsc::unbounded_channel();
        for replicator in replicators {
            let sender = sender.clone();
            tokio::spawn(async move {
                let _ = sender.send(replicator.ping().await);
            });
        }
        drop(sender);

        let mut acks = 0;
        while let Some(result) = receiver.recv().await {
            match result {
                Ok(_) => {
                    acks += 1;
                    if acks >= needed_acks {
                        return Ok(());
                    }
                }
                Err(Error::NotLeader { term }) => return Err(Error::NotLeader { term }),
                Err(err) => warn!("heartbeat failed: {}", err),
            }
        }
        Err(Error::Transport(
            "heartbeat did not reach a majority".to_string(),
        ))
    }

    /// Adds a replicator for a member delivered by the membership store.
    pub async fn add_member(
        &self,
        member: MemberId,
        transport: Arc<dyn TransportClient>,
    ) -> Result<()> {
        let replicator = Replicator::with_observer(
            member,
            Arc::clone(&self.consensus),
            Arc::clone(&self.log),
            transport,
            Arc::clone(&self.tracker) as Arc<dyn ProgressObserver>,
        );
        replicator.open().await?;
        self.tracker.add_member(member);
        self.replicators
            .lock()
            .unwrap()
            .insert(member, replicator);
        info!("added member {} to the replication group", member);
        Ok(())
    }

    /// Removes a member, closing its replicator.
    pub async fn remove_member(&self, member: MemberId) -> Result<()> {
        let replicator = self.replicators.lock().unwrap().remove(&member);
        self.tracker.remove_member(member);
        if let Some(replicator) = replicator {
            replicator.close().await?;
        }
        info!("removed member {} from the replication group", member);
        Ok(())
    }

    /// Returns the replicator for the given member, if present.
    pub fn replicator(&self, member: MemberId) -> Option<Replicator> {
        self.replicators.lock().unwrap().get(&member).cloned()
    }

    /// Returns the number of peers currently replicated to.
    pub fn peer_count(&self) -> usize {
        self.replicators.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AppendEntriesRequest, AppendEntriesResponse, ConsensusState, Entry, LogConfig,
    };
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    struct FollowerTransport {
        term: u64,
        follower_last: Mutex<u64>,
    }

    impl FollowerTransport {
        fn new(term: u64) -> Arc<Self> {
            Arc::new(Self {
                term,
                follower_last: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl crate::TransportClient for FollowerTransport {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        async fn append_entries(
            &self,
            request: AppendEntriesRequest,
        ) -> Result<AppendEntriesResponse> {
            let mut last = self.follower_last.lock().unwrap();
            if request.prev_log_index > *last {
                return Ok(AppendEntriesResponse::failure(self.term, *last));
            }
            if !request.entries.is_empty() {
                *last = request.prev_log_index + request.entries.len() as u64;
            }
            Ok(AppendEntriesResponse::success(self.term, *last))
        }
    }

    /// Transport whose requests never complete.
    struct StalledTransport;

    #[async_trait]
    impl crate::TransportClient for StalledTransport {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        async fn append_entries(
            &self,
            _request: AppendEntriesRequest,
        ) -> Result<AppendEntriesResponse> {
            std::future::pending().await
        }
    }

    struct HigherTermTransport {
        term: u64,
    }

    #[async_trait]
    impl crate::TransportClient for HigherTermTransport {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        async fn append_entries(
            &self,
            _request: AppendEntriesRequest,
        ) -> Result<AppendEntriesResponse> {
            Ok(AppendEntriesResponse::failure(self.term, 0))
        }
    }

    fn leader_fixture() -> (Arc<ConsensusState>, Arc<RwLock<Log>>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = LogConfig {
            directory: temp_dir.path().to_path_buf(),
            max_segment_size: 1024 * 1024,
        };
        let log = Log::open(config).unwrap();
        let consensus = Arc::new(ConsensusState::new(1, 1));
        consensus.become_leader(1);
        (consensus, Arc::new(RwLock::new(log)), temp_dir)
    }

    fn append_entries(log: &Arc<RwLock<Log>>, term: u64, range: std::ops::RangeInclusive<u64>) {
        let mut log = log.write().unwrap();
        for i in range {
            log.append(Entry::new(term, i, format!("cmd-{}", i).into_bytes()))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_commit_resolves_on_majority() {
        let (consensus, log, _temp_dir) = leader_fixture();
        let group = ReplicationGroup::new(
            Arc::clone(&consensus) as Arc<dyn ConsensusContext>,
            Arc::clone(&log),
            vec![
                (2, FollowerTransport::new(1) as Arc<dyn TransportClient>),
                (3, FollowerTransport::new(1) as Arc<dyn TransportClient>),
            ],
        );
        group.open().await.unwrap();

        append_entries(&log, 1, 1..=10);
        assert_eq!(group.commit(10).await.unwrap(), 10);
        assert_eq!(consensus.commit_index(), 10);
    }

    #[tokio::test]
    async fn test_commit_tolerates_one_stalled_follower() {
        let (consensus, log, _temp_dir) = leader_fixture();
        let group = ReplicationGroup::new(
            Arc::clone(&consensus) as Arc<dyn ConsensusContext>,
            Arc::clone(&log),
            vec![
                (2, FollowerTransport::new(1) as Arc<dyn TransportClient>),
                (3, Arc::new(StalledTransport) as Arc<dyn TransportClient>),
            ],
        );
        group.open().await.unwrap();

        append_entries(&log, 1, 1..=5);
        assert_eq!(group.commit(5).await.unwrap(), 5);
        assert_eq!(consensus.commit_index(), 5);
        assert_eq!(group.replicator(3).unwrap().match_index(), 0);
    }

    #[tokio::test]
    async fn test_prior_term_entries_commit_only_indirectly() {
        let (consensus, log, _temp_dir) = leader_fixture();
        let group = ReplicationGroup::new(
            Arc::clone(&consensus) as Arc<dyn ConsensusContext>,
            Arc::clone(&log),
            vec![
                (2, FollowerTransport::new(2) as Arc<dyn TransportClient>),
                (3, FollowerTransport::new(2) as Arc<dyn TransportClient>),
            ],
        );
        group.open().await.unwrap();

        // Entries from term 1 while the leader now serves term 2: fully
        // replicated but not committable by counting replicas.
        append_entries(&log, 1, 1..=2);
        consensus.become_leader(2);

        let pending = tokio::time::timeout(Duration::from_millis(100), group.commit(2)).await;
        assert!(pending.is_err(), "prior-term entry must not commit alone");
        assert_eq!(consensus.commit_index(), 0);

        // A current-term entry reaching majority commits everything
        // before it.
        append_entries(&log, 2, 3..=3);
        assert_eq!(group.commit(3).await.unwrap(), 3);
        assert_eq!(consensus.commit_index(), 3);
    }

    #[tokio::test]
    async fn test_single_node_commits_immediately() {
        let (consensus, log, _temp_dir) = leader_fixture();
        let group = ReplicationGroup::new(
            Arc::clone(&consensus) as Arc<dyn ConsensusContext>,
            Arc::clone(&log),
            Vec::new(),
        );
        group.open().await.unwrap();

        append_entries(&log, 1, 1..=3);
        assert_eq!(group.commit(3).await.unwrap(), 3);
        assert_eq!(consensus.commit_index(), 3);
    }

    #[tokio::test]
    async fn test_ping_reaches_majority() {
        let (consensus, log, _temp_dir) = leader_fixture();
        let group = ReplicationGroup::new(
            Arc::clone(&consensus) as Arc<dyn ConsensusContext>,
            Arc::clone(&log),
            vec![
                (2, FollowerTransport::new(1) as Arc<dyn TransportClient>),
                (3, Arc::new(StalledTransport) as Arc<dyn TransportClient>),
            ],
        );
        group.open().await.unwrap();

        group.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_higher_term_fails_group_commit() {
        let (consensus, log, _temp_dir) = leader_fixture();
        let group = ReplicationGroup::new(
            Arc::clone(&consensus) as Arc<dyn ConsensusContext>,
            Arc::clone(&log),
            vec![
                (2, Arc::new(HigherTermTransport { term: 5 }) as Arc<dyn TransportClient>),
                (3, Arc::new(StalledTransport) as Arc<dyn TransportClient>),
            ],
        );
        group.open().await.unwrap();

        append_entries(&log, 1, 1..=2);
        match group.commit(2).await {
            Err(Error::NotLeader { term: 5 }) => {}
            other => panic!("Expected NotLeader, got {:?}", other),
        }
        assert_eq!(consensus.role(), Role::Follower);
        assert_eq!(consensus.current_term(), 5);

        // Once stepped down, new commits are rejected outright.
        assert!(matches!(
            group.commit(2).await,
            Err(Error::NotLeader { .. })
        ));
    }

    #[tokio::test]
    async fn test_membership_changes() {
        let (consensus, log, _temp_dir) = leader_fixture();
        let group = ReplicationGroup::new(
            Arc::clone(&consensus) as Arc<dyn ConsensusContext>,
            Arc::clone(&log),
            vec![(2, FollowerTransport::new(1) as Arc<dyn TransportClient>)],
        );
        group.open().await.unwrap();
        assert_eq!(group.peer_count(), 1);

        group
            .add_member(3, FollowerTransport::new(1) as Arc<dyn TransportClient>)
            .await
            .unwrap();
        assert_eq!(group.peer_count(), 2);

        group.remove_member(2).await.unwrap();
        assert_eq!(group.peer_count(), 1);
        assert!(group.replicator(2).is_none());
    }

    #[tokio::test]
    async fn test_close_fails_pending_commits() {
        let (consensus, log, _temp_dir) = leader_fixture();
        let group = Arc::new(ReplicationGroup::new(
            Arc::clone(&consensus) as Arc<dyn ConsensusContext>,
            Arc::clone(&log),
            vec![
                (2, Arc::new(StalledTransport) as Arc<dyn TransportClient>),
                (3, Arc::new(StalledTransport) as Arc<dyn TransportClient>),
            ],
        ));
        group.open().await.unwrap();

        append_entries(&log, 1, 1..=1);
        let pending = {
            let group = Arc::clone(&group);
            tokio::spawn(async move { group.commit(1).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        group.close().await.unwrap();
        match pending.await.unwrap() {
            Err(Error::Closed) => {}
            other => panic!("Expected Closed, got {:?}", other),
        }
    }
}
