//! Push and pull of author branches against the configured remote.
//!
//! Network failures never surface as errors here: after the retry budget is
//! spent a branch is marked stale and reported as a [`SyncWarning`], and the
//! remaining branches carry on.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

use bookchat_core::identity::BRANCH_PREFIX;
use bookchat_core::{
    BranchRef, Clock, LockLevel, OrderedMutex, PeriodicTask, SyncConfig, ValidationError,
    global_metrics,
};
use bookchat_storage::{
    BranchedMessageStore, IntegrateOutcome, RepositoryError, RepositoryErrorKind,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::retry::{RetryFailure, RetryPolicy};
use crate::transport::RemoteTransport;

/// A branch that could not be synchronized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncWarning {
    pub author: String,
    pub branch: String,
    /// `error_type()` of the last failure, e.g. `NETWORK_UNAVAILABLE`.
    pub kind: String,
    pub message: String,
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum PushOutcome {
    Pushed { attempts: u32 },
    Stale(SyncWarning),
}

/// Result of pulling one branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchPull {
    Updated(IntegrateOutcome),
    Unchanged,
    /// The branch does not exist on the remote.
    Missing,
    CoolingDown,
    Stale(SyncWarning),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PullReport {
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub missing: Vec<String>,
    pub skipped_cooldown: Vec<String>,
    pub stale: Vec<SyncWarning>,
}

impl PullReport {
    fn record(&mut self, author: String, outcome: BranchPull) {
        match outcome {
            BranchPull::Updated(_) => self.updated.push(author),
            BranchPull::Unchanged => self.unchanged.push(author),
            BranchPull::Missing => self.missing.push(author),
            BranchPull::CoolingDown => self.skipped_cooldown.push(author),
            BranchPull::Stale(w) => self.stale.push(w),
        }
    }

    fn sort(&mut self) {
        self.updated.sort();
        self.unchanged.sort();
        self.missing.sort();
        self.skipped_cooldown.sort();
        self.stale.sort_by(|a, b| a.author.cmp(&b.author));
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.stale.is_empty()
    }
}

#[derive(Debug, Default)]
struct SyncState {
    last_pull: HashMap<String, Instant>,
    stale: BTreeMap<String, SyncWarning>,
}

pub struct SyncCoordinator {
    transport: Arc<dyn RemoteTransport>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    pull_cooldown: Duration,
    max_workers: usize,
    state: OrderedMutex<SyncState>,
}

impl SyncCoordinator {
    #[must_use]
    pub fn new(transport: Arc<dyn RemoteTransport>, config: &SyncConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport,
            policy: RetryPolicy::from(config),
            clock,
            pull_cooldown: config.pull_cooldown,
            max_workers: config.max_workers.max(1),
            state: OrderedMutex::new(LockLevel::SyncState, SyncState::default()),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Pushes only `author`'s branch.
    ///
    /// # Errors
    /// Only for an invalid author name; push failures become
    /// [`PushOutcome::Stale`].
    pub fn push_local(&self, author: &str) -> Result<PushOutcome, ValidationError> {
        let branch = BranchRef::for_author(author)?;
        let name = branch.name();
        let result = self.policy.run(self.clock.as_ref(), "push", || {
            global_metrics().sync.pushes_total.inc();
            self.transport.push(&name)
        });
        Ok(match result {
            Ok(((), attempts)) => {
                self.clear_stale(author);
                tracing::info!(author, attempts, "pushed branch");
                PushOutcome::Pushed { attempts }
            }
            Err(failure) => PushOutcome::Stale(self.mark_stale(&branch, &failure)),
        })
    }

    /// Fetches and integrates each author's branch. Failures are per branch:
    /// the others are still pulled, and the failed ones are reported stale.
    /// Branches pulled less than the cooldown ago are skipped.
    #[must_use]
    pub fn pull_all(&self, authors: &[String]) -> PullReport {
        let mut report = PullReport::default();
        let mut queue = Vec::new();
        let unique: BTreeSet<&str> = authors.iter().map(String::as_str).collect();
        for author in unique {
            match BranchRef::for_author(author) {
                Ok(branch) => {
                    if self.reserve_pull(author) {
                        queue.push(branch);
                    } else {
                        global_metrics().sync.cooldown_skips_total.inc();
                        report.record(author.to_string(), BranchPull::CoolingDown);
                    }
                }
                Err(e) => tracing::warn!(author, error = %e, "skipping invalid author"),
            }
        }

        let workers = self.max_workers.min(queue.len());
        let next = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel();
        std::thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                let next = &next;
                scope.spawn(move || {
                    loop {
                        let i = next.fetch_add(1, Ordering::Relaxed);
                        let Some(branch) = queue.get(i) else { break };
                        let outcome = self.pull_branch(branch);
                        let _ = tx.send((branch.author().to_string(), outcome));
                    }
                });
            }
        });
        drop(tx);
        for (author, outcome) in rx {
            report.record(author, outcome);
        }
        report.sort();

        if !report.stale.is_empty() {
            tracing::warn!(stale = report.stale.len(), "pull finished with stale branches");
        }
        report
    }

    /// Pulls one branch, ignoring the cooldown.
    #[must_use]
    pub fn pull_branch(&self, branch: &BranchRef) -> BranchPull {
        let name = branch.name();
        let fetched = self.policy.run(self.clock.as_ref(), "fetch", || {
            global_metrics().sync.fetches_total.inc();
            self.transport.fetch(&name)
        });
        match fetched {
            Ok(_) => {}
            Err(f) if f.error.kind() == RepositoryErrorKind::NotFound => {
                tracing::debug!(branch = %name, "branch not on remote");
                return BranchPull::Missing;
            }
            Err(f) => return BranchPull::Stale(self.mark_stale(branch, &f)),
        }

        let integrated = self
            .policy
            .run(self.clock.as_ref(), "integrate", || self.transport.integrate(&name));
        match integrated {
            Ok((outcome, _)) => {
                self.clear_stale(branch.author());
                match outcome {
                    IntegrateOutcome::Created | IntegrateOutcome::FastForwarded => {
                        tracing::info!(branch = %name, ?outcome, "pulled branch");
                        BranchPull::Updated(outcome)
                    }
                    IntegrateOutcome::UpToDate | IntegrateOutcome::LocalAhead => BranchPull::Unchanged,
                }
            }
            Err(f) => BranchPull::Stale(self.mark_stale(branch, &f)),
        }
    }

    /// Author names of every `user/*` branch on the remote.
    ///
    /// # Errors
    /// The listing failure after retries.
    pub fn discover_authors(&self) -> Result<Vec<String>, RepositoryError> {
        let (names, _) = self
            .policy
            .run(self.clock.as_ref(), "ls-remote", || {
                self.transport.list_remote_branches(BRANCH_PREFIX)
            })
            .map_err(|f| f.error)?;
        Ok(names
            .iter()
            .filter_map(|n| BranchRef::parse(n))
            .map(|b| b.author().to_string())
            .collect())
    }

    /// Pulls every author known locally or on the remote.
    #[must_use]
    pub fn pull_everything(&self, store: &BranchedMessageStore) -> PullReport {
        let mut authors: BTreeSet<String> = match store.known_authors() {
            Ok(a) => a.into_iter().collect(),
            Err(e) => {
                tracing::warn!(error = %e, "could not list local branches");
                BTreeSet::new()
            }
        };
        match self.discover_authors() {
            Ok(remote) => authors.extend(remote),
            Err(e) => tracing::warn!(error = %e, "remote branch discovery failed"),
        }
        let authors: Vec<String> = authors.into_iter().collect();
        self.pull_all(&authors)
    }

    /// Branches whose last sync attempt failed, by author.
    #[must_use]
    pub fn stale_branches(&self) -> Vec<SyncWarning> {
        self.state.lock().stale.values().cloned().collect()
    }

    #[must_use]
    pub fn is_stale(&self, author: &str) -> bool {
        self.state.lock().stale.contains_key(author)
    }

    /// Pulls everything every `interval` on a background thread.
    ///
    /// # Errors
    /// The OS error if the thread cannot be spawned.
    pub fn spawn(
        self: Arc<Self>,
        store: Arc<BranchedMessageStore>,
        interval: Duration,
    ) -> std::io::Result<PeriodicTask> {
        PeriodicTask::spawn("bookchat-sync", interval, true, move || {
            let report = self.pull_everything(&store);
            tracing::debug!(
                updated = report.updated.len(),
                stale = report.stale.len(),
                "scheduled pull finished"
            );
        })
    }

    fn reserve_pull(&self, author: &str) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if let Some(last) = state.last_pull.get(author)
            && now.saturating_duration_since(*last) < self.pull_cooldown
        {
            return false;
        }
        state.last_pull.insert(author.to_string(), now);
        true
    }

    fn mark_stale(&self, branch: &BranchRef, failure: &RetryFailure) -> SyncWarning {
        let warning = SyncWarning {
            author: branch.author().to_string(),
            branch: branch.name(),
            kind: failure.error.error_type().to_string(),
            message: failure.error.to_string(),
            attempts: failure.attempts,
            at: self.clock.now_utc(),
        };
        tracing::warn!(
            author = %warning.author,
            kind = %warning.kind,
            attempts = warning.attempts,
            error = %warning.message,
            "branch marked stale"
        );
        global_metrics().sync.stale_marks_total.inc();
        self.state
            .lock()
            .stale
            .insert(warning.author.clone(), warning.clone());
        warning
    }

    fn clear_stale(&self, author: &str) {
        if self.state.lock().stale.remove(author).is_some() {
            tracing::info!(author, "branch no longer stale");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookchat_core::ManualClock;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeTransport {
        unreachable: Mutex<HashSet<String>>,
        diverged: HashSet<String>,
        absent: HashSet<String>,
        fetches: Mutex<Vec<String>>,
        pushes: Mutex<Vec<String>>,
    }

    impl FakeTransport {
        fn failing(branches: &[&str]) -> Self {
            Self {
                unreachable: Mutex::new(branches.iter().map(|b| (*b).to_string()).collect()),
                ..Self::default()
            }
        }

        fn heal(&self, branch: &str) {
            self.unreachable.lock().unwrap().remove(branch);
        }

        fn fetch_count(&self, branch: &str) -> usize {
            self.fetches.lock().unwrap().iter().filter(|b| *b == branch).count()
        }

        fn down(&self, branch: &str) -> Result<(), RepositoryError> {
            if self.unreachable.lock().unwrap().contains(branch) {
                return Err(RepositoryError::NetworkUnavailable(format!("{branch} unreachable")));
            }
            Ok(())
        }
    }

    impl RemoteTransport for FakeTransport {
        fn fetch(&self, branch: &str) -> Result<(), RepositoryError> {
            self.fetches.lock().unwrap().push(branch.to_string());
            self.down(branch)?;
            if self.absent.contains(branch) {
                return Err(RepositoryError::NotFound(branch.to_string()));
            }
            Ok(())
        }

        fn integrate(&self, branch: &str) -> Result<IntegrateOutcome, RepositoryError> {
            if self.diverged.contains(branch) {
                return Err(RepositoryError::ConflictingState("diverged".into()));
            }
            Ok(IntegrateOutcome::FastForwarded)
        }

        fn push(&self, branch: &str) -> Result<(), RepositoryError> {
            self.pushes.lock().unwrap().push(branch.to_string());
            self.down(branch)
        }

        fn list_remote_branches(&self, _prefix: &str) -> Result<Vec<String>, RepositoryError> {
            Ok(vec!["user/alice".into(), "user/bob".into(), "other/x".into()])
        }
    }

    fn config() -> SyncConfig {
        SyncConfig {
            enabled: true,
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: false,
            pull_cooldown: Duration::from_secs(5),
            interval: Duration::from_secs(60),
            max_workers: 3,
        }
    }

    fn coordinator(transport: Arc<FakeTransport>) -> (SyncCoordinator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (SyncCoordinator::new(transport, &config(), clock.clone()), clock)
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn one_unreachable_branch_does_not_block_the_rest() {
        let transport = Arc::new(FakeTransport::failing(&["user/bob"]));
        let (sync, clock) = coordinator(transport.clone());

        let report = sync.pull_all(&names(&["alice", "bob", "carol"]));
        assert_eq!(report.updated, names(&["alice", "carol"]));
        assert_eq!(report.stale.len(), 1);
        let warning = &report.stale[0];
        assert_eq!(warning.author, "bob");
        assert_eq!(warning.kind, "NETWORK_UNAVAILABLE");
        assert_eq!(warning.attempts, 3);
        assert_eq!(transport.fetch_count("user/bob"), 3);
        assert_eq!(transport.fetch_count("user/alice"), 1);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        assert!(sync.is_stale("bob"));
        assert_eq!(sync.stale_branches(), vec![warning.clone()]);
    }

    #[test]
    fn cooldown_skips_rapid_repeats() {
        let transport = Arc::new(FakeTransport::default());
        let (sync, clock) = coordinator(transport.clone());

        assert_eq!(sync.pull_all(&names(&["alice"])).updated.len(), 1);
        let again = sync.pull_all(&names(&["alice", "alice"]));
        assert_eq!(again.skipped_cooldown, names(&["alice"]));
        assert_eq!(transport.fetch_count("user/alice"), 1);

        clock.advance(Duration::from_secs(6));
        assert_eq!(sync.pull_all(&names(&["alice"])).updated.len(), 1);
        assert_eq!(transport.fetch_count("user/alice"), 2);
    }

    #[test]
    fn stale_mark_clears_after_recovery() {
        let transport = Arc::new(FakeTransport::failing(&["user/bob"]));
        let (sync, clock) = coordinator(transport.clone());
        assert!(!sync.pull_all(&names(&["bob"])).is_clean());
        transport.heal("user/bob");
        clock.advance(Duration::from_secs(10));
        assert!(sync.pull_all(&names(&["bob"])).is_clean());
        assert!(!sync.is_stale("bob"));
    }

    #[test]
    fn missing_and_diverged_branches() {
        let transport = Arc::new(FakeTransport {
            absent: ["user/ghost".to_string()].into_iter().collect(),
            diverged: ["user/dora".to_string()].into_iter().collect(),
            ..FakeTransport::default()
        });
        let (sync, clock) = coordinator(transport);
        let report = sync.pull_all(&names(&["ghost", "dora", "bad name"]));
        assert_eq!(report.missing, names(&["ghost"]));
        assert_eq!(report.stale.len(), 1);
        assert_eq!(report.stale[0].kind, "CONFLICTING_STATE");
        assert_eq!(report.stale[0].attempts, 1);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn push_only_touches_the_authors_branch() {
        let transport = Arc::new(FakeTransport::failing(&["user/bob"]));
        let (sync, _clock) = coordinator(transport.clone());

        assert_eq!(
            sync.push_local("alice").unwrap(),
            PushOutcome::Pushed { attempts: 1 }
        );
        assert_eq!(*transport.pushes.lock().unwrap(), names(&["user/alice"]));

        match sync.push_local("bob").unwrap() {
            PushOutcome::Stale(w) => assert_eq!(w.attempts, 3),
            other => panic!("expected stale, got {other:?}"),
        }
        assert!(sync.push_local("../x").is_err());
    }

    #[test]
    fn discovery_keeps_only_author_branches() {
        let (sync, _clock) = coordinator(Arc::new(FakeTransport::default()));
        assert_eq!(sync.discover_authors().unwrap(), names(&["alice", "bob"]));
    }
}
