//! Two replicas exchanging author branches through a local bare remote.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bookchat_core::SyncConfig;
use bookchat_storage::testing::{bare_remote, replica};
use bookchat_storage::{IntegrateOutcome, RepositoryDriver, RepositoryError};
use bookchat_sync::{PushOutcome, RemoteTransport, SyncCoordinator};

fn sync_config() -> SyncConfig {
    SyncConfig {
        enabled: true,
        max_attempts: 2,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        jitter: false,
        pull_cooldown: Duration::from_secs(30),
        interval: Duration::from_secs(60),
        max_workers: 2,
    }
}

/// Delegates to a real driver but refuses to fetch the listed branches.
struct Flaky {
    inner: Arc<RepositoryDriver>,
    down: Mutex<HashSet<String>>,
}

impl RemoteTransport for Flaky {
    fn fetch(&self, branch: &str) -> Result<(), RepositoryError> {
        if self.down.lock().unwrap().contains(branch) {
            return Err(RepositoryError::NetworkUnavailable("connection reset".into()));
        }
        self.inner.fetch(branch)
    }

    fn integrate(&self, branch: &str) -> Result<IntegrateOutcome, RepositoryError> {
        self.inner.integrate(branch)
    }

    fn push(&self, branch: &str) -> Result<(), RepositoryError> {
        self.inner.push(branch)
    }

    fn list_remote_branches(&self, prefix: &str) -> Result<Vec<String>, RepositoryError> {
        self.inner.list_remote_branches(prefix)
    }
}

#[test]
fn pushed_messages_show_up_on_the_other_replica() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = bare_remote(tmp.path()).unwrap();
    let a = replica(&tmp.path().join("a"), Some(&remote), true).unwrap();
    let b = replica(&tmp.path().join("b"), Some(&remote), true).unwrap();
    let sync_a = SyncCoordinator::new(a.driver.clone(), &sync_config(), a.clock.clone());
    let sync_b = SyncCoordinator::new(b.driver.clone(), &sync_config(), b.clock.clone());

    a.store.append("alice", "hello from a").unwrap();
    a.clock.advance(Duration::from_secs(1));
    a.store.append("bob", "bob on a").unwrap();
    b.store.append("carol", "carol on b").unwrap();

    assert_eq!(sync_a.push_local("alice").unwrap(), PushOutcome::Pushed { attempts: 1 });
    assert_eq!(sync_a.push_local("bob").unwrap(), PushOutcome::Pushed { attempts: 1 });

    let report = sync_b.pull_everything(&b.store);
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(report.updated, vec!["alice", "bob"]);
    // carol exists only locally on b
    assert_eq!(report.missing, vec!["carol"]);

    let all = b.store.list_all().unwrap();
    let contents: Vec<&str> = all.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents.len(), 3);
    assert!(contents.contains(&"hello from a"));
    assert!(contents.contains(&"bob on a"));
    assert!(all.iter().all(|m| m.verified));

    // only alice's and bob's branches were pushed
    assert_eq!(
        a.driver.list_remote_branches("user/").unwrap(),
        vec!["user/alice", "user/bob"]
    );
}

#[test]
fn unreachable_branch_is_stale_while_others_update() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = bare_remote(tmp.path()).unwrap();
    let a = replica(&tmp.path().join("a"), Some(&remote), true).unwrap();
    let b = replica(&tmp.path().join("b"), Some(&remote), true).unwrap();
    let sync_a = SyncCoordinator::new(a.driver.clone(), &sync_config(), a.clock.clone());

    for author in ["alice", "bob", "dora"] {
        a.store.append(author, &format!("{author} says hi")).unwrap();
        sync_a.push_local(author).unwrap();
    }

    let flaky = Arc::new(Flaky {
        inner: b.driver.clone(),
        down: Mutex::new(["user/bob".to_string()].into_iter().collect()),
    });
    let sync_b = SyncCoordinator::new(flaky.clone(), &sync_config(), b.clock.clone());
    let authors: Vec<String> = sync_b.discover_authors().unwrap();
    assert_eq!(authors, vec!["alice", "bob", "dora"]);

    let report = sync_b.pull_all(&authors);
    assert_eq!(report.updated, vec!["alice", "dora"]);
    assert_eq!(report.stale.len(), 1);
    assert_eq!(report.stale[0].author, "bob");
    assert_eq!(report.stale[0].attempts, 2);
    assert!(sync_b.is_stale("bob"));

    let seen: Vec<String> = b.store.list_all().unwrap().into_iter().map(|m| m.author).collect();
    assert!(seen.contains(&"alice".to_string()));
    assert!(seen.contains(&"dora".to_string()));
    assert!(!seen.contains(&"bob".to_string()));

    // an immediate retry is held back by the cooldown
    flaky.down.lock().unwrap().clear();
    assert_eq!(sync_b.pull_all(&authors).skipped_cooldown.len(), 3);

    b.clock.advance(Duration::from_secs(31));
    let report = sync_b.pull_all(&authors);
    assert_eq!(report.updated, vec!["bob"]);
    assert_eq!(report.unchanged, vec!["alice", "dora"]);
    assert!(sync_b.stale_branches().is_empty());
    assert_eq!(b.store.list_all().unwrap().len(), 3);
}
