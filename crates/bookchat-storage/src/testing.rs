//! Fixtures shared by the integration tests of this crate and of the sync
//! crate: a replica is a repository, a key directory and a manual clock.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bookchat_core::{ManualClock, RepoSettings, SigningConfig};
use bookchat_keys::KeyManager;

use crate::error::StoreResult;
use crate::repo::RepositoryDriver;
use crate::store::BranchedMessageStore;

pub struct Replica {
    pub clock: Arc<ManualClock>,
    pub driver: Arc<RepositoryDriver>,
    pub store: Arc<BranchedMessageStore>,
}

/// Settings for a test repository at `root`, pushing to `remote` if given.
#[must_use]
pub fn settings(root: &Path, remote: Option<&Path>) -> RepoSettings {
    let mut settings = RepoSettings::for_root(root);
    settings.lock_timeout = Duration::from_secs(10);
    settings.network_timeout = Duration::from_secs(20);
    settings.remote_url = remote.map(|p| p.display().to_string());
    settings
}

/// A replica under `dir/repo` with keys under `dir/keys`.
///
/// # Errors
/// Repository or key directory initialization failures.
pub fn replica(dir: &Path, remote: Option<&Path>, signing: bool) -> StoreResult<Replica> {
    replica_with(settings(&dir.join("repo"), remote), &dir.join("keys"), signing)
}

/// # Errors
/// Repository or key directory initialization failures.
pub fn replica_with(settings: RepoSettings, keys_dir: &Path, signing: bool) -> StoreResult<Replica> {
    let driver = Arc::new(RepositoryDriver::open_or_init(settings)?);
    let keys = Arc::new(KeyManager::open(keys_dir, SigningConfig { enabled: signing })?);
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(BranchedMessageStore::new(
        Arc::clone(&driver),
        keys,
        clock.clone(),
        64 * 1024,
    ));
    Ok(Replica {
        clock,
        driver,
        store,
    })
}

/// An empty bare repository at `dir/remote.git`.
///
/// # Errors
/// Git errors creating the repository.
pub fn bare_remote(dir: &Path) -> StoreResult<PathBuf> {
    let path = dir.join("remote.git");
    git2::Repository::init_bare(&path).map_err(crate::error::RepositoryError::from)?;
    Ok(path)
}
