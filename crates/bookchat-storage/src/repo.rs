//! Synchronous git2 wrapper owning the shared working tree.
//!
//! Writes go through [`RepositoryDriver::with_branch`], the single critical
//! section that checks out a branch, lets the caller stage and commit, and
//! always checks the previous branch back out (rolling back uncommitted work
//! on failure). Reads go through the object database and never touch the
//! working tree. Network operations run on a worker thread bounded by the
//! configured timeout and take the working-tree lock only for the local ref
//! update that follows a fetch.

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, mpsc};
use std::time::{Duration, Instant};

use bookchat_core::{LockLevel, OrderedMutex, OrderedMutexGuard, RepoSettings};
use chrono::{DateTime, Utc};
use git2::{Oid, Repository, RepositoryInitOptions, Signature};
use serde::{Deserialize, Serialize};

use crate::error::{RepositoryError, Result};
use crate::lock::{FileLock, HealResult, clean_stale_index_lock, heal_locks_in};

const WORKTREE_LOCK_FILE: &str = "bookchat-worktree.lock";
/// Message files are signed byte for byte, so git must never rewrite line
/// endings (this also overrides a user's `core.autocrlf`).
const GITATTRIBUTES: &str = "* -text\n";

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Metadata about a single git commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub short_sha: String,
    pub author: String,
    pub email: String,
    pub date: String,
    pub summary: String,
}

/// A blob directly under a directory of a branch tree.
#[derive(Debug, Clone)]
pub struct TreeFile {
    pub name: String,
    pub data: Vec<u8>,
}

/// What [`RepositoryDriver::integrate`] did with a fetched branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrateOutcome {
    Created,
    FastForwarded,
    UpToDate,
    LocalAhead,
}

// ---------------------------------------------------------------------------
// Process-wide working tree registry
// ---------------------------------------------------------------------------

/// One in-process mutex per repository path, shared by every driver opened on
/// that path.
static WORKTREES: LazyLock<OrderedMutex<HashMap<PathBuf, Arc<OrderedMutex<()>>>>> =
    LazyLock::new(|| OrderedMutex::new(LockLevel::RepoRegistry, HashMap::new()));

fn worktree_mutex(root: &Path) -> Arc<OrderedMutex<()>> {
    let mut registry = WORKTREES.lock();
    Arc::clone(
        registry
            .entry(root.to_path_buf())
            .or_insert_with(|| Arc::new(OrderedMutex::new(LockLevel::Worktree, ()))),
    )
}

struct WorktreeGuard<'a> {
    _file: Option<FileLock>,
    _local: OrderedMutexGuard<'a, ()>,
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub struct RepositoryDriver {
    settings: RepoSettings,
    root: PathBuf,
    worktree: Arc<OrderedMutex<()>>,
}

impl std::fmt::Debug for RepositoryDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryDriver")
            .field("root", &self.root)
            .field("main_branch", &self.settings.main_branch)
            .finish_non_exhaustive()
    }
}

impl RepositoryDriver {
    /// Opens the repository at `settings.root`, initializing it when absent.
    ///
    /// A fresh repository gets `commit.gpgsign=false`, a `.gitattributes` and an
    /// initial commit on the main branch. A configured remote URL is registered.
    ///
    /// # Errors
    /// I/O or git errors while creating or opening the repository.
    pub fn open_or_init(settings: RepoSettings) -> Result<Self> {
        fs::create_dir_all(&settings.root)?;
        let root = settings
            .root
            .canonicalize()
            .unwrap_or_else(|_| settings.root.clone());

        let repo = if root.join(".git").exists() {
            Repository::open(&root)?
        } else {
            let mut opts = RepositoryInitOptions::new();
            opts.initial_head(&settings.main_branch);
            let repo = Repository::init_opts(&root, &opts)?;
            {
                let mut cfg = repo.config()?;
                let _ = cfg.set_bool("commit.gpgsign", false);
            }
            tracing::info!(root = %root.display(), "initialized repository");
            repo
        };

        let driver = Self {
            worktree: worktree_mutex(&root),
            root,
            settings,
        };

        if repo
            .find_reference(&driver.local_ref(&driver.settings.main_branch))
            .is_err()
        {
            driver.initial_commit(&repo)?;
        }
        driver.ensure_remote(&repo)?;
        Ok(driver)
    }

    #[must_use]
    pub fn settings(&self) -> &RepoSettings {
        &self.settings
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn main_branch(&self) -> &str {
        &self.settings.main_branch
    }

    #[must_use]
    pub fn remote_name(&self) -> &str {
        &self.settings.remote_name
    }

    /// Whether the configured remote exists in the repository config.
    #[must_use]
    pub fn has_remote(&self) -> bool {
        Repository::open(&self.root)
            .ok()
            .is_some_and(|r| r.find_remote(&self.settings.remote_name).is_ok())
    }

    fn local_ref(&self, branch: &str) -> String {
        format!("refs/heads/{branch}")
    }

    fn tracking_ref(&self, branch: &str) -> String {
        format!("refs/remotes/{}/{branch}", self.settings.remote_name)
    }

    fn open_repo(&self) -> Result<Repository> {
        Ok(Repository::open(&self.root)?)
    }

    fn committer(&self) -> Result<Signature<'static>> {
        Ok(Signature::now(
            &self.settings.committer_name,
            &self.settings.committer_email,
        )?)
    }

    fn initial_commit(&self, repo: &Repository) -> Result<()> {
        let _guard = self.lock_worktree()?;
        fs::write(self.root.join(".gitattributes"), GITATTRIBUTES)?;
        let mut index = repo.index()?;
        index.add_path(Path::new(".gitattributes"))?;
        index.write()?;
        let tree = repo.find_tree(index.write_tree()?)?;
        let sig = self.committer()?;
        let main_ref = self.local_ref(&self.settings.main_branch);
        repo.commit(Some(&main_ref), &sig, &sig, "chore: initialize repository", &tree, &[])?;
        repo.set_head(&main_ref)?;
        Ok(())
    }

    fn ensure_remote(&self, repo: &Repository) -> Result<()> {
        let Some(url) = self.settings.remote_url.as_deref() else {
            return Ok(());
        };
        match repo.find_remote(&self.settings.remote_name) {
            Ok(existing) if existing.url() == Some(url) => {}
            Ok(_) => repo.remote_set_url(&self.settings.remote_name, url)?,
            Err(_) => {
                repo.remote(&self.settings.remote_name, url)?;
                tracing::info!(remote = %self.settings.remote_name, url, "registered remote");
            }
        }
        Ok(())
    }

    // -- working tree critical section -------------------------------------

    fn lock_worktree(&self) -> Result<WorktreeGuard<'_>> {
        let start = Instant::now();
        let timeout = self.settings.lock_timeout;
        let local = self.worktree.try_lock_for(timeout).ok_or_else(|| {
            RepositoryError::LockTimeout(format!(
                "working tree {} busy in this process for {:.2}s",
                self.root.display(),
                timeout.as_secs_f64()
            ))
        })?;
        let mut file = FileLock::new(self.root.join(".git").join(WORKTREE_LOCK_FILE))
            .with_timeout(timeout.saturating_sub(start.elapsed()));
        file.acquire()?;
        Ok(WorktreeGuard {
            _file: Some(file),
            _local: local,
        })
    }

    fn lock_for_read(&self) -> Result<WorktreeGuard<'_>> {
        let local = self
            .worktree
            .try_lock_for(self.settings.lock_timeout)
            .ok_or_else(|| {
                RepositoryError::LockTimeout(format!(
                    "working tree {} busy in this process",
                    self.root.display()
                ))
            })?;
        Ok(WorktreeGuard {
            _file: None,
            _local: local,
        })
    }

    /// Creates `branch` from the main branch tip if it does not exist.
    /// Returns `true` when the branch was created.
    ///
    /// # Errors
    /// Lock timeout or git errors.
    pub fn ensure_branch(&self, branch: &str) -> Result<bool> {
        validate_branch_name(branch)?;
        let _guard = self.lock_worktree()?;
        let repo = self.open_repo()?;
        self.ensure_branch_locked(&repo, branch)
    }

    fn ensure_branch_locked(&self, repo: &Repository, branch: &str) -> Result<bool> {
        if repo.find_reference(&self.local_ref(branch)).is_ok() {
            return Ok(false);
        }
        let base = repo
            .find_reference(&self.local_ref(&self.settings.main_branch))?
            .peel_to_commit()?;
        match repo.branch(branch, &base, false) {
            Ok(_) => {
                tracing::info!(branch, "created branch");
                Ok(true)
            }
            Err(e) if e.code() == git2::ErrorCode::Exists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Runs `f` with `branch` checked out, then restores the branch that was
    /// checked out before. The branch is created first if needed.
    ///
    /// If `f` fails, or returns without committing what it staged, every file
    /// it wrote is removed and the index and tree are reset to the branch tip
    /// before switching back.
    ///
    /// # Errors
    /// Lock timeout, checkout failures, or whatever `f` returns.
    pub fn with_branch<T, E, F>(&self, branch: &str, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut WorkTreeSession<'_>) -> std::result::Result<T, E>,
        E: From<RepositoryError>,
    {
        validate_branch_name(branch)?;
        let _guard = self.lock_worktree()?;
        let repo = self.open_repo()?;
        let previous = current_branch(&repo);

        let result = (|| {
            self.ensure_branch_locked(&repo, branch)?;
            checkout_branch(&repo, branch)?;
            let mut session = WorkTreeSession::new(&repo, self, branch);
            let out = f(&mut session);
            if out.is_err() || session.has_pending() {
                if out.is_ok() {
                    tracing::warn!(branch, "session ended with uncommitted changes; rolling back");
                }
                session.rollback();
            }
            out
        })();

        let restore = previous
            .filter(|b| repo.find_reference(&self.local_ref(b)).is_ok())
            .unwrap_or_else(|| self.settings.main_branch.clone());
        if let Err(e) = checkout_branch(&repo, &restore) {
            tracing::error!(branch = %restore, error = %e, "failed to restore working tree");
            if result.is_ok() {
                return Err(e.into());
            }
        }
        result
    }

    // -- reads (object database) -------------------------------------------

    /// Local branches whose short name starts with `prefix`, sorted.
    ///
    /// # Errors
    /// Lock timeout or git errors.
    pub fn list_branches(&self, prefix: &str) -> Result<Vec<String>> {
        let _guard = self.lock_for_read()?;
        let repo = self.open_repo()?;
        let mut out = Vec::new();
        for item in repo.branches(Some(git2::BranchType::Local))? {
            let (branch, _) = item?;
            if let Some(name) = branch.name()?
                && name.starts_with(prefix)
            {
                out.push(name.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    /// # Errors
    /// Lock timeout or git errors.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        Ok(self.branch_tip(branch)?.is_some())
    }

    /// # Errors
    /// Lock timeout or git errors.
    pub fn branch_tip(&self, branch: &str) -> Result<Option<Oid>> {
        let _guard = self.lock_for_read()?;
        let repo = self.open_repo()?;
        Ok(repo.refname_to_id(&self.local_ref(branch)).ok())
    }

    /// Branch currently checked out in the working tree.
    ///
    /// # Errors
    /// Git errors opening the repository.
    pub fn current_branch(&self) -> Result<Option<String>> {
        let repo = self.open_repo()?;
        Ok(current_branch(&repo))
    }

    /// Reads a file from the committed tree of `branch`.
    ///
    /// # Errors
    /// `NotFound` if the branch does not exist; git errors.
    pub fn read_file(&self, branch: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let path = validate_repo_relative_path("read path", path)?;
        let _guard = self.lock_for_read()?;
        let repo = self.open_repo()?;
        let tree = self.branch_tree(&repo, branch)?;
        let entry = match tree.get_path(Path::new(path)) {
            Ok(e) => e,
            Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let object = entry.to_object(&repo)?;
        Ok(object.as_blob().map(|b| b.content().to_vec()))
    }

    /// Blobs directly under `dir` in the committed tree of `branch`, sorted
    /// by name. A missing directory is empty.
    ///
    /// # Errors
    /// `NotFound` if the branch does not exist; git errors.
    pub fn read_dir(&self, branch: &str, dir: &str) -> Result<Vec<TreeFile>> {
        let dir = validate_repo_relative_path("read dir", dir)?;
        let _guard = self.lock_for_read()?;
        let repo = self.open_repo()?;
        let tree = self.branch_tree(&repo, branch)?;
        let sub = match tree.get_path(Path::new(dir)) {
            Ok(entry) => entry.to_object(&repo)?,
            Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let Some(sub) = sub.as_tree() else {
            return Ok(Vec::new());
        };
        let mut files = Vec::new();
        for entry in sub {
            if entry.kind() != Some(git2::ObjectType::Blob) {
                continue;
            }
            let Some(name) = entry.name() else { continue };
            let blob = repo.find_blob(entry.id())?;
            files.push(TreeFile {
                name: name.to_string(),
                data: blob.content().to_vec(),
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Number of blobs directly under `dir` on `branch`.
    ///
    /// # Errors
    /// `NotFound` if the branch does not exist; git errors.
    pub fn count_files(&self, branch: &str, dir: &str) -> Result<usize> {
        let dir = validate_repo_relative_path("count dir", dir)?;
        let _guard = self.lock_for_read()?;
        let repo = self.open_repo()?;
        let tree = self.branch_tree(&repo, branch)?;
        let count = match tree.get_path(Path::new(dir)) {
            Ok(entry) => entry
                .to_object(&repo)?
                .as_tree()
                .map_or(0, |t| {
                    t.iter()
                        .filter(|e| e.kind() == Some(git2::ObjectType::Blob))
                        .count()
                }),
            Err(e) if e.code() == git2::ErrorCode::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(count)
    }

    /// Most recent commits on `branch`, newest first.
    ///
    /// # Errors
    /// `NotFound` if the branch does not exist; git errors.
    pub fn log(&self, branch: &str, limit: usize) -> Result<Vec<CommitInfo>> {
        let _guard = self.lock_for_read()?;
        let repo = self.open_repo()?;
        let tip = repo
            .refname_to_id(&self.local_ref(branch))
            .map_err(|_| RepositoryError::NotFound(format!("branch {branch}")))?;

        let mut revwalk = repo.revwalk()?;
        revwalk.push(tip)?;
        revwalk.set_sorting(git2::Sort::TIME)?;

        let mut commits = Vec::new();
        for oid in revwalk.take(limit) {
            let oid = oid?;
            let commit = repo.find_commit(oid)?;
            let author = commit.author();
            let sha = oid.to_string();
            commits.push(CommitInfo {
                short_sha: sha.chars().take(7).collect(),
                sha,
                author: author.name().unwrap_or("unknown").to_string(),
                email: author.email().unwrap_or("").to_string(),
                date: DateTime::from_timestamp(author.when().seconds(), 0)
                    .unwrap_or_default()
                    .to_rfc3339(),
                summary: commit.summary().unwrap_or("").to_string(),
            });
        }
        Ok(commits)
    }

    /// Commit time of the tip of `branch`.
    ///
    /// # Errors
    /// Lock timeout or git errors.
    pub fn last_commit_time(&self, branch: &str) -> Result<Option<DateTime<Utc>>> {
        let _guard = self.lock_for_read()?;
        let repo = self.open_repo()?;
        let Ok(oid) = repo.refname_to_id(&self.local_ref(branch)) else {
            return Ok(None);
        };
        let commit = repo.find_commit(oid)?;
        Ok(DateTime::from_timestamp(commit.time().seconds(), 0))
    }

    fn branch_tree<'r>(&self, repo: &'r Repository, branch: &str) -> Result<git2::Tree<'r>> {
        let reference = repo
            .find_reference(&self.local_ref(branch))
            .map_err(|_| RepositoryError::NotFound(format!("branch {branch}")))?;
        Ok(reference.peel_to_tree()?)
    }

    // -- network -----------------------------------------------------------

    /// Fetches `branch` from the remote into its remote-tracking ref. Does not
    /// touch the working tree or local branches.
    ///
    /// # Errors
    /// `NetworkUnavailable` on transport failure or timeout; `NotFound` when
    /// the remote or the remote branch does not exist.
    pub fn fetch(&self, branch: &str) -> Result<()> {
        validate_branch_name(branch)?;
        let remote_name = self.settings.remote_name.clone();
        let refspec = format!("+{}:{}", self.local_ref(branch), self.tracking_ref(branch));
        let tracking = self.tracking_ref(branch);
        let what = format!("fetch {branch}");
        self.run_with_deadline(&what, move |repo, cancel| {
            let mut remote = find_remote(repo, &remote_name)?;
            let mut fo = git2::FetchOptions::new();
            fo.remote_callbacks(remote_callbacks(repo, cancel));
            remote
                .fetch(&[refspec.as_str()], Some(&mut fo), None)
                .map_err(remote_error)?;
            if repo.refname_to_id(&tracking).is_err() {
                return Err(RepositoryError::NotFound(format!(
                    "{tracking} after fetch"
                )));
            }
            Ok(())
        })
    }

    /// Brings the local branch up to its fetched remote-tracking ref: creates
    /// it when missing, fast-forwards when behind, leaves it when ahead.
    ///
    /// # Errors
    /// `ConflictingState` when local and remote histories diverged; `NotFound`
    /// when nothing was fetched for `branch`.
    pub fn integrate(&self, branch: &str) -> Result<IntegrateOutcome> {
        validate_branch_name(branch)?;
        let _guard = self.lock_worktree()?;
        let repo = self.open_repo()?;
        let tracking_ref = self.tracking_ref(branch);
        let local_ref = self.local_ref(branch);
        let remote_oid = repo
            .refname_to_id(&tracking_ref)
            .map_err(|_| RepositoryError::NotFound(tracking_ref.clone()))?;

        let Ok(local_oid) = repo.refname_to_id(&local_ref) else {
            repo.reference(&local_ref, remote_oid, false, "bookchat: branch from remote")?;
            tracing::info!(branch, "created local branch from remote");
            return Ok(IntegrateOutcome::Created);
        };
        if local_oid == remote_oid {
            return Ok(IntegrateOutcome::UpToDate);
        }
        if repo.graph_descendant_of(remote_oid, local_oid)? {
            repo.find_reference(&local_ref)?
                .set_target(remote_oid, "bookchat: fast-forward from remote")?;
            if current_branch(&repo).as_deref() == Some(branch) {
                checkout_branch(&repo, branch)?;
            }
            tracing::debug!(branch, "fast-forwarded");
            return Ok(IntegrateOutcome::FastForwarded);
        }
        if repo.graph_descendant_of(local_oid, remote_oid)? {
            return Ok(IntegrateOutcome::LocalAhead);
        }
        Err(RepositoryError::ConflictingState(format!(
            "{branch} diverged from {tracking_ref}"
        )))
    }

    /// Pushes the local `branch` to the same name on the remote.
    ///
    /// # Errors
    /// `NetworkUnavailable` on transport failure or timeout; `ConflictingState`
    /// when the remote rejects the update; `NotFound` for a missing branch or
    /// remote.
    pub fn push(&self, branch: &str) -> Result<()> {
        validate_branch_name(branch)?;
        if self.branch_tip(branch)?.is_none() {
            return Err(RepositoryError::NotFound(format!("branch {branch}")));
        }
        let remote_name = self.settings.remote_name.clone();
        let refspec = format!("{0}:{0}", self.local_ref(branch));
        let what = format!("push {branch}");
        self.run_with_deadline(&what, move |repo, cancel| {
            let mut remote = find_remote(repo, &remote_name)?;
            let rejection: std::cell::RefCell<Option<String>> = std::cell::RefCell::new(None);
            {
                let mut callbacks = remote_callbacks(repo, cancel);
                callbacks.push_update_reference(|_ref_name, status| {
                    if let Some(msg) = status {
                        *rejection.borrow_mut() = Some(msg.to_string());
                    }
                    Ok(())
                });
                let mut po = git2::PushOptions::new();
                po.remote_callbacks(callbacks);
                if let Err(e) = remote.push(&[refspec.as_str()], Some(&mut po)) {
                    if is_rejection(e.message()) {
                        return Err(RepositoryError::ConflictingState(e.message().to_string()));
                    }
                    return Err(remote_error(e));
                }
            }
            match rejection.into_inner() {
                Some(msg) => Err(RepositoryError::ConflictingState(format!(
                    "remote rejected {refspec}: {msg}"
                ))),
                None => Ok(()),
            }
        })
    }

    /// Branch names on the remote whose short name starts with `prefix`.
    ///
    /// # Errors
    /// `NetworkUnavailable` on transport failure or timeout.
    pub fn list_remote_branches(&self, prefix: &str) -> Result<Vec<String>> {
        let remote_name = self.settings.remote_name.clone();
        let prefix = prefix.to_string();
        self.run_with_deadline("ls-remote", move |repo, cancel| {
            let mut remote = find_remote(repo, &remote_name)?;
            let callbacks = remote_callbacks(repo, cancel);
            let conn = remote
                .connect_auth(git2::Direction::Fetch, Some(callbacks), None)
                .map_err(remote_error)?;
            let mut names: Vec<String> = conn
                .list()
                .map_err(remote_error)?
                .iter()
                .filter_map(|head| head.name().strip_prefix("refs/heads/"))
                .filter(|name| name.starts_with(&prefix))
                .map(str::to_string)
                .collect();
            names.sort();
            names.dedup();
            Ok(names)
        })
    }

    /// Runs `op` against a fresh repository handle on a worker thread and
    /// waits at most the network timeout. On timeout the worker is asked to
    /// abort through `cancel` and `NetworkUnavailable` is returned.
    fn run_with_deadline<T, F>(&self, what: &str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Repository, &AtomicBool) -> Result<T> + Send + 'static,
    {
        let timeout: Duration = self.settings.network_timeout;
        let root = self.root.clone();
        let cancel = Arc::new(AtomicBool::new(false));
        let worker_cancel = Arc::clone(&cancel);
        let (tx, rx) = mpsc::sync_channel(1);
        let started = Instant::now();

        std::thread::Builder::new()
            .name("bookchat-net".into())
            .spawn(move || {
                let result = Repository::open(&root)
                    .map_err(RepositoryError::from)
                    .and_then(|repo| op(&repo, &worker_cancel));
                let _ = tx.send(result);
            })?;

        let outcome = match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                cancel.store(true, Ordering::Relaxed);
                Err(RepositoryError::NetworkUnavailable(format!(
                    "{what} timed out after {:.1}s",
                    timeout.as_secs_f64()
                )))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(RepositoryError::NetworkUnavailable(
                format!("{what}: network worker exited"),
            )),
        };
        bookchat_core::global_metrics()
            .sync
            .network_latency_us
            .record_duration(started.elapsed());
        outcome
    }

    /// Cleans advisory lock files left by dead processes and a stale
    /// `index.lock`.
    ///
    /// # Errors
    /// I/O errors scanning the git directory.
    pub fn heal_worktree_locks(&self) -> Result<HealResult> {
        let result = heal_locks_in(&self.root.join(".git"))?;
        if !result.locks_removed.is_empty() || result.index_lock_removed {
            tracing::info!(
                removed = result.locks_removed.len(),
                index_lock = result.index_lock_removed,
                "healed stale working tree locks"
            );
        }
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Working tree session
// ---------------------------------------------------------------------------

/// Staged edits on the checked-out branch, valid only inside
/// [`RepositoryDriver::with_branch`].
pub struct WorkTreeSession<'a> {
    repo: &'a Repository,
    driver: &'a RepositoryDriver,
    branch: String,
    workdir: PathBuf,
    staged_writes: Vec<String>,
    staged_removes: Vec<String>,
    created: Vec<PathBuf>,
}

impl<'a> WorkTreeSession<'a> {
    fn new(repo: &'a Repository, driver: &'a RepositoryDriver, branch: &str) -> Self {
        Self {
            repo,
            driver,
            branch: branch.to_string(),
            workdir: driver.root.clone(),
            staged_writes: Vec::new(),
            staged_removes: Vec::new(),
            created: Vec::new(),
        }
    }

    #[must_use]
    pub fn branch(&self) -> &str {
        &self.branch
    }

    fn has_pending(&self) -> bool {
        !self.staged_writes.is_empty() || !self.staged_removes.is_empty()
    }

    fn full_path(&self, rel: &str) -> Result<PathBuf> {
        let rel = validate_repo_relative_path("working tree path", rel)?;
        Ok(self.workdir.join(rel))
    }

    #[must_use]
    pub fn exists(&self, rel: &str) -> bool {
        self.full_path(rel).is_ok_and(|p| p.exists())
    }

    /// Reads a file from the checked-out working tree.
    ///
    /// # Errors
    /// Invalid path or I/O errors other than not-found.
    pub fn read_file(&self, rel: &str) -> Result<Option<Vec<u8>>> {
        let path = self.full_path(rel)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes a file and stages it for the next commit.
    ///
    /// # Errors
    /// Invalid path or I/O errors.
    pub fn write_file(&mut self, rel: &str, bytes: &[u8]) -> Result<()> {
        let path = self.full_path(rel)?;
        if !path.exists() {
            self.created.push(path.clone());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes)?;
        self.staged_writes.push(rel.to_string());
        Ok(())
    }

    /// Deletes a tracked file and stages the removal.
    ///
    /// # Errors
    /// Invalid path or I/O errors.
    pub fn remove_file(&mut self, rel: &str) -> Result<()> {
        let path = self.full_path(rel)?;
        fs::remove_file(&path)?;
        self.staged_removes.push(rel.to_string());
        Ok(())
    }

    /// Moves a tracked file within the working tree and stages both sides.
    ///
    /// # Errors
    /// `ConflictingState` if the destination exists; invalid path or I/O errors.
    pub fn rename_file(&mut self, from: &str, to: &str) -> Result<()> {
        let src = self.full_path(from)?;
        let dst = self.full_path(to)?;
        if dst.exists() {
            return Err(RepositoryError::ConflictingState(format!(
                "{to} already exists"
            )));
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&src, &dst)?;
        self.created.push(dst);
        self.staged_removes.push(from.to_string());
        self.staged_writes.push(to.to_string());
        Ok(())
    }

    /// Commits everything staged in this session on the checked-out branch.
    /// `author` names the chat author (`<author>@bookchat.local`); the
    /// committer is the configured bot identity.
    ///
    /// # Errors
    /// Git errors; index.lock contention is retried with backoff first.
    pub fn commit(&mut self, message: &str, author: Option<&str>) -> Result<Oid> {
        const MAX_INDEX_LOCK_RETRIES: u32 = 5;

        let committer = self.driver.committer()?;
        let author_sig = match author {
            Some(name) => Signature::now(name, &format!("{name}@bookchat.local"))?,
            None => committer.clone(),
        };
        let git_dir = self.repo.path().to_path_buf();
        let mut last_resort_done = false;
        let mut attempt = 0u32;

        loop {
            match self.commit_once(message, &author_sig, &committer) {
                Ok(oid) => {
                    self.staged_writes.clear();
                    self.staged_removes.clear();
                    self.created.clear();
                    tracing::debug!(branch = %self.branch, %oid, "committed");
                    return Ok(oid);
                }
                Err(e) if is_git_index_lock_error(&e) => {
                    if attempt >= MAX_INDEX_LOCK_RETRIES {
                        if !last_resort_done && clean_stale_index_lock(&git_dir, 60.0) {
                            last_resort_done = true;
                            continue;
                        }
                        return Err(RepositoryError::LockTimeout(format!(
                            "git index.lock contention after {MAX_INDEX_LOCK_RETRIES} retries: {}",
                            e.message()
                        )));
                    }
                    // 100ms, 200ms, 400ms, 800ms, 1600ms
                    std::thread::sleep(Duration::from_millis(100 * (1u64 << attempt.min(4))));
                    let _ = clean_stale_index_lock(&git_dir, 300.0);
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn commit_once(
        &self,
        message: &str,
        author: &Signature<'_>,
        committer: &Signature<'_>,
    ) -> std::result::Result<Oid, git2::Error> {
        let mut index = self.repo.index()?;
        for rel in &self.staged_removes {
            if !self.workdir.join(rel).exists() {
                index.remove_path(Path::new(rel))?;
            }
        }
        for rel in &self.staged_writes {
            if self.workdir.join(rel).exists() {
                index.add_path(Path::new(rel))?;
            }
        }
        index.write()?;
        let tree = self.repo.find_tree(index.write_tree()?)?;
        let parent = self.repo.head()?.peel_to_commit()?;
        self.repo
            .commit(Some("HEAD"), author, committer, message, &tree, &[&parent])
    }

    /// Discards uncommitted work: removes files created in this session and
    /// resets index and tree to the branch tip.
    fn rollback(&mut self) {
        for path in self.created.drain(..) {
            let _ = fs::remove_file(&path);
        }
        match self.repo.head().and_then(|h| h.peel_to_commit()) {
            Ok(tip) => {
                if let Err(e) = self.repo.reset(tip.as_object(), git2::ResetType::Hard, None) {
                    tracing::error!(branch = %self.branch, error = %e, "rollback reset failed");
                }
            }
            Err(e) => tracing::error!(branch = %self.branch, error = %e, "rollback: no branch tip"),
        }
        self.staged_writes.clear();
        self.staged_removes.clear();
        tracing::debug!(branch = %self.branch, "rolled back working tree session");
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn current_branch(repo: &Repository) -> Option<String> {
    let head = repo.head().ok()?;
    if !head.is_branch() {
        return None;
    }
    head.shorthand().map(str::to_string)
}

fn checkout_branch(repo: &Repository, branch: &str) -> Result<()> {
    let refname = format!("refs/heads/{branch}");
    let target = repo.revparse_single(&refname)?;
    let mut opts = git2::build::CheckoutBuilder::new();
    opts.force();
    repo.checkout_tree(&target, Some(&mut opts))?;
    repo.set_head(&refname)?;
    Ok(())
}

fn find_remote<'r>(repo: &'r Repository, name: &str) -> Result<git2::Remote<'r>> {
    repo.find_remote(name)
        .map_err(|_| RepositoryError::NotFound(format!("remote {name}")))
}

fn remote_callbacks<'a>(repo: &Repository, cancel: &'a AtomicBool) -> git2::RemoteCallbacks<'a> {
    let cfg = repo.config().ok();
    let mut callbacks = git2::RemoteCallbacks::new();
    callbacks.credentials(move |url, username_from_url, allowed| {
        if allowed.is_ssh_key()
            && let Some(user) = username_from_url
        {
            return git2::Cred::ssh_key_from_agent(user);
        }
        if allowed.is_user_pass_plaintext()
            && let Some(ref cfg) = cfg
            && let Ok(cred) = git2::Cred::credential_helper(cfg, url, username_from_url)
        {
            return Ok(cred);
        }
        git2::Cred::default()
    });
    callbacks.transfer_progress(move |_| !cancel.load(Ordering::Relaxed));
    callbacks.push_transfer_progress(|_, _, _| {});
    callbacks
}

/// Errors from talking to the remote: anything not otherwise classified means
/// the remote could not be reached.
fn remote_error(err: git2::Error) -> RepositoryError {
    match RepositoryError::from(err) {
        RepositoryError::Git(e) => RepositoryError::NetworkUnavailable(e.message().to_string()),
        other => other,
    }
}

fn is_rejection(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    lower.contains("non-fast-forward")
        || lower.contains("fastforward")
        || lower.contains("fetch first")
        || lower.contains("rejected")
        || lower.contains("not present locally")
}

/// Check if an error is a git index.lock contention error.
fn is_git_index_lock_error(err: &git2::Error) -> bool {
    if err.code() == git2::ErrorCode::Locked {
        return true;
    }
    let msg = err.message().to_lowercase();
    msg.contains("index.lock") || msg.contains("lock at") || msg.contains("index is locked")
}

fn validate_branch_name(branch: &str) -> Result<()> {
    if branch.is_empty() || !git2::Reference::is_valid_name(&format!("refs/heads/{branch}")) {
        return Err(RepositoryError::InvalidPath(format!(
            "invalid branch name {branch:?}"
        )));
    }
    Ok(())
}

/// Rejects anything but a plain repo-root-relative path outside `.git`.
pub(crate) fn validate_repo_relative_path<'a>(kind: &str, raw: &'a str) -> Result<&'a str> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(RepositoryError::InvalidPath(format!("{kind} is empty")));
    }
    if s.contains('\\') || s.contains('\0') {
        return Err(RepositoryError::InvalidPath(format!(
            "{kind} {s:?} must use plain forward slashes"
        )));
    }

    let p = Path::new(s);
    if let Some(Component::Normal(first)) = p.components().next()
        && first == ".git"
    {
        return Err(RepositoryError::InvalidPath(format!(
            "{kind} must not reference .git internals"
        )));
    }
    if !p.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(RepositoryError::InvalidPath(format!(
            "{kind} {s:?} must be a repo-root-relative path"
        )));
    }
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_settings(root: &Path) -> RepoSettings {
        let mut settings = RepoSettings::for_root(root);
        settings.lock_timeout = Duration::from_secs(5);
        settings.network_timeout = Duration::from_secs(10);
        settings
    }

    fn driver(tmp: &TempDir) -> RepositoryDriver {
        RepositoryDriver::open_or_init(test_settings(&tmp.path().join("repo"))).unwrap()
    }

    #[test]
    fn open_initializes_once() {
        let tmp = TempDir::new().unwrap();
        let d = driver(&tmp);
        assert!(d.root().join(".git").exists());
        assert!(d.root().join(".gitattributes").exists());
        assert_eq!(d.current_branch().unwrap().as_deref(), Some("main"));
        assert_eq!(d.log("main", 10).unwrap().len(), 1);

        let again = RepositoryDriver::open_or_init(test_settings(&tmp.path().join("repo"))).unwrap();
        assert_eq!(again.log("main", 10).unwrap().len(), 1);
    }

    #[test]
    fn ensure_branch_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let d = driver(&tmp);
        assert!(d.ensure_branch("user/alice").unwrap());
        assert!(!d.ensure_branch("user/alice").unwrap());
        assert_eq!(d.list_branches("user/").unwrap(), vec!["user/alice".to_string()]);
    }

    #[test]
    fn with_branch_commits_and_returns_to_main() {
        let tmp = TempDir::new().unwrap();
        let d = driver(&tmp);
        d.with_branch::<_, RepositoryError, _>("user/alice", |s| {
            assert_eq!(s.branch(), "user/alice");
            s.write_file("messages/alice/a.txt", b"hello")?;
            s.commit("message: add a", Some("alice"))?;
            Ok(())
        })
        .unwrap();

        assert_eq!(d.current_branch().unwrap().as_deref(), Some("main"));
        assert!(!d.root().join("messages/alice/a.txt").exists());
        assert_eq!(
            d.read_file("user/alice", "messages/alice/a.txt").unwrap(),
            Some(b"hello".to_vec())
        );
        assert_eq!(d.read_file("main", "messages/alice/a.txt").unwrap(), None);
        let log = d.log("user/alice", 1).unwrap();
        assert_eq!(log[0].author, "alice");
        assert_eq!(log[0].email, "alice@bookchat.local");
        assert_eq!(log[0].summary, "message: add a");
    }

    #[test]
    fn committed_bytes_are_stored_verbatim() {
        let tmp = TempDir::new().unwrap();
        let d = driver(&tmp);
        let body = "crlf\r\nlone\rcr\nümlaut ✓\r\n".as_bytes();
        d.with_branch::<_, RepositoryError, _>("user/alice", |s| {
            s.write_file("messages/alice/a.txt", body)?;
            s.write_file("keys/alice.json", b"{\r\n}\r\n")?;
            s.commit("message: add a", Some("alice"))?;
            Ok(())
        })
        .unwrap();

        assert_eq!(
            d.read_file("user/alice", "messages/alice/a.txt").unwrap().as_deref(),
            Some(body)
        );
        assert_eq!(
            d.read_file("user/alice", "keys/alice.json").unwrap().as_deref(),
            Some(&b"{\r\n}\r\n"[..])
        );
    }

    #[test]
    fn failed_session_leaves_no_partial_file() {
        let tmp = TempDir::new().unwrap();
        let d = driver(&tmp);
        let err = d
            .with_branch::<(), RepositoryError, _>("user/bob", |s| {
                s.write_file("messages/bob/x.txt", b"partial")?;
                Err(RepositoryError::ConflictingState("boom".into()))
            })
            .unwrap_err();
        assert!(matches!(err, RepositoryError::ConflictingState(_)));
        assert_eq!(d.current_branch().unwrap().as_deref(), Some("main"));
        assert!(!d.root().join("messages/bob/x.txt").exists());
        assert_eq!(d.read_file("user/bob", "messages/bob/x.txt").unwrap(), None);
        // the branch itself was created before the failure and is kept
        assert!(d.branch_exists("user/bob").unwrap());
    }

    #[test]
    fn uncommitted_session_is_rolled_back() {
        let tmp = TempDir::new().unwrap();
        let d = driver(&tmp);
        d.with_branch::<_, RepositoryError, _>("user/eve", |s| s.write_file("messages/eve/y.txt", b"y"))
            .unwrap();
        assert_eq!(d.read_file("user/eve", "messages/eve/y.txt").unwrap(), None);
        d.with_branch::<_, RepositoryError, _>("user/eve", |s| {
            assert!(!s.exists("messages/eve/y.txt"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn rename_moves_between_directories() {
        let tmp = TempDir::new().unwrap();
        let d = driver(&tmp);
        d.with_branch::<_, RepositoryError, _>("user/amy", |s| {
            s.write_file("messages/amy/m.txt", b"m")?;
            s.commit("add", None)?;
            s.rename_file("messages/amy/m.txt", "archive/amy/m.txt")?;
            s.commit("move", None)?;
            Ok(())
        })
        .unwrap();
        assert_eq!(d.read_dir("user/amy", "messages/amy").unwrap().len(), 0);
        let archived = d.read_dir("user/amy", "archive/amy").unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].name, "m.txt");
        assert_eq!(d.count_files("user/amy", "archive/amy").unwrap(), 1);
    }

    #[test]
    fn reads_of_missing_branch_are_not_found() {
        let tmp = TempDir::new().unwrap();
        let d = driver(&tmp);
        assert!(matches!(
            d.read_file("user/ghost", "x"),
            Err(RepositoryError::NotFound(_))
        ));
        assert!(matches!(d.log("user/ghost", 1), Err(RepositoryError::NotFound(_))));
        assert!(d.last_commit_time("user/ghost").unwrap().is_none());
    }

    #[test]
    fn path_validation() {
        for bad in ["", "../x", "/abs", ".git/config", "a/../b", "a\\b", "./a"] {
            assert!(validate_repo_relative_path("p", bad).is_err(), "{bad}");
        }
        assert_eq!(
            validate_repo_relative_path("p", "messages/a/b.txt").unwrap(),
            "messages/a/b.txt"
        );
        assert!(validate_branch_name("user/ok").is_ok());
        assert!(validate_branch_name("user/..bad").is_err());
    }

    #[test]
    fn network_ops_without_remote_are_not_found() {
        let tmp = TempDir::new().unwrap();
        let d = driver(&tmp);
        d.ensure_branch("user/alice").unwrap();
        assert!(!d.has_remote());
        assert!(matches!(d.fetch("user/alice"), Err(RepositoryError::NotFound(_))));
        assert!(matches!(d.push("user/alice"), Err(RepositoryError::NotFound(_))));
    }
}
