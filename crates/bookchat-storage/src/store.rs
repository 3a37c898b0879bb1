//! The chat domain mapped onto the repository: one branch per author, one
//! directory per author, one file per message.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use bookchat_core::{
    BranchRef, Clock, Config, LockLevel, Message, MessageId, OrderedMutex, SystemClock,
    global_metrics, signing_payload, sort_chronologically, truncate_to_micros, validate_content,
};
use bookchat_keys::{KeyManager, PublicKeyHistory};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{RepositoryError, StoreError, StoreResult};
use crate::format::{decode_message, encode_message};
use crate::repo::{CommitInfo, RepositoryDriver, TreeFile};

/// What the store knows about one author's branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchMeta {
    pub branch: BranchRef,
    pub message_count: usize,
    pub archived_count: usize,
    pub last_active: Option<DateTime<Utc>>,
}

impl BranchMeta {
    fn empty(branch: BranchRef) -> Self {
        Self {
            branch,
            message_count: 0,
            archived_count: 0,
            last_active: None,
        }
    }
}

/// Author → branch metadata, refreshed by reads and bumped by appends.
#[derive(Debug, Default)]
struct BranchDirectory {
    entries: BTreeMap<String, BranchMeta>,
}

impl BranchDirectory {
    fn entry(&mut self, branch: &BranchRef) -> &mut BranchMeta {
        self.entries
            .entry(branch.author().to_string())
            .or_insert_with(|| BranchMeta::empty(branch.clone()))
    }
}

/// A hot message as the archive sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotEntry {
    pub file_name: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

pub struct BranchedMessageStore {
    driver: Arc<RepositoryDriver>,
    keys: Arc<KeyManager>,
    clock: Arc<dyn Clock>,
    max_content_bytes: usize,
    directory: OrderedMutex<BranchDirectory>,
}

impl BranchedMessageStore {
    #[must_use]
    pub fn new(
        driver: Arc<RepositoryDriver>,
        keys: Arc<KeyManager>,
        clock: Arc<dyn Clock>,
        max_content_bytes: usize,
    ) -> Self {
        Self {
            driver,
            keys,
            clock,
            max_content_bytes,
            directory: OrderedMutex::new(LockLevel::StoreDirectory, BranchDirectory::default()),
        }
    }

    /// Opens the repository and key directory named by `config`.
    ///
    /// # Errors
    /// Repository or key directory initialization failures.
    pub fn open(config: &Config) -> StoreResult<Self> {
        let driver = Arc::new(RepositoryDriver::open_or_init(config.repo_settings())?);
        let keys = Arc::new(KeyManager::open(&config.keys_dir, config.signing())?);
        Ok(Self::new(
            driver,
            keys,
            Arc::new(SystemClock),
            config.max_content_bytes,
        ))
    }

    #[must_use]
    pub fn driver(&self) -> &Arc<RepositoryDriver> {
        &self.driver
    }

    #[must_use]
    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Creates the author's branch if missing. Returns `true` when created.
    ///
    /// # Errors
    /// Invalid author or repository errors.
    pub fn ensure_branch(&self, author: &str) -> StoreResult<bool> {
        let branch = BranchRef::for_author(author)?;
        Ok(self.driver.ensure_branch(&branch.name())?)
    }

    /// Commits a new message on the author's branch and returns it.
    ///
    /// Validation happens before any repository work. The timestamp and
    /// signature are taken inside the working-tree critical section, so an
    /// author's commit order always matches `created_at` order. When signing
    /// is enabled the author's keypair is created on first use and its public
    /// history is committed next to the message so other replicas can verify
    /// it.
    ///
    /// # Errors
    /// Validation, key, or repository errors. A failed append leaves no file
    /// behind and the working tree on its previous branch.
    pub fn append(&self, author: &str, content: &str) -> StoreResult<Message> {
        let branch = BranchRef::for_author(author)?;
        validate_content(content, self.max_content_bytes)?;

        let started = Instant::now();
        let result = self.driver.with_branch(&branch.name(), |session| -> StoreResult<Message> {
            let created_at = truncate_to_micros(self.clock.now_utc());
            let signature = if self.keys.signing_enabled() {
                self.keys.generate_keypair(author)?;
                Some(
                    self.keys
                        .sign(author, &signing_payload(author, &created_at, content))?,
                )
            } else {
                None
            };

            let mut id = MessageId::generate(author, &created_at);
            while session.exists(&branch.message_path(&id.file_name())) {
                id = MessageId::generate(author, &created_at);
            }
            let body = encode_message(author, &created_at, content, signature.as_deref());
            session.write_file(&branch.message_path(&id.file_name()), body.as_bytes())?;
            if signature.is_some()
                && let Some(history) = self.keys.export_public_history(author)?
            {
                write_published_keys(session, &branch, &history)?;
            }
            let commit_message =
                format!("message: add {id} from {author}\n\nAuthor: {author}\nMessage-Id: {id}\n");
            session.commit(&commit_message, Some(author))?;
            Ok(Message {
                id,
                author: author.to_string(),
                content: content.to_string(),
                created_at,
                signature,
                verified: false,
                archived: false,
            })
        });

        let metrics = &global_metrics().store;
        let mut message = match result {
            Ok(message) => message,
            Err(e) => {
                metrics.append_errors_total.inc();
                tracing::warn!(author, error = %e, "append failed");
                return Err(e);
            }
        };
        metrics.appends_total.inc();
        metrics.commit_latency_us.record_duration(started.elapsed());
        tracing::debug!(author, id = %message.id, "appended message");

        {
            let mut directory = self.directory.lock();
            let meta = directory.entry(&branch);
            meta.message_count += 1;
            meta.last_active = Some(message.created_at);
            metrics.branches_known.set(directory.entries.len() as u64);
        }

        message.verified = self.verify(&message);
        Ok(message)
    }

    /// Every message on every author branch, hot and archived, in
    /// chronological order (`created_at`, then `id`).
    ///
    /// Files that fail to decode are skipped and logged.
    ///
    /// # Errors
    /// Repository errors enumerating or reading branches.
    pub fn list_all(&self) -> StoreResult<Vec<Message>> {
        global_metrics().store.list_calls_total.inc();
        let mut all = Vec::new();
        for branch in self.branch_refs()? {
            match self.list_branch(&branch) {
                Ok(messages) => all.extend(messages),
                Err(e) if e.is_not_found() => {
                    tracing::debug!(branch = %branch, "branch vanished during listing");
                }
                Err(e) => return Err(e),
            }
        }
        sort_chronologically(&mut all);
        Ok(all)
    }

    /// Messages of one author branch, unsorted.
    ///
    /// # Errors
    /// `NotFound` if the branch does not exist; repository errors.
    pub fn list_branch(&self, branch: &BranchRef) -> StoreResult<Vec<Message>> {
        let name = branch.name();
        self.import_published_keys(branch);
        let hot = self.driver.read_dir(&name, &branch.messages_dir())?;
        let archived = self.driver.read_dir(&name, &branch.archive_dir())?;

        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(hot.len() + archived.len());
        let (mut hot_count, mut archived_count) = (0, 0);
        let tiers = hot
            .iter()
            .map(|f| (f, false))
            .chain(archived.iter().map(|f| (f, true)));
        for (file, is_archived) in tiers {
            match self.decode_entry(branch, file, is_archived) {
                Ok(Some(message)) => {
                    if !seen.insert(message.id.clone()) {
                        continue;
                    }
                    if is_archived {
                        archived_count += 1;
                    } else {
                        hot_count += 1;
                    }
                    out.push(message);
                }
                Ok(None) => {}
                Err(reason) => {
                    global_metrics().store.files_skipped_total.inc();
                    tracing::warn!(branch = %branch, file = %file.name, %reason, "skipping unreadable message file");
                }
            }
        }

        let mut directory = self.directory.lock();
        let meta = directory.entry(branch);
        meta.message_count = hot_count;
        meta.archived_count = archived_count;
        global_metrics()
            .store
            .branches_known
            .set(directory.entries.len() as u64);
        Ok(out)
    }

    /// Point lookup of `<filename>` in the author's hot or archive directory.
    ///
    /// # Errors
    /// `NotFound` when the branch or file does not exist; `Parse` when the
    /// file exists but cannot be decoded.
    pub fn get_by_file(&self, author: &str, file_name: &str) -> StoreResult<Message> {
        let branch = BranchRef::for_author(author)?;
        let not_found =
            || StoreError::from(RepositoryError::NotFound(format!("{branch}:{file_name}")));
        if MessageId::from_file_name(file_name).is_none() {
            return Err(not_found());
        }
        let name = branch.name();
        if !self.driver.branch_exists(&name)? {
            return Err(RepositoryError::NotFound(format!("branch {name}")).into());
        }
        self.import_published_keys(&branch);

        for (path, archived) in [
            (branch.message_path(file_name), false),
            (branch.archive_path(file_name), true),
        ] {
            if let Some(data) = self.driver.read_file(&name, &path)? {
                let file = TreeFile {
                    name: file_name.to_string(),
                    data,
                };
                return match self.decode_entry(&branch, &file, archived) {
                    Ok(Some(message)) => Ok(message),
                    Ok(None) => Err(not_found()),
                    Err(reason) => Err(StoreError::Parse { path, reason }),
                };
            }
        }
        Err(not_found())
    }

    /// Lookup by message id; the id names its author, so only one branch is read.
    ///
    /// # Errors
    /// `InvalidMessageId` for a malformed id, otherwise as [`Self::get_by_file`].
    pub fn get_by_id(&self, id: &str) -> StoreResult<Message> {
        let id = MessageId::parse(id)?;
        self.get_by_file(id.author(), &id.file_name())
    }

    /// Metadata for every author branch, recomputed from the repository.
    ///
    /// # Errors
    /// Repository errors.
    pub fn authors(&self) -> StoreResult<Vec<BranchMeta>> {
        let mut metas = Vec::new();
        for branch in self.branch_refs()? {
            let name = branch.name();
            metas.push(BranchMeta {
                message_count: self.driver.count_files(&name, &branch.messages_dir())?,
                archived_count: self.driver.count_files(&name, &branch.archive_dir())?,
                last_active: self.driver.last_commit_time(&name)?,
                branch,
            });
        }

        let mut directory = self.directory.lock();
        directory.entries = metas
            .iter()
            .map(|m| (m.branch.author().to_string(), m.clone()))
            .collect();
        global_metrics()
            .store
            .branches_known
            .set(directory.entries.len() as u64);
        Ok(metas)
    }

    /// Recent commits on the author's branch, newest first.
    ///
    /// # Errors
    /// Invalid author, or `NotFound` for an author with no branch.
    pub fn history(&self, author: &str, limit: usize) -> StoreResult<Vec<CommitInfo>> {
        let branch = BranchRef::for_author(author)?;
        Ok(self.driver.log(&branch.name(), limit)?)
    }

    /// Authors with a local branch.
    ///
    /// # Errors
    /// Repository errors.
    pub fn known_authors(&self) -> StoreResult<Vec<String>> {
        Ok(self
            .branch_refs()?
            .into_iter()
            .map(|b| b.author().to_string())
            .collect())
    }

    /// Decodable hot messages of `branch` with their on-disk sizes.
    pub(crate) fn hot_entries(&self, branch: &BranchRef) -> StoreResult<Vec<HotEntry>> {
        let files = self.driver.read_dir(&branch.name(), &branch.messages_dir())?;
        let mut out = Vec::with_capacity(files.len());
        for file in files {
            if MessageId::from_file_name(&file.name).is_none() {
                continue;
            }
            if let Ok(parsed) = decode_message(&file.data)
                && parsed.author == branch.author()
            {
                out.push(HotEntry {
                    size: file.data.len() as u64,
                    file_name: file.name,
                    created_at: parsed.created_at,
                });
            }
        }
        Ok(out)
    }

    fn branch_refs(&self) -> StoreResult<Vec<BranchRef>> {
        let names = self.driver.list_branches(bookchat_core::identity::BRANCH_PREFIX)?;
        Ok(names
            .iter()
            .filter_map(|name| {
                let parsed = BranchRef::parse(name);
                if parsed.is_none() {
                    tracing::debug!(branch = %name, "ignoring branch with invalid author");
                }
                parsed
            })
            .collect())
    }

    /// `Ok(None)` for files that are not messages at all (wrong extension).
    fn decode_entry(
        &self,
        branch: &BranchRef,
        file: &TreeFile,
        archived: bool,
    ) -> Result<Option<Message>, String> {
        if !file.name.ends_with(".txt") {
            return Ok(None);
        }
        let id = MessageId::from_file_name(&file.name)
            .ok_or_else(|| "file name is not a message id".to_string())?;
        if id.author() != branch.author() {
            return Err(format!("id author {} on branch {branch}", id.author()));
        }
        let parsed = decode_message(&file.data)?;
        if parsed.author != branch.author() {
            return Err(format!("Author header {} on branch {branch}", parsed.author));
        }
        let mut message = parsed.into_message(id, archived);
        message.verified = self.verify(&message);
        Ok(Some(message))
    }

    fn verify(&self, message: &Message) -> bool {
        let Some(signature) = message.signature.as_deref() else {
            return false;
        };
        let ok = self
            .keys
            .verify(&message.signing_payload(), signature, &message.author);
        if !ok {
            global_metrics().store.verify_failures_total.inc();
            tracing::debug!(id = %message.id, author = %message.author, "signature did not verify");
        }
        ok
    }

    /// Imports the public key history committed on `branch`, if any.
    ///
    /// Histories are trusted on publish: whoever can push `user/<author>` to
    /// the shared remote can add keys for that author, and messages signed
    /// with them verify. Verification proves a message matches a key on the
    /// author's branch, not who pushed it.
    fn import_published_keys(&self, branch: &BranchRef) {
        let data = match self.driver.read_file(&branch.name(), &branch.keys_path()) {
            Ok(Some(data)) => data,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(branch = %branch, error = %e, "no published keys");
                return;
            }
        };
        let history: PublicKeyHistory = match serde_json::from_slice(&data) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(branch = %branch, error = %e, "malformed published key history");
                return;
            }
        };
        if history.author != branch.author() {
            tracing::warn!(branch = %branch, claimed = %history.author, "published keys name another author");
            return;
        }
        if let Err(e) = self.keys.import_public_history(&history) {
            tracing::warn!(branch = %branch, error = %e, "failed to import published keys");
        }
    }
}

fn write_published_keys(
    session: &mut crate::repo::WorkTreeSession<'_>,
    branch: &BranchRef,
    history: &PublicKeyHistory,
) -> StoreResult<()> {
    let path = branch.keys_path();
    let mut json = serde_json::to_vec_pretty(history)?;
    json.push(b'\n');
    if session.read_file(&path)?.as_deref() != Some(json.as_slice()) {
        session.write_file(&path, &json)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookchat_core::{ManualClock, RepoSettings, SigningConfig};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        clock: Arc<ManualClock>,
        store: BranchedMessageStore,
    }

    fn fixture(signing: bool) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let mut settings = RepoSettings::for_root(tmp.path().join("repo"));
        settings.lock_timeout = Duration::from_secs(5);
        let driver = Arc::new(RepositoryDriver::open_or_init(settings).unwrap());
        let keys = Arc::new(
            KeyManager::open(tmp.path().join("keys"), SigningConfig { enabled: signing }).unwrap(),
        );
        let clock = Arc::new(ManualClock::default());
        let store = BranchedMessageStore::new(driver, keys, clock.clone(), 1024);
        Fixture {
            _tmp: tmp,
            clock,
            store,
        }
    }

    #[test]
    fn append_then_list_returns_the_message() {
        let f = fixture(true);
        let m = f.store.append("alice", "hello").unwrap();
        assert!(m.verified);
        assert!(m.signature.is_some());
        let all = f.store.list_all().unwrap();
        assert_eq!(all, vec![m]);
    }

    #[test]
    fn unsigned_messages_are_unverified() {
        let f = fixture(false);
        let m = f.store.append("bob", "hi").unwrap();
        assert!(!m.verified);
        assert!(m.signature.is_none());
        assert!(!f.store.list_all().unwrap()[0].verified);
    }

    #[test]
    fn validation_happens_before_branch_creation() {
        let f = fixture(false);
        assert!(matches!(
            f.store.append("alice", "   "),
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            f.store.append("../evil", "x"),
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            f.store.append("alice", &"x".repeat(2000)),
            Err(StoreError::Validation(_))
        ));
        assert!(f.store.known_authors().unwrap().is_empty());
    }

    #[test]
    fn point_lookups() {
        let f = fixture(false);
        let m = f.store.append("carol", "ping").unwrap();
        assert_eq!(f.store.get_by_file("carol", &m.file_name()).unwrap(), m);
        assert_eq!(f.store.get_by_id(m.id.as_str()).unwrap(), m);
        assert!(f.store.get_by_file("carol", "nope.txt").unwrap_err().is_not_found());
        assert!(f.store.get_by_file("dave", &m.file_name()).unwrap_err().is_not_found());
        assert!(f.store.get_by_file("carol", "../../etc/passwd").unwrap_err().is_not_found());
    }

    #[test]
    fn directory_and_history_track_appends() {
        let f = fixture(false);
        f.store.append("erin", "one").unwrap();
        f.clock.advance(Duration::from_secs(1));
        f.store.append("erin", "two").unwrap();
        let authors = f.store.authors().unwrap();
        assert_eq!(authors.len(), 1);
        assert_eq!(authors[0].branch.author(), "erin");
        assert_eq!(authors[0].message_count, 2);
        assert_eq!(authors[0].archived_count, 0);
        assert!(authors[0].last_active.is_some());

        let history = f.store.history("erin", 10).unwrap();
        assert!(history[0].summary.starts_with("message: add "));
        assert!(history[0].summary.ends_with(" from erin"));
        assert_eq!(history[0].author, "erin");
    }

    #[test]
    fn hot_entries_report_sizes() {
        let f = fixture(false);
        f.store.append("finn", "abc").unwrap();
        let branch = BranchRef::for_author("finn").unwrap();
        let entries = f.store.hot_entries(&branch).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].size > 3);
    }
}
