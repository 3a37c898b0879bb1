//! Key material on disk and the sign/verify operations built on it.
//!
//! Layout under the keys directory (never inside the repository):
//!
//! ```text
//! private/<author>/<fingerprint>.key   hex seed, mode 0600
//! public/<author>.json                 PublicKeyHistory
//! ```

use crate::error::{KeyError, Result};
use crate::record::{PublicKeyHistory, PublicKeyRecord, SignatureToken, fingerprint};
use bookchat_core::{LockLevel, OrderedMutex, SigningConfig, is_valid_author, validate_author};
use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey, Verifier};
use rand::rngs::OsRng;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOutcome {
    Generated { fingerprint: String },
    AlreadyPresent { fingerprint: String },
}

impl KeyOutcome {
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        match self {
            Self::Generated { fingerprint } | Self::AlreadyPresent { fingerprint } => fingerprint,
        }
    }
}

pub struct KeyManager {
    root: PathBuf,
    signing: SigningConfig,
    histories: RwLock<HashMap<String, PublicKeyHistory>>,
    writer: OrderedMutex<()>,
}

impl KeyManager {
    /// Opens (and creates) the key directory.
    ///
    /// # Errors
    /// Returns an I/O error if the directories cannot be created.
    pub fn open(root: impl Into<PathBuf>, signing: SigningConfig) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("private"))?;
        fs::create_dir_all(root.join("public"))?;
        restrict_dir(&root.join("private"))?;
        Ok(Self {
            root,
            signing,
            histories: RwLock::new(HashMap::new()),
            writer: OrderedMutex::new(LockLevel::KeyCache, ()),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub const fn signing_enabled(&self) -> bool {
        self.signing.enabled
    }

    /// Creates a keypair for `author` unless a private key already exists.
    ///
    /// # Errors
    /// Validation, I/O or JSON errors while persisting the key.
    pub fn generate_keypair(&self, author: &str) -> Result<KeyOutcome> {
        validate_author(author)?;
        let _writer = self.writer.lock();
        let history = self.history(author)?;
        if let Some(current) = history.current()
            && self.private_key_path(author, &current.fingerprint).exists()
        {
            return Ok(KeyOutcome::AlreadyPresent {
                fingerprint: current.fingerprint.clone(),
            });
        }
        if !history.keys.is_empty() {
            tracing::warn!(author, "public keys known but no local private key; appending a new key");
        }
        let fingerprint = self.append_new_key(author, history)?;
        tracing::info!(author, %fingerprint, "generated keypair");
        Ok(KeyOutcome::Generated { fingerprint })
    }

    /// Appends a fresh key to `author`'s history. Older keys stay valid for
    /// verifying what they signed.
    ///
    /// # Errors
    /// [`KeyError::NoPrivateKey`] if the author has no local keypair yet.
    pub fn rotate(&self, author: &str) -> Result<String> {
        validate_author(author)?;
        if !self.has_private_key(author) {
            return Err(KeyError::NoPrivateKey(author.to_string()));
        }
        let _writer = self.writer.lock();
        let history = self.history(author)?;
        let fingerprint = self.append_new_key(author, history)?;
        tracing::info!(author, %fingerprint, "rotated keypair");
        Ok(fingerprint)
    }

    /// Signs `payload` with `author`'s current key. Only keys created on this
    /// machine can sign.
    ///
    /// # Errors
    /// [`KeyError::NoPrivateKey`] when no local private key exists for `author`.
    pub fn sign(&self, author: &str, payload: &[u8]) -> Result<String> {
        validate_author(author)?;
        let history = self.history(author)?;
        let current = history
            .current()
            .ok_or_else(|| KeyError::NoPrivateKey(author.to_string()))?;
        let key = self.load_private_key(author, &current.fingerprint)?;
        let signature = key.sign(payload);
        Ok(SignatureToken::new(&current.fingerprint, signature).encode())
    }

    /// Signs when signing is enabled, generating the author's key on first use.
    ///
    /// # Errors
    /// Propagates key generation and signing errors.
    pub fn sign_if_enabled(&self, author: &str, payload: &[u8]) -> Result<Option<String>> {
        if !self.signing.enabled {
            return Ok(None);
        }
        self.generate_keypair(author)?;
        self.sign(author, payload).map(Some)
    }

    /// Checks `token` over `payload` against `author`'s published keys.
    ///
    /// Never fails: a missing key, unknown fingerprint, malformed token or bad
    /// signature all yield `false`.
    #[must_use]
    pub fn verify(&self, payload: &[u8], token: &str, author: &str) -> bool {
        if !is_valid_author(author) {
            return false;
        }
        let Some(token) = SignatureToken::parse(token) else {
            return false;
        };
        let Ok(history) = self.history(author) else {
            return false;
        };
        let candidates: Vec<&PublicKeyRecord> = match &token.fingerprint {
            Some(fp) => history.find(fp).into_iter().collect(),
            None => history.keys.iter().rev().collect(),
        };
        candidates.into_iter().any(|record| {
            record
                .verifying_key()
                .is_ok_and(|key| key.verify(payload, &token.signature).is_ok())
        })
    }

    #[must_use]
    pub fn has_private_key(&self, author: &str) -> bool {
        if !is_valid_author(author) {
            return false;
        }
        self.history(author)
            .ok()
            .and_then(|h| h.current().cloned())
            .is_some_and(|r| self.private_key_path(author, &r.fingerprint).exists())
    }

    /// Public key history for `author` (empty if none is known).
    ///
    /// # Errors
    /// I/O or JSON errors reading a history file that exists.
    pub fn public_keys(&self, author: &str) -> Result<PublicKeyHistory> {
        validate_author(author)?;
        self.history(author)
    }

    /// History to publish on the author's branch, if the author has any keys.
    ///
    /// # Errors
    /// Same as [`public_keys`](Self::public_keys).
    pub fn export_public_history(&self, author: &str) -> Result<Option<PublicKeyHistory>> {
        let history = self.public_keys(author)?;
        Ok((!history.keys.is_empty()).then_some(history))
    }

    /// Merges a history read from a branch into the local one. Returns the
    /// number of records added.
    ///
    /// # Errors
    /// Validation error for a bad author, I/O or JSON errors while persisting.
    pub fn import_public_history(&self, incoming: &PublicKeyHistory) -> Result<usize> {
        validate_author(&incoming.author)?;
        let _writer = self.writer.lock();
        let mut history = self.history(&incoming.author)?;
        let added = history.merge(incoming);
        if added > 0 {
            self.store_history(&history)?;
            tracing::debug!(author = %incoming.author, added, "imported public keys");
        }
        Ok(added)
    }

    /// Authors with a published key history in this key directory.
    ///
    /// # Errors
    /// I/O errors listing the public key directory.
    pub fn known_authors(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(self.root.join("public"))? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && is_valid_author(stem)
            {
                out.push(stem.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    // -- internals ---------------------------------------------------------

    fn append_new_key(&self, author: &str, mut history: PublicKeyHistory) -> Result<String> {
        let key = SigningKey::generate(&mut OsRng);
        let record = PublicKeyRecord::new(&key.verifying_key(), Utc::now());
        let fp = fingerprint(&key.verifying_key());
        self.store_private_key(author, &fp, &key)?;
        history.push(record);
        self.store_history(&history)?;
        Ok(fp)
    }

    fn history(&self, author: &str) -> Result<PublicKeyHistory> {
        {
            let cache = self.histories.read().unwrap_or_else(|e| e.into_inner());
            if let Some(h) = cache.get(author) {
                return Ok(h.clone());
            }
        }
        let path = self.public_path(author);
        let history = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str::<PublicKeyHistory>(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PublicKeyHistory::new(author),
            Err(e) => return Err(e.into()),
        };
        self.histories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(author.to_string(), history.clone());
        Ok(history)
    }

    fn store_history(&self, history: &PublicKeyHistory) -> Result<()> {
        let path = self.public_path(&history.author);
        write_atomic(&path, serde_json::to_string_pretty(history)?.as_bytes())?;
        self.histories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(history.author.clone(), history.clone());
        Ok(())
    }

    fn load_private_key(&self, author: &str, fp: &str) -> Result<SigningKey> {
        let path = self.private_key_path(author, fp);
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KeyError::NoPrivateKey(author.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let bytes = hex::decode(text.trim())
            .map_err(|e| KeyError::Malformed(format!("{}: {e}", path.display())))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KeyError::Malformed(format!("{}: seed must be 32 bytes", path.display())))?;
        Ok(SigningKey::from_bytes(&seed))
    }

    fn store_private_key(&self, author: &str, fp: &str, key: &SigningKey) -> Result<()> {
        let path = self.private_key_path(author, fp);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
            restrict_dir(parent)?;
        }
        write_atomic(&path, hex::encode(key.to_bytes()).as_bytes())?;
        restrict_file(&path)?;
        Ok(())
    }

    fn public_path(&self, author: &str) -> PathBuf {
        self.root.join("public").join(format!("{author}.json"))
    }

    fn private_key_path(&self, author: &str, fp: &str) -> PathBuf {
        self.root
            .join("private")
            .join(author)
            .join(format!("{fp}.key"))
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    restrict_file(&tmp)?;
    fs::rename(&tmp, path)
}

#[cfg(unix)]
fn restrict_file(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(unix)]
fn restrict_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_file(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn restrict_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
