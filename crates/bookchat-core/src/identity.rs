//! Author identity and the author → branch mapping.
//!
//! Every path and ref an author touches is derived here from a validated
//! author name, so call sites never concatenate branch or directory strings.

use crate::error::{Result, ValidationError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Prefix shared by every author branch.
pub const BRANCH_PREFIX: &str = "user/";
/// Hot message directory root inside an author branch.
pub const MESSAGES_ROOT: &str = "messages";
/// Archive tier root inside an author branch.
pub const ARCHIVE_ROOT: &str = "archive";
/// Published public key histories.
pub const KEYS_ROOT: &str = "keys";
/// Message file extension.
pub const MESSAGE_EXT: &str = "txt";

fn author_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("valid regex"))
}

/// Validates an author name (ASCII alphanumerics, `-`, `_`; 1..=64 chars).
///
/// # Errors
/// Returns [`ValidationError::InvalidAuthor`] for anything else.
pub fn validate_author(author: &str) -> Result<()> {
    if author_re().is_match(author) {
        Ok(())
    } else {
        Err(ValidationError::InvalidAuthor(author.to_string()))
    }
}

#[must_use]
pub fn is_valid_author(author: &str) -> bool {
    author_re().is_match(author)
}

/// Pure mapping from author to branch name: `user/<author>`.
#[must_use]
pub fn branch_name_for(author: &str) -> String {
    format!("{BRANCH_PREFIX}{author}")
}

/// A validated reference to one author's branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchRef {
    author: String,
}

impl BranchRef {
    /// Builds the branch reference for `author`.
    ///
    /// # Errors
    /// Returns [`ValidationError::InvalidAuthor`] if the author name is invalid.
    pub fn for_author(author: &str) -> Result<Self> {
        validate_author(author)?;
        Ok(Self {
            author: author.to_string(),
        })
    }

    /// Parses a branch name (`user/<author>`), short or as a full local ref.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let short = name.strip_prefix("refs/heads/").unwrap_or(name);
        let author = short.strip_prefix(BRANCH_PREFIX)?;
        Self::for_author(author).ok()
    }

    #[must_use]
    pub fn author(&self) -> &str {
        &self.author
    }

    /// Short branch name.
    #[must_use]
    pub fn name(&self) -> String {
        branch_name_for(&self.author)
    }

    #[must_use]
    pub fn local_ref(&self) -> String {
        format!("refs/heads/{}", self.name())
    }

    /// Remote-tracking ref for this branch under `remote`.
    #[must_use]
    pub fn remote_ref(&self, remote: &str) -> String {
        format!("refs/remotes/{remote}/{}", self.name())
    }

    #[must_use]
    pub fn messages_dir(&self) -> String {
        format!("{MESSAGES_ROOT}/{}", self.author)
    }

    #[must_use]
    pub fn archive_dir(&self) -> String {
        format!("{ARCHIVE_ROOT}/{}", self.author)
    }

    #[must_use]
    pub fn keys_path(&self) -> String {
        format!("{KEYS_ROOT}/{}.json", self.author)
    }

    /// Repo-relative path of a hot message file.
    #[must_use]
    pub fn message_path(&self, file_name: &str) -> String {
        format!("{}/{file_name}", self.messages_dir())
    }

    /// Repo-relative path of an archived message file.
    #[must_use]
    pub fn archive_path(&self, file_name: &str) -> String {
        format!("{}/{file_name}", self.archive_dir())
    }
}

impl fmt::Display for BranchRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{BRANCH_PREFIX}{}", self.author)
    }
}

impl TryFrom<String> for BranchRef {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value).ok_or(ValidationError::InvalidAuthor(value))
    }
}

impl From<BranchRef> for String {
    fn from(value: BranchRef) -> Self {
        value.name()
    }
}
