#![forbid(unsafe_code)]
//! Git-backed storage layer for BookChat.
//!
//! Provides:
//! - `RepositoryDriver`: git2 wrapper with a single serialized working-tree
//!   critical section and bounded-timeout network operations
//! - Advisory file locks on the working tree, with stale lock healing
//! - Message file codec (`content`, `-- ` delimiter, header trailer)
//! - `BranchedMessageStore`: one `user/<author>` branch per author, unified
//!   chronological view with per-message signature verification
//! - `PinBoard`: idempotent pins on the main branch
//! - `ArchiveManager`: age/size driven moves into the archive tier

pub mod archive;
pub mod error;
pub mod format;
pub mod lock;
pub mod pins;
pub mod repo;
pub mod store;
#[doc(hidden)]
pub mod testing;

pub use archive::{ArchiveManager, ArchiveReport, select_for_archive};
pub use error::{RepositoryError, RepositoryErrorKind, Result, StoreError, StoreResult};
pub use format::{ParsedMessage, decode_message, encode_message};
pub use lock::{FileLock, HealResult};
pub use pins::{PinBoard, PinOutcome};
pub use repo::{CommitInfo, IntegrateOutcome, RepositoryDriver, TreeFile, WorkTreeSession};
pub use store::{BranchMeta, BranchedMessageStore, HotEntry};
