#![forbid(unsafe_code)]
//! Remote synchronization of author branches.
//!
//! - `RetryPolicy`: bounded exponential backoff with optional jitter
//! - `RemoteTransport`: the network seam, implemented by `RepositoryDriver`
//! - `SyncCoordinator`: per-author push, parallel pull with partial success,
//!   per-branch cooldown and stale-branch reporting

pub mod coordinator;
pub mod retry;
pub mod transport;

pub use coordinator::{BranchPull, PullReport, PushOutcome, SyncCoordinator, SyncWarning};
pub use retry::{RetryFailure, RetryPolicy};
pub use transport::RemoteTransport;
