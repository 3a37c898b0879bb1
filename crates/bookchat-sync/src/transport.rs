use bookchat_storage::{IntegrateOutcome, RepositoryDriver, RepositoryError};

/// Network-facing operations the coordinator needs, per branch.
pub trait RemoteTransport: Send + Sync {
    /// Downloads the remote branch into its remote-tracking ref.
    fn fetch(&self, branch: &str) -> Result<(), RepositoryError>;

    /// Applies a fetched branch to the local branch (local step only).
    fn integrate(&self, branch: &str) -> Result<IntegrateOutcome, RepositoryError>;

    fn push(&self, branch: &str) -> Result<(), RepositoryError>;

    fn list_remote_branches(&self, prefix: &str) -> Result<Vec<String>, RepositoryError>;
}

impl RemoteTransport for RepositoryDriver {
    fn fetch(&self, branch: &str) -> Result<(), RepositoryError> {
        Self::fetch(self, branch)
    }

    fn integrate(&self, branch: &str) -> Result<IntegrateOutcome, RepositoryError> {
        Self::integrate(self, branch)
    }

    fn push(&self, branch: &str) -> Result<(), RepositoryError> {
        Self::push(self, branch)
    }

    fn list_remote_branches(&self, prefix: &str) -> Result<Vec<String>, RepositoryError> {
        Self::list_remote_branches(self, prefix)
    }
}
