//! Hosting-service capability: list repositories, push a change set as a
//! new branch.

use async_trait::async_trait;
use autoship_common::RepoRef;
use secrecy::SecretString;

use super::patch::AppliedChangeSet;
use crate::errors::HostingError;

/// Everything the workflow needs from a code host.
#[async_trait]
pub trait HostingService: Send + Sync {
    /// Repositories the credential can see, forks excluded.
    async fn list_repositories(&self, credential: &SecretString) -> Result<Vec<RepoRef>, HostingError>;

    /// Commit `changes` on top of the repository's default branch and
    /// publish the commit as `branch`. Returns the commit reference.
    async fn push(
        &self,
        credential: &SecretString,
        repo: &RepoRef,
        branch: &str,
        changes: &AppliedChangeSet,
        message: &str,
    ) -> Result<String, HostingError>;
}
