//! Deployment: name a branch and push the applied changes through the
//! hosting service.

use std::sync::Arc;
use std::time::Duration;

use autoship_common::RepoRef;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use super::hosting::HostingService;
use super::patch::AppliedChangeSet;
use crate::errors::HostingError;
use crate::util::slugify;

const BRANCH_PREFIX: &str = "auto";
const MAX_HINT_LEN: usize = 30;
const SUFFIX_LEN: usize = 8;
const FALLBACK_HINT: &str = "change";
const MAX_SUBJECT_LEN: usize = 72;

/// Where the change landed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub branch_name: String,
    pub commit_ref: String,
}

/// `auto-<slug>-<8 hex>`; the random suffix keeps concurrent sessions with
/// the same hint from colliding.
pub fn branch_name(hint: &str) -> String {
    let slug = slugify(hint, MAX_HINT_LEN);
    let slug = if slug.is_empty() { FALLBACK_HINT } else { slug.as_str() };
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", BRANCH_PREFIX, slug, &suffix[..SUFFIX_LEN])
}

/// Single-line commit subject for an instruction.
pub fn commit_message(instruction: &str) -> String {
    let first_line = instruction.lines().next().unwrap_or_default().trim();
    let subject = format!("autoship: {}", first_line);
    if subject.chars().count() <= MAX_SUBJECT_LEN {
        subject
    } else {
        let cut: String = subject.chars().take(MAX_SUBJECT_LEN - 3).collect();
        format!("{}...", cut.trim_end())
    }
}

pub struct DeploymentPublisher {
    hosting: Arc<dyn HostingService>,
    retry_delay: Duration,
}

impl DeploymentPublisher {
    pub fn new(hosting: Arc<dyn HostingService>) -> Self {
        Self {
            hosting,
            retry_delay: Duration::from_secs(2),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Push `changes` as a fresh branch. A transient network failure gets
    /// exactly one retry; auth and conflict errors are returned at once.
    pub async fn publish(
        &self,
        credential: &SecretString,
        repo: &RepoRef,
        changes: &AppliedChangeSet,
        hint: &str,
        message: &str,
    ) -> Result<Deployment, HostingError> {
        let branch = branch_name(hint);
        let commit_ref = match self.hosting.push(credential, repo, &branch, changes, message).await {
            Ok(commit) => commit,
            Err(e) if e.is_transient() => {
                tracing::warn!(branch = %branch, "push failed ({}); retrying once", e);
                tokio::time::sleep(self.retry_delay).await;
                self.hosting
                    .push(credential, repo, &branch, changes, message)
                    .await?
            }
            Err(e) => return Err(e),
        };
        Ok(Deployment {
            branch_name: branch,
            commit_ref,
        })
    }
}
