//! Session configuration and the in-memory session record.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use autoship_common::{
    BackingMode, ErrorKind, ExecutionMode, RepoRef, SessionId, SessionSnapshot, SessionState,
    TestOutcome,
};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::patch::PatchDescription;
use super::progress::ProgressStream;
use crate::errors::SessionError;

pub const DEFAULT_TEST_TIMEOUT_SECS: u64 = 300;

/// What the caller supplies to start a session.
///
/// Credentials live here only until the session's run task takes them;
/// they are dropped when the run ends.
pub struct SessionConfig {
    pub repository: RepoRef,
    pub instruction: String,
    pub hosting_credential: SecretString,
    pub generation_credential: SecretString,
    pub execution_mode: ExecutionMode,
    pub test_timeout_secs: u64,
    /// Branch name hint; defaults to the instruction.
    pub branch_hint: Option<String>,
    /// Commit subject; defaults to one derived from the instruction.
    pub commit_message: Option<String>,
    /// Snapshot a local directory instead of cloning the repository.
    pub source_dir: Option<PathBuf>,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("repository", &self.repository.full_name())
            .field("instruction", &self.instruction)
            .field("execution_mode", &self.execution_mode)
            .field("test_timeout_secs", &self.test_timeout_secs)
            .field("branch_hint", &self.branch_hint)
            .field("source_dir", &self.source_dir)
            .finish_non_exhaustive()
    }
}

impl SessionConfig {
    pub fn new(
        repository: RepoRef,
        instruction: impl Into<String>,
        hosting_credential: SecretString,
        generation_credential: SecretString,
    ) -> Self {
        Self {
            repository,
            instruction: instruction.into(),
            hosting_credential,
            generation_credential,
            execution_mode: ExecutionMode::default(),
            test_timeout_secs: DEFAULT_TEST_TIMEOUT_SECS,
            branch_hint: None,
            commit_message: None,
            source_dir: None,
        }
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn with_test_timeout_secs(mut self, secs: u64) -> Self {
        self.test_timeout_secs = secs;
        self
    }

    pub fn with_branch_hint(mut self, hint: impl Into<String>) -> Self {
        self.branch_hint = Some(hint.into());
        self
    }

    pub fn with_commit_message(mut self, message: impl Into<String>) -> Self {
        self.commit_message = Some(message.into());
        self
    }

    pub fn with_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_dir = Some(dir.into());
        self
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.instruction.trim().is_empty() {
            return Err(SessionError::InvalidConfig("instruction is empty".into()));
        }
        if self.hosting_credential.expose_secret().trim().is_empty() {
            return Err(SessionError::InvalidConfig("hosting credential is empty".into()));
        }
        if self.generation_credential.expose_secret().trim().is_empty() {
            return Err(SessionError::InvalidConfig(
                "generation credential is empty".into(),
            ));
        }
        if self.test_timeout_secs == 0 {
            return Err(SessionError::InvalidConfig(
                "test timeout must be at least one second".into(),
            ));
        }
        if let Some(dir) = &self.source_dir
            && !dir.is_dir()
        {
            return Err(SessionError::InvalidConfig(format!(
                "source directory {} does not exist",
                dir.display()
            )));
        }
        Ok(())
    }
}

/// The secrets a run needs. Taken exactly once.
pub(crate) struct Credentials {
    pub hosting: SecretString,
    pub generation: SecretString,
}

/// Per-run options split off the config.
#[derive(Debug, Clone)]
pub(crate) struct RunOptions {
    pub execution_mode: ExecutionMode,
    pub test_timeout_secs: u64,
    pub branch_hint: String,
    pub commit_message: Option<String>,
    pub source_dir: Option<PathBuf>,
}

/// Mutable outcome fields, filled in as stages complete.
#[derive(Debug, Default)]
pub(crate) struct SessionStatus {
    pub backing: Option<BackingMode>,
    pub changed_files: Vec<String>,
    pub patch: Option<PatchDescription>,
    pub test_outcome: Option<TestOutcome>,
    pub branch_name: Option<String>,
    pub commit_ref: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
}

/// One registered session.
pub struct Session {
    id: SessionId,
    repository: RepoRef,
    instruction: String,
    created_at: DateTime<Utc>,
    pub(crate) options: RunOptions,
    progress: Arc<ProgressStream>,
    cancel: CancellationToken,
    status: Mutex<SessionStatus>,
    credentials: Mutex<Option<Credentials>>,
    done: watch::Sender<bool>,
}

impl Session {
    pub(crate) fn new(config: SessionConfig) -> Self {
        let id = SessionId::new();
        let (done, _) = watch::channel(false);
        let branch_hint = config
            .branch_hint
            .unwrap_or_else(|| config.instruction.clone());
        Self {
            id,
            repository: config.repository,
            instruction: config.instruction,
            created_at: Utc::now(),
            options: RunOptions {
                execution_mode: config.execution_mode,
                test_timeout_secs: config.test_timeout_secs,
                branch_hint,
                commit_message: config.commit_message,
                source_dir: config.source_dir,
            },
            progress: ProgressStream::new(id),
            cancel: CancellationToken::new(),
            status: Mutex::new(SessionStatus::default()),
            credentials: Mutex::new(Some(Credentials {
                hosting: config.hosting_credential,
                generation: config.generation_credential,
            })),
            done,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn repository(&self) -> &RepoRef {
        &self.repository
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn progress(&self) -> &Arc<ProgressStream> {
        &self.progress
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    pub(crate) fn status(&self) -> MutexGuard<'_, SessionStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand the credentials to the run. A second call gets `None`, which
    /// is what keeps a session from executing twice.
    pub(crate) fn take_credentials(&self) -> Option<Credentials> {
        self.credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn mark_done(&self) {
        self.done.send_replace(true);
    }

    /// Resolve once the session has reached a terminal state.
    pub async fn finished(&self) {
        let mut rx = self.done.subscribe();
        // The sender lives in `self`, so this cannot fail while we borrow it.
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state: SessionState = self.progress.state();
        let status = self.status();
        SessionSnapshot {
            id: self.id,
            repository: self.repository.clone(),
            instruction: self.instruction.clone(),
            state,
            backing: status.backing,
            changed_files: status.changed_files.clone(),
            test_outcome: status.test_outcome.clone(),
            branch_name: status.branch_name.clone(),
            commit_ref: status.commit_ref.clone(),
            error_kind: status.error_kind,
            error: status.error.clone(),
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig::new(
            RepoRef::new("octo", "widgets"),
            "rename function foo to bar",
            SecretString::from("ghp_hosting".to_string()),
            SecretString::from("sk-generation".to_string()),
        )
    }

    #[test]
    fn test_defaults() {
        let config = config();
        assert_eq!(config.execution_mode, ExecutionMode::Auto);
        assert_eq!(config.test_timeout_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let mut c = config();
        c.instruction = "   ".into();
        assert!(matches!(c.validate(), Err(SessionError::InvalidConfig(_))));

        let mut c = config();
        c.hosting_credential = SecretString::from(String::new());
        assert!(c.validate().is_err());

        let mut c = config();
        c.generation_credential = SecretString::from(String::new());
        assert!(c.validate().is_err());

        assert!(config().with_test_timeout_secs(0).validate().is_err());
        assert!(
            config()
                .with_source_dir("/definitely/not/here")
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_debug_never_prints_credentials() {
        let rendered = format!("{:?}", config());
        assert!(!rendered.contains("ghp_hosting"));
        assert!(!rendered.contains("sk-generation"));
    }

    #[test]
    fn test_credentials_taken_once() {
        let session = Session::new(config());
        let creds = session.take_credentials().unwrap();
        assert_eq!(creds.hosting.expose_secret(), "ghp_hosting");
        assert!(session.take_credentials().is_none());
    }

    #[test]
    fn test_branch_hint_defaults_to_instruction() {
        let session = Session::new(config());
        assert_eq!(session.options.branch_hint, "rename function foo to bar");
        let session = Session::new(config().with_branch_hint("rename"));
        assert_eq!(session.options.branch_hint, "rename");
    }

    #[tokio::test]
    async fn test_snapshot_and_finished() {
        let session = Arc::new(Session::new(config()));
        session.progress().created("created");
        let snap = session.snapshot();
        assert_eq!(snap.state, SessionState::Created);
        assert_eq!(snap.repository.full_name(), "octo/widgets");
        assert!(!session.is_finished());

        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.finished().await })
        };
        session.mark_done();
        waiter.await.unwrap();
        assert!(session.is_finished());
    }
}
