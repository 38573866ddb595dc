//! Session registry and the per-session pipeline.
//!
//! Each session runs on its own task:
//!
//! ```text
//! Created ─acquire─▶ Analyzing ─analyze─▶ Generating ─generate─▶ Applying
//!    ─apply─▶ Testing ─test─▶ Deploying ─publish─▶ Succeeded
//! ```
//!
//! Any stage error, a panic inside a stage, or a cancel request ends the
//! session in `Failed`. The workspace is released before the terminal
//! event is emitted, whatever the outcome.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use autoship_common::{
    ErrorKind, PROVISIONING_PHASE, ProgressEvent, RepoRef, SessionId, SessionSnapshot,
    SessionState, TestOutcome,
};
use dashmap::DashMap;
use futures::FutureExt;
use futures::stream::BoxStream;
use secrecy::{ExposeSecret, SecretString};
use tracing::Instrument;

use super::analysis::{self, ContextLimits};
use super::deploy::{self, DeploymentPublisher};
use super::hosting::HostingService;
use super::patch::{self, PatchDescription};
use super::provider::GenerationProvider;
use super::sandbox::{RepositorySnapshot, SandboxExecutor, Workspace};
use super::session::{Credentials, Session, SessionConfig};
use super::testrun;
use crate::config::AppConfig;
use crate::errors::{HostingError, SessionError, WorkflowError};
use crate::util::sanitize;

/// How long `shutdown` waits for each cancelled session to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Timeouts and limits applied to every session.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub retention: Duration,
    pub provision_timeout: Duration,
    pub analysis_timeout: Duration,
    pub generation_timeout: Duration,
    pub publish_timeout: Duration,
    pub context: ContextLimits,
    pub publish_retry_delay: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let s = &config.session;
        Self {
            retention: s.retention(),
            provision_timeout: Duration::from_secs(s.provision_timeout_secs),
            analysis_timeout: Duration::from_secs(s.analysis_timeout_secs),
            generation_timeout: Duration::from_secs(s.generation_timeout_secs),
            publish_timeout: Duration::from_secs(s.publish_timeout_secs),
            context: ContextLimits::from(&config.provider),
            publish_retry_delay: Duration::from_secs(2),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Capabilities shared by every session's run task.
struct Pipeline {
    executor: SandboxExecutor,
    provider: Arc<dyn GenerationProvider>,
    hosting: Arc<dyn HostingService>,
    publisher: DeploymentPublisher,
    settings: OrchestratorSettings,
}

type Registry = Arc<DashMap<SessionId, Arc<Session>>>;

/// Owns every session for its lifetime.
pub struct WorkflowOrchestrator {
    sessions: Registry,
    pipeline: Arc<Pipeline>,
}

impl WorkflowOrchestrator {
    pub fn new(
        executor: SandboxExecutor,
        provider: Arc<dyn GenerationProvider>,
        hosting: Arc<dyn HostingService>,
        settings: OrchestratorSettings,
    ) -> Self {
        let publisher = DeploymentPublisher::new(Arc::clone(&hosting))
            .with_retry_delay(settings.publish_retry_delay);
        Self {
            sessions: Arc::new(DashMap::new()),
            pipeline: Arc::new(Pipeline {
                executor,
                provider,
                hosting,
                publisher,
                settings,
            }),
        }
    }

    /// Register a session and start its pipeline. The `Created` event is
    /// buffered before this returns. Must be called inside a Tokio runtime.
    pub fn create_session(&self, config: SessionConfig) -> Result<SessionId, SessionError> {
        config.validate()?;
        let session = Arc::new(Session::new(config));
        let id = session.id();
        session.progress().created(&format!(
            "Session created for {}: {}",
            session.repository().full_name(),
            session.instruction().lines().next().unwrap_or_default()
        ));
        self.sessions.insert(id, Arc::clone(&session));

        let pipeline = Arc::clone(&self.pipeline);
        let sessions = Arc::clone(&self.sessions);
        let span = tracing::info_span!("session", session_id = %id, repo = %session.repository());
        tokio::spawn(
            async move {
                pipeline.run(&session).await;
                let retention = pipeline.settings.retention;
                tokio::time::sleep(retention).await;
                if sessions
                    .remove_if(&id, |_, registered| Arc::ptr_eq(registered, &session))
                    .is_some()
                {
                    tracing::debug!("retention elapsed; session removed");
                }
            }
            .instrument(span),
        );
        Ok(id)
    }

    fn get(&self, id: SessionId) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(SessionError::NotFound { id })
    }

    /// Ask a running session to stop. A finished session is left alone.
    pub fn cancel(&self, id: SessionId) -> Result<(), SessionError> {
        let session = self.get(id)?;
        if !session.is_finished() {
            tracing::info!(session_id = %id, "cancellation requested");
            session.cancel_token().cancel();
        }
        Ok(())
    }

    /// Cancel if running and drop the session from the registry now.
    pub fn discard(&self, id: SessionId) -> Result<(), SessionError> {
        let (_, session) = self
            .sessions
            .remove(&id)
            .ok_or(SessionError::NotFound { id })?;
        session.cancel_token().cancel();
        tracing::info!(session_id = %id, "session discarded");
        Ok(())
    }

    pub fn snapshot(&self, id: SessionId) -> Result<SessionSnapshot, SessionError> {
        Ok(self.get(id)?.snapshot())
    }

    /// Snapshots of every registered session, oldest first.
    pub fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let mut all: Vec<SessionSnapshot> = self
            .sessions
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        all.sort_by_key(|s| s.created_at);
        all
    }

    /// The patch the provider produced, once generation has completed.
    pub fn generated_patch(&self, id: SessionId) -> Result<Option<PatchDescription>, SessionError> {
        let session = self.get(id)?;
        let patch = session.status().patch.clone();
        Ok(patch)
    }

    /// Buffered events, then live ones, closing after the terminal event.
    pub fn stream_progress(
        &self,
        id: SessionId,
    ) -> Result<BoxStream<'static, ProgressEvent>, SessionError> {
        Ok(self.get(id)?.progress().subscribe())
    }

    /// Resolve with the final snapshot once the session is terminal.
    pub async fn wait(&self, id: SessionId) -> Result<SessionSnapshot, SessionError> {
        let session = self.get(id)?;
        session.finished().await;
        Ok(session.snapshot())
    }

    pub async fn list_repositories(
        &self,
        credential: &SecretString,
    ) -> Result<Vec<RepoRef>, HostingError> {
        self.pipeline.hosting.list_repositories(credential).await
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| !entry.value().is_finished())
            .count()
    }

    /// Cancel every in-flight session and wait for each to release its
    /// workspace.
    pub async fn shutdown(&self) {
        let running: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| !entry.value().is_finished())
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in &running {
            tracing::info!(session_id = %session.id(), "shutting down session");
            session.cancel_token().cancel();
        }
        for session in running {
            if tokio::time::timeout(SHUTDOWN_GRACE, session.finished())
                .await
                .is_err()
            {
                tracing::warn!(session_id = %session.id(), "session did not stop within the grace period");
            }
        }
    }
}

impl Pipeline {
    async fn run(&self, session: &Session) {
        let Some(creds) = session.take_credentials() else {
            tracing::error!("session already executed; refusing to run it again");
            return;
        };
        let progress = session.progress();
        let mut slot: Option<Workspace> = None;

        let outcome = tokio::select! {
            biased;
            _ = session.cancel_token().cancelled() => Err(WorkflowError::Cancelled),
            result = AssertUnwindSafe(self.stages(session, &creds, &mut slot)).catch_unwind() => {
                match result {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        let state = progress.state();
                        tracing::error!(state = %state, "stage panicked");
                        Err(interrupted(state))
                    }
                }
            }
        };

        if let Some(workspace) = slot.take() {
            workspace.release().await;
        }

        match outcome {
            Ok(()) => {
                let message = {
                    let status = session.status();
                    format!(
                        "Pushed commit {} to branch {}",
                        status.commit_ref.as_deref().map(short_ref).unwrap_or_default(),
                        status.branch_name.as_deref().unwrap_or_default()
                    )
                };
                progress.transition(SessionState::Succeeded, &message);
            }
            Err(err) => {
                let kind = err.kind();
                let message = sanitize(
                    &failure_message(&err),
                    &[creds.hosting.expose_secret(), creds.generation.expose_secret()],
                );
                {
                    let mut status = session.status();
                    status.error_kind = Some(kind);
                    status.error = Some(message.clone());
                }
                if kind == ErrorKind::TestFailure {
                    tracing::warn!("{}", message);
                } else {
                    tracing::error!(kind = %kind, "{}", message);
                }
                progress.fail(kind, &message);
            }
        }
        drop(creds);
        session.mark_done();
    }

    async fn stages(
        &self,
        session: &Session,
        creds: &Credentials,
        slot: &mut Option<Workspace>,
    ) -> Result<(), WorkflowError> {
        let progress = session.progress();
        let options = &session.options;
        let settings = &self.settings;
        let repo = session.repository();

        // Created → Analyzing
        let snapshot = match &options.source_dir {
            Some(dir) => RepositorySnapshot::Directory(dir.clone()),
            None => RepositorySnapshot::git(&repo.clone_url, &repo.default_branch, Some(&creds.hosting)),
        };
        let acquired = self
            .executor
            .acquire(&snapshot, options.execution_mode, settings.provision_timeout)
            .await
            .map_err(|e| WorkflowError::from_sandbox("Provisioning", e, WorkflowError::Provision))?;
        if let Some(reason) = &acquired.fallback_reason {
            progress.note(
                PROVISIONING_PHASE,
                &sanitize(
                    &format!("Remote sandbox unavailable, using local workspace ({})", reason),
                    &[creds.hosting.expose_secret()],
                ),
            );
        }
        let workspace = slot.insert(acquired.workspace);
        session.status().backing = Some(workspace.mode());
        tracing::info!(backing = %workspace.mode(), "workspace acquired");
        progress.transition(
            SessionState::Analyzing,
            &format!("Workspace ready ({}); analyzing repository", workspace.mode()),
        );

        // Analyzing → Generating
        let summary = analysis::analyze(workspace, settings.context, settings.analysis_timeout)
            .await
            .map_err(|e| WorkflowError::from_sandbox("Analysis", e, WorkflowError::Analysis))?;
        progress.transition(
            SessionState::Generating,
            &format!(
                "Analyzed {} files ({} code, {}); requesting changes",
                summary.total_files,
                summary.code_files,
                if summary.languages.is_empty() {
                    "no known languages".to_string()
                } else {
                    summary.languages.join(", ")
                }
            ),
        );

        // Generating → Applying
        let patch = tokio::time::timeout(
            settings.generation_timeout,
            self.provider
                .generate(&summary, session.instruction(), &creds.generation),
        )
        .await
        .map_err(|_| WorkflowError::Timeout {
            stage: "Generation",
            secs: settings.generation_timeout.as_secs(),
        })??;
        session.status().patch = Some(patch.clone());
        progress.transition(
            SessionState::Applying,
            &format!("Received changes for {} file(s)", patch.len()),
        );

        // Applying → Testing
        let applied = patch::apply(workspace, &patch).await?;
        session.status().changed_files = applied.paths();
        progress.transition(
            SessionState::Testing,
            &format!("Applied {} change(s); looking for tests", applied.len()),
        );

        // Testing → Deploying
        let test_timeout = Duration::from_secs(options.test_timeout_secs);
        let command = testrun::detect(workspace)
            .await
            .map_err(|e| WorkflowError::from_sandbox("Testing", e, WorkflowError::Io))?;
        let outcome = match command {
            Some(command) => {
                progress.note("tests", &format!("Running `{}`", command.command));
                let result = testrun::execute(workspace, &command, test_timeout)
                    .await
                    .map_err(|e| WorkflowError::from_sandbox("Testing", e, WorkflowError::Io))?;
                TestOutcome::Ran(result)
            }
            None => TestOutcome::Skipped,
        };
        session.status().test_outcome = Some(outcome.clone());
        let message = match &outcome {
            TestOutcome::Skipped => "No test configuration found; tests skipped. Publishing".to_string(),
            TestOutcome::Ran(result) if result.passed => {
                format!("Tests passed ({}); publishing", result.summary)
            }
            TestOutcome::Ran(result) => {
                return Err(WorkflowError::TestFailure {
                    summary: result.summary.clone(),
                });
            }
        };
        progress.transition(SessionState::Deploying, &message);

        // Deploying → (Succeeded after release)
        let commit_message = options
            .commit_message
            .clone()
            .unwrap_or_else(|| deploy::commit_message(session.instruction()));
        let deployment = tokio::time::timeout(
            settings.publish_timeout,
            self.publisher.publish(
                &creds.hosting,
                repo,
                &applied,
                &options.branch_hint,
                &commit_message,
            ),
        )
        .await
        .map_err(|_| WorkflowError::Timeout {
            stage: "Publishing",
            secs: settings.publish_timeout.as_secs(),
        })??;
        tracing::info!(branch = %deployment.branch_name, commit = %deployment.commit_ref, "published");
        {
            let mut status = session.status();
            status.branch_name = Some(deployment.branch_name);
            status.commit_ref = Some(deployment.commit_ref);
        }
        Ok(())
    }
}

/// Error for a stage that panicked, attributed to the stage it was in.
fn interrupted(state: SessionState) -> WorkflowError {
    let message = format!("internal error during {}", state.as_str());
    match state {
        SessionState::Created => WorkflowError::Provision(message),
        SessionState::Analyzing => WorkflowError::Analysis(message),
        SessionState::Generating => WorkflowError::Generation(message),
        SessionState::Deploying => WorkflowError::Network(message),
        _ => WorkflowError::Io(message),
    }
}

/// Terminal message. Test failures read differently from pipeline errors.
fn failure_message(err: &WorkflowError) -> String {
    match err {
        WorkflowError::TestFailure { summary } => {
            format!("Tests failed; nothing was deployed: {}", summary)
        }
        WorkflowError::Cancelled => "Session cancelled".to_string(),
        other => format!("Pipeline error: {}", other),
    }
}

fn short_ref(commit: &str) -> &str {
    commit.get(..7).unwrap_or(commit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ProviderError;
    use crate::workflow::analysis::RepositorySummary;
    use crate::workflow::patch::AppliedChangeSet;
    use async_trait::async_trait;

    struct NoProvider;

    #[async_trait]
    impl GenerationProvider for NoProvider {
        async fn generate(
            &self,
            _: &RepositorySummary,
            _: &str,
            _: &SecretString,
        ) -> Result<PatchDescription, ProviderError> {
            Err(ProviderError::RateLimited)
        }
    }

    struct NoHosting;

    #[async_trait]
    impl HostingService for NoHosting {
        async fn list_repositories(&self, _: &SecretString) -> Result<Vec<RepoRef>, HostingError> {
            Ok(vec![RepoRef::new("octo", "widgets")])
        }

        async fn push(
            &self,
            _: &SecretString,
            _: &RepoRef,
            _: &str,
            _: &AppliedChangeSet,
            _: &str,
        ) -> Result<String, HostingError> {
            Err(HostingError::Network("unreachable".into()))
        }
    }

    fn orchestrator() -> WorkflowOrchestrator {
        WorkflowOrchestrator::new(
            SandboxExecutor::local_only(),
            Arc::new(NoProvider),
            Arc::new(NoHosting),
            OrchestratorSettings::default(),
        )
    }

    #[test]
    fn test_interrupted_maps_stage_to_kind() {
        assert_eq!(interrupted(SessionState::Created).kind(), ErrorKind::Provision);
        assert_eq!(interrupted(SessionState::Analyzing).kind(), ErrorKind::Analysis);
        assert_eq!(interrupted(SessionState::Generating).kind(), ErrorKind::Generation);
        assert_eq!(interrupted(SessionState::Applying).kind(), ErrorKind::Io);
        let err = interrupted(SessionState::Testing);
        assert_eq!(err.to_string(), "Workspace I/O failed: internal error during testing");
    }

    #[test]
    fn test_failure_message_distinguishes_tests_from_pipeline() {
        let tests = failure_message(&WorkflowError::TestFailure {
            summary: "1 failed".into(),
        });
        assert!(tests.starts_with("Tests failed"));
        let pipeline = failure_message(&WorkflowError::Io("disk full".into()));
        assert!(pipeline.starts_with("Pipeline error"));
    }

    #[test]
    fn test_short_ref() {
        assert_eq!(short_ref("0123456789abcdef"), "0123456");
        assert_eq!(short_ref("abc"), "abc");
    }

    #[test]
    fn test_settings_from_config() {
        let settings = OrchestratorSettings::from_config(&AppConfig::default());
        assert_eq!(settings.retention, Duration::from_secs(600));
        assert_eq!(settings.context.max_files, 5);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let orch = orchestrator();
        let id = SessionId::new();
        assert!(matches!(orch.cancel(id), Err(SessionError::NotFound { .. })));
        assert!(matches!(orch.discard(id), Err(SessionError::NotFound { .. })));
        assert!(orch.snapshot(id).is_err());
        assert!(orch.stream_progress(id).is_err());
        assert!(orch.wait(id).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_config_never_registers() {
        let orch = orchestrator();
        let config = SessionConfig::new(
            RepoRef::new("octo", "widgets"),
            "",
            SecretString::from("ghp_x".to_string()),
            SecretString::from("sk-x".to_string()),
        );
        assert!(matches!(
            orch.create_session(config),
            Err(SessionError::InvalidConfig(_))
        ));
        assert!(orch.list_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_list_repositories_passthrough() {
        let repos = orchestrator()
            .list_repositories(&SecretString::from("ghp_x".to_string()))
            .await
            .unwrap();
        assert_eq!(repos[0].full_name(), "octo/widgets");
    }
}
