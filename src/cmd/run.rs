//! Session execution (`autoship run`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use autoship_common::{ExecutionMode, RepoRef, SessionState};
use console::style;
use dialoguer::{Select, theme::ColorfulTheme};
use futures::StreamExt;
use secrecy::SecretString;

use autoship::config::AppConfig;
use autoship::ui::{SessionUI, UiMode};
use autoship::workflow::{
    DockerSandbox, GitHubHosting, HostingService, LocalSandbox, OpenAiProvider,
    OrchestratorSettings, SandboxBackend, SandboxExecutor, SessionConfig, WorkflowOrchestrator,
};

use super::{GENERATION_KEY_ENV, HOSTING_TOKEN_ENV, read_secret};

pub struct RunArgs {
    pub repo: Option<String>,
    pub instruction: String,
    pub mode: Option<ExecutionMode>,
    pub test_timeout: Option<u64>,
    pub branch_hint: Option<String>,
    pub source: Option<PathBuf>,
    pub json: bool,
}

/// Remote backend when the mode allows it and a Docker client can be built.
fn build_executor(config: &AppConfig, mode: ExecutionMode) -> SandboxExecutor {
    let local: Arc<dyn SandboxBackend> = Arc::new(LocalSandbox::new());
    let remote: Option<Arc<dyn SandboxBackend>> = match mode {
        ExecutionMode::LocalOnly => None,
        _ => match DockerSandbox::connect(config.sandbox.clone()) {
            Ok(docker) => Some(Arc::new(docker)),
            Err(e) => {
                tracing::warn!("{}", e);
                None
            }
        },
    };
    SandboxExecutor::new(remote, local)
}

/// Resolve `--repo`, or let the user pick one interactively.
async fn resolve_repo(
    hosting: &GitHubHosting,
    token: &SecretString,
    requested: Option<&str>,
) -> Result<RepoRef> {
    match requested {
        Some(input) => {
            let parsed = RepoRef::parse(input)?;
            // The listing carries the real default branch.
            match hosting.list_repositories(token).await {
                Ok(repos) => Ok(repos
                    .into_iter()
                    .find(|r| r.full_name().eq_ignore_ascii_case(&parsed.full_name()))
                    .unwrap_or(parsed)),
                Err(e) => {
                    tracing::warn!("could not look up {}: {}", parsed, e);
                    Ok(parsed)
                }
            }
        }
        None => {
            let repos = hosting
                .list_repositories(token)
                .await
                .context("Failed to list repositories")?;
            if repos.is_empty() {
                anyhow::bail!("No repositories available for this token; pass --repo");
            }
            let items: Vec<String> = repos
                .iter()
                .map(|r| match &r.description {
                    Some(d) if !d.is_empty() => format!("{} - {}", r.full_name(), d),
                    _ => r.full_name(),
                })
                .collect();
            let selection = Select::with_theme(&ColorfulTheme::default())
                .with_prompt("Repository")
                .items(&items)
                .default(0)
                .interact()
                .context("Repository selection aborted")?;
            repos
                .into_iter()
                .nth(selection)
                .context("Selected repository is out of range")
        }
    }
}

pub async fn cmd_run(config: &AppConfig, args: RunArgs) -> Result<()> {
    let hosting_token = read_secret(HOSTING_TOKEN_ENV)?;
    let generation_key = read_secret(GENERATION_KEY_ENV)?;
    let mode = args.mode.unwrap_or(config.session.default_execution_mode);

    let hosting = Arc::new(GitHubHosting::new(&config.hosting));
    let repo = resolve_repo(&hosting, &hosting_token, args.repo.as_deref()).await?;

    let orchestrator = WorkflowOrchestrator::new(
        build_executor(config, mode),
        Arc::new(OpenAiProvider::new(&config.provider)),
        hosting as Arc<dyn HostingService>,
        OrchestratorSettings::from_config(config),
    );

    let mut session = SessionConfig::new(repo, args.instruction, hosting_token, generation_key)
        .with_execution_mode(mode)
        .with_test_timeout_secs(args.test_timeout.unwrap_or(config.session.default_test_timeout_secs));
    if let Some(hint) = args.branch_hint {
        session = session.with_branch_hint(hint);
    }
    if let Some(dir) = args.source {
        session = session.with_source_dir(dir);
    }

    let id = orchestrator.create_session(session)?;
    let ui = SessionUI::new(if args.json { UiMode::Json } else { UiMode::Full });
    let mut events = orchestrator.stream_progress(id)?;
    let mut cancelled = false;
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => ui.show_event(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancelled => {
                eprintln!("{}", style("Cancelling...").yellow());
                orchestrator.cancel(id)?;
                cancelled = true;
            }
        }
    }

    let snapshot = orchestrator.wait(id).await?;
    ui.finish(&snapshot);
    if snapshot.state == SessionState::Succeeded {
        return Ok(());
    }
    match snapshot.error_kind {
        Some(kind) if kind.is_soft() => {
            anyhow::bail!("Session {}: the change did not pass the repository's tests", snapshot.id)
        }
        Some(kind) => anyhow::bail!("Session {} failed ({})", snapshot.id, kind),
        None => anyhow::bail!("Session {} did not complete", snapshot.id),
    }
}
