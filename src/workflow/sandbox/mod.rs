//! Isolated workspaces: a uniform file + process capability with two
//! interchangeable backends.
//!
//! ```text
//!   SandboxExecutor::acquire(snapshot, mode)
//!        │
//!        ├── remote (DockerSandbox) ──ok──► Workspace(remote-sandbox)
//!        │        └──err (auto mode)──┐
//!        └── local  (LocalSandbox) ◄──┘──► Workspace(local-fallback)
//! ```
//!
//! A `Workspace` is exclusively owned by one session. `release()` is
//! idempotent and never fails; dropping a live workspace schedules a
//! best-effort teardown so no container or temp directory outlives it.

pub mod docker;
pub mod local;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use autoship_common::{BackingMode, ExecutionMode};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::oneshot;

use crate::errors::SandboxError;

pub use docker::DockerSandbox;
pub use local::LocalSandbox;

const STAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Single-quote `s` for `sh -c`.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// What a workspace is populated from.
#[derive(Debug, Clone)]
pub enum RepositorySnapshot {
    /// A local checkout, copied into the workspace.
    Directory(std::path::PathBuf),
    /// A remote repository, shallow-cloned. The URL may embed a credential.
    Git {
        url: Arc<SecretString>,
        branch: String,
    },
}

impl RepositorySnapshot {
    /// Build a clone snapshot, embedding `token` as userinfo when present.
    pub fn git(clone_url: &str, branch: &str, token: Option<&SecretString>) -> Self {
        let url = match token {
            Some(token) if !token.expose_secret().is_empty() => {
                authenticated_url(clone_url, token.expose_secret())
            }
            _ => clone_url.to_string(),
        };
        Self::Git {
            url: Arc::new(SecretString::from(url)),
            branch: branch.to_string(),
        }
    }

    /// Short description safe for logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Directory(path) => format!("directory {}", path.display()),
            Self::Git { url, branch } => format!(
                "{} ({})",
                autoship_common::redact_userinfo(url.expose_secret()),
                branch
            ),
        }
    }
}

fn authenticated_url(clone_url: &str, token: &str) -> String {
    match clone_url.split_once("://") {
        Some((scheme, rest)) => {
            let rest = match rest.find('@') {
                Some(at) if !rest[..at].contains('/') => &rest[at + 1..],
                _ => rest,
            };
            format!("{}://x-access-token:{}@{}", scheme, token, rest)
        }
        None => clone_url.to_string(),
    }
}

/// Captured result of one command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    /// `-1` when the process was terminated by a signal.
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr, the way a terminal would interleave them
    /// for a command that writes errors last.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// A freshly provisioned backend workspace.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub handle: String,
    pub root: String,
}

/// One way of hosting workspaces. Paths passed to file operations are
/// relative to the workspace root; backends reject anything that escapes it.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn mode(&self) -> BackingMode;

    /// Whether a command timeout takes the whole workspace down with it
    /// (a container cannot kill a single exec, only itself).
    fn destroys_on_timeout(&self) -> bool {
        false
    }

    /// Create and populate a workspace, honouring `timeout`. A failed
    /// provision must not leave anything behind.
    async fn provision(
        &self,
        snapshot: &RepositorySnapshot,
        timeout: Duration,
    ) -> Result<Provisioned, SandboxError>;

    /// Write `contents`, creating parent directories.
    async fn write_file(&self, handle: &str, path: &str, contents: &[u8])
    -> Result<(), SandboxError>;

    /// `Ok(None)` if the file does not exist.
    async fn read_file(&self, handle: &str, path: &str) -> Result<Option<Vec<u8>>, SandboxError>;

    /// Remove a file or directory tree. Missing paths are not an error.
    async fn remove_path(&self, handle: &str, path: &str) -> Result<(), SandboxError>;

    /// Move `from` to `to`, creating the parents of `to`.
    async fn rename(&self, handle: &str, from: &str, to: &str) -> Result<(), SandboxError>;

    /// Whether anything (file, directory or link) exists at `path`.
    async fn exists(&self, handle: &str, path: &str) -> Result<bool, SandboxError> {
        let out = self
            .run(handle, &format!("test -e {p} || test -L {p}", p = shell_quote(path)), STAT_TIMEOUT)
            .await?;
        Ok(out.success())
    }

    /// Whether `path` is a regular file with an execute bit set.
    async fn is_executable(&self, handle: &str, path: &str) -> Result<bool, SandboxError> {
        let out = self
            .run(handle, &format!("test -f {p} && test -x {p}", p = shell_quote(path)), STAT_TIMEOUT)
            .await?;
        Ok(out.success())
    }

    /// Add the execute bits to `path`.
    async fn set_executable(&self, handle: &str, path: &str) -> Result<(), SandboxError> {
        let out = self
            .run(handle, &format!("chmod +x {}", shell_quote(path)), STAT_TIMEOUT)
            .await?;
        if out.success() {
            Ok(())
        } else {
            Err(SandboxError::io(path, out.combined().trim()))
        }
    }

    /// Run `command` through `sh -c` in the workspace root. On timeout the
    /// process (and anything it spawned) must be terminated.
    async fn run(
        &self,
        handle: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError>;

    /// Destroy the workspace. Unknown handles are a no-op.
    async fn teardown(&self, handle: &str) -> Result<(), SandboxError>;
}

/// A live handle to files and process execution, bound to one session.
pub struct Workspace {
    handle: String,
    root: String,
    mode: BackingMode,
    live: AtomicBool,
    backend: Arc<dyn SandboxBackend>,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("handle", &self.handle)
            .field("root", &self.root)
            .field("mode", &self.mode)
            .field("live", &self.is_live())
            .finish()
    }
}

impl Workspace {
    pub fn new(provisioned: Provisioned, backend: Arc<dyn SandboxBackend>) -> Self {
        Self {
            mode: backend.mode(),
            handle: provisioned.handle,
            root: provisioned.root,
            live: AtomicBool::new(true),
            backend,
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn mode(&self) -> BackingMode {
        self.mode
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<(), SandboxError> {
        if self.is_live() {
            Ok(())
        } else {
            Err(SandboxError::Released)
        }
    }

    pub async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), SandboxError> {
        self.ensure_live()?;
        self.backend.write_file(&self.handle, path, contents).await
    }

    /// Write every entry of `files`, stopping at the first failure.
    pub async fn write_files(&self, files: &BTreeMap<String, String>) -> Result<(), SandboxError> {
        for (path, content) in files {
            self.write_file(path, content.as_bytes()).await?;
        }
        Ok(())
    }

    pub async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, SandboxError> {
        self.ensure_live()?;
        self.backend.read_file(&self.handle, path).await
    }

    pub async fn remove_path(&self, path: &str) -> Result<(), SandboxError> {
        self.ensure_live()?;
        self.backend.remove_path(&self.handle, path).await
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), SandboxError> {
        self.ensure_live()?;
        self.backend.rename(&self.handle, from, to).await
    }

    pub async fn exists(&self, path: &str) -> Result<bool, SandboxError> {
        self.ensure_live()?;
        self.backend.exists(&self.handle, path).await
    }

    pub async fn is_executable(&self, path: &str) -> Result<bool, SandboxError> {
        self.ensure_live()?;
        self.backend.is_executable(&self.handle, path).await
    }

    pub async fn set_executable(&self, path: &str) -> Result<(), SandboxError> {
        self.ensure_live()?;
        self.backend.set_executable(&self.handle, path).await
    }

    pub async fn run(&self, command: &str, timeout: Duration) -> Result<ExecOutput, SandboxError> {
        self.ensure_live()?;
        let result = self.backend.run(&self.handle, command, timeout).await;
        if matches!(result, Err(SandboxError::Timeout { .. })) && self.backend.destroys_on_timeout() {
            tracing::warn!(handle = %self.handle, backing = %self.mode, "workspace killed by command timeout");
            self.release().await;
        }
        result
    }

    /// Tear the workspace down. Only the first call does anything; errors
    /// are logged, never returned.
    pub async fn release(&self) {
        if !self.live.swap(false, Ordering::SeqCst) {
            return;
        }
        match self.backend.teardown(&self.handle).await {
            Ok(()) => tracing::debug!(handle = %self.handle, backing = %self.mode, "workspace released"),
            Err(e) => tracing::warn!(handle = %self.handle, backing = %self.mode, "workspace teardown failed: {}", e),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.live.swap(false, Ordering::SeqCst) {
            return;
        }
        let backend = Arc::clone(&self.backend);
        let handle = std::mem::take(&mut self.handle);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = backend.teardown(&handle).await {
                        tracing::warn!(handle = %handle, "teardown of dropped workspace failed: {}", e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!(handle = %handle, "workspace dropped outside a runtime; teardown skipped");
            }
        }
    }
}

/// Result of `SandboxExecutor::acquire`.
#[derive(Debug)]
pub struct Acquired {
    pub workspace: Workspace,
    /// Set when the remote backend was skipped or failed and the local one
    /// was used instead.
    pub fallback_reason: Option<String>,
}

/// Chooses a backend per the execution mode and hands out workspaces.
#[derive(Clone)]
pub struct SandboxExecutor {
    remote: Option<Arc<dyn SandboxBackend>>,
    local: Arc<dyn SandboxBackend>,
}

impl SandboxExecutor {
    pub fn new(remote: Option<Arc<dyn SandboxBackend>>, local: Arc<dyn SandboxBackend>) -> Self {
        Self { remote, local }
    }

    /// Local backend only.
    pub fn local_only() -> Self {
        Self::new(None, Arc::new(LocalSandbox::new()))
    }

    /// Stand up a workspace for `snapshot`.
    ///
    /// In `Auto` mode a remote provisioning failure falls back to the local
    /// backend and is reported through `fallback_reason`, never as an error.
    pub async fn acquire(
        &self,
        snapshot: &RepositorySnapshot,
        mode: ExecutionMode,
        timeout: Duration,
    ) -> Result<Acquired, SandboxError> {
        match mode {
            ExecutionMode::LocalOnly => {
                let workspace = provision_on(&self.local, snapshot, timeout).await?;
                Ok(Acquired {
                    workspace,
                    fallback_reason: None,
                })
            }
            ExecutionMode::RemoteOnly => {
                let remote = self.remote.as_ref().ok_or_else(|| {
                    SandboxError::Provision("no remote sandbox backend is configured".into())
                })?;
                let workspace = provision_on(remote, snapshot, timeout).await?;
                Ok(Acquired {
                    workspace,
                    fallback_reason: None,
                })
            }
            ExecutionMode::Auto => {
                let reason = match &self.remote {
                    Some(remote) => match provision_on(remote, snapshot, timeout).await {
                        Ok(workspace) => {
                            return Ok(Acquired {
                                workspace,
                                fallback_reason: None,
                            });
                        }
                        Err(e) => {
                            tracing::warn!(snapshot = %snapshot.describe(), "remote sandbox unavailable: {}", e);
                            e.to_string()
                        }
                    },
                    None => "no remote sandbox backend is configured".to_string(),
                };
                let workspace = provision_on(&self.local, snapshot, timeout).await?;
                Ok(Acquired {
                    workspace,
                    fallback_reason: Some(reason),
                })
            }
        }
    }
}

/// Provision on a detached task. If the caller stops waiting (cancellation),
/// the task tears down whatever it managed to create.
async fn provision_on(
    backend: &Arc<dyn SandboxBackend>,
    snapshot: &RepositorySnapshot,
    timeout: Duration,
) -> Result<Workspace, SandboxError> {
    let (tx, rx) = oneshot::channel();
    let task_backend = Arc::clone(backend);
    let snapshot = snapshot.clone();
    tokio::spawn(async move {
        let result = task_backend.provision(&snapshot, timeout).await;
        if let Err(Ok(orphan)) = tx.send(result) {
            tracing::debug!(handle = %orphan.handle, "provisioning abandoned; tearing down");
            if let Err(e) = task_backend.teardown(&orphan.handle).await {
                tracing::warn!(handle = %orphan.handle, "teardown of abandoned workspace failed: {}", e);
            }
        }
    });
    let provisioned = rx
        .await
        .map_err(|_| SandboxError::Provision("provisioning task terminated unexpectedly".into()))??;
    Ok(Workspace::new(provisioned, Arc::clone(backend)))
}
