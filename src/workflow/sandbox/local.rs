//! Local fallback backend: a process-private temp directory plus `sh -c`
//! subprocesses in their own process group.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use autoship_common::BackingMode;
use dashmap::DashMap;
use secrecy::ExposeSecret;
use tempfile::TempDir;

use super::{ExecOutput, Provisioned, RepositorySnapshot, SandboxBackend};
use crate::errors::SandboxError;
use crate::util::sanitize;

const REPO_DIR: &str = "repo";

struct LocalWorkspace {
    dir: TempDir,
    root: PathBuf,
}

/// Workspaces rooted in `$TMPDIR/autoship-*`.
#[derive(Default)]
pub struct LocalSandbox {
    workspaces: DashMap<String, LocalWorkspace>,
}

impl LocalSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of workspaces currently alive.
    pub fn live_count(&self) -> usize {
        self.workspaces.len()
    }

    fn root(&self, handle: &str) -> Result<PathBuf, SandboxError> {
        self.workspaces
            .get(handle)
            .map(|ws| ws.root.clone())
            .ok_or(SandboxError::Released)
    }

    /// Resolve `rel` and check that it really lives under the root once
    /// symlinks are followed. With `follow_final` unset the last component
    /// itself may be a link (removing or replacing a link is harmless).
    fn resolve(&self, handle: &str, rel: &str, follow_final: bool) -> Result<PathBuf, SandboxError> {
        let root = self.root(handle)?;
        let target = resolve_within(&root, rel)?;
        ensure_contained(&root, &target, rel, follow_final)?;
        Ok(target)
    }
}

/// Join `rel` onto `root`, rejecting absolute paths and `..`.
pub(crate) fn resolve_within(root: &Path, rel: &str) -> Result<PathBuf, SandboxError> {
    let rel_path = Path::new(rel);
    if rel.is_empty() {
        return Err(SandboxError::io(rel, "empty path"));
    }
    for component in rel_path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(SandboxError::io(rel, "path escapes the workspace root")),
        }
    }
    Ok(root.join(rel_path))
}

/// Canonicalise the deepest existing ancestor of `target` and require it to
/// stay under the canonical `root`. Paths below it do not exist yet and
/// will be created as plain directories.
fn ensure_contained(root: &Path, target: &Path, rel: &str, follow_final: bool) -> Result<(), SandboxError> {
    let canonical_root = root.canonicalize().map_err(|e| SandboxError::io(rel, e))?;
    let mut ancestor = if follow_final {
        target.to_path_buf()
    } else {
        target.parent().unwrap_or(root).to_path_buf()
    };
    loop {
        match std::fs::symlink_metadata(&ancestor) {
            Ok(_) => break,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if ancestor == root || !ancestor.pop() {
                    return Err(SandboxError::io(rel, "workspace root is missing"));
                }
            }
            Err(e) => return Err(SandboxError::io(rel, e)),
        }
    }
    // A dangling link fails to canonicalise and is treated as an escape.
    match ancestor.canonicalize() {
        Ok(resolved) if resolved.starts_with(&canonical_root) => Ok(()),
        _ => Err(SandboxError::escape(rel)),
    }
}

#[async_trait]
impl SandboxBackend for LocalSandbox {
    fn mode(&self) -> BackingMode {
        BackingMode::LocalFallback
    }

    async fn provision(
        &self,
        snapshot: &RepositorySnapshot,
        timeout: Duration,
    ) -> Result<Provisioned, SandboxError> {
        let dir = tempfile::Builder::new()
            .prefix("autoship-")
            .tempdir()
            .map_err(|e| SandboxError::Provision(format!("failed to create temp directory: {}", e)))?;
        let root = dir.path().join(REPO_DIR);

        match snapshot {
            RepositorySnapshot::Directory(source) => {
                let source = source.clone();
                let target = root.clone();
                let copy = tokio::task::spawn_blocking(move || copy_tree(&source, &target));
                match tokio::time::timeout(timeout, copy).await {
                    Ok(Ok(result)) => result?,
                    Ok(Err(e)) => {
                        return Err(SandboxError::Provision(format!("copy task failed: {}", e)));
                    }
                    Err(_) => return Err(SandboxError::Timeout { secs: timeout.as_secs() }),
                }
            }
            RepositorySnapshot::Git { url, branch } => {
                let output = run_shell(
                    dir.path(),
                    &format!(
                        "git clone --quiet --depth 1 --branch \"$AUTOSHIP_BRANCH\" \"$AUTOSHIP_CLONE_URL\" {}",
                        REPO_DIR
                    ),
                    &[
                        ("AUTOSHIP_CLONE_URL", url.expose_secret()),
                        ("AUTOSHIP_BRANCH", branch.as_str()),
                        ("GIT_TERMINAL_PROMPT", "0"),
                    ],
                    timeout,
                )
                .await?;
                if !output.success() {
                    return Err(SandboxError::Provision(format!(
                        "git clone failed: {}",
                        sanitize(output.stderr.trim(), &[url.expose_secret()])
                    )));
                }
            }
        }

        let handle = uuid::Uuid::new_v4().to_string();
        let provisioned = Provisioned {
            handle: handle.clone(),
            root: root.display().to_string(),
        };
        tracing::debug!(handle = %handle, root = %provisioned.root, "local workspace provisioned");
        self.workspaces.insert(handle, LocalWorkspace { dir, root });
        Ok(provisioned)
    }

    async fn write_file(&self, handle: &str, path: &str, contents: &[u8]) -> Result<(), SandboxError> {
        let target = self.resolve(handle, path, true)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SandboxError::io(path, e))?;
        }
        tokio::fs::write(&target, contents)
            .await
            .map_err(|e| SandboxError::io(path, e))
    }

    async fn read_file(&self, handle: &str, path: &str) -> Result<Option<Vec<u8>>, SandboxError> {
        let target = self.resolve(handle, path, true)?;
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SandboxError::io(path, e)),
        }
    }

    async fn remove_path(&self, handle: &str, path: &str) -> Result<(), SandboxError> {
        let target = self.resolve(handle, path, false)?;
        let meta = match tokio::fs::symlink_metadata(&target).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(SandboxError::io(path, e)),
        };
        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(&target).await
        } else {
            tokio::fs::remove_file(&target).await
        };
        result.map_err(|e| SandboxError::io(path, e))
    }

    async fn rename(&self, handle: &str, from: &str, to: &str) -> Result<(), SandboxError> {
        let source = self.resolve(handle, from, false)?;
        let target = self.resolve(handle, to, false)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SandboxError::io(to, e))?;
        }
        tokio::fs::rename(&source, &target)
            .await
            .map_err(|e| SandboxError::io(to, e))
    }

    async fn exists(&self, handle: &str, path: &str) -> Result<bool, SandboxError> {
        let target = self.resolve(handle, path, false)?;
        match tokio::fs::symlink_metadata(&target).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SandboxError::io(path, e)),
        }
    }

    async fn is_executable(&self, handle: &str, path: &str) -> Result<bool, SandboxError> {
        let target = self.resolve(handle, path, true)?;
        match tokio::fs::metadata(&target).await {
            Ok(meta) => Ok(meta.is_file() && has_exec_bit(&meta)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SandboxError::io(path, e)),
        }
    }

    async fn set_executable(&self, handle: &str, path: &str) -> Result<(), SandboxError> {
        let target = self.resolve(handle, path, true)?;
        let meta = tokio::fs::metadata(&target)
            .await
            .map_err(|e| SandboxError::io(path, e))?;
        tokio::fs::set_permissions(&target, with_exec_bits(meta.permissions()))
            .await
            .map_err(|e| SandboxError::io(path, e))
    }

    async fn run(&self, handle: &str, command: &str, timeout: Duration) -> Result<ExecOutput, SandboxError> {
        let root = self.root(handle)?;
        run_shell(&root, command, &[], timeout).await
    }

    async fn teardown(&self, handle: &str) -> Result<(), SandboxError> {
        let Some((_, workspace)) = self.workspaces.remove(handle) else {
            return Ok(());
        };
        let path = workspace.dir.path().display().to_string();
        tokio::task::spawn_blocking(move || workspace.dir.close())
            .await
            .map_err(|e| SandboxError::io(&path, e))?
            .map_err(|e| SandboxError::io(&path, e))
    }
}

/// Copy a directory tree, preserving symlinks as symlinks.
fn copy_tree(source: &Path, target: &Path) -> Result<(), SandboxError> {
    if !source.is_dir() {
        return Err(SandboxError::Provision(format!(
            "source directory {} does not exist",
            source.display()
        )));
    }
    for entry in walkdir::WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| SandboxError::Provision(format!("failed to walk source: {}", e)))?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| SandboxError::Provision(e.to_string()))?;
        let dest = target.join(rel);
        let file_type = entry.file_type();
        let result = if file_type.is_dir() {
            std::fs::create_dir_all(&dest)
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &dest)
        } else {
            std::fs::copy(entry.path(), &dest).map(|_| ())
        };
        result.map_err(|e| SandboxError::io(dest.display().to_string(), e))?;
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(link: &Path, dest: &Path) -> std::io::Result<()> {
    let target = std::fs::read_link(link)?;
    std::os::unix::fs::symlink(target, dest)
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::copy(link, dest).map(|_| ())
}

#[cfg(unix)]
fn has_exec_bit(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn has_exec_bit(_meta: &std::fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn with_exec_bits(mut perms: std::fs::Permissions) -> std::fs::Permissions {
    use std::os::unix::fs::PermissionsExt;
    perms.set_mode(perms.mode() | 0o111);
    perms
}

#[cfg(not(unix))]
fn with_exec_bits(perms: std::fs::Permissions) -> std::fs::Permissions {
    perms
}

/// Kills a whole process group when dropped, unless disarmed.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn disarm(mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid.take() {
            // SAFETY: killpg has no memory-safety preconditions.
            let rc = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
            if rc == 0 {
                tracing::debug!(pgid, "killed process group");
            }
        }
    }
}

/// Run `sh -c command` in `cwd`. On timeout, or if the returned future is
/// dropped, the process and its whole group are killed.
pub(crate) async fn run_shell(
    cwd: &Path,
    command: &str,
    envs: &[(&str, &str)],
    timeout: Duration,
) -> Result<ExecOutput, SandboxError> {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in envs {
        cmd.env(key, value);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd
        .spawn()
        .map_err(|e| SandboxError::Exec(format!("failed to spawn sh: {}", e)))?;
    let guard = ProcessGroupGuard { pgid: child.id() };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            guard.disarm();
            Ok(ExecOutput {
                exit_code: output.status.code().map(i64::from).unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
        Ok(Err(e)) => Err(SandboxError::Exec(e.to_string())),
        Err(_) => {
            tracing::warn!(command = %command, secs = timeout.as_secs(), "command timed out; killing");
            drop(guard);
            Err(SandboxError::Timeout {
                secs: timeout.as_secs(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    async fn provisioned() -> (LocalSandbox, Provisioned, TempDir) {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("pkg")).unwrap();
        std::fs::write(src.path().join("pkg/mod.py"), "x = 1\n").unwrap();
        std::fs::write(src.path().join("README.md"), "# hi\n").unwrap();
        let sandbox = LocalSandbox::new();
        let p = sandbox
            .provision(
                &RepositorySnapshot::Directory(src.path().to_path_buf()),
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        (sandbox, p, src)
    }

    #[tokio::test]
    async fn test_provision_copies_snapshot_into_private_tempdir() {
        let (sandbox, p, _src) = provisioned().await;
        assert!(p.root.contains("autoship-"));
        assert_eq!(
            sandbox.read_file(&p.handle, "pkg/mod.py").await.unwrap(),
            Some(b"x = 1\n".to_vec())
        );
        assert_eq!(sandbox.live_count(), 1);
        sandbox.teardown(&p.handle).await.unwrap();
        assert_eq!(sandbox.live_count(), 0);
        assert!(!Path::new(&p.root).exists());
    }

    #[tokio::test]
    async fn test_provision_missing_source_fails() {
        let sandbox = LocalSandbox::new();
        let err = sandbox
            .provision(
                &RepositorySnapshot::Directory(PathBuf::from("/definitely/not/here")),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Provision(_)));
        assert_eq!(sandbox.live_count(), 0);
    }

    #[tokio::test]
    async fn test_file_ops_and_path_escape() {
        let (sandbox, p, _src) = provisioned().await;
        sandbox.write_file(&p.handle, "new/dir/b.txt", b"hello").await.unwrap();
        sandbox.rename(&p.handle, "new/dir/b.txt", "moved/c.txt").await.unwrap();
        assert_eq!(sandbox.read_file(&p.handle, "new/dir/b.txt").await.unwrap(), None);
        assert_eq!(
            sandbox.read_file(&p.handle, "moved/c.txt").await.unwrap(),
            Some(b"hello".to_vec())
        );
        sandbox.remove_path(&p.handle, "moved").await.unwrap();
        sandbox.remove_path(&p.handle, "moved").await.unwrap();
        assert_eq!(sandbox.read_file(&p.handle, "moved/c.txt").await.unwrap(), None);

        assert!(sandbox.write_file(&p.handle, "../escape.txt", b"x").await.is_err());
        assert!(sandbox.read_file(&p.handle, "/etc/passwd").await.is_err());
        sandbox.teardown(&p.handle).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_out_of_the_root_are_refused() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "host data\n").unwrap();
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("pkg")).unwrap();
        std::fs::write(src.path().join("pkg/mod.py"), "x = 1\n").unwrap();
        std::os::unix::fs::symlink(outside.path(), src.path().join("link")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), src.path().join("leak.txt")).unwrap();
        std::os::unix::fs::symlink("pkg", src.path().join("alias")).unwrap();

        let sandbox = LocalSandbox::new();
        let p = sandbox
            .provision(
                &RepositorySnapshot::Directory(src.path().to_path_buf()),
                Duration::from_secs(10),
            )
            .await
            .unwrap();

        let err = sandbox.write_file(&p.handle, "link/pwned.txt", b"x").await.unwrap_err();
        assert!(matches!(err, SandboxError::Escape { .. }));
        assert!(!outside.path().join("pwned.txt").exists());
        assert!(matches!(
            sandbox.read_file(&p.handle, "leak.txt").await,
            Err(SandboxError::Escape { .. })
        ));
        assert!(matches!(
            sandbox.rename(&p.handle, "pkg/mod.py", "link/deep/mod.py").await,
            Err(SandboxError::Escape { .. })
        ));

        // Links that stay inside the workspace keep working.
        assert_eq!(
            sandbox.read_file(&p.handle, "alias/mod.py").await.unwrap(),
            Some(b"x = 1\n".to_vec())
        );
        // Removing the link itself does not touch its target.
        sandbox.remove_path(&p.handle, "leak.txt").await.unwrap();
        assert!(outside.path().join("secret.txt").exists());

        sandbox.teardown(&p.handle).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_bits() {
        use std::os::unix::fs::PermissionsExt;
        let src = tempfile::tempdir().unwrap();
        let script = src.path().join("run.sh");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(src.path().join("lib.py"), "x = 1\n").unwrap();

        let sandbox = LocalSandbox::new();
        let p = sandbox
            .provision(
                &RepositorySnapshot::Directory(src.path().to_path_buf()),
                Duration::from_secs(10),
            )
            .await
            .unwrap();

        assert!(sandbox.is_executable(&p.handle, "run.sh").await.unwrap());
        assert!(!sandbox.is_executable(&p.handle, "lib.py").await.unwrap());
        assert!(!sandbox.is_executable(&p.handle, "missing.sh").await.unwrap());

        sandbox.set_executable(&p.handle, "lib.py").await.unwrap();
        assert!(sandbox.is_executable(&p.handle, "lib.py").await.unwrap());

        sandbox.teardown(&p.handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_captures_output_and_exit_code() {
        let (sandbox, p, _src) = provisioned().await;
        let out = sandbox
            .run(&p.handle, "ls pkg; echo oops >&2; exit 3", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(out.stdout.contains("mod.py"));
        assert!(out.stderr.contains("oops"));
        sandbox.teardown(&p.handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_timeout_kills_process_group() {
        let (sandbox, p, _src) = provisioned().await;
        let start = Instant::now();
        let err = sandbox
            .run(
                &p.handle,
                "(sleep 1; touch late.txt) & sleep 30",
                Duration::from_millis(300),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(10));

        // The background subshell belonged to the same group and must be gone.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(sandbox.read_file(&p.handle, "late.txt").await.unwrap(), None);
        sandbox.teardown(&p.handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_teardown_unknown_handle_is_noop() {
        let sandbox = LocalSandbox::new();
        sandbox.teardown("nope").await.unwrap();
        assert!(matches!(
            sandbox.run("nope", "true", Duration::from_secs(1)).await,
            Err(SandboxError::Released)
        ));
    }

    #[test]
    fn test_resolve_within() {
        let root = Path::new("/ws");
        assert_eq!(resolve_within(root, "a/b.txt").unwrap(), PathBuf::from("/ws/a/b.txt"));
        assert!(resolve_within(root, "a/../../b").is_err());
        assert!(resolve_within(root, "/abs").is_err());
        assert!(resolve_within(root, "").is_err());
    }
}
