//! Remote sandbox backend: one throwaway Docker container per workspace.
//!
//! The container runs `sleep infinity`; every operation is a `docker exec`
//! of `sh -c` inside the configured workdir. File writes are shipped as
//! base64 chunks so no stdin plumbing is needed.

use std::time::Duration;

use async_trait::async_trait;
use autoship_common::BackingMode;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::StreamExt;
use secrecy::ExposeSecret;

use super::{ExecOutput, Provisioned, RepositorySnapshot, SandboxBackend, shell_quote};
use crate::config::SandboxConfig;
use crate::errors::SandboxError;
use crate::util::sanitize;

/// Raw bytes per write chunk; 48 KiB encodes to 64 KiB, well under the
/// kernel's per-argument limit.
const WRITE_CHUNK: usize = 48 * 1024;
const SNAPSHOT_MOUNT: &str = "/snapshot";
const FILE_OP_TIMEOUT: Duration = Duration::from_secs(60);
const MISSING_FILE_EXIT: i64 = 44;

pub struct DockerSandbox {
    docker: Docker,
    config: SandboxConfig,
}

impl DockerSandbox {
    /// Build a client from `DOCKER_HOST` or the platform default socket.
    /// This does not contact the daemon; provisioning does.
    pub fn connect(config: SandboxConfig) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Provision(format!("Docker client unavailable: {}", e)))?;
        Ok(Self { docker, config })
    }

    fn path(&self, rel: &str) -> Result<String, SandboxError> {
        container_path(&self.config.workdir, rel)
    }

    async fn ensure_image(&self) -> Result<(), SandboxError> {
        if self.docker.inspect_image(&self.config.image).await.is_ok() {
            return Ok(());
        }
        tracing::info!(image = %self.config.image, "pulling sandbox image");
        let options = CreateImageOptions {
            from_image: self.config.image.clone(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(item) = stream.next().await {
            item.map_err(|e| {
                SandboxError::Provision(format!("failed to pull {}: {}", self.config.image, e))
            })?;
        }
        Ok(())
    }

    async fn create(&self, snapshot: &RepositorySnapshot) -> Result<String, SandboxError> {
        let mut binds = Vec::new();
        if let RepositorySnapshot::Directory(path) = snapshot {
            let path = path.canonicalize().map_err(|e| {
                SandboxError::Provision(format!("source directory {}: {}", path.display(), e))
            })?;
            binds.push(format!("{}:{}:ro", path.display(), SNAPSHOT_MOUNT));
        }
        let host_config = HostConfig {
            memory: self.config.memory_bytes(),
            nano_cpus: Some((self.config.cpus * 1_000_000_000.0) as i64),
            binds: (!binds.is_empty()).then_some(binds),
            ..Default::default()
        };
        let env: Vec<String> = self
            .config
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let container_config = Config {
            image: Some(self.config.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            env: Some(env),
            host_config: Some(host_config),
            ..Default::default()
        };
        let name = format!("autoship-{}", uuid::Uuid::new_v4().simple());
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name,
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| SandboxError::Provision(format!("failed to create container: {}", e)))?;
        Ok(created.id)
    }

    async fn populate(
        &self,
        id: &str,
        snapshot: &RepositorySnapshot,
        timeout: Duration,
    ) -> Result<(), SandboxError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Provision(format!("failed to start container: {}", e)))?;

        let workdir = shell_quote(&self.config.workdir);
        let output = match snapshot {
            RepositorySnapshot::Directory(_) => {
                let command = format!(
                    "mkdir -p {dir} && cp -a {mount}/. {dir}/",
                    dir = workdir,
                    mount = SNAPSHOT_MOUNT
                );
                self.exec(id, &command, None, Vec::new(), timeout).await?
            }
            RepositorySnapshot::Git { url, branch } => {
                let command = format!(
                    "git clone --quiet --depth 1 --branch \"$AUTOSHIP_BRANCH\" \"$AUTOSHIP_CLONE_URL\" {}",
                    workdir
                );
                let env = vec![
                    format!("AUTOSHIP_CLONE_URL={}", url.expose_secret()),
                    format!("AUTOSHIP_BRANCH={}", branch),
                    "GIT_TERMINAL_PROMPT=0".to_string(),
                ];
                let out = self.exec(id, &command, None, env, timeout).await?;
                if !out.success() {
                    return Err(SandboxError::Provision(format!(
                        "git clone failed: {}",
                        sanitize(out.stderr.trim(), &[url.expose_secret()])
                    )));
                }
                out
            }
        };
        if !output.success() {
            return Err(SandboxError::Provision(format!(
                "populating workspace failed: {}",
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Run one `sh -c` exec. `workdir` of `None` means the container default.
    async fn exec(
        &self,
        id: &str,
        command: &str,
        workdir: Option<&str>,
        env: Vec<String>,
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(vec!["sh".to_string(), "-c".to_string(), command.to_string()]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    env: (!env.is_empty()).then_some(env),
                    working_dir: workdir.map(str::to_string),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::Exec(format!("failed to create exec: {}", e)))?;

        let collect = async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            match self.docker.start_exec(&exec.id, None).await {
                Ok(StartExecResults::Attached { mut output, .. }) => {
                    while let Some(chunk) = output.next().await {
                        match chunk {
                            Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                                stdout.extend_from_slice(&message)
                            }
                            Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                            Ok(LogOutput::StdIn { .. }) => {}
                            Err(e) => return Err(SandboxError::Exec(e.to_string())),
                        }
                    }
                }
                Ok(StartExecResults::Detached) => {
                    return Err(SandboxError::Exec("exec started detached".into()));
                }
                Err(e) => return Err(SandboxError::Exec(format!("failed to start exec: {}", e))),
            }
            let inspect = self
                .docker
                .inspect_exec(&exec.id)
                .await
                .map_err(|e| SandboxError::Exec(format!("failed to inspect exec: {}", e)))?;
            Ok((inspect.exit_code.unwrap_or(-1), stdout, stderr))
        };

        match tokio::time::timeout(timeout, collect).await {
            Ok(result) => {
                let (exit_code, stdout, stderr) = result?;
                Ok(ExecOutput {
                    exit_code,
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                })
            }
            Err(_) => {
                // An exec cannot be killed on its own; take the container down.
                tracing::warn!(container = %short_id(id), secs = timeout.as_secs(), "exec timed out; killing container");
                if let Err(e) = self
                    .docker
                    .kill_container(id, None::<KillContainerOptions<String>>)
                    .await
                {
                    tracing::warn!(container = %short_id(id), "failed to kill container: {}", e);
                }
                Err(SandboxError::Timeout {
                    secs: timeout.as_secs(),
                })
            }
        }
    }

    async fn exec_in_workdir(&self, id: &str, command: &str, timeout: Duration) -> Result<ExecOutput, SandboxError> {
        let workdir = self.config.workdir.clone();
        self.exec(id, command, Some(&workdir), Vec::new(), timeout).await
    }

    async fn remove(&self, id: &str) -> Result<(), SandboxError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(SandboxError::Exec(format!("failed to remove container: {}", e))),
        }
    }
}

#[async_trait]
impl SandboxBackend for DockerSandbox {
    fn mode(&self) -> BackingMode {
        BackingMode::RemoteSandbox
    }

    fn destroys_on_timeout(&self) -> bool {
        true
    }

    async fn provision(
        &self,
        snapshot: &RepositorySnapshot,
        timeout: Duration,
    ) -> Result<Provisioned, SandboxError> {
        let setup = async {
            self.docker
                .ping()
                .await
                .map_err(|e| SandboxError::Provision(format!("Docker daemon unreachable: {}", e)))?;
            self.ensure_image().await?;
            self.create(snapshot).await
        };
        let id = match tokio::time::timeout(timeout, setup).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SandboxError::Provision(format!(
                    "container setup timed out after {}s",
                    timeout.as_secs()
                )));
            }
        };

        if let Err(e) = self.populate(&id, snapshot, timeout).await {
            if let Err(cleanup) = self.remove(&id).await {
                tracing::warn!(container = %short_id(&id), "cleanup after failed provision: {}", cleanup);
            }
            return Err(match e {
                SandboxError::Provision(_) => e,
                other => SandboxError::Provision(other.to_string()),
            });
        }

        tracing::debug!(container = %short_id(&id), image = %self.config.image, "remote workspace provisioned");
        Ok(Provisioned {
            handle: id,
            root: self.config.workdir.clone(),
        })
    }

    async fn write_file(&self, handle: &str, path: &str, contents: &[u8]) -> Result<(), SandboxError> {
        let target = shell_quote(&self.path(path)?);
        let prepare = format!("mkdir -p \"$(dirname {t})\" && : > {t}", t = target);
        check(path, self.exec_in_workdir(handle, &prepare, FILE_OP_TIMEOUT).await?)?;
        for chunk in contents.chunks(WRITE_CHUNK) {
            let encoded = BASE64_STANDARD.encode(chunk);
            let append = format!("printf '%s' '{}' | base64 -d >> {}", encoded, target);
            check(path, self.exec_in_workdir(handle, &append, FILE_OP_TIMEOUT).await?)?;
        }
        Ok(())
    }

    async fn read_file(&self, handle: &str, path: &str) -> Result<Option<Vec<u8>>, SandboxError> {
        let target = shell_quote(&self.path(path)?);
        let command = format!(
            "[ -f {t} ] || exit {code}; base64 {t}",
            t = target,
            code = MISSING_FILE_EXIT
        );
        let out = self.exec_in_workdir(handle, &command, FILE_OP_TIMEOUT).await?;
        if out.exit_code == MISSING_FILE_EXIT {
            return Ok(None);
        }
        let out = check(path, out)?;
        let compact: String = out.stdout.split_whitespace().collect();
        BASE64_STANDARD
            .decode(compact)
            .map(Some)
            .map_err(|e| SandboxError::io(path, e))
    }

    async fn remove_path(&self, handle: &str, path: &str) -> Result<(), SandboxError> {
        let command = format!("rm -rf {}", shell_quote(&self.path(path)?));
        check(path, self.exec_in_workdir(handle, &command, FILE_OP_TIMEOUT).await?).map(|_| ())
    }

    async fn rename(&self, handle: &str, from: &str, to: &str) -> Result<(), SandboxError> {
        let source = shell_quote(&self.path(from)?);
        let target = shell_quote(&self.path(to)?);
        let command = format!(
            "mkdir -p \"$(dirname {t})\" && mv -f {s} {t}",
            s = source,
            t = target
        );
        check(to, self.exec_in_workdir(handle, &command, FILE_OP_TIMEOUT).await?).map(|_| ())
    }

    async fn run(&self, handle: &str, command: &str, timeout: Duration) -> Result<ExecOutput, SandboxError> {
        self.exec_in_workdir(handle, command, timeout).await
    }

    async fn teardown(&self, handle: &str) -> Result<(), SandboxError> {
        self.remove(handle).await?;
        tracing::debug!(container = %short_id(handle), "remote workspace removed");
        Ok(())
    }
}

fn container_path(workdir: &str, rel: &str) -> Result<String, SandboxError> {
    if rel.is_empty() || rel.starts_with('/') || rel.split('/').any(|c| c == "..") {
        return Err(SandboxError::io(rel, "path escapes the workspace root"));
    }
    Ok(format!("{}/{}", workdir.trim_end_matches('/'), rel))
}

fn check(path: &str, out: ExecOutput) -> Result<ExecOutput, SandboxError> {
    if out.success() {
        Ok(out)
    } else {
        Err(SandboxError::io(path, out.stderr.trim()))
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

/// Single-quote `s` for POSIX `sh`.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_joins_workdir_and_rejects_escape() {
        assert_eq!(
            container_path("/workspace/", "src/a.py").unwrap(),
            "/workspace/src/a.py"
        );
        assert!(container_path("/workspace", "../etc/passwd").is_err());
        assert!(container_path("/workspace", "/etc/passwd").is_err());
        assert!(container_path("/workspace", "").is_err());
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_write_chunk_fits_single_argument() {
        let encoded_len = WRITE_CHUNK.div_ceil(3) * 4;
        assert!(encoded_len < 128 * 1024);
    }
}
