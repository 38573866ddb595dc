//! Test-suite detection and execution inside a workspace.

use std::time::{Duration, Instant};

use autoship_common::TestResult;

use super::sandbox::Workspace;
use crate::errors::SandboxError;
use crate::util::{tail, truncate};

/// Raw output kept on a `TestResult`.
const MAX_RAW_OUTPUT: usize = 64 * 1024;
const MAX_SUMMARY: usize = 200;

/// npm's placeholder script for packages without tests.
const NPM_PLACEHOLDER: &str = "no test specified";

/// Prints the first pytest-style test module, if any.
const FIND_PYTHON_TESTS: &str = "find . -path ./.git -prune -o -type f \\( -name 'test_*.py' -o -name '*_test.py' -o -path './tests/*.py' \\) -print | head -n 1";
const DETECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A detected test invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCommand {
    /// Which signature matched, e.g. `cargo`.
    pub runner: &'static str,
    pub command: String,
}

impl TestCommand {
    fn new(runner: &'static str, command: &str) -> Self {
        Self {
            runner,
            command: command.to_string(),
        }
    }
}

async fn read_text(workspace: &Workspace, path: &str) -> Result<Option<String>, SandboxError> {
    Ok(workspace
        .read_file(path)
        .await?
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
}

async fn exists(workspace: &Workspace, path: &str) -> Result<bool, SandboxError> {
    workspace.exists(path).await
}

/// Plain test modules with no pytest configuration at all.
async fn has_python_tests(workspace: &Workspace) -> Result<bool, SandboxError> {
    let out = workspace.run(FIND_PYTHON_TESTS, DETECT_TIMEOUT).await?;
    Ok(out.success() && !out.stdout.trim().is_empty())
}

fn npm_has_tests(package_json: &str) -> bool {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(package_json) else {
        return false;
    };
    value
        .get("scripts")
        .and_then(|s| s.get("test"))
        .and_then(|t| t.as_str())
        .is_some_and(|script| !script.trim().is_empty() && !script.contains(NPM_PLACEHOLDER))
}

fn makefile_has_test_target(makefile: &str) -> bool {
    makefile
        .lines()
        .any(|line| line.starts_with("test:") || line.starts_with("test :"))
}

/// Find the repository's test command. The first matching signature wins;
/// `None` means no test configuration is discoverable.
pub async fn detect(workspace: &Workspace) -> Result<Option<TestCommand>, SandboxError> {
    if exists(workspace, "Cargo.toml").await? {
        return Ok(Some(TestCommand::new("cargo", "cargo test")));
    }
    if let Some(package) = read_text(workspace, "package.json").await?
        && npm_has_tests(&package)
    {
        return Ok(Some(TestCommand::new("npm", "npm test")));
    }
    let pytest = TestCommand::new("pytest", "python -m pytest --tb=short");
    for marker in ["pytest.ini", "conftest.py", "tox.ini"] {
        if exists(workspace, marker).await? {
            return Ok(Some(pytest));
        }
    }
    if let Some(pyproject) = read_text(workspace, "pyproject.toml").await?
        && pyproject.contains("[tool.pytest")
    {
        return Ok(Some(pytest));
    }
    if let Some(setup_cfg) = read_text(workspace, "setup.cfg").await?
        && setup_cfg.contains("[tool:pytest]")
    {
        return Ok(Some(pytest));
    }
    if exists(workspace, "go.mod").await? {
        return Ok(Some(TestCommand::new("go", "go test ./...")));
    }
    if let Some(makefile) = read_text(workspace, "Makefile").await?
        && makefile_has_test_target(&makefile)
    {
        return Ok(Some(TestCommand::new("make", "make test")));
    }
    if exists(workspace, "pom.xml").await? {
        return Ok(Some(TestCommand::new("maven", "mvn -q test")));
    }
    for build in ["build.gradle", "build.gradle.kts"] {
        if exists(workspace, build).await? {
            return Ok(Some(TestCommand::new("gradle", "gradle test")));
        }
    }
    if has_python_tests(workspace).await? {
        return Ok(Some(pytest));
    }
    Ok(None)
}

fn summarize(passed: bool, exit_code: i64, output: &str) -> String {
    let last = output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty());
    match (passed, last) {
        (_, Some(line)) => truncate(line, MAX_SUMMARY).to_string(),
        (true, None) => "tests passed".to_string(),
        (false, None) => format!("tests failed with exit code {}", exit_code),
    }
}

/// Run `command` and classify the exit code. A timeout is an error, never
/// a failed `TestResult`.
pub async fn execute(
    workspace: &Workspace,
    command: &TestCommand,
    timeout: Duration,
) -> Result<TestResult, SandboxError> {
    let started = Instant::now();
    tracing::info!(runner = command.runner, command = %command.command, "running tests");
    let output = workspace.run(&command.command, timeout).await?;
    let passed = output.success();
    let combined = output.combined();
    let result = TestResult {
        passed,
        summary: summarize(passed, output.exit_code, &combined),
        raw_output: tail(&combined, MAX_RAW_OUTPUT),
        command: command.command.clone(),
        exit_code: output.exit_code,
        duration_ms: started.elapsed().as_millis() as u64,
    };
    tracing::info!(passed, exit_code = output.exit_code, duration_ms = result.duration_ms, "tests finished");
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::sandbox::{LocalSandbox, RepositorySnapshot, SandboxBackend};
    use std::sync::Arc;

    async fn workspace_with(files: &[(&str, &str)]) -> (Workspace, tempfile::TempDir) {
        let src = tempfile::tempdir().unwrap();
        for (path, content) in files {
            let full = src.path().join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, content).unwrap();
        }
        let backend: Arc<dyn SandboxBackend> = Arc::new(LocalSandbox::new());
        let p = backend
            .provision(
                &RepositorySnapshot::Directory(src.path().to_path_buf()),
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        (Workspace::new(p, backend), src)
    }

    async fn detected(files: &[(&str, &str)]) -> Option<&'static str> {
        let (ws, _src) = workspace_with(files).await;
        let found = detect(&ws).await.unwrap().map(|c| c.runner);
        ws.release().await;
        found
    }

    #[tokio::test]
    async fn test_detect_signatures() {
        assert_eq!(detected(&[("Cargo.toml", "[package]\n")]).await, Some("cargo"));
        assert_eq!(
            detected(&[("package.json", r#"{"scripts":{"test":"jest"}}"#)]).await,
            Some("npm")
        );
        assert_eq!(detected(&[("conftest.py", "")]).await, Some("pytest"));
        assert_eq!(
            detected(&[("pyproject.toml", "[tool.pytest.ini_options]\n")]).await,
            Some("pytest")
        );
        assert_eq!(
            detected(&[("setup.cfg", "[tool:pytest]\ntestpaths = tests\n")]).await,
            Some("pytest")
        );
        assert_eq!(detected(&[("go.mod", "module x\n")]).await, Some("go"));
        assert_eq!(
            detected(&[("Makefile", "build:\n\tcc x.c\ntest:\n\t./run\n")]).await,
            Some("make")
        );
        assert_eq!(detected(&[("pom.xml", "<project/>\n")]).await, Some("maven"));
        assert_eq!(detected(&[("build.gradle", "plugins {}\n")]).await, Some("gradle"));
        assert_eq!(detected(&[("build.gradle.kts", "plugins {}\n")]).await, Some("gradle"));
    }

    #[tokio::test]
    async fn test_detect_unconfigured_python_test_modules() {
        assert_eq!(
            detected(&[
                ("requirements.txt", "requests\n"),
                ("tests/test_a.py", "def test_a():\n    assert 1 == 2\n"),
            ])
            .await,
            Some("pytest")
        );
        assert_eq!(
            detected(&[("pkg/util_test.py", "def test_u():\n    pass\n")]).await,
            Some("pytest")
        );
        assert_eq!(
            detected(&[("tests/helpers.py", "X = 1\n")]).await,
            Some("pytest")
        );
        assert_eq!(detected(&[("tests/README.md", "notes\n")]).await, None);
    }

    #[tokio::test]
    async fn test_detect_none_when_unconfigured() {
        assert_eq!(detected(&[("a.py", "def foo(): pass\n")]).await, None);
        assert_eq!(
            detected(&[(
                "package.json",
                r#"{"scripts":{"test":"echo \"Error: no test specified\" && exit 1"}}"#
            )])
            .await,
            None
        );
        assert_eq!(detected(&[("pyproject.toml", "[project]\nname='x'\n")]).await, None);
        assert_eq!(detected(&[("Makefile", "build:\n\tcc x.c\n")]).await, None);
        assert_eq!(detected(&[("src/contest.py", "x = 1\n")]).await, None);
    }

    #[tokio::test]
    async fn test_detect_first_match_wins() {
        let found = detected(&[("Cargo.toml", "[package]\n"), ("Makefile", "test:\n\ttrue\n")]).await;
        assert_eq!(found, Some("cargo"));
    }

    #[tokio::test]
    async fn test_execute_classifies_exit_codes() {
        let (ws, _src) = workspace_with(&[]).await;
        let pass = execute(
            &ws,
            &TestCommand::new("make", "echo '3 passed'"),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert!(pass.passed);
        assert_eq!(pass.summary, "3 passed");

        let fail = execute(
            &ws,
            &TestCommand::new("make", "echo 'ran 2'; echo '1 failed' >&2; exit 1"),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert!(!fail.passed);
        assert_eq!(fail.exit_code, 1);
        assert_eq!(fail.summary, "1 failed");
        assert!(fail.raw_output.contains("ran 2"));
        ws.release().await;
    }

    #[tokio::test]
    async fn test_execute_timeout_is_distinct_from_failure() {
        let (ws, _src) = workspace_with(&[]).await;
        let err = execute(
            &ws,
            &TestCommand::new("make", "sleep 20"),
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout { .. }));
        ws.release().await;
    }

    #[test]
    fn test_summarize_fallbacks() {
        assert_eq!(summarize(true, 0, "\n\n"), "tests passed");
        assert_eq!(summarize(false, 2, ""), "tests failed with exit code 2");
    }
}
