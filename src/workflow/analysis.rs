//! Repository analysis: what is in the workspace, summarised for the
//! generation prompt.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::sandbox::Workspace;
use crate::config::ProviderConfig;
use crate::errors::SandboxError;
use crate::util::truncate;

const MAX_MAIN_FILES: usize = 10;

/// Tracked and untracked-but-not-ignored files inside a git checkout,
/// otherwise every regular file outside `.git`.
const LIST_FILES: &str = "if git rev-parse --is-inside-work-tree >/dev/null 2>&1; then \
     git ls-files --cached --others --exclude-standard; \
     else find . -type f -not -path './.git/*' | sed 's|^\\./||'; fi";

const LANGUAGES: &[(&str, &str)] = &[
    ("py", "Python"),
    ("js", "JavaScript"),
    ("ts", "TypeScript"),
    ("java", "Java"),
    ("cpp", "C++"),
    ("c", "C"),
    ("go", "Go"),
    ("rs", "Rust"),
];

fn language_of(path: &str) -> Option<&'static str> {
    let ext = path.rsplit_once('.')?.1;
    LANGUAGES
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, lang)| *lang)
}

/// How much file content to attach as prompt context.
#[derive(Debug, Clone, Copy)]
pub struct ContextLimits {
    pub max_files: usize,
    pub max_bytes: usize,
}

impl From<&ProviderConfig> for ContextLimits {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            max_files: config.max_context_files,
            max_bytes: config.max_context_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextFile {
    pub path: String,
    pub content: String,
    pub truncated: bool,
}

/// Structural summary handed to the generation provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositorySummary {
    pub total_files: usize,
    pub code_files: usize,
    pub languages: Vec<String>,
    pub main_files: Vec<String>,
    pub context: Vec<ContextFile>,
}

impl RepositorySummary {
    pub fn structure(&self) -> String {
        format!(
            "Repository with {} files ({} code files)",
            self.total_files, self.code_files
        )
    }

    /// Prompt-ready rendering.
    pub fn render(&self) -> String {
        let mut out = String::from("Codebase Examination:\n");
        out.push_str(&format!("- Structure: {}\n", self.structure()));
        out.push_str(&format!(
            "- Languages: {}\n",
            if self.languages.is_empty() {
                "unknown".to_string()
            } else {
                self.languages.join(", ")
            }
        ));
        out.push_str(&format!("- Main files: {}\n", self.main_files.join(", ")));
        for file in &self.context {
            out.push_str(&format!("\n--- {} ---\n{}", file.path, file.content));
            if file.truncated {
                out.push_str("\n[... truncated]");
            }
            out.push('\n');
        }
        out
    }
}

/// Order code files so that shallow paths come first.
fn pick_main_files(files: &[String]) -> Vec<String> {
    let mut code: Vec<&String> = files.iter().filter(|f| language_of(f).is_some()).collect();
    code.sort_by(|a, b| (a.matches('/').count(), a).cmp(&(b.matches('/').count(), b)));
    code.into_iter().take(MAX_MAIN_FILES).cloned().collect()
}

/// Summarise the workspace. Listing failures surface as `SandboxError`
/// so the caller can keep timeouts distinct.
pub async fn analyze(
    workspace: &Workspace,
    limits: ContextLimits,
    timeout: Duration,
) -> Result<RepositorySummary, SandboxError> {
    let listing = workspace.run(LIST_FILES, timeout).await?;
    if !listing.success() {
        return Err(SandboxError::Exec(format!(
            "file listing failed (exit {}): {}",
            listing.exit_code,
            listing.stderr.trim()
        )));
    }
    let files: Vec<String> = listing
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();

    let languages: BTreeSet<&str> = files.iter().filter_map(|f| language_of(f)).collect();
    let code_files = files.iter().filter(|f| language_of(f).is_some()).count();
    let main_files = pick_main_files(&files);

    let mut context = Vec::new();
    for path in main_files.iter().take(limits.max_files) {
        let bytes = match workspace.read_file(path).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => continue,
            Err(SandboxError::Escape { .. }) => {
                tracing::warn!(path = %path, "skipping file that links outside the workspace");
                continue;
            }
            Err(e) => return Err(e),
        };
        let text = String::from_utf8_lossy(&bytes);
        let kept = truncate(&text, limits.max_bytes);
        context.push(ContextFile {
            path: path.clone(),
            truncated: kept.len() < text.len(),
            content: kept.to_string(),
        });
    }

    let summary = RepositorySummary {
        total_files: files.len(),
        code_files,
        languages: languages.into_iter().map(str::to_string).collect(),
        main_files,
        context,
    };
    tracing::info!(
        files = summary.total_files,
        code_files = summary.code_files,
        languages = %summary.languages.join(","),
        "repository analysed"
    );
    Ok(summary)
}
