use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use autoship_common::ExecutionMode;
use serde::Deserialize;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "autoship.toml";

/// Service-wide configuration.
///
/// Loaded once at start-up from `autoship.toml` (every section optional),
/// then overridden from the environment.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub session: SessionSettings,
    pub sandbox: SandboxConfig,
    pub provider: ProviderConfig,
    pub hosting: HostingConfig,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// How long a finished session (and its event buffer) stays around
    /// for late subscribers.
    pub retention_secs: u64,
    pub default_test_timeout_secs: u64,
    pub analysis_timeout_secs: u64,
    pub provision_timeout_secs: u64,
    pub generation_timeout_secs: u64,
    pub publish_timeout_secs: u64,
    pub default_execution_mode: ExecutionMode,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            retention_secs: 600,
            default_test_timeout_secs: 300,
            analysis_timeout_secs: 120,
            provision_timeout_secs: 300,
            generation_timeout_secs: 300,
            publish_timeout_secs: 120,
            default_execution_mode: ExecutionMode::Auto,
        }
    }
}

impl SessionSettings {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Configuration for the remote (container) sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub image: String,
    pub memory: String,
    pub cpus: f64,
    pub workdir: String,
    pub env: HashMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "buildpack-deps:bookworm".to_string(),
            memory: "4g".to_string(),
            cpus: 2.0,
            workdir: "/workspace".to_string(),
            env: HashMap::new(),
        }
    }
}

impl SandboxConfig {
    /// Memory limit in bytes, parsed from strings such as `512m` or `4g`.
    pub fn memory_bytes(&self) -> Option<i64> {
        parse_memory(&self.memory)
    }
}

/// Configuration for the OpenAI-compatible generation provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_context_files: usize,
    pub max_context_bytes: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4".to_string(),
            max_tokens: 4000,
            temperature: 0.1,
            max_context_files: 5,
            max_context_bytes: 8192,
        }
    }
}

/// Configuration for the hosting service client.
#[derive(Debug, Clone)]
pub struct HostingConfig {
    pub api_base_url: String,
    pub user_agent: String,
    /// `Name <email>` used for commits; the token's user when unset.
    pub commit_author: Option<String>,
}

impl Default for HostingConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.github.com".to_string(),
            user_agent: "autoship".to_string(),
            commit_author: None,
        }
    }
}

/// Raw TOML structure for `autoship.toml`
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    session: Option<SessionSection>,
    sandbox: Option<SandboxSection>,
    provider: Option<ProviderSection>,
    hosting: Option<HostingSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SessionSection {
    retention_secs: Option<u64>,
    default_test_timeout_secs: Option<u64>,
    analysis_timeout_secs: Option<u64>,
    provision_timeout_secs: Option<u64>,
    generation_timeout_secs: Option<u64>,
    publish_timeout_secs: Option<u64>,
    default_execution_mode: Option<ExecutionMode>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SandboxSection {
    image: Option<String>,
    memory: Option<String>,
    cpus: Option<f64>,
    workdir: Option<String>,
    env: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProviderSection {
    base_url: Option<String>,
    model: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    max_context_files: Option<usize>,
    max_context_bytes: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HostingSection {
    api_base_url: Option<String>,
    user_agent: Option<String>,
    commit_author: Option<String>,
}

impl AppConfig {
    /// Load configuration from `path`, or from `autoship.toml` in the
    /// current directory when no path is given. A missing default file
    /// yields defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(&default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let toml: ConfigToml = toml::from_str(content)?;
        let mut config = Self::default();

        if let Some(section) = toml.session {
            let s = &mut config.session;
            if let Some(v) = section.retention_secs {
                s.retention_secs = v;
            }
            if let Some(v) = section.default_test_timeout_secs {
                s.default_test_timeout_secs = v;
            }
            if let Some(v) = section.analysis_timeout_secs {
                s.analysis_timeout_secs = v;
            }
            if let Some(v) = section.provision_timeout_secs {
                s.provision_timeout_secs = v;
            }
            if let Some(v) = section.generation_timeout_secs {
                s.generation_timeout_secs = v;
            }
            if let Some(v) = section.publish_timeout_secs {
                s.publish_timeout_secs = v;
            }
            if let Some(v) = section.default_execution_mode {
                s.default_execution_mode = v;
            }
        }

        if let Some(section) = toml.sandbox {
            let s = &mut config.sandbox;
            if let Some(image) = section.image {
                s.image = image;
            }
            if let Some(memory) = section.memory {
                s.memory = memory;
            }
            if let Some(cpus) = section.cpus {
                s.cpus = cpus;
            }
            if let Some(workdir) = section.workdir {
                s.workdir = workdir;
            }
            if let Some(env) = section.env {
                s.env = env;
            }
        }

        if let Some(section) = toml.provider {
            let p = &mut config.provider;
            if let Some(v) = section.base_url {
                p.base_url = v;
            }
            if let Some(v) = section.model {
                p.model = v;
            }
            if let Some(v) = section.max_tokens {
                p.max_tokens = v;
            }
            if let Some(v) = section.temperature {
                p.temperature = v;
            }
            if let Some(v) = section.max_context_files {
                p.max_context_files = v;
            }
            if let Some(v) = section.max_context_bytes {
                p.max_context_bytes = v;
            }
        }

        if let Some(section) = toml.hosting {
            let h = &mut config.hosting;
            if let Some(v) = section.api_base_url {
                h.api_base_url = v;
            }
            if let Some(v) = section.user_agent {
                h.user_agent = v;
            }
            if section.commit_author.is_some() {
                h.commit_author = section.commit_author;
            }
        }

        Ok(config)
    }

    /// Apply environment overrides. `lookup` is injectable for tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(image) = lookup("AUTOSHIP_SANDBOX_IMAGE") {
            self.sandbox.image = image;
        }
        if let Some(mode) = lookup("AUTOSHIP_EXECUTION_MODE").and_then(|m| m.parse().ok()) {
            self.session.default_execution_mode = mode;
        }
        if let Some(url) = lookup("OPENAI_BASE_URL") {
            self.provider.base_url = url;
        }
        if let Some(model) = lookup("OPENAI_MODEL") {
            self.provider.model = model;
        }
        if let Some(tokens) = lookup("OPENAI_MAX_TOKENS").and_then(|t| t.parse().ok()) {
            self.provider.max_tokens = tokens;
        }
        if let Some(temp) = lookup("OPENAI_TEMPERATURE").and_then(|t| t.parse().ok()) {
            self.provider.temperature = temp;
        }
        if let Some(url) = lookup("GITHUB_API_URL") {
            self.hosting.api_base_url = url;
        }
    }

    /// Reject values that would make every session fail.
    pub fn validate(&self) -> Result<()> {
        let s = &self.session;
        for (name, value) in [
            ("session.default_test_timeout_secs", s.default_test_timeout_secs),
            ("session.analysis_timeout_secs", s.analysis_timeout_secs),
            ("session.provision_timeout_secs", s.provision_timeout_secs),
            ("session.generation_timeout_secs", s.generation_timeout_secs),
            ("session.publish_timeout_secs", s.publish_timeout_secs),
        ] {
            if value == 0 {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }
        if self.sandbox.memory_bytes().is_none() {
            anyhow::bail!("sandbox.memory '{}' is not a valid size", self.sandbox.memory);
        }
        if self.sandbox.cpus <= 0.0 {
            anyhow::bail!("sandbox.cpus must be positive");
        }
        if !(0.0..=2.0).contains(&self.provider.temperature) {
            anyhow::bail!("provider.temperature must be between 0.0 and 2.0");
        }
        Ok(())
    }
}

/// Parse a Docker-style memory size (`512m`, `4g`, `1024k`, `2048`).
pub fn parse_memory(value: &str) -> Option<i64> {
    let value = value.trim().to_ascii_lowercase();
    let (digits, multiplier) = match value.chars().last()? {
        'k' => (&value[..value.len() - 1], 1024),
        'm' => (&value[..value.len() - 1], 1024 * 1024),
        'g' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        c if c.is_ascii_digit() => (value.as_str(), 1),
        _ => return None,
    };
    let n: i64 = digits.parse().ok()?;
    if n <= 0 {
        return None;
    }
    n.checked_mul(multiplier)
}
