//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `run`    | `Run`            |
//! | `repos`  | `Repos`          |
//! | `config` | `Config`         |

pub mod config;
pub mod repos;
pub mod run;

pub use config::cmd_config;
pub use repos::cmd_repos;
pub use run::{RunArgs, cmd_run};

use anyhow::{Context, Result};
use secrecy::SecretString;

pub const HOSTING_TOKEN_ENV: &str = "GITHUB_TOKEN";
pub const GENERATION_KEY_ENV: &str = "OPENAI_API_KEY";

/// Read a credential from the environment (or `.env`). The value is
/// wrapped immediately and never echoed.
pub fn read_secret(var: &str) -> Result<SecretString> {
    let value = std::env::var(var).with_context(|| format!("{} is not set", var))?;
    if value.trim().is_empty() {
        anyhow::bail!("{} is empty", var);
    }
    Ok(SecretString::from(value.trim().to_string()))
}
