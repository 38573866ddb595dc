//! Configuration view and validation commands (`autoship config`).

use std::path::Path;

use anyhow::Result;
use console::style;

use autoship::config::{AppConfig, DEFAULT_CONFIG_FILE};

use super::super::ConfigCommands;

pub fn cmd_config(path: Option<&Path>, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let source = match path {
                Some(path) => path.display().to_string(),
                None if Path::new(DEFAULT_CONFIG_FILE).exists() => DEFAULT_CONFIG_FILE.to_string(),
                None => "(defaults)".to_string(),
            };
            let config = AppConfig::load(path)?;

            println!();
            println!("{}", style("Autoship Configuration").bold().cyan());
            println!("======================");
            println!("Source: {}", source);
            println!();

            let s = &config.session;
            println!("[session]");
            println!("  retention_secs = {}", s.retention_secs);
            println!("  default_test_timeout_secs = {}", s.default_test_timeout_secs);
            println!("  analysis_timeout_secs = {}", s.analysis_timeout_secs);
            println!("  provision_timeout_secs = {}", s.provision_timeout_secs);
            println!("  generation_timeout_secs = {}", s.generation_timeout_secs);
            println!("  publish_timeout_secs = {}", s.publish_timeout_secs);
            println!("  default_execution_mode = \"{}\"", s.default_execution_mode);
            println!();

            let sb = &config.sandbox;
            println!("[sandbox]");
            println!("  image = \"{}\"", sb.image);
            println!("  memory = \"{}\"", sb.memory);
            println!("  cpus = {}", sb.cpus);
            println!("  workdir = \"{}\"", sb.workdir);
            let mut env: Vec<_> = sb.env.keys().collect();
            env.sort();
            if !env.is_empty() {
                println!("  env = [{}]", env.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", "));
            }
            println!();

            let p = &config.provider;
            println!("[provider]");
            println!("  base_url = \"{}\"", p.base_url);
            println!("  model = \"{}\"", p.model);
            println!("  max_tokens = {}", p.max_tokens);
            println!("  temperature = {}", p.temperature);
            println!("  max_context_files = {}", p.max_context_files);
            println!("  max_context_bytes = {}", p.max_context_bytes);
            println!();

            let h = &config.hosting;
            println!("[hosting]");
            println!("  api_base_url = \"{}\"", h.api_base_url);
            println!("  user_agent = \"{}\"", h.user_agent);
            if let Some(author) = &h.commit_author {
                println!("  commit_author = \"{}\"", author);
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            AppConfig::load(path)?;
            println!("{} Configuration is valid", style("OK").green().bold());
        }
    }
    Ok(())
}
