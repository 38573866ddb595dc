//! Repository listing (`autoship repos`).

use anyhow::{Context, Result};
use console::style;

use autoship::config::AppConfig;
use autoship::workflow::{GitHubHosting, HostingService};

use super::{HOSTING_TOKEN_ENV, read_secret};

pub async fn cmd_repos(config: &AppConfig, json: bool) -> Result<()> {
    let token = read_secret(HOSTING_TOKEN_ENV)?;
    let hosting = GitHubHosting::new(&config.hosting);
    let repos = hosting
        .list_repositories(&token)
        .await
        .context("Failed to list repositories")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&repos)?);
        return Ok(());
    }

    if repos.is_empty() {
        println!("No repositories found.");
        return Ok(());
    }
    for repo in &repos {
        println!(
            "{:<40} {:<12} {}",
            style(repo.full_name()).bold(),
            style(repo.language.as_deref().unwrap_or("-")).cyan(),
            style(repo.description.as_deref().unwrap_or("")).dim()
        );
    }
    println!();
    println!("{} repositories", repos.len());
    Ok(())
}
