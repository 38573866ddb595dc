use autoship_common::{ProgressEvent, SessionSnapshot, SessionState, TestOutcome};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::ui::icons::{BOX, BRANCH, CHECK, CROSS, FILE_MOD, ROCKET, SEARCH, SPARKLE, TEST, THINK, WARN};

/// How progress is shown on the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiMode {
    /// Progress bar plus one line per event.
    Full,
    /// One JSON object per event on stdout.
    Json,
}

impl std::str::FromStr for UiMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "json" => Ok(Self::Json),
            other => Err(format!("Invalid UI mode '{}': expected full or json", other)),
        }
    }
}

/// Terminal renderer for one session's progress events.
///
/// In `Full` mode a single percent bar tracks the session and each event
/// is printed above it. In `Json` mode events are written verbatim.
pub struct SessionUI {
    mode: UiMode,
    bar: Option<ProgressBar>,
}

impl SessionUI {
    pub fn new(mode: UiMode) -> Self {
        let bar = match mode {
            UiMode::Full => {
                let bar = ProgressBar::new(100);
                // Static template; parsing cannot fail.
                if let Ok(bar_style) = ProgressStyle::default_bar()
                    .template("{spinner} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
                {
                    bar.set_style(bar_style.progress_chars("█▓▒░"));
                }
                bar.enable_steady_tick(Duration::from_millis(120));
                Some(bar)
            }
            UiMode::Json => None,
        };
        Self { mode, bar }
    }

    fn print_line(&self, msg: impl AsRef<str>) {
        match &self.bar {
            Some(bar) => bar.println(msg.as_ref()),
            None => eprintln!("{}", msg.as_ref()),
        }
    }

    pub fn show_event(&self, event: &ProgressEvent) {
        if self.mode == UiMode::Json {
            match serde_json::to_string(event) {
                Ok(line) => println!("{}", line),
                Err(e) => eprintln!("[autoship] could not serialise event: {}", e),
            }
            return;
        }
        let icon = match (event.state, event.phase.as_str()) {
            (SessionState::Failed, _) => CROSS,
            (SessionState::Succeeded, _) => CHECK,
            (_, autoship_common::PROVISIONING_PHASE) => WARN,
            (SessionState::Created, _) => BOX,
            (SessionState::Analyzing, _) => SEARCH,
            (SessionState::Generating, _) => THINK,
            (SessionState::Applying, _) => FILE_MOD,
            (SessionState::Testing, _) => TEST,
            (SessionState::Deploying, _) => ROCKET,
        };
        let message = match event.state {
            SessionState::Failed => style(&event.message).red().to_string(),
            SessionState::Succeeded => style(&event.message).green().bold().to_string(),
            _ => event.message.clone(),
        };
        self.print_line(format!(
            "{} {} {}{}",
            style(format!("#{:<3}", event.sequence)).dim(),
            style(format!("{:<10}", event.state)).cyan(),
            icon,
            message
        ));
        if let Some(bar) = &self.bar {
            bar.set_position(u64::from(event.percent));
            bar.set_message(event.state.to_string());
        }
    }

    pub fn finish(&self, snapshot: &SessionSnapshot) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
        if self.mode == UiMode::Json {
            return;
        }
        println!();
        println!(
            "{} {}",
            SPARKLE,
            style(format!("Session {}", snapshot.id)).bold()
        );
        if let Some(backing) = snapshot.backing {
            println!("  workspace: {}", backing);
        }
        if !snapshot.changed_files.is_empty() {
            println!("  changed:");
            for path in &snapshot.changed_files {
                println!("    {} {}", FILE_MOD, style(path).yellow());
            }
        }
        match &snapshot.test_outcome {
            Some(TestOutcome::Skipped) => println!("  tests: {}", style("skipped").dim()),
            Some(TestOutcome::Ran(result)) if result.passed => {
                println!("  tests: {} ({})", style("passed").green(), result.summary)
            }
            Some(TestOutcome::Ran(result)) => {
                println!("  tests: {} ({})", style("failed").red(), result.summary)
            }
            None => {}
        }
        if let Some(branch) = &snapshot.branch_name {
            println!(
                "  branch: {}{} @ {}",
                BRANCH,
                style(branch).green().bold(),
                snapshot.commit_ref.as_deref().unwrap_or("?")
            );
        }
        if let Some(error) = &snapshot.error {
            println!("  error: {}", style(error).red());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ui_mode_parse() {
        assert_eq!("full".parse::<UiMode>().unwrap(), UiMode::Full);
        assert_eq!("json".parse::<UiMode>().unwrap(), UiMode::Json);
        assert!("tui".parse::<UiMode>().is_err());
    }
}
