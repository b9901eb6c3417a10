//! Navigation launchers: hand a deep link to whatever opens maps on this machine.
//! Launching never waits for the navigation app.

use std::sync::Arc;

use spot_core::{HandoffError, NavigationRequest};
use tracing::{debug, info};

pub trait NavigationLauncher: Send + Sync {
    fn launch(&self, request: &NavigationRequest) -> Result<(), HandoffError>;
}

/// `CommandLauncher` for a configured command line, `LogLauncher` otherwise.
pub fn from_command(command: Option<&str>) -> Arc<dyn NavigationLauncher> {
    match command.and_then(CommandLauncher::parse) {
        Some(command) => Arc::new(command),
        None => Arc::new(LogLauncher),
    }
}

/// Only logs the link. Used when no command is configured.
pub struct LogLauncher;

impl NavigationLauncher for LogLauncher {
    fn launch(&self, request: &NavigationRequest) -> Result<(), HandoffError> {
        info!(
            spot_id = request.spot_id,
            platform = %request.platform,
            link = %request.deep_link(),
            "navigate to spot"
        );
        Ok(())
    }
}

/// Spawns an external program with the link, e.g. `xdg-open {link}`.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
}

impl CommandLauncher {
    /// Split a command line on whitespace. `{link}` in an argument is replaced with the
    /// deep link; without a placeholder the link is appended.
    pub fn parse(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    fn args_for(&self, link: &str) -> Vec<String> {
        let mut substituted = false;
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|a| {
                if a.contains("{link}") {
                    substituted = true;
                    a.replace("{link}", link)
                } else {
                    a.clone()
                }
            })
            .collect();
        if !substituted {
            args.push(link.to_string());
        }
        args
    }
}

impl NavigationLauncher for CommandLauncher {
    fn launch(&self, request: &NavigationRequest) -> Result<(), HandoffError> {
        let link = request.deep_link();
        let args = self.args_for(&link);
        debug!(program = %self.program, ?args, "launching navigation");
        tokio::process::Command::new(&self.program)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map(|_child| ())
            .map_err(|e| HandoffError::LaunchFailed(format!("{}: {e}", self.program)))
    }
}
