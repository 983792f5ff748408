use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::Command;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub name: String,
}

impl SessionHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn attach_hint(&self) -> String {
        format!("tmux attach -t {}", self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    Launched,
    AlreadyExists,
}

/// Seam over the terminal multiplexer so the supervisor's collision handling
/// is testable without a live tmux server.
pub trait SessionMultiplexer {
    fn exists(&self, session: &SessionHandle) -> Result<bool>;
    fn launch(&self, session: &SessionHandle, script: &Path) -> Result<LaunchOutcome>;
}

pub struct TmuxMultiplexer;

impl SessionMultiplexer for TmuxMultiplexer {
    fn exists(&self, session: &SessionHandle) -> Result<bool> {
        let status = Command::new("tmux")
            .args(["has-session", "-t", &session.name])
            .output()
            .context("failed to invoke tmux has-session")?;
        Ok(status.status.success())
    }

    fn launch(&self, session: &SessionHandle, script: &Path) -> Result<LaunchOutcome> {
        if self.exists(session)? {
            return Ok(LaunchOutcome::AlreadyExists);
        }
        let output = Command::new("tmux")
            .args(["new-session", "-d", "-s", &session.name])
            .arg(script)
            .output()
            .context("failed to invoke tmux new-session")?;
        if !output.status.success() {
            bail!(
                "tmux new-session failed for {}: {}",
                session.name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        info!(session = %session.name, "detached training session started");
        Ok(LaunchOutcome::Launched)
    }
}
