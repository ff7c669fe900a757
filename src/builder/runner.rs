//! Command execution abstraction
//!
//! Build and cleanup commands go through [`CommandRunner`] so the stage
//! driver can be exercised without spawning processes.

use crate::error::{BuildError, BuildResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// One shell command to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Command line, interpreted by the shell
    pub command: String,
    /// Working directory
    pub cwd: PathBuf,
    /// Variables added to the inherited environment
    pub env: BTreeMap<String, String>,
}

/// Runs build commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion; a non-zero exit is an error
    async fn run(&self, spec: &CommandSpec) -> BuildResult<()>;
}

/// Runs commands on the host through a shell
#[derive(Debug, Clone)]
pub struct HostRunner {
    shell: String,
}

impl HostRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for HostRunner {
    fn default() -> Self {
        Self::new("/bin/sh")
    }
}

#[async_trait]
impl CommandRunner for HostRunner {
    async fn run(&self, spec: &CommandSpec) -> BuildResult<()> {
        debug!("Running in {}: {}", spec.cwd.display(), spec.command);

        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BuildError::command_failed(&spec.command, e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!("{}", stdout.trim_end());
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                warn!("{}", stderr.trim_end());
            }
            return Err(BuildError::CommandExecution {
                command: spec.command.clone(),
                code: output.status.code().unwrap_or(-1),
            });
        }

        Ok(())
    }
}
