//! One-shot external commands (audio routing control surface)
//!
//! Routing commands are soft failures: [`run_soft`] logs the original error
//! and hands back `None`, so callers decide whether a missing result matters.

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

/// External command errors
#[derive(Debug, Error)]
pub enum CommandError {
    /// Program could not be executed at all
    #[error("Failed to execute \"{command}\": {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Program ran and exited unsuccessfully
    #[error("Command \"{command}\" failed ({status}): {output}")]
    Failed {
        command: String,
        status: String,
        output: String,
    },
}

/// A program plus its arguments, passed without a shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Runs a command to completion and returns its trimmed output
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &CommandLine) -> Result<String, CommandError>;
}

/// Runs commands on the host via `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, command: &CommandLine) -> Result<String, CommandError> {
        debug!(command = %command, "Running command");

        let output = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .output()
            .await
            .map_err(|source| CommandError::Spawn {
                command: command.to_string(),
                source,
            })?;

        // stderr is appended so failures carry the tool's own message
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let text = text.trim().to_string();

        if !output.status.success() {
            return Err(CommandError::Failed {
                command: command.to_string(),
                status: output.status.to_string(),
                output: text,
            });
        }

        Ok(text)
    }
}

/// Run a command, logging and swallowing any failure
pub async fn run_soft<R>(runner: &R, command: &CommandLine) -> Option<String>
where
    R: CommandRunner + ?Sized,
{
    match runner.run(command).await {
        Ok(output) => Some(output),
        Err(e) => {
            warn!("{}", e);
            None
        }
    }
}
