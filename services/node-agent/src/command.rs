//! Async execution of host tools (`ip`, `systemctl`, `ipsec`).

use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Errors from running an external command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed: {stderr}")]
    Failed { command: String, stderr: String },
}

impl CommandError {
    /// Whether the tool reported that its target does not exist.
    pub fn is_missing(&self) -> bool {
        let Self::Failed { stderr, .. } = self else {
            return false;
        };
        const MISSING: [&str; 5] = [
            "Cannot find device",
            "No such file or directory",
            "does not exist",
            "not loaded",
            "Cannot open network namespace",
        ];
        MISSING.iter().any(|needle| stderr.contains(needle))
    }

    /// Whether the tool reported that its target already exists.
    pub fn is_exists(&self) -> bool {
        matches!(self, Self::Failed { stderr, .. } if stderr.contains("File exists"))
    }
}

/// Captured output of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run a command and capture its output regardless of exit status.
pub async fn output(program: &str, args: &[&str]) -> Result<CommandOutput, CommandError> {
    debug!(program, args = %args.join(" "), "Executing command");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| CommandError::Spawn {
            program: program.to_string(),
            source,
        })?;

    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Run a command, failing on non-zero exit. Returns stdout.
pub async fn run(program: &str, args: &[&str]) -> Result<String, CommandError> {
    let out = output(program, args).await?;
    if !out.success {
        return Err(CommandError::Failed {
            command: format!("{} {}", program, args.join(" ")),
            stderr: out.stderr,
        });
    }
    Ok(out.stdout)
}

/// Run `ip` with the given arguments.
pub async fn run_ip(args: &[&str]) -> Result<String, CommandError> {
    run("ip", args).await
}

/// Run a command inside a network namespace.
pub async fn run_in_namespace(
    namespace: &str,
    program: &str,
    args: &[&str],
) -> Result<String, CommandError> {
    let mut full = vec!["netns", "exec", namespace, program];
    full.extend_from_slice(args);
    run_ip(&full).await
}
