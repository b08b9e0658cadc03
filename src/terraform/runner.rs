use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use crate::cloud::ProviderError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Runs one Terraform sub-command in a working directory.
#[async_trait]
pub trait TerraformRunner: Send + Sync {
    async fn run(&self, workdir: &Path, args: &[&str]) -> Result<CommandOutput, ProviderError>;
}

/// Shells out to the `terraform` binary.
pub struct CliRunner {
    binary: PathBuf,
}

impl CliRunner {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl TerraformRunner for CliRunner {
    async fn run(&self, workdir: &Path, args: &[&str]) -> Result<CommandOutput, ProviderError> {
        tracing::debug!("terraform {} (in {})", args.join(" "), workdir.display());

        let output = Command::new(&self.binary)
            .args(args)
            .current_dir(workdir)
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                ProviderError::Permanent(format!(
                    "Failed to run {}: {e}",
                    self.binary.display()
                ))
            })?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

const TRANSIENT_MARKERS: [&str; 7] = [
    "throttl",
    "rate exceeded",
    "toomanyrequests",
    "timeout",
    "connection reset",
    "temporarily unavailable",
    "error acquiring the state lock",
];

/// Classify a failed command by what it printed.
pub fn classify_failure(stage: &str, output: &CommandOutput) -> ProviderError {
    let text = output.combined();
    let lower = text.to_lowercase();
    let message = format!(
        "terraform {stage} exited with {}: {}",
        output.exit_code,
        text.trim().chars().take(2000).collect::<String>()
    );
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        ProviderError::Retryable(message)
    } else {
        ProviderError::Permanent(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(stderr: &str) -> CommandOutput {
        CommandOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn throttling_is_retryable() {
        let e = classify_failure("apply", &failed("Error: Throttling: Rate exceeded"));
        assert!(e.is_retryable());
    }

    #[test]
    fn config_errors_are_permanent() {
        let e = classify_failure("plan", &failed("Error: Unsupported argument"));
        assert!(!e.is_retryable());
        assert!(e.message().contains("terraform plan exited with 1"));
    }

    #[tokio::test]
    async fn missing_binary_is_permanent() {
        let runner = CliRunner::new("/nonexistent/terraform-binary");
        let err = runner
            .run(&std::env::temp_dir(), &["version"])
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
