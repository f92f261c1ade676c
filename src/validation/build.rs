// Build stage: run configured build commands through a shell

use std::path::Path;
use std::time::{Duration, Instant};
use tokio::process::Command;

use crate::error::Result;
use crate::validation::report::BuildOutcome;
use crate::validation::tail;

pub struct BuildRunner {
    timeout: Duration,
}

impl BuildRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run each command in order, stopping at the first failure. A failed
    /// build makes the remaining steps meaningless.
    pub async fn run_all(&self, working_dir: &Path, commands: &[String]) -> Result<Vec<BuildOutcome>> {
        let mut outcomes = Vec::new();
        for command in commands {
            let outcome = self.run_one(working_dir, command).await?;
            let passed = outcome.passed;
            outcomes.push(outcome);
            if !passed {
                log::warn!("[BuildRunner] Build failed, skipping remaining steps: {}", command);
                break;
            }
        }
        Ok(outcomes)
    }

    async fn run_one(&self, working_dir: &Path, command: &str) -> Result<BuildOutcome> {
        log::info!("[BuildRunner] Running: {}", command);
        let started = Instant::now();

        let result = tokio::time::timeout(
            self.timeout,
            Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(working_dir)
                .output(),
        )
        .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(Ok(output)) => {
                let passed = output.status.success();
                let combined = format!(
                    "{}{}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                );
                Ok(BuildOutcome {
                    command: command.to_string(),
                    passed,
                    duration_ms,
                    output_tail: tail(&combined, 40),
                })
            }
            Ok(Err(e)) => Ok(BuildOutcome {
                command: command.to_string(),
                passed: false,
                duration_ms,
                output_tail: format!("failed to spawn: {}", e),
            }),
            Err(_) => Ok(BuildOutcome {
                command: command.to_string(),
                passed: false,
                duration_ms,
                output_tail: format!("timed out after {}ms", self.timeout.as_millis()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_passing_build() {
        let temp = TempDir::new().unwrap();
        let runner = BuildRunner::new(Duration::from_secs(10));

        let outcomes = runner
            .run_all(temp.path(), &["true".to_string()])
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].passed);
    }

    #[tokio::test]
    async fn test_failing_build_stops_pipeline() {
        let temp = TempDir::new().unwrap();
        let runner = BuildRunner::new(Duration::from_secs(10));

        let commands = vec![
            "echo first".to_string(),
            "false".to_string(),
            "echo never-runs".to_string(),
        ];
        let outcomes = runner.run_all(temp.path(), &commands).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].passed);
        assert!(!outcomes[1].passed);
    }

    #[tokio::test]
    async fn test_build_captures_output_tail() {
        let temp = TempDir::new().unwrap();
        let runner = BuildRunner::new(Duration::from_secs(10));

        let outcomes = runner
            .run_all(temp.path(), &["echo compile error >&2; false".to_string()])
            .await
            .unwrap();
        assert!(!outcomes[0].passed);
        assert!(outcomes[0].output_tail.contains("compile error"));
    }

    #[tokio::test]
    async fn test_build_timeout() {
        let temp = TempDir::new().unwrap();
        let runner = BuildRunner::new(Duration::from_millis(100));

        let outcomes = runner
            .run_all(temp.path(), &["sleep 5".to_string()])
            .await
            .unwrap();
        assert!(!outcomes[0].passed);
        assert!(outcomes[0].output_tail.contains("timed out"));
    }
}
