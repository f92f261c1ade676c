// Validation pipeline: build, test, and smoke stages for a merged work item

pub mod build;
pub mod report;
pub mod smoke;
pub mod test_runner;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;
pub use build::BuildRunner;
pub use report::{BuildOutcome, SmokeOutcome, TestCounts, TestOutcome, ValidationReport};
pub use smoke::{SmokeConfig, SmokeProbe, SmokeTester};
pub use test_runner::{parse_test_summary, TestRunner};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationConfig {
    #[serde(default)]
    pub build_commands: Vec<String>,
    #[serde(default)]
    pub test_commands: Vec<String>,
    #[serde(default)]
    pub smoke: Option<SmokeConfig>,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

fn default_command_timeout_ms() -> u64 {
    600_000
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            build_commands: Vec::new(),
            test_commands: Vec::new(),
            smoke: None,
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

/// Runs the full pipeline for one work item. Builds run first and gate the
/// rest: without a compiling tree the test and smoke stages only produce
/// noise.
pub struct Validator {
    config: ValidationConfig,
}

impl Validator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub async fn validate(&self, working_dir: &Path, item_id: &str) -> Result<ValidationReport> {
        let timeout = Duration::from_millis(self.config.command_timeout_ms);
        let mut report = ValidationReport::new(item_id);

        report.builds = BuildRunner::new(timeout)
            .run_all(working_dir, &self.config.build_commands)
            .await?;
        let builds_ok = report.builds.iter().all(|b| b.passed);

        if builds_ok {
            report.tests = TestRunner::new(timeout)
                .run_all(working_dir, &self.config.test_commands)
                .await?;

            if let Some(smoke_config) = &self.config.smoke {
                let outcomes = SmokeTester::new().run(working_dir, smoke_config).await?;
                report.smoke = Some(outcomes);
            }
        } else {
            log::warn!("[Validator] Build failed for '{}', skipping tests and smoke", item_id);
        }

        log::info!("[Validator] {}: {}", item_id, report.summary_line());
        Ok(report)
    }
}

/// Last `lines` lines of a command's output, for embedding in reports.
pub(crate) fn tail(output: &str, lines: usize) -> String {
    let all: Vec<&str> = output.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_tail_truncates() {
        let text = (0..100).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        let tailed = tail(&text, 3);
        assert_eq!(tailed, "97\n98\n99");
    }

    #[test]
    fn test_tail_short_output_unchanged() {
        assert_eq!(tail("one\ntwo", 40), "one\ntwo");
    }

    #[tokio::test]
    async fn test_full_pipeline_passes() {
        let temp = TempDir::new().unwrap();
        let validator = Validator::new(ValidationConfig {
            build_commands: vec!["true".to_string()],
            test_commands: vec!["echo 'Tests  2 passed | 2 total'".to_string()],
            smoke: None,
            command_timeout_ms: 10_000,
        });

        let report = validator.validate(temp.path(), "t1").await.unwrap();
        assert!(report.passed());
        assert_eq!(report.builds.len(), 1);
        assert_eq!(report.tests.len(), 1);
        assert!(report.smoke.is_none());
    }

    #[tokio::test]
    async fn test_build_failure_skips_tests() {
        let temp = TempDir::new().unwrap();
        let validator = Validator::new(ValidationConfig {
            build_commands: vec!["false".to_string()],
            test_commands: vec!["echo 'Tests  2 passed | 2 total'".to_string()],
            smoke: None,
            command_timeout_ms: 10_000,
        });

        let report = validator.validate(temp.path(), "t1").await.unwrap();
        assert!(!report.passed());
        assert!(report.tests.is_empty());
    }

    #[tokio::test]
    async fn test_empty_config_passes_vacuously() {
        let temp = TempDir::new().unwrap();
        let validator = Validator::new(ValidationConfig::default());

        let report = validator.validate(temp.path(), "t1").await.unwrap();
        assert!(report.passed());
    }
}
