// Validation report assembly and rendering

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Outcome of a single build command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOutcome {
    pub command: String,
    pub passed: bool,
    pub duration_ms: u64,
    /// Trailing output, kept short enough to embed in a report.
    pub output_tail: String,
}

/// Parsed counts from a test runner's summary line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCounts {
    pub passed: u32,
    pub failed: u32,
    pub total: u32,
    pub skipped: u32,
}

/// Outcome of a single test command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestOutcome {
    pub command: String,
    pub passed: bool,
    pub counts: TestCounts,
    pub duration_ms: u64,
    pub output_tail: String,
    /// Lines from the runner output that mention a failure, error, or
    /// panic. Capped, and may predate the tail window.
    #[serde(default)]
    pub failure_lines: Vec<String>,
}

/// Outcome of a single smoke probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmokeOutcome {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

/// Full validation report for one work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub item_id: String,
    pub generated_at: i64,
    pub builds: Vec<BuildOutcome>,
    pub tests: Vec<TestOutcome>,
    /// None when no smoke stage was configured.
    pub smoke: Option<Vec<SmokeOutcome>>,
}

impl ValidationReport {
    pub fn new(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            generated_at: Utc::now().timestamp_millis(),
            builds: Vec::new(),
            tests: Vec::new(),
            smoke: None,
        }
    }

    /// Overall success: every build, every test run, and (when run) every
    /// smoke probe passed. An empty report passes vacuously.
    pub fn passed(&self) -> bool {
        self.builds.iter().all(|b| b.passed)
            && self.tests.iter().all(|t| t.passed)
            && self
                .smoke
                .as_ref()
                .map(|s| s.iter().all(|p| p.passed))
                .unwrap_or(true)
    }

    /// One-line summary, e.g.
    /// `Validation PASSED | Builds: 2/2 | Tests: 1/1 | Smoke: 3/3`.
    /// The smoke segment is omitted when no smoke stage ran.
    pub fn summary_line(&self) -> String {
        let verdict = if self.passed() { "PASSED" } else { "FAILED" };
        let builds_ok = self.builds.iter().filter(|b| b.passed).count();
        let tests_ok = self.tests.iter().filter(|t| t.passed).count();
        let mut line = format!(
            "Validation {} | Builds: {}/{} | Tests: {}/{}",
            verdict,
            builds_ok,
            self.builds.len(),
            tests_ok,
            self.tests.len()
        );
        if let Some(smoke) = &self.smoke {
            let smoke_ok = smoke.iter().filter(|p| p.passed).count();
            line.push_str(&format!(" | Smoke: {}/{}", smoke_ok, smoke.len()));
        }
        line
    }

    /// Render the report as markdown for persistence alongside run state.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# Validation Report: {}\n\n", self.item_id));
        out.push_str(&format!("{}\n\n", self.summary_line()));

        if !self.builds.is_empty() {
            out.push_str("## Builds\n\n");
            for build in &self.builds {
                out.push_str(&format!(
                    "- {} `{}` ({}ms)\n",
                    mark(build.passed),
                    build.command,
                    build.duration_ms
                ));
                if !build.passed && !build.output_tail.is_empty() {
                    out.push_str(&format!("\n```\n{}\n```\n", build.output_tail.trim_end()));
                }
            }
            out.push('\n');
        }

        if !self.tests.is_empty() {
            out.push_str("## Tests\n\n");
            for test in &self.tests {
                out.push_str(&format!(
                    "- {} `{}`: {} passed, {} failed, {} total ({}ms)\n",
                    mark(test.passed),
                    test.command,
                    test.counts.passed,
                    test.counts.failed,
                    test.counts.total,
                    test.duration_ms
                ));
                if !test.passed && !test.failure_lines.is_empty() {
                    out.push_str("\n  Failures:\n");
                    for line in &test.failure_lines {
                        out.push_str(&format!("  - `{}`\n", line));
                    }
                }
                if !test.passed && !test.output_tail.is_empty() {
                    out.push_str(&format!("\n```\n{}\n```\n", test.output_tail.trim_end()));
                }
            }
            out.push('\n');
        }

        if let Some(smoke) = &self.smoke {
            out.push_str("## Smoke\n\n");
            for probe in smoke {
                out.push_str(&format!(
                    "- {} {}: {}\n",
                    mark(probe.passed),
                    probe.name,
                    probe.detail
                ));
            }
            out.push('\n');
        }

        out
    }
}

fn mark(passed: bool) -> &'static str {
    if passed {
        "PASS"
    } else {
        "FAIL"
    }
}
