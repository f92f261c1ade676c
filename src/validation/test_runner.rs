// Test stage: run configured test commands and parse their summary lines
//
// Different test runners print their totals in different shapes:
//
//   Tests  3 passed | 1 failed | 4 total
//   Tests: 2 failed, 3 passed, 5 total
//
// Parsing is per-token rather than per-shape: any "Tests" line mentioning
// a total is scanned for `N passed`, `N failed`, `N skipped`, `N total`
// in whatever order and with whatever separators the runner chose.

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::process::Command;

use crate::error::Result;
use crate::validation::report::{TestCounts, TestOutcome};
use crate::validation::tail;

fn count_pattern(label: &str) -> Regex {
    // Static pattern, cannot fail to compile.
    Regex::new(&format!(r"(?i)(\d+)\s+{label}\b")).unwrap()
}

fn patterns() -> &'static [(Regex, fn(&mut TestCounts, u32))] {
    static PATTERNS: OnceLock<Vec<(Regex, fn(&mut TestCounts, u32))>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            vec![
                (count_pattern("passed"), |c, n| c.passed = n),
                (count_pattern("failed"), |c, n| c.failed = n),
                (count_pattern("skipped"), |c, n| c.skipped = n),
                (count_pattern("total"), |c, n| c.total = n),
            ]
        })
        .as_slice()
}

const FAILURE_LINE_CAP: usize = 20;

fn failure_line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // Static pattern, cannot fail to compile.
        Regex::new(r"(?i)\b(fail(ed|ing|ure)?|error|panic(ked)?)\b").unwrap()
    })
}

/// Collect the lines that name what went wrong, so the report stays useful
/// when the failure scrolled out of the output tail. Summary lines are
/// skipped; their counts are parsed separately.
pub fn collect_failure_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !(line.starts_with("Tests") && line.contains("total")))
        .filter(|line| failure_line_pattern().is_match(line))
        .take(FAILURE_LINE_CAP)
        .map(|line| line.to_string())
        .collect()
}

/// Parse a test runner's output into counts. Returns None when no summary
/// line is present.
pub fn parse_test_summary(output: &str) -> Option<TestCounts> {
    for line in output.lines() {
        let line = line.trim();
        if !line.starts_with("Tests") || !line.contains("total") {
            continue;
        }
        let mut counts = TestCounts::default();
        let mut matched = false;
        for (pattern, apply) in patterns() {
            if let Some(caps) = pattern.captures(line) {
                if let Ok(n) = caps[1].parse::<u32>() {
                    apply(&mut counts, n);
                    matched = true;
                }
            }
        }
        if matched {
            return Some(counts);
        }
    }
    None
}

pub struct TestRunner {
    timeout: Duration,
}

impl TestRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run each test command. Unlike builds, later commands still run after
    /// a failure so the report covers every suite.
    pub async fn run_all(&self, working_dir: &Path, commands: &[String]) -> Result<Vec<TestOutcome>> {
        let mut outcomes = Vec::new();
        for command in commands {
            outcomes.push(self.run_one(working_dir, command).await?);
        }
        Ok(outcomes)
    }

    async fn run_one(&self, working_dir: &Path, command: &str) -> Result<TestOutcome> {
        log::info!("[TestRunner] Running: {}", command);
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
        let (exit_ok, combined) = match result {
            Ok(Ok(output)) => (
                output.status.success(),
                format!(
                    "{}{}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                ),
            ),
            Ok(Err(e)) => (false, format!("failed to spawn: {}", e)),
            Err(_) => (
                false,
                format!("timed out after {}ms", self.timeout.as_millis()),
            ),
        };

        let outcome = match parse_test_summary(&combined) {
            Some(counts) => {
                let passed = counts.failed == 0 && exit_ok;
                TestOutcome {
                    command: command.to_string(),
                    passed,
                    counts,
                    duration_ms,
                    output_tail: tail(&combined, 40),
                    failure_lines: if passed {
                        Vec::new()
                    } else {
                        collect_failure_lines(&combined)
                    },
                }
            }
            None => {
                // No summary line. A failing process with nothing to parse
                // still counts as one failed test carrying the raw error.
                TestOutcome {
                    command: command.to_string(),
                    passed: exit_ok,
                    counts: TestCounts {
                        passed: 0,
                        failed: if exit_ok { 0 } else { 1 },
                        total: if exit_ok { 0 } else { 1 },
                        skipped: 0,
                    },
                    duration_ms,
                    output_tail: tail(&combined, 40),
                    failure_lines: if exit_ok {
                        Vec::new()
                    } else {
                        collect_failure_lines(&combined)
                    },
                }
            }
        };
        Ok(outcome)
    }
}
