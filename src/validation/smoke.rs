// Smoke stage: boot the service under test and probe its HTTP surface

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::process::{Child, Command};

use crate::error::Result;
use crate::validation::report::SmokeOutcome;

/// A single HTTP probe against the booted service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmokeProbe {
    pub name: String,
    pub path: String,
    #[serde(default = "default_expect_status")]
    pub expect_status: u16,
    /// Substring the response body must contain, if set.
    #[serde(default)]
    pub expect_body_contains: Option<String>,
}

fn default_expect_status() -> u16 {
    200
}

/// Configuration for the smoke stage. Absent entirely when the item under
/// validation has no runnable service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmokeConfig {
    /// Shell command that boots the service. None means the service is
    /// already running externally.
    #[serde(default)]
    pub boot_command: Option<String>,
    pub base_url: String,
    /// Path polled until it answers, before any probe runs.
    #[serde(default = "default_readiness_path")]
    pub readiness_path: String,
    #[serde(default = "default_readiness_timeout_ms")]
    pub readiness_timeout_ms: u64,
    pub probes: Vec<SmokeProbe>,
}

fn default_readiness_path() -> String {
    "/health".to_string()
}

fn default_readiness_timeout_ms() -> u64 {
    30_000
}

pub struct SmokeTester {
    http: reqwest::Client,
}

impl Default for SmokeTester {
    fn default() -> Self {
        Self::new()
    }
}

impl SmokeTester {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Boot (if configured), wait for readiness, run every probe, then tear
    /// the service down. A service that never becomes ready fails every
    /// probe with a readiness error rather than aborting validation.
    pub async fn run(&self, working_dir: &Path, config: &SmokeConfig) -> Result<Vec<SmokeOutcome>> {
        let mut child = match &config.boot_command {
            Some(command) => Some(self.boot(working_dir, command)?),
            None => None,
        };

        let ready = self.wait_for_ready(config).await;
        let outcomes = if ready {
            let mut outcomes = Vec::with_capacity(config.probes.len());
            for probe in &config.probes {
                outcomes.push(self.run_probe(config, probe).await);
            }
            outcomes
        } else {
            log::warn!(
                "[SmokeTester] Service never became ready at {}{}",
                config.base_url,
                config.readiness_path
            );
            config
                .probes
                .iter()
                .map(|p| SmokeOutcome {
                    name: p.name.clone(),
                    passed: false,
                    detail: format!(
                        "service not ready within {}ms",
                        config.readiness_timeout_ms
                    ),
                })
                .collect()
        };

        if let Some(child) = child.as_mut() {
            if let Err(e) = child.kill().await {
                log::warn!("[SmokeTester] Failed to stop booted service: {}", e);
            }
            let _ = child.wait().await;
        }

        Ok(outcomes)
    }

    fn boot(&self, working_dir: &Path, command: &str) -> Result<Child> {
        log::info!("[SmokeTester] Booting: {}", command);
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(working_dir)
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }

    async fn wait_for_ready(&self, config: &SmokeConfig) -> bool {
        let url = format!("{}{}", config.base_url, config.readiness_path);
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(config.readiness_timeout_ms);
        loop {
            match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => return true,
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn run_probe(&self, config: &SmokeConfig, probe: &SmokeProbe) -> SmokeOutcome {
        let url = format!("{}{}", config.base_url, probe.path);
        let response = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                return SmokeOutcome {
                    name: probe.name.clone(),
                    passed: false,
                    detail: format!("request failed: {}", e),
                }
            }
        };

        let status = response.status().as_u16();
        if status != probe.expect_status {
            return SmokeOutcome {
                name: probe.name.clone(),
                passed: false,
                detail: format!("expected status {}, got {}", probe.expect_status, status),
            };
        }

        if let Some(needle) = &probe.expect_body_contains {
            let body = response.text().await.unwrap_or_default();
            if !body.contains(needle) {
                return SmokeOutcome {
                    name: probe.name.clone(),
                    passed: false,
                    detail: format!("body missing expected text '{}'", needle),
                };
            }
        }

        SmokeOutcome {
            name: probe.name.clone(),
            passed: true,
            detail: format!("status {}", status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let json = r#"{
            "baseUrl": "http://127.0.0.1:9280",
            "probes": [{"name": "root", "path": "/"}]
        }"#;
        let config: SmokeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.readiness_path, "/health");
        assert_eq!(config.readiness_timeout_ms, 30_000);
        assert!(config.boot_command.is_none());
        assert_eq!(config.probes[0].expect_status, 200);
        assert!(config.probes[0].expect_body_contains.is_none());
    }

    #[tokio::test]
    async fn test_unready_service_fails_all_probes() {
        let temp = tempfile::TempDir::new().unwrap();
        let tester = SmokeTester::new();
        // Nothing listens on this port; readiness times out quickly.
        let config = SmokeConfig {
            boot_command: None,
            base_url: "http://127.0.0.1:9281".to_string(),
            readiness_path: "/health".to_string(),
            readiness_timeout_ms: 300,
            probes: vec![
                SmokeProbe {
                    name: "a".to_string(),
                    path: "/a".to_string(),
                    expect_status: 200,
                    expect_body_contains: None,
                },
                SmokeProbe {
                    name: "b".to_string(),
                    path: "/b".to_string(),
                    expect_status: 200,
                    expect_body_contains: None,
                },
            ],
        };

        let outcomes = tester.run(temp.path(), &config).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| !o.passed));
        assert!(outcomes[0].detail.contains("not ready"));
    }
}
