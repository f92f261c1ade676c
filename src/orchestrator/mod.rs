// Orchestration: scheduling, the agent pool, and the run engine

pub mod engine;
pub mod pool;
pub mod scheduler;

use async_trait::async_trait;

use crate::state::SessionState;

pub use engine::{Engine, EngineConfig, RunOutcome};
pub use pool::AgentPool;
pub use scheduler::PlanTracker;

/// Receives run state after every meaningful transition. Reporting is
/// best-effort: a failing reporter never affects the run.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(&self, state: &SessionState);
}

/// Writes a one-line progress summary to the log.
pub struct LogStatusReporter;

#[async_trait]
impl StatusReporter for LogStatusReporter {
    async fn report(&self, state: &SessionState) {
        log::info!(
            "[Run] {}: {}% ({}/{} done, {} failed, {} agents live, phase {}/{})",
            state.plan_name,
            state.progress,
            state.completed.len(),
            state.total_items,
            state.failed.len(),
            state.active_agents.len(),
            state.current_phase,
            state.total_phases
        );
    }
}

/// Posts run state as JSON to an external endpoint.
pub struct RestStatusReporter {
    endpoint: String,
    http: reqwest::Client,
}

impl RestStatusReporter {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl StatusReporter for RestStatusReporter {
    async fn report(&self, state: &SessionState) {
        if let Err(e) = self.http.post(&self.endpoint).json(state).send().await {
            log::warn!("[Run] Status post to {} failed: {}", self.endpoint, e);
        }
    }
}
