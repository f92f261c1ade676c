// Run engine: admits agents, integrates their branches, validates the result
//
// The engine owns the single-threaded control loop. Agents run as spawned
// tasks and report back over one mpsc channel; all bookkeeping (tracker,
// pool, session state) happens on the loop, so no shared mutable state.
// Integration is funneled through the merge coordinator one item at a time.

use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::acp::{ProtocolClient, ProtocolClientConfig};
use crate::error::{ForemanError, Result};
use crate::git::{format_conflict_guidance, MergeCoordinator, MergeOptions};
use crate::models::{AgentStatus, ExecutionPlan, WorkItem};
use crate::orchestrator::pool::AgentPool;
use crate::orchestrator::scheduler::{PlanTracker, Settled};
use crate::orchestrator::StatusReporter;
use crate::state::{SessionState, StateStore};
use crate::validation::{ValidationConfig, Validator};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub repo_path: PathBuf,
    /// Branch agent work is merged into.
    pub target_branch: String,
    pub max_agents: usize,
    /// Attempts per item before it is failed permanently.
    pub max_attempts: u32,
    pub agent: ProtocolClientConfig,
    pub validation: ValidationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            target_branch: "main".to_string(),
            max_agents: 3,
            max_attempts: 2,
            agent: ProtocolClientConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

enum AgentEvent {
    Progress {
        item_id: String,
        progress: u8,
        activity: Option<String>,
    },
    Finished {
        item_id: String,
        result: Result<()>,
    },
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    CompletedWithFailures,
    Paused,
}

pub struct Engine {
    config: EngineConfig,
    git: Arc<MergeCoordinator>,
    store: StateStore,
    reporters: Vec<Box<dyn StatusReporter>>,
}

impl Engine {
    pub fn new(config: EngineConfig, store: StateStore) -> Self {
        let git = Arc::new(MergeCoordinator::new(&config.repo_path));
        Self {
            config,
            git,
            store,
            reporters: Vec::new(),
        }
    }

    pub fn add_reporter(&mut self, reporter: Box<dyn StatusReporter>) {
        self.reporters.push(reporter);
    }

    /// Execute a plan to completion, pause, or exhaustion. With `resume`,
    /// completion state from a previous interrupted run of the same plan is
    /// carried over and those items are skipped.
    pub async fn run(&self, plan: &ExecutionPlan, resume: bool) -> Result<RunOutcome> {
        plan.validate()?;

        let mut tracker = PlanTracker::new(plan, self.config.max_attempts);
        let mut state = SessionState::new(plan);

        if resume {
            if let Some(previous) = self.store.active_state()? {
                if previous.plan_id == plan.id {
                    log::info!(
                        "[Engine] Resuming '{}': {} items already completed",
                        plan.name,
                        previous.completed.len()
                    );
                    let completed: Vec<String> =
                        previous.completed.iter().map(|c| c.id.clone()).collect();
                    tracker.restore(&completed, &previous.failed);
                    state.started_at = previous.started_at;
                    state.completed = previous.completed;
                    state.failed = previous.failed;
                    if state.total_items > 0 {
                        state.progress =
                            (state.completed.len() * 100 / state.total_items) as u32;
                    }
                } else {
                    log::warn!(
                        "[Engine] Active state is for plan '{}', starting fresh",
                        previous.plan_id
                    );
                }
            }
        }

        let mut pool = AgentPool::new(self.config.max_agents);
        let (tx, mut rx) = mpsc::unbounded_channel();

        state = self.store.set_active_state(state)?;
        self.publish(&state).await;

        log::info!(
            "[Engine] Running '{}': {} items, {} phases, {} agents max",
            plan.name,
            plan.total_items(),
            plan.total_phases(),
            pool.max_agents()
        );

        let outcome = loop {
            self.admit_ready(&mut tracker, &mut pool, &tx).await;

            if tracker.is_finished() && pool.is_empty() {
                break if tracker.failed_ids().is_empty() && tracker.conflicted_ids().is_empty() {
                    RunOutcome::Completed
                } else {
                    RunOutcome::CompletedWithFailures
                };
            }

            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else {
                        // All senders gone with agents still tracked; bail
                        // rather than spin.
                        break RunOutcome::CompletedWithFailures;
                    };
                    self.handle_event(event, &plan.id, &mut tracker, &mut pool).await;
                }
                _ = tokio::signal::ctrl_c() => {
                    log::info!("[Engine] Interrupt received, pausing run");
                    self.pause(&mut pool).await?;
                    return Ok(RunOutcome::Paused);
                }
            }

            let snapshot = self.snapshot(plan, &tracker, &pool);
            if let Some(saved) = self.persist("session state", self.store.set_active_state(snapshot)) {
                self.publish(&saved).await;
            }
        };

        let final_state = self.snapshot(plan, &tracker, &pool);
        if let Some(saved) = self.persist("final session state", self.store.set_active_state(final_state)) {
            self.publish(&saved).await;
        }
        self.store.clear_active_state()?;

        log::info!(
            "[Engine] Run finished: {} completed, {} failed, {} conflicted",
            tracker.completed_ids().len(),
            tracker.failed_ids().len(),
            tracker.conflicted_ids().len()
        );
        Ok(outcome)
    }

    async fn admit_ready(
        &self,
        tracker: &mut PlanTracker,
        pool: &mut AgentPool,
        tx: &mpsc::UnboundedSender<AgentEvent>,
    ) {
        while pool.can_admit() {
            let next = match tracker.schedulable().first() {
                Some(item) => (*item).clone(),
                None => break,
            };
            tracker.mark_running(&next.id);
            // A branch that cannot be created fails this item only; the
            // rest of the plan keeps running.
            if let Err(e) = self
                .git
                .create_branch(&next.branch_name(), &self.config.target_branch)
                .await
            {
                self.settle_failure(&next.id, &e.to_string(), tracker);
                continue;
            }
            if pool.admit(&next).is_none() {
                tracker.release_for_retry(&next.id);
                break;
            }

            let config = self.agent_config();
            let repo = self.config.repo_path.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let item_id = next.id.clone();
                let result = drive_agent(config, repo, &next, &tx).await;
                let _ = tx.send(AgentEvent::Finished { item_id, result });
            });
        }
    }

    async fn handle_event(
        &self,
        event: AgentEvent,
        plan_id: &str,
        tracker: &mut PlanTracker,
        pool: &mut AgentPool,
    ) {
        match event {
            AgentEvent::Progress {
                item_id,
                progress,
                activity,
            } => {
                pool.update_progress(&item_id, progress, activity);
            }
            AgentEvent::Finished { item_id, result } => match result {
                Ok(()) => {
                    let agent = pool.remove(&item_id);
                    self.integrate(&item_id, plan_id, agent.map(|a| a.started_at), tracker)
                        .await;
                }
                Err(e) => {
                    pool.remove(&item_id);
                    self.settle_failure(&item_id, &e.to_string(), tracker);
                }
            },
        }
    }

    /// One failed attempt: release the item for another round if retries
    /// remain, otherwise fail it permanently.
    fn settle_failure(&self, item_id: &str, why: &str, tracker: &mut PlanTracker) {
        if tracker.can_retry(item_id) {
            log::warn!(
                "[Engine] '{}' failed (attempt {}), retrying: {}",
                item_id,
                tracker.attempts(item_id),
                why
            );
            tracker.release_for_retry(item_id);
        } else {
            log::error!(
                "[Engine] '{}' failed permanently after {} attempts: {}",
                item_id,
                tracker.attempts(item_id),
                why
            );
            tracker.mark_settled(item_id, Settled::Failed);
            self.persist("failure record", self.store.mark_item_failed(item_id));
        }
    }

    /// Mid-run persistence is best-effort; a write failure is logged and
    /// the run keeps going on in-memory state.
    fn persist<T>(&self, what: &str, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("[Engine] Could not persist {}: {}", what, e);
                None
            }
        }
    }

    /// Merge a finished item's branch and validate the merged tree. A merge
    /// conflict holds the item for manual resolution; any other merge or
    /// validation error consumes a retry like an agent failure would.
    async fn integrate(
        &self,
        item_id: &str,
        plan_id: &str,
        started_at: Option<chrono::DateTime<chrono::Utc>>,
        tracker: &mut PlanTracker,
    ) {
        let Some(item) = tracker.item(item_id).cloned() else {
            return;
        };
        let branch = item.branch_name();
        let options = MergeOptions {
            message: Some(format!("Merge {} ({})", branch, item.title)),
            ..Default::default()
        };

        match self
            .git
            .merge_branch(&branch, &self.config.target_branch, &options)
            .await
        {
            Ok(_) => {}
            Err(ForemanError::MergeConflict { files, .. }) => {
                log::error!(
                    "[Engine] '{}' held on merge conflict:\n{}",
                    item_id,
                    format_conflict_guidance(&branch, &self.config.target_branch, &files)
                );
                let _ = self.git.abort_merge().await;
                tracker.mark_settled(item_id, Settled::Conflicted);
                return;
            }
            Err(e) => {
                self.settle_failure(item_id, &format!("merge failed: {}", e), tracker);
                return;
            }
        }

        let report = match Validator::new(self.config.validation.clone())
            .validate(&self.config.repo_path, item_id)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                self.settle_failure(item_id, &format!("validation errored: {}", e), tracker);
                return;
            }
        };
        if let Some(report_path) = self.persist(
            "validation report",
            self.store.save_report(plan_id, item_id, &report.to_markdown()),
        ) {
            log::info!("[Engine] Report written to {}", report_path.display());
        }

        if report.passed() {
            let duration_ms = started_at
                .map(|s| (chrono::Utc::now() - s).num_milliseconds().max(0) as u64)
                .unwrap_or(0);
            tracker.mark_settled(item_id, Settled::Completed);
            self.persist(
                "completion record",
                self.store.mark_item_completed(item_id, &item.title, duration_ms),
            );
            if let Err(e) = self.git.delete_branch(&branch).await {
                log::warn!("[Engine] Could not delete merged branch '{}': {}", branch, e);
            }
        } else {
            self.settle_failure(item_id, &report.summary_line(), tracker);
        }
    }

    async fn pause(&self, pool: &mut AgentPool) -> Result<()> {
        for agent in pool.agents() {
            pool.set_status(&agent.work_item_id, AgentStatus::Paused);
        }
        if let Some(mut state) = self.store.active_state()? {
            for agent in &mut state.active_agents {
                agent.status = AgentStatus::Paused;
            }
            let saved = self.store.set_active_state(state)?;
            self.publish(&saved).await;
        }
        Ok(())
    }

    fn snapshot(&self, plan: &ExecutionPlan, tracker: &PlanTracker, pool: &AgentPool) -> SessionState {
        // Persisted bookkeeping (completed/failed lists, timestamps) comes
        // from the store; this fills in the live view around it.
        let mut state = match self.store.active_state().ok().flatten() {
            Some(state) if state.plan_id == plan.id => state,
            _ => SessionState::new(plan),
        };
        state.active_agents = pool.agents();
        state.current_phase = tracker.current_phase().unwrap_or(state.total_phases);
        // Cascaded failures settle in the tracker without an agent event.
        for id in tracker.failed_ids() {
            if !state.failed.contains(&id) {
                state.failed.push(id);
            }
        }
        let up_next = tracker.up_next(5);
        state.up_next = if up_next.is_empty() { None } else { Some(up_next) };
        let conflicted = tracker.conflicted_ids();
        state.blocked_by = if conflicted.is_empty() {
            None
        } else {
            Some(format!("merge conflicts: {}", conflicted.join(", ")))
        };
        state
    }

    async fn publish(&self, state: &SessionState) {
        for reporter in &self.reporters {
            reporter.report(state).await;
        }
    }

    fn agent_config(&self) -> ProtocolClientConfig {
        let mut config = self.config.agent.clone();
        if config.working_dir.is_none() {
            config.working_dir = Some(self.config.repo_path.clone());
        }
        config
    }
}

/// Drive one agent through a full work item: session, prompt, shutdown.
/// The connect performs the protocol handshake itself.
async fn drive_agent(
    config: ProtocolClientConfig,
    repo: PathBuf,
    item: &WorkItem,
    tx: &mpsc::UnboundedSender<AgentEvent>,
) -> Result<()> {
    let client = ProtocolClient::new(config);
    client.connect().await?;
    let session = client.new_session(&repo.to_string_lossy()).await?;

    let item_id = item.id.clone();
    let progress_tx = tx.clone();
    client.on_notification("session/update", move |params| {
        let (progress, activity) = parse_progress_update(params);
        if let Some(progress) = progress {
            let _ = progress_tx.send(AgentEvent::Progress {
                item_id: item_id.clone(),
                progress,
                activity,
            });
        }
    });

    let result = client.prompt(&session, &build_prompt(item)).await;
    client.disconnect().await?;

    let value = result?;
    match value.get("stopReason").and_then(|v| v.as_str()) {
        None | Some("end_turn") => Ok(()),
        Some(other) => Err(ForemanError::Protocol {
            code: -32000,
            message: format!("agent stopped early: {}", other),
        }),
    }
}

/// Extract progress and activity from a session/update notification.
fn parse_progress_update(params: &Value) -> (Option<u8>, Option<String>) {
    let progress = params
        .get("progress")
        .and_then(|v| v.as_u64())
        .map(|p| p.min(100) as u8);
    let activity = params
        .get("activity")
        .or_else(|| params.get("currentActivity"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    (progress, activity)
}

/// The work order handed to an agent. The agent owns its branch; the
/// engine owns the merge.
fn build_prompt(item: &WorkItem) -> String {
    let mut prompt = format!(
        "You are working on task '{}' ({}).\n\n{}\n\n\
         Do all of your work on the git branch '{}': check it out first, \
         make your changes, and commit them to that branch. Do not merge, \
         do not touch other branches, and leave the working tree clean \
         when you finish.",
        item.id,
        item.title,
        item.description.trim(),
        item.branch_name()
    );
    if !item.dependencies.is_empty() {
        prompt.push_str(&format!(
            "\n\nAlready completed and merged: {}. Build on that work.",
            item.dependencies.join(", ")
        ));
    }
    prompt
}
