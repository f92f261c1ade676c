// File-backed session state store
//
// One structured JSON file per user holds the current run plus a bounded
// most-recent-first list of archived runs. The orchestrator is the single
// writer; status queries read snapshots without locking. Writes are atomic
// (temp file + rename) and guarded by an advisory file lock so a concurrent
// CLI invocation cannot interleave a read-modify-write.

pub mod format;

pub use format::{format_duration, format_relative_time};

use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{ForemanError, Result};
use crate::models::{Agent, AgentStatus, ExecutionPlan};

/// On-disk schema version. Bumped on incompatible layout changes; an
/// unknown version is treated as a fresh store rather than a fatal error.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Maximum number of archived runs retained.
pub const RECENT_RUNS_CAP: usize = 10;

/// A finished work item as recorded in session history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedItem {
    pub id: String,
    pub title: String,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// Durable record of one in-flight orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub plan_id: String,
    pub plan_name: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub active_agents: Vec<Agent>,
    pub completed: Vec<CompletedItem>,
    pub failed: Vec<String>,
    pub total_items: usize,
    /// Aggregate progress percentage, completed / total.
    pub progress: u32,
    pub current_phase: u32,
    pub total_phases: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_next: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
}

impl SessionState {
    pub fn new(plan: &ExecutionPlan) -> Self {
        let now = Utc::now();
        Self {
            plan_id: plan.id.clone(),
            plan_name: plan.name.clone(),
            started_at: now,
            updated_at: now,
            active_agents: Vec::new(),
            completed: Vec::new(),
            failed: Vec::new(),
            total_items: plan.total_items(),
            progress: 0,
            current_phase: plan.phases.iter().map(|p| p.number).min().unwrap_or(0),
            total_phases: plan.total_phases(),
            up_next: None,
            blocked_by: None,
        }
    }
}

/// An archived run in the recent-runs list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedRun {
    pub archived_at: DateTime<Utc>,
    pub state: SessionState,
}

/// Resume query result: whether a paused run can continue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeInfo {
    pub can_resume: bool,
    pub paused_agents: usize,
    pub running_agents: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateFile {
    version: u32,
    active: Option<SessionState>,
    recent: Vec<ArchivedRun>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: STATE_SCHEMA_VERSION,
            active: None,
            recent: Vec::new(),
        }
    }
}

/// Estimated remaining run time: historical average per-item duration times
/// the count of items neither completed nor failed. `None` until at least
/// one item has completed.
pub fn estimate_remaining_ms(state: &SessionState) -> Option<u64> {
    if state.completed.is_empty() {
        return None;
    }
    let total: u64 = state.completed.iter().map(|c| c.duration_ms).sum();
    let average = total / state.completed.len() as u64;
    let remaining = state
        .total_items
        .saturating_sub(state.completed.len())
        .saturating_sub(state.failed.len());
    Some(average * remaining as u64)
}

/// File-backed state repository, injected into the orchestrator.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Default per-user location: `~/.foreman/state.json`.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".foreman")
            .join("state.json")
    }

    pub fn open_default() -> Self {
        Self::new(Self::default_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot read of the active run, if any. Readers tolerate concurrent
    /// writes by treating the result as eventually-consistent.
    pub fn active_state(&self) -> Result<Option<SessionState>> {
        Ok(self.load_file()?.active)
    }

    /// Replace the active run record, refreshing `updated_at` so it strictly
    /// increases across writes. Returns the state as persisted.
    pub fn set_active_state(&self, mut state: SessionState) -> Result<SessionState> {
        self.with_lock(|file| {
            let floor = file
                .active
                .as_ref()
                .map(|a| a.updated_at)
                .unwrap_or(state.updated_at)
                .max(state.updated_at);
            state.updated_at = next_timestamp(floor);
            file.active = Some(state.clone());
            Ok(state.clone())
        })
    }

    /// Archive the active run into the capped recent-runs list (keyed by
    /// plan id, most recent first) and clear it.
    pub fn clear_active_state(&self) -> Result<()> {
        self.with_lock(|file| {
            if let Some(active) = file.active.take() {
                file.recent.retain(|r| r.state.plan_id != active.plan_id);
                file.recent.insert(
                    0,
                    ArchivedRun {
                        archived_at: Utc::now(),
                        state: active,
                    },
                );
                file.recent.truncate(RECENT_RUNS_CAP);
            }
            Ok(())
        })
    }

    /// Record a finished item: drops its agent from the active list, appends
    /// to the completed list, and recomputes aggregate progress.
    pub fn mark_item_completed(
        &self,
        id: &str,
        title: &str,
        duration_ms: u64,
    ) -> Result<Option<SessionState>> {
        self.with_lock(|file| {
            let Some(active) = file.active.as_mut() else {
                return Ok(None);
            };
            active.active_agents.retain(|a| a.work_item_id != id);
            active.completed.push(CompletedItem {
                id: id.to_string(),
                title: title.to_string(),
                duration_ms,
                completed_at: Utc::now(),
            });
            if active.total_items > 0 {
                active.progress =
                    (active.completed.len() * 100 / active.total_items) as u32;
            }
            active.updated_at = next_timestamp(active.updated_at);
            Ok(Some(active.clone()))
        })
    }

    /// Record a failed item: drops its agent and appends to the failed list
    /// without altering progress.
    pub fn mark_item_failed(&self, id: &str) -> Result<Option<SessionState>> {
        self.with_lock(|file| {
            let Some(active) = file.active.as_mut() else {
                return Ok(None);
            };
            active.active_agents.retain(|a| a.work_item_id != id);
            if !active.failed.iter().any(|f| f == id) {
                active.failed.push(id.to_string());
            }
            active.updated_at = next_timestamp(active.updated_at);
            Ok(Some(active.clone()))
        })
    }

    /// Recent archived runs, most recent first.
    pub fn recent_runs(&self) -> Result<Vec<ArchivedRun>> {
        Ok(self.load_file()?.recent)
    }

    /// Whether a previously paused/interrupted run can continue, and how
    /// many of its agents were paused vs still marked running.
    pub fn resume_info(&self) -> Result<ResumeInfo> {
        let active = self.active_state()?;
        Ok(match active {
            Some(state) => {
                let paused = state
                    .active_agents
                    .iter()
                    .filter(|a| a.status == AgentStatus::Paused)
                    .count();
                let running = state
                    .active_agents
                    .iter()
                    .filter(|a| a.status == AgentStatus::Working)
                    .count();
                ResumeInfo {
                    can_resume: paused + running > 0,
                    paused_agents: paused,
                    running_agents: running,
                }
            }
            None => ResumeInfo {
                can_resume: false,
                paused_agents: 0,
                running_agents: 0,
            },
        })
    }

    /// Persist a rendered validation report alongside session history.
    pub fn save_report(&self, plan_id: &str, item_id: &str, markdown: &str) -> Result<PathBuf> {
        let dir = self
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("reports")
            .join(plan_id);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.md", item_id));
        fs::write(&path, markdown)?;
        Ok(path)
    }

    fn load_file(&self) -> Result<StateFile> {
        if !self.path.exists() {
            return Ok(StateFile::default());
        }
        let content = fs::read_to_string(&self.path)?;
        let file: StateFile = match serde_json::from_str(&content) {
            Ok(file) => file,
            Err(e) => {
                log::warn!("[StateStore] Unreadable state file, starting fresh: {}", e);
                return Ok(StateFile::default());
            }
        };
        if file.version != STATE_SCHEMA_VERSION {
            log::warn!(
                "[StateStore] Unknown schema version {}, starting fresh",
                file.version
            );
            return Ok(StateFile::default());
        }
        Ok(file)
    }

    fn save_file(&self, file: &StateFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(file)?;
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, &content)?;
        fs::rename(&temp_path, &self.path).map_err(|e| ForemanError::State {
            message: format!("failed to replace {}: {}", self.path.display(), e),
        })?;
        Ok(())
    }

    /// Load-modify-save under an exclusive advisory lock.
    fn with_lock<R>(&self, f: impl FnOnce(&mut StateFile) -> Result<R>) -> Result<R> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock_path = self.path.with_extension("lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        lock_file.lock_exclusive()?;

        let result = (|| {
            let mut file = self.load_file()?;
            let out = f(&mut file)?;
            self.save_file(&file)?;
            Ok(out)
        })();

        let _ = fs2::FileExt::unlock(&lock_file);
        result
    }
}

/// Next monotonic timestamp: strictly greater than `floor` even when the
/// wall clock has not advanced between writes.
fn next_timestamp(floor: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > floor {
        now
    } else {
        floor + Duration::milliseconds(1)
    }
}
