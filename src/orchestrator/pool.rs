// Agent pool: bounded set of live agents, keyed by work item

use chrono::Utc;
use std::collections::HashMap;

use crate::models::{Agent, AgentStatus, WorkItem};

/// Tracks which agents are live and enforces the concurrency cap. One work
/// item gets at most one agent, ever; admission for an item that already
/// has one is a bug upstream and is refused.
pub struct AgentPool {
    max_agents: usize,
    agents: HashMap<String, Agent>,
}

impl AgentPool {
    pub fn new(max_agents: usize) -> Self {
        Self {
            max_agents: max_agents.max(1),
            agents: HashMap::new(),
        }
    }

    pub fn max_agents(&self) -> usize {
        self.max_agents
    }

    pub fn can_admit(&self) -> bool {
        self.running_count() < self.max_agents
    }

    /// Agents currently counted against the cap.
    pub fn running_count(&self) -> usize {
        self.agents
            .values()
            .filter(|a| matches!(a.status, AgentStatus::Working | AgentStatus::Idle))
            .count()
    }

    /// Admit an agent for a work item. Returns None when the pool is full
    /// or the item already has an agent.
    pub fn admit(&mut self, item: &WorkItem) -> Option<Agent> {
        if !self.can_admit() {
            log::debug!("[AgentPool] Pool full, cannot admit '{}'", item.id);
            return None;
        }
        if self.agents.contains_key(&item.id) {
            log::warn!("[AgentPool] Item '{}' already has an agent", item.id);
            return None;
        }

        let agent = Agent {
            id: format!("agent-{}", item.id),
            work_item_id: item.id.clone(),
            branch: item.branch_name(),
            status: AgentStatus::Working,
            progress: 0,
            started_at: Utc::now(),
            current_activity: Some("starting".to_string()),
        };
        log::info!(
            "[AgentPool] Admitted agent for '{}' on branch '{}' ({}/{})",
            item.id,
            agent.branch,
            self.running_count() + 1,
            self.max_agents
        );
        self.agents.insert(item.id.clone(), agent.clone());
        Some(agent)
    }

    pub fn get(&self, item_id: &str) -> Option<&Agent> {
        self.agents.get(item_id)
    }

    pub fn update_progress(&mut self, item_id: &str, progress: u8, activity: Option<String>) {
        if let Some(agent) = self.agents.get_mut(item_id) {
            agent.progress = progress.min(100);
            if activity.is_some() {
                agent.current_activity = activity;
            }
        }
    }

    pub fn set_status(&mut self, item_id: &str, status: AgentStatus) {
        if let Some(agent) = self.agents.get_mut(item_id) {
            agent.status = status;
        }
    }

    /// Remove an agent, freeing its slot. Returns the final agent record.
    pub fn remove(&mut self, item_id: &str) -> Option<Agent> {
        let agent = self.agents.remove(item_id);
        if agent.is_some() {
            log::info!("[AgentPool] Released agent for '{}'", item_id);
        }
        agent
    }

    /// Snapshot of all agents, ordered by work item id for stable output.
    pub fn agents(&self) -> Vec<Agent> {
        let mut list: Vec<Agent> = self.agents.values().cloned().collect();
        list.sort_by(|a, b| a.work_item_id.cmp(&b.work_item_id));
        list
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str) -> WorkItem {
        WorkItem {
            id: id.to_string(),
            title: format!("Item {}", id),
            description: String::new(),
            dependencies: Vec::new(),
            parallel_group: None,
            phase: 1,
        }
    }

    #[test]
    fn test_admission_respects_cap() {
        let mut pool = AgentPool::new(2);
        assert!(pool.admit(&item("a")).is_some());
        assert!(pool.admit(&item("b")).is_some());
        assert!(!pool.can_admit());
        assert!(pool.admit(&item("c")).is_none());
        assert_eq!(pool.running_count(), 2);
    }

    #[test]
    fn test_item_gets_at_most_one_agent() {
        let mut pool = AgentPool::new(4);
        assert!(pool.admit(&item("a")).is_some());
        assert!(pool.admit(&item("a")).is_none());
        assert_eq!(pool.running_count(), 1);
    }

    #[test]
    fn test_remove_frees_slot() {
        let mut pool = AgentPool::new(1);
        assert!(pool.admit(&item("a")).is_some());
        assert!(!pool.can_admit());

        let released = pool.remove("a").unwrap();
        assert_eq!(released.work_item_id, "a");
        assert!(pool.can_admit());
        assert!(pool.admit(&item("b")).is_some());
    }

    #[test]
    fn test_admitted_agent_shape() {
        let mut pool = AgentPool::new(1);
        let agent = pool.admit(&item("setup-db")).unwrap();
        assert_eq!(agent.id, "agent-setup-db");
        assert_eq!(agent.branch, "agent/setup-db");
        assert_eq!(agent.status, AgentStatus::Working);
        assert_eq!(agent.progress, 0);
    }

    #[test]
    fn test_progress_is_clamped() {
        let mut pool = AgentPool::new(1);
        pool.admit(&item("a"));
        pool.update_progress("a", 250, Some("overreporting".to_string()));
        assert_eq!(pool.get("a").unwrap().progress, 100);
    }

    #[test]
    fn test_zero_cap_is_raised_to_one() {
        let pool = AgentPool::new(0);
        assert_eq!(pool.max_agents(), 1);
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let mut pool = AgentPool::new(4);
        pool.admit(&item("charlie"));
        pool.admit(&item("alpha"));
        pool.admit(&item("bravo"));
        let ids: Vec<String> = pool.agents().into_iter().map(|a| a.work_item_id).collect();
        assert_eq!(ids, vec!["alpha", "bravo", "charlie"]);
    }
}
