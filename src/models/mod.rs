// Core data model for orchestration runs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{ForemanError, Result};

/// Lifecycle status of a running agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Paused,
    Completed,
    Failed,
}

/// A running coding-agent instance bound to one work item and one branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub work_item_id: String,
    pub branch: String,
    pub status: AgentStatus,
    /// Progress percentage, 0-100, as last reported by the agent.
    pub progress: u8,
    pub started_at: DateTime<Utc>,
    /// Optional current file or activity annotation from the agent.
    pub current_activity: Option<String>,
}

/// A schedulable unit of work. Immutable once the plan is generated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    /// Prompt/context handed to the agent for this item.
    pub description: String,
    /// Ids of items that must be completed before this one starts.
    pub dependencies: Vec<String>,
    /// Items sharing a tag may run concurrently within the pool cap.
    pub parallel_group: Option<String>,
    /// Ordering tier; later phases cannot start before earlier ones.
    pub phase: u32,
}

impl WorkItem {
    /// Branch name for this item, derived deterministically from its id.
    pub fn branch_name(&self) -> String {
        format!("agent/{}", self.id)
    }
}

/// A raw plan entry before phase/group placement is applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Items eligible to run concurrently, identified by a shared tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelGroup {
    pub tag: String,
    pub items: Vec<PlanItem>,
}

/// One ordering tier of the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phase {
    pub number: u32,
    pub groups: Vec<ParallelGroup>,
}

/// Dependency-ordered execution plan: phases, then parallel groups, then
/// work items. Read-only input to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub id: String,
    pub name: String,
    pub phases: Vec<Phase>,
}

impl ExecutionPlan {
    /// Flatten the phase/group tree into work items carrying their phase
    /// number and group tag.
    pub fn work_items(&self) -> Vec<WorkItem> {
        let mut items = Vec::new();
        for phase in &self.phases {
            for group in &phase.groups {
                for item in &group.items {
                    items.push(WorkItem {
                        id: item.id.clone(),
                        title: item.title.clone(),
                        description: item.description.clone(),
                        dependencies: item.dependencies.clone(),
                        parallel_group: Some(group.tag.clone()),
                        phase: phase.number,
                    });
                }
            }
        }
        items
    }

    pub fn total_items(&self) -> usize {
        self.phases
            .iter()
            .map(|p| p.groups.iter().map(|g| g.items.len()).sum::<usize>())
            .sum()
    }

    pub fn total_phases(&self) -> u32 {
        self.phases.iter().map(|p| p.number).max().unwrap_or(0)
    }

    /// Reject plans with duplicate item ids or dependencies on unknown ids.
    pub fn validate(&self) -> Result<()> {
        let items = self.work_items();
        let mut seen = HashSet::new();
        for item in &items {
            if !seen.insert(item.id.clone()) {
                return Err(ForemanError::InvalidPlan {
                    reason: format!("duplicate work item id '{}'", item.id),
                });
            }
        }
        for item in &items {
            for dep in &item.dependencies {
                if !seen.contains(dep) {
                    return Err(ForemanError::InvalidPlan {
                        reason: format!(
                            "work item '{}' depends on unknown id '{}'",
                            item.id, dep
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_plan() -> ExecutionPlan {
        ExecutionPlan {
            id: "epic-1".to_string(),
            name: "Sample epic".to_string(),
            phases: vec![
                Phase {
                    number: 1,
                    groups: vec![ParallelGroup {
                        tag: "backend".to_string(),
                        items: vec![
                            PlanItem {
                                id: "t1".to_string(),
                                title: "Set up schema".to_string(),
                                description: "Create the database schema".to_string(),
                                dependencies: vec![],
                            },
                            PlanItem {
                                id: "t2".to_string(),
                                title: "Add API routes".to_string(),
                                description: "Expose the REST routes".to_string(),
                                dependencies: vec![],
                            },
                        ],
                    }],
                },
                Phase {
                    number: 2,
                    groups: vec![ParallelGroup {
                        tag: "frontend".to_string(),
                        items: vec![PlanItem {
                            id: "t3".to_string(),
                            title: "Wire up UI".to_string(),
                            description: "Connect the UI to the API".to_string(),
                            dependencies: vec!["t1".to_string(), "t2".to_string()],
                        }],
                    }],
                },
            ],
        }
    }

    #[test]
    fn test_work_items_carry_phase_and_group() {
        let plan = sample_plan();
        let items = plan.work_items();

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].phase, 1);
        assert_eq!(items[0].parallel_group.as_deref(), Some("backend"));
        assert_eq!(items[2].phase, 2);
        assert_eq!(items[2].parallel_group.as_deref(), Some("frontend"));
    }

    #[test]
    fn test_branch_name_is_deterministic() {
        let plan = sample_plan();
        let items = plan.work_items();
        assert_eq!(items[0].branch_name(), "agent/t1");
        assert_eq!(items[0].branch_name(), items[0].branch_name());
    }

    #[test]
    fn test_validate_accepts_well_formed_plan() {
        assert!(sample_plan().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let mut plan = sample_plan();
        plan.phases[1].groups[0].items[0].id = "t1".to_string();

        let err = plan.validate().unwrap_err();
        assert_eq!(err.code(), "invalid_plan");
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_validate_rejects_unknown_dependency() {
        let mut plan = sample_plan();
        plan.phases[1].groups[0].items[0]
            .dependencies
            .push("missing".to_string());

        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("unknown id 'missing'"));
    }

    #[test]
    fn test_total_counts() {
        let plan = sample_plan();
        assert_eq!(plan.total_items(), 3);
        assert_eq!(plan.total_phases(), 2);
    }

    #[test]
    fn test_plan_round_trips_through_json() {
        let plan = sample_plan();
        let json = serde_json::to_string(&plan).unwrap();
        let back: ExecutionPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back.total_items(), 3);
        assert_eq!(back.phases[0].groups[0].tag, "backend");
    }
}
