// Plan tracker: dependency-ordered admission over an execution plan
//
// Phases are strict barriers: no item of phase N starts until every item
// of earlier phases has settled. Within a phase, items become eligible
// when their dependencies complete, and eligible items are ordered by
// parallel group so group members are batched together.

use std::collections::{HashMap, HashSet};

use crate::models::{ExecutionPlan, WorkItem};

/// How an item left the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    Completed,
    Failed,
    /// Merge conflict: held for manual resolution, never cascaded.
    Conflicted,
}

pub struct PlanTracker {
    items: HashMap<String, WorkItem>,
    running: HashSet<String>,
    completed: HashSet<String>,
    failed: HashSet<String>,
    conflicted: HashSet<String>,
    attempts: HashMap<String, u32>,
    max_attempts: u32,
}

impl PlanTracker {
    pub fn new(plan: &ExecutionPlan, max_attempts: u32) -> Self {
        let items = plan
            .work_items()
            .into_iter()
            .map(|item| (item.id.clone(), item))
            .collect();
        Self {
            items,
            running: HashSet::new(),
            completed: HashSet::new(),
            failed: HashSet::new(),
            conflicted: HashSet::new(),
            attempts: HashMap::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Seed completion state from a previous run.
    pub fn restore(&mut self, completed: &[String], failed: &[String]) {
        for id in completed {
            if self.items.contains_key(id) {
                self.completed.insert(id.clone());
            }
        }
        for id in failed {
            if self.items.contains_key(id) {
                self.failed.insert(id.clone());
            }
        }
    }

    fn settled(&self, id: &str) -> bool {
        self.completed.contains(id) || self.failed.contains(id) || self.conflicted.contains(id)
    }

    /// Lowest phase with unsettled items; None when everything settled.
    pub fn current_phase(&self) -> Option<u32> {
        self.items
            .values()
            .filter(|item| !self.settled(&item.id))
            .map(|item| item.phase)
            .min()
    }

    /// Items eligible to start now, in admission order: current phase only,
    /// dependencies complete, grouped then ordered by id.
    pub fn schedulable(&self) -> Vec<&WorkItem> {
        let Some(phase) = self.current_phase() else {
            return Vec::new();
        };
        let mut eligible: Vec<&WorkItem> = self
            .items
            .values()
            .filter(|item| {
                item.phase == phase
                    && !self.running.contains(&item.id)
                    && !self.settled(&item.id)
                    && item
                        .dependencies
                        .iter()
                        .all(|dep| self.completed.contains(dep))
            })
            .collect();
        eligible.sort_by(|a, b| {
            (a.phase, &a.parallel_group, &a.id).cmp(&(b.phase, &b.parallel_group, &b.id))
        });
        eligible
    }

    pub fn mark_running(&mut self, id: &str) {
        if self.items.contains_key(id) {
            self.running.insert(id.to_string());
            *self.attempts.entry(id.to_string()).or_insert(0) += 1;
        }
    }

    pub fn attempts(&self, id: &str) -> u32 {
        self.attempts.get(id).copied().unwrap_or(0)
    }

    /// Whether a failed attempt leaves retry budget.
    pub fn can_retry(&self, id: &str) -> bool {
        self.attempts(id) < self.max_attempts
    }

    /// Release a failed attempt back into the eligible set.
    pub fn release_for_retry(&mut self, id: &str) {
        self.running.remove(id);
    }

    pub fn mark_settled(&mut self, id: &str, outcome: Settled) {
        self.running.remove(id);
        match outcome {
            Settled::Completed => {
                self.completed.insert(id.to_string());
            }
            Settled::Failed => {
                self.failed.insert(id.to_string());
                self.cascade_failure(id);
            }
            Settled::Conflicted => {
                self.conflicted.insert(id.to_string());
            }
        }
    }

    /// Fail every item that transitively depends on a permanently failed
    /// one; none of them can ever become eligible.
    fn cascade_failure(&mut self, failed_id: &str) {
        let mut frontier = vec![failed_id.to_string()];
        while let Some(current) = frontier.pop() {
            let dependents: Vec<String> = self
                .items
                .values()
                .filter(|item| {
                    item.dependencies.contains(&current)
                        && !self.failed.contains(&item.id)
                        && !self.completed.contains(&item.id)
                })
                .map(|item| item.id.clone())
                .collect();
            for dependent in dependents {
                log::warn!(
                    "[PlanTracker] '{}' blocked by failed dependency '{}', marking failed",
                    dependent,
                    current
                );
                self.running.remove(&dependent);
                self.failed.insert(dependent.clone());
                frontier.push(dependent);
            }
        }
    }

    /// True once nothing is running and nothing more can start.
    pub fn is_finished(&self) -> bool {
        self.running.is_empty() && self.schedulable().is_empty()
    }

    pub fn completed_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.completed.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn failed_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.failed.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn conflicted_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.conflicted.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn item(&self, id: &str) -> Option<&WorkItem> {
        self.items.get(id)
    }

    /// Ids waiting behind the current frontier, for status display.
    /// Eligible-but-not-running items, so meaningful once admission ran.
    pub fn up_next(&self, limit: usize) -> Vec<String> {
        self.schedulable()
            .into_iter()
            .map(|item| item.id.clone())
            .take(limit)
            .collect()
    }
}
