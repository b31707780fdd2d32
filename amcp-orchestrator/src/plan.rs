//! Task plan model: capability-tagged tasks forming a dependency DAG.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use amcp_primitives::CapabilityId;

/// Result alias for plan operations.
pub type PlanResult<T> = Result<T, PlanError>;

/// Errors surfaced by plan validation.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The plan contains no tasks.
    #[error("plan contains no tasks")]
    Empty,

    /// Two tasks share an identifier.
    #[error("duplicate task id `{task_id}`")]
    DuplicateTaskId {
        /// The repeated identifier.
        task_id: String,
    },

    /// A task depends on an identifier that does not exist in the plan.
    #[error("task `{task_id}` depends on unknown task `{dependency}`")]
    UnknownDependency {
        /// The depending task.
        task_id: String,
        /// The missing dependency id.
        dependency: String,
    },

    /// The dependency relation contains a cycle.
    #[error("task dependencies form a cycle")]
    DependencyCycle,

    /// A task names a capability no registered agent provides.
    #[error("no agent provides capability `{capability}`")]
    UnknownCapability {
        /// The unresolvable capability tag.
        capability: CapabilityId,
    },

    /// A capability tag in the raw plan failed validation.
    #[error(transparent)]
    InvalidCapability(#[from] amcp_primitives::Error),
}

/// Task urgency; defaults to medium when the planner omits it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Run before medium and low work.
    High,
    /// Default urgency.
    #[default]
    Medium,
    /// Run when nothing more urgent is pending.
    Low,
}

/// Sibling-branch behavior when one task fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPolicy {
    /// Keep independent branches running (default).
    #[default]
    Continue,
    /// Cancel the remaining tasks on the first failure.
    FailFast,
}

/// One capability-tagged unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskItem {
    /// Plan-unique identifier.
    pub task_id: String,
    /// Capability tag the task needs served.
    pub capability: CapabilityId,
    /// Optional preferred agent name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_agent_hint: Option<String>,
    /// Task parameters forwarded to the handling agent.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Identifiers of tasks that must complete first.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Urgency class.
    #[serde(default)]
    pub priority: Priority,
}

/// An ordered set of tasks with a validated dependency DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    /// The tasks in planner order.
    pub tasks: Vec<TaskItem>,
    /// Sibling failure policy.
    #[serde(default)]
    pub on_error: ErrorPolicy,
}

impl TaskPlan {
    /// Creates a plan from tasks with the default error policy.
    #[must_use]
    pub fn new(tasks: Vec<TaskItem>) -> Self {
        Self {
            tasks,
            on_error: ErrorPolicy::default(),
        }
    }

    /// Validates structure: unique ids, resolvable dependencies, acyclic
    /// graph, and capabilities covered by `known` or `fallback`.
    ///
    /// # Errors
    ///
    /// Returns the first violated [`PlanError`].
    pub fn validate(
        &self,
        known: &BTreeSet<CapabilityId>,
        fallback: &BTreeSet<CapabilityId>,
    ) -> PlanResult<()> {
        if self.tasks.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut ids = HashSet::new();
        for task in &self.tasks {
            if !ids.insert(task.task_id.as_str()) {
                return Err(PlanError::DuplicateTaskId {
                    task_id: task.task_id.clone(),
                });
            }
        }

        for task in &self.tasks {
            for dependency in &task.dependencies {
                if !ids.contains(dependency.as_str()) {
                    return Err(PlanError::UnknownDependency {
                        task_id: task.task_id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
            if !known.contains(&task.capability) && !fallback.contains(&task.capability) {
                return Err(PlanError::UnknownCapability {
                    capability: task.capability.clone(),
                });
            }
        }

        self.check_acyclic()
    }

    /// Kahn's algorithm over the dependency relation.
    fn check_acyclic(&self) -> PlanResult<()> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for task in &self.tasks {
            in_degree.insert(&task.task_id, task.dependencies.len());
            for dependency in &task.dependencies {
                dependents
                    .entry(dependency.as_str())
                    .or_default()
                    .push(&task.task_id);
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for dependent in dependents.get(id).into_iter().flatten() {
                let degree = in_degree
                    .get_mut(dependent)
                    .expect("dependent id exists in the plan");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if visited == self.tasks.len() {
            Ok(())
        } else {
            Err(PlanError::DependencyCycle)
        }
    }

    /// Returns tasks whose dependencies are all in `completed` and which are
    /// not themselves in `completed` or `abandoned`, most urgent first.
    #[must_use]
    pub fn runnable(
        &self,
        completed: &BTreeSet<String>,
        abandoned: &BTreeSet<String>,
    ) -> Vec<&TaskItem> {
        let mut ready: Vec<&TaskItem> = self
            .tasks
            .iter()
            .filter(|task| {
                !completed.contains(&task.task_id)
                    && !abandoned.contains(&task.task_id)
                    && task
                        .dependencies
                        .iter()
                        .all(|dependency| completed.contains(dependency))
            })
            .collect();
        ready.sort_by_key(|task| task.priority);
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capability(tag: &str) -> CapabilityId {
        CapabilityId::new(tag).expect("capability")
    }

    fn task(id: &str, cap: &str, deps: &[&str]) -> TaskItem {
        TaskItem {
            task_id: id.to_owned(),
            capability: capability(cap),
            target_agent_hint: None,
            params: Map::new(),
            dependencies: deps.iter().map(|d| (*d).to_owned()).collect(),
            priority: Priority::default(),
        }
    }

    fn known() -> BTreeSet<CapabilityId> {
        [capability("weather"), capability("travel")].into_iter().collect()
    }

    #[test]
    fn accepts_valid_dag() {
        let plan = TaskPlan::new(vec![
            task("t1", "weather", &[]),
            task("t2", "travel", &["t1"]),
        ]);
        plan.validate(&known(), &BTreeSet::new()).unwrap();
    }

    #[test]
    fn rejects_cycle() {
        let plan = TaskPlan::new(vec![
            task("t1", "weather", &["t2"]),
            task("t2", "travel", &["t1"]),
        ]);
        let err = plan.validate(&known(), &BTreeSet::new()).expect_err("cycle");
        assert!(matches!(err, PlanError::DependencyCycle));
    }

    #[test]
    fn rejects_unknown_dependency_and_capability() {
        let plan = TaskPlan::new(vec![task("t1", "weather", &["ghost"])]);
        assert!(matches!(
            plan.validate(&known(), &BTreeSet::new()),
            Err(PlanError::UnknownDependency { .. })
        ));

        let plan = TaskPlan::new(vec![task("t1", "stocks", &[])]);
        assert!(matches!(
            plan.validate(&known(), &BTreeSet::new()),
            Err(PlanError::UnknownCapability { .. })
        ));

        // A declared fallback set covers otherwise-unknown capabilities.
        let fallback: BTreeSet<CapabilityId> = [capability("stocks")].into_iter().collect();
        let plan = TaskPlan::new(vec![task("t1", "stocks", &[])]);
        plan.validate(&known(), &fallback).unwrap();
    }

    #[test]
    fn rejects_duplicate_ids_and_empty_plans() {
        let plan = TaskPlan::new(Vec::new());
        assert!(matches!(
            plan.validate(&known(), &BTreeSet::new()),
            Err(PlanError::Empty)
        ));

        let plan = TaskPlan::new(vec![task("t1", "weather", &[]), task("t1", "travel", &[])]);
        assert!(matches!(
            plan.validate(&known(), &BTreeSet::new()),
            Err(PlanError::DuplicateTaskId { .. })
        ));
    }

    #[test]
    fn runnable_releases_dependents_as_upstreams_complete() {
        let plan = TaskPlan::new(vec![
            task("t1", "weather", &[]),
            task("t2", "weather", &[]),
            task("t3", "travel", &["t1", "t2"]),
        ]);

        let completed = BTreeSet::new();
        let abandoned = BTreeSet::new();
        let wave: Vec<&str> = plan
            .runnable(&completed, &abandoned)
            .iter()
            .map(|t| t.task_id.as_str())
            .collect();
        assert_eq!(wave, vec!["t1", "t2"]);

        let completed: BTreeSet<String> = ["t1".to_owned(), "t2".to_owned()].into();
        let wave: Vec<&str> = plan
            .runnable(&completed, &abandoned)
            .iter()
            .map(|t| t.task_id.as_str())
            .collect();
        assert_eq!(wave, vec!["t3"]);
    }

    #[test]
    fn runnable_orders_by_priority() {
        let mut low = task("low", "weather", &[]);
        low.priority = Priority::Low;
        let mut high = task("high", "weather", &[]);
        high.priority = Priority::High;
        let plan = TaskPlan::new(vec![low, high]);

        let wave: Vec<&str> = plan
            .runnable(&BTreeSet::new(), &BTreeSet::new())
            .iter()
            .map(|t| t.task_id.as_str())
            .collect();
        assert_eq!(wave, vec!["high", "low"]);
    }
}
