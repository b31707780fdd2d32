//! LLM-backed decomposition of user requests into task plans.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use amcp_llm::{GenerationParams, LlmClient, LlmError};
use amcp_primitives::CapabilityId;
use amcp_prompts::{PromptLibrary, PromptTemplate, TemplateKey};

use crate::plan::{ErrorPolicy, PlanResult, Priority, TaskItem, TaskPlan};

const PLANNER_TEMPLATE: &str = "task-planner";
const PLANNER_VERSION: u32 = 1;

/// Planner configuration.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    model: Option<String>,
    default_chat_capability: CapabilityId,
}

impl PlannerConfig {
    /// Creates a configuration routing degraded plans to the given chat
    /// capability.
    #[must_use]
    pub fn new(default_chat_capability: CapabilityId) -> Self {
        Self {
            model: None,
            default_chat_capability,
        }
    }

    /// Pins the model used for planning calls.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Returns the capability degraded plans are routed to.
    #[must_use]
    pub fn default_chat_capability(&self) -> &CapabilityId {
        &self.default_chat_capability
    }
}

/// Outcome of a planning attempt.
#[derive(Debug, Clone)]
pub enum PlanOutcome {
    /// A validated plan ready for dispatch.
    Planned(TaskPlan),
    /// The model was unavailable; the rendered emergency response should be
    /// returned to the user directly, flagged as degraded.
    Degraded {
        /// Emergency response text.
        response: String,
    },
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    tasks: Vec<RawTask>,
    #[serde(default)]
    on_error: Option<ErrorPolicy>,
}

#[derive(Debug, Deserialize)]
struct RawTask {
    #[serde(default)]
    task_id: Option<String>,
    capability: String,
    #[serde(default)]
    target_agent_hint: Option<String>,
    #[serde(default)]
    params: Map<String, Value>,
    #[serde(default)]
    dependencies: BTreeSet<String>,
    #[serde(default)]
    priority: Option<Priority>,
}

/// Turns user queries into validated task plans through the LLM connector.
pub struct TaskPlanner {
    llm: Arc<LlmClient>,
    library: PromptLibrary,
    config: PlannerConfig,
}

impl TaskPlanner {
    /// Creates a planner, installing its versioned prompt templates.
    #[must_use]
    pub fn new(llm: Arc<LlmClient>, config: PlannerConfig) -> Self {
        let library = PromptLibrary::new();
        let template = PromptTemplate::builder(
            "You are the task planner of an agent mesh.\n\
             Available capabilities: {{capabilities}}\n\
             Decompose the user request into the smallest set of tasks that answers it.\n\
             Each task: task_id, capability (from the list), params object, dependencies \
             (array of task_id), priority (high|medium|low).\n\
             Respond ONLY with valid JSON shaped like:\n\
             {\"tasks\": [{\"task_id\": \"t1\", \"capability\": \"example\", \"params\": {}, \
             \"dependencies\": [], \"priority\": \"medium\"}]}\n\
             User request: {{query}}",
        )
        .with_required_variable("capabilities")
        .with_required_variable("query")
        .build()
        .expect("planner template is well-formed");
        library.insert(TemplateKey::new(PLANNER_TEMPLATE, PLANNER_VERSION), template);

        Self {
            llm,
            library,
            config,
        }
    }

    /// Returns the planner configuration.
    #[must_use]
    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Produces a task plan for the query against the known capability set.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError`] only for non-degradable connector failures; every
    /// model-quality problem resolves to a rule-based plan instead.
    pub async fn plan(
        &self,
        query: &str,
        known: &BTreeSet<CapabilityId>,
        trace_id: &str,
    ) -> Result<PlanOutcome, LlmError> {
        let template = self
            .library
            .get(PLANNER_TEMPLATE, PLANNER_VERSION)
            .expect("planner template installed in constructor");
        let mut variables = HashMap::new();
        variables.insert("query".to_owned(), query.to_owned());
        variables.insert(
            "capabilities".to_owned(),
            known
                .iter()
                .map(CapabilityId::as_str)
                .collect::<Vec<_>>()
                .join(", "),
        );
        let prompt = template
            .render_with(&variables)
            .map_err(|err| LlmError::configuration(err.to_string()))?;

        let reply = self
            .llm
            .generate(&prompt, self.config.model.as_deref(), &GenerationParams::default())
            .await?;

        if reply.is_degraded() {
            info!(trace_id, "planner degraded; returning emergency response");
            return Ok(PlanOutcome::Degraded {
                response: reply.into_text(),
            });
        }

        match self.parse_and_validate(reply.text(), known) {
            Ok(plan) => Ok(PlanOutcome::Planned(plan)),
            Err(reason) => {
                warn!(trace_id, reason, "plan unusable; falling back to chat routing");
                Ok(PlanOutcome::Planned(self.chat_fallback_plan(query)))
            }
        }
    }

    fn parse_and_validate(
        &self,
        raw_output: &str,
        known: &BTreeSet<CapabilityId>,
    ) -> Result<TaskPlan, String> {
        let parsed = self
            .parse_raw(raw_output)
            .or_else(|first_error| {
                // One repair attempt for malformed model output.
                let repaired = self
                    .llm
                    .fallback()
                    .repair_json(raw_output)
                    .ok_or_else(|| first_error.clone())?;
                debug!("planner output repaired");
                self.parse_raw(&repaired)
            })?;

        let plan = self.finalize(parsed).map_err(|err| err.to_string())?;
        let fallback: BTreeSet<CapabilityId> =
            [self.config.default_chat_capability.clone()].into_iter().collect();
        plan.validate(known, &fallback).map_err(|err| err.to_string())?;
        Ok(plan)
    }

    fn parse_raw(&self, raw_output: &str) -> Result<RawPlan, String> {
        let stripped = strip_code_fences(raw_output);
        serde_json::from_str(stripped).map_err(|err| err.to_string())
    }

    fn finalize(&self, raw: RawPlan) -> PlanResult<TaskPlan> {
        let mut tasks = Vec::with_capacity(raw.tasks.len());
        for (index, task) in raw.tasks.into_iter().enumerate() {
            tasks.push(TaskItem {
                task_id: task
                    .task_id
                    .filter(|id| !id.trim().is_empty())
                    .unwrap_or_else(|| format!("task-{}", index + 1)),
                capability: CapabilityId::new(task.capability)?,
                target_agent_hint: task.target_agent_hint,
                params: task.params,
                dependencies: task.dependencies,
                priority: task.priority.unwrap_or_default(),
            });
        }
        Ok(TaskPlan {
            tasks,
            on_error: raw.on_error.unwrap_or_default(),
        })
    }

    /// Single-task plan routing the raw query to the default chat agent.
    fn chat_fallback_plan(&self, query: &str) -> TaskPlan {
        let mut params = Map::new();
        params.insert("query".to_owned(), Value::String(query.to_owned()));
        TaskPlan::new(vec![TaskItem {
            task_id: format!("chat-{}", Uuid::new_v4()),
            capability: self.config.default_chat_capability.clone(),
            target_agent_hint: None,
            params,
            dependencies: BTreeSet::new(),
            priority: Priority::Medium,
        }])
    }
}

fn strip_code_fences(input: &str) -> &str {
    let trimmed = input.trim();
    let Some(body) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = body.split_once('\n').map_or(body, |(_, rest)| rest);
    body.strip_suffix("```").unwrap_or(body).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use amcp_llm::{BreakerConfig, FallbackManager, LlmConfig};

    fn planner(mock: bool) -> TaskPlanner {
        let config = if mock {
            LlmConfig::new("gemma3").with_mock_responses(true)
        } else {
            LlmConfig::new("gemma3")
                .with_base_url("http://127.0.0.1:9")
                .with_max_retries(0)
        };
        let llm = Arc::new(
            LlmClient::new(config, Arc::new(FallbackManager::new(BreakerConfig::default())))
                .unwrap(),
        );
        TaskPlanner::new(llm, PlannerConfig::new(CapabilityId::new("chat").unwrap()))
    }

    fn known() -> BTreeSet<CapabilityId> {
        [CapabilityId::new("weather").unwrap()].into_iter().collect()
    }

    #[test]
    fn parses_well_formed_output() {
        let planner = planner(true);
        let output = r#"{"tasks": [
            {"task_id": "t1", "capability": "weather", "params": {"city": "Paris"},
             "dependencies": [], "priority": "high"},
            {"capability": "weather", "params": {"city": "Rome"}, "dependencies": ["t1"]}
        ]}"#;
        let plan = planner.parse_and_validate(output, &known()).unwrap();
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[0].priority, Priority::High);
        // Missing id and priority were defaulted.
        assert_eq!(plan.tasks[1].task_id, "task-2");
        assert_eq!(plan.tasks[1].priority, Priority::Medium);
    }

    #[test]
    fn repairs_fenced_output_with_trailing_commas() {
        let planner = planner(true);
        let output = "```json\n{\"tasks\": [{\"task_id\": \"t1\", \"capability\": \"weather\", \
                      \"params\": {}, \"dependencies\": [],},]}\n```";
        let plan = planner.parse_and_validate(output, &known()).unwrap();
        assert_eq!(plan.tasks.len(), 1);
    }

    #[test]
    fn unusable_output_falls_back_to_chat_plan() {
        let planner = planner(true);
        assert!(planner.parse_and_validate("not json", &known()).is_err());
        let plan = planner.chat_fallback_plan("hello there");
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].capability.as_str(), "chat");
        assert_eq!(plan.tasks[0].params["query"], "hello there");
    }

    #[tokio::test]
    async fn unreachable_model_yields_degraded_outcome() {
        let planner = planner(false);
        let outcome = planner
            .plan("how to sort a list in code", &known(), "trace-1")
            .await
            .unwrap();
        match outcome {
            PlanOutcome::Degraded { response } => {
                assert!(response.contains("how to sort a list in code"));
            }
            PlanOutcome::Planned(_) => panic!("expected degraded outcome"),
        }
    }

    #[tokio::test]
    async fn mock_model_output_falls_back_to_chat_routing() {
        // The mock reply is not JSON, so the planner lands on the rule-based
        // single-task plan.
        let planner = planner(true);
        let outcome = planner
            .plan("weather in Paris", &known(), "trace-2")
            .await
            .unwrap();
        match outcome {
            PlanOutcome::Planned(plan) => {
                assert_eq!(plan.tasks.len(), 1);
                assert_eq!(plan.tasks[0].capability.as_str(), "chat");
            }
            PlanOutcome::Degraded { .. } => panic!("mock reply is live"),
        }
    }
}
