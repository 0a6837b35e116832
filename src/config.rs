use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::agent::AgentSpec;
use crate::cli::{Cli, TopologyKind};
use crate::error::OrchestrationError;
use crate::runtime::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_MS, RetryPolicy};
use crate::termination::DEFAULT_APPROVAL_KEYWORD;
use crate::topology::orchestrator::DEFAULT_MAX_ITERATIONS as DEFAULT_PLAN_ITERATIONS;

pub const DEFAULT_EVALUATOR_ROUNDS: u32 = 5;
pub const DEFAULT_GROUP_CHAT_TURNS: u32 = 10;
pub const DEFAULT_TRANSCRIPT_PATH: &str = ".ensemble/transcript.jsonl";

/// Effective settings for one invocation after CLI, workflow file and
/// defaults are merged.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub workflow_path: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub transcript_path: String,
}

impl RuntimeConfig {
    pub fn resolve(cli: &Cli, file: &WorkflowFile) -> Self {
        Self {
            workflow_path: cli.workflow.clone(),
            max_retries: cli
                .max_retries
                .or(file.runtime.max_retries)
                .unwrap_or(DEFAULT_MAX_RETRIES),
            retry_delay_ms: cli
                .retry_delay_ms
                .or(file.runtime.retry_delay_ms)
                .unwrap_or(DEFAULT_RETRY_DELAY_MS),
            transcript_path: cli
                .transcript
                .clone()
                .or(file.runtime.transcript_path.clone())
                .unwrap_or_else(|| DEFAULT_TRANSCRIPT_PATH.to_string()),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowFile {
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub runtime: RuntimeSection,
    pub chain: Option<ChainConfig>,
    pub router: Option<RouterConfig>,
    pub parallel: Option<ParallelConfig>,
    pub evaluator: Option<EvaluatorConfig>,
    pub orchestrator: Option<OrchestratorConfig>,
    pub group_chat: Option<GroupChatConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeSection {
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub transcript_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainConfig {
    pub agents: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    pub orchestrator: String,
    pub workers: Vec<String>,
    pub decline_marker: Option<String>,
    pub fallback_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FanInSetting {
    #[default]
    Strict,
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeSetting {
    #[default]
    Sections,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParallelConfig {
    pub workers: Vec<String>,
    #[serde(default)]
    pub mode: FanInSetting,
    #[serde(default)]
    pub merge: MergeSetting,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvaluatorConfig {
    pub creator: String,
    pub critic: String,
    #[serde(default = "default_evaluator_rounds")]
    pub max_rounds: u32,
    #[serde(default = "default_keyword")]
    pub approval_keyword: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorConfig {
    pub orchestrator: String,
    pub workers: Vec<String>,
    #[serde(default = "default_plan_iterations")]
    pub max_iterations: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupChatConfig {
    pub agents: Vec<String>,
    #[serde(default = "default_group_chat_turns")]
    pub max_turns: u32,
    #[serde(default = "default_keyword")]
    pub approval_keyword: String,
}

fn default_evaluator_rounds() -> u32 {
    DEFAULT_EVALUATOR_ROUNDS
}

fn default_plan_iterations() -> u32 {
    DEFAULT_PLAN_ITERATIONS
}

fn default_group_chat_turns() -> u32 {
    DEFAULT_GROUP_CHAT_TURNS
}

fn default_keyword() -> String {
    DEFAULT_APPROVAL_KEYWORD.to_string()
}

pub fn load_workflow(path: &Path) -> Result<WorkflowFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read workflow file '{}'", path.display()))?;
    parse_workflow(&content)
        .with_context(|| format!("invalid workflow configuration in '{}'", path.display()))
}

pub fn parse_workflow(content: &str) -> Result<WorkflowFile> {
    let file = toml::from_str::<WorkflowFile>(content)
        .context("check agent fields and topology table names")?;
    file.validate()?;
    Ok(file)
}

impl WorkflowFile {
    pub fn agent(&self, name: &str) -> Option<&AgentSpec> {
        self.agents.iter().find(|spec| spec.name == name)
    }

    pub fn agent_names(&self) -> Vec<&str> {
        self.agents.iter().map(|spec| spec.name.as_str()).collect()
    }

    /// Topologies this file configures, in CLI order.
    pub fn configured_topologies(&self) -> Vec<TopologyKind> {
        let mut kinds = Vec::new();
        if self.chain.is_some() {
            kinds.push(TopologyKind::Chain);
        }
        if self.router.is_some() {
            kinds.push(TopologyKind::Router);
        }
        if self.parallel.is_some() {
            kinds.push(TopologyKind::Parallel);
        }
        if self.evaluator.is_some() {
            kinds.push(TopologyKind::Evaluator);
        }
        if self.orchestrator.is_some() {
            kinds.push(TopologyKind::Orchestrator);
        }
        if self.group_chat.is_some() {
            kinds.push(TopologyKind::GroupChat);
        }
        kinds
    }

    /// Checks agent definitions and every name a topology table references.
    pub fn validate(&self) -> Result<(), OrchestrationError> {
        let mut seen = BTreeSet::new();
        for spec in &self.agents {
            spec.validate()?;
            if !seen.insert(spec.name.as_str()) {
                return Err(OrchestrationError::config(format!(
                    "agent '{}' is defined more than once",
                    spec.name
                )));
            }
        }

        if let Some(chain) = &self.chain {
            non_empty("chain.agents", &chain.agents)?;
            self.check_refs("chain.agents", &chain.agents)?;
        }
        if let Some(router) = &self.router {
            non_empty("router.workers", &router.workers)?;
            self.check_refs("router.orchestrator", std::slice::from_ref(&router.orchestrator))?;
            self.check_refs("router.workers", &router.workers)?;
            distinct("router.workers", &router.workers)?;
            if router.workers.contains(&router.orchestrator) {
                return Err(OrchestrationError::config(
                    "router.orchestrator cannot also be listed in router.workers",
                ));
            }
        }
        if let Some(parallel) = &self.parallel {
            if parallel.workers.len() < 2 {
                return Err(OrchestrationError::config(
                    "parallel.workers needs at least two agents",
                ));
            }
            self.check_refs("parallel.workers", &parallel.workers)?;
            distinct("parallel.workers", &parallel.workers)?;
        }
        if let Some(evaluator) = &self.evaluator {
            self.check_refs(
                "evaluator",
                &[evaluator.creator.clone(), evaluator.critic.clone()],
            )?;
            if evaluator.creator == evaluator.critic {
                return Err(OrchestrationError::config(
                    "evaluator.creator and evaluator.critic must differ",
                ));
            }
            positive("evaluator.max_rounds", evaluator.max_rounds)?;
        }
        if let Some(orchestrator) = &self.orchestrator {
            non_empty("orchestrator.workers", &orchestrator.workers)?;
            self.check_refs(
                "orchestrator.orchestrator",
                std::slice::from_ref(&orchestrator.orchestrator),
            )?;
            self.check_refs("orchestrator.workers", &orchestrator.workers)?;
            distinct("orchestrator.workers", &orchestrator.workers)?;
            if orchestrator.workers.contains(&orchestrator.orchestrator) {
                return Err(OrchestrationError::config(
                    "orchestrator.orchestrator cannot also be listed in orchestrator.workers",
                ));
            }
            positive("orchestrator.max_iterations", orchestrator.max_iterations)?;
        }
        if let Some(group) = &self.group_chat {
            non_empty("group_chat.agents", &group.agents)?;
            self.check_refs("group_chat.agents", &group.agents)?;
            positive("group_chat.max_turns", group.max_turns)?;
        }
        Ok(())
    }

    fn check_refs(&self, field: &str, names: &[String]) -> Result<(), OrchestrationError> {
        for name in names {
            if self.agent(name).is_none() {
                return Err(OrchestrationError::config(format!(
                    "{field} references unknown agent '{name}'. Defined agents: {}",
                    self.agent_names().join(", ")
                )));
            }
        }
        Ok(())
    }
}

fn non_empty(field: &str, names: &[String]) -> Result<(), OrchestrationError> {
    if names.is_empty() {
        return Err(OrchestrationError::config(format!(
            "{field} must list at least one agent"
        )));
    }
    Ok(())
}

fn distinct(field: &str, names: &[String]) -> Result<(), OrchestrationError> {
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(OrchestrationError::config(format!(
                "{field} lists '{name}' more than once"
            )));
        }
    }
    Ok(())
}

fn positive(field: &str, value: u32) -> Result<(), OrchestrationError> {
    if value == 0 {
        return Err(OrchestrationError::config(format!(
            "{field} must be greater than zero"
        )));
    }
    Ok(())
}
