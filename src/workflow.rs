use std::sync::Arc;

use crate::agent::{Agent, AgentRegistry, ChatAgent};
use crate::cli::TopologyKind;
use crate::config::{FanInSetting, MergeSetting, WorkflowFile};
use crate::error::{OrchestrationError, RunError};
use crate::model::LanguageModel;
use crate::observer::ResponseObserver;
use crate::runtime::Runtime;
use crate::state::RunReport;
use crate::termination::TerminationPolicy;
use crate::topology::parallel::{merge_json, merge_sections};
use crate::topology::{
    CapabilityRouter, EvaluatorOptimizer, FanInMode, GroupChat, OrchestratorWorkers,
    ParallelFanOut, SequentialChain,
};

/// A topology built from a workflow file, ready to run.
pub enum Topology {
    Chain(SequentialChain),
    Router(CapabilityRouter),
    Parallel(ParallelFanOut),
    Evaluator(EvaluatorOptimizer),
    Orchestrator(OrchestratorWorkers),
    GroupChat(GroupChat),
}

impl Topology {
    pub fn kind(&self) -> TopologyKind {
        match self {
            Topology::Chain(_) => TopologyKind::Chain,
            Topology::Router(_) => TopologyKind::Router,
            Topology::Parallel(_) => TopologyKind::Parallel,
            Topology::Evaluator(_) => TopologyKind::Evaluator,
            Topology::Orchestrator(_) => TopologyKind::Orchestrator,
            Topology::GroupChat(_) => TopologyKind::GroupChat,
        }
    }

    pub async fn run(
        &self,
        runtime: &Runtime,
        observer: &dyn ResponseObserver,
        task: &str,
    ) -> Result<RunReport, RunError> {
        tracing::info!(topology = self.kind().label(), "orchestration run started");
        let result = match self {
            Topology::Chain(t) => t.run(runtime, observer, task).await,
            Topology::Router(t) => t.run(runtime, observer, task).await,
            Topology::Parallel(t) => t.run(runtime, observer, task).await,
            Topology::Evaluator(t) => t.run(runtime, observer, task).await,
            Topology::Orchestrator(t) => t.run(runtime, observer, task).await,
            Topology::GroupChat(t) => t.run(runtime, observer, task).await,
        };
        match &result {
            Ok(report) => tracing::info!(
                topology = self.kind().label(),
                run_id = %report.run_id,
                status = %report.status,
                iterations = report.iterations,
                "orchestration run finished"
            ),
            Err(err) => tracing::error!(
                topology = self.kind().label(),
                run_id = %err.report.run_id,
                error = %err,
                "orchestration run failed"
            ),
        }
        result
    }
}

/// One agent per `[[agents]]` entry, all backed by `model`.
pub fn build_agents(
    file: &WorkflowFile,
    model: Arc<dyn LanguageModel>,
) -> Result<AgentRegistry, OrchestrationError> {
    let mut registry = AgentRegistry::new();
    for spec in &file.agents {
        let agent = ChatAgent::from_spec(spec.clone(), Arc::clone(&model))?;
        registry.register(Arc::new(agent))?;
    }
    Ok(registry)
}

fn pick(agents: &AgentRegistry, names: &[String]) -> Result<Vec<Arc<dyn Agent>>, OrchestrationError> {
    names.iter().map(|name| agents.require(name)).collect()
}

fn pick_registry(
    agents: &AgentRegistry,
    names: &[String],
) -> Result<AgentRegistry, OrchestrationError> {
    AgentRegistry::from_agents(pick(agents, names)?)
}

fn missing_section(kind: TopologyKind) -> OrchestrationError {
    OrchestrationError::config(format!(
        "workflow has no [{}] table",
        kind.label().replace('-', "_")
    ))
}

/// Builds the requested topology. `max_iterations` overrides the file's cap
/// for the evaluator, orchestrator and group chat.
pub fn build_topology(
    kind: TopologyKind,
    file: &WorkflowFile,
    agents: &AgentRegistry,
    max_iterations: Option<u32>,
) -> Result<Topology, OrchestrationError> {
    match kind {
        TopologyKind::Chain => {
            let cfg = file.chain.as_ref().ok_or_else(|| missing_section(kind))?;
            Ok(Topology::Chain(SequentialChain::new(pick(agents, &cfg.agents)?)?))
        }
        TopologyKind::Router => {
            let cfg = file.router.as_ref().ok_or_else(|| missing_section(kind))?;
            let mut router = CapabilityRouter::new(
                agents.require(&cfg.orchestrator)?,
                pick_registry(agents, &cfg.workers)?,
            )?;
            if let Some(marker) = &cfg.decline_marker {
                router = router.with_decline_marker(marker.clone());
            }
            if let Some(message) = &cfg.fallback_message {
                router = router.with_fallback_message(message.clone());
            }
            Ok(Topology::Router(router))
        }
        TopologyKind::Parallel => {
            let cfg = file.parallel.as_ref().ok_or_else(|| missing_section(kind))?;
            let mode = match cfg.mode {
                FanInSetting::Strict => FanInMode::Strict,
                FanInSetting::BestEffort => FanInMode::BestEffort,
            };
            let fan_out = ParallelFanOut::new(pick_registry(agents, &cfg.workers)?)?.with_mode(mode);
            let fan_out = match cfg.merge {
                MergeSetting::Sections => fan_out.with_merge(merge_sections),
                MergeSetting::Json => fan_out.with_merge(merge_json),
            };
            Ok(Topology::Parallel(fan_out))
        }
        TopologyKind::Evaluator => {
            let cfg = file.evaluator.as_ref().ok_or_else(|| missing_section(kind))?;
            let policy = TerminationPolicy::new(max_iterations.unwrap_or(cfg.max_rounds))?
                .with_keyword(cfg.approval_keyword.clone());
            Ok(Topology::Evaluator(EvaluatorOptimizer::new(
                agents.require(&cfg.creator)?,
                agents.require(&cfg.critic)?,
                policy,
            )?))
        }
        TopologyKind::Orchestrator => {
            let cfg = file
                .orchestrator
                .as_ref()
                .ok_or_else(|| missing_section(kind))?;
            let policy = TerminationPolicy::new(max_iterations.unwrap_or(cfg.max_iterations))?;
            Ok(Topology::Orchestrator(OrchestratorWorkers::new(
                agents.require(&cfg.orchestrator)?,
                pick_registry(agents, &cfg.workers)?,
                policy,
            )?))
        }
        TopologyKind::GroupChat => {
            let cfg = file
                .group_chat
                .as_ref()
                .ok_or_else(|| missing_section(kind))?;
            let policy = TerminationPolicy::new(max_iterations.unwrap_or(cfg.max_turns))?
                .with_keyword(cfg.approval_keyword.clone());
            Ok(Topology::GroupChat(GroupChat::new(
                pick(agents, &cfg.agents)?,
                policy,
            )?))
        }
    }
}
