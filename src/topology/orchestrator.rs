use std::sync::Arc;

use crate::agent::{Agent, AgentRegistry};
use crate::error::{OrchestrationError, RunError};
use crate::observer::ResponseObserver;
use crate::runtime::{History, Runtime};
use crate::state::{
    IterationUnit, OrchestrationState, RunDetails, RunReport, RunStatus, StepOutput,
};
use crate::termination::TerminationPolicy;
use crate::topology::parallel::merge_sections;
use crate::topology::plan::OrchestrationPlan;

pub const DEFAULT_MAX_ITERATIONS: u32 = 6;

/// Plan-and-delegate: the orchestrator writes a plan, named workers execute
/// it step by step over the shared history, and the orchestrator synthesizes
/// the result.
///
/// Every agent response, planning included, counts against the policy's
/// `max_iterations`. Hitting the cap stops execution early without failing.
pub struct OrchestratorWorkers {
    orchestrator: Arc<dyn Agent>,
    workers: AgentRegistry,
    policy: TerminationPolicy,
}

impl OrchestratorWorkers {
    pub fn new(
        orchestrator: Arc<dyn Agent>,
        workers: AgentRegistry,
        policy: TerminationPolicy,
    ) -> Result<Self, OrchestrationError> {
        if workers.is_empty() {
            return Err(OrchestrationError::config(
                "orchestrator needs at least one worker",
            ));
        }
        if workers.contains(orchestrator.name()) {
            return Err(OrchestrationError::config(format!(
                "orchestrator '{}' cannot also be a worker",
                orchestrator.name()
            )));
        }
        Ok(Self {
            orchestrator,
            workers,
            policy,
        })
    }

    pub fn planning_prompt(&self, task: &str) -> String {
        let names = self.workers.names().join(", ");
        format!(
            "Create a plan for the task below.\n\
             You may ONLY assign steps to these workers: {names}.\n\
             You may assign several steps to one worker and you do not need to use all of them.\n\
             Workers:\n{}\n\n\
             Reply with JSON only, in this format:\n\
             {{\"title\": \"<plan title>\", \"steps\": [{{\"agent\": \"<worker>\", \"description\": \"<instruction>\"}}]}}\n\n\
             Task:\n{task}",
            self.workers.describe_capabilities(),
        )
    }

    pub fn synthesis_prompt(&self, task: &str, plan: &OrchestrationPlan) -> String {
        format!(
            "All workers have replied to the plan '{}'. Combine their outputs from the \
             conversation into the final report for the task.\n\nTask:\n{}",
            plan.title, task
        )
    }

    pub async fn run(
        &self,
        runtime: &Runtime,
        observer: &dyn ResponseObserver,
        task: &str,
    ) -> Result<RunReport, RunError> {
        let declared = self.workers.names().to_vec();
        let mut state = OrchestrationState::new(IterationUnit::Response);
        state.record_task(task);

        let prompt = self.planning_prompt(task);
        let result = runtime
            .respond(
                &mut state,
                observer,
                self.orchestrator.as_ref(),
                &prompt,
                History::None,
            )
            .await;
        let plan_text = match result {
            Ok(text) => text,
            Err(err) => {
                return Err(state.fail(err, &declared, RunDetails::Plan {
                    plan: None,
                    completed_steps: 0,
                }));
            }
        };

        let plan = match OrchestrationPlan::parse(&plan_text, &declared) {
            Ok(plan) => plan,
            Err(err) => {
                tracing::warn!(error = %err, "orchestrator produced an invalid plan");
                return Err(state.fail(err.into(), &declared, RunDetails::Plan {
                    plan: None,
                    completed_steps: 0,
                }));
            }
        };
        tracing::info!(title = %plan.title, steps = plan.steps.len(), "plan accepted");

        let mut outputs: Vec<StepOutput> = Vec::with_capacity(plan.steps.len());
        let mut stopped_early = false;

        for (idx, step) in plan.steps.iter().enumerate() {
            if self.policy.is_exhausted(state.iterations()) {
                tracing::warn!(
                    iterations = state.iterations(),
                    max_iterations = self.policy.max_iterations(),
                    remaining_steps = plan.steps.len() - idx,
                    "iteration limit reached; stopping plan execution"
                );
                stopped_early = true;
                break;
            }

            let Some(worker) = self.workers.get(&step.agent).cloned() else {
                let err = OrchestrationError::config(format!(
                    "validated plan step names unregistered worker '{}'",
                    step.agent
                ));
                return Err(state.fail(err, &declared, RunDetails::Plan {
                    plan: Some(plan.clone()),
                    completed_steps: outputs.len(),
                }));
            };

            tracing::debug!(step = idx + 1, worker = %step.agent, "delegating plan step");
            let result = runtime
                .respond(
                    &mut state,
                    observer,
                    worker.as_ref(),
                    &step.description,
                    History::Conversation,
                )
                .await;
            match result {
                Ok(output) => outputs.push(StepOutput {
                    agent: step.agent.clone(),
                    output,
                }),
                Err(err) => {
                    let completed_steps = outputs.len();
                    return Err(state.fail(err, &declared, RunDetails::Plan {
                        plan: Some(plan),
                        completed_steps,
                    }));
                }
            }
        }

        if !stopped_early && self.policy.is_exhausted(state.iterations()) {
            tracing::warn!("iteration limit reached before synthesis");
            stopped_early = true;
        }

        let completed_steps = outputs.len();
        if stopped_early {
            let artifact = partial_synthesis(&plan, &outputs);
            return Ok(state.finish(
                artifact,
                RunStatus::StoppedEarly,
                &declared,
                RunDetails::Plan {
                    plan: Some(plan),
                    completed_steps,
                },
            ));
        }

        let prompt = self.synthesis_prompt(task, &plan);
        let result = runtime
            .respond(
                &mut state,
                observer,
                self.orchestrator.as_ref(),
                &prompt,
                History::Conversation,
            )
            .await;
        let details = RunDetails::Plan {
            plan: Some(plan),
            completed_steps,
        };
        match result {
            Ok(report) => Ok(state.finish(report, RunStatus::Completed, &declared, details)),
            Err(err) => Err(state.fail(err, &declared, details)),
        }
    }
}

/// Assembles the worker outputs gathered so far when synthesis cannot run.
pub fn partial_synthesis(plan: &OrchestrationPlan, outputs: &[StepOutput]) -> String {
    let mut out = format!(
        "# {} (stopped early: {}/{} steps)\n\n",
        plan.title,
        outputs.len(),
        plan.steps.len()
    );
    out.push_str(&merge_sections(outputs));
    out
}
