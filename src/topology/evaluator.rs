use std::sync::Arc;

use crate::agent::Agent;
use crate::error::{OrchestrationError, RunError};
use crate::observer::ResponseObserver;
use crate::runtime::{History, Runtime};
use crate::state::{IterationUnit, OrchestrationState, RunDetails, RunReport, RunStatus};
use crate::termination::TerminationPolicy;

pub const REVISE_LABEL: &str = "REVISE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Drafting,
    Critiquing,
    Revising,
    Approved,
    Exhausted,
}

/// Alternates a creator and a critic until the critic approves or the round
/// cap is reached. Rounds are strictly sequential.
pub struct EvaluatorOptimizer {
    creator: Arc<dyn Agent>,
    critic: Arc<dyn Agent>,
    policy: TerminationPolicy,
}

impl EvaluatorOptimizer {
    pub fn new(
        creator: Arc<dyn Agent>,
        critic: Arc<dyn Agent>,
        policy: TerminationPolicy,
    ) -> Result<Self, OrchestrationError> {
        if creator.name() == critic.name() {
            return Err(OrchestrationError::config(
                "creator and critic must be different agents",
            ));
        }
        if policy.keyword().is_none() {
            tracing::debug!("evaluator policy has no approval keyword; relying on custom predicate");
        }
        Ok(Self {
            creator,
            critic,
            policy,
        })
    }

    pub fn policy(&self) -> &TerminationPolicy {
        &self.policy
    }

    pub async fn run(
        &self,
        runtime: &Runtime,
        observer: &dyn ResponseObserver,
        task: &str,
    ) -> Result<RunReport, RunError> {
        let declared = vec![self.creator.name().to_string(), self.critic.name().to_string()];
        let mut state = OrchestrationState::new(IterationUnit::Round);
        state.record_task(task);

        let mut phase = LoopPhase::Drafting;
        let mut input = task.to_string();
        let mut draft = String::new();
        let mut review = String::new();

        loop {
            match phase {
                LoopPhase::Drafting => {
                    if self.policy.is_exhausted(state.iterations()) {
                        phase = LoopPhase::Exhausted;
                        continue;
                    }
                    let result = runtime
                        .respond(&mut state, observer, self.creator.as_ref(), &input, History::None)
                        .await;
                    draft = match result {
                        Ok(draft) => draft,
                        Err(err) => return Err(state.fail(err, &declared, RunDetails::None)),
                    };
                    phase = LoopPhase::Critiquing;
                }
                LoopPhase::Critiquing => {
                    let result = runtime
                        .respond(&mut state, observer, self.critic.as_ref(), &draft, History::None)
                        .await;
                    review = match result {
                        Ok(review) => review,
                        Err(err) => return Err(state.fail(err, &declared, RunDetails::None)),
                    };
                    state.complete_round();
                    phase = if self.policy.is_satisfied(state.history()) {
                        LoopPhase::Approved
                    } else {
                        LoopPhase::Revising
                    };
                    tracing::info!(
                        round = state.iterations(),
                        max_rounds = self.policy.max_iterations(),
                        approved = phase == LoopPhase::Approved,
                        "critique finished"
                    );
                }
                LoopPhase::Revising => {
                    input = revision_input(task, &review, &draft);
                    phase = LoopPhase::Drafting;
                }
                LoopPhase::Approved => {
                    return Ok(state.finish(review, RunStatus::Approved, &declared, RunDetails::None));
                }
                LoopPhase::Exhausted => {
                    tracing::warn!(
                        rounds = state.iterations(),
                        "round cap reached without approval; returning last draft"
                    );
                    return Ok(state.finish(draft, RunStatus::Exhausted, &declared, RunDetails::None));
                }
            }
        }
    }
}

/// Next creator input: the task, the labelled critic feedback and the prior draft.
pub fn revision_input(task: &str, review: &str, draft: &str) -> String {
    format!(
        "{task}\n\n{REVISE_LABEL}\nCritic feedback:\n{review}\n\nPrevious draft:\n{draft}"
    )
}
