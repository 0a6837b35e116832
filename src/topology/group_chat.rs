use std::sync::Arc;

use crate::agent::Agent;
use crate::error::{OrchestrationError, RunError};
use crate::observer::ResponseObserver;
use crate::runtime::{History, Runtime};
use crate::state::{IterationUnit, OrchestrationState, RunDetails, RunReport, RunStatus};
use crate::termination::TerminationPolicy;

/// Round-robin conversation over a shared history. Each turn sees everything
/// said so far; the chat ends when the policy is satisfied or exhausted.
pub struct GroupChat {
    agents: Vec<Arc<dyn Agent>>,
    policy: TerminationPolicy,
}

impl GroupChat {
    pub fn new(
        agents: Vec<Arc<dyn Agent>>,
        policy: TerminationPolicy,
    ) -> Result<Self, OrchestrationError> {
        if agents.is_empty() {
            return Err(OrchestrationError::config(
                "group chat needs at least one agent",
            ));
        }
        Ok(Self { agents, policy })
    }

    pub fn agent_names(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.name().to_string()).collect()
    }

    pub async fn run(
        &self,
        runtime: &Runtime,
        observer: &dyn ResponseObserver,
        task: &str,
    ) -> Result<RunReport, RunError> {
        let declared = self.agent_names();
        let mut state = OrchestrationState::new(IterationUnit::Response);
        state.record_task(task);

        let mut turn = 0usize;
        loop {
            if self.policy.is_exhausted(state.iterations()) {
                tracing::warn!(
                    turns = state.iterations(),
                    "group chat reached its turn limit without approval"
                );
                let artifact = last_response(&state).unwrap_or_default();
                return Ok(state.finish(artifact, RunStatus::Exhausted, &declared, RunDetails::None));
            }

            let agent = Arc::clone(&self.agents[turn % self.agents.len()]);
            turn += 1;
            let result = runtime
                .respond(
                    &mut state,
                    observer,
                    agent.as_ref(),
                    task,
                    History::Conversation,
                )
                .await;
            if let Err(err) = result {
                return Err(state.fail(err, &declared, RunDetails::None));
            }

            if self.policy.is_satisfied(state.history()) {
                tracing::info!(approver = %agent.name(), turns = state.iterations(), "group chat approved");
                let artifact = approved_artifact(&state);
                return Ok(state.finish(artifact, RunStatus::Approved, &declared, RunDetails::None));
            }
        }
    }
}

fn last_response(state: &OrchestrationState) -> Option<String> {
    state
        .responded_messages()
        .last()
        .map(|m| m.content().to_string())
}

/// The work being approved is the response before the approval itself.
fn approved_artifact(state: &OrchestrationState) -> String {
    let responses = state.responded_messages();
    match responses.as_slice() {
        [.., approved, _approval] => approved.content().to_string(),
        [only] => only.content().to_string(),
        [] => String::new(),
    }
}
