use std::sync::Arc;

use crate::agent::Agent;
use crate::error::{OrchestrationError, RunError};
use crate::observer::ResponseObserver;
use crate::runtime::{History, Runtime};
use crate::state::{IterationUnit, OrchestrationState, RunDetails, RunReport, RunStatus, StepOutput};

/// Pipes the output of agent `i` verbatim into agent `i + 1`.
pub struct SequentialChain {
    agents: Vec<Arc<dyn Agent>>,
}

impl SequentialChain {
    pub fn new(agents: Vec<Arc<dyn Agent>>) -> Result<Self, OrchestrationError> {
        if agents.is_empty() {
            return Err(OrchestrationError::config(
                "sequential chain needs at least one agent",
            ));
        }
        Ok(Self { agents })
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

        let mut outputs = Vec::with_capacity(self.agents.len());
        let mut current = task.to_string();

        for agent in &self.agents {
            tracing::debug!(agent = %agent.name(), step = outputs.len() + 1, "chain step");
            // An empty response is still passed on as the next input.
            let result = runtime
                .respond(&mut state, observer, agent.as_ref(), &current, History::None)
                .await;
            let output = match result {
                Ok(output) => output,
                Err(err) => {
                    return Err(state.fail(err, &declared, RunDetails::Chain { outputs }));
                }
            };
            outputs.push(StepOutput {
                agent: agent.name().to_string(),
                output: output.clone(),
            });
            current = output;
        }

        Ok(state.finish(
            current,
            RunStatus::Completed,
            &declared,
            RunDetails::Chain { outputs },
        ))
    }
}
