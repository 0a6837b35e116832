use std::fmt;
use std::sync::Arc;

use futures::future::join_all;

use crate::agent::AgentRegistry;
use crate::error::{BranchFailure, OrchestrationError, PartialFailureError, RunError};
use crate::observer::ResponseObserver;
use crate::runtime::Runtime;
use crate::state::{
    IterationUnit, OmittedBranch, OrchestrationState, RunDetails, RunReport, RunStatus, StepOutput,
};

/// Combines branch outputs, given in registration order, into one artifact.
pub type MergeFn = Arc<dyn Fn(&[StepOutput]) -> String + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FanInMode {
    /// Any failed branch fails the whole fan-out.
    #[default]
    Strict,
    /// Merge the branches that succeeded and report the rest as omitted.
    BestEffort,
}

/// Default merge: one markdown section per branch.
pub fn merge_sections(branches: &[StepOutput]) -> String {
    branches
        .iter()
        .map(|b| format!("## {}\n{}", b.agent, b.output.trim_end()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// JSON object keyed by worker name, keys in registration order.
pub fn merge_json(branches: &[StepOutput]) -> String {
    let fields = branches
        .iter()
        .map(|b| {
            format!(
                "{}: {}",
                serde_json::Value::String(b.agent.clone()),
                serde_json::Value::String(b.output.clone())
            )
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("{{{}}}", fields)
}

/// Runs independent workers concurrently on one input and merges the results
/// once every branch has settled.
pub struct ParallelFanOut {
    workers: AgentRegistry,
    mode: FanInMode,
    merge: MergeFn,
}

impl ParallelFanOut {
    pub fn new(workers: AgentRegistry) -> Result<Self, OrchestrationError> {
        if workers.len() < 2 {
            return Err(OrchestrationError::config(
                "parallel fan-out needs at least two workers",
            ));
        }
        Ok(Self {
            workers,
            mode: FanInMode::Strict,
            merge: Arc::new(merge_sections),
        })
    }

    pub fn with_mode(mut self, mode: FanInMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_merge(
        mut self,
        merge: impl Fn(&[StepOutput]) -> String + Send + Sync + 'static,
    ) -> Self {
        self.merge = Arc::new(merge);
        self
    }

    pub fn mode(&self) -> FanInMode {
        self.mode
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

        if let Some(first) = declared.first()
            && let Err(err) = runtime.ensure_running(first)
        {
            return Err(state.fail(err, &declared, RunDetails::FanIn {
                branches: Vec::new(),
                omitted: Vec::new(),
            }));
        }

        tracing::info!(branches = declared.len(), mode = ?self.mode, "fan-out started");
        // Branches share only the read-only task; each resolves into its own slot.
        let calls = self.workers.iter().map(|agent| {
            let agent = Arc::clone(agent);
            async move {
                let result = runtime.call(agent.as_ref(), task, &[]).await;
                (agent.name().to_string(), result)
            }
        });
        let settled = join_all(calls).await;
        tracing::info!(branches = settled.len(), "fan-in barrier reached");

        let mut branches = Vec::new();
        let mut failed = Vec::new();
        for (agent, result) in settled {
            match result {
                Ok(output) => {
                    let event = state.record_response(&agent, &output);
                    observer.on_response(&event);
                    branches.push(StepOutput { agent, output });
                }
                Err(err) => {
                    tracing::warn!(agent = %agent, error = %err, "fan-out branch failed");
                    failed.push(BranchFailure {
                        agent,
                        error: Box::new(err),
                    });
                }
            }
        }

        let omitted = failed
            .iter()
            .map(|f| OmittedBranch {
                agent: f.agent.clone(),
                reason: f.error.to_string(),
            })
            .collect::<Vec<_>>();

        if !failed.is_empty() && (self.mode == FanInMode::Strict || branches.is_empty()) {
            let err = OrchestrationError::PartialFailure(PartialFailureError { failed });
            return Err(state.fail(err, &declared, RunDetails::FanIn { branches, omitted }));
        }

        let artifact = (self.merge)(&branches);
        Ok(state.finish(
            artifact,
            RunStatus::Completed,
            &declared,
            RunDetails::FanIn { branches, omitted },
        ))
    }
}

impl fmt::Debug for ParallelFanOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelFanOut")
            .field("workers", &self.workers)
            .field("mode", &self.mode)
            .finish()
    }
}
