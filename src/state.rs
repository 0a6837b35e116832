use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::conversation::{Conversation, Message, Role, USER_AUTHOR};
use crate::error::{OrchestrationError, RunError};
use crate::topology::plan::OrchestrationPlan;

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn unix_ms_now() -> u128 {
    chrono::Utc::now().timestamp_millis().max(0) as u128
}

fn next_run_id() -> String {
    let seq = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("run-{}-{}-{}", unix_ms_now(), std::process::id(), seq)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Running,
    Completed,
    Declined,
    Approved,
    Exhausted,
    StoppedEarly,
    Failed,
}

impl RunStatus {
    pub fn label(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Declined => "declined",
            RunStatus::Approved => "approved",
            RunStatus::Exhausted => "exhausted",
            RunStatus::StoppedEarly => "stopped-early",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != RunStatus::Running
    }

    /// Terminal states that ended on a cap rather than on convergence.
    pub fn is_unresolved(self) -> bool {
        matches!(self, RunStatus::Exhausted | RunStatus::StoppedEarly)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What advances the iteration counter of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationUnit {
    Response,
    Round,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseEvent {
    pub run_id: String,
    pub agent: String,
    pub content: String,
    pub iteration: u32,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutput {
    pub agent: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OmittedBranch {
    pub agent: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum RunDetails {
    #[default]
    None,
    Chain {
        outputs: Vec<StepOutput>,
    },
    Route {
        selected: Option<String>,
    },
    FanIn {
        branches: Vec<StepOutput>,
        omitted: Vec<OmittedBranch>,
    },
    Plan {
        plan: Option<OrchestrationPlan>,
        completed_steps: usize,
    },
}

/// Mutable state of exactly one run; never shared between runs.
#[derive(Debug)]
pub struct OrchestrationState {
    run_id: String,
    unit: IterationUnit,
    iterations: u32,
    responses: u32,
    responded: Vec<String>,
    conversation: Conversation,
    status: RunStatus,
}

impl OrchestrationState {
    pub fn new(unit: IterationUnit) -> Self {
        Self {
            run_id: next_run_id(),
            unit,
            iterations: 0,
            responses: 0,
            responded: Vec::new(),
            conversation: Conversation::new(),
            status: RunStatus::Running,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn responses(&self) -> u32 {
        self.responses
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn history(&self) -> &[Message] {
        self.conversation.messages()
    }

    /// Agent names that responded at least once, in first-response order.
    pub fn responded(&self) -> &[String] {
        &self.responded
    }

    /// Assistant messages only, in append order.
    pub fn responded_messages(&self) -> Vec<&Message> {
        self.conversation
            .messages()
            .iter()
            .filter(|m| m.role() == Role::Assistant)
            .collect()
    }

    pub fn has_responded(&self, agent: &str) -> bool {
        self.responded.iter().any(|name| name == agent)
    }

    pub fn record_task(&mut self, task: &str) {
        self.conversation.append(USER_AUTHOR, Role::User, task);
    }

    pub fn record_response(&mut self, agent: &str, content: &str) -> ResponseEvent {
        let sequence = self
            .conversation
            .append(agent, Role::Assistant, content)
            .sequence();
        self.responses += 1;
        if self.unit == IterationUnit::Response {
            self.iterations += 1;
        }
        if !self.has_responded(agent) {
            self.responded.push(agent.to_string());
        }
        ResponseEvent {
            run_id: self.run_id.clone(),
            agent: agent.to_string(),
            content: content.to_string(),
            iteration: self.iterations,
            sequence,
        }
    }

    /// Marks one creator/critic style round as finished.
    pub fn complete_round(&mut self) {
        if self.unit == IterationUnit::Round {
            self.iterations += 1;
        }
    }

    pub fn finish(
        mut self,
        artifact: impl Into<String>,
        status: RunStatus,
        declared_workers: &[String],
        details: RunDetails,
    ) -> RunReport {
        self.status = status;
        let invoked = declared_workers
            .iter()
            .filter(|name| self.has_responded(name))
            .cloned()
            .collect();
        let unused = declared_workers
            .iter()
            .filter(|name| !self.has_responded(name))
            .cloned()
            .collect();
        RunReport {
            run_id: self.run_id,
            artifact: artifact.into(),
            status: self.status,
            iterations: self.iterations,
            responses: self.responses,
            trace: self.conversation.into_messages(),
            invoked,
            unused,
            details,
        }
    }

    /// Converts the state into a failed run, keeping the partial trace.
    pub fn fail(
        self,
        error: OrchestrationError,
        declared_workers: &[String],
        details: RunDetails,
    ) -> RunError {
        tracing::warn!(run_id = %self.run_id, error = %error, "orchestration run failed");
        let artifact = self
            .conversation
            .messages()
            .iter()
            .rev()
            .find(|m| m.role() == Role::Assistant)
            .map(|m| m.content().to_string())
            .unwrap_or_default();
        let report = self.finish(artifact, RunStatus::Failed, declared_workers, details);
        RunError {
            error,
            report: Box::new(report),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: String,
    pub artifact: String,
    pub status: RunStatus,
    pub iterations: u32,
    pub responses: u32,
    pub trace: Vec<Message>,
    pub invoked: Vec<String>,
    pub unused: Vec<String>,
    pub details: RunDetails,
}

impl RunReport {
    pub fn trace_authors(&self) -> Vec<&str> {
        self.trace.iter().map(Message::author).collect()
    }

    pub fn format_summary(&self) -> String {
        let mut summary = format!("## Orchestration Result: {}\n\n", self.status);
        summary.push_str(&format!("**Run:** {}\n", self.run_id));
        summary.push_str(&format!("**Iterations:** {}\n", self.iterations));
        summary.push_str(&format!("**Responses:** {}\n", self.responses));
        summary.push_str(&format!(
            "**Workers used:** {}\n",
            join_or_none(&self.invoked)
        ));
        summary.push_str(&format!(
            "**Workers not used:** {}\n",
            join_or_none(&self.unused)
        ));

        match &self.details {
            RunDetails::Route {
                selected: Some(worker),
            } => summary.push_str(&format!("**Routed to:** {}\n", worker)),
            RunDetails::FanIn { omitted, .. } if !omitted.is_empty() => {
                summary.push_str("### Omitted branches\n");
                for branch in omitted {
                    summary.push_str(&format!("- {}: {}\n", branch.agent, branch.reason));
                }
            }
            RunDetails::Plan {
                plan: Some(plan),
                completed_steps,
            } => summary.push_str(&format!(
                "**Plan:** {} ({}/{} steps)\n",
                plan.title,
                completed_steps,
                plan.steps.len()
            )),
            _ => {}
        }

        match self.status {
            RunStatus::Exhausted => summary.push_str(&format!(
                "\nIteration cap reached after {} iterations without approval; artifact is unresolved.\n",
                self.iterations
            )),
            RunStatus::StoppedEarly => summary.push_str(&format!(
                "\nExecution stopped early at the iteration limit ({} responses).\n",
                self.responses
            )),
            _ => {}
        }

        summary
    }
}

fn join_or_none(names: &[String]) -> String {
    if names.is_empty() {
        "None".to_string()
    } else {
        names.join(", ")
    }
}
