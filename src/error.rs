use std::time::Duration;

use crate::state::RunReport;

/// Failure reported by the language model service for one invocation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelInvocationError {
    #[error("model call for agent '{agent}' timed out after {elapsed:?}")]
    Timeout { agent: String, elapsed: Duration },

    #[error("model rate limited agent '{agent}'")]
    RateLimited {
        agent: String,
        retry_after: Option<Duration>,
    },

    #[error("model service unavailable for agent '{agent}': {reason}")]
    Unavailable { agent: String, reason: String },

    #[error("malformed model response for agent '{agent}': {reason}")]
    MalformedResponse { agent: String, reason: String },

    #[error("model returned an empty response for agent '{agent}'")]
    EmptyResponse { agent: String },

    #[error("model rejected request for agent '{agent}': {reason}")]
    Rejected { agent: String, reason: String },

    #[error("agent '{agent}' still failing after {attempts} attempts: {last}")]
    RetriesExhausted {
        agent: String,
        attempts: u32,
        last: Box<ModelInvocationError>,
    },
}

impl ModelInvocationError {
    /// Timeouts, rate limits and unavailability may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ModelInvocationError::Timeout { .. }
                | ModelInvocationError::RateLimited { .. }
                | ModelInvocationError::Unavailable { .. }
        )
    }

    pub fn agent(&self) -> &str {
        match self {
            ModelInvocationError::Timeout { agent, .. }
            | ModelInvocationError::RateLimited { agent, .. }
            | ModelInvocationError::Unavailable { agent, .. }
            | ModelInvocationError::MalformedResponse { agent, .. }
            | ModelInvocationError::EmptyResponse { agent }
            | ModelInvocationError::Rejected { agent, .. }
            | ModelInvocationError::RetriesExhausted { agent, .. } => agent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RoutingError {
    #[error("router named unknown worker '{name}' (registered: {})", .registered.join(", "))]
    UnknownWorker {
        name: String,
        registered: Vec<String>,
    },

    #[error("router response is ambiguous between workers: {}", .candidates.join(", "))]
    Ambiguous { candidates: Vec<String> },

    #[error("router response did not name a worker")]
    EmptyResponse,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanValidationError {
    #[error("plan is not parsable: {reason}")]
    Unparsable { reason: String },

    #[error("plan output contains {blocks} fenced blocks; expected exactly one")]
    Ambiguous { blocks: usize },

    #[error("plan has no title")]
    MissingTitle,

    #[error("plan has no steps")]
    EmptyPlan,

    #[error("plan step {step} has an empty description")]
    EmptyStepDescription { step: usize },

    #[error(
        "plan step {step} names worker '{agent}' outside the permitted set ({})",
        .permitted.join(", ")
    )]
    UnknownWorker {
        step: usize,
        agent: String,
        permitted: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BranchFailure {
    pub agent: String,
    pub error: Box<OrchestrationError>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("fan-out failed in {} branch(es): {}", .failed.len(), describe_failures(.failed))]
pub struct PartialFailureError {
    pub failed: Vec<BranchFailure>,
}

impl PartialFailureError {
    pub fn failed_agents(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.agent.as_str()).collect()
    }
}

fn describe_failures(failed: &[BranchFailure]) -> String {
    failed
        .iter()
        .map(|f| format!("{} ({})", f.agent, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrchestrationError {
    #[error(transparent)]
    Model(#[from] ModelInvocationError),

    #[error("routing failed: {0}")]
    Routing(#[from] RoutingError),

    #[error("plan validation failed: {0}")]
    PlanValidation(#[from] PlanValidationError),

    #[error(transparent)]
    PartialFailure(#[from] PartialFailureError),

    #[error("orchestration cancelled before invoking agent '{next_agent}'")]
    Cancelled { next_agent: String },

    #[error("invalid workflow configuration: {0}")]
    Config(String),
}

impl OrchestrationError {
    pub fn config(message: impl Into<String>) -> Self {
        OrchestrationError::Config(message.into())
    }
}

/// A failed run. The report keeps every message produced before the failure.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct RunError {
    #[source]
    pub error: OrchestrationError,
    pub report: Box<RunReport>,
}

impl RunError {
    pub fn kind(&self) -> &OrchestrationError {
        &self.error
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Model,
    Routing,
    Plan,
    Workflow,
    Input,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Model => "MODEL",
            ErrorCategory::Routing => "ROUTING",
            ErrorCategory::Plan => "PLAN",
            ErrorCategory::Workflow => "WORKFLOW",
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Model => {
                "The model service failed. Raise --max-retries for transient failures or check the reply script."
            }
            ErrorCategory::Routing => {
                "The router reply must name exactly one registered worker, or the decline marker."
            }
            ErrorCategory::Plan => {
                "The orchestrator plan must be JSON with a title and steps naming permitted workers only."
            }
            ErrorCategory::Workflow => {
                "Run ensemble validate --workflow <file> and fix the reported agent or topology entries."
            }
            ErrorCategory::Input => "Run ensemble --help and correct command arguments.",
            ErrorCategory::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

fn categorize_orchestration_error(err: &OrchestrationError) -> ErrorCategory {
    match err {
        OrchestrationError::Model(_) | OrchestrationError::PartialFailure(_) => ErrorCategory::Model,
        OrchestrationError::Routing(_) => ErrorCategory::Routing,
        OrchestrationError::PlanValidation(_) => ErrorCategory::Plan,
        OrchestrationError::Config(_) => ErrorCategory::Workflow,
        OrchestrationError::Cancelled { .. } => ErrorCategory::Internal,
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    for cause in err.chain() {
        if let Some(run) = cause.downcast_ref::<RunError>() {
            return categorize_orchestration_error(&run.error);
        }
        if let Some(orch) = cause.downcast_ref::<OrchestrationError>() {
            return categorize_orchestration_error(orch);
        }
    }

    let msg = format!("{err:#}").to_ascii_lowercase();

    if msg.contains("workflow") || msg.contains("toml") || msg.contains("agent") {
        return ErrorCategory::Workflow;
    }

    if msg.contains("invalid value")
        || msg.contains("unknown argument")
        || msg.contains("failed to read input")
    {
        return ErrorCategory::Input;
    }

    ErrorCategory::Internal
}

pub fn format_cli_error(err: &anyhow::Error) -> String {
    let category = categorize_error(err);
    format!("[{}] {:#}\nHint: {}", category.code(), err, category.hint())
}
