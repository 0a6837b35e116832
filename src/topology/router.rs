use std::sync::Arc;

use crate::agent::{Agent, AgentRegistry};
use crate::error::{OrchestrationError, RoutingError, RunError};
use crate::observer::ResponseObserver;
use crate::runtime::{History, Runtime};
use crate::state::{IterationUnit, OrchestrationState, RunDetails, RunReport, RunStatus};

pub const DEFAULT_DECLINE_MARKER: &str = "NONE";
pub const DEFAULT_FALLBACK_MESSAGE: &str = "I do not have analysts that can help with that.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Worker(String),
    Decline,
}

/// Delegates a task to exactly one worker chosen by an orchestrator agent.
pub struct CapabilityRouter {
    orchestrator: Arc<dyn Agent>,
    workers: AgentRegistry,
    decline_marker: String,
    fallback_message: String,
}

impl CapabilityRouter {
    pub fn new(
        orchestrator: Arc<dyn Agent>,
        workers: AgentRegistry,
    ) -> Result<Self, OrchestrationError> {
        if workers.is_empty() {
            return Err(OrchestrationError::config("router needs at least one worker"));
        }
        if workers.contains(orchestrator.name()) {
            return Err(OrchestrationError::config(format!(
                "router orchestrator '{}' cannot also be a worker",
                orchestrator.name()
            )));
        }
        Ok(Self {
            orchestrator,
            workers,
            decline_marker: DEFAULT_DECLINE_MARKER.to_string(),
            fallback_message: DEFAULT_FALLBACK_MESSAGE.to_string(),
        })
    }

    pub fn with_decline_marker(mut self, marker: impl Into<String>) -> Self {
        self.decline_marker = marker.into();
        self
    }

    pub fn with_fallback_message(mut self, message: impl Into<String>) -> Self {
        self.fallback_message = message.into();
        self
    }

    pub fn routing_prompt(&self, task: &str) -> String {
        format!(
            "Route the request to exactly one worker.\n\
             Workers:\n{}\n\n\
             Reply with the worker name only, on the first line. If no worker can \
             help, reply with {}.\n\n\
             Request:\n{}",
            self.workers.describe_capabilities(),
            self.decline_marker,
            task
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

        let prompt = self.routing_prompt(task);
        let result = runtime
            .respond(
                &mut state,
                observer,
                self.orchestrator.as_ref(),
                &prompt,
                History::None,
            )
            .await;
        let reply = match result {
            Ok(reply) => reply,
            Err(err) => return Err(state.fail(err, &declared, RunDetails::Route { selected: None })),
        };

        let decision = match resolve_route(&reply, &self.workers, &self.decline_marker) {
            Ok(decision) => decision,
            Err(err) => {
                tracing::warn!(reply = %reply, error = %err, "router reply could not be resolved");
                return Err(state.fail(err.into(), &declared, RunDetails::Route { selected: None }));
            }
        };

        let worker_name = match decision {
            RouteDecision::Decline => {
                tracing::info!(orchestrator = %self.orchestrator.name(), "router declined the request");
                return Ok(state.finish(
                    self.fallback_message.clone(),
                    RunStatus::Declined,
                    &declared,
                    RunDetails::Route { selected: None },
                ));
            }
            RouteDecision::Worker(name) => name,
        };

        tracing::info!(worker = %worker_name, "request routed");
        let Some(worker) = self.workers.get(&worker_name).cloned() else {
            // resolve_route only returns registered names
            let err = RoutingError::UnknownWorker {
                name: worker_name,
                registered: declared.clone(),
            };
            return Err(state.fail(err.into(), &declared, RunDetails::Route { selected: None }));
        };

        let selected = Some(worker_name);
        let result = runtime
            .respond(&mut state, observer, worker.as_ref(), task, History::None)
            .await;
        match result {
            Ok(output) => Ok(state.finish(
                output,
                RunStatus::Completed,
                &declared,
                RunDetails::Route { selected },
            )),
            Err(err) => Err(state.fail(err, &declared, RunDetails::Route { selected })),
        }
    }
}

fn clean_route_line(reply: &str) -> &str {
    let line = reply
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    let line = line.trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '*' | '.' | ':' | '!'));
    line.strip_prefix('@').unwrap_or(line).trim()
}

/// Resolves an orchestrator reply to one registered worker or a decline.
///
/// The first non-empty line must be the worker name (case-insensitive) or the
/// decline marker. Replies naming several workers, or none, are errors.
pub fn resolve_route(
    reply: &str,
    workers: &AgentRegistry,
    decline_marker: &str,
) -> Result<RouteDecision, RoutingError> {
    let candidate = clean_route_line(reply);
    if candidate.is_empty() {
        return Err(RoutingError::EmptyResponse);
    }
    if candidate.eq_ignore_ascii_case(decline_marker.trim()) {
        return Ok(RouteDecision::Decline);
    }

    let exact = workers
        .names()
        .iter()
        .filter(|name| name.eq_ignore_ascii_case(candidate))
        .cloned()
        .collect::<Vec<_>>();
    match exact.len() {
        1 => return Ok(RouteDecision::Worker(exact[0].clone())),
        0 => {}
        _ => return Err(RoutingError::Ambiguous { candidates: exact }),
    }

    let lowered = reply.to_lowercase();
    let mentioned = workers
        .names()
        .iter()
        .filter(|name| lowered.contains(&name.to_lowercase()))
        .cloned()
        .collect::<Vec<_>>();
    if mentioned.len() > 1 {
        return Err(RoutingError::Ambiguous {
            candidates: mentioned,
        });
    }

    Err(RoutingError::UnknownWorker {
        name: candidate.to_string(),
        registered: workers.names().to_vec(),
    })
}
