use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tempfile::tempdir;

use crate::agent::*;
use crate::cli::*;
use crate::config::*;
use crate::conversation::*;
use crate::error::*;
use crate::model::*;
use crate::observer::*;
use crate::persistence::*;
use crate::runner::*;
use crate::runtime::*;
use crate::state::*;
use crate::termination::*;
use crate::topology::evaluator::revision_input;
use crate::topology::orchestrator::partial_synthesis;
use crate::topology::parallel::{merge_json, merge_sections};
use crate::topology::router::{DEFAULT_FALLBACK_MESSAGE, RouteDecision, resolve_route};
use crate::topology::*;
use crate::transcript::*;
use crate::workflow::*;

fn fast_runtime() -> Runtime {
    Runtime::new(RetryPolicy {
        max_retries: 2,
        delay: Duration::ZERO,
    })
}

fn chat_agent(model: &Arc<ScriptedModel>, name: &str, description: &str) -> Arc<dyn Agent> {
    let spec = AgentSpec::new(name, description, format!("You are {name}."));
    Arc::new(
        ChatAgent::from_spec(spec, Arc::clone(model) as Arc<dyn LanguageModel>)
            .expect("agent should build"),
    )
}

fn agents(model: &Arc<ScriptedModel>, names: &[&str]) -> Vec<Arc<dyn Agent>> {
    names
        .iter()
        .map(|name| chat_agent(model, name, &format!("{name} capability")))
        .collect()
}

fn registry(model: &Arc<ScriptedModel>, names: &[&str]) -> AgentRegistry {
    AgentRegistry::from_agents(agents(model, names)).expect("registry should build")
}

fn inputs(calls: &[ModelRequest]) -> Vec<String> {
    calls.iter().map(|call| call.input.clone()).collect()
}

fn trace_contents(report: &RunReport) -> Vec<(String, String)> {
    report
        .trace
        .iter()
        .map(|m| (m.author().to_string(), m.content().to_string()))
        .collect()
}

/// Test agent that tracks how many invocations overlap.
struct ProbeAgent {
    name: String,
    delay: Duration,
    reply: String,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

#[async_trait]
impl Agent for ProbeAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "probe"
    }

    async fn invoke(
        &self,
        _input: &str,
        _history: &[Message],
    ) -> Result<FragmentStream, ModelInvocationError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(fragments_stream(vec![self.reply.clone()]))
    }
}

const ENGINE_PLAN: &str = r#"{
  "title": "Fleet review",
  "steps": [
    {"agent": "EngineAnalyst", "description": "Review engine vibration"},
    {"agent": "FuelAnalyst", "description": "Review fuel burn"}
  ]
}"#;

// --- conversation and agents ---

#[test]
fn conversation_sequences_start_at_one_and_increase() {
    let mut conversation = Conversation::new();
    conversation.append(USER_AUTHOR, Role::User, "task");
    conversation.append("A", Role::Assistant, "first");
    conversation.append("B", Role::Assistant, "");

    let sequences = conversation
        .messages()
        .iter()
        .map(Message::sequence)
        .collect::<Vec<_>>();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert_eq!(conversation.by_author("A").count(), 1);
    assert_eq!(conversation.last().map(Message::content), Some(""));
}

#[test]
fn agent_spec_rejects_invalid_parameters() {
    let spec = AgentSpec::new("Writer", "writes", "Write.");
    assert_eq!(spec.temperature, DEFAULT_TEMPERATURE);
    assert_eq!(spec.max_tokens, DEFAULT_MAX_TOKENS);
    assert!(spec.validate().is_ok());

    assert!(spec.clone().with_temperature(2.5).validate().is_err());
    assert!(spec.clone().with_max_tokens(0).validate().is_err());
    assert!(AgentSpec::new(" Writer", "", "").validate().is_err());
    assert!(AgentSpec::new("", "", "").validate().is_err());
}

#[test]
fn registry_keeps_registration_order_and_rejects_duplicates() {
    let model = Arc::new(ScriptedModel::new());
    let mut reg = registry(&model, &["B", "A", "C"]);
    assert_eq!(reg.names(), ["B", "A", "C"]);
    assert!(reg.require("missing").is_err());

    let err = reg
        .register(chat_agent(&model, "A", "again"))
        .expect_err("duplicate should be rejected");
    assert!(matches!(err, OrchestrationError::Config(_)));
    assert!(reg.describe_capabilities().starts_with("- B: B capability"));
}

#[tokio::test]
async fn chat_agent_streams_fragments_that_concatenate_to_the_reply() {
    let model = Arc::new(ScriptedModel::new().with_fragments("Writer", &["Hel", "lo ", "world"]));
    let agent = chat_agent(&model, "Writer", "writes");

    let stream = agent.invoke("hi", &[]).await.expect("invoke should succeed");
    let text = collect_response(stream).await.expect("stream should drain");
    assert_eq!(text, "Hello world");

    let call = &model.calls_for("Writer")[0];
    assert_eq!(call.instructions, "You are Writer.");
    assert_eq!(call.parameters, ModelParameters::default());
}

// --- sequential chain ---

#[tokio::test]
async fn chain_invokes_each_agent_once_in_order_passing_outputs() {
    let model = Arc::new(
        ScriptedModel::new()
            .with_reply("Extractor", "facts")
            .with_reply("Summarizer", "summary")
            .with_reply("Formatter", "final"),
    );
    let chain = SequentialChain::new(agents(&model, &["Extractor", "Summarizer", "Formatter"]))
        .expect("chain should build");

    let report = chain
        .run(&fast_runtime(), &NoopObserver, "raw text")
        .await
        .expect("chain should run");

    assert_eq!(report.artifact, "final");
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.responses, 3);
    assert_eq!(report.iterations, 3);
    assert_eq!(
        report.trace_authors(),
        vec![USER_AUTHOR, "Extractor", "Summarizer", "Formatter"]
    );
    assert_eq!(inputs(&model.calls()), vec!["raw text", "facts", "summary"]);
    assert!(model.calls().iter().all(|call| call.history.is_empty()));
}

#[tokio::test]
async fn chain_passes_empty_output_to_the_next_step() {
    let model = Arc::new(ScriptedModel::new().with_reply("A", "").with_reply("B", "done"));
    let chain = SequentialChain::new(agents(&model, &["A", "B"])).expect("chain should build");

    let report = chain
        .run(&fast_runtime(), &NoopObserver, "task")
        .await
        .expect("empty output is not an error");

    assert_eq!(report.artifact, "done");
    assert_eq!(model.calls_for("B")[0].input, "");
}

#[tokio::test]
async fn chain_of_echo_agents_tags_each_step() {
    let model: Arc<dyn LanguageModel> = Arc::new(EchoModel);
    let first: Arc<dyn Agent> = Arc::new(
        ChatAgent::from_spec(AgentSpec::new("A", "", ""), Arc::clone(&model)).expect("A builds"),
    );
    let second: Arc<dyn Agent> =
        Arc::new(ChatAgent::from_spec(AgentSpec::new("B", "", ""), model).expect("B builds"));
    let chain = SequentialChain::new(vec![first, second]).expect("chain should build");

    let report = chain
        .run(&fast_runtime(), &NoopObserver, "task")
        .await
        .expect("chain should run");
    assert_eq!(report.artifact, "[B] [A] task");
}

#[tokio::test]
async fn rerunning_chain_and_router_yields_identical_traces() {
    let model = Arc::new(
        ScriptedModel::new()
            .with_reply("A", "one")
            .with_reply("B", "two")
            .with_reply("Router", "B"),
    );
    let runtime = fast_runtime();

    let chain = SequentialChain::new(agents(&model, &["A", "B"])).expect("chain should build");
    let first = chain.run(&runtime, &NoopObserver, "task").await.expect("first run");
    let second = chain.run(&runtime, &NoopObserver, "task").await.expect("second run");
    assert_eq!(trace_contents(&first), trace_contents(&second));
    assert_ne!(first.run_id, second.run_id);

    let router = CapabilityRouter::new(chat_agent(&model, "Router", ""), registry(&model, &["A", "B"]))
        .expect("router should build");
    let first = router.run(&runtime, &NoopObserver, "task").await.expect("first route");
    let second = router.run(&runtime, &NoopObserver, "task").await.expect("second route");
    assert_eq!(trace_contents(&first), trace_contents(&second));
    assert_eq!(first.responses, second.responses);
}

// --- capability router ---

#[tokio::test]
async fn router_invokes_only_the_named_worker_with_the_unmodified_task() {
    let model = Arc::new(
        ScriptedModel::new()
            .with_reply("Orchestrator", "**MathAgent**\nIt handles arithmetic.")
            .with_reply("MathAgent", "42")
            .with_reply("TranslationAgent", "hola"),
    );
    let router = CapabilityRouter::new(
        chat_agent(&model, "Orchestrator", "routes"),
        registry(&model, &["MathAgent", "TranslationAgent"]),
    )
    .expect("router should build");

    let report = router
        .run(&fast_runtime(), &NoopObserver, "What is 6 x 7?")
        .await
        .expect("router should run");

    assert_eq!(report.artifact, "42");
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(model.calls_for("MathAgent").len(), 1);
    assert_eq!(model.calls_for("MathAgent")[0].input, "What is 6 x 7?");
    assert!(model.calls_for("TranslationAgent").is_empty());
    assert_eq!(report.invoked, vec!["MathAgent"]);
    assert_eq!(report.unused, vec!["TranslationAgent"]);
    assert_eq!(
        report.details,
        RunDetails::Route {
            selected: Some("MathAgent".to_string())
        }
    );

    let prompt = &model.calls_for("Orchestrator")[0].input;
    assert!(prompt.contains("- MathAgent: MathAgent capability"));
    assert!(prompt.contains("What is 6 x 7?"));
}

#[tokio::test]
async fn router_fails_closed_on_unknown_worker() {
    let model = Arc::new(
        ScriptedModel::new()
            .with_reply("Orchestrator", "MarketingAgent")
            .with_reply("MathAgent", "42"),
    );
    let router = CapabilityRouter::new(
        chat_agent(&model, "Orchestrator", ""),
        registry(&model, &["MathAgent", "TranslationAgent"]),
    )
    .expect("router should build");

    let err = router
        .run(&fast_runtime(), &NoopObserver, "Sell this")
        .await
        .expect_err("unknown worker should fail");

    match err.kind() {
        OrchestrationError::Routing(RoutingError::UnknownWorker { name, .. }) => {
            assert_eq!(name, "MarketingAgent")
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.report.status, RunStatus::Failed);
    assert_eq!(err.report.responses, 1);
    assert!(model.calls_for("MathAgent").is_empty());
}

#[tokio::test]
async fn router_decline_returns_fallback_without_invoking_workers() {
    let model = Arc::new(ScriptedModel::new().with_reply("Orchestrator", "none."));
    let router = CapabilityRouter::new(
        chat_agent(&model, "Orchestrator", ""),
        registry(&model, &["MathAgent", "TranslationAgent"]),
    )
    .expect("router should build");

    let report = router
        .run(&fast_runtime(), &NoopObserver, "Paint my fence")
        .await
        .expect("decline is not an error");

    assert_eq!(report.status, RunStatus::Declined);
    assert_eq!(report.artifact, DEFAULT_FALLBACK_MESSAGE);
    assert_eq!(model.calls().len(), 1);
    assert_eq!(report.unused.len(), 2);
}

#[test]
fn resolve_route_matches_case_insensitively_and_rejects_ambiguity() {
    let model = Arc::new(ScriptedModel::new());
    let workers = registry(&model, &["EngineAnalyst", "FuelAnalyst"]);

    assert_eq!(
        resolve_route("@engineanalyst.", &workers, "NONE"),
        Ok(RouteDecision::Worker("EngineAnalyst".to_string()))
    );
    assert_eq!(resolve_route("NONE", &workers, "NONE"), Ok(RouteDecision::Decline));
    assert!(matches!(
        resolve_route("EngineAnalyst or FuelAnalyst", &workers, "NONE"),
        Err(RoutingError::Ambiguous { .. })
    ));
    assert_eq!(
        resolve_route("  \n ", &workers, "NONE"),
        Err(RoutingError::EmptyResponse)
    );
}

#[test]
fn router_rejects_orchestrator_that_is_also_a_worker() {
    let model = Arc::new(ScriptedModel::new());
    let result = CapabilityRouter::new(
        chat_agent(&model, "A", ""),
        registry(&model, &["A", "B"]),
    );
    assert!(result.is_err());
}

// --- parallel fan-out ---

#[tokio::test]
async fn fan_out_runs_branches_concurrently_and_merges_in_registration_order() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let probe = |name: &str, ms: u64| -> Arc<dyn Agent> {
        Arc::new(ProbeAgent {
            name: name.to_string(),
            delay: Duration::from_millis(ms),
            reply: format!("{name} done"),
            in_flight: Arc::clone(&in_flight),
            peak: Arc::clone(&peak),
            finished: Arc::clone(&finished),
        })
    };
    let workers = AgentRegistry::from_agents(vec![probe("A", 10), probe("B", 50), probe("C", 5)])
        .expect("registry should build");
    let fan_out = ParallelFanOut::new(workers).expect("fan-out should build");
    let (observer, mut rx) = ChannelObserver::new();

    let report = fan_out
        .run(&fast_runtime(), &observer, "analyze")
        .await
        .expect("fan-out should succeed");

    assert_eq!(finished.load(Ordering::SeqCst), 3);
    assert_eq!(peak.load(Ordering::SeqCst), 3);
    assert_eq!(report.artifact, "## A\nA done\n\n## B\nB done\n\n## C\nC done");
    assert_eq!(report.trace_authors(), vec![USER_AUTHOR, "A", "B", "C"]);

    let mut observed = Vec::new();
    while let Ok(event) = rx.try_recv() {
        observed.push(event.agent);
    }
    assert_eq!(observed, vec!["A", "B", "C"]);
}

#[tokio::test]
async fn strict_fan_out_fails_when_any_branch_fails() {
    let model = Arc::new(
        ScriptedModel::new()
            .with_reply("A", "a")
            .with_failure(
                "B",
                ModelInvocationError::MalformedResponse {
                    agent: "B".to_string(),
                    reason: "bad frame".to_string(),
                },
            )
            .with_reply("C", "c"),
    );
    let fan_out = ParallelFanOut::new(registry(&model, &["A", "B", "C"])).expect("fan-out");

    let err = fan_out
        .run(&fast_runtime(), &NoopObserver, "task")
        .await
        .expect_err("strict mode should fail");

    match err.kind() {
        OrchestrationError::PartialFailure(failure) => {
            assert_eq!(failure.failed_agents(), vec!["B"])
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.report.trace_authors(), vec![USER_AUTHOR, "A", "C"]);
    assert_eq!(err.report.status, RunStatus::Failed);
}

#[tokio::test]
async fn best_effort_fan_out_omits_failed_branches() {
    let model = Arc::new(
        ScriptedModel::new()
            .with_reply("A", "a")
            .with_failure(
                "B",
                ModelInvocationError::Rejected {
                    agent: "B".to_string(),
                    reason: "policy".to_string(),
                },
            )
            .with_reply("C", "c"),
    );
    let fan_out = ParallelFanOut::new(registry(&model, &["A", "B", "C"]))
        .expect("fan-out")
        .with_mode(FanInMode::BestEffort)
        .with_merge(merge_json);

    let report = fan_out
        .run(&fast_runtime(), &NoopObserver, "task")
        .await
        .expect("best effort should succeed");

    assert_eq!(report.artifact, r#"{"A": "a", "C": "c"}"#);
    assert_eq!(report.unused, vec!["B"]);
    match &report.details {
        RunDetails::FanIn { branches, omitted } => {
            assert_eq!(branches.len(), 2);
            assert_eq!(omitted.len(), 1);
            assert_eq!(omitted[0].agent, "B");
        }
        other => panic!("unexpected details: {other:?}"),
    }
    assert!(report.format_summary().contains("### Omitted branches"));
}

#[tokio::test]
async fn best_effort_fan_out_fails_when_every_branch_fails() {
    let model = Arc::new(ScriptedModel::new());
    let fan_out = ParallelFanOut::new(registry(&model, &["A", "B"]))
        .expect("fan-out")
        .with_mode(FanInMode::BestEffort);

    let err = fan_out
        .run(&fast_runtime(), &NoopObserver, "task")
        .await
        .expect_err("no successful branch");
    assert!(matches!(err.kind(), OrchestrationError::PartialFailure(_)));
}

#[test]
fn fan_out_needs_two_workers() {
    let model = Arc::new(ScriptedModel::new());
    assert!(ParallelFanOut::new(registry(&model, &["A"])).is_err());
}

#[test]
fn merge_sections_trims_trailing_whitespace_per_branch() {
    let branches = vec![
        StepOutput {
            agent: "A".to_string(),
            output: "x\n\n".to_string(),
        },
        StepOutput {
            agent: "B".to_string(),
            output: "y".to_string(),
        },
    ];
    assert_eq!(merge_sections(&branches), "## A\nx\n\n## B\ny");
}

// --- evaluator-optimizer ---

#[tokio::test]
async fn evaluator_approving_critic_finishes_in_one_round() {
    let model = Arc::new(
        ScriptedModel::new()
            .with_reply("Creator", "1. Inspect the pump")
            .with_reply("Critic", "Approved\n1. Inspect the pump"),
    );
    let evaluator = EvaluatorOptimizer::new(
        chat_agent(&model, "Creator", ""),
        chat_agent(&model, "Critic", ""),
        TerminationPolicy::approval(5).expect("policy"),
    )
    .expect("evaluator should build");

    let report = evaluator
        .run(&fast_runtime(), &NoopObserver, "Write a checklist")
        .await
        .expect("evaluator should run");

    assert_eq!(report.status, RunStatus::Approved);
    assert_eq!(report.iterations, 1);
    assert_eq!(report.responses, 2);
    assert_eq!(report.artifact, "Approved\n1. Inspect the pump");
    assert_eq!(model.calls_for("Critic")[0].input, "1. Inspect the pump");
}

#[tokio::test]
async fn evaluator_never_approving_critic_exhausts_after_cap_with_last_draft() {
    let mut model = ScriptedModel::new();
    for n in 1..=5 {
        model = model.with_reply("Creator", format!("draft {n}"));
    }
    let model = Arc::new(model.with_reply("Critic", "REVISE: add detail"));
    let evaluator = EvaluatorOptimizer::new(
        chat_agent(&model, "Creator", ""),
        chat_agent(&model, "Critic", ""),
        TerminationPolicy::approval(5).expect("policy"),
    )
    .expect("evaluator should build");

    let report = evaluator
        .run(&fast_runtime(), &NoopObserver, "Write a checklist")
        .await
        .expect("exhaustion is not an error");

    assert_eq!(report.status, RunStatus::Exhausted);
    assert!(report.status.is_unresolved());
    assert_eq!(report.iterations, 5);
    assert_eq!(report.artifact, "draft 5");
    assert_eq!(model.calls_for("Creator").len(), 5);
    assert_eq!(model.calls_for("Critic").len(), 5);

    let second_input = &model.calls_for("Creator")[1].input;
    assert_eq!(
        second_input,
        &revision_input("Write a checklist", "REVISE: add detail", "draft 1")
    );
    assert!(report.format_summary().contains("artifact is unresolved"));
}

#[tokio::test]
async fn evaluator_honours_custom_predicate() {
    let model = Arc::new(
        ScriptedModel::new()
            .with_reply("Creator", "draft")
            .with_reply("Critic", "score: 9/10"),
    );
    let policy = TerminationPolicy::new(3)
        .expect("policy")
        .with_predicate(|history| history.last().is_some_and(|m| m.content().contains("9/10")));
    let evaluator = EvaluatorOptimizer::new(
        chat_agent(&model, "Creator", ""),
        chat_agent(&model, "Critic", ""),
        policy,
    )
    .expect("evaluator should build");

    let report = evaluator
        .run(&fast_runtime(), &NoopObserver, "task")
        .await
        .expect("evaluator should run");
    assert_eq!(report.status, RunStatus::Approved);
    assert_eq!(report.iterations, 1);
}

// --- orchestrator-workers ---

fn orchestrator(model: &Arc<ScriptedModel>, max_iterations: u32) -> OrchestratorWorkers {
    OrchestratorWorkers::new(
        chat_agent(model, "Manager", "plans"),
        registry(model, &["EngineAnalyst", "FuelAnalyst", "MaintenanceAnalyst"]),
        TerminationPolicy::new(max_iterations).expect("policy"),
    )
    .expect("orchestrator should build")
}

#[tokio::test]
async fn orchestrator_rejects_plan_with_unknown_worker_before_any_worker_runs() {
    let plan = r#"{"title": "Plan", "steps": [
        {"agent": "EngineAnalyst", "description": "check"},
        {"agent": "MarketingAnalyst", "description": "advertise"}
    ]}"#;
    let model = Arc::new(ScriptedModel::new().with_reply("Manager", plan).with_echo_fallback());

    let err = orchestrator(&model, 6)
        .run(&fast_runtime(), &NoopObserver, "Review the fleet")
        .await
        .expect_err("invalid plan should fail");

    match err.kind() {
        OrchestrationError::PlanValidation(PlanValidationError::UnknownWorker {
            step, agent, ..
        }) => {
            assert_eq!(*step, 2);
            assert_eq!(agent, "MarketingAnalyst");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(model.calls().len(), 1);
    assert_eq!(err.report.responses, 1);
}

#[tokio::test]
async fn orchestrator_rejects_unparsable_plan() {
    let model = Arc::new(
        ScriptedModel::new().with_reply("Manager", "Ask the engine analyst to look at it."),
    );

    let err = orchestrator(&model, 6)
        .run(&fast_runtime(), &NoopObserver, "Review the fleet")
        .await
        .expect_err("prose is not a plan");
    assert!(matches!(
        err.kind(),
        OrchestrationError::PlanValidation(PlanValidationError::Unparsable { .. })
    ));
}

#[tokio::test]
async fn orchestrator_executes_plan_and_synthesizes_over_shared_history() {
    let model = Arc::new(
        ScriptedModel::new()
            .with_reply("Manager", format!("```json\n{ENGINE_PLAN}\n```"))
            .with_reply("Manager", "final report")
            .with_reply("EngineAnalyst", "vibration nominal")
            .with_reply("FuelAnalyst", "burn +3%"),
    );

    let report = orchestrator(&model, 6)
        .run(&fast_runtime(), &NoopObserver, "Review the fleet")
        .await
        .expect("plan should run");

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.artifact, "final report");
    assert_eq!(report.responses, 4);
    assert_eq!(report.invoked, vec!["EngineAnalyst", "FuelAnalyst"]);
    assert_eq!(report.unused, vec!["MaintenanceAnalyst"]);

    let engine_call = &model.calls_for("EngineAnalyst")[0];
    assert_eq!(engine_call.input, "Review engine vibration");
    assert_eq!(engine_call.history.len(), 2);
    let synthesis_call = &model.calls_for("Manager")[1];
    assert_eq!(synthesis_call.history.len(), 4);
    assert!(report.format_summary().contains("**Workers not used:** MaintenanceAnalyst"));
}

#[tokio::test]
async fn orchestrator_stops_early_at_global_cap() {
    let plan = r#"{"title": "Five steps", "steps": [
        {"agent": "EngineAnalyst", "description": "one"},
        {"agent": "FuelAnalyst", "description": "two"},
        {"agent": "MaintenanceAnalyst", "description": "three"},
        {"agent": "EngineAnalyst", "description": "four"},
        {"agent": "FuelAnalyst", "description": "five"}
    ]}"#;
    let model = Arc::new(ScriptedModel::new().with_reply("Manager", plan).with_echo_fallback());

    let report = orchestrator(&model, 3)
        .run(&fast_runtime(), &NoopObserver, "Review the fleet")
        .await
        .expect("stopping early is not an error");

    assert_eq!(report.status, RunStatus::StoppedEarly);
    assert_eq!(report.responses, 3);
    assert_eq!(model.calls().len(), 3);
    assert_eq!(report.unused, vec!["MaintenanceAnalyst"]);
    assert!(report.artifact.starts_with("# Five steps (stopped early: 2/5 steps)"));
    assert!(report.artifact.contains("## FuelAnalyst\n[FuelAnalyst] two"));
    assert_eq!(
        report.details,
        RunDetails::Plan {
            plan: Some(
                OrchestrationPlan::parse(
                    plan,
                    &[
                        "EngineAnalyst".to_string(),
                        "FuelAnalyst".to_string(),
                        "MaintenanceAnalyst".to_string()
                    ]
                )
                .expect("plan parses")
            ),
            completed_steps: 2,
        }
    );
}

#[test]
fn partial_synthesis_lists_completed_outputs() {
    let plan = OrchestrationPlan {
        title: "T".to_string(),
        steps: vec![
            PlanStep {
                agent: "A".to_string(),
                description: "x".to_string(),
            },
            PlanStep {
                agent: "B".to_string(),
                description: "y".to_string(),
            },
        ],
    };
    let outputs = vec![StepOutput {
        agent: "A".to_string(),
        output: "done".to_string(),
    }];
    assert_eq!(
        partial_synthesis(&plan, &outputs),
        "# T (stopped early: 1/2 steps)\n\n## A\ndone"
    );
}

// --- plan parsing ---

fn permitted() -> Vec<String> {
    vec!["EngineAnalyst".to_string(), "FuelAnalyst".to_string()]
}

#[test]
fn plan_parses_bare_json_and_single_fenced_block() {
    let bare = OrchestrationPlan::parse(ENGINE_PLAN, &permitted()).expect("bare plan");
    let fenced = OrchestrationPlan::parse(
        &format!("Here is the plan:\n```json\n{ENGINE_PLAN}\n```\nDone."),
        &permitted(),
    )
    .expect("fenced plan");
    assert_eq!(bare, fenced);
    assert_eq!(bare.workers(), vec!["EngineAnalyst", "FuelAnalyst"]);
    assert!(bare.render().contains("1. @EngineAnalyst: Review engine vibration"));
}

#[test]
fn plan_accepts_at_prefixed_names_and_field_aliases() {
    let plan = OrchestrationPlan::parse(
        r#"{"title": "T", "steps": [{"worker": "@FuelAnalyst", "task": " check burn "}]}"#,
        &permitted(),
    )
    .expect("aliases should parse");
    assert_eq!(plan.steps[0].agent, "FuelAnalyst");
    assert_eq!(plan.steps[0].description, "check burn");
}

#[test]
fn plan_rejects_ambiguous_or_incomplete_output() {
    let two_blocks = format!("```\n{ENGINE_PLAN}\n```\n```\n{ENGINE_PLAN}\n```");
    assert_eq!(
        OrchestrationPlan::parse(&two_blocks, &permitted()),
        Err(PlanValidationError::Ambiguous { blocks: 2 })
    );
    assert!(matches!(
        OrchestrationPlan::parse("```json\n{\"title\": \"T\"", &permitted()),
        Err(PlanValidationError::Unparsable { .. })
    ));
    assert_eq!(
        OrchestrationPlan::parse(r#"{"steps": []}"#, &permitted()),
        Err(PlanValidationError::MissingTitle)
    );
    assert_eq!(
        OrchestrationPlan::parse(r#"{"title": "T", "steps": []}"#, &permitted()),
        Err(PlanValidationError::EmptyPlan)
    );
    assert_eq!(
        OrchestrationPlan::parse(
            r#"{"title": "T", "steps": [{"agent": "FuelAnalyst", "description": "  "}]}"#,
            &permitted()
        ),
        Err(PlanValidationError::EmptyStepDescription { step: 1 })
    );
    assert!(matches!(
        OrchestrationPlan::parse(
            r#"{"title": "T", "steps": [{"agent": "fuelanalyst", "description": "x"}]}"#,
            &permitted()
        ),
        Err(PlanValidationError::UnknownWorker { .. })
    ));
}

// --- group chat ---

#[tokio::test]
async fn group_chat_stops_on_approval_and_returns_approved_work() {
    let model = Arc::new(
        ScriptedModel::new()
            .with_reply("Writer", "draft report")
            .with_reply("Reviewer", "Looks good. APPROVED"),
    );
    let chat = GroupChat::new(
        agents(&model, &["Writer", "Reviewer"]),
        TerminationPolicy::approval(10).expect("policy"),
    )
    .expect("group chat should build");

    let report = chat
        .run(&fast_runtime(), &NoopObserver, "Write the report")
        .await
        .expect("group chat should run");

    assert_eq!(report.status, RunStatus::Approved);
    assert_eq!(report.artifact, "draft report");
    assert_eq!(report.responses, 2);
    assert_eq!(model.calls_for("Reviewer")[0].history.len(), 2);
}

#[tokio::test]
async fn group_chat_exhausts_after_turn_cap() {
    let model = Arc::new(
        ScriptedModel::new()
            .with_reply("Writer", "draft")
            .with_reply("Reviewer", "needs work"),
    );
    let chat = GroupChat::new(
        agents(&model, &["Writer", "Reviewer"]),
        TerminationPolicy::approval(4).expect("policy"),
    )
    .expect("group chat should build");

    let report = chat
        .run(&fast_runtime(), &NoopObserver, "Write the report")
        .await
        .expect("exhaustion is not an error");

    assert_eq!(report.status, RunStatus::Exhausted);
    assert_eq!(report.responses, 4);
    assert_eq!(report.artifact, "needs work");
    assert_eq!(
        report.trace_authors(),
        vec![USER_AUTHOR, "Writer", "Reviewer", "Writer", "Reviewer"]
    );
}

// --- termination policy ---

#[test]
fn termination_policy_keyword_is_case_insensitive_on_latest_message() {
    let policy = TerminationPolicy::approval(3).expect("policy");
    let mut conversation = Conversation::new();
    conversation.append("Critic", Role::Assistant, "approved");
    assert!(policy.is_satisfied(conversation.messages()));

    conversation.append("Creator", Role::Assistant, "new draft");
    assert!(!policy.is_satisfied(conversation.messages()));

    assert!(!policy.is_exhausted(2));
    assert!(policy.is_exhausted(3));
    assert!(TerminationPolicy::new(0).is_err());
    assert_eq!(policy.keyword(), Some(DEFAULT_APPROVAL_KEYWORD));
}

// --- runtime: retries, cancellation, observation ---

#[tokio::test]
async fn transient_failures_are_retried_then_succeed() {
    let model = Arc::new(
        ScriptedModel::new()
            .with_failure(
                "A",
                ModelInvocationError::Timeout {
                    agent: "A".to_string(),
                    elapsed: Duration::from_secs(30),
                },
            )
            .with_reply("A", "ok"),
    );
    let chain = SequentialChain::new(agents(&model, &["A"])).expect("chain");

    let report = chain
        .run(&fast_runtime(), &NoopObserver, "task")
        .await
        .expect("retry should recover");
    assert_eq!(report.artifact, "ok");
    assert_eq!(report.responses, 1);
    assert_eq!(model.calls_for("A").len(), 2);
}

#[tokio::test]
async fn transient_failures_escalate_after_retry_budget() {
    let model = Arc::new(ScriptedModel::new().with_failure(
        "A",
        ModelInvocationError::RateLimited {
            agent: "A".to_string(),
            retry_after: None,
        },
    ));
    let chain = SequentialChain::new(agents(&model, &["A"])).expect("chain");

    let err = chain
        .run(&fast_runtime(), &NoopObserver, "task")
        .await
        .expect_err("retries should run out");
    match err.kind() {
        OrchestrationError::Model(ModelInvocationError::RetriesExhausted { attempts, last, .. }) => {
            assert_eq!(*attempts, 3);
            assert!(last.is_transient());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(model.calls_for("A").len(), 3);
    assert_eq!(err.report.trace_authors(), vec![USER_AUTHOR]);
}

#[tokio::test]
async fn permanent_failures_are_not_retried_and_keep_partial_trace() {
    let model = Arc::new(ScriptedModel::new().with_reply("A", "step one").with_failure(
        "B",
        ModelInvocationError::EmptyResponse {
            agent: "B".to_string(),
        },
    ));
    let chain = SequentialChain::new(agents(&model, &["A", "B", "C"])).expect("chain");

    let err = chain
        .run(&fast_runtime(), &NoopObserver, "task")
        .await
        .expect_err("permanent failure aborts");
    assert_eq!(model.calls_for("B").len(), 1);
    assert!(model.calls_for("C").is_empty());
    assert_eq!(err.report.artifact, "step one");
    assert_eq!(err.report.trace_authors(), vec![USER_AUTHOR, "A"]);
}

#[tokio::test]
async fn stop_when_idle_prevents_new_invocations() {
    let model = Arc::new(ScriptedModel::new().with_echo_fallback());
    let chain = SequentialChain::new(agents(&model, &["A", "B", "C"])).expect("chain");
    let runtime = fast_runtime();
    let stopper = runtime.clone();
    let observer = move |_event: &ResponseEvent| stopper.stop_when_idle();

    let err = chain
        .run(&runtime, &observer, "task")
        .await
        .expect_err("run should be cancelled");

    assert_eq!(
        err.kind(),
        &OrchestrationError::Cancelled {
            next_agent: "B".to_string()
        }
    );
    assert_eq!(model.calls().len(), 1);
    assert_eq!(err.report.responses, 1);

    let err = chain
        .run(&runtime, &NoopObserver, "task")
        .await
        .expect_err("stopped runtime starts nothing");
    assert!(matches!(err.kind(), OrchestrationError::Cancelled { .. }));
    assert_eq!(model.calls().len(), 1);
}

#[tokio::test]
async fn observer_sees_every_response_with_iteration_count() {
    let model = Arc::new(ScriptedModel::new().with_echo_fallback());
    let chain = SequentialChain::new(agents(&model, &["A", "B"])).expect("chain");
    let (channel, mut rx) = ChannelObserver::new();
    let observers = ObserverSet::new()
        .with(Arc::new(channel))
        .with(Arc::new(TracingObserver));

    let report = chain
        .run(&fast_runtime(), &observers, "task")
        .await
        .expect("chain should run");

    let first = rx.recv().await.expect("first event");
    let second = rx.recv().await.expect("second event");
    assert_eq!((first.agent.as_str(), first.iteration), ("A", 1));
    assert_eq!((second.agent.as_str(), second.iteration), ("B", 2));
    assert_eq!(second.content, "[B] [A] task");
    assert_eq!(first.run_id, report.run_id);
    assert_eq!(second.sequence, 3);
}

#[tokio::test]
async fn concurrent_runs_keep_independent_state() {
    let model = Arc::new(ScriptedModel::new().with_echo_fallback());
    let chain = SequentialChain::new(agents(&model, &["A", "B"])).expect("chain");
    let runtime = fast_runtime();

    let (first, second) = tokio::join!(
        chain.run(&runtime, &NoopObserver, "one"),
        chain.run(&runtime, &NoopObserver, "two")
    );
    let first = first.expect("first run");
    let second = second.expect("second run");

    assert_eq!(first.artifact, "[B] [A] one");
    assert_eq!(second.artifact, "[B] [A] two");
    assert_eq!(first.responses, 2);
    assert_eq!(second.responses, 2);
    assert_ne!(first.run_id, second.run_id);
}

// --- persistence ---

#[test]
fn persistence_treats_missing_files_as_empty() {
    let dir = tempdir().expect("tempdir");
    let missing = dir.path().join("missing.txt");
    assert_eq!(load_text(&missing).expect("missing text"), "");
    assert!(load_lines(&missing).expect("missing lines").is_empty());
    assert_eq!(load_csv_flat(&missing).expect("missing csv"), "");
}

#[test]
fn persistence_loads_lines_and_flattens_csv() {
    let dir = tempdir().expect("tempdir");
    let lines = dir.path().join("specs.txt");
    std::fs::write(&lines, "  first rule \n\n second rule\n").expect("write lines");
    assert_eq!(
        load_lines(&lines).expect("lines"),
        vec!["first rule", "second rule"]
    );

    let csv = dir.path().join("engines.csv");
    std::fs::write(&csv, "engine,temp\nE1, 90\nE2,95\n").expect("write csv");
    assert_eq!(load_csv_flat(&csv).expect("csv"), "E1, 90, E2, 95");
}

#[test]
fn save_artifact_creates_parent_directories() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("artifacts/reports/final.md");
    save_artifact(&path, "# Report").expect("save should succeed");
    assert_eq!(std::fs::read_to_string(&path).expect("read back"), "# Report");
}

#[test]
fn compose_task_appends_flattened_csv() {
    let dir = tempdir().expect("tempdir");
    let csv = dir.path().join("data.csv");
    std::fs::write(&csv, "id,value\n1,2\n").expect("write csv");

    let task = compose_task(&["Analyze".to_string(), "this".to_string()], Some(&csv))
        .expect("task should compose");
    assert_eq!(task, "Analyze this\n\n1, 2");
    assert!(compose_task(&[], None).is_err());
}

// --- transcript ---

#[tokio::test]
async fn transcript_sink_records_responses_and_run_outcome() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("logs/transcript.jsonl");
    let sink = TranscriptSink::new(&path, "chain");
    let model = Arc::new(ScriptedModel::new().with_echo_fallback());
    let chain = SequentialChain::new(agents(&model, &["A", "B"])).expect("chain");

    let report = chain
        .run(&fast_runtime(), &sink, "task")
        .await
        .expect("chain should run");
    sink.record_run(&report);

    let lines = read_transcript_lines(&path).expect("transcript should exist");
    assert_eq!(lines.len(), 3);
    let summary = summarize_transcript_lines(lines, 100);
    assert_eq!(summary.parsed_events, 3);
    assert_eq!(summary.responses, 2);
    assert_eq!(summary.runs_completed, 1);
    assert_eq!(summary.unique_runs.len(), 1);
    assert_eq!(summary.agent_counts.get("A"), Some(&1));
    assert_eq!(summary.status_counts.get("completed"), Some(&1));
}

#[test]
fn transcript_summary_counts_parse_errors_and_respects_limit() {
    let lines = vec![
        r#"{"ts_unix_ms":100,"event":"agent.response","run_id":"r1","agent":"A"}"#.to_string(),
        "not json".to_string(),
        r#"{"ts_unix_ms":200,"event":"agent.response","run_id":"r2","agent":"B"}"#.to_string(),
        r#"{"ts_unix_ms":300,"event":"run.failed","run_id":"r2","status":"failed"}"#.to_string(),
    ];

    let summary = summarize_transcript_lines(lines.clone(), 100);
    assert_eq!(summary.total_lines, 4);
    assert_eq!(summary.parse_errors, 1);
    assert_eq!(summary.responses, 2);
    assert_eq!(summary.runs_failed, 1);
    assert_eq!(summary.unique_runs.len(), 2);
    assert_eq!(summary.last_event_ts_unix_ms, Some(300));

    let recent = summarize_transcript_lines(lines, 2);
    assert_eq!(recent.parsed_events, 2);
    assert_eq!(recent.unique_runs.len(), 1);
}

// --- configuration and workflow building ---

const WORKFLOW: &str = r#"
[[agents]]
name = "Manager"
description = "Plans and routes"

[[agents]]
name = "EngineAnalyst"
description = "Engine health"
temperature = 0.2

[[agents]]
name = "FuelAnalyst"
description = "Fuel efficiency"
max_tokens = 300

[runtime]
max_retries = 1

[router]
orchestrator = "Manager"
workers = ["EngineAnalyst", "FuelAnalyst"]

[parallel]
workers = ["EngineAnalyst", "FuelAnalyst"]
mode = "best-effort"

[orchestrator]
orchestrator = "Manager"
workers = ["EngineAnalyst", "FuelAnalyst"]

[evaluator]
creator = "EngineAnalyst"
critic = "FuelAnalyst"
"#;

#[test]
fn workflow_parses_with_defaults() {
    let file = parse_workflow(WORKFLOW).expect("workflow should parse");
    assert_eq!(file.agents.len(), 3);
    assert_eq!(file.agent("EngineAnalyst").map(|a| a.temperature), Some(0.2));
    assert_eq!(file.agent("Manager").map(|a| a.max_tokens), Some(DEFAULT_MAX_TOKENS));
    assert_eq!(file.orchestrator.as_ref().map(|o| o.max_iterations), Some(6));
    assert_eq!(
        file.evaluator.as_ref().map(|e| e.max_rounds),
        Some(DEFAULT_EVALUATOR_ROUNDS)
    );
    assert_eq!(
        file.parallel.as_ref().map(|p| p.mode),
        Some(FanInSetting::BestEffort)
    );
    assert_eq!(
        file.configured_topologies(),
        vec![
            TopologyKind::Router,
            TopologyKind::Parallel,
            TopologyKind::Evaluator,
            TopologyKind::Orchestrator
        ]
    );
}

#[test]
fn workflow_validation_rejects_bad_references() {
    let unknown = format!("{WORKFLOW}\n[chain]\nagents = [\"Manager\", \"Ghost\"]\n");
    let err = parse_workflow(&unknown).expect_err("unknown agent should fail");
    assert!(format!("{err:#}").contains("unknown agent 'Ghost'"));
    assert_eq!(categorize_error(&err), ErrorCategory::Workflow);

    let duplicate = "[[agents]]\nname = \"A\"\n[[agents]]\nname = \"A\"\n";
    assert!(parse_workflow(duplicate).is_err());

    let unknown_field = "[[agents]]\nname = \"A\"\nmodel = \"gpt\"\n";
    assert!(parse_workflow(unknown_field).is_err());

    let self_routing = "[[agents]]\nname = \"A\"\n[[agents]]\nname = \"B\"\n\
                        [router]\norchestrator = \"A\"\nworkers = [\"A\", \"B\"]\n";
    assert!(parse_workflow(self_routing).is_err());
}

#[test]
fn runtime_config_prefers_cli_over_file_over_defaults() {
    let file = parse_workflow(WORKFLOW).expect("workflow should parse");

    let cli = Cli::try_parse_from(["ensemble", "validate"]).expect("cli should parse");
    let cfg = RuntimeConfig::resolve(&cli, &file);
    assert_eq!(cfg.max_retries, 1);
    assert_eq!(cfg.retry_delay_ms, DEFAULT_RETRY_DELAY_MS);
    assert_eq!(cfg.transcript_path, DEFAULT_TRANSCRIPT_PATH);

    let cli = Cli::try_parse_from(["ensemble", "--max-retries", "4", "validate"])
        .expect("cli should parse");
    let cfg = RuntimeConfig::resolve(&cli, &file);
    assert_eq!(cfg.max_retries, 4);
    assert_eq!(cfg.retry_policy().max_retries, 4);
}

#[test]
fn cli_parses_run_command() {
    let cli = Cli::try_parse_from([
        "ensemble",
        "run",
        "group-chat",
        "--max-iterations",
        "3",
        "Write",
        "a",
        "report",
    ])
    .expect("cli should parse");
    match &cli.command {
        Commands::Run {
            topology,
            task,
            max_iterations,
            ..
        } => {
            assert_eq!(*topology, TopologyKind::GroupChat);
            assert_eq!(task.join(" "), "Write a report");
            assert_eq!(*max_iterations, Some(3));
        }
        other => panic!("unexpected command: {other:?}"),
    }
    assert_eq!(command_label(&cli.command), "run.group-chat");
}

#[tokio::test]
async fn workflow_builds_and_runs_router_from_file() {
    let file = parse_workflow(WORKFLOW).expect("workflow should parse");
    let model = Arc::new(
        ScriptedModel::new()
            .with_reply("Manager", "FuelAnalyst")
            .with_reply("FuelAnalyst", "burn is fine"),
    );
    let agents = build_agents(&file, Arc::clone(&model) as Arc<dyn LanguageModel>)
        .expect("agents should build");
    let topology =
        build_topology(TopologyKind::Router, &file, &agents, None).expect("router should build");
    assert_eq!(topology.kind(), TopologyKind::Router);

    let report = topology
        .run(&fast_runtime(), &NoopObserver, "Check fuel")
        .await
        .expect("router should run");
    assert_eq!(report.artifact, "burn is fine");
    assert_eq!(model.calls_for("FuelAnalyst")[0].parameters.max_tokens, 300);

    assert!(build_topology(TopologyKind::GroupChat, &file, &agents, None).is_err());
}

#[tokio::test]
async fn run_workflow_writes_transcript_for_scripted_run() {
    let dir = tempdir().expect("tempdir");
    let script = dir.path().join("replies.toml");
    std::fs::write(
        &script,
        "[replies]\nManager = [\"EngineAnalyst\"]\nEngineAnalyst = [\"engine ok\"]\n",
    )
    .expect("write script");
    let file = parse_workflow(WORKFLOW).expect("workflow should parse");
    let cfg = RuntimeConfig {
        workflow_path: "inline".to_string(),
        max_retries: 0,
        retry_delay_ms: 0,
        transcript_path: dir.path().join("t.jsonl").display().to_string(),
    };

    let report = run_workflow(&cfg, &file, TopologyKind::Router, Some(&script), None, "engines?")
        .await
        .expect("run should succeed");
    assert_eq!(report.artifact, "engine ok");

    let lines = read_transcript_lines(dir.path().join("t.jsonl").as_path()).expect("transcript");
    let summary = summarize_transcript_lines(lines, 10);
    assert_eq!(summary.responses, 2);
    assert_eq!(summary.runs_completed, 1);
}

// --- errors and summaries ---

#[tokio::test]
async fn cli_errors_carry_category_code_and_hint() {
    let model = Arc::new(ScriptedModel::new().with_reply("Orchestrator", "Nobody"));
    let router = CapabilityRouter::new(
        chat_agent(&model, "Orchestrator", ""),
        registry(&model, &["A", "B"]),
    )
    .expect("router should build");
    let err = router
        .run(&fast_runtime(), &NoopObserver, "task")
        .await
        .expect_err("routing should fail");

    let err = anyhow::Error::new(err).context("router run failed");
    assert_eq!(categorize_error(&err), ErrorCategory::Routing);
    let rendered = format_cli_error(&err);
    assert!(rendered.starts_with("[ROUTING] router run failed"));
    assert!(rendered.contains("Hint: "));

    let plain = anyhow::anyhow!("something odd");
    assert_eq!(categorize_error(&plain), ErrorCategory::Internal);
}

#[test]
fn model_errors_classify_transient_and_permanent() {
    let timeout = ModelInvocationError::Timeout {
        agent: "A".to_string(),
        elapsed: Duration::from_secs(1),
    };
    let malformed = ModelInvocationError::MalformedResponse {
        agent: "A".to_string(),
        reason: "x".to_string(),
    };
    assert!(timeout.is_transient());
    assert!(!malformed.is_transient());
    assert_eq!(malformed.agent(), "A");
}

#[test]
fn run_status_labels_are_stable() {
    assert_eq!(RunStatus::StoppedEarly.to_string(), "stopped-early");
    assert_eq!(RunStatus::Approved.label(), "approved");
    assert!(!RunStatus::Running.is_terminal());
    assert!(RunStatus::Failed.is_terminal());
}
