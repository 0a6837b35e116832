//! Coordination topologies.
//!
//! Each executor drives agents through a [`Runtime`](crate::runtime::Runtime)
//! and returns a [`RunReport`](crate::state::RunReport), or a
//! [`RunError`](crate::error::RunError) that still carries the partial trace:
//!
//! - `sequential`: each output becomes the next agent's input
//! - `router`: an orchestrator picks exactly one worker
//! - `parallel`: concurrent fan-out with a fan-in barrier
//! - `evaluator`: creator/critic rounds until approval or the cap
//! - `orchestrator`: plan, delegate step by step, synthesize
//! - `group_chat`: round-robin turns over a shared history

pub mod evaluator;
pub mod group_chat;
pub mod orchestrator;
pub mod parallel;
pub mod plan;
pub mod router;
pub mod sequential;

pub use evaluator::EvaluatorOptimizer;
pub use group_chat::GroupChat;
pub use orchestrator::OrchestratorWorkers;
pub use parallel::{FanInMode, ParallelFanOut};
pub use plan::{OrchestrationPlan, PlanStep};
pub use router::CapabilityRouter;
pub use sequential::SequentialChain;
