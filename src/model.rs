//! Language model service seam.
//!
//! The orchestration core never talks to a provider directly. It hands a
//! [`ModelRequest`] to a [`LanguageModel`] and receives a finite stream of text
//! fragments. No network provider ships with the crate: [`ScriptedModel`]
//! replays canned replies for dry runs and tests, and [`EchoModel`] reflects
//! the input back.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::conversation::Message;
use crate::error::{ModelInvocationError, OrchestrationError};

/// Lazy, finite, non-restartable sequence of response fragments.
pub type FragmentStream = BoxStream<'static, Result<String, ModelInvocationError>>;

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl ModelParameters {
    pub fn validate(&self) -> Result<(), OrchestrationError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(OrchestrationError::config(format!(
                "temperature {} is outside [0, 2]",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(OrchestrationError::config("max_tokens must be greater than 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub agent: String,
    pub instructions: String,
    pub history: Vec<Message>,
    pub input: String,
    pub parameters: ModelParameters,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: ModelRequest) -> Result<FragmentStream, ModelInvocationError>;
}

pub fn fragments_stream(fragments: Vec<String>) -> FragmentStream {
    futures::stream::iter(fragments.into_iter().map(Ok)).boxed()
}

/// Splits text on word boundaries so that concatenating the pieces restores it.
pub fn split_fragments(text: &str) -> Vec<String> {
    text.split_inclusive(' ').map(str::to_string).collect()
}

#[derive(Debug, Default, Clone)]
pub struct EchoModel;

#[async_trait]
impl LanguageModel for EchoModel {
    fn name(&self) -> &str {
        "echo"
    }

    async fn complete(&self, request: ModelRequest) -> Result<FragmentStream, ModelInvocationError> {
        let text = format!("[{}] {}", request.agent, request.input);
        Ok(fragments_stream(split_fragments(&text)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedReply {
    Text(String),
    Fragments(Vec<String>),
    Fail(ModelInvocationError),
}

/// Reply script file: canned replies and optional latency per agent.
///
/// ```toml
/// [replies]
/// Critic = ["REVISE: number the steps", "APPROVED\n1. Inspect"]
///
/// [delay_ms]
/// Critic = 20
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplyScriptFile {
    #[serde(default)]
    pub replies: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub delay_ms: HashMap<String, u64>,
}

pub fn load_reply_script(path: &Path) -> Result<ReplyScriptFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read reply script at '{}'", path.display()))?;
    toml::from_str::<ReplyScriptFile>(&content)
        .with_context(|| format!("invalid reply script in '{}'", path.display()))
}

/// Deterministic model that replays queued replies per agent.
///
/// Each call pops the next reply for the requesting agent; the final queued
/// reply is sticky and repeats for every later call. Agents with no script
/// fail permanently unless echo fallback is enabled.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    queues: Mutex<HashMap<String, VecDeque<ScriptedReply>>>,
    delays: HashMap<String, Duration>,
    echo_fallback: bool,
    calls: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_script(script: ReplyScriptFile) -> Self {
        let mut model = Self::new();
        for (agent, replies) in script.replies {
            for reply in replies {
                model = model.with_reply(&agent, reply);
            }
        }
        for (agent, ms) in script.delay_ms {
            model = model.with_delay(&agent, Duration::from_millis(ms));
        }
        model
    }

    pub fn with_reply(self, agent: &str, text: impl Into<String>) -> Self {
        self.push(agent, ScriptedReply::Text(text.into()))
    }

    pub fn with_fragments(self, agent: &str, fragments: &[&str]) -> Self {
        let fragments = fragments.iter().map(|f| f.to_string()).collect();
        self.push(agent, ScriptedReply::Fragments(fragments))
    }

    pub fn with_failure(self, agent: &str, error: ModelInvocationError) -> Self {
        self.push(agent, ScriptedReply::Fail(error))
    }

    pub fn with_delay(mut self, agent: &str, delay: Duration) -> Self {
        self.delays.insert(agent.to_string(), delay);
        self
    }

    pub fn with_echo_fallback(mut self) -> Self {
        self.echo_fallback = true;
        self
    }

    fn push(self, agent: &str, reply: ScriptedReply) -> Self {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(agent.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    fn next_reply(&self, agent: &str) -> Option<ScriptedReply> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let queue = queues.get_mut(agent)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }

    pub fn calls(&self) -> Vec<ModelRequest> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn calls_for(&self, agent: &str) -> Vec<ModelRequest> {
        self.calls()
            .into_iter()
            .filter(|call| call.agent == agent)
            .collect()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ModelRequest) -> Result<FragmentStream, ModelInvocationError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        if let Some(delay) = self.delays.get(&request.agent) {
            tokio::time::sleep(*delay).await;
        }

        match self.next_reply(&request.agent) {
            Some(ScriptedReply::Text(text)) => Ok(fragments_stream(split_fragments(&text))),
            Some(ScriptedReply::Fragments(fragments)) => Ok(fragments_stream(fragments)),
            Some(ScriptedReply::Fail(err)) => Err(err),
            None if self.echo_fallback => EchoModel.complete(request).await,
            None => Err(ModelInvocationError::Rejected {
                agent: request.agent,
                reason: "no scripted reply".to_string(),
            }),
        }
    }
}
