use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::conversation::Message;
use crate::error::{ModelInvocationError, OrchestrationError};
use crate::model::{
    DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE, FragmentStream, LanguageModel, ModelParameters,
    ModelRequest,
};

/// A named capability that turns an input plus history into response fragments.
///
/// Implementations carry no per-call state; everything a call needs arrives
/// through `input` and `history`. Agents never retry on their own.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn invoke(
        &self,
        input: &str,
        history: &[Message],
    ) -> Result<FragmentStream, ModelInvocationError>;
}

/// Drains a fragment stream and concatenates it into one response.
pub async fn collect_response(mut stream: FragmentStream) -> Result<String, ModelInvocationError> {
    let mut out = String::new();
    while let Some(fragment) = stream.next().await {
        out.push_str(&fragment?);
    }
    Ok(out)
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl AgentSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        instructions: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            instructions: instructions.into(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn parameters(&self) -> ModelParameters {
        ModelParameters {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    pub fn validate(&self) -> Result<(), OrchestrationError> {
        if self.name.trim().is_empty() {
            return Err(OrchestrationError::config("agent name cannot be empty"));
        }
        if self.name.trim() != self.name {
            return Err(OrchestrationError::config(format!(
                "agent name '{}' has surrounding whitespace",
                self.name
            )));
        }
        self.parameters().validate().map_err(|err| {
            OrchestrationError::config(format!("agent '{}': {}", self.name, err))
        })
    }
}

/// Agent backed by a [`LanguageModel`] with fixed instructions and parameters.
pub struct ChatAgent {
    spec: AgentSpec,
    model: Arc<dyn LanguageModel>,
}

impl ChatAgent {
    pub fn from_spec(
        spec: AgentSpec,
        model: Arc<dyn LanguageModel>,
    ) -> Result<Self, OrchestrationError> {
        spec.validate()?;
        Ok(Self { spec, model })
    }

    pub fn spec(&self) -> &AgentSpec {
        &self.spec
    }
}

impl fmt::Debug for ChatAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatAgent")
            .field("spec", &self.spec)
            .field("model", &self.model.name())
            .finish()
    }
}

#[async_trait]
impl Agent for ChatAgent {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn description(&self) -> &str {
        &self.spec.description
    }

    async fn invoke(
        &self,
        input: &str,
        history: &[Message],
    ) -> Result<FragmentStream, ModelInvocationError> {
        let request = ModelRequest {
            agent: self.spec.name.clone(),
            instructions: self.spec.instructions.clone(),
            history: history.to_vec(),
            input: input.to_string(),
            parameters: self.spec.parameters(),
        };
        self.model.complete(request).await
    }
}

/// Name-addressed agent set that remembers registration order.
///
/// Lookups fail closed: an unknown name yields `None`, never a default agent.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    order: Vec<String>,
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_agents(
        agents: impl IntoIterator<Item = Arc<dyn Agent>>,
    ) -> Result<Self, OrchestrationError> {
        let mut registry = Self::new();
        for agent in agents {
            registry.register(agent)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, agent: Arc<dyn Agent>) -> Result<(), OrchestrationError> {
        let name = agent.name().to_string();
        if name.trim().is_empty() {
            return Err(OrchestrationError::config("agent name cannot be empty"));
        }
        if self.agents.contains_key(&name) {
            return Err(OrchestrationError::config(format!(
                "agent '{}' is registered twice",
                name
            )));
        }
        self.order.push(name.clone());
        self.agents.insert(name, agent);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Agent>> {
        self.agents.get(name)
    }

    pub fn require(&self, name: &str) -> Result<Arc<dyn Agent>, OrchestrationError> {
        self.get(name).cloned().ok_or_else(|| {
            OrchestrationError::config(format!(
                "agent '{}' not found. Available agents: {}",
                name,
                self.order.join(", ")
            ))
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// Names in registration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Agent>> + '_ {
        self.order.iter().filter_map(|name| self.agents.get(name))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// One `- name: description` line per agent, in registration order.
    pub fn describe_capabilities(&self) -> String {
        self.iter()
            .map(|agent| {
                let description = agent.description().trim();
                if description.is_empty() {
                    format!("- {}", agent.name())
                } else {
                    format!("- {}: {}", agent.name(), description)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.order)
            .finish()
    }
}
