//! Structured plans produced by an orchestrator agent.
//!
//! A plan is accepted only when it is unambiguous: either the whole response
//! is one JSON object, or the response contains exactly one fenced code block
//! holding that object. Worker names must match a permitted name exactly
//! (an optional leading `@` is tolerated). Anything else is rejected.

use serde::{Deserialize, Serialize};

use crate::error::PlanValidationError;

const FENCE: &str = "```";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub agent: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationPlan {
    pub title: String,
    pub steps: Vec<PlanStep>,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    title: Option<String>,
    steps: Option<Vec<RawStep>>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    #[serde(alias = "worker")]
    agent: String,
    #[serde(alias = "task", alias = "instruction")]
    description: String,
}

impl OrchestrationPlan {
    pub fn parse(text: &str, permitted: &[String]) -> Result<Self, PlanValidationError> {
        let json = extract_plan_json(text)?;
        let raw = serde_json::from_str::<RawPlan>(json).map_err(|err| {
            PlanValidationError::Unparsable {
                reason: err.to_string(),
            }
        })?;

        let title = raw
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or(PlanValidationError::MissingTitle)?;

        let steps = raw
            .steps
            .unwrap_or_default()
            .into_iter()
            .map(|step| PlanStep {
                agent: normalize_worker_name(&step.agent).to_string(),
                description: step.description.trim().to_string(),
            })
            .collect();

        let plan = Self { title, steps };
        plan.validate(permitted)?;
        Ok(plan)
    }

    pub fn validate(&self, permitted: &[String]) -> Result<(), PlanValidationError> {
        if self.title.trim().is_empty() {
            return Err(PlanValidationError::MissingTitle);
        }
        if self.steps.is_empty() {
            return Err(PlanValidationError::EmptyPlan);
        }
        for (idx, step) in self.steps.iter().enumerate() {
            let number = idx + 1;
            if !permitted.iter().any(|name| name == &step.agent) {
                return Err(PlanValidationError::UnknownWorker {
                    step: number,
                    agent: step.agent.clone(),
                    permitted: permitted.to_vec(),
                });
            }
            if step.description.trim().is_empty() {
                return Err(PlanValidationError::EmptyStepDescription { step: number });
            }
        }
        Ok(())
    }

    /// Distinct worker names, in first-mention order.
    pub fn workers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for step in &self.steps {
            if !names.contains(&step.agent.as_str()) {
                names.push(&step.agent);
            }
        }
        names
    }

    pub fn render(&self) -> String {
        let mut out = format!("{}\n", self.title);
        for (idx, step) in self.steps.iter().enumerate() {
            out.push_str(&format!("{}. @{}: {}\n", idx + 1, step.agent, step.description));
        }
        out
    }
}

fn normalize_worker_name(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed.strip_prefix('@').unwrap_or(trimmed).trim()
}

fn extract_plan_json(text: &str) -> Result<&str, PlanValidationError> {
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        return Ok(trimmed);
    }

    let segments = trimmed.split(FENCE).collect::<Vec<_>>();
    if segments.len() == 1 {
        return Err(PlanValidationError::Unparsable {
            reason: "no JSON object or fenced block found".to_string(),
        });
    }
    if segments.len() % 2 == 0 {
        return Err(PlanValidationError::Unparsable {
            reason: "unterminated fenced block".to_string(),
        });
    }

    // Odd-indexed segments sit between an opening and a closing fence.
    let blocks = segments
        .iter()
        .skip(1)
        .step_by(2)
        .copied()
        .collect::<Vec<_>>();
    if blocks.len() != 1 {
        return Err(PlanValidationError::Ambiguous {
            blocks: blocks.len(),
        });
    }

    let block = blocks[0];
    let body = match block.split_once('\n') {
        Some((lang, rest)) if !lang.trim_start().starts_with('{') => rest,
        _ => block,
    };
    Ok(body.trim())
}
