use std::fmt;
use std::sync::Arc;

use crate::conversation::Message;
use crate::error::OrchestrationError;

pub const DEFAULT_APPROVAL_KEYWORD: &str = "APPROVED";

pub type HistoryPredicate = Arc<dyn Fn(&[Message]) -> bool + Send + Sync>;

/// Decides when an iterative topology stops.
///
/// `is_satisfied` is the success condition (keyword in the latest message, or
/// the custom predicate over the full history). `is_exhausted` is the
/// iteration cap, which is a normal terminal outcome rather than an error.
#[derive(Clone)]
pub struct TerminationPolicy {
    max_iterations: u32,
    keyword: Option<String>,
    predicate: Option<HistoryPredicate>,
}

impl TerminationPolicy {
    pub fn new(max_iterations: u32) -> Result<Self, OrchestrationError> {
        if max_iterations == 0 {
            return Err(OrchestrationError::config(
                "max_iterations must be greater than 0",
            ));
        }
        Ok(Self {
            max_iterations,
            keyword: None,
            predicate: None,
        })
    }

    pub fn approval(max_iterations: u32) -> Result<Self, OrchestrationError> {
        Ok(Self::new(max_iterations)?.with_keyword(DEFAULT_APPROVAL_KEYWORD))
    }

    pub fn with_keyword(mut self, keyword: impl Into<String>) -> Self {
        let keyword = keyword.into();
        self.keyword = (!keyword.trim().is_empty()).then(|| keyword.trim().to_string());
        self
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&[Message]) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn keyword(&self) -> Option<&str> {
        self.keyword.as_deref()
    }

    /// Case-insensitive substring match of the keyword against `text`.
    pub fn keyword_matches(&self, text: &str) -> bool {
        self.keyword
            .as_deref()
            .is_some_and(|keyword| text.to_lowercase().contains(&keyword.to_lowercase()))
    }

    pub fn is_satisfied(&self, history: &[Message]) -> bool {
        let keyword_hit = history
            .last()
            .is_some_and(|latest| self.keyword_matches(latest.content()));
        keyword_hit || self.predicate.as_ref().is_some_and(|p| p(history))
    }

    pub fn is_exhausted(&self, iterations: u32) -> bool {
        iterations >= self.max_iterations
    }
}

impl fmt::Debug for TerminationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminationPolicy")
            .field("max_iterations", &self.max_iterations)
            .field("keyword", &self.keyword)
            .field("custom_predicate", &self.predicate.is_some())
            .finish()
    }
}
