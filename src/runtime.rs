use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, collect_response};
use crate::conversation::Message;
use crate::error::{ModelInvocationError, OrchestrationError};
use crate::observer::ResponseObserver;
use crate::state::OrchestrationState;

pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one, for transient failures only.
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::ZERO,
        }
    }
}

/// Which history an invocation sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum History {
    /// Only the literal input.
    None,
    /// The run's full conversation so far.
    Conversation,
}

/// Dispatches agent invocations for any number of independent runs.
///
/// Cloning is cheap and clones share one cancellation signal. Once
/// [`Runtime::stop_when_idle`] is called, in-flight invocations finish but no
/// new invocation starts.
#[derive(Debug, Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

#[derive(Debug)]
struct RuntimeInner {
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl Runtime {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                retry,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry
    }

    pub fn stop_when_idle(&self) {
        if !self.inner.cancel.is_cancelled() {
            tracing::info!("runtime stop requested; no new invocations will start");
        }
        self.inner.cancel.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn ensure_running(&self, next_agent: &str) -> Result<(), OrchestrationError> {
        if self.is_stopping() {
            return Err(OrchestrationError::Cancelled {
                next_agent: next_agent.to_string(),
            });
        }
        Ok(())
    }

    /// Invokes one agent and drains its response, retrying transient model
    /// failures. Touches no run state, so concurrent branches may call it.
    pub async fn call(
        &self,
        agent: &dyn Agent,
        input: &str,
        history: &[Message],
    ) -> Result<String, OrchestrationError> {
        let retry = self.inner.retry;
        let mut attempts = 0u32;

        loop {
            self.ensure_running(agent.name())?;
            attempts += 1;

            let result = match agent.invoke(input, history).await {
                Ok(stream) => collect_response(stream).await,
                Err(err) => Err(err),
            };

            match result {
                Ok(text) => {
                    tracing::debug!(agent = %agent.name(), attempts, chars = text.len(), "invocation succeeded");
                    return Ok(text);
                }
                Err(err) if err.is_transient() && attempts <= retry.max_retries => {
                    tracing::warn!(
                        agent = %agent.name(),
                        attempt = attempts,
                        max_retries = retry.max_retries,
                        error = %err,
                        "transient model failure; retrying"
                    );
                    if !retry.delay.is_zero() {
                        tokio::time::sleep(retry.delay).await;
                    }
                }
                Err(err) if err.is_transient() => {
                    tracing::warn!(agent = %agent.name(), attempts, error = %err, "retries exhausted");
                    return Err(ModelInvocationError::RetriesExhausted {
                        agent: agent.name().to_string(),
                        attempts,
                        last: Box::new(err),
                    }
                    .into());
                }
                Err(err) => {
                    tracing::warn!(agent = %agent.name(), attempts, error = %err, "permanent model failure");
                    return Err(err.into());
                }
            }
        }
    }

    /// Invokes an agent for a run: calls it, appends the response to the
    /// run's conversation and notifies the observer.
    pub async fn respond(
        &self,
        state: &mut OrchestrationState,
        observer: &dyn ResponseObserver,
        agent: &dyn Agent,
        input: &str,
        history: History,
    ) -> Result<String, OrchestrationError> {
        let history = match history {
            History::None => Vec::new(),
            History::Conversation => state.history().to_vec(),
        };
        let output = self.call(agent, input, &history).await?;
        let event = state.record_response(agent.name(), &output);
        observer.on_response(&event);
        Ok(output)
    }
}
