use std::sync::Arc;

use tokio::sync::mpsc;

use crate::state::ResponseEvent;

/// Called synchronously once per agent response.
///
/// Implementations must return quickly; the orchestration waits for the call.
pub trait ResponseObserver: Send + Sync {
    fn on_response(&self, event: &ResponseEvent);
}

impl<F> ResponseObserver for F
where
    F: Fn(&ResponseEvent) + Send + Sync,
{
    fn on_response(&self, event: &ResponseEvent) {
        self(event)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ResponseObserver for NoopObserver {
    fn on_response(&self, _event: &ResponseEvent) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ResponseObserver for TracingObserver {
    fn on_response(&self, event: &ResponseEvent) {
        tracing::info!(
            run_id = %event.run_id,
            agent = %event.agent,
            iteration = event.iteration,
            sequence = event.sequence,
            chars = event.content.chars().count(),
            "agent responded"
        );
        tracing::debug!(agent = %event.agent, content = %event.content, "agent response content");
    }
}

/// Forwards events onto an unbounded channel so consumers can process them
/// on their own task.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ResponseEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ResponseEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ResponseObserver for ChannelObserver {
    fn on_response(&self, event: &ResponseEvent) {
        if self.tx.send(event.clone()).is_err() {
            tracing::debug!(agent = %event.agent, "response channel closed; dropping event");
        }
    }
}

#[derive(Default, Clone)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn ResponseObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn ResponseObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl ResponseObserver for ObserverSet {
    fn on_response(&self, event: &ResponseEvent) {
        for observer in &self.observers {
            observer.on_response(event);
        }
    }
}
