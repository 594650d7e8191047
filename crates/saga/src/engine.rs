//! The engine runtime: an inbound channel drained by one task per event.

use std::future::Future;
use std::sync::Arc;

use common::CorrelationId;
use instance_store::InstanceStore;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::definition::DefinitionRegistry;
use crate::error::{Result, SagaError};
use crate::events::IncomingEvent;
use crate::gateway::{CommandDispatcher, InboundMessage};
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::timeout::TimeoutManager;

/// Feeds events into a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    sender: mpsc::UnboundedSender<IncomingEvent>,
    registry: Arc<DefinitionRegistry>,
}

impl EngineHandle {
    /// Correlates a raw message and queues it. Returns the correlation id used.
    pub fn submit(&self, message: InboundMessage) -> Result<CorrelationId> {
        let event = message.correlate(&self.registry)?;
        let correlation_id = event.correlation_id.clone();
        self.submit_event(event)?;
        Ok(correlation_id)
    }

    /// Queues an already-correlated event.
    pub fn submit_event(&self, event: IncomingEvent) -> Result<()> {
        self.sender
            .send(event)
            .map_err(|_| SagaError::EngineStopped)
    }
}

/// Owns the orchestrator and the inbound channel its timeouts report to.
pub struct SagaEngine<S, D> {
    orchestrator: Arc<Orchestrator<S, D>>,
    sender: mpsc::UnboundedSender<IncomingEvent>,
    receiver: mpsc::UnboundedReceiver<IncomingEvent>,
}

impl<S, D> SagaEngine<S, D>
where
    S: InstanceStore + 'static,
    D: CommandDispatcher + 'static,
{
    pub fn new(
        store: S,
        registry: Arc<DefinitionRegistry>,
        dispatcher: D,
        config: OrchestratorConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let timeouts = TimeoutManager::with_sender(sender.clone());
        let orchestrator = Arc::new(Orchestrator::new(
            store, registry, dispatcher, timeouts, config,
        ));
        Self {
            orchestrator,
            sender,
            receiver,
        }
    }

    /// The orchestrator, for synchronous event handling and queries.
    pub fn orchestrator(&self) -> Arc<Orchestrator<S, D>> {
        Arc::clone(&self.orchestrator)
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            sender: self.sender.clone(),
            registry: Arc::clone(self.orchestrator.registry()),
        }
    }

    /// Recovers deadlines, then handles queued events until `shutdown` resolves.
    ///
    /// In-flight events are finished before returning; pending timers are dropped
    /// and re-armed by the next start.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.orchestrator.recover().await?;
        tracing::info!("saga engine started");

        tokio::pin!(shutdown);
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                Some(event) = self.receiver.recv() => {
                    let orchestrator = Arc::clone(&self.orchestrator);
                    in_flight.spawn(async move {
                        if let Err(e) = orchestrator.handle_event(event).await {
                            report(&e);
                        }
                    });
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }

        tracing::info!(in_flight = in_flight.len(), "saga engine stopping");
        self.orchestrator.timeouts().shutdown();
        while in_flight.join_next().await.is_some() {}
        tracing::info!("saga engine stopped");
        Ok(())
    }
}

fn report(error: &SagaError) {
    if error.is_operator_visible() {
        tracing::error!(error = %error, "event handling failed");
    } else {
        tracing::debug!(error = %error, "event not applied");
    }
}
