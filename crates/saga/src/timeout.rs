//! Step deadlines.
//!
//! One tokio timer per instance. Expiry does not touch the store; it sends a
//! synthetic timeout event into the engine's inbound channel, where it is
//! handled like any other event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{CorrelationId, SagaState};
use instance_store::Version;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::IncomingEvent;

struct Timer {
    version: Version,
    handle: JoinHandle<()>,
}

/// Arms and cancels per-instance deadlines.
#[derive(Clone)]
pub struct TimeoutManager {
    timers: Arc<Mutex<HashMap<CorrelationId, Timer>>>,
    sender: mpsc::UnboundedSender<IncomingEvent>,
}

impl TimeoutManager {
    /// Creates a manager and the receiver its timeout events arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<IncomingEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::with_sender(sender), receiver)
    }

    /// Creates a manager that sends timeout events to an existing channel.
    pub fn with_sender(sender: mpsc::UnboundedSender<IncomingEvent>) -> Self {
        Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            sender,
        }
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<CorrelationId, Timer>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedules a timeout for `state` at `version` after `delay`.
    ///
    /// Replaces a timer armed for the same or an older version. A timer armed
    /// for a newer version wins and nothing is scheduled; returns whether the
    /// timer was armed.
    pub fn arm(
        &self,
        correlation_id: CorrelationId,
        state: SagaState,
        version: Version,
        delay: Duration,
    ) -> bool {
        // Held across spawn so a zero-delay timer cannot fire before it is recorded.
        let mut armed = self.timers();
        if let Some(existing) = armed.get(&correlation_id) {
            if existing.version > version {
                tracing::debug!(
                    correlation_id = %correlation_id,
                    version = %version,
                    armed_version = %existing.version,
                    "newer deadline already armed, skipping"
                );
                return false;
            }
        }

        let timers = Arc::clone(&self.timers);
        let sender = self.sender.clone();
        let key = correlation_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            {
                let mut timers = timers.lock().unwrap_or_else(PoisonError::into_inner);
                if timers.get(&key).is_some_and(|t| t.version == version) {
                    timers.remove(&key);
                }
            }

            tracing::info!(
                correlation_id = %key,
                state = %state,
                version = %version,
                "step deadline elapsed"
            );
            metrics::counter!("saga_timeouts_total").increment(1);
            if sender
                .send(IncomingEvent::timeout(key.clone(), &state, version))
                .is_err()
            {
                tracing::debug!(correlation_id = %key, "engine stopped, timeout dropped");
            }
        });

        if let Some(previous) = armed.insert(correlation_id, Timer { version, handle }) {
            previous.handle.abort();
        }
        true
    }

    /// Schedules a timeout at a wall-clock deadline; past deadlines fire at once.
    pub fn arm_until(
        &self,
        correlation_id: CorrelationId,
        state: SagaState,
        version: Version,
        deadline: DateTime<Utc>,
    ) -> bool {
        let delay = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.arm(correlation_id, state, version, delay)
    }

    /// Aborts the pending timer of an instance if it was armed before
    /// `committed`. A timer belonging to `committed` or a later version stays.
    pub fn cancel(&self, correlation_id: &CorrelationId, committed: Version) {
        let mut armed = self.timers();
        if armed
            .get(correlation_id)
            .is_some_and(|timer| timer.version < committed)
        {
            if let Some(timer) = armed.remove(correlation_id) {
                timer.handle.abort();
            }
        }
    }

    /// Version of the pending timer of an instance.
    pub fn armed_version(&self, correlation_id: &CorrelationId) -> Option<Version> {
        self.timers().get(correlation_id).map(|timer| timer.version)
    }

    /// Returns true if a timer is armed for the instance.
    pub fn is_armed(&self, correlation_id: &CorrelationId) -> bool {
        self.timers().contains_key(correlation_id)
    }

    /// Number of armed timers.
    pub fn pending(&self) -> usize {
        self.timers().len()
    }

    /// Aborts every timer.
    pub fn shutdown(&self) {
        for (_, timer) in self.timers().drain() {
            timer.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TIMEOUT_EVENT;

    fn state() -> SagaState {
        SagaState::step("AwaitingSlotReservation")
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_timeout_event() {
        let (manager, mut rx) = TimeoutManager::new();
        let id = CorrelationId::new("C1");

        manager.arm(id.clone(), state(), Version::first(), Duration::from_secs(30));
        assert!(manager.is_armed(&id));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, TIMEOUT_EVENT);
        assert_eq!(event.correlation_id, id);
        assert_eq!(event.timeout_target(), Some((state(), Version::first())));
        assert!(!manager.is_armed(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let (manager, mut rx) = TimeoutManager::new();
        let id = CorrelationId::new("C1");

        manager.arm(id.clone(), state(), Version::first(), Duration::from_secs(30));
        manager.cancel(&id, Version::new(2));
        assert_eq!(manager.pending(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_replaces_previous_timer() {
        let (manager, mut rx) = TimeoutManager::new();
        let id = CorrelationId::new("C1");

        manager.arm(id.clone(), state(), Version::first(), Duration::from_secs(10));
        manager.arm(id.clone(), state(), Version::new(2), Duration::from_secs(20));
        assert_eq!(manager.pending(), 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.timeout_target(), Some((state(), Version::new(2))));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_older_version_cannot_replace_newer_timer() {
        let (manager, mut rx) = TimeoutManager::new();
        let id = CorrelationId::new("C1");
        let next = SagaState::step("AwaitingNotifications");

        assert!(manager.arm(id.clone(), next.clone(), Version::new(2), Duration::from_secs(60)));
        assert!(!manager.arm(id.clone(), state(), Version::first(), Duration::from_secs(30)));
        assert_eq!(manager.armed_version(&id), Some(Version::new(2)));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.timeout_target(), Some((next, Version::new(2))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_keeps_timer_of_newer_version() {
        let (manager, mut rx) = TimeoutManager::new();
        let id = CorrelationId::new("C1");

        manager.arm(id.clone(), state(), Version::new(3), Duration::from_secs(30));
        manager.cancel(&id, Version::new(2));
        manager.cancel(&id, Version::new(3));
        assert_eq!(manager.armed_version(&id), Some(Version::new(3)));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.timeout_target(), Some((state(), Version::new(3))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_deadline_fires_immediately() {
        let (manager, mut rx) = TimeoutManager::new();
        let id = CorrelationId::new("C1");

        manager.arm_until(
            id.clone(),
            state(),
            Version::first(),
            Utc::now() - chrono::Duration::seconds(5),
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.correlation_id, id);
    }
}
