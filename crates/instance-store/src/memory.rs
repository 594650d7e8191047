use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    CorrelationId, InstanceQuery, Result, SagaInstance, StateCount, StoreError, Version,
    store::{InsertOutcome, InstanceStore, validate_insert_version, validate_update_version},
};

/// In-memory instance store for tests and single-process runs.
///
/// This implementation keeps every instance in a map and provides the same
/// conditional-write semantics as the PostgreSQL implementation.
#[derive(Clone, Default)]
pub struct InMemoryInstanceStore {
    instances: Arc<RwLock<HashMap<CorrelationId, SagaInstance>>>,
}

impl InMemoryInstanceStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of instances stored.
    pub async fn instance_count(&self) -> usize {
        self.instances.read().await.len()
    }

    /// Clears all instances.
    pub async fn clear(&self) {
        self.instances.write().await.clear();
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn insert_if_absent(&self, instance: &SagaInstance) -> Result<InsertOutcome> {
        validate_insert_version(instance)?;

        let mut store = self.instances.write().await;
        if store.contains_key(&instance.correlation_id) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        store.insert(instance.correlation_id.clone(), instance.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn get(&self, correlation_id: &CorrelationId) -> Result<Option<SagaInstance>> {
        let store = self.instances.read().await;
        Ok(store.get(correlation_id).cloned())
    }

    async fn update(&self, instance: &SagaInstance, expected_version: Version) -> Result<Version> {
        validate_update_version(instance, expected_version)?;

        let mut store = self.instances.write().await;
        let current = store
            .get_mut(&instance.correlation_id)
            .ok_or_else(|| StoreError::NotFound(instance.correlation_id.clone()))?;

        if current.version != expected_version {
            tracing::debug!(
                correlation_id = %instance.correlation_id,
                expected = %expected_version,
                actual = %current.version,
                "version check failed"
            );
            return Err(StoreError::ConcurrencyConflict {
                correlation_id: instance.correlation_id.clone(),
                expected: expected_version,
                actual: current.version,
            });
        }

        *current = instance.clone();
        Ok(instance.version)
    }

    async fn query(&self, query: InstanceQuery) -> Result<Vec<SagaInstance>> {
        let store = self.instances.read().await;
        let mut instances: Vec<_> = store
            .values()
            .filter(|i| {
                if let Some(ref process_type) = query.process_type
                    && &i.process_type != process_type
                {
                    return false;
                }
                if let Some(ref state) = query.state
                    && &i.current_state != state
                {
                    return false;
                }
                true
            })
            .cloned()
            .collect();

        instances.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.correlation_id.cmp(&b.correlation_id))
        });

        let offset = query.offset.unwrap_or(0);
        let instances = instances.into_iter().skip(offset);
        let instances = match query.limit {
            Some(limit) => instances.take(limit).collect(),
            None => instances.collect(),
        };

        Ok(instances)
    }

    async fn count_by_state(&self, process_type: &str) -> Result<Vec<StateCount>> {
        let store = self.instances.read().await;
        let mut counts: HashMap<String, i64> = HashMap::new();
        for instance in store.values().filter(|i| i.process_type == process_type) {
            *counts.entry(instance.current_state.name()).or_default() += 1;
        }

        let mut counts: Vec<_> = counts
            .into_iter()
            .map(|(state, count)| StateCount { state, count })
            .collect();
        counts.sort_by(|a, b| a.state.cmp(&b.state));
        Ok(counts)
    }

    async fn find_pending_deadlines(&self) -> Result<Vec<SagaInstance>> {
        let store = self.instances.read().await;
        let mut pending: Vec<_> = store
            .values()
            .filter(|i| !i.is_terminal() && i.deadline_at.is_some())
            .cloned()
            .collect();
        pending.sort_by_key(|i| i.deadline_at);
        Ok(pending)
    }
}
