use std::sync::Arc;

use async_trait::async_trait;

use crate::{CorrelationId, InstanceQuery, Result, SagaInstance, StateCount, StoreError, Version};

/// Outcome of an insert-if-absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The instance was created by this call.
    Inserted,
    /// An instance with the same correlation id already existed; nothing was written.
    AlreadyExists,
}

/// Core trait for instance store implementations.
///
/// All implementations must be thread-safe (Send + Sync) and must implement
/// `insert_if_absent` and `update` atomically.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Stores a new instance unless one with the same correlation id exists.
    async fn insert_if_absent(&self, instance: &SagaInstance) -> Result<InsertOutcome>;

    /// Retrieves an instance by correlation id.
    async fn get(&self, correlation_id: &CorrelationId) -> Result<Option<SagaInstance>>;

    /// Replaces an instance, conditioned on the stored version.
    ///
    /// `instance.version` must equal `expected_version.next()`. Fails with
    /// `ConcurrencyConflict` if the stored version is not `expected_version`.
    /// Returns the new stored version.
    async fn update(&self, instance: &SagaInstance, expected_version: Version) -> Result<Version>;

    /// Retrieves instances matching a query, oldest first.
    async fn query(&self, query: InstanceQuery) -> Result<Vec<SagaInstance>>;

    /// Counts instances of a process type per current state.
    async fn count_by_state(&self, process_type: &str) -> Result<Vec<StateCount>>;

    /// Retrieves every non-terminal instance with an armed deadline,
    /// earliest deadline first.
    async fn find_pending_deadlines(&self) -> Result<Vec<SagaInstance>>;
}

#[async_trait]
impl<T: InstanceStore + ?Sized> InstanceStore for Arc<T> {
    async fn insert_if_absent(&self, instance: &SagaInstance) -> Result<InsertOutcome> {
        (**self).insert_if_absent(instance).await
    }

    async fn get(&self, correlation_id: &CorrelationId) -> Result<Option<SagaInstance>> {
        (**self).get(correlation_id).await
    }

    async fn update(&self, instance: &SagaInstance, expected_version: Version) -> Result<Version> {
        (**self).update(instance, expected_version).await
    }

    async fn query(&self, query: InstanceQuery) -> Result<Vec<SagaInstance>> {
        (**self).query(query).await
    }

    async fn count_by_state(&self, process_type: &str) -> Result<Vec<StateCount>> {
        (**self).count_by_state(process_type).await
    }

    async fn find_pending_deadlines(&self) -> Result<Vec<SagaInstance>> {
        (**self).find_pending_deadlines().await
    }
}

/// Extension trait providing convenience methods for instance stores.
#[async_trait]
pub trait InstanceStoreExt: InstanceStore {
    /// Checks if an instance exists.
    async fn exists(&self, correlation_id: &CorrelationId) -> Result<bool> {
        Ok(self.get(correlation_id).await?.is_some())
    }

    /// Retrieves an instance, failing with `NotFound` if absent.
    async fn get_required(&self, correlation_id: &CorrelationId) -> Result<SagaInstance> {
        self.get(correlation_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(correlation_id.clone()))
    }
}

// Blanket implementation for all InstanceStore implementations
impl<T: InstanceStore + ?Sized> InstanceStoreExt for T {}

/// Validates that a record is written at the version after `expected`.
pub fn validate_update_version(instance: &SagaInstance, expected: Version) -> Result<()> {
    if instance.version != expected.next() {
        return Err(StoreError::InvalidVersion {
            correlation_id: instance.correlation_id.clone(),
            expected: expected.next(),
            actual: instance.version,
        });
    }
    Ok(())
}

/// Validates that a new record starts at the first version.
pub fn validate_insert_version(instance: &SagaInstance) -> Result<()> {
    if instance.version != Version::first() {
        return Err(StoreError::InvalidVersion {
            correlation_id: instance.correlation_id.clone(),
            expected: Version::first(),
            actual: instance.version,
        });
    }
    Ok(())
}
