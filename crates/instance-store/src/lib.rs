//! Instance store for saga orchestration.
//!
//! The store is the single source of truth for running sagas. Every write is
//! conditioned on the record's version, which is what serializes concurrent
//! transitions of one instance without any lock service.

pub mod error;
pub mod instance;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod store;

pub use common::{CorrelationId, Payload, SagaState};
pub use error::{Result, StoreError};
pub use instance::{SagaInstance, Version};
pub use memory::InMemoryInstanceStore;
pub use postgres::PostgresInstanceStore;
pub use query::{InstanceQuery, StateCount};
pub use store::{InsertOutcome, InstanceStore, InstanceStoreExt};
