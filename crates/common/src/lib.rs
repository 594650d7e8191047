//! Shared vocabulary for the saga orchestration engine.

pub mod payload;
pub mod state;
pub mod types;

pub use payload::{Payload, merge_payload};
pub use state::{COMPENSATING_PREFIX, SagaState};
pub use types::CorrelationId;
