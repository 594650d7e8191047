use serde::Serialize;

use crate::SagaState;

/// Builder for operational instance queries.
///
/// Backed by the `(process_type, current_state)` index, so questions like
/// "how many instances are stuck in step X" stay cheap.
#[derive(Debug, Clone, Default)]
pub struct InstanceQuery {
    /// Filter by process type.
    pub process_type: Option<String>,

    /// Filter by current state.
    pub state: Option<SagaState>,

    /// Maximum number of instances to return.
    pub limit: Option<usize>,

    /// Number of instances to skip.
    pub offset: Option<usize>,
}

impl InstanceQuery {
    /// Creates a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for instances of one process type.
    pub fn for_process_type(process_type: impl Into<String>) -> Self {
        Self {
            process_type: Some(process_type.into()),
            ..Default::default()
        }
    }

    /// Filters by process type.
    pub fn process_type(mut self, process_type: impl Into<String>) -> Self {
        self.process_type = Some(process_type.into());
        self
    }

    /// Filters by current state.
    pub fn state(mut self, state: SagaState) -> Self {
        self.state = Some(state);
        self
    }

    /// Limits the number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips the first `offset` results.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Number of instances of one process type sitting in one state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateCount {
    pub state: String,
    pub count: i64,
}
