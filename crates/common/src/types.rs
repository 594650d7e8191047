use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier routing every event and command to one saga instance.
///
/// Correlation ids are opaque strings. When a business trigger carries a
/// natural key (a match id, an order number) the id embeds it, so a redelivered
/// trigger always resolves to the same instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Wraps an existing identifier.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Creates a random identifier for processes without a natural key.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Builds the identifier for a process type and its trigger's natural key.
    ///
    /// The result has the form `<process_type>:<natural_key>`.
    pub fn for_natural_key(process_type: &str, natural_key: &str) -> Self {
        Self(format!("{process_type}:{natural_key}"))
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<CorrelationId> for String {
    fn from(id: CorrelationId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let id1 = CorrelationId::generate();
        let id2 = CorrelationId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn natural_key_ids_are_deterministic() {
        let a = CorrelationId::for_natural_key("MatchAcceptance", "M-42");
        let b = CorrelationId::for_natural_key("MatchAcceptance", "M-42");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "MatchAcceptance:M-42");
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = CorrelationId::new("C1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"C1\"");
        let back: CorrelationId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
