use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an aggregate instance.
///
/// Wraps a UUID so order ids cannot be confused with event ids or any other
/// UUID-keyed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(Uuid);

impl AggregateId {
    /// Creates a new random aggregate ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for AggregateId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AggregateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AggregateId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for AggregateId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<AggregateId> for Uuid {
    fn from(id: AggregateId) -> Self {
        id.0
    }
}

/// Name of an append-only event stream.
///
/// Every aggregate instance owns exactly one stream, named
/// `{aggregate_type}-{aggregate_id}` (for example `Order-6f1c...`). Subscriptions
/// select streams by prefix, so `"Order-"` matches every order stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Derives the stream name owned by an aggregate instance.
    pub fn for_aggregate(aggregate_type: &str, id: AggregateId) -> Self {
        Self(format!("{aggregate_type}-{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true when the stream name starts with `prefix`.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }

    /// Returns true when the stream matches at least one prefix. An empty
    /// prefix list matches every stream.
    pub fn matches_any<S: AsRef<str>>(&self, prefixes: &[S]) -> bool {
        prefixes.is_empty() || prefixes.iter().any(|p| self.has_prefix(p.as_ref()))
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for StreamId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_id_new_creates_unique_ids() {
        assert_ne!(AggregateId::new(), AggregateId::new());
    }

    #[test]
    fn aggregate_id_parses_from_string() {
        let id = AggregateId::new();
        let parsed: AggregateId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<AggregateId>().is_err());
    }

    #[test]
    fn aggregate_id_serializes_as_plain_uuid() {
        let id = AggregateId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_uuid()));
    }

    #[test]
    fn stream_id_for_aggregate_is_deterministic() {
        let id = AggregateId::new();
        let a = StreamId::for_aggregate("Order", id);
        let b = StreamId::for_aggregate("Order", id);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), format!("Order-{id}"));
    }

    #[test]
    fn stream_id_prefix_matching() {
        let stream = StreamId::for_aggregate("Order", AggregateId::new());
        assert!(stream.has_prefix("Order-"));
        assert!(!stream.has_prefix("Customer-"));
        assert!(stream.matches_any(&["Customer-", "Order-"]));
        assert!(!stream.matches_any(&["Customer-"]));
        assert!(stream.matches_any::<&str>(&[]));
    }
}
