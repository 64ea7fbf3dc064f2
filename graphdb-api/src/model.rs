//! Public entity types returned by the storage engine.
//!
//! Every getter hands callers a deep clone of these structs, never a
//! reference into engine-internal state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// `0` is reserved and never assigned to a real node or edge.
pub const ABSENT_ID: u64 = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: u64,
    /// Tags on the node. Semantically an unordered set (each `(label,
    /// node)` pair is indexed at most once) but stored in insertion order
    /// so callers see a stable listing.
    pub labels: Vec<String>,
    pub properties: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: u64,
    pub from: u64,
    pub to: u64,
    /// Relationship type, e.g. `"KNOWS"`. Named `edge_type` because `type`
    /// is a reserved word.
    pub edge_type: String,
    pub properties: BTreeMap<String, Value>,
    pub weight: f64,
    pub created_at: DateTime<Utc>,
}

/// Atomic snapshot of engine-wide counters, returned by `GetStatistics`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub node_count: u64,
    pub edge_count: u64,
    pub total_queries: u64,
    pub avg_query_time_nanos: f64,
    pub last_snapshot: Option<DateTime<Utc>>,
}

impl Default for Statistics {
    fn default() -> Self {
        Statistics {
            node_count: 0,
            edge_count: 0,
            total_queries: 0,
            avg_query_time_nanos: 0.0,
            last_snapshot: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_has_label_checks_membership() {
        let node = Node {
            id: 1,
            labels: vec!["Person".to_string()],
            properties: BTreeMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(node.has_label("Person"));
        assert!(!node.has_label("Company"));
    }
}
