use serde::{Deserialize, Serialize};

/// A customer's cluster assignment. One customer maps to exactly one cluster.
///
/// `cluster_id` is globally unique by construction: `{segment}_{raw_label}`.
/// Raw integer labels repeat across segments and would cause ambiguous joins
/// downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub customer_id: String,
    pub cluster_id: String,
    pub segment: String,
}

impl ClusterAssignment {
    pub fn new(
        customer_id: impl Into<String>,
        segment: impl Into<String>,
        raw_label: usize,
    ) -> Self {
        let segment = segment.into();
        Self {
            customer_id: customer_id.into(),
            cluster_id: format!("{}_{}", segment, raw_label),
            segment,
        }
    }
}
