use serde::{Deserialize, Serialize};

/// A business customer of the distributor. Immutable within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    /// Customer identifier — always a string, never coerced to a number
    pub customer_id: String,
    #[serde(default)]
    pub customer_name: String,
    /// Sales region, first half of the segment key
    pub region: String,
    /// End-use industry, second half of the segment key
    pub end_use: String,
    #[serde(default)]
    pub customer_type: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    /// Years as a customer
    #[serde(default)]
    pub tenure: Option<f64>,
    #[serde(default)]
    pub credit_limit: Option<f64>,
}

impl Customer {
    /// The business segment key: `{region}_{end_use}`. Clustering and rule
    /// mining are strictly scoped to this key.
    pub fn segment(&self) -> String {
        format!("{}_{}", self.region, self.end_use)
    }
}
