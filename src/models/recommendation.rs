use serde::{Deserialize, Serialize};

/// One ranked recommendation for a customer.
///
/// `trigger_product` is the already-purchased product whose association drove
/// this recommendation, or the literal `"fallback"` for category-affinity
/// fallback rows (which carry zero support/confidence/lift).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub customer_id: String,
    pub recommended_product: String,
    pub cluster_id: String,
    pub segment: String,
    pub l2_category: String,
    pub l3_category: String,
    pub trigger_product: String,
    pub support: f64,
    pub confidence: f64,
    pub lift: f64,
    /// Composite score; recalibrated by feedback in the final table
    pub score: f64,
    /// Suggested order quantity, at least 1
    pub recommended_qty: u32,
    /// Template-based human-readable rationale
    pub reason: String,
    /// 1-based dense rank within the customer, no gaps, no ties
    pub rank: u32,
}

impl Recommendation {
    /// Whether this row came from the fallback path.
    pub fn is_fallback(&self) -> bool {
        self.trigger_product == crate::models::FALLBACK_TRIGGER
    }
}
