use serde::{Deserialize, Serialize};

/// Price tertile of a product within its (region × end_use) segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceBand {
    Low,
    Mid,
    High,
    /// No usable price data for the segment
    Unknown,
}

impl Default for PriceBand {
    fn default() -> Self {
        Self::Unknown
    }
}

/// One row of the market basket table: a (customer, product) pair with
/// aggregated purchase behaviour and customer-level RFM scores copied on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasketRow {
    pub customer_id: String,
    pub product_id: String,
    pub region: String,
    pub end_use: String,
    /// `{region}_{end_use}`
    pub segment: String,
    pub brand: String,
    pub l2_category: String,
    pub l3_category: String,
    pub functionality: String,
    pub in_stock: bool,
    /// Count of distinct invoice dates on which the customer bought this product
    pub purchase_frequency: u64,
    /// Sum of ordered quantities
    pub total_quantity: f64,
    /// Days between the reference date and the most recent purchase
    pub recency_days: i64,
    /// Customer-level RFM, min-max normalised to [0,1]; recency inverted so
    /// higher means more recent
    pub rfm_recency_score: f64,
    pub rfm_frequency_score: f64,
    pub rfm_monetary_score: f64,
    pub price_band: PriceBand,
}

impl BasketRow {
    /// Average quantity per order for this pair, floored at one unit.
    pub fn per_order_quantity(&self) -> f64 {
        (self.total_quantity / (self.purchase_frequency.max(1) as f64)).max(1.0)
    }
}
