use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One account-manager feedback row from a prior cycle.
///
/// Rating and sentiment stay as free strings: feedback exports are typed by
/// hand and the weight table has an explicit row for unrecognised values, so
/// parsing must never reject a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRow {
    pub customer_id: String,
    pub product_id: String,
    /// Expected High / Medium / Low; anything else resolves to weight 1.0
    #[serde(default)]
    pub rating: String,
    #[serde(default)]
    pub reason_code: Option<String>,
    /// Expected positive / negative when present
    #[serde(default)]
    pub sentiment: Option<String>,
    #[serde(default)]
    pub feedback_date: Option<NaiveDate>,
}

/// Reason codes that resolve a Medium rating to the negative weight.
pub const NEGATIVE_REASONS: &[&str] = &[
    "not_relevant",
    "wrong_category",
    "already_have_contract",
    "customer_not_interested",
    "price_too_high",
    "out_of_territory",
    "competitor_product",
    "not_applicable",
    "poor_quality_signal",
];

/// Reason codes that resolve a Medium rating to the positive weight.
pub const POSITIVE_REASONS: &[&str] = &[
    "good_fit",
    "high_potential",
    "customer_interested",
    "complements_existing",
    "strong_affinity",
    "recommended_and_sold",
];
