//! Domain models for the recommendation pipeline
//!
//! One file per entity: the three raw input tables (customers, products,
//! invoice lines), the typed artifacts the stages exchange (basket rows,
//! cluster assignments, association rules, recommendations), and the
//! feedback rows consumed by calibration.
//!
//! All identifier columns are `String` — no numeric coercion anywhere.

pub mod basket;
pub mod cluster;
pub mod customer;
pub mod feedback;
pub mod invoice;
pub mod product;
pub mod recommendation;
pub mod rule;

// Re-export main types for convenience
pub use basket::{BasketRow, PriceBand};
pub use cluster::ClusterAssignment;
pub use customer::Customer;
pub use feedback::FeedbackRow;
pub use invoice::InvoiceLine;
pub use product::Product;
pub use recommendation::Recommendation;
pub use rule::AssociationRule;

/// Literal used for categorical fields that are missing after a join.
pub const UNKNOWN: &str = "Unknown";

/// Trigger value marking a recommendation produced by the category-affinity
/// fallback path rather than an association rule.
pub const FALLBACK_TRIGGER: &str = "fallback";
