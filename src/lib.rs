//! # Product Recommendation Engine
//!
//! A production-ready recommendation pipeline for industrial-supply
//! distribution: given customers, products and invoice line items, it emits
//! per-customer ranked product recommendations with trigger products,
//! quantity suggestions, human-readable rationales and composite scores,
//! and re-calibrates those scores with account-manager feedback.
//!
//! ## The six stages
//!
//! 1. **Market basket** — aggregate invoices to (customer × product) rows
//!    with RFM scores and segment price bands
//! 2. **Clustering** — per-segment k-means over proportion features with
//!    elbow-based k selection; models persist for cold-start inference
//! 3. **Associations** — time-decayed co-occurrence rules mined from
//!    window-bounded basket sessions, filtered by adaptive floors and lift
//! 4. **Ranking** — composite scoring with an L3 affinity tiebreak and a
//!    category-aware segment fallback
//! 5. **Feedback calibration** — score re-weighting, threshold suggestions
//!    and a published feedback summary
//! 6. **Inference** — a read-only snapshot answering per-customer queries,
//!    with real-time cluster assignment for cold-start customers
//!
//! Stages communicate only through named, typed tabular artifacts in a run
//! directory; rerunning any stage with identical inputs, configuration and
//! seed produces byte-identical outputs.
//!
//! ## Quick start
//!
//! ```no_run
//! use reco_engine::prelude::*;
//!
//! let config = PipelineConfig::from_env()?;
//! let store = ArtifactStore::open("runs/2024-06")?;
//! let pipeline = Pipeline::new(config, store);
//! pipeline.run(&PipelineInputs {
//!     customers: "data/customers.csv".into(),
//!     products: "data/products.csv".into(),
//!     invoices: "data/invoices.csv".into(),
//! })?;
//!
//! let service = RecommendationService::load(pipeline.store())?;
//! let response = service.handle(&InferenceRequest {
//!     customer_id: "C001".to_string(),
//!     segment: None,
//!     purchase_vector: None,
//! });
//! println!("{}", serde_json::to_string_pretty(&response)?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod associations;
pub mod clustering;
pub mod config;
pub mod errors;
pub mod feedback;
pub mod inference;
pub mod market_basket;
pub mod models;
pub mod pipeline;
pub mod ranking;
pub mod serialization;
pub mod store;

#[cfg(test)]
mod tests;

/// Convenience module for common imports
pub mod prelude {
    pub use crate::config::PipelineConfig;
    pub use crate::errors::{RecoError, RecoResult};
    pub use crate::inference::{
        BatchRequest, BatchResponse, InferenceRequest, InferenceResponse, RecommendationService,
    };
    pub use crate::models::{
        AssociationRule, BasketRow, ClusterAssignment, Customer, FeedbackRow, InvoiceLine,
        PriceBand, Product, Recommendation,
    };
    pub use crate::pipeline::{Pipeline, PipelineInputs};
    pub use crate::store::ArtifactStore;
}
