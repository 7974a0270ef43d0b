//! Pipeline configuration
//!
//! Every numeric threshold used by the pipeline is a named, typed parameter
//! with a built-in default. Values load from `RECO_`-prefixed environment
//! variables over the defaults, so a scheduler can tune any stage without a
//! code change (e.g. `RECO_MIN_LIFT=1.5`, `RECO_TOP_K=10`).

use config::Environment;
use serde::Deserialize;
use tracing::warn;

use crate::errors::RecoResult;

/// All tunable parameters of the six-stage pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    // ---- S1 market basket ----
    /// Invoices older than this many days before the reference date are dropped
    #[serde(default = "defaults::recency_cutoff_days")]
    pub recency_cutoff_days: i64,
    /// Customers with fewer distinct invoices than this are dropped
    #[serde(default = "defaults::min_order_count")]
    pub min_order_count: usize,
    /// Comma-separated candidate names for the invoice price column
    #[serde(default = "defaults::price_aliases")]
    pub price_aliases: String,

    // ---- S2 clustering ----
    /// Maximum number of clusters attempted per segment
    #[serde(default = "defaults::max_k")]
    pub max_k: usize,
    /// Segments smaller than this collapse to a single cluster
    #[serde(default = "defaults::min_cluster_customers")]
    pub min_cluster_customers: usize,
    /// Percentage inertia drop below which the elbow search stops
    #[serde(default = "defaults::elbow_threshold")]
    pub elbow_threshold: f64,
    /// Comma-separated feature groups: l2_qty, brand, functionality, rfm
    #[serde(default = "defaults::feature_groups")]
    pub feature_groups: String,
    /// Seed for k-means initialisation — fixed so reruns are reproducible
    #[serde(default = "defaults::random_state")]
    pub random_state: u64,
    /// Number of seeded k-means restarts; the lowest-inertia run wins
    #[serde(default = "defaults::n_init")]
    pub n_init: usize,

    // ---- S3 associations ----
    /// Basket session window in days; 0 = derive from the data
    #[serde(default = "defaults::window_days")]
    pub window_days: i64,
    /// Exponential decay rate per day of basket age
    #[serde(default = "defaults::decay_lambda")]
    pub decay_lambda: f64,
    /// Absolute floor on product_freq for rule emission
    #[serde(default = "defaults::min_abs_freq")]
    pub min_abs_freq: u64,
    /// Proportional floor on product_freq relative to cluster basket count
    #[serde(default = "defaults::min_freq_ratio")]
    pub min_freq_ratio: f64,
    /// Rules below this lift are discarded as popularity artifacts
    #[serde(default = "defaults::min_lift")]
    pub min_lift: f64,

    // ---- S4 ranking ----
    /// Maximum recommendations per customer
    #[serde(default = "defaults::top_k")]
    pub top_k: usize,
    /// Minimum rule support for a recommendation
    #[serde(default = "defaults::min_support")]
    pub min_support: f64,
    /// Minimum rule confidence for a recommendation
    #[serde(default = "defaults::min_confidence")]
    pub min_confidence: f64,
    /// Composite score weight on confidence
    #[serde(default = "defaults::w_conf")]
    pub w_conf: f64,
    /// Composite score weight on weighted support
    #[serde(default = "defaults::w_supp")]
    pub w_supp: f64,
    /// Composite score weight on the normalised lift contribution
    #[serde(default = "defaults::w_lift")]
    pub w_lift: f64,
    /// Composite score weight on customer recency
    #[serde(default = "defaults::w_recency")]
    pub w_recency: f64,
    /// Lift value at which the lift contribution saturates at 1.0
    #[serde(default = "defaults::max_lift_normalise")]
    pub max_lift_normalise: f64,
    /// Bonus multiplier applied to the customer's L3 share on a tiebreak
    #[serde(default = "defaults::l3_tiebreak_margin")]
    pub l3_tiebreak_margin: f64,
    /// How many of the customer's L3 categories count as "top" for the bonus
    #[serde(default = "defaults::l3_top_n")]
    pub l3_top_n: usize,

    // ---- S5 feedback calibration ----
    /// Feedback older than this many days before the newest feedback is dropped
    #[serde(default = "defaults::feedback_recency_days")]
    pub feedback_recency_days: i64,
    /// Calibrated scores below this are removed
    #[serde(default = "defaults::score_cutoff")]
    pub score_cutoff: f64,
    /// Weight for a High rating
    #[serde(default = "defaults::weight_high")]
    pub weight_high: f64,
    /// Weight for a Low rating
    #[serde(default = "defaults::weight_low")]
    pub weight_low: f64,
    /// Weight for a Medium rating resolved positive
    #[serde(default = "defaults::weight_med_pos")]
    pub weight_med_pos: f64,
    /// Weight for a Medium rating resolved negative
    #[serde(default = "defaults::weight_med_neg")]
    pub weight_med_neg: f64,
}

mod defaults {
    pub fn recency_cutoff_days() -> i64 {
        730
    }
    pub fn min_order_count() -> usize {
        1
    }
    pub fn price_aliases() -> String {
        "unit_price,price,list_price,unit_cost,sale_price".to_string()
    }
    pub fn max_k() -> usize {
        8
    }
    pub fn min_cluster_customers() -> usize {
        6
    }
    pub fn elbow_threshold() -> f64 {
        10.0
    }
    pub fn feature_groups() -> String {
        "l2_qty,brand,functionality,rfm".to_string()
    }
    pub fn random_state() -> u64 {
        42
    }
    pub fn n_init() -> usize {
        15
    }
    pub fn window_days() -> i64 {
        0
    }
    pub fn decay_lambda() -> f64 {
        0.001
    }
    pub fn min_abs_freq() -> u64 {
        3
    }
    pub fn min_freq_ratio() -> f64 {
        0.02
    }
    pub fn min_lift() -> f64 {
        1.2
    }
    pub fn top_k() -> usize {
        5
    }
    pub fn min_support() -> f64 {
        0.01
    }
    pub fn min_confidence() -> f64 {
        0.05
    }
    pub fn w_conf() -> f64 {
        0.45
    }
    pub fn w_supp() -> f64 {
        0.20
    }
    pub fn w_lift() -> f64 {
        0.20
    }
    pub fn w_recency() -> f64 {
        0.15
    }
    pub fn max_lift_normalise() -> f64 {
        5.0
    }
    pub fn l3_tiebreak_margin() -> f64 {
        0.02
    }
    pub fn l3_top_n() -> usize {
        3
    }
    pub fn feedback_recency_days() -> i64 {
        365
    }
    pub fn score_cutoff() -> f64 {
        0.08
    }
    pub fn weight_high() -> f64 {
        1.3
    }
    pub fn weight_low() -> f64 {
        0.1
    }
    pub fn weight_med_pos() -> f64 {
        1.0
    }
    pub fn weight_med_neg() -> f64 {
        0.4
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        // An empty source leaves every field to its serde default
        serde_json::from_str("{}").expect("built-in defaults must deserialize")
    }
}

impl PipelineConfig {
    /// Load configuration from `RECO_`-prefixed environment variables over
    /// the built-in defaults.
    ///
    /// `RECO_MAX_K=6` maps to `max_k`, `RECO_ELBOW_THRESHOLD=15` to
    /// `elbow_threshold`, and so on.
    pub fn from_env() -> RecoResult<Self> {
        let cfg = config::Config::builder()
            .add_source(Environment::with_prefix("RECO").try_parsing(true))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    /// Feature groups selected for clustering, in declaration order.
    pub fn feature_group_list(&self) -> Vec<&str> {
        self.feature_groups
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Candidate invoice price column names, in priority order.
    pub fn price_alias_list(&self) -> Vec<&str> {
        self.price_aliases
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Scoring weights, renormalised to sum to 1.0.
    ///
    /// Misconfigured weights are a recoverable configuration error: we warn
    /// and renormalise rather than abort, since the relative proportions are
    /// still meaningful.
    pub fn scoring_weights(&self) -> (f64, f64, f64, f64) {
        let sum = self.w_conf + self.w_supp + self.w_lift + self.w_recency;
        if (sum - 1.0).abs() < 1e-9 {
            return (self.w_conf, self.w_supp, self.w_lift, self.w_recency);
        }
        if sum <= 0.0 {
            warn!(
                sum,
                "scoring weights sum to a non-positive value; using equal weights"
            );
            return (0.25, 0.25, 0.25, 0.25);
        }
        warn!(sum, "scoring weights do not sum to 1.0; renormalising");
        (
            self.w_conf / sum,
            self.w_supp / sum,
            self.w_lift / sum,
            self.w_recency / sum,
        )
    }
}
