//! Stage 6 — inference surface
//!
//! Answers per-customer recommendation queries from a read-only snapshot
//! loaded once at startup: the published final recommendations, the model
//! registry and every per-segment scaler/model. Known customers get their
//! precomputed rows; unknown customers with a segment and purchase vector
//! get a real-time cluster assignment. Every failure mode returns a
//! structured error payload — never a panic, never a silent empty result.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clustering::{load_models, ModelRegistry, SegmentModel};
use crate::errors::RecoResult;
use crate::models::Recommendation;
use crate::store::ArtifactStore;

/// A single recommendation query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub customer_id: String,
    /// Required for cold-start resolution
    #[serde(default)]
    pub segment: Option<String>,
    /// Feature name → quantity; required for cold-start resolution
    #[serde(default)]
    pub purchase_vector: Option<BTreeMap<String, f64>>,
}

/// A structured response; `source` is "precomputed", "realtime_assignment"
/// or "error".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub customer_id: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    pub recommendations: Vec<Recommendation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InferenceResponse {
    fn error(customer_id: &str, error: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.to_string(),
            source: "error".to_string(),
            cluster_id: None,
            recommendations: Vec::new(),
            message: None,
            error: Some(error.into()),
        }
    }
}

/// Batch request: per-instance failures become error entries, the batch
/// itself never aborts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub instances: Vec<InferenceRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub predictions: Vec<InferenceResponse>,
}

/// The read-only state shared by all requests.
#[derive(Debug, Clone)]
pub struct Snapshot {
    recommendations: BTreeMap<String, Vec<Recommendation>>,
    registry: ModelRegistry,
    models: BTreeMap<String, SegmentModel>,
}

/// The request-time service. Loads its snapshot once; requests read it
/// without locking.
#[derive(Debug, Clone)]
pub struct RecommendationService {
    snapshot: Snapshot,
}

impl RecommendationService {
    /// Load the snapshot from a completed run directory.
    pub fn load(store: &ArtifactStore) -> RecoResult<Self> {
        let finals = store.read_final_recommendations()?;
        let (registry, models) = load_models(&store.model_dir()?)?;

        let mut recommendations: BTreeMap<String, Vec<Recommendation>> = BTreeMap::new();
        for rec in finals {
            recommendations
                .entry(rec.customer_id.clone())
                .or_default()
                .push(rec);
        }
        for recs in recommendations.values_mut() {
            recs.sort_by_key(|r| r.rank);
        }

        info!(
            customers = recommendations.len(),
            segments = models.len(),
            "inference snapshot loaded"
        );
        Ok(Self {
            snapshot: Snapshot {
                recommendations,
                registry,
                models,
            },
        })
    }

    /// Build a service from in-memory parts (tests, embedded use).
    pub fn from_parts(
        finals: Vec<Recommendation>,
        registry: ModelRegistry,
        models: BTreeMap<String, SegmentModel>,
    ) -> Self {
        let mut recommendations: BTreeMap<String, Vec<Recommendation>> = BTreeMap::new();
        for rec in finals {
            recommendations
                .entry(rec.customer_id.clone())
                .or_default()
                .push(rec);
        }
        for recs in recommendations.values_mut() {
            recs.sort_by_key(|r| r.rank);
        }
        Self {
            snapshot: Snapshot {
                recommendations,
                registry,
                models,
            },
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.snapshot.registry
    }

    /// Answer one request.
    pub fn handle(&self, request: &InferenceRequest) -> InferenceResponse {
        let customer_id = request.customer_id.trim();
        if customer_id.is_empty() {
            return InferenceResponse::error("", "customer_id must not be empty");
        }

        // Path A — precomputed results for a known customer.
        if let Some(recs) = self.snapshot.recommendations.get(customer_id) {
            return InferenceResponse {
                customer_id: customer_id.to_string(),
                source: "precomputed".to_string(),
                cluster_id: recs.first().map(|r| r.cluster_id.clone()),
                recommendations: recs.clone(),
                message: None,
                error: None,
            };
        }

        // Path B — cold start needs both a segment and a purchase vector.
        let (Some(segment), Some(vector)) =
            (request.segment.as_deref(), request.purchase_vector.as_ref())
        else {
            return InferenceResponse::error(
                customer_id,
                "customer has no precomputed recommendations; cold-start resolution \
                 requires both 'segment' and 'purchase_vector'",
            );
        };

        let Some(model) = self.snapshot.models.get(segment) else {
            return InferenceResponse::error(
                customer_id,
                format!(
                    "unknown segment '{}' — known segments: {:?}",
                    segment,
                    self.snapshot.models.keys().collect::<Vec<_>>(),
                ),
            );
        };

        let features = cold_start_features(&model.columns, vector);
        match model.assign(&features) {
            Ok(label) => InferenceResponse {
                customer_id: customer_id.to_string(),
                source: "realtime_assignment".to_string(),
                cluster_id: Some(format!("{}_{}", segment, label)),
                recommendations: Vec::new(),
                message: Some(
                    "no precomputed recommendations for this customer yet; the cluster \
                     assignment was computed in real time and recommendations will be \
                     published by the next pipeline cycle"
                        .to_string(),
                ),
                error: None,
            },
            Err(err) => InferenceResponse::error(customer_id, err.to_string()),
        }
    }

    /// Answer a batch of requests; output length always equals input length.
    pub fn handle_batch(&self, batch: &BatchRequest) -> BatchResponse {
        BatchResponse {
            predictions: batch.instances.iter().map(|r| self.handle(r)).collect(),
        }
    }
}

/// Map a raw purchase vector onto the model's feature columns.
///
/// Keys may be bare group values ("Valves") or full column names
/// ("l2_Valves"); missing columns default to 0. Because the models train on
/// proportions, each prefix group is renormalised to sum to 1.
fn cold_start_features(
    columns: &[String],
    vector: &BTreeMap<String, f64>,
) -> BTreeMap<String, f64> {
    let mut features: BTreeMap<String, f64> = BTreeMap::new();
    for column in columns {
        let bare = column.split_once('_').map(|(_, rest)| rest);
        let value = vector
            .get(column)
            .or_else(|| bare.and_then(|b| vector.get(b)))
            .copied()
            .unwrap_or(0.0);
        features.insert(column.clone(), value);
    }

    // Renormalise each proportion group (l2_*, brand_*, func_*)
    for prefix in ["l2_", "brand_", "func_"] {
        let sum: f64 = features
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(_, v)| *v)
            .sum();
        if sum > 0.0 {
            for (name, value) in features.iter_mut() {
                if name.starts_with(prefix) {
                    *value /= sum;
                }
            }
        }
    }
    features
}
