//! Stage 2 — per-segment customer clustering
//!
//! Groups customers within each (region × end_use) segment by purchase
//! behaviour. Features are proportions, not raw counts, so a customer buying
//! 1000 units of one category and 100 of another has the same profile shape
//! as one buying 100 and 10. k is selected per segment with the elbow
//! method; silhouette is logged as a separation diagnostic. Models persist
//! as JSON so cold-start inference can place unseen customers.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::errors::{RecoError, RecoResult};
use crate::models::{BasketRow, ClusterAssignment};
use crate::serialization::{read_json, write_json};
use crate::store::MODEL_REGISTRY_FILE;

const KMEANS_MAX_ITER: usize = 100;
/// Below this silhouette the segment's clusters barely separate.
const SILHOUETTE_WARN: f64 = 0.2;

/// Column-wise zero-mean unit-variance standardisation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
}

impl StandardScaler {
    /// Fit on a feature matrix. Zero-variance columns must already be
    /// dropped: dividing by a zero standard deviation produces NaN that
    /// silently corrupts assignments.
    pub fn fit(x: &Array2<f64>) -> Self {
        let n = x.nrows() as f64;
        let means: Vec<f64> = x
            .axis_iter(Axis(1))
            .map(|col| col.sum() / n)
            .collect();
        let stds: Vec<f64> = x
            .axis_iter(Axis(1))
            .enumerate()
            .map(|(j, col)| {
                let var = col.iter().map(|v| (v - means[j]).powi(2)).sum::<f64>() / n;
                var.sqrt()
            })
            .collect();
        Self { means, stds }
    }

    pub fn transform(&self, x: &Array2<f64>) -> Array2<f64> {
        let mut out = x.clone();
        for (j, mut col) in out.axis_iter_mut(Axis(1)).enumerate() {
            let std = if self.stds[j] > 0.0 { self.stds[j] } else { 1.0 };
            col.mapv_inplace(|v| (v - self.means[j]) / std);
        }
        out
    }

    /// Scale a single feature vector (cold-start path).
    pub fn transform_row(&self, row: &[f64]) -> RecoResult<Vec<f64>> {
        if row.len() != self.means.len() {
            return Err(RecoError::model(format!(
                "feature vector has {} values, scaler expects {}",
                row.len(),
                self.means.len(),
            )));
        }
        Ok(row
            .iter()
            .enumerate()
            .map(|(j, v)| {
                let std = if self.stds[j] > 0.0 { self.stds[j] } else { 1.0 };
                (v - self.means[j]) / std
            })
            .collect())
    }
}

/// A fitted k-means model: centroids in scaled feature space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KMeansModel {
    pub centroids: Vec<Vec<f64>>,
    pub inertia: f64,
}

impl KMeansModel {
    pub fn k(&self) -> usize {
        self.centroids.len()
    }

    /// Nearest-centroid assignment for one scaled feature vector.
    pub fn predict(&self, row: &[f64]) -> usize {
        nearest_centroid(row, &self.centroids).0
    }
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

fn nearest_centroid(row: &[f64], centroids: &[Vec<f64>]) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (ix, c) in centroids.iter().enumerate() {
        let d = squared_distance(row, c);
        if d < best.1 {
            best = (ix, d);
        }
    }
    best
}

/// k-means++ initialisation: spread the initial centroids by sampling each
/// next centroid proportionally to its squared distance from the chosen set.
fn kmeans_plus_plus_init(x: &Array2<f64>, k: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    let n = x.nrows();
    let mut centroids: Vec<Vec<f64>> = Vec::with_capacity(k);
    centroids.push(x.row(rng.gen_range(0..n)).to_vec());

    while centroids.len() < k {
        let d2: Vec<f64> = (0..n)
            .map(|i| nearest_centroid(&x.row(i).to_vec(), &centroids).1)
            .collect();
        let total: f64 = d2.iter().sum();
        let next = if total <= 0.0 {
            rng.gen_range(0..n)
        } else {
            let mut target = rng.gen::<f64>() * total;
            let mut chosen = n - 1;
            for (i, d) in d2.iter().enumerate() {
                target -= d;
                if target <= 0.0 {
                    chosen = i;
                    break;
                }
            }
            chosen
        };
        centroids.push(x.row(next).to_vec());
    }
    centroids
}

/// One Lloyd run from a k-means++ start. Returns (model, labels).
fn kmeans_single(x: &Array2<f64>, k: usize, rng: &mut StdRng) -> (KMeansModel, Vec<usize>) {
    let n = x.nrows();
    let dims = x.ncols();
    let mut centroids = kmeans_plus_plus_init(x, k, rng);
    let mut labels = vec![0usize; n];

    for _ in 0..KMEANS_MAX_ITER {
        let mut changed = false;
        for i in 0..n {
            let (label, _) = nearest_centroid(&x.row(i).to_vec(), &centroids);
            if labels[i] != label {
                labels[i] = label;
                changed = true;
            }
        }

        let mut sums = vec![vec![0.0; dims]; k];
        let mut counts = vec![0usize; k];
        for i in 0..n {
            counts[labels[i]] += 1;
            for (j, v) in x.row(i).iter().enumerate() {
                sums[labels[i]][j] += v;
            }
        }
        for c in 0..k {
            if counts[c] == 0 {
                // Re-seed an emptied cluster with the point farthest from
                // its current centroid; keeps k stable and deterministic.
                let farthest = (0..n)
                    .max_by(|&a, &b| {
                        let da = squared_distance(&x.row(a).to_vec(), &centroids[labels[a]]);
                        let db = squared_distance(&x.row(b).to_vec(), &centroids[labels[b]]);
                        da.total_cmp(&db)
                    })
                    .unwrap_or(0);
                centroids[c] = x.row(farthest).to_vec();
                labels[farthest] = c;
                changed = true;
            } else {
                for j in 0..dims {
                    centroids[c][j] = sums[c][j] / counts[c] as f64;
                }
            }
        }

        if !changed {
            break;
        }
    }

    let inertia = (0..n)
        .map(|i| squared_distance(&x.row(i).to_vec(), &centroids[labels[i]]))
        .sum();
    (KMeansModel { centroids, inertia }, labels)
}

/// Seeded k-means with `n_init` restarts; the lowest-inertia run wins.
pub fn kmeans_fit(
    x: &Array2<f64>,
    k: usize,
    random_state: u64,
    n_init: usize,
) -> (KMeansModel, Vec<usize>) {
    let mut best: Option<(KMeansModel, Vec<usize>)> = None;
    for attempt in 0..n_init.max(1) {
        let mut rng = StdRng::seed_from_u64(random_state.wrapping_add(attempt as u64));
        let (model, labels) = kmeans_single(x, k, &mut rng);
        let better = best
            .as_ref()
            .map(|(b, _)| model.inertia < b.inertia)
            .unwrap_or(true);
        if better {
            best = Some((model, labels));
        }
    }
    best.expect("at least one k-means attempt runs")
}

/// Mean silhouette coefficient over all samples; None when undefined
/// (single cluster or too few samples).
pub fn silhouette_score(x: &Array2<f64>, labels: &[usize], k: usize) -> Option<f64> {
    let n = x.nrows();
    if k < 2 || n <= k {
        return None;
    }

    let dist = |a: usize, b: usize| squared_distance(&x.row(a).to_vec(), &x.row(b).to_vec()).sqrt();

    let mut total = 0.0;
    for i in 0..n {
        let mut per_cluster: BTreeMap<usize, (f64, usize)> = BTreeMap::new();
        for j in 0..n {
            if i == j {
                continue;
            }
            let entry = per_cluster.entry(labels[j]).or_insert((0.0, 0));
            entry.0 += dist(i, j);
            entry.1 += 1;
        }

        let own = labels[i];
        let a = match per_cluster.get(&own) {
            Some((sum, count)) if *count > 0 => sum / *count as f64,
            // A singleton cluster contributes silhouette 0
            _ => {
                continue;
            }
        };
        let b = per_cluster
            .iter()
            .filter(|(c, _)| **c != own)
            .map(|(_, (sum, count))| *sum / *count as f64)
            .fold(f64::INFINITY, f64::min);
        if b.is_finite() {
            total += (b - a) / a.max(b);
        }
    }
    Some(total / n as f64)
}

/// Scan an inertia curve recorded for k = 2, 3, ... and return the first k
/// whose percentage drop from the previous k falls below the threshold.
fn find_elbow(inertias: &[f64], elbow_threshold: f64) -> Option<usize> {
    for i in 1..inertias.len() {
        if inertias[i - 1] <= 0.0 {
            break;
        }
        let pct_drop = (inertias[i - 1] - inertias[i]) / inertias[i - 1] * 100.0;
        if pct_drop < elbow_threshold {
            debug!(k = i + 2, pct_drop, "elbow found");
            return Some(i + 2);
        }
    }
    None
}

/// Elbow-method k selection: run k = 2..=min(max_k, n-1), pick the first k
/// where the percentage inertia drop falls below the threshold. No elbow
/// means the maximum attempted k.
pub fn elbow_k(
    x: &Array2<f64>,
    max_k: usize,
    elbow_threshold: f64,
    random_state: u64,
    n_init: usize,
) -> usize {
    let n = x.nrows();
    // The only floor here is "no more clusters than samples". Whether a
    // segment is big enough to cluster at all is min_cluster_customers'
    // decision, made by the caller.
    let effective_max_k = if n > 1 { max_k.min(n - 1) } else { 1 };
    if effective_max_k < 2 {
        return 1;
    }

    let inertias: Vec<f64> = (2..=effective_max_k)
        .map(|k| kmeans_fit(x, k, random_state, n_init).0.inertia)
        .collect();

    find_elbow(&inertias, elbow_threshold).unwrap_or_else(|| {
        debug!(k = effective_max_k, "no clear elbow — using maximum k");
        effective_max_k
    })
}

/// Everything persisted for one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentModel {
    pub segment: String,
    pub scaler: StandardScaler,
    pub kmeans: KMeansModel,
    /// Ordered feature columns the model was trained on
    pub columns: Vec<String>,
}

impl SegmentModel {
    /// Place one feature map into a cluster (cold-start path). Missing
    /// columns default to 0; unknown columns are ignored.
    pub fn assign(&self, features: &BTreeMap<String, f64>) -> RecoResult<usize> {
        let vector: Vec<f64> = self
            .columns
            .iter()
            .map(|c| features.get(c).copied().unwrap_or(0.0))
            .collect();
        let scaled = self.scaler.transform_row(&vector)?;
        Ok(self.kmeans.predict(&scaled))
    }
}

/// Manifest entry for one segment in `model_registry.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub segment: String,
    pub n_customers: usize,
    pub k: usize,
    pub inertia: f64,
    pub silhouette: Option<f64>,
    pub feature_cols: Vec<String>,
    pub feature_groups: Vec<String>,
    pub model_file: String,
    pub scaler_file: String,
    pub cols_file: String,
}

/// Manifest enumerating trained segments — consumed at inference startup.
pub type ModelRegistry = BTreeMap<String, RegistryEntry>;

/// Output of the clustering stage.
#[derive(Debug, Clone)]
pub struct ClusteringOutput {
    pub assignments: Vec<ClusterAssignment>,
    pub models: BTreeMap<String, SegmentModel>,
    pub registry: ModelRegistry,
}

/// A customer × column feature frame with deterministic ordering.
struct FeatureFrame {
    customer_ids: Vec<String>,
    columns: Vec<String>,
    matrix: Array2<f64>,
}

/// Build a customer × group proportion block. Each row sums to 1, making
/// the block scale-invariant across customers with very different volumes.
fn proportion_block(
    rows: &[&BasketRow],
    group: fn(&BasketRow) -> &str,
    prefix: &str,
) -> BTreeMap<String, BTreeMap<String, f64>> {
    let mut totals: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
    for row in rows {
        *totals
            .entry(row.customer_id.clone())
            .or_default()
            .entry(format!("{}_{}", prefix, group(row)))
            .or_insert(0.0) += row.total_quantity;
    }
    for cols in totals.values_mut() {
        let sum: f64 = cols.values().sum();
        let denom = if sum > 0.0 { sum } else { 1.0 };
        for v in cols.values_mut() {
            *v /= denom;
        }
    }
    totals
}

/// RFM columns: one value per customer, constant across that customer's rows.
fn rfm_block(rows: &[&BasketRow]) -> BTreeMap<String, BTreeMap<String, f64>> {
    let mut out: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
    for row in rows {
        out.entry(row.customer_id.clone()).or_insert_with(|| {
            BTreeMap::from([
                ("rfm_recency_score".to_string(), row.rfm_recency_score),
                ("rfm_frequency_score".to_string(), row.rfm_frequency_score),
                ("rfm_monetary_score".to_string(), row.rfm_monetary_score),
            ])
        });
    }
    out
}

/// Assemble the feature matrix for one segment: outer-join the selected
/// blocks on customer_id with 0-fill, then drop zero-variance columns.
fn build_feature_frame(rows: &[&BasketRow], feature_groups: &[&str]) -> Option<FeatureFrame> {
    let mut blocks: Vec<BTreeMap<String, BTreeMap<String, f64>>> = Vec::new();
    for group in feature_groups {
        match *group {
            "l2_qty" => blocks.push(proportion_block(rows, |r| &r.l2_category, "l2")),
            "brand" => blocks.push(proportion_block(rows, |r| &r.brand, "brand")),
            "functionality" => blocks.push(proportion_block(rows, |r| &r.functionality, "func")),
            "rfm" => blocks.push(rfm_block(rows)),
            other => warn!(group = other, "unknown feature group — skipped"),
        }
    }
    if blocks.is_empty() {
        return None;
    }

    let mut merged: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
    let mut columns: BTreeSet<String> = BTreeSet::new();
    for block in blocks {
        for (customer, cols) in block {
            for (name, value) in cols {
                columns.insert(name.clone());
                merged.entry(customer.clone()).or_default().insert(name, value);
            }
        }
    }

    let customer_ids: Vec<String> = merged.keys().cloned().collect();
    let mut columns: Vec<String> = columns.into_iter().collect();

    // Drop zero-variance columns before standardisation.
    columns.retain(|col| {
        let first = merged
            .values()
            .next()
            .and_then(|cols| cols.get(col).copied())
            .unwrap_or(0.0);
        merged
            .values()
            .any(|cols| (cols.get(col).copied().unwrap_or(0.0) - first).abs() > f64::EPSILON)
    });
    if columns.is_empty() {
        return None;
    }

    let mut matrix = Array2::zeros((customer_ids.len(), columns.len()));
    for (i, customer) in customer_ids.iter().enumerate() {
        let cols = &merged[customer];
        for (j, name) in columns.iter().enumerate() {
            matrix[[i, j]] = cols.get(name).copied().unwrap_or(0.0);
        }
    }

    Some(FeatureFrame {
        customer_ids,
        columns,
        matrix,
    })
}

/// Collapse a segment to a single `{segment}_0` cluster. Members still get
/// recommendations through the fallback path.
fn single_cluster(segment: &str, customers: &BTreeSet<&str>) -> Vec<ClusterAssignment> {
    customers
        .iter()
        .map(|c| ClusterAssignment::new(*c, segment, 0))
        .collect()
}

/// Train one k-means model per segment and assign every customer to exactly
/// one globally unique cluster.
pub fn train_clusters(
    basket: &[BasketRow],
    config: &PipelineConfig,
) -> RecoResult<ClusteringOutput> {
    let mut by_segment: BTreeMap<&str, Vec<&BasketRow>> = BTreeMap::new();
    for row in basket {
        by_segment.entry(row.segment.as_str()).or_default().push(row);
    }

    let feature_groups = config.feature_group_list();
    let mut assignments = Vec::new();
    let mut models = BTreeMap::new();
    let mut registry = ModelRegistry::new();

    for (segment, rows) in &by_segment {
        let customers: BTreeSet<&str> =
            rows.iter().map(|r| r.customer_id.as_str()).collect();
        let n = customers.len();

        let below_minimum = n < config.min_cluster_customers;
        if below_minimum {
            info!(
                segment,
                customers = n,
                min = config.min_cluster_customers,
                "segment below minimum size — single cluster"
            );
        }

        let Some(frame) = build_feature_frame(rows, &feature_groups) else {
            warn!(
                segment,
                "feature matrix is empty for this segment — single cluster"
            );
            assignments.extend(single_cluster(segment, &customers));
            // Still persist a trivial model: cold-start requests for this
            // segment must resolve to cluster 0, not an unknown-segment
            // error.
            register_segment(
                &mut registry,
                &mut models,
                SegmentModel {
                    segment: (*segment).to_string(),
                    scaler: StandardScaler {
                        means: Vec::new(),
                        stds: Vec::new(),
                    },
                    kmeans: KMeansModel {
                        centroids: vec![Vec::new()],
                        inertia: 0.0,
                    },
                    columns: Vec::new(),
                },
                n,
                None,
                &feature_groups,
            );
            continue;
        };

        let scaler = StandardScaler::fit(&frame.matrix);
        let scaled = scaler.transform(&frame.matrix);

        let k = if below_minimum {
            1
        } else {
            elbow_k(
                &scaled,
                config.max_k,
                config.elbow_threshold,
                config.random_state,
                config.n_init,
            )
        };
        let (kmeans, labels) = if k <= 1 {
            let centroid = scaled
                .mean_axis(Axis(0))
                .map(|m| m.to_vec())
                .unwrap_or_default();
            let inertia = (0..scaled.nrows())
                .map(|i| squared_distance(&scaled.row(i).to_vec(), &centroid))
                .sum();
            (
                KMeansModel {
                    centroids: vec![centroid],
                    inertia,
                },
                vec![0; frame.customer_ids.len()],
            )
        } else {
            kmeans_fit(&scaled, k, config.random_state, config.n_init)
        };

        let silhouette = silhouette_score(&scaled, &labels, k);
        info!(
            segment,
            customers = n,
            k,
            features = frame.columns.len(),
            inertia = kmeans.inertia,
            silhouette = ?silhouette,
            "segment clustered"
        );
        if let Some(s) = silhouette {
            if s < SILHOUETTE_WARN {
                warn!(
                    segment,
                    silhouette = s,
                    "poor cluster separation — consider fewer feature groups or a lower max_k"
                );
            }
        }

        for (customer, label) in frame.customer_ids.iter().zip(&labels) {
            assignments.push(ClusterAssignment::new(customer.clone(), *segment, *label));
        }

        register_segment(
            &mut registry,
            &mut models,
            SegmentModel {
                segment: (*segment).to_string(),
                scaler,
                kmeans,
                columns: frame.columns,
            },
            n,
            silhouette,
            &feature_groups,
        );
    }

    if assignments.is_empty() {
        return Err(RecoError::data_quality(
            "clustering produced no assignments — every segment was empty; \
             check the feature group configuration and the market basket",
        ));
    }

    // One cluster per customer, by construction; verify anyway since every
    // downstream join depends on it.
    let mut seen = BTreeSet::new();
    for a in &assignments {
        if !seen.insert(a.customer_id.as_str()) {
            return Err(RecoError::invariant(format!(
                "customer {} received more than one cluster assignment",
                a.customer_id,
            )));
        }
    }

    Ok(ClusteringOutput {
        assignments,
        models,
        registry,
    })
}

fn safe_segment_name(segment: &str) -> String {
    segment.replace(' ', "_").replace('/', "-")
}

/// Record a trained segment in both the manifest and the in-memory model
/// map, deriving artifact file names from the segment name.
fn register_segment(
    registry: &mut ModelRegistry,
    models: &mut BTreeMap<String, SegmentModel>,
    model: SegmentModel,
    n_customers: usize,
    silhouette: Option<f64>,
    feature_groups: &[&str],
) {
    let safe = safe_segment_name(&model.segment);
    registry.insert(
        model.segment.clone(),
        RegistryEntry {
            segment: model.segment.clone(),
            n_customers,
            k: model.kmeans.k(),
            inertia: model.kmeans.inertia,
            silhouette,
            feature_cols: model.columns.clone(),
            feature_groups: feature_groups.iter().map(|g| g.to_string()).collect(),
            model_file: format!("{safe}_model.json"),
            scaler_file: format!("{safe}_scaler.json"),
            cols_file: format!("{safe}_columns.json"),
        },
    );
    models.insert(model.segment.clone(), model);
}

/// Persist per-segment artifacts and the manifest into the model archive.
pub fn persist_models(output: &ClusteringOutput, model_dir: &Path) -> RecoResult<()> {
    for (segment, model) in &output.models {
        let entry = output.registry.get(segment).ok_or_else(|| {
            RecoError::model(format!("segment {segment} missing from registry"))
        })?;
        write_json(&model_dir.join(&entry.model_file), &model.kmeans)?;
        write_json(&model_dir.join(&entry.scaler_file), &model.scaler)?;
        write_json(&model_dir.join(&entry.cols_file), &model.columns)?;
    }
    write_json(&model_dir.join(MODEL_REGISTRY_FILE), &output.registry)?;
    info!(
        segments = output.models.len(),
        path = %model_dir.display(),
        "persisted model archive"
    );
    Ok(())
}

/// Load the manifest and every per-segment model from a model archive.
pub fn load_models(model_dir: &Path) -> RecoResult<(ModelRegistry, BTreeMap<String, SegmentModel>)> {
    let registry: ModelRegistry = read_json(&model_dir.join(MODEL_REGISTRY_FILE))?;
    let mut models = BTreeMap::new();
    for (segment, entry) in &registry {
        let kmeans: KMeansModel = read_json(&model_dir.join(&entry.model_file))?;
        let scaler: StandardScaler = read_json(&model_dir.join(&entry.scaler_file))?;
        let columns: Vec<String> = read_json(&model_dir.join(&entry.cols_file))?;
        models.insert(
            segment.clone(),
            SegmentModel {
                segment: segment.clone(),
                scaler,
                kmeans,
                columns,
            },
        );
    }
    Ok((registry, models))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    use crate::models::PriceBand;

    fn basket_row(cust: &str, segment: &str, l2: &str, qty: f64) -> BasketRow {
        BasketRow {
            customer_id: cust.to_string(),
            product_id: format!("P_{l2}"),
            region: "West".to_string(),
            end_use: "Plumbing".to_string(),
            segment: segment.to_string(),
            brand: "Acme".to_string(),
            l2_category: l2.to_string(),
            l3_category: format!("{l2}-L3"),
            functionality: "General".to_string(),
            in_stock: true,
            purchase_frequency: 1,
            total_quantity: qty,
            recency_days: 5,
            rfm_recency_score: 0.5,
            rfm_frequency_score: 0.5,
            rfm_monetary_score: 0.5,
            price_band: PriceBand::Mid,
        }
    }

    #[test]
    fn test_scaler_zero_mean_unit_variance() {
        let x = array![[1.0, 10.0], [3.0, 30.0], [5.0, 50.0]];
        let scaler = StandardScaler::fit(&x);
        let scaled = scaler.transform(&x);
        for j in 0..2 {
            let col: Vec<f64> = scaled.column(j).to_vec();
            let mean: f64 = col.iter().sum::<f64>() / col.len() as f64;
            let var: f64 = col.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / col.len() as f64;
            assert_relative_eq!(mean, 0.0, epsilon = 1e-12);
            assert_relative_eq!(var, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_kmeans_separates_obvious_clusters() {
        let x = array![
            [0.0, 0.0],
            [0.1, 0.0],
            [0.0, 0.1],
            [10.0, 10.0],
            [10.1, 10.0],
            [10.0, 10.1],
        ];
        let (model, labels) = kmeans_fit(&x, 2, 42, 5);
        assert_eq!(model.k(), 2);
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[0], labels[2]);
        assert_eq!(labels[3], labels[4]);
        assert_ne!(labels[0], labels[3]);
        assert!(model.inertia < 0.1);
    }

    #[test]
    fn test_kmeans_is_deterministic_for_fixed_seed() {
        let x = array![
            [0.0, 0.0],
            [1.0, 0.5],
            [0.5, 1.0],
            [8.0, 8.0],
            [9.0, 8.5],
            [8.5, 9.0],
            [4.0, 4.0],
            [4.5, 4.5],
        ];
        let (m1, l1) = kmeans_fit(&x, 3, 42, 10);
        let (m2, l2) = kmeans_fit(&x, 3, 42, 10);
        assert_eq!(l1, l2);
        assert_relative_eq!(m1.inertia, m2.inertia);
    }

    #[test]
    fn test_silhouette_high_for_separated_clusters() {
        let x = array![
            [0.0, 0.0],
            [0.1, 0.1],
            [10.0, 10.0],
            [10.1, 10.1],
        ];
        let s = silhouette_score(&x, &[0, 0, 1, 1], 2).unwrap();
        assert!(s > 0.9, "expected near-perfect separation, got {s}");
    }

    #[test]
    fn test_silhouette_undefined_for_single_cluster() {
        let x = array![[0.0], [1.0], [2.0]];
        assert!(silhouette_score(&x, &[0, 0, 0], 1).is_none());
    }

    #[test]
    fn test_find_elbow_on_inertia_curve() {
        // k=2 halves the inertia, k=4 is the first diminishing-returns point
        let inertias = [100.0, 50.0, 46.0, 45.0];
        assert_eq!(find_elbow(&inertias, 10.0), Some(4));
        // every step is a big drop — no elbow
        assert_eq!(find_elbow(&[100.0, 50.0, 25.0], 10.0), None);
        // a zero inertia ends the scan without an elbow
        assert_eq!(find_elbow(&[0.0, 0.0, 0.0], 10.0), None);
    }

    #[test]
    fn test_elbow_k_degenerate_sample_sizes() {
        // one usable cluster at most: a single sample or a pair
        let single = array![[0.0, 0.0]];
        assert_eq!(elbow_k(&single, 8, 10.0, 42, 3), 1);
        let pair = array![[0.0, 0.0], [1.0, 1.0]];
        assert_eq!(elbow_k(&pair, 8, 10.0, 42, 3), 1);
        // three samples cap the search at k = 2; a lone inertia has no elbow
        let trio = array![[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]];
        assert_eq!(elbow_k(&trio, 8, 10.0, 42, 3), 2);
    }

    #[test]
    fn test_small_segment_collapses_to_single_cluster() {
        // five identical customers: below the minimum AND zero-variance
        let rows: Vec<BasketRow> = (0..5)
            .map(|i| basket_row(&format!("C{i}"), "West_Plumbing", "Valves", 10.0))
            .collect();
        let config = PipelineConfig::default();
        let out = train_clusters(&rows, &config).unwrap();
        assert_eq!(out.assignments.len(), 5);
        assert!(out
            .assignments
            .iter()
            .all(|a| a.cluster_id == "West_Plumbing_0"));
        // a trivial model still persists so cold start can resolve the segment
        let model = &out.models["West_Plumbing"];
        assert_eq!(model.kmeans.k(), 1);
        assert!(model.columns.is_empty());
        assert_eq!(model.assign(&BTreeMap::new()).unwrap(), 0);
        assert_eq!(out.registry["West_Plumbing"].k, 1);
    }

    #[test]
    fn test_small_segment_with_variance_persists_mean_centroid_model() {
        let rows = vec![
            basket_row("C0", "West_Plumbing", "Valves", 90.0),
            basket_row("C0", "West_Plumbing", "Fittings", 10.0),
            basket_row("C1", "West_Plumbing", "Fittings", 80.0),
            basket_row("C2", "West_Plumbing", "Valves", 50.0),
            basket_row("C2", "West_Plumbing", "Fittings", 50.0),
        ];
        let out = train_clusters(&rows, &PipelineConfig::default()).unwrap();
        assert!(out
            .assignments
            .iter()
            .all(|a| a.cluster_id == "West_Plumbing_0"));

        let model = &out.models["West_Plumbing"];
        assert_eq!(model.kmeans.k(), 1);
        assert!(!model.columns.is_empty());
        assert_eq!(model.kmeans.centroids[0].len(), model.columns.len());
        // a cold-start newcomer resolves to the one cluster
        let features = BTreeMap::from([("l2_Valves".to_string(), 1.0)]);
        assert_eq!(model.assign(&features).unwrap(), 0);
        assert_eq!(out.registry["West_Plumbing"].n_customers, 3);
    }

    #[test]
    fn test_train_assigns_each_customer_once() {
        let mut rows = Vec::new();
        for i in 0..4 {
            rows.push(basket_row(&format!("V{i}"), "West_Plumbing", "Valves", 100.0));
            rows.push(basket_row(&format!("V{i}"), "West_Plumbing", "Fittings", 1.0));
        }
        for i in 0..4 {
            rows.push(basket_row(&format!("F{i}"), "West_Plumbing", "Fittings", 100.0));
            rows.push(basket_row(&format!("F{i}"), "West_Plumbing", "Valves", 1.0));
        }
        let config = PipelineConfig {
            max_k: 2,
            ..PipelineConfig::default()
        };
        let out = train_clusters(&rows, &config).unwrap();
        assert_eq!(out.assignments.len(), 8);
        let mut seen = BTreeSet::new();
        for a in &out.assignments {
            assert!(seen.insert(a.customer_id.clone()));
            assert!(a.cluster_id.starts_with("West_Plumbing_"));
        }
        assert!(out.registry.contains_key("West_Plumbing"));
    }

    #[test]
    fn test_persist_and_load_round_trip() {
        let mut rows = Vec::new();
        for i in 0..4 {
            rows.push(basket_row(&format!("V{i}"), "West_Plumbing", "Valves", 100.0));
            rows.push(basket_row(&format!("V{i}"), "West_Plumbing", "Fittings", 1.0));
        }
        for i in 0..4 {
            rows.push(basket_row(&format!("F{i}"), "West_Plumbing", "Fittings", 100.0));
        }
        let config = PipelineConfig {
            max_k: 2,
            ..PipelineConfig::default()
        };
        let out = train_clusters(&rows, &config).unwrap();
        let dir = tempfile::tempdir().unwrap();
        persist_models(&out, dir.path()).unwrap();

        let (registry, models) = load_models(dir.path()).unwrap();
        assert_eq!(registry, out.registry);
        assert_eq!(models["West_Plumbing"], out.models["West_Plumbing"]);
    }

    #[test]
    fn test_cold_start_assignment_uses_column_order() {
        let mut rows = Vec::new();
        for i in 0..4 {
            rows.push(basket_row(&format!("V{i}"), "West_Plumbing", "Valves", 100.0));
            rows.push(basket_row(&format!("V{i}"), "West_Plumbing", "Fittings", 1.0));
        }
        for i in 0..4 {
            rows.push(basket_row(&format!("F{i}"), "West_Plumbing", "Fittings", 100.0));
            rows.push(basket_row(&format!("F{i}"), "West_Plumbing", "Valves", 1.0));
        }
        let config = PipelineConfig {
            max_k: 2,
            ..PipelineConfig::default()
        };
        let out = train_clusters(&rows, &config).unwrap();
        let model = &out.models["West_Plumbing"];

        // a valve-heavy newcomer lands in the valve-heavy cluster
        let features = BTreeMap::from([("l2_Valves".to_string(), 0.99)]);
        let label = model.assign(&features).unwrap();
        let valve_cluster = out
            .assignments
            .iter()
            .find(|a| a.customer_id == "V0")
            .unwrap();
        assert_eq!(
            format!("West_Plumbing_{label}"),
            valve_cluster.cluster_id
        );
    }
}
