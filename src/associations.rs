//! Stage 3 — association rule mining
//!
//! Discovers directed product co-occurrence rules within each (segment,
//! cluster). The critical subroutine is basket sessionization: a customer's
//! invoices are split into purchase sessions wherever the gap between
//! consecutive invoices exceeds the window, and every session gets a
//! globally unique basket id. Raw per-customer session indices repeat across
//! customers and would collapse distinct-basket counts, producing
//! confidence > 1.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDateTime;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::errors::RecoResult;
use crate::market_basket::reference_date;
use crate::models::{AssociationRule, ClusterAssignment, InvoiceLine};

const SECONDS_PER_DAY: f64 = 86_400.0;
/// Clamp bounds for the data-derived session window.
const WINDOW_MIN_DAYS: f64 = 7.0;
const WINDOW_MAX_DAYS: f64 = 90.0;

/// One purchase session: a window-bounded run of a customer's invoices.
#[derive(Debug, Clone)]
pub struct BasketSession {
    pub basket_id: String,
    pub customer_id: String,
    pub products: BTreeSet<String>,
    /// Most recent invoice timestamp in the session
    pub last_date: NaiveDateTime,
}

fn gap_days(prev: NaiveDateTime, next: NaiveDateTime) -> f64 {
    (next - prev).num_seconds() as f64 / SECONDS_PER_DAY
}

fn median(sorted: &[f64]) -> Option<f64> {
    match sorted.len() {
        0 => None,
        n if n % 2 == 1 => Some(sorted[n / 2]),
        n => Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0),
    }
}

/// Derive the session window from the data: the dataset-wide median of the
/// per-customer median inter-invoice gaps, clamped to [7, 90] days.
pub fn derive_window_days(invoices: &[InvoiceLine]) -> f64 {
    let mut dates_by_customer: BTreeMap<&str, BTreeSet<NaiveDateTime>> = BTreeMap::new();
    for inv in invoices {
        dates_by_customer
            .entry(inv.customer_id.as_str())
            .or_default()
            .insert(inv.invoice_date);
    }

    let mut customer_medians = Vec::new();
    for dates in dates_by_customer.values() {
        if dates.len() < 2 {
            continue;
        }
        let ordered: Vec<NaiveDateTime> = dates.iter().copied().collect();
        let mut gaps: Vec<f64> = ordered.windows(2).map(|w| gap_days(w[0], w[1])).collect();
        gaps.sort_by(|a, b| a.total_cmp(b));
        if let Some(m) = median(&gaps) {
            customer_medians.push(m);
        }
    }
    customer_medians.sort_by(|a, b| a.total_cmp(b));

    let window = median(&customer_medians)
        .unwrap_or(WINDOW_MIN_DAYS)
        .clamp(WINDOW_MIN_DAYS, WINDOW_MAX_DAYS);
    info!(window_days = window, "derived basket window from data");
    window
}

/// Split each customer's invoices into basket sessions.
///
/// Invoices are stably sorted by (customer, timestamp); a new session starts
/// on the first invoice and wherever the gap strictly exceeds the window (a
/// gap equal to the window stays in the same session).
pub fn sessionize(invoices: &[InvoiceLine], window_days: f64) -> Vec<BasketSession> {
    let mut by_customer: BTreeMap<&str, Vec<&InvoiceLine>> = BTreeMap::new();
    for inv in invoices {
        by_customer.entry(inv.customer_id.as_str()).or_default().push(inv);
    }

    let mut sessions = Vec::new();
    for (customer, mut lines) in by_customer {
        lines.sort_by_key(|l| l.invoice_date);

        let mut session_index = 0usize;
        let mut current: Option<BasketSession> = None;
        let mut prev_date: Option<NaiveDateTime> = None;

        for line in lines {
            let new_session = match prev_date {
                None => true,
                Some(prev) => gap_days(prev, line.invoice_date) > window_days,
            };
            if new_session {
                if let Some(done) = current.take() {
                    sessions.push(done);
                    session_index += 1;
                }
                current = Some(BasketSession {
                    // Globally unique by construction: per-customer indices
                    // repeat across customers
                    basket_id: format!("{}_{}", customer, session_index),
                    customer_id: customer.to_string(),
                    products: BTreeSet::new(),
                    last_date: line.invoice_date,
                });
            }
            let session = current.as_mut().expect("session exists after start");
            session.products.insert(line.product_id.clone());
            session.last_date = session.last_date.max(line.invoice_date);
            prev_date = Some(line.invoice_date);
        }
        if let Some(done) = current.take() {
            sessions.push(done);
        }
    }
    sessions
}

/// Per-(segment, cluster) accumulators.
#[derive(Debug, Default)]
struct ClusterCounts {
    total_baskets: u64,
    /// product → distinct baskets containing it
    product_baskets: BTreeMap<String, u64>,
    /// (A, B) → (distinct baskets containing both, decay-weighted count)
    pairs: BTreeMap<(String, String), (u64, f64)>,
}

/// Mine association rules from invoices and cluster assignments.
pub fn mine_associations(
    invoices: &[InvoiceLine],
    assignments: &[ClusterAssignment],
    config: &PipelineConfig,
) -> RecoResult<Vec<AssociationRule>> {
    let reference = reference_date(invoices)?;

    let window = if config.window_days > 0 {
        config.window_days as f64
    } else {
        derive_window_days(invoices)
    };

    let cluster_of: HashMap<&str, &ClusterAssignment> = assignments
        .iter()
        .map(|a| (a.customer_id.as_str(), a))
        .collect();

    let unmatched = invoices
        .iter()
        .filter(|i| !cluster_of.contains_key(i.customer_id.as_str()))
        .count();
    if unmatched > 0 {
        warn!(
            rows = unmatched,
            "invoice rows have no cluster assignment — excluded from association mining"
        );
    }

    let sessions = sessionize(invoices, window);

    let mut by_cluster: BTreeMap<(String, String), ClusterCounts> = BTreeMap::new();
    for session in &sessions {
        let Some(assignment) = cluster_of.get(session.customer_id.as_str()) else {
            continue;
        };
        let key = (assignment.segment.clone(), assignment.cluster_id.clone());
        let counts = by_cluster.entry(key).or_default();
        counts.total_baskets += 1;

        for product in &session.products {
            *counts.product_baskets.entry(product.clone()).or_insert(0) += 1;
        }

        if session.products.len() < 2 {
            continue;
        }
        // Both directions: the rule is directional
        let age_days = gap_days(session.last_date, reference).max(0.0);
        let weight = (-config.decay_lambda * age_days).exp();
        for a in &session.products {
            for b in &session.products {
                if a == b {
                    continue;
                }
                let entry = counts
                    .pairs
                    .entry((a.clone(), b.clone()))
                    .or_insert((0, 0.0));
                entry.0 += 1;
                entry.1 += weight;
            }
        }
    }

    let mut rules = Vec::new();
    let mut below_floor = 0usize;
    let mut below_lift = 0usize;

    for ((segment, cluster_id), counts) in &by_cluster {
        let total = counts.total_baskets;
        if total == 0 {
            continue;
        }
        let floor = (config.min_abs_freq as f64)
            .max((config.min_freq_ratio * total as f64).ceil()) as u64;

        for ((product_a, product_b), (pair_freq, weighted_pair_freq)) in &counts.pairs {
            let product_freq = counts.product_baskets.get(product_a).copied().unwrap_or(0);
            let freq_b = counts.product_baskets.get(product_b).copied().unwrap_or(0);

            let confidence = *pair_freq as f64 / product_freq as f64;
            let support = *pair_freq as f64 / total as f64;
            let weighted_support = weighted_pair_freq / total as f64;
            let p_b = freq_b as f64 / total as f64;
            let lift = if p_b > 0.0 { confidence / p_b } else { 0.0 };

            let rule = AssociationRule {
                segment: segment.clone(),
                cluster_id: cluster_id.clone(),
                product_a: product_a.clone(),
                product_b: product_b.clone(),
                pair_freq: *pair_freq,
                weighted_pair_freq: *weighted_pair_freq,
                product_freq,
                confidence,
                support,
                weighted_support,
                lift,
            };
            // A violation here is a sessionization bug, not a data problem
            rule.check_invariants(Some(total))?;

            if product_freq < floor {
                below_floor += 1;
                continue;
            }
            if lift < config.min_lift {
                below_lift += 1;
                continue;
            }
            rules.push(rule);
        }
    }

    if rules.is_empty() {
        warn!(
            below_floor,
            below_lift,
            "no association rules survived filtering — ranking will rely on the fallback path"
        );
    } else {
        info!(
            rules = rules.len(),
            below_floor, below_lift, "association rules mined"
        );
    }
    Ok(rules)
}
