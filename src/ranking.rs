//! Stage 4 — composite scoring and ranking
//!
//! Turns the rule table into up to `top_k` ranked recommendations per
//! customer. Association candidates are scored on confidence, decayed
//! support, normalised lift and customer recency, with an L3 affinity bonus
//! breaking near-ties. Customers the rules cannot cover are topped up
//! through a category-aware segment fallback so nobody leaves empty-handed.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::errors::{RecoError, RecoResult};
use crate::models::{
    AssociationRule, BasketRow, ClusterAssignment, Recommendation, FALLBACK_TRIGGER,
};

/// Product attributes needed by the ranker, harvested from the basket.
#[derive(Debug, Clone)]
struct ProductAttrs {
    l2_category: String,
    l3_category: String,
    in_stock: bool,
}

/// Per-customer view assembled once and reused across rules.
struct CustomerView<'a> {
    cluster_id: &'a str,
    segment: &'a str,
    bought: BTreeSet<&'a str>,
    recency_score: f64,
    /// L3 category → purchase-frequency share
    l3_shares: BTreeMap<&'a str, f64>,
    /// The customer's top L3 categories eligible for the tiebreak bonus
    top_l3: BTreeSet<&'a str>,
    /// L2 category → purchase-frequency share (fallback affinity)
    l2_shares: BTreeMap<&'a str, f64>,
}

fn frequency_shares<'a>(
    rows: &[&'a BasketRow],
    key: fn(&'a BasketRow) -> &'a str,
) -> BTreeMap<&'a str, f64> {
    let mut totals: BTreeMap<&str, f64> = BTreeMap::new();
    let mut grand_total = 0.0;
    for row in rows {
        let freq = row.purchase_frequency as f64;
        *totals.entry(key(row)).or_insert(0.0) += freq;
        grand_total += freq;
    }
    if grand_total > 0.0 {
        for v in totals.values_mut() {
            *v /= grand_total;
        }
    }
    totals
}

fn build_customer_view<'a>(
    rows: &[&'a BasketRow],
    assignment: &'a ClusterAssignment,
    l3_top_n: usize,
) -> CustomerView<'a> {
    let bought: BTreeSet<&str> = rows.iter().map(|r| r.product_id.as_str()).collect();

    let mean_recency = if rows.is_empty() {
        0.0
    } else {
        rows.iter().map(|r| r.recency_days as f64).sum::<f64>() / rows.len() as f64
    };
    let recency_score = 1.0 / (1.0 + mean_recency);

    let l3_shares = frequency_shares(rows, |r| &r.l3_category);
    let mut ranked: Vec<(&str, f64)> = l3_shares.iter().map(|(k, v)| (*k, *v)).collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(b.0)));
    let top_l3: BTreeSet<&str> = ranked.iter().take(l3_top_n).map(|(k, _)| *k).collect();

    CustomerView {
        cluster_id: &assignment.cluster_id,
        segment: &assignment.segment,
        bought,
        recency_score,
        l3_shares,
        top_l3,
        l2_shares: frequency_shares(rows, |r| &r.l2_category),
    }
}

/// Generate, score, deduplicate and rank recommendations.
pub fn rank_recommendations(
    basket: &[BasketRow],
    assignments: &[ClusterAssignment],
    rules: &[AssociationRule],
    config: &PipelineConfig,
) -> RecoResult<Vec<Recommendation>> {
    // Refuse a rule table that violates its own arithmetic: a fabricated or
    // corrupted input must fail loudly, not produce plausible scores.
    for rule in rules {
        rule.check_invariants(None)?;
    }

    let (w_conf, w_supp, w_lift, w_recency) = config.scoring_weights();
    if config.max_lift_normalise <= 1.0 {
        return Err(RecoError::configuration(format!(
            "max_lift_normalise must exceed 1.0 (got {}) — the lift contribution \
             divides by max_lift_normalise - 1",
            config.max_lift_normalise,
        )));
    }

    let assignment_of: BTreeMap<&str, &ClusterAssignment> = assignments
        .iter()
        .map(|a| (a.customer_id.as_str(), a))
        .collect();

    let mut rows_by_customer: BTreeMap<&str, Vec<&BasketRow>> = BTreeMap::new();
    for row in basket {
        rows_by_customer
            .entry(row.customer_id.as_str())
            .or_default()
            .push(row);
    }

    let unassigned = rows_by_customer
        .keys()
        .filter(|c| !assignment_of.contains_key(*c))
        .count();
    if unassigned > 0 {
        warn!(
            customers = unassigned,
            "basket customers have no cluster assignment — they receive no recommendations"
        );
    }

    // First basket occurrence wins for product attributes; deterministic
    // because the basket is already sorted by (customer, product).
    let mut product_attrs: BTreeMap<&str, ProductAttrs> = BTreeMap::new();
    for row in basket {
        product_attrs
            .entry(row.product_id.as_str())
            .or_insert_with(|| ProductAttrs {
                l2_category: row.l2_category.clone(),
                l3_category: row.l3_category.clone(),
                in_stock: row.in_stock,
            });
    }

    let mut rules_by_cluster: BTreeMap<(&str, &str), Vec<&AssociationRule>> = BTreeMap::new();
    for rule in rules {
        rules_by_cluster
            .entry((rule.segment.as_str(), rule.cluster_id.as_str()))
            .or_default()
            .push(rule);
    }

    // Segment-level pools for the fallback: products bought in the segment
    // and their popularity (total purchase frequency).
    let mut segment_popularity: BTreeMap<(&str, &str), f64> = BTreeMap::new();
    for row in basket {
        *segment_popularity
            .entry((row.segment.as_str(), row.product_id.as_str()))
            .or_insert(0.0) += row.purchase_frequency as f64;
    }

    let mut output = Vec::new();

    for (customer_id, rows) in &rows_by_customer {
        let Some(assignment) = assignment_of.get(customer_id) else {
            continue;
        };
        let view = build_customer_view(rows, assignment, config.l3_top_n);

        let cluster_rules = rules_by_cluster
            .get(&(view.segment, view.cluster_id))
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        let mut candidates: Vec<Recommendation> = Vec::new();

        for rule in cluster_rules {
            if view.bought.contains(rule.product_b.as_str()) {
                continue;
            }
            // An association is vacuous if the trigger was never bought
            if !view.bought.contains(rule.product_a.as_str()) {
                continue;
            }
            let Some(attrs) = product_attrs.get(rule.product_b.as_str()) else {
                continue;
            };
            if !attrs.in_stock {
                continue;
            }
            if rule.support < config.min_support
                || rule.confidence < config.min_confidence
                || rule.lift < config.min_lift
            {
                continue;
            }

            let lift_contribution =
                ((rule.lift - 1.0) / (config.max_lift_normalise - 1.0)).clamp(0.0, 1.0);
            let mut score = w_conf * rule.confidence
                + w_supp * rule.weighted_support
                + w_lift * lift_contribution
                + w_recency * view.recency_score;

            if view.top_l3.contains(attrs.l3_category.as_str()) {
                let share = view
                    .l3_shares
                    .get(attrs.l3_category.as_str())
                    .copied()
                    .unwrap_or(0.0);
                score += share * config.l3_tiebreak_margin;
            }

            let qty = estimate_quantity(rows, &rule.product_a);

            candidates.push(Recommendation {
                customer_id: (*customer_id).to_string(),
                recommended_product: rule.product_b.clone(),
                cluster_id: view.cluster_id.to_string(),
                segment: view.segment.to_string(),
                l2_category: attrs.l2_category.clone(),
                l3_category: attrs.l3_category.clone(),
                trigger_product: rule.product_a.clone(),
                support: rule.support,
                confidence: rule.confidence,
                lift: rule.lift,
                score,
                recommended_qty: qty,
                reason: format!(
                    "{} -> {} (support={:.2}, confidence={:.2}, lift={:.2})",
                    rule.product_a, rule.product_b, rule.support, rule.confidence, rule.lift,
                ),
                rank: 0,
            });
        }

        // Dedup by recommended product, best score first; stable sort keeps
        // first-encountered order on exact ties.
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut kept: Vec<Recommendation> = Vec::new();
        for c in candidates {
            if seen.insert(c.recommended_product.clone()) {
                kept.push(c);
            }
        }

        if kept.len() < config.top_k {
            apply_fallback(
                &mut kept,
                &view,
                customer_id,
                &product_attrs,
                &segment_popularity,
                config.top_k,
            );
        }

        // Final ordering covers fallback rows too: a strong category
        // affinity can outrank a weak association. Stable, so equal scores
        // keep their selection order.
        kept.sort_by(|a, b| b.score.total_cmp(&a.score));
        kept.truncate(config.top_k);
        for (ix, mut rec) in kept.into_iter().enumerate() {
            rec.rank = ix as u32 + 1;
            output.push(rec);
        }
    }

    let via_fallback = output.iter().filter(|r| r.is_fallback()).count();
    info!(
        recommendations = output.len(),
        customers = output
            .iter()
            .map(|r| r.customer_id.as_str())
            .collect::<BTreeSet<_>>()
            .len(),
        via_fallback,
        "ranking complete"
    );
    Ok(output)
}

/// Median per-order quantity for the trigger product, floored at 1.
fn estimate_quantity(rows: &[&BasketRow], trigger: &str) -> u32 {
    let mut per_order: Vec<f64> = rows
        .iter()
        .filter(|r| r.product_id == trigger)
        .map(|r| r.per_order_quantity())
        .collect();
    if per_order.is_empty() {
        return 1;
    }
    per_order.sort_by(|a, b| a.total_cmp(b));
    let mid = per_order.len() / 2;
    let median = if per_order.len() % 2 == 1 {
        per_order[mid]
    } else {
        (per_order[mid - 1] + per_order[mid]) / 2.0
    };
    (median.round() as u32).max(1)
}

/// Top the customer up to `top_k` with in-stock products popular in their
/// segment, preferring L2 categories the customer already buys.
fn apply_fallback(
    kept: &mut Vec<Recommendation>,
    view: &CustomerView<'_>,
    customer_id: &str,
    product_attrs: &BTreeMap<&str, ProductAttrs>,
    segment_popularity: &BTreeMap<(&str, &str), f64>,
    top_k: usize,
) {
    let already: BTreeSet<&str> = kept
        .iter()
        .map(|r| r.recommended_product.as_str())
        .collect();

    let mut pool: Vec<(&str, f64, f64)> = Vec::new();
    for ((segment, product), popularity) in segment_popularity {
        if *segment != view.segment {
            continue;
        }
        if view.bought.contains(product) || already.contains(product) {
            continue;
        }
        let Some(attrs) = product_attrs.get(product) else {
            continue;
        };
        if !attrs.in_stock {
            continue;
        }
        let affinity = view
            .l2_shares
            .get(attrs.l2_category.as_str())
            .copied()
            .unwrap_or(0.0);
        pool.push((*product, affinity, *popularity));
    }

    pool.sort_by(|a, b| {
        b.1.total_cmp(&a.1)
            .then(b.2.total_cmp(&a.2))
            .then(a.0.cmp(b.0))
    });

    for (product, affinity, _) in pool {
        if kept.len() >= top_k {
            break;
        }
        let attrs = &product_attrs[product];
        let reason = if affinity > 0.0 {
            format!(
                "Popular in {}; complements your {} purchases",
                view.segment, attrs.l2_category,
            )
        } else {
            format!("Popular with similar customers in {}", view.segment)
        };
        kept.push(Recommendation {
            customer_id: customer_id.to_string(),
            recommended_product: product.to_string(),
            cluster_id: view.cluster_id.to_string(),
            segment: view.segment.to_string(),
            l2_category: attrs.l2_category.clone(),
            l3_category: attrs.l3_category.clone(),
            trigger_product: FALLBACK_TRIGGER.to_string(),
            support: 0.0,
            confidence: 0.0,
            lift: 0.0,
            score: 0.1 + affinity,
            recommended_qty: 1,
            reason,
            rank: 0,
        });
    }
}
