//! Stage 1 — market basket construction
//!
//! Transforms the three raw tables into one row per (customer, product) with
//! aggregated purchase behaviour, customer-level RFM scores and a segment
//! price band. Every "days ago" value is measured from the reference date —
//! the maximum invoice timestamp in the dataset, never wall-clock — so
//! reruns over the same data are reproducible.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{Duration, NaiveDate, NaiveDateTime};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::errors::{RecoError, RecoResult};
use crate::models::{BasketRow, Customer, InvoiceLine, PriceBand, Product, UNKNOWN};

/// Customer-level RFM aggregates before normalisation.
#[derive(Debug, Default, Clone)]
struct CustomerStats {
    last_purchase: Option<NaiveDateTime>,
    distinct_invoices: BTreeSet<String>,
    monetary: f64,
}

/// Per-(customer, product) aggregates.
#[derive(Debug, Default, Clone)]
struct PairStats {
    total_quantity: f64,
    purchase_dates: BTreeSet<NaiveDate>,
    last_purchase: Option<NaiveDateTime>,
}

/// The reference date for a set of invoices: the maximum timestamp.
pub fn reference_date(invoices: &[InvoiceLine]) -> RecoResult<NaiveDateTime> {
    invoices
        .iter()
        .map(|i| i.invoice_date)
        .max()
        .ok_or_else(|| RecoError::data_quality("cannot derive reference date from zero invoices"))
}

/// Build the market basket table.
///
/// `has_price_column` disables monetary features when the invoice reader
/// found no price column under the configured aliases.
pub fn build_market_basket(
    invoices: &[InvoiceLine],
    products: &[Product],
    customers: &[Customer],
    has_price_column: bool,
    config: &PipelineConfig,
) -> RecoResult<Vec<BasketRow>> {
    let reference = reference_date(invoices)?;
    let cutoff = reference - Duration::days(config.recency_cutoff_days);

    let recent: Vec<&InvoiceLine> = invoices
        .iter()
        .filter(|i| i.invoice_date >= cutoff)
        .collect();
    let dropped_old = invoices.len() - recent.len();
    if dropped_old > 0 {
        info!(
            dropped = dropped_old,
            cutoff_days = config.recency_cutoff_days,
            "dropped invoices older than the recency cutoff"
        );
    }
    if recent.is_empty() {
        return Err(RecoError::data_quality(format!(
            "all {} invoices fall outside the {}-day recency cutoff — \
             loosen RECO_RECENCY_CUTOFF_DAYS or refresh the invoice extract",
            invoices.len(),
            config.recency_cutoff_days,
        )));
    }

    let product_map: HashMap<&str, &Product> =
        products.iter().map(|p| (p.product_id.as_str(), p)).collect();
    let customer_map: HashMap<&str, &Customer> =
        customers.iter().map(|c| (c.customer_id.as_str(), c)).collect();

    // Left joins: unmatched rows are logged and kept with Unknown fills,
    // never silently dropped.
    let unmatched_products = recent
        .iter()
        .filter(|i| !product_map.contains_key(i.product_id.as_str()))
        .count();
    let unmatched_customers = recent
        .iter()
        .filter(|i| !customer_map.contains_key(i.customer_id.as_str()))
        .count();
    if unmatched_products > 0 {
        warn!(
            rows = unmatched_products,
            "invoice rows reference products missing from the catalog"
        );
    }
    if unmatched_customers > 0 {
        warn!(
            rows = unmatched_customers,
            "invoice rows reference customers missing from the customer table"
        );
    }

    // Customers below the minimum order count drop out entirely.
    let mut orders_per_customer: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for inv in &recent {
        orders_per_customer
            .entry(inv.customer_id.as_str())
            .or_default()
            .insert(inv.invoice_id.as_str());
    }
    let kept_customers: BTreeSet<&str> = orders_per_customer
        .iter()
        .filter(|(_, invoices)| invoices.len() >= config.min_order_count)
        .map(|(c, _)| *c)
        .collect();
    let dropped_customers = orders_per_customer.len() - kept_customers.len();
    if dropped_customers > 0 {
        info!(
            dropped = dropped_customers,
            min_order_count = config.min_order_count,
            "dropped customers below the minimum order count"
        );
    }

    // Aggregate the surviving lines.
    let mut pair_stats: BTreeMap<(String, String), PairStats> = BTreeMap::new();
    let mut customer_stats: BTreeMap<String, CustomerStats> = BTreeMap::new();
    // Mean unit price inputs per (segment, product) for the price band.
    let mut price_obs: BTreeMap<(String, String), (f64, u64)> = BTreeMap::new();

    for inv in &recent {
        if !kept_customers.contains(inv.customer_id.as_str()) {
            continue;
        }
        let segment = customer_map
            .get(inv.customer_id.as_str())
            .map(|c| c.segment())
            .unwrap_or_else(|| format!("{}_{}", UNKNOWN, UNKNOWN));

        let pair = pair_stats
            .entry((inv.customer_id.clone(), inv.product_id.clone()))
            .or_default();
        pair.total_quantity += inv.quantity as f64;
        pair.purchase_dates.insert(inv.invoice_date.date());
        pair.last_purchase = Some(match pair.last_purchase {
            Some(prev) => prev.max(inv.invoice_date),
            None => inv.invoice_date,
        });

        let cust = customer_stats.entry(inv.customer_id.clone()).or_default();
        cust.distinct_invoices.insert(inv.invoice_id.clone());
        cust.last_purchase = Some(match cust.last_purchase {
            Some(prev) => prev.max(inv.invoice_date),
            None => inv.invoice_date,
        });
        if has_price_column {
            let spend = inv
                .line_total
                .or_else(|| inv.unit_price.map(|p| p * inv.quantity as f64))
                .unwrap_or(0.0);
            cust.monetary += spend;
            if let Some(price) = inv.unit_price {
                let obs = price_obs
                    .entry((segment, inv.product_id.clone()))
                    .or_insert((0.0, 0));
                obs.0 += price;
                obs.1 += 1;
            }
        }
    }

    if pair_stats.is_empty() {
        return Err(RecoError::data_quality(format!(
            "market basket is empty after filtering ({} customers dropped by \
             min_order_count={}) — loosen the thresholds or check the joins",
            dropped_customers, config.min_order_count,
        )));
    }

    let rfm = compute_rfm_scores(&customer_stats, reference, has_price_column);
    let bands = compute_price_bands(&price_obs);

    let mut rows = Vec::with_capacity(pair_stats.len());
    for ((customer_id, product_id), stats) in &pair_stats {
        let customer = customer_map.get(customer_id.as_str());
        let product = product_map.get(product_id.as_str());

        let region = customer
            .map(|c| c.region.clone())
            .unwrap_or_else(|| UNKNOWN.to_string());
        let end_use = customer
            .map(|c| c.end_use.clone())
            .unwrap_or_else(|| UNKNOWN.to_string());
        let segment = format!("{}_{}", region, end_use);

        let fill = |v: Option<&String>| -> String {
            match v {
                Some(s) if !s.trim().is_empty() => s.clone(),
                _ => UNKNOWN.to_string(),
            }
        };

        let recency_days = stats
            .last_purchase
            .map(|d| (reference - d).num_days())
            .unwrap_or(0);

        let scores = rfm
            .get(customer_id.as_str())
            .copied()
            .unwrap_or((0.5, 0.5, 0.5));

        let price_band = if !has_price_column {
            PriceBand::Unknown
        } else {
            bands
                .get(&(segment.clone(), product_id.clone()))
                .copied()
                .unwrap_or(PriceBand::Unknown)
        };

        rows.push(BasketRow {
            customer_id: customer_id.clone(),
            product_id: product_id.clone(),
            region,
            end_use,
            segment,
            brand: fill(product.map(|p| &p.brand)),
            l2_category: fill(product.map(|p| &p.l2_category)),
            l3_category: fill(product.map(|p| &p.l3_category)),
            functionality: fill(product.map(|p| &p.functionality)),
            in_stock: product.map(|p| p.in_stock).unwrap_or(false),
            purchase_frequency: stats.purchase_dates.len() as u64,
            total_quantity: stats.total_quantity,
            recency_days,
            rfm_recency_score: scores.0,
            rfm_frequency_score: scores.1,
            rfm_monetary_score: scores.2,
            price_band,
        });
    }

    info!(
        rows = rows.len(),
        customers = customer_stats.len(),
        "market basket built"
    );
    Ok(rows)
}

/// Min-max normalise a customer-level dimension. A constant population gets
/// 0.5 everywhere — not 0, and never NaN.
fn minmax(values: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    let min = values.values().cloned().fold(f64::INFINITY, f64::min);
    let max = values.values().cloned().fold(f64::NEG_INFINITY, f64::max);
    let span = max - min;
    values
        .iter()
        .map(|(k, v)| {
            let score = if span <= f64::EPSILON {
                0.5
            } else {
                (v - min) / span
            };
            (k.clone(), score)
        })
        .collect()
}

/// Customer-level RFM scores, each normalised to [0,1]. Recency is inverted
/// so that higher means more recent. Without a price column the monetary
/// dimension is neutral (0.5) rather than fabricated from zeros.
fn compute_rfm_scores(
    stats: &BTreeMap<String, CustomerStats>,
    reference: NaiveDateTime,
    has_price_column: bool,
) -> BTreeMap<String, (f64, f64, f64)> {
    let recency: BTreeMap<String, f64> = stats
        .iter()
        .map(|(c, s)| {
            let days = s
                .last_purchase
                .map(|d| (reference - d).num_days() as f64)
                .unwrap_or(0.0);
            (c.clone(), days)
        })
        .collect();
    let frequency: BTreeMap<String, f64> = stats
        .iter()
        .map(|(c, s)| (c.clone(), s.distinct_invoices.len() as f64))
        .collect();
    let monetary: BTreeMap<String, f64> =
        stats.iter().map(|(c, s)| (c.clone(), s.monetary)).collect();

    let recency_norm = minmax(&recency);
    let frequency_norm = minmax(&frequency);
    let monetary_norm = minmax(&monetary);

    stats
        .keys()
        .map(|c| {
            let r = 1.0 - recency_norm[c];
            let f = frequency_norm[c];
            let m = if has_price_column { monetary_norm[c] } else { 0.5 };
            (c.clone(), (r, f, m))
        })
        .collect()
}

/// Linear-interpolation quantile over a sorted slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (pos - lo as f64) * (sorted[hi] - sorted[lo])
    }
}

/// Tertile price bands per (segment, product) from mean observed unit
/// prices. Segments with fewer than three distinct prices cannot support a
/// tertile split and fall back to Mid for every product.
fn compute_price_bands(
    price_obs: &BTreeMap<(String, String), (f64, u64)>,
) -> BTreeMap<(String, String), PriceBand> {
    let mut per_segment: BTreeMap<&str, Vec<(&str, f64)>> = BTreeMap::new();
    for ((segment, product), (sum, count)) in price_obs {
        per_segment
            .entry(segment.as_str())
            .or_default()
            .push((product.as_str(), sum / *count as f64));
    }

    let mut bands = BTreeMap::new();
    for (segment, products) in per_segment {
        let mut distinct: Vec<f64> = products.iter().map(|(_, p)| *p).collect();
        distinct.sort_by(|a, b| a.total_cmp(b));
        distinct.dedup_by(|a, b| (*a - *b).abs() <= f64::EPSILON);

        if distinct.len() < 3 {
            for (product, _) in products {
                bands.insert((segment.to_string(), product.to_string()), PriceBand::Mid);
            }
            continue;
        }

        let lower = quantile(&distinct, 1.0 / 3.0);
        let upper = quantile(&distinct, 2.0 / 3.0);
        for (product, price) in products {
            let band = if price <= lower {
                PriceBand::Low
            } else if price >= upper {
                PriceBand::High
            } else {
                PriceBand::Mid
            };
            bands.insert((segment.to_string(), product.to_string()), band);
        }
    }
    bands
}
