//! Stage 5 — feedback-driven score calibration
//!
//! Re-weights recommendation scores using account-manager feedback from
//! prior cycles, drops what falls under the cutoff, re-ranks, and publishes
//! a structured feedback summary so thresholds can auto-tune over time.
//! Missing or empty feedback is never an error: recommendations pass
//! through unchanged and the summary records that nothing was learned.

use std::collections::BTreeMap;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::errors::RecoResult;
use crate::models::feedback::{NEGATIVE_REASONS, POSITIVE_REASONS};
use crate::models::{FeedbackRow, Recommendation};

/// Resolve one feedback row to a score multiplier.
///
/// High and Low ratings are unambiguous. Medium resolves through explicit
/// sentiment first, then the known reason-code sets, defaulting to the
/// positive weight. Unrecognised ratings are neutral (1.0).
pub fn resolve_weight(row: &FeedbackRow, config: &PipelineConfig) -> f64 {
    match row.rating.trim().to_ascii_lowercase().as_str() {
        "high" => config.weight_high,
        "low" => config.weight_low,
        "medium" => {
            if let Some(sentiment) = row.sentiment.as_deref() {
                match sentiment.trim().to_ascii_lowercase().as_str() {
                    "positive" => return config.weight_med_pos,
                    "negative" => return config.weight_med_neg,
                    _ => {}
                }
            }
            if let Some(reason) = row.reason_code.as_deref() {
                let reason = reason.trim().to_ascii_lowercase();
                if NEGATIVE_REASONS.contains(&reason.as_str()) {
                    return config.weight_med_neg;
                }
                if POSITIVE_REASONS.contains(&reason.as_str()) {
                    return config.weight_med_pos;
                }
            }
            config.weight_med_pos
        }
        _ => 1.0,
    }
}

/// Current and suggested value for one tunable threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSuggestion {
    pub current: f64,
    pub suggested: f64,
}

/// Auto-tuning advice published with the summary. Suggestions are recorded,
/// never applied automatically; the next cycle decides whether to read them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSuggestions {
    /// "tighten", "loosen" or "hold"
    pub action: String,
    pub min_confidence: ThresholdSuggestion,
    pub score_cutoff: ThresholdSuggestion,
}

/// Aggregate acceptance statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverallStats {
    pub feedback_rows: usize,
    /// Fraction of feedback rows whose weight is at least the positive
    /// Medium weight; None with no feedback
    pub acceptance_rate: Option<f64>,
}

/// Structured feedback summary published alongside the final table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackSummary {
    pub overall: OverallStats,
    pub per_segment: BTreeMap<String, f64>,
    pub per_l2: BTreeMap<String, f64>,
    pub reason_codes: BTreeMap<String, u64>,
    pub threshold_suggestions: ThresholdSuggestions,
}

fn suggestions(acceptance: Option<f64>, config: &PipelineConfig) -> ThresholdSuggestions {
    let (action, factor) = match acceptance {
        Some(rate) if rate < 0.5 => ("tighten", 1.0 + (0.5 - rate)),
        Some(rate) if rate > 0.8 => ("loosen", 1.0 - (rate - 0.8)),
        _ => ("hold", 1.0),
    };
    ThresholdSuggestions {
        action: action.to_string(),
        min_confidence: ThresholdSuggestion {
            current: config.min_confidence,
            suggested: config.min_confidence * factor,
        },
        score_cutoff: ThresholdSuggestion {
            current: config.score_cutoff,
            suggested: config.score_cutoff * factor,
        },
    }
}

/// Calibrate recommendations against feedback and build the summary.
///
/// Returns the final recommendation table (re-scored, re-ranked and capped)
/// together with the feedback summary to publish.
pub fn calibrate(
    recommendations: &[Recommendation],
    feedback: Option<&[FeedbackRow]>,
    config: &PipelineConfig,
) -> RecoResult<(Vec<Recommendation>, FeedbackSummary)> {
    let feedback = feedback.unwrap_or(&[]);
    if feedback.is_empty() {
        info!("no feedback available — passing recommendations through unchanged");
        let summary = FeedbackSummary {
            overall: OverallStats {
                feedback_rows: 0,
                acceptance_rate: None,
            },
            per_segment: BTreeMap::new(),
            per_l2: BTreeMap::new(),
            reason_codes: BTreeMap::new(),
            threshold_suggestions: suggestions(None, config),
        };
        return Ok((recommendations.to_vec(), summary));
    }

    // Recency filter against the newest feedback date — never wall-clock.
    let newest = feedback.iter().filter_map(|f| f.feedback_date).max();
    let recent: Vec<&FeedbackRow> = match newest {
        Some(newest) => {
            let cutoff = newest - Duration::days(config.feedback_recency_days);
            feedback
                .iter()
                // undated feedback cannot be aged out
                .filter(|f| f.feedback_date.map(|d| d >= cutoff).unwrap_or(true))
                .collect()
        }
        None => feedback.iter().collect(),
    };
    let stale = feedback.len() - recent.len();
    if stale > 0 {
        info!(
            dropped = stale,
            recency_days = config.feedback_recency_days,
            "dropped stale feedback rows"
        );
    }

    // One row per (customer, product): the most recent feedback_date wins;
    // undated rows lose to dated ones.
    let mut deduped: BTreeMap<(String, String), &FeedbackRow> = BTreeMap::new();
    for &row in &recent {
        let key = (row.customer_id.clone(), row.product_id.clone());
        match deduped.get(&key) {
            Some(existing) if row.feedback_date <= existing.feedback_date => {}
            _ => {
                deduped.insert(key, row);
            }
        }
    }

    let weights: BTreeMap<&(String, String), f64> = deduped
        .iter()
        .map(|(key, row)| (key, resolve_weight(row, config)))
        .collect();

    // Calibrate: multiply, cut, re-rank.
    let mut calibrated: Vec<Recommendation> = Vec::new();
    let mut matched = 0usize;
    let mut removed = 0usize;
    for rec in recommendations {
        let key = (rec.customer_id.clone(), rec.recommended_product.clone());
        let weight = weights.get(&key).copied().unwrap_or(1.0);
        if weights.contains_key(&key) {
            matched += 1;
        }
        let mut rec = rec.clone();
        rec.score *= weight;
        if rec.score < config.score_cutoff {
            removed += 1;
            continue;
        }
        calibrated.push(rec);
    }

    let mut by_customer: BTreeMap<String, Vec<Recommendation>> = BTreeMap::new();
    for rec in calibrated {
        by_customer.entry(rec.customer_id.clone()).or_default().push(rec);
    }
    let mut finals = Vec::new();
    for (_, mut recs) in by_customer {
        recs.sort_by(|a, b| b.score.total_cmp(&a.score));
        recs.truncate(config.top_k);
        for (ix, mut rec) in recs.into_iter().enumerate() {
            rec.rank = ix as u32 + 1;
            finals.push(rec);
        }
    }

    info!(
        feedback_rows = deduped.len(),
        matched_recommendations = matched,
        removed_below_cutoff = removed,
        "feedback calibration applied"
    );
    if matched == 0 {
        warn!("no feedback row matched a current recommendation — only the summary is informative");
    }

    let summary = build_summary(&deduped, &weights, recommendations, config);
    Ok((finals, summary))
}

/// Acceptance rates overall, per segment and per L2, plus the reason-code
/// distribution. Segment and L2 come from the recommendation the feedback
/// matched; unmatched feedback lands in "Unknown".
fn build_summary(
    deduped: &BTreeMap<(String, String), &FeedbackRow>,
    weights: &BTreeMap<&(String, String), f64>,
    recommendations: &[Recommendation],
    config: &PipelineConfig,
) -> FeedbackSummary {
    let rec_lookup: BTreeMap<(&str, &str), &Recommendation> = recommendations
        .iter()
        .map(|r| ((r.customer_id.as_str(), r.recommended_product.as_str()), r))
        .collect();

    let mut accepted = 0usize;
    let mut segment_counts: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    let mut l2_counts: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    let mut reason_codes: BTreeMap<String, u64> = BTreeMap::new();

    for (key, row) in deduped {
        let weight = weights[key];
        let is_accepted = weight >= config.weight_med_pos;
        if is_accepted {
            accepted += 1;
        }

        let (segment, l2) = rec_lookup
            .get(&(key.0.as_str(), key.1.as_str()))
            .map(|r| (r.segment.clone(), r.l2_category.clone()))
            .unwrap_or_else(|| ("Unknown".to_string(), "Unknown".to_string()));

        let seg = segment_counts.entry(segment).or_insert((0, 0));
        seg.0 += usize::from(is_accepted);
        seg.1 += 1;
        let l2e = l2_counts.entry(l2).or_insert((0, 0));
        l2e.0 += usize::from(is_accepted);
        l2e.1 += 1;

        if let Some(reason) = &row.reason_code {
            *reason_codes.entry(reason.clone()).or_insert(0) += 1;
        }
    }

    let total = deduped.len();
    let acceptance_rate = if total > 0 {
        Some(accepted as f64 / total as f64)
    } else {
        None
    };
    let rate = |(hits, count): (usize, usize)| hits as f64 / count as f64;

    FeedbackSummary {
        overall: OverallStats {
            feedback_rows: total,
            acceptance_rate,
        },
        per_segment: segment_counts.into_iter().map(|(k, v)| (k, rate(v))).collect(),
        per_l2: l2_counts.into_iter().map(|(k, v)| (k, rate(v))).collect(),
        reason_codes,
        threshold_suggestions: suggestions(acceptance_rate, config),
    }
}
