use serde::{Deserialize, Serialize};

use crate::errors::{RecoError, RecoResult};

/// A directed association rule A → B scoped to one (segment, cluster).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationRule {
    pub segment: String,
    pub cluster_id: String,
    pub product_a: String,
    pub product_b: String,
    /// Distinct baskets containing both A and B
    pub pair_freq: u64,
    /// Decay-weighted basket count for the pair
    pub weighted_pair_freq: f64,
    /// Distinct baskets containing A in the cluster
    pub product_freq: u64,
    /// pair_freq / product_freq — P(B | A)
    pub confidence: f64,
    /// pair_freq / total_baskets — P(A ∧ B)
    pub support: f64,
    /// weighted_pair_freq / total_baskets
    pub weighted_support: f64,
    /// confidence / P(B); > 1 indicates genuine affinity
    pub lift: f64,
}

impl AssociationRule {
    /// Check the arithmetic invariants that must hold for every rule.
    ///
    /// `total_baskets` is the distinct basket count of the rule's cluster;
    /// pass `None` when checking a rule table in isolation (the ranking
    /// stage does not know the cluster totals). A violation means
    /// sessionization or a join produced inconsistent counts and the whole
    /// rule table is untrustworthy.
    pub fn check_invariants(&self, total_baskets: Option<u64>) -> RecoResult<()> {
        const EPS: f64 = 1e-9;
        if self.pair_freq > self.product_freq {
            return Err(RecoError::invariant(format!(
                "rule {} -> {} in {}/{}: pair_freq {} exceeds product_freq {}",
                self.product_a,
                self.product_b,
                self.segment,
                self.cluster_id,
                self.pair_freq,
                self.product_freq,
            )));
        }
        if let Some(total) = total_baskets {
            if self.product_freq > total {
                return Err(RecoError::invariant(format!(
                    "rule {} -> {} in {}/{}: product_freq {} exceeds total baskets {}",
                    self.product_a,
                    self.product_b,
                    self.segment,
                    self.cluster_id,
                    self.product_freq,
                    total,
                )));
            }
        }
        if !(0.0 - EPS..=1.0 + EPS).contains(&self.confidence) {
            return Err(RecoError::invariant(format!(
                "rule {} -> {}: confidence {} outside [0, 1]",
                self.product_a, self.product_b, self.confidence,
            )));
        }
        if !(0.0 - EPS..=1.0 + EPS).contains(&self.support) {
            return Err(RecoError::invariant(format!(
                "rule {} -> {}: support {} outside [0, 1]",
                self.product_a, self.product_b, self.support,
            )));
        }
        if self.lift < 0.0 {
            return Err(RecoError::invariant(format!(
                "rule {} -> {}: negative lift {}",
                self.product_a, self.product_b, self.lift,
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> AssociationRule {
        AssociationRule {
            segment: "West_Plumbing".to_string(),
            cluster_id: "West_Plumbing_0".to_string(),
            product_a: "P1".to_string(),
            product_b: "P2".to_string(),
            pair_freq: 3,
            weighted_pair_freq: 2.8,
            product_freq: 5,
            confidence: 0.6,
            support: 0.3,
            weighted_support: 0.28,
            lift: 1.5,
        }
    }

    #[test]
    fn test_valid_rule_passes() {
        assert!(rule().check_invariants(Some(10)).is_ok());
    }

    #[test]
    fn test_pair_freq_above_product_freq_fails() {
        let mut r = rule();
        r.pair_freq = 7;
        let err = r.check_invariants(Some(10)).unwrap_err();
        assert!(err.to_string().contains("pair_freq 7 exceeds product_freq 5"));
    }

    #[test]
    fn test_product_freq_above_total_fails() {
        let err = rule().check_invariants(Some(4)).unwrap_err();
        assert!(err.to_string().contains("exceeds total baskets"));
    }

    #[test]
    fn test_confidence_out_of_range_fails() {
        let mut r = rule();
        r.confidence = 1.2;
        assert!(r.check_invariants(Some(10)).is_err());
    }
}
