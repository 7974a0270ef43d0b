use serde::{Deserialize, Deserializer, Serialize};

/// A catalog product. Immutable within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    /// Product identifier — always a string, never coerced to a number
    pub product_id: String,
    #[serde(default)]
    pub product_name: String,
    #[serde(default)]
    pub brand: String,
    /// Broad category level
    #[serde(default)]
    pub l2_category: String,
    /// Specific category level
    #[serde(default)]
    pub l3_category: String,
    #[serde(default)]
    pub functionality: String,
    /// List price; absent prices disable monetary features downstream
    #[serde(default)]
    pub unit_price: Option<f64>,
    #[serde(default)]
    pub unit_of_measure: String,
    /// Accepts True/False, 1/0, yes/no in any case; anything else is false
    #[serde(deserialize_with = "de_stock_flag", default)]
    pub in_stock: bool,
}

/// Parse the tolerant in-stock flag formats seen in exported catalogs.
pub fn parse_stock_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "y" | "t"
    )
}

fn de_stock_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(parse_stock_flag(&raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stock_flag_variants() {
        for raw in ["True", "true", "1", "yes", "YES", " t "] {
            assert!(parse_stock_flag(raw), "{raw} should parse in stock");
        }
        for raw in ["False", "0", "no", "", "maybe"] {
            assert!(!parse_stock_flag(raw), "{raw} should parse out of stock");
        }
    }
}
