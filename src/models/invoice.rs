use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// One invoice line after identifier normalisation and timestamp parsing.
/// Append-only input; read-only to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub invoice_id: String,
    pub customer_id: String,
    pub product_id: String,
    /// Non-negative ordered quantity
    pub quantity: u32,
    /// UTC-normalised, timezone-stripped timestamp
    pub invoice_date: NaiveDateTime,
    /// Line price detected under the configured aliases, when present
    pub unit_price: Option<f64>,
    pub line_total: Option<f64>,
}

/// Parse a mixed-format invoice timestamp.
///
/// Exported invoice feeds mix tz-aware and tz-naive values. Tz-aware values
/// are converted to UTC before the offset is dropped so that gap arithmetic
/// never compares values from different clocks. Returns `None` for
/// unparseable input — the caller logs and drops the row.
pub fn parse_invoice_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(dt);
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_parse_tz_aware_normalises_to_utc() {
        let dt = parse_invoice_timestamp("2024-03-01T10:00:00+05:00").unwrap();
        assert_eq!(dt.hour(), 5);
        let z = parse_invoice_timestamp("2024-03-01T10:00:00Z").unwrap();
        assert_eq!(z.hour(), 10);
    }

    #[test]
    fn test_parse_naive_and_date_only() {
        assert!(parse_invoice_timestamp("2024-03-01T10:00:00").is_some());
        assert!(parse_invoice_timestamp("2024-03-01 10:00:00").is_some());
        let d = parse_invoice_timestamp("2024-03-01").unwrap();
        assert_eq!(d.hour(), 0);
    }

    #[test]
    fn test_parse_garbage_is_none() {
        assert!(parse_invoice_timestamp("").is_none());
        assert!(parse_invoice_timestamp("not-a-date").is_none());
        assert!(parse_invoice_timestamp("03/01/2024").is_none());
    }
}
