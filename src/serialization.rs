//! Table and artifact serialization
//!
//! All tabular artifacts are delimited text with a header row; identifiers
//! stay strings end to end. Model artifacts and the feedback summary are
//! JSON documents. Raw input readers validate required columns up front so a
//! malformed export fails with a column name, not a row-level serde error.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::errors::{RecoError, RecoResult};
use crate::models::invoice::parse_invoice_timestamp;
use crate::models::{Customer, FeedbackRow, InvoiceLine, Product};

/// Verify that every required column is present in the header row.
fn require_columns(headers: &StringRecord, required: &[&str], table: &str) -> RecoResult<()> {
    let missing: Vec<&str> = required
        .iter()
        .filter(|c| !headers.iter().any(|h| h == **c))
        .copied()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(RecoError::data_quality(format!(
            "{} input is missing required column(s) {:?}; present: {:?}",
            table,
            missing,
            headers.iter().collect::<Vec<_>>(),
        )))
    }
}

/// Read a typed table produced by an earlier stage.
pub fn read_csv<T: DeserializeOwned>(path: &Path) -> RecoResult<Vec<T>> {
    let file = File::open(path).map_err(|e| {
        RecoError::io(format!("cannot open {}: {}", path.display(), e))
    })?;
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_reader(BufReader::new(file));
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record?);
    }
    Ok(rows)
}

/// Write a typed table for downstream stages.
pub fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> RecoResult<()> {
    let file = File::create(path).map_err(|e| {
        RecoError::io(format!("cannot create {}: {}", path.display(), e))
    })?;
    let mut writer = WriterBuilder::new()
        .has_headers(true)
        .from_writer(BufWriter::new(file));
    for row in rows {
        writer.serialize(row)?;
    }
    writer
        .flush()
        .map_err(|e| RecoError::io(format!("flushing {}: {}", path.display(), e)))?;
    Ok(())
}

/// Read a JSON artifact (model, scaler, registry, summary).
pub fn read_json<T: DeserializeOwned>(path: &Path) -> RecoResult<T> {
    let file = File::open(path).map_err(|e| {
        RecoError::io(format!("cannot open {}: {}", path.display(), e))
    })?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// Write a JSON artifact, pretty-printed for human inspection.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> RecoResult<()> {
    let file = File::create(path).map_err(|e| {
        RecoError::io(format!("cannot create {}: {}", path.display(), e))
    })?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)?;
    Ok(())
}

/// Read the customers table, validating the join and segment key columns.
pub fn read_customers(path: &Path) -> RecoResult<Vec<Customer>> {
    let file = File::open(path).map_err(|e| {
        RecoError::io(format!("cannot open {}: {}", path.display(), e))
    })?;
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_reader(BufReader::new(file));
    require_columns(
        reader.headers()?,
        &["customer_id", "region", "end_use"],
        "customers",
    )?;
    let mut rows: Vec<Customer> = Vec::new();
    for record in reader.deserialize::<Customer>() {
        let mut c = record?;
        c.customer_id = c.customer_id.trim().to_string();
        rows.push(c);
    }
    if rows.is_empty() {
        return Err(RecoError::data_quality(
            "customers input is empty — the pipeline needs at least one customer",
        ));
    }
    Ok(rows)
}

/// Read the products table, validating the identifier column.
pub fn read_products(path: &Path) -> RecoResult<Vec<Product>> {
    let file = File::open(path).map_err(|e| {
        RecoError::io(format!("cannot open {}: {}", path.display(), e))
    })?;
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_reader(BufReader::new(file));
    require_columns(reader.headers()?, &["product_id"], "products")?;
    let mut rows: Vec<Product> = Vec::new();
    for record in reader.deserialize::<Product>() {
        let mut p = record?;
        p.product_id = p.product_id.trim().to_string();
        rows.push(p);
    }
    if rows.is_empty() {
        return Err(RecoError::data_quality(
            "products input is empty — the pipeline needs at least one product",
        ));
    }
    Ok(rows)
}

/// Counters describing what the invoice reader had to discard or coerce.
#[derive(Debug, Default, Clone, Copy)]
pub struct InvoiceReadStats {
    pub total_rows: usize,
    pub dropped_bad_timestamp: usize,
    pub coerced_bad_quantity: usize,
    pub price_column_found: bool,
}

/// Read the invoices table.
///
/// The price column is detected under the configured aliases; when none
/// matches, monetary features are disabled downstream rather than failing.
/// Rows with unparseable timestamps are dropped and counted, never fatal.
pub fn read_invoices(
    path: &Path,
    price_aliases: &[&str],
) -> RecoResult<(Vec<InvoiceLine>, InvoiceReadStats)> {
    let file = File::open(path).map_err(|e| {
        RecoError::io(format!("cannot open {}: {}", path.display(), e))
    })?;
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(BufReader::new(file));
    let headers = reader.headers()?.clone();
    require_columns(
        &headers,
        &["invoice_id", "customer_id", "product_id", "quantity", "invoice_date"],
        "invoices",
    )?;

    let col = |name: &str| headers.iter().position(|h| h == name);
    let invoice_id_ix = col("invoice_id").unwrap();
    let customer_id_ix = col("customer_id").unwrap();
    let product_id_ix = col("product_id").unwrap();
    let quantity_ix = col("quantity").unwrap();
    let date_ix = col("invoice_date").unwrap();
    let price_ix = price_aliases.iter().find_map(|a| col(a));
    let line_total_ix = col("line_total");

    if price_ix.is_none() {
        warn!(
            aliases = ?price_aliases,
            "no price column found in invoices — monetary features disabled"
        );
    }

    let mut stats = InvoiceReadStats {
        price_column_found: price_ix.is_some(),
        ..InvoiceReadStats::default()
    };
    let mut rows = Vec::new();

    for record in reader.records() {
        let record = record?;
        stats.total_rows += 1;

        let Some(invoice_date) =
            record.get(date_ix).and_then(parse_invoice_timestamp)
        else {
            stats.dropped_bad_timestamp += 1;
            continue;
        };

        let raw_qty = record.get(quantity_ix).unwrap_or("").trim();
        let quantity = match raw_qty.parse::<u32>() {
            Ok(q) => q,
            Err(_) => {
                // Tolerate "12.0" style exports; anything else coerces to 0
                let coerced = raw_qty
                    .parse::<f64>()
                    .ok()
                    .filter(|q| *q >= 0.0)
                    .map(|q| q.round() as u32)
                    .unwrap_or(0);
                stats.coerced_bad_quantity += 1;
                coerced
            }
        };

        let parse_price = |ix: Option<usize>| {
            ix.and_then(|i| record.get(i))
                .and_then(|v| v.trim().parse::<f64>().ok())
        };

        rows.push(InvoiceLine {
            invoice_id: record.get(invoice_id_ix).unwrap_or("").trim().to_string(),
            customer_id: record.get(customer_id_ix).unwrap_or("").trim().to_string(),
            product_id: record.get(product_id_ix).unwrap_or("").trim().to_string(),
            quantity,
            invoice_date,
            unit_price: parse_price(price_ix),
            line_total: parse_price(line_total_ix),
        });
    }

    if stats.dropped_bad_timestamp > 0 {
        warn!(
            dropped = stats.dropped_bad_timestamp,
            "dropped invoice rows with unparseable timestamps"
        );
    }
    if rows.is_empty() {
        return Err(RecoError::data_quality(
            "invoices input is empty after timestamp parsing — nothing to aggregate",
        ));
    }
    Ok((rows, stats))
}

/// Read the optional feedback table. A missing file is not an error — the
/// caller bypasses calibration. Dates are parsed tolerantly: an unparseable
/// feedback_date becomes None rather than rejecting the record.
pub fn read_feedback(path: &Path) -> RecoResult<Vec<FeedbackRow>> {
    let file = File::open(path).map_err(|e| {
        RecoError::io(format!("cannot open {}: {}", path.display(), e))
    })?;
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(BufReader::new(file));
    let headers = reader.headers()?.clone();
    require_columns(&headers, &["customer_id", "product_id", "rating"], "feedback")?;

    let col = |name: &str| headers.iter().position(|h| h == name);
    let customer_id_ix = col("customer_id").unwrap();
    let product_id_ix = col("product_id").unwrap();
    let rating_ix = col("rating").unwrap();
    let reason_ix = col("reason_code");
    let sentiment_ix = col("sentiment");
    let date_ix = col("feedback_date");

    let opt = |record: &StringRecord, ix: Option<usize>| -> Option<String> {
        ix.and_then(|i| record.get(i))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(FeedbackRow {
            customer_id: record.get(customer_id_ix).unwrap_or("").trim().to_string(),
            product_id: record.get(product_id_ix).unwrap_or("").trim().to_string(),
            rating: record.get(rating_ix).unwrap_or("").trim().to_string(),
            reason_code: opt(&record, reason_ix),
            sentiment: opt(&record, sentiment_ix),
            feedback_date: opt(&record, date_ix)
                .and_then(|v| chrono::NaiveDate::parse_from_str(&v, "%Y-%m-%d").ok()),
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_missing_required_column_is_fatal() {
        let f = write_temp("customer_id,region\nC1,West\n");
        let err = read_customers(f.path()).unwrap_err();
        assert!(err.to_string().contains("end_use"));
    }

    #[test]
    fn test_empty_customer_table_is_fatal() {
        let f = write_temp("customer_id,customer_name,region,end_use,customer_type,city,state,tenure,credit_limit\n");
        assert!(read_customers(f.path()).is_err());
    }

    #[test]
    fn test_invoice_reader_drops_bad_timestamps() {
        let f = write_temp(
            "invoice_id,customer_id,product_id,quantity,invoice_date,unit_price\n\
             I1,C1,P1,2,2024-01-05,9.5\n\
             I2,C1,P2,1,garbage,9.5\n\
             I3,C1,P3,3,2024-02-01T08:00:00+02:00,4.0\n",
        );
        let (rows, stats) = read_invoices(f.path(), &["unit_price", "price"]).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(stats.dropped_bad_timestamp, 1);
        assert!(stats.price_column_found);
        assert_eq!(rows[0].unit_price, Some(9.5));
    }

    #[test]
    fn test_invoice_reader_detects_alias_and_coerces_quantity() {
        let f = write_temp(
            "invoice_id,customer_id,product_id,quantity,invoice_date,sale_price\n\
             I1,C1,P1,2.0,2024-01-05,7.25\n\
             I2,C1,P2,oops,2024-01-06,1.0\n",
        );
        let (rows, stats) = read_invoices(f.path(), &["unit_price", "sale_price"]).unwrap();
        assert_eq!(rows[0].quantity, 2);
        assert_eq!(rows[1].quantity, 0);
        assert_eq!(stats.coerced_bad_quantity, 2);
        assert_eq!(rows[0].unit_price, Some(7.25));
    }

    #[test]
    fn test_invoice_reader_without_price_column() {
        let f = write_temp(
            "invoice_id,customer_id,product_id,quantity,invoice_date\n\
             I1,C1,P1,2,2024-01-05\n",
        );
        let (rows, stats) = read_invoices(f.path(), &["unit_price"]).unwrap();
        assert!(!stats.price_column_found);
        assert_eq!(rows[0].unit_price, None);
    }

    #[test]
    fn test_feedback_reader_tolerates_partial_columns() {
        let f = write_temp(
            "customer_id,product_id,rating,feedback_date\n\
             C1,P1,High,2024-06-01\n\
             C2,P2,Weird,not-a-date\n",
        );
        let rows = read_feedback(f.path()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].feedback_date, Some(chrono::NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()));
        assert_eq!(rows[1].feedback_date, None);
        assert_eq!(rows[1].rating, "Weird");
        assert_eq!(rows[1].sentiment, None);
    }

    #[test]
    fn test_csv_round_trip_basket_rows() {
        use crate::models::{BasketRow, PriceBand};
        let rows = vec![BasketRow {
            customer_id: "C1".to_string(),
            product_id: "P1".to_string(),
            region: "West".to_string(),
            end_use: "Plumbing".to_string(),
            segment: "West_Plumbing".to_string(),
            brand: "Acme".to_string(),
            l2_category: "Valves".to_string(),
            l3_category: "Ball Valves".to_string(),
            functionality: "Flow Control".to_string(),
            in_stock: true,
            purchase_frequency: 3,
            total_quantity: 12.0,
            recency_days: 42,
            rfm_recency_score: 0.8,
            rfm_frequency_score: 0.5,
            rfm_monetary_score: 0.5,
            price_band: PriceBand::High,
        }];
        let f = tempfile::NamedTempFile::new().unwrap();
        write_csv(f.path(), &rows).unwrap();
        let back: Vec<BasketRow> = read_csv(f.path()).unwrap();
        assert_eq!(back, rows);
    }
}
