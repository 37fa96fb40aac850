//! Writers for the clean dataset handed off by the pipeline.
//!
//! The exporter contract is deliberately thin: a sequence of normalized
//! records plus the run summary. Columns follow the canonical field order
//! of the normalized record.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use catalog_core::{IngestSummary, Product};

pub const CSV_COLUMNS: [&str; 7] =
    ["id", "name", "price", "currency", "available", "url", "fetched_at"];

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Row-per-record CSV with a header, stable column order.
pub fn write_csv(records: &[Product], path: &Path) -> Result<(), ExportError> {
    let mut out = create(path)?;
    writeln!(out, "{}", CSV_COLUMNS.join(","))?;
    for product in records {
        let row = [
            csv_field(product.id.as_deref().unwrap_or("")),
            csv_field(&product.name),
            csv_field(&product.price.to_string()),
            csv_field(&product.currency),
            csv_field(if product.available { "true" } else { "false" }),
            csv_field(product.url.as_deref().unwrap_or("")),
            csv_field(&product.fetched_at.to_rfc3339()),
        ];
        writeln!(out, "{}", row.join(","))?;
    }
    out.flush()?;
    Ok(())
}

/// One JSON object per line.
pub fn write_jsonl(records: &[Product], path: &Path) -> Result<(), ExportError> {
    let mut out = create(path)?;
    for product in records {
        let line = serde_json::to_string(product)?;
        writeln!(out, "{line}")?;
    }
    out.flush()?;
    Ok(())
}

pub fn write_summary_json(summary: &IngestSummary, path: &Path) -> Result<(), ExportError> {
    let mut out = create(path)?;
    let body = serde_json::to_string_pretty(summary)?;
    writeln!(out, "{body}")?;
    out.flush()?;
    Ok(())
}

fn create(path: &Path) -> Result<BufWriter<File>, ExportError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(BufWriter::new(File::create(path)?))
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn product(id: &str, name: &str) -> Product {
        Product {
            id: Some(id.to_string()),
            name: name.to_string(),
            price: "49.90".parse().unwrap(),
            currency: "USD".to_string(),
            available: true,
            url: Some("https://shop.example/p/1".to_string()),
            fetched_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn csv_has_header_and_stable_column_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("products.csv");
        write_csv(&[product("SKU-1", "Desk Lamp")], &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next().unwrap(), "id,name,price,currency,available,url,fetched_at");
        assert_eq!(
            lines.next().unwrap(),
            "SKU-1,Desk Lamp,49.90,USD,true,https://shop.example/p/1,2026-03-01T12:00:00+00:00"
        );
        assert!(lines.next().is_none());
    }

    #[test]
    fn csv_quotes_embedded_separators_and_quotes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("products.csv");
        write_csv(&[product("SKU-1", "Lamp, \"Deluxe\" Edition")], &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"Lamp, \"\"Deluxe\"\" Edition\""));
    }

    #[test]
    fn jsonl_roundtrips_each_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("products.jsonl");
        let records = vec![product("SKU-1", "Desk Lamp"), product("SKU-2", "Floor Lamp")];
        write_jsonl(&records, &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: Vec<Product> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(parsed, records);
    }

    #[test]
    fn summary_serializes_with_reject_breakdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        let mut summary = IngestSummary {
            pages_fetched: 2,
            records_seen: 5,
            accepted: 3,
            duplicates: 1,
            ..Default::default()
        };
        summary.rejects.bump(catalog_core::RejectReason::InvalidValue);
        write_summary_json(&summary, &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: IngestSummary = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed.accepted, 3);
        assert_eq!(parsed.rejects.invalid_value, 1);
        assert!(parsed.is_balanced());
    }
}
