//! Tab-separated rendering of query results.
//!
//! NULL renders as an empty field; tabs and line breaks inside values are
//! written as `\t`, `\n` and `\r` so each row stays on one line.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::types::Oid;
use sqlx::postgres::PgRow;
use sqlx::{Column, Row, TypeInfo};
use uuid::Uuid;

pub fn escape(value: &str) -> String {
    value
        .replace('\t', "\\t")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

/// Header line followed by one line per row.
pub fn format_table(columns: &[String], rows: &[Vec<String>]) -> String {
    if columns.is_empty() {
        return String::new();
    }
    let mut out = columns.iter().map(|c| escape(c)).collect::<Vec<_>>().join("\t");
    for row in rows {
        out.push('\n');
        out.push_str(&row.join("\t"));
    }
    out
}

pub fn column_names(row: &PgRow) -> Vec<String> {
    row.columns().iter().map(|c| c.name().to_string()).collect()
}

/// Every field of `row`, escaped.
pub fn row_values(row: &PgRow) -> Vec<String> {
    (0..row.len()).map(|idx| escape(&render(row, idx))).collect()
}

fn opt<T: ToString>(value: Result<Option<T>, sqlx::Error>) -> Option<String> {
    value.ok().map(|v| v.map(|v| v.to_string()).unwrap_or_default())
}

fn render(row: &PgRow, idx: usize) -> String {
    let type_name = row.columns()[idx].type_info().name().to_ascii_uppercase();

    let rendered = match type_name.as_str() {
        "BOOL" => opt(row.try_get::<Option<bool>, _>(idx)),
        "INT2" => opt(row.try_get::<Option<i16>, _>(idx)),
        "INT4" => opt(row.try_get::<Option<i32>, _>(idx)),
        "INT8" => opt(row.try_get::<Option<i64>, _>(idx)),
        "FLOAT4" => opt(row.try_get::<Option<f32>, _>(idx)),
        "FLOAT8" => opt(row.try_get::<Option<f64>, _>(idx)),
        "NUMERIC" => opt(row.try_get::<Option<Decimal>, _>(idx)),
        "OID" => row
            .try_get::<Option<Oid>, _>(idx)
            .ok()
            .map(|v| v.map(|oid| oid.0.to_string()).unwrap_or_default()),
        "UUID" => opt(row.try_get::<Option<Uuid>, _>(idx)),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)
            .ok()
            .map(|v| v.map(|ts| ts.to_rfc3339()).unwrap_or_default()),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)
            .ok()
            .map(|v| v.map(|ts| ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()).unwrap_or_default()),
        "DATE" => opt(row.try_get::<Option<NaiveDate>, _>(idx)),
        "TIME" => opt(row.try_get::<Option<NaiveTime>, _>(idx)),
        "JSON" | "JSONB" => opt(row.try_get::<Option<serde_json::Value>, _>(idx)),
        "TEXT[]" | "VARCHAR[]" | "NAME[]" => row
            .try_get::<Option<Vec<String>>, _>(idx)
            .ok()
            .map(|v| v.map(|items| serde_json::json!(items).to_string()).unwrap_or_default()),
        "INT4[]" => row
            .try_get::<Option<Vec<i32>>, _>(idx)
            .ok()
            .map(|v| v.map(|items| serde_json::json!(items).to_string()).unwrap_or_default()),
        "INT8[]" => row
            .try_get::<Option<Vec<i64>>, _>(idx)
            .ok()
            .map(|v| v.map(|items| serde_json::json!(items).to_string()).unwrap_or_default()),
        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .map(|v| v.map(|bytes| format!("\\x{}", hex::encode(bytes))).unwrap_or_default()),
        _ => opt(row.try_get::<Option<String>, _>(idx)),
    };

    rendered.unwrap_or_else(|| format!("<{}>", type_name.to_ascii_lowercase()))
}
