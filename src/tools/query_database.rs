use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::Executor;

use super::{describe_target, parse_args, read_only, tsv};
use crate::errors::AppError;
use crate::mcp::registry::ToolContext;
use crate::mcp::types::CallToolResult;

pub const NAME: &str = "query_database";
pub const DESCRIPTION: &str = "Execute a read-only SQL query against the connected PostgreSQL database \
and return the rows as tab-separated values. Results are paged with `limit` (default 100, max 1000) \
and `offset`; a LIMIT/OFFSET is appended unless the query already has one. Use count_rows to get \
totals instead of selecting every row.";

const DEFAULT_LIMIT: i64 = 100;
const MAX_OFFSET: i64 = 1_000_000_000;

static HAS_LIMIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\blimit\s+(\d+|all)\b").expect("static regex"));
static HAS_OFFSET: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\boffset\s+\d+").expect("static regex"));

pub fn schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "minLength": 1,
                "description": "SQL statement to run (read-only)"
            },
            "limit": {
                "type": "integer",
                "minimum": 1,
                "maximum": 1000,
                "default": DEFAULT_LIMIT,
                "description": "Maximum number of rows to return"
            },
            "offset": {
                "type": "integer",
                "minimum": 0,
                "maximum": MAX_OFFSET,
                "default": 0,
                "description": "Rows to skip before returning results, for paging"
            }
        },
        "required": ["query"],
        "additionalProperties": false
    })
}

#[derive(Debug, Deserialize)]
struct Args {
    query: String,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    DEFAULT_LIMIT
}

/// The statement actually sent, and whether the paging clause is ours.
#[derive(Debug, PartialEq)]
pub(crate) struct Paged {
    pub sql: String,
    /// True when LIMIT limit+1 was appended, so an extra row means truncation.
    pub detects_truncation: bool,
}

pub(crate) fn paginate(query: &str, limit: i64, offset: i64) -> Paged {
    let mut sql = query.trim().trim_end_matches(';').trim_end().to_string();
    let detects_truncation = !HAS_LIMIT.is_match(&sql);
    if detects_truncation {
        sql.push_str(&format!(" LIMIT {}", limit.saturating_add(1)));
    }
    if offset > 0 && !HAS_OFFSET.is_match(&sql) {
        sql.push_str(&format!(" OFFSET {}", offset));
    }
    Paged {
        sql,
        detects_truncation,
    }
}

pub(crate) fn summary(rows: usize, limit: i64, offset: i64, truncated: bool) -> String {
    if offset > 0 {
        let first = offset.saturating_add(1);
        let last = offset.saturating_add(rows as i64);
        if truncated {
            format!(
                "Results (rows {}-{}, more available - use offset={} for next page):",
                first,
                last,
                offset.saturating_add(limit)
            )
        } else {
            format!("Results (rows {}-{}):", first, last)
        }
    } else if truncated {
        format!(
            "Results ({} rows shown, more available - use offset={} for next page or count_rows for total):",
            rows, limit
        )
    } else {
        format!("Results ({} rows):", rows)
    }
}

pub async fn run(ctx: ToolContext, args: Value, statement_timeout_ms: u64) -> Result<CallToolResult, AppError> {
    let args: Args = parse_args(NAME, args)?;
    if args.query.trim().is_empty() {
        return Err(AppError::InvalidArguments(format!("{}: query must not be empty", NAME)));
    }

    let paged = paginate(&args.query, args.limit, args.offset);
    let header = format!("{}\n\nSQL Query:\n{}\n\n", describe_target(ctx.db.target()), paged.sql);

    let mut tx = read_only(ctx.db.pool(), statement_timeout_ms).await?;
    let rows = match sqlx::query(&paged.sql).fetch_all(&mut *tx).await {
        Ok(rows) => rows,
        Err(e) => {
            return Ok(CallToolResult::error(format!("{}Error executing query: {}", header, e)));
        }
    };

    let columns = match rows.first() {
        Some(row) => tsv::column_names(row),
        // No rows to read names from; ask the server for the result shape.
        None => match (&mut *tx).describe(paged.sql.as_str()).await {
            Ok(described) => described
                .columns()
                .iter()
                .map(|c| sqlx::Column::name(c).to_string())
                .collect(),
            Err(_) => Vec::new(),
        },
    };

    let mut values: Vec<Vec<String>> = rows.iter().map(tsv::row_values).collect();
    let truncated = paged.detects_truncation && values.len() as i64 > args.limit;
    if truncated {
        values.truncate(args.limit as usize);
    }
    tx.commit().await?;

    tracing::info!(
        identity = %ctx.identity,
        rows = values.len(),
        truncated,
        offset = args.offset,
        "query_database executed"
    );

    Ok(CallToolResult::text(format!(
        "{}{}\n{}",
        header,
        summary(values.len(), args.limit, args.offset, truncated),
        tsv::format_table(&columns, &values)
    )))
}
