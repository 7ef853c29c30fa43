use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{describe_target, parse_args, read_only};
use crate::errors::AppError;
use crate::mcp::registry::ToolContext;
use crate::mcp::types::CallToolResult;

pub const NAME: &str = "execute_explain";
pub const DESCRIPTION: &str = "Show the execution plan of a SELECT query to diagnose performance. \
With `analyze` (default true) the query is actually executed, inside a read-only transaction, and \
the plan carries real row counts and timings; `buffers` adds shared-buffer hit/read counts. The text \
format is followed by a short list of issues found in the plan. Only SELECT statements are accepted.";

const RULE: &str = "================================================================================";

static SEQ_SCAN: Lazy<Regex> = Lazy::new(|| Regex::new(r"Seq Scan on (\w+)").expect("static regex"));
static EXECUTION_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Execution Time: (\d+(?:\.\d+)?) ms").expect("static regex"));
static BLOCKS_READ: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bread=\d+").expect("static regex"));

pub fn schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "minLength": 1,
                "description": "The SELECT query to explain"
            },
            "analyze": {
                "type": "boolean",
                "default": true,
                "description": "Execute the query (EXPLAIN ANALYZE) instead of planning only"
            },
            "buffers": {
                "type": "boolean",
                "default": true,
                "description": "Include buffer usage statistics"
            },
            "format": {
                "type": "string",
                "enum": ["text", "json"],
                "default": "text",
                "description": "Plan output format"
            }
        },
        "required": ["query"],
        "additionalProperties": false
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
enum Format {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize)]
struct Args {
    query: String,
    #[serde(default = "yes")]
    analyze: bool,
    #[serde(default = "yes")]
    buffers: bool,
    #[serde(default)]
    format: Format,
}

fn yes() -> bool {
    true
}

fn is_select(query: &str) -> bool {
    query
        .trim_start()
        .get(..6)
        .map(|head| head.eq_ignore_ascii_case("select"))
        .unwrap_or(false)
}

pub(crate) fn explain_sql(query: &str, analyze: bool, buffers: bool, json: bool) -> String {
    let mut options = Vec::new();
    if analyze {
        options.push("ANALYZE TRUE");
    }
    if buffers {
        options.push("BUFFERS TRUE");
    }
    if json {
        options.push("FORMAT JSON");
    }
    let query = query.trim().trim_end_matches(';');
    if options.is_empty() {
        format!("EXPLAIN {}", query)
    } else {
        format!("EXPLAIN ({}) {}", options.join(", "), query)
    }
}

/// Issues and recommendations spotted in a text plan.
pub(crate) fn analyze_plan(plan: &str) -> String {
    let mut issues = Vec::new();
    let mut advice = Vec::new();

    let tables: Vec<&str> = SEQ_SCAN
        .captures_iter(plan)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    if !tables.is_empty() {
        issues.push(format!("Sequential scan(s) on: {}", tables.join(", ")));
        advice.push("Consider indexes on frequently filtered columns");
    }

    let slow = EXECUTION_TIME
        .captures(plan)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(|ms| ms > 1000.0)
        .unwrap_or(false);
    if slow {
        issues.push("Query execution took over 1 second".to_string());
    }

    if plan.contains("Hash Join") && plan.contains("Batches:") {
        issues.push("Hash join ran in batches".to_string());
        advice.push("Consider increasing work_mem if the hash join spills to disk");
    }

    if plan.contains("Sort") && (plan.contains("external") || plan.contains("Disk:")) {
        issues.push("Sort spilled to disk".to_string());
        advice.push("Consider increasing work_mem or an index that provides the order");
    }

    if BLOCKS_READ.is_match(plan) {
        issues.push("Some blocks were read from disk rather than cache".to_string());
        advice.push("Run again to warm the cache, or review shared_buffers");
    }

    let mut out = String::new();
    if !issues.is_empty() {
        out.push_str("Issues:\n");
        for issue in &issues {
            out.push_str(&format!("- {}\n", issue));
        }
    }
    if !advice.is_empty() {
        out.push_str("Recommendations:\n");
        for (i, line) in advice.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, line));
        }
    }
    out
}

pub async fn run(ctx: ToolContext, args: Value, statement_timeout_ms: u64) -> Result<CallToolResult, AppError> {
    let args: Args = parse_args(NAME, args)?;
    if !is_select(&args.query) {
        return Ok(CallToolResult::error(
            "Only SELECT queries can be explained: EXPLAIN ANALYZE executes the statement.",
        ));
    }

    let json_format = args.format == Format::Json;
    let sql = explain_sql(&args.query, args.analyze, args.buffers, json_format);

    let mut tx = read_only(ctx.db.pool(), statement_timeout_ms).await?;
    let plan = if json_format {
        sqlx::query_scalar::<_, Value>(&sql)
            .fetch_one(&mut *tx)
            .await
            .map(|plan| serde_json::to_string_pretty(&plan).unwrap_or_else(|_| plan.to_string()))
    } else {
        sqlx::query_scalar::<_, String>(&sql)
            .fetch_all(&mut *tx)
            .await
            .map(|lines| lines.join("\n"))
    };
    let plan = match plan {
        Ok(plan) => plan,
        Err(e) => {
            return Ok(CallToolResult::error(format!(
                "Error executing EXPLAIN: {}\n\nQuery: {}",
                e, sql
            )));
        }
    };
    tx.commit().await?;

    tracing::info!(
        identity = %ctx.identity,
        analyze = args.analyze,
        buffers = args.buffers,
        format = ?args.format,
        "execute_explain executed"
    );

    let mut out = format!(
        "{}\n\nQuery:\n{}\n\nExecution Plan:\n{}\n{}\n{}\n",
        describe_target(ctx.db.target()),
        args.query.trim(),
        RULE,
        plan,
        RULE
    );
    if !json_format && args.analyze {
        let analysis = analyze_plan(&plan);
        if !analysis.is_empty() {
            out.push('\n');
            out.push_str(&analysis);
        }
    }
    Ok(CallToolResult::text(out))
}
