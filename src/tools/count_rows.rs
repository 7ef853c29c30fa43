use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_args, quote_ident, read_only};
use crate::errors::AppError;
use crate::mcp::registry::ToolContext;
use crate::mcp::types::CallToolResult;

pub const NAME: &str = "count_rows";
pub const DESCRIPTION: &str = "Count the rows in a table or view. Cheaper than selecting every row \
when only the total is needed.";

pub fn schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "table": {
                "type": "string",
                "minLength": 1,
                "description": "Table or view name"
            },
            "schema": {
                "type": "string",
                "minLength": 1,
                "default": "public",
                "description": "Schema containing the table"
            }
        },
        "required": ["table"],
        "additionalProperties": false
    })
}

#[derive(Debug, Deserialize)]
struct Args {
    table: String,
    #[serde(default = "default_schema")]
    schema: String,
}

fn default_schema() -> String {
    "public".to_string()
}

pub(crate) fn count_sql(schema: &str, table: &str) -> String {
    format!("SELECT count(*) FROM {}.{}", quote_ident(schema), quote_ident(table))
}

pub async fn run(ctx: ToolContext, args: Value, statement_timeout_ms: u64) -> Result<CallToolResult, AppError> {
    let args: Args = parse_args(NAME, args)?;
    let sql = count_sql(&args.schema, &args.table);

    let mut tx = read_only(ctx.db.pool(), statement_timeout_ms).await?;
    let count = match sqlx::query_scalar::<_, i64>(&sql).fetch_one(&mut *tx).await {
        Ok(count) => count,
        Err(e) => {
            return Ok(CallToolResult::error(format!(
                "Failed to count rows in {}.{}: {}",
                args.schema, args.table, e
            )));
        }
    };
    tx.commit().await?;

    Ok(CallToolResult::text(format!(
        "Table: {}.{}\nRow count: {}",
        args.schema, args.table, count
    )))
}
