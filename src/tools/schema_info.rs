use serde::Deserialize;
use serde_json::{json, Value};

use super::{describe_target, parse_args, read_only, tsv};
use crate::errors::AppError;
use crate::mcp::registry::ToolContext;
use crate::mcp::types::CallToolResult;

pub const NAME: &str = "get_schema_info";
pub const DESCRIPTION: &str = "List tables and views with their columns, data types and nullability. \
System schemas are excluded. Pass schema_name to restrict the output to one schema.";

const COLUMNS_SQL: &str = r#"
SELECT c.table_schema::text  AS table_schema,
       c.table_name::text    AS table_name,
       t.table_type::text    AS table_type,
       c.column_name::text   AS column_name,
       c.data_type::text     AS data_type,
       c.is_nullable::text   AS is_nullable
FROM information_schema.columns c
JOIN information_schema.tables t
  ON t.table_schema = c.table_schema AND t.table_name = c.table_name
WHERE c.table_schema NOT IN ('pg_catalog', 'information_schema')
  AND c.table_schema NOT LIKE 'pg_toast%'
  AND ($1::text IS NULL OR c.table_schema = $1)
ORDER BY c.table_schema, c.table_name, c.ordinal_position
"#;

pub fn schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "schema_name": {
                "type": "string",
                "description": "Only describe this schema"
            }
        },
        "additionalProperties": false
    })
}

#[derive(Debug, Deserialize)]
struct Args {
    #[serde(default)]
    schema_name: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ColumnRow {
    pub table_schema: String,
    pub table_name: String,
    pub table_type: String,
    pub column_name: String,
    pub data_type: String,
    pub is_nullable: String,
}

pub(crate) fn render(rows: &[ColumnRow]) -> String {
    let columns: Vec<String> = ["schema", "table", "type", "column", "data_type", "nullable"]
        .iter()
        .map(|c| c.to_string())
        .collect();
    let values: Vec<Vec<String>> = rows
        .iter()
        .map(|r| {
            let kind = if r.table_type.eq_ignore_ascii_case("VIEW") {
                "view"
            } else {
                "table"
            };
            vec![
                tsv::escape(&r.table_schema),
                tsv::escape(&r.table_name),
                kind.to_string(),
                tsv::escape(&r.column_name),
                tsv::escape(&r.data_type),
                if r.is_nullable == "YES" { "yes" } else { "no" }.to_string(),
            ]
        })
        .collect();
    tsv::format_table(&columns, &values)
}

pub async fn run(ctx: ToolContext, args: Value, statement_timeout_ms: u64) -> Result<CallToolResult, AppError> {
    let args: Args = parse_args(NAME, args)?;
    let schema_name = args.schema_name.filter(|s| !s.trim().is_empty());

    let mut tx = read_only(ctx.db.pool(), statement_timeout_ms).await?;
    let rows = sqlx::query_as::<_, ColumnRow>(COLUMNS_SQL)
        .bind(schema_name.as_deref())
        .fetch_all(&mut *tx)
        .await?;
    tx.commit().await?;

    if rows.is_empty() {
        let scope = schema_name
            .map(|s| format!("schema '{}'", s))
            .unwrap_or_else(|| "any user schema".to_string());
        return Ok(CallToolResult::text(format!("No tables found in {}.", scope)));
    }

    let tables = {
        let mut names: Vec<(&str, &str)> = rows
            .iter()
            .map(|r| (r.table_schema.as_str(), r.table_name.as_str()))
            .collect();
        names.dedup();
        names.len()
    };

    Ok(CallToolResult::text(format!(
        "{}\n\n{} tables/views, {} columns:\n{}",
        describe_target(ctx.db.target()),
        tables,
        rows.len(),
        render(&rows)
    )))
}
