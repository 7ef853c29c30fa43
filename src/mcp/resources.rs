//! Read-only MCP resources backed by PostgreSQL system views.
//!
//! Each resource is one catalog query whose rows are aggregated to JSON on
//! the server, read on the caller's own pool.

use serde_json::{json, Value};
use sqlx::PgPool;

use super::types::{McpResourceDef, ReadResourceResult, ResourceContent};
use crate::errors::AppError;
use crate::tools::read_only;

pub const ACTIVITY_URI: &str = "pg://stat/activity";
pub const SETTINGS_URI: &str = "pg://settings";
pub const SYSTEM_INFO_URI: &str = "pg://system_info";

const JSON_MIME: &str = "application/json";

struct Resource {
    uri: &'static str,
    name: &'static str,
    description: &'static str,
    sql: &'static str,
}

const ACTIVITY_SQL: &str = "SELECT datname, pid, usename, application_name, client_addr::text AS client_addr, \
backend_start::text AS backend_start, state, query \
FROM pg_stat_activity WHERE pid <> pg_backend_pid() \
ORDER BY backend_start DESC LIMIT 100";

const SETTINGS_SQL: &str = "SELECT name, setting AS current_value, unit, category, short_desc AS description, \
context, vartype AS type, source, min_val AS min_value, max_val AS max_value, \
boot_val AS default_value, reset_val AS reset_value, pending_restart \
FROM pg_settings ORDER BY category, name";

const SYSTEM_INFO_SQL: &str = "SELECT version() AS version, current_database() AS database, \
current_user AS user, inet_server_addr()::text AS host, inet_server_port() AS port, \
pg_size_pretty(pg_database_size(current_database())) AS database_size";

/// The fixed set of resources this server offers.
pub struct ResourceCatalog {
    resources: Vec<Resource>,
}

impl ResourceCatalog {
    pub fn builtin() -> Self {
        Self {
            resources: vec![
                Resource {
                    uri: ACTIVITY_URI,
                    name: "PostgreSQL Current Activity",
                    description: "Currently executing queries and connections, one row per server \
process, newest first (at most 100).",
                    sql: ACTIVITY_SQL,
                },
                Resource {
                    uri: SETTINGS_URI,
                    name: "PostgreSQL Server Configuration",
                    description: "Configuration parameters from pg_settings with current, default \
and reset values and pending-restart flags.",
                    sql: SETTINGS_SQL,
                },
                Resource {
                    uri: SYSTEM_INFO_URI,
                    name: "PostgreSQL System Information",
                    description: "Server version, current database and user, listen address and \
database size.",
                    sql: SYSTEM_INFO_SQL,
                },
            ],
        }
    }

    pub fn list(&self) -> Vec<McpResourceDef> {
        self.resources
            .iter()
            .map(|r| McpResourceDef {
                uri: r.uri.to_string(),
                name: r.name.to_string(),
                description: r.description.to_string(),
                mime_type: JSON_MIME.to_string(),
            })
            .collect()
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.resources.iter().any(|r| r.uri == uri)
    }

    pub async fn read(
        &self,
        pool: &PgPool,
        uri: &str,
        statement_timeout_ms: u64,
    ) -> Result<ReadResourceResult, AppError> {
        let resource = self
            .resources
            .iter()
            .find(|r| r.uri == uri)
            .ok_or_else(|| AppError::NotFound(format!("resource '{}'", uri)))?;

        let mut tx = read_only(pool, statement_timeout_ms).await?;
        let rows: Value = sqlx::query_scalar(&aggregate_sql(resource.sql))
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        let body = envelope(resource.uri, rows);
        let text = serde_json::to_string_pretty(&body).map_err(|e| AppError::Internal(e.into()))?;
        Ok(ReadResourceResult {
            contents: vec![ResourceContent {
                uri: resource.uri.to_string(),
                mime_type: JSON_MIME.to_string(),
                text,
            }],
        })
    }
}

/// Wrap `sql` so the server returns its rows as one JSON array.
fn aggregate_sql(sql: &str) -> String {
    format!("SELECT coalesce(json_agg(r), '[]'::json) FROM ({}) r", sql)
}

fn envelope(uri: &str, rows: Value) -> Value {
    let count = rows.as_array().map(Vec::len).unwrap_or(0);
    match uri {
        SYSTEM_INFO_URI => rows
            .as_array()
            .and_then(|r| r.first().cloned())
            .unwrap_or_else(|| json!({})),
        ACTIVITY_URI => json!({ "activity_count": count, "activities": rows }),
        _ => json!({ "count": count, "settings": rows }),
    }
}
