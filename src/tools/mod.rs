//! Built-in tools.
//!
//! Database tools run in a read-only transaction on the caller's own pool,
//! with a per-statement timeout.

pub mod count_rows;
pub mod execute_explain;
pub mod query_database;
pub mod schema_info;
pub mod search_knowledgebase;
pub mod tsv;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};

use crate::errors::AppError;
use crate::kb::KnowledgebaseReader;
use crate::mcp::registry::{handler, ToolRegistry};
use crate::store::connections::TargetInfo;

/// Register every built-in tool. The knowledgebase tool is only offered when
/// a knowledgebase is configured.
pub fn register_builtin(
    registry: &mut ToolRegistry,
    statement_timeout_ms: u64,
    knowledgebase: Option<Arc<dyn KnowledgebaseReader>>,
) -> Result<(), AppError> {
    registry.register(
        query_database::NAME,
        query_database::DESCRIPTION,
        query_database::schema(),
        handler(move |ctx, args| query_database::run(ctx, args, statement_timeout_ms)),
    )?;
    registry.register(
        schema_info::NAME,
        schema_info::DESCRIPTION,
        schema_info::schema(),
        handler(move |ctx, args| schema_info::run(ctx, args, statement_timeout_ms)),
    )?;
    registry.register(
        count_rows::NAME,
        count_rows::DESCRIPTION,
        count_rows::schema(),
        handler(move |ctx, args| count_rows::run(ctx, args, statement_timeout_ms)),
    )?;
    registry.register(
        execute_explain::NAME,
        execute_explain::DESCRIPTION,
        execute_explain::schema(),
        handler(move |ctx, args| execute_explain::run(ctx, args, statement_timeout_ms)),
    )?;

    if let Some(kb) = knowledgebase {
        registry.register(
            search_knowledgebase::NAME,
            search_knowledgebase::DESCRIPTION,
            search_knowledgebase::schema(),
            handler(move |_ctx, args| search_knowledgebase::run(kb.clone(), args)),
        )?;
    }
    Ok(())
}

pub(crate) fn parse_args<T: DeserializeOwned>(tool: &str, args: Value) -> Result<T, AppError> {
    serde_json::from_value(args).map_err(|e| AppError::InvalidArguments(format!("{}: {}", tool, e)))
}

/// Begin a read-only transaction with `statement_timeout` applied.
pub(crate) async fn read_only(
    pool: &PgPool,
    statement_timeout_ms: u64,
) -> Result<Transaction<'static, Postgres>, AppError> {
    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION READ ONLY")
        .execute(&mut *tx)
        .await?;
    // SET does not take bind parameters.
    sqlx::query(&format!("SET LOCAL statement_timeout = {}", statement_timeout_ms))
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

/// Double-quote a SQL identifier.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// First line of tool output naming the database, without credentials.
pub(crate) fn describe_target(target: &TargetInfo) -> String {
    match (&target.alias, &target.host, &target.database) {
        (Some(alias), Some(host), Some(db)) => format!(
            "Database: {} ({}@{}:{}/{})",
            alias,
            target.user.as_deref().unwrap_or(""),
            host,
            target.port.unwrap_or(5432),
            db
        ),
        _ => "Database: server default".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kb::{KbChunk, KbQuery};
    use async_trait::async_trait;

    struct NoDocs;

    #[async_trait]
    impl KnowledgebaseReader for NoDocs {
        async fn search(&self, _query: &KbQuery) -> Result<Vec<KbChunk>, AppError> {
            Ok(vec![])
        }
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_describe_target() {
        let info = TargetInfo {
            alias: Some("analytics".into()),
            host: Some("db.internal".into()),
            port: Some(6432),
            database: Some("warehouse".into()),
            user: Some("reader".into()),
        };
        assert_eq!(
            describe_target(&info),
            "Database: analytics (reader@db.internal:6432/warehouse)"
        );
        let default = TargetInfo {
            alias: None,
            host: None,
            port: None,
            database: None,
            user: None,
        };
        assert_eq!(describe_target(&default), "Database: server default");
    }

    #[test]
    fn test_knowledgebase_tool_is_optional() {
        let mut registry = ToolRegistry::default();
        register_builtin(&mut registry, 1000, None).unwrap();
        let names: Vec<String> = registry.list().into_iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec!["query_database", "get_schema_info", "count_rows", "execute_explain"]
        );

        let mut registry = ToolRegistry::default();
        register_builtin(&mut registry, 1000, Some(Arc::new(NoDocs))).unwrap();
        assert!(registry.contains("search_knowledgebase"));
        assert_eq!(registry.len(), 5);
    }
}
