use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use super::parse_args;
use crate::errors::AppError;
use crate::kb::{format_results, KbQuery, KnowledgebaseReader, DEFAULT_TOP_N, MAX_TOP_N};
use crate::mcp::types::CallToolResult;

pub const NAME: &str = "search_knowledgebase";
pub const DESCRIPTION: &str = "Search the documentation knowledgebase (PostgreSQL and related \
products) for passages relevant to a natural-language query. Results are ranked by similarity; \
filter by project_name and project_version to narrow them down.";

pub fn schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": "Natural language search query"
            },
            "project_name": {
                "type": "string",
                "description": "Filter by project/product name, e.g. 'PostgreSQL'"
            },
            "project_version": {
                "type": "string",
                "description": "Filter by project/product version, e.g. '17'"
            },
            "top_n": {
                "type": "integer",
                "minimum": 1,
                "maximum": MAX_TOP_N,
                "default": DEFAULT_TOP_N,
                "description": "Number of results to return"
            }
        },
        "required": ["query"],
        "additionalProperties": false
    })
}

#[derive(Debug, Deserialize)]
struct Args {
    query: String,
    #[serde(default)]
    project_name: Option<String>,
    #[serde(default)]
    project_version: Option<String>,
    #[serde(default)]
    top_n: Option<u32>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub async fn run(kb: Arc<dyn KnowledgebaseReader>, args: Value) -> Result<CallToolResult, AppError> {
    let args: Args = parse_args(NAME, args)?;
    let query = args.query.trim();
    if query.is_empty() {
        return Ok(CallToolResult::error("query cannot be empty"));
    }

    let request = KbQuery {
        query: query.to_string(),
        project_name: non_empty(args.project_name),
        project_version: non_empty(args.project_version),
        top_n: args.top_n.unwrap_or(DEFAULT_TOP_N).clamp(1, MAX_TOP_N),
    };

    match kb.search(&request).await {
        Ok(results) => Ok(CallToolResult::text(format_results(&request, &results))),
        Err(e) => {
            tracing::warn!(error = %e, "knowledgebase search failed");
            Ok(CallToolResult::error(format!("Knowledgebase search failed: {}", e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kb::KbChunk;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<KbQuery>>,
    }

    #[async_trait]
    impl KnowledgebaseReader for Recording {
        async fn search(&self, query: &KbQuery) -> Result<Vec<KbChunk>, AppError> {
            self.seen.lock().unwrap().push(query.clone());
            Ok(vec![KbChunk {
                text: "VACUUM reclaims storage occupied by dead tuples.".into(),
                title: "VACUUM".into(),
                section: "SQL Commands".into(),
                project_name: "PostgreSQL".into(),
                project_version: "17".into(),
                similarity: 0.91,
            }])
        }
    }

    #[tokio::test]
    async fn test_search_normalizes_filters() {
        let kb = Arc::new(Recording::default());
        let result = run(
            kb.clone(),
            json!({"query": "  vacuum  ", "project_name": " ", "project_version": "17"}),
        )
        .await
        .unwrap();

        assert!(!result.is_error);
        assert!(result.to_text().contains("Title: VACUUM"));

        let seen = kb.seen.lock().unwrap();
        assert_eq!(seen[0].query, "vacuum");
        assert_eq!(seen[0].project_name, None);
        assert_eq!(seen[0].project_version.as_deref(), Some("17"));
        assert_eq!(seen[0].top_n, DEFAULT_TOP_N);
    }

    #[tokio::test]
    async fn test_blank_query_is_tool_error() {
        let kb = Arc::new(Recording::default());
        let result = run(kb.clone(), json!({"query": "   "})).await.unwrap();
        assert!(result.is_error);
        assert!(kb.seen.lock().unwrap().is_empty());
    }
}
