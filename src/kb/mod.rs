//! Read-only access to the documentation knowledgebase.
//!
//! The index itself is built offline by another service; this module only
//! queries it.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

pub const DEFAULT_TOP_N: u32 = 5;
pub const MAX_TOP_N: u32 = 20;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct KbQuery {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_version: Option<String>,
    pub top_n: u32,
}

impl KbQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            project_name: None,
            project_version: None,
            top_n: DEFAULT_TOP_N,
        }
    }
}

/// One ranked chunk of documentation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KbChunk {
    pub text: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub section: String,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub project_version: String,
    #[serde(default)]
    pub similarity: f64,
}

#[async_trait]
pub trait KnowledgebaseReader: Send + Sync {
    /// Chunks ranked by similarity, best first, at most `query.top_n`.
    async fn search(&self, query: &KbQuery) -> Result<Vec<KbChunk>, AppError>;
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<KbChunk>,
}

/// Knowledgebase served over HTTP (`POST {base}/search`).
pub struct HttpKnowledgebase {
    http: reqwest::Client,
    search_url: String,
}

impl HttpKnowledgebase {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            search_url: format!("{}/search", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl KnowledgebaseReader for HttpKnowledgebase {
    async fn search(&self, query: &KbQuery) -> Result<Vec<KbChunk>, AppError> {
        let response = self
            .http
            .post(&self.search_url)
            .json(query)
            .send()
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("knowledgebase unreachable: {}", e.without_url())))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Internal(anyhow::anyhow!(
                "knowledgebase returned HTTP {}: {}",
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            )));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("malformed knowledgebase response: {}", e)))?;

        let mut results = parsed.results;
        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(query.top_n as usize);
        Ok(results)
    }
}

/// Render results as the text handed back to the caller.
pub fn format_results(query: &KbQuery, results: &[KbChunk]) -> String {
    if results.is_empty() {
        let mut msg = format!("No results found for query: {:?}", query.query);
        if let Some(project) = &query.project_name {
            msg.push_str(&format!(" (project: {}", project));
            if let Some(version) = &query.project_version {
                msg.push_str(&format!(" {}", version));
            }
            msg.push(')');
        }
        return msg;
    }

    let rule = "=".repeat(80);
    let mut out = format!("Knowledgebase Search Results: {:?}\n", query.query);
    if let Some(project) = &query.project_name {
        out.push_str(&format!("Filter: {}", project));
        if let Some(version) = &query.project_version {
            out.push_str(&format!(" {}", version));
        }
        out.push('\n');
    }
    out.push_str(&rule);
    out.push_str(&format!("\n\nFound {} relevant chunks:\n\n", results.len()));

    for (i, chunk) in results.iter().enumerate() {
        out.push_str(&format!("Result {}/{}\n", i + 1, results.len()));
        if chunk.project_version.is_empty() {
            out.push_str(&format!("Project: {}\n", chunk.project_name));
        } else {
            out.push_str(&format!("Project: {} {}\n", chunk.project_name, chunk.project_version));
        }
        if !chunk.title.is_empty() {
            out.push_str(&format!("Title: {}\n", chunk.title));
        }
        if !chunk.section.is_empty() {
            out.push_str(&format!("Section: {}\n", chunk.section));
        }
        out.push_str(&format!("Similarity: {:.3}\n\n", chunk.similarity));
        out.push_str(&chunk.text);
        out.push_str("\n\n");
        out.push_str(&"-".repeat(80));
        out.push_str("\n\n");
    }

    out.push_str(&rule);
    out.push_str(&format!("\nTotal: {} results\n", results.len()));
    out
}
