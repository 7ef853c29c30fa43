//! LLM gateway: provider clients behind one trait, plus the tool-calling
//! conversation loop.

pub mod anthropic;
pub mod conversation;
pub mod ollama;
pub mod openai;
pub mod retry;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::errors::AppError;
use crate::models::llm::{LlmErrorType, LlmResponse, Message, ToolSpec};

pub use conversation::{run_conversation, ConversationOutcome};
pub use retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    Ollama,
}

impl ProviderKind {
    /// Order used when no default provider is configured.
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::Anthropic,
        ProviderKind::OpenAi,
        ProviderKind::Ollama,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Ollama => "ollama",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "Anthropic Claude",
            ProviderKind::OpenAi => "OpenAI",
            ProviderKind::Ollama => "Ollama",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "claude-sonnet-4-5",
            ProviderKind::OpenAi => "gpt-4o",
            ProviderKind::Ollama => "llama3.1",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "openai" => Ok(ProviderKind::OpenAi),
            "ollama" => Ok(ProviderKind::Ollama),
            other => Err(format!(
                "unknown LLM provider '{}' (expected anthropic, openai or ollama)",
                other
            )),
        }
    }
}

/// Sampling settings shared by every client.
#[derive(Debug, Clone, Copy)]
pub struct Sampling {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl From<&LlmConfig> for Sampling {
    fn from(cfg: &LlmConfig) -> Self {
        Self {
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
        }
    }
}

/// One upstream chat backend.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn default_model(&self) -> &str;

    /// Single model turn. `model` overrides the client default.
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        model: Option<&str>,
    ) -> Result<LlmResponse, AppError>;

    async fn list_models(&self) -> Result<Vec<String>, AppError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub name: ProviderKind,
    pub display: &'static str,
    #[serde(rename = "isDefault")]
    pub is_default: bool,
    #[serde(rename = "defaultModel")]
    pub default_model: String,
}

/// The configured providers, with a default.
#[derive(Clone, Default)]
pub struct LlmGateway {
    default: Option<ProviderKind>,
    providers: Vec<Arc<dyn ChatProvider>>,
}

impl LlmGateway {
    pub fn from_config(cfg: &LlmConfig) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to build HTTP client: {}", e)))?;
        let sampling = Sampling::from(cfg);
        let retry = RetryPolicy::with_max_retries(cfg.max_retries);

        // An explicit model applies to the default provider only.
        let model_for = |kind: ProviderKind| -> String {
            match (&cfg.model, cfg.provider) {
                (Some(model), Some(default)) if default == kind => model.clone(),
                (Some(model), None) => model.clone(),
                _ => kind.default_model().to_string(),
            }
        };

        let mut providers: Vec<Arc<dyn ChatProvider>> = Vec::new();
        if let Some(key) = &cfg.anthropic_api_key {
            providers.push(Arc::new(anthropic::AnthropicClient::new(
                http.clone(),
                &cfg.anthropic_base_url,
                key,
                model_for(ProviderKind::Anthropic),
                sampling,
                retry.clone(),
            )));
        }
        if let Some(key) = &cfg.openai_api_key {
            providers.push(Arc::new(openai::OpenAiClient::new(
                http.clone(),
                &cfg.openai_base_url,
                key,
                model_for(ProviderKind::OpenAi),
                sampling,
                retry.clone(),
            )));
        }
        if let Some(url) = &cfg.ollama_url {
            providers.push(Arc::new(ollama::OllamaClient::new(
                http.clone(),
                url,
                model_for(ProviderKind::Ollama),
                sampling,
                retry.clone(),
            )));
        }

        let gateway = Self::with_providers(cfg.provider, providers);
        match (cfg.provider, gateway.default) {
            (Some(kind), _) if !gateway.is_configured(kind) => {
                tracing::warn!(provider = %kind, "default LLM provider is not configured");
            }
            (_, None) => tracing::info!("no LLM provider configured, chat is disabled"),
            (_, Some(kind)) => tracing::info!(provider = %kind, "LLM gateway ready"),
        }
        Ok(gateway)
    }

    /// Build from ready clients. Without an explicit default, the first
    /// client in `ProviderKind::ALL` order is used.
    pub fn with_providers(
        default: Option<ProviderKind>,
        providers: Vec<Arc<dyn ChatProvider>>,
    ) -> Self {
        let default = default.or_else(|| {
            ProviderKind::ALL
                .into_iter()
                .find(|kind| providers.iter().any(|p| p.kind() == *kind))
        });
        Self { default, providers }
    }

    pub fn default_kind(&self) -> Option<ProviderKind> {
        self.default
    }

    pub fn is_configured(&self, kind: ProviderKind) -> bool {
        self.providers.iter().any(|p| p.kind() == kind)
    }

    pub fn providers(&self) -> Vec<ProviderInfo> {
        ProviderKind::ALL
            .into_iter()
            .filter_map(|kind| self.providers.iter().find(|p| p.kind() == kind))
            .map(|p| ProviderInfo {
                name: p.kind(),
                display: p.kind().display_name(),
                is_default: Some(p.kind()) == self.default,
                default_model: p.default_model().to_string(),
            })
            .collect()
    }

    /// Resolve a provider, falling back to the default.
    pub fn provider(&self, kind: Option<ProviderKind>) -> Result<Arc<dyn ChatProvider>, AppError> {
        let kind = kind.or(self.default).ok_or_else(|| {
            AppError::upstream("none", LlmErrorType::NotConfigured, "no LLM provider is configured")
        })?;
        self.providers
            .iter()
            .find(|p| p.kind() == kind)
            .cloned()
            .ok_or_else(|| {
                AppError::upstream(
                    kind.as_str(),
                    LlmErrorType::NotConfigured,
                    format!("{} is not configured", kind.display_name()),
                )
            })
    }

    pub async fn chat(
        &self,
        kind: Option<ProviderKind>,
        messages: &[Message],
        tools: &[ToolSpec],
        model: Option<&str>,
    ) -> Result<LlmResponse, AppError> {
        self.provider(kind)?.chat(messages, tools, model).await
    }

    pub async fn list_models(&self, kind: Option<ProviderKind>) -> Result<Vec<String>, AppError> {
        let mut models = self.provider(kind)?.list_models().await?;
        models.sort();
        models.dedup();
        Ok(models)
    }
}

/// Join a base URL and a path without doubling slashes.
pub(crate) fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::llm::StopReason;

    struct Fixed(ProviderKind);

    #[async_trait]
    impl ChatProvider for Fixed {
        fn kind(&self) -> ProviderKind {
            self.0
        }

        fn default_model(&self) -> &str {
            self.0.default_model()
        }

        async fn chat(
            &self,
            _messages: &[Message],
            _tools: &[ToolSpec],
            model: Option<&str>,
        ) -> Result<LlmResponse, AppError> {
            Ok(LlmResponse {
                content: self.0.as_str().to_string(),
                tool_calls: Vec::new(),
                stop_reason: StopReason::EndTurn,
                model: model.unwrap_or(self.default_model()).to_string(),
                usage: None,
            })
        }

        async fn list_models(&self) -> Result<Vec<String>, AppError> {
            Ok(vec!["b".into(), "a".into(), "b".into()])
        }
    }

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!("OpenAI".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert_eq!(" ollama ".parse::<ProviderKind>().unwrap(), ProviderKind::Ollama);
        assert!("gemini".parse::<ProviderKind>().is_err());
        assert_eq!(serde_json::to_value(ProviderKind::OpenAi).unwrap(), "openai");
    }

    #[test]
    fn test_default_follows_provider_order() {
        let gateway = LlmGateway::with_providers(
            None,
            vec![
                Arc::new(Fixed(ProviderKind::Ollama)),
                Arc::new(Fixed(ProviderKind::OpenAi)),
            ],
        );
        assert_eq!(gateway.default_kind(), Some(ProviderKind::OpenAi));

        let infos = gateway.providers();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].name, ProviderKind::OpenAi);
        assert!(infos[0].is_default);
        assert!(!infos[1].is_default);
    }

    #[tokio::test]
    async fn test_explicit_provider_and_fallback() {
        let gateway = LlmGateway::with_providers(
            Some(ProviderKind::Ollama),
            vec![
                Arc::new(Fixed(ProviderKind::Anthropic)),
                Arc::new(Fixed(ProviderKind::Ollama)),
            ],
        );
        let resp = gateway.chat(None, &[], &[], None).await.unwrap();
        assert_eq!(resp.content, "ollama");

        let resp = gateway
            .chat(Some(ProviderKind::Anthropic), &[], &[], Some("claude-x"))
            .await
            .unwrap();
        assert_eq!(resp.model, "claude-x");

        let models = gateway.list_models(None).await.unwrap();
        assert_eq!(models, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_unconfigured_provider_errors() {
        let gateway = LlmGateway::default();
        let err = gateway.chat(None, &[], &[], None).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::UpstreamProvider { class: LlmErrorType::NotConfigured, .. }
        ));

        let gateway = LlmGateway::with_providers(None, vec![Arc::new(Fixed(ProviderKind::Ollama))]);
        let err = gateway
            .chat(Some(ProviderKind::OpenAi), &[], &[], None)
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("OpenAI is not configured"));
    }

    #[test]
    fn test_endpoint_join() {
        assert_eq!(endpoint("http://x/", "/v1/models"), "http://x/v1/models");
        assert_eq!(endpoint("http://x", "api/tags"), "http://x/api/tags");
    }
}
