//! Real-Time Research Provider
//!
//! Perplexity-class provider used by Stage 2 for targeted follow-up
//! research. Behind a trait so the pipeline runs without it (follow-up is
//! optional) and tests can script answers.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use super::models::LlmError;
use crate::services::http_call::RetryingClient;

#[async_trait]
pub trait ResearchProvider: Send + Sync {
    /// Run one research query and return the answer text.
    async fn research(&self, query: &str, max_tokens: u32) -> Result<String, LlmError>;
}

/// HTTP provider for a Perplexity-style online model.
pub struct PerplexityProvider {
    client: RetryingClient,
    api_base: String,
    api_key: Option<String>,
    model: String,
}

impl PerplexityProvider {
    pub fn new(client: RetryingClient, api_base: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            api_base: api_base.into(),
            api_key,
            model: "perplexity/sonar".to_string(),
        }
    }
}

#[async_trait]
impl ResearchProvider for PerplexityProvider {
    async fn research(&self, query: &str, max_tokens: u32) -> Result<String, LlmError> {
        let api_key = self.api_key.as_ref().ok_or(LlmError::MissingApiKey)?;

        let url = format!("{}/chat/completions", self.api_base.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": query}],
            "max_tokens": max_tokens,
        });
        let headers = [("Authorization", format!("Bearer {}", api_key))];

        let response = self
            .client
            .post_json(&url, &headers, &body, Duration::from_secs(120))
            .await
            .map_err(|e| LlmError::Api(e.to_string()))?;

        response["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| LlmError::Parse("Empty research response".to_string()))
    }
}
