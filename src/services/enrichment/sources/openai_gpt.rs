//! Premium Deep-Analysis Source
//!
//! OpenAI-GPT-class adapter that synthesizes a qualitative read (insights,
//! quick SWOT, recommendations) over everything the other sources found.
//! Premium tier: only selected under the highest budget.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

use super::super::source::{EnrichContext, EnrichError, EnrichmentSource, SourceData, SourceTier};
use crate::services::http_call::RetryingClient;
use crate::services::llm::clean_json_response;

const API_BASE: &str = "https://api.openai.com/v1";
const MODEL: &str = "gpt-4o-mini";

pub struct OpenAiGptSource {
    client: RetryingClient,
    api_key: Option<String>,
}

impl OpenAiGptSource {
    pub fn new(client: RetryingClient, api_key: Option<String>) -> Self {
        Self { client, api_key }
    }
}

#[async_trait]
impl EnrichmentSource for OpenAiGptSource {
    fn name(&self) -> &'static str {
        "openai_gpt"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::Premium
    }

    fn cost_per_call(&self) -> f64 {
        0.01
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(15)
    }

    fn provided_fields(&self) -> &'static [&'static str] {
        &["ai_insights", "ai_swot", "ai_recommendations"]
    }

    async fn enrich(&self, domain: &str, ctx: &EnrichContext) -> Result<SourceData, EnrichError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or(EnrichError::MissingApiKey("openai_gpt"))?;

        let company = ctx.company.as_deref().unwrap_or(domain);
        let prompt = format!(
            "Company '{}' ({}). Produce a short qualitative analysis as JSON only: \
             {{\"ai_insights\": [\"...\"], \
             \"ai_swot\": {{\"strengths\": [], \"weaknesses\": [], \"opportunities\": [], \"threats\": []}}, \
             \"ai_recommendations\": [\"...\"]}}",
            company, domain
        );

        let body = json!({
            "model": MODEL,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.4,
            "max_tokens": 700,
        });
        let headers = [("Authorization", format!("Bearer {}", api_key))];

        let response = self
            .client
            .post_json(
                &format!("{}/chat/completions", API_BASE),
                &headers,
                &body,
                Duration::from_secs(14),
            )
            .await?;

        let content = response["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| EnrichError::InvalidResponse("empty analysis response".to_string()))?;

        let parsed: Value = serde_json::from_str(&clean_json_response(content))
            .map_err(|e| EnrichError::InvalidResponse(e.to_string()))?;

        let mut data = SourceData::new();
        for field in self.provided_fields() {
            if let Some(v) = parsed.get(*field).filter(|v| !v.is_null()) {
                data.insert(field.to_string(), v.clone());
            }
        }

        if data.is_empty() {
            return Err(EnrichError::InvalidResponse("analysis returned no fields".to_string()));
        }
        Ok(data)
    }
}
