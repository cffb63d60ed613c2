//! Free AI Inference Source
//!
//! Groq-class free inference endpoint that infers soft company attributes
//! (industry, audience, digital maturity) from the domain and whatever the
//! free scrapers already collected.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

use super::super::source::{EnrichContext, EnrichError, EnrichmentSource, SourceData, SourceTier};
use crate::services::http_call::RetryingClient;
use crate::services::llm::clean_json_response;

const API_BASE: &str = "https://api.groq.com/openai/v1";
const MODEL: &str = "llama-3.3-70b-versatile";

pub struct GroqAiSource {
    client: RetryingClient,
    api_key: Option<String>,
}

impl GroqAiSource {
    pub fn new(client: RetryingClient, api_key: Option<String>) -> Self {
        Self { client, api_key }
    }
}

#[async_trait]
impl EnrichmentSource for GroqAiSource {
    fn name(&self) -> &'static str {
        "groq_ai"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::Free
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    fn provided_fields(&self) -> &'static [&'static str] {
        &["ai_industry", "ai_target_audience", "ai_digital_maturity", "ai_competitive_position"]
    }

    async fn enrich(&self, domain: &str, ctx: &EnrichContext) -> Result<SourceData, EnrichError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or(EnrichError::MissingApiKey("groq_ai"))?;

        let company = ctx.company.as_deref().unwrap_or(domain);
        let prompt = format!(
            "Company: {} (domain {}). Infer the most likely values and answer with JSON only: \
             {{\"ai_industry\": \"...\", \"ai_target_audience\": \"B2B|B2C|B2B2C\", \
             \"ai_digital_maturity\": \"Alta|Média|Baixa\", \
             \"ai_competitive_position\": \"...\"}}",
            company, domain
        );

        let body = json!({
            "model": MODEL,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.2,
            "max_tokens": 300,
        });
        let headers = [("Authorization", format!("Bearer {}", api_key))];

        let response = self
            .client
            .post_json(
                &format!("{}/chat/completions", API_BASE),
                &headers,
                &body,
                Duration::from_secs(9),
            )
            .await?;

        let content = response["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| EnrichError::InvalidResponse("empty inference response".to_string()))?;

        let parsed: Value = serde_json::from_str(&clean_json_response(content))
            .map_err(|e| EnrichError::InvalidResponse(e.to_string()))?;

        let mut data = SourceData::new();
        for field in self.provided_fields() {
            if let Some(v) = parsed.get(*field).filter(|v| !v.is_null()) {
                data.insert(field.to_string(), v.clone());
            }
        }

        if data.is_empty() {
            return Err(EnrichError::InvalidResponse("inference returned no fields".to_string()));
        }
        Ok(data)
    }
}
