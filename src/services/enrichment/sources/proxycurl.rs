//! LinkedIn-Class Company Data Source
//!
//! Proxycurl-style paid adapter ($0.03/call) over LinkedIn-derived data:
//! follower counts, specialties, headcount. Slower than the rest, so it
//! carries the widest per-call timeout.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::super::source::{EnrichContext, EnrichError, EnrichmentSource, SourceData, SourceTier};
use crate::services::http_call::RetryingClient;

const API_BASE: &str = "https://nubela.co/proxycurl/api/linkedin/company";

pub struct ProxycurlSource {
    client: RetryingClient,
    api_key: Option<String>,
}

impl ProxycurlSource {
    pub fn new(client: RetryingClient, api_key: Option<String>) -> Self {
        Self { client, api_key }
    }
}

#[async_trait]
impl EnrichmentSource for ProxycurlSource {
    fn name(&self) -> &'static str {
        "proxycurl"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::Paid
    }

    fn cost_per_call(&self) -> f64 {
        0.03
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(15)
    }

    fn provided_fields(&self) -> &'static [&'static str] {
        &["linkedin_url", "linkedin_followers", "specialties", "employee_count", "industry", "description"]
    }

    async fn enrich(&self, domain: &str, ctx: &EnrichContext) -> Result<SourceData, EnrichError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or(EnrichError::MissingApiKey("proxycurl"))?;

        let linkedin_url = ctx
            .linkedin_url
            .clone()
            .ok_or_else(|| EnrichError::NotFound(format!("no LinkedIn URL known for {}", domain)))?;

        let url = format!("{}?url={}", API_BASE, urlencoding::encode(&linkedin_url));
        let headers = [("Authorization", format!("Bearer {}", api_key))];

        let response = self
            .client
            .get_json(&url, &headers, Duration::from_secs(14))
            .await?;

        let mut data = SourceData::new();
        data.insert("linkedin_url".to_string(), Value::String(linkedin_url));

        if let Some(followers) = response["follower_count"].as_i64() {
            data.insert("linkedin_followers".to_string(), Value::from(followers));
        }
        if let Some(specialties) = response["specialities"].as_array() {
            let list: Vec<Value> = specialties
                .iter()
                .filter(|v| v.is_string())
                .cloned()
                .collect();
            if !list.is_empty() {
                data.insert("specialties".to_string(), Value::Array(list));
            }
        }
        if let Some(industry) = response["industry"].as_str() {
            data.insert("industry".to_string(), Value::String(industry.to_string()));
        }
        if let Some(description) = response["description"].as_str() {
            data.insert("description".to_string(), Value::String(description.to_string()));
        }
        // company_size comes as [min, max].
        if let Some(range) = response["company_size"].as_array()
            && range.len() == 2
            && let (Some(min), Some(max)) = (range[0].as_i64(), range[1].as_i64())
        {
            data.insert("employee_count".to_string(), Value::String(format!("{}-{}", min, max)));
        }

        Ok(data)
    }
}
