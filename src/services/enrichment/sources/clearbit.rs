//! Clearbit-Class Company Enrichment Source
//!
//! Paid adapter ($0.10/call) with high-quality B2B firmographics:
//! employee count, revenue band, founded year, industry.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::super::source::{EnrichContext, EnrichError, EnrichmentSource, SourceData, SourceTier};
use crate::services::http_call::RetryingClient;

const API_BASE: &str = "https://company.clearbit.com/v2/companies";

pub struct ClearbitSource {
    client: RetryingClient,
    api_key: Option<String>,
}

impl ClearbitSource {
    pub fn new(client: RetryingClient, api_key: Option<String>) -> Self {
        Self { client, api_key }
    }
}

#[async_trait]
impl EnrichmentSource for ClearbitSource {
    fn name(&self) -> &'static str {
        "clearbit"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::Paid
    }

    fn cost_per_call(&self) -> f64 {
        0.10
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    fn provided_fields(&self) -> &'static [&'static str] {
        &[
            "company_name",
            "legal_name",
            "description",
            "industry",
            "employee_count",
            "annual_revenue",
            "founded_year",
            "city",
            "state",
            "country",
            "linkedin_url",
        ]
    }

    async fn enrich(&self, domain: &str, _ctx: &EnrichContext) -> Result<SourceData, EnrichError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or(EnrichError::MissingApiKey("clearbit"))?;

        let url = format!("{}/find?domain={}", API_BASE, urlencoding::encode(domain));
        let headers = [("Authorization", format!("Bearer {}", api_key))];

        let response = self
            .client
            .get_json(&url, &headers, Duration::from_secs(9))
            .await?;

        let mut data = SourceData::new();

        if let Some(name) = response["name"].as_str() {
            data.insert("company_name".to_string(), Value::String(name.to_string()));
        }
        if let Some(legal) = response["legalName"].as_str() {
            data.insert("legal_name".to_string(), Value::String(legal.to_string()));
        }
        if let Some(desc) = response["description"].as_str() {
            data.insert("description".to_string(), Value::String(desc.to_string()));
        }
        if let Some(industry) = response["category"]["industry"].as_str() {
            data.insert("industry".to_string(), Value::String(industry.to_string()));
        }
        if let Some(range) = response["metrics"]["employeesRange"].as_str() {
            data.insert("employee_count".to_string(), Value::String(range.to_string()));
        } else if let Some(count) = response["metrics"]["employees"].as_i64() {
            data.insert("employee_count".to_string(), Value::String(count.to_string()));
        }
        if let Some(revenue) = response["metrics"]["estimatedAnnualRevenue"].as_str() {
            data.insert("annual_revenue".to_string(), Value::String(revenue.to_string()));
        }
        if let Some(year) = response["foundedYear"].as_i64() {
            data.insert("founded_year".to_string(), Value::String(year.to_string()));
        }
        if let Some(city) = response["geo"]["city"].as_str() {
            data.insert("city".to_string(), Value::String(city.to_string()));
        }
        if let Some(state) = response["geo"]["stateCode"].as_str() {
            data.insert("state".to_string(), Value::String(state.to_string()));
        }
        if let Some(country) = response["geo"]["countryCode"].as_str() {
            data.insert("country".to_string(), Value::String(country.to_string()));
        }
        if let Some(handle) = response["linkedin"]["handle"].as_str() {
            data.insert(
                "linkedin_url".to_string(),
                Value::String(format!("https://linkedin.com/{}", handle)),
            );
        }

        if data.is_empty() {
            return Err(EnrichError::NotFound(format!("clearbit has no record for {}", domain)));
        }
        Ok(data)
    }
}
