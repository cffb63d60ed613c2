//! Free Company Registry Source
//!
//! OpenCorporates-class adapter. Free company registry lookups by name;
//! good for static fields (legal name, jurisdiction, registration status).

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::super::source::{EnrichContext, EnrichError, EnrichmentSource, SourceData, SourceTier};
use crate::services::http_call::RetryingClient;

const API_BASE: &str = "https://api.opencorporates.com/v0.4";

pub struct FreeCompanyDataSource {
    client: RetryingClient,
    api_token: Option<String>,
}

impl FreeCompanyDataSource {
    pub fn new(client: RetryingClient, api_token: Option<String>) -> Self {
        Self { client, api_token }
    }
}

#[async_trait]
impl EnrichmentSource for FreeCompanyDataSource {
    fn name(&self) -> &'static str {
        "free_company_data"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::Free
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    fn provided_fields(&self) -> &'static [&'static str] {
        &[
            "legal_name",
            "company_number",
            "jurisdiction",
            "registration_status",
            "opencorporates_url",
            "founded_year",
        ]
    }

    async fn enrich(&self, domain: &str, ctx: &EnrichContext) -> Result<SourceData, EnrichError> {
        let query = ctx
            .company
            .as_deref()
            .unwrap_or_else(|| domain.split('.').next().unwrap_or(domain));

        let mut url = format!(
            "{}/companies/search?q={}&order=score",
            API_BASE,
            urlencoding::encode(query)
        );
        if let Some(token) = &self.api_token {
            url.push_str(&format!("&api_token={}", token));
        }

        let response = self
            .client
            .get_json(&url, &[], Duration::from_secs(9))
            .await?;

        let company = response["results"]["companies"][0]["company"]
            .as_object()
            .ok_or_else(|| EnrichError::NotFound(format!("no registry match for '{}'", query)))?;

        let mut data = SourceData::new();

        let mappings = [
            ("name", "legal_name"),
            ("company_number", "company_number"),
            ("jurisdiction_code", "jurisdiction"),
            ("current_status", "registration_status"),
            ("opencorporates_url", "opencorporates_url"),
        ];
        for (from, to) in mappings {
            if let Some(v) = company.get(from).and_then(|v| v.as_str()) {
                data.insert(to.to_string(), Value::String(v.to_string()));
            }
        }

        if let Some(date) = company
            .get("incorporation_date")
            .and_then(|v| v.as_str())
            && let Some(year) = date.split('-').next()
        {
            data.insert("founded_year".to_string(), Value::String(year.to_string()));
        }

        Ok(data)
    }
}
