//! Google-Places-Class Location Verification Source
//!
//! Paid adapter ($0.02/call). Finds the business listing by name and
//! returns verified rating, review count, phone and address data.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::super::source::{EnrichContext, EnrichError, EnrichmentSource, SourceData, SourceTier};
use crate::services::http_call::RetryingClient;

const API_BASE: &str = "https://maps.googleapis.com/maps/api/place";

pub struct GooglePlacesSource {
    client: RetryingClient,
    api_key: Option<String>,
}

impl GooglePlacesSource {
    pub fn new(client: RetryingClient, api_key: Option<String>) -> Self {
        Self { client, api_key }
    }
}

#[async_trait]
impl EnrichmentSource for GooglePlacesSource {
    fn name(&self) -> &'static str {
        "google_places"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::Paid
    }

    fn cost_per_call(&self) -> f64 {
        0.02
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    fn provided_fields(&self) -> &'static [&'static str] {
        &["rating", "reviews_count", "phone", "address", "place_id"]
    }

    async fn enrich(&self, domain: &str, ctx: &EnrichContext) -> Result<SourceData, EnrichError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or(EnrichError::MissingApiKey("google_places"))?;

        let query = ctx.company.as_deref().unwrap_or(domain);

        let find_url = format!(
            "{}/findplacefromtext/json?input={}&inputtype=textquery&fields=place_id&key={}",
            API_BASE,
            urlencoding::encode(query),
            api_key
        );
        let found = self
            .client
            .get_json(&find_url, &[], Duration::from_secs(4))
            .await?;

        let place_id = found["candidates"][0]["place_id"]
            .as_str()
            .ok_or_else(|| EnrichError::NotFound(format!("no place found for '{}'", query)))?
            .to_string();

        let details_url = format!(
            "{}/details/json?place_id={}&fields=rating,user_ratings_total,formatted_phone_number,formatted_address&key={}",
            API_BASE, place_id, api_key
        );
        let details = self
            .client
            .get_json(&details_url, &[], Duration::from_secs(4))
            .await?;

        let result = &details["result"];
        let mut data = SourceData::new();
        data.insert("place_id".to_string(), Value::String(place_id));

        if let Some(rating) = result["rating"].as_f64() {
            data.insert("rating".to_string(), Value::from(rating));
        }
        if let Some(reviews) = result["user_ratings_total"].as_i64() {
            data.insert("reviews_count".to_string(), Value::from(reviews));
        }
        if let Some(phone) = result["formatted_phone_number"].as_str() {
            data.insert("phone".to_string(), Value::String(phone.to_string()));
        }
        if let Some(address) = result["formatted_address"].as_str() {
            data.insert("address".to_string(), Value::String(address.to_string()));
        }

        Ok(data)
    }
}
