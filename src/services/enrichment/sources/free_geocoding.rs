//! Free Geocoding Source
//!
//! Nominatim first (usage policy: at most 1 request/second, enforced here
//! process-wide), with OpenCage and Geoapify free tiers as alternates when
//! keys are configured.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::super::source::{EnrichContext, EnrichError, EnrichmentSource, SourceData, SourceTier};
use crate::services::http_call::RetryingClient;

/// Process-wide timestamp of the last Nominatim request. The usage policy
/// applies per client IP, not per pipeline.
static LAST_NOMINATIM_REQUEST: Lazy<Mutex<Option<Instant>>> = Lazy::new(|| Mutex::new(None));

const NOMINATIM_MIN_INTERVAL: Duration = Duration::from_secs(1);

pub struct FreeGeocodingSource {
    client: RetryingClient,
    opencage_key: Option<String>,
    geoapify_key: Option<String>,
}

impl FreeGeocodingSource {
    pub fn new(
        client: RetryingClient,
        opencage_key: Option<String>,
        geoapify_key: Option<String>,
    ) -> Self {
        Self { client, opencage_key, geoapify_key }
    }

    async fn geocode_nominatim(&self, address: &str) -> Result<SourceData, EnrichError> {
        throttle_nominatim().await;

        let url = format!(
            "https://nominatim.openstreetmap.org/search?q={}&format=json&addressdetails=1&limit=1",
            urlencoding::encode(address)
        );
        let headers = [("User-Agent", "Bussola/1.0 (strategy analysis)".to_string())];

        let response = self
            .client
            .get_json(&url, &headers, Duration::from_secs(8))
            .await?;

        let hit = response[0]
            .as_object()
            .ok_or_else(|| EnrichError::NotFound(format!("no geocoding match for '{}'", address)))?;

        let mut data = SourceData::new();
        if let Some(lat) = hit.get("lat").and_then(|v| v.as_str()) {
            data.insert("latitude".to_string(), Value::String(lat.to_string()));
        }
        if let Some(lon) = hit.get("lon").and_then(|v| v.as_str()) {
            data.insert("longitude".to_string(), Value::String(lon.to_string()));
        }
        if let Some(display) = hit.get("display_name").and_then(|v| v.as_str()) {
            data.insert("address".to_string(), Value::String(display.to_string()));
        }
        if let Some(details) = hit.get("address").and_then(|v| v.as_object()) {
            let city = details
                .get("city")
                .or_else(|| details.get("town"))
                .or_else(|| details.get("municipality"))
                .and_then(|v| v.as_str());
            if let Some(city) = city {
                data.insert("city".to_string(), Value::String(city.to_string()));
            }
            if let Some(state) = details.get("state").and_then(|v| v.as_str()) {
                data.insert("state".to_string(), Value::String(state.to_string()));
            }
            if let Some(country) = details.get("country_code").and_then(|v| v.as_str()) {
                data.insert("country".to_string(), Value::String(country.to_uppercase()));
            }
        }

        Ok(data)
    }

    async fn geocode_opencage(&self, address: &str, key: &str) -> Result<SourceData, EnrichError> {
        let url = format!(
            "https://api.opencagedata.com/geocode/v1/json?q={}&key={}&limit=1",
            urlencoding::encode(address),
            key
        );
        let response = self
            .client
            .get_json(&url, &[], Duration::from_secs(8))
            .await?;

        let hit = &response["results"][0];
        if hit.is_null() {
            return Err(EnrichError::NotFound(format!("no opencage match for '{}'", address)));
        }

        let mut data = SourceData::new();
        if let Some(lat) = hit["geometry"]["lat"].as_f64() {
            data.insert("latitude".to_string(), Value::String(lat.to_string()));
        }
        if let Some(lon) = hit["geometry"]["lng"].as_f64() {
            data.insert("longitude".to_string(), Value::String(lon.to_string()));
        }
        if let Some(formatted) = hit["formatted"].as_str() {
            data.insert("address".to_string(), Value::String(formatted.to_string()));
        }
        if let Some(city) = hit["components"]["city"].as_str() {
            data.insert("city".to_string(), Value::String(city.to_string()));
        }
        if let Some(state) = hit["components"]["state"].as_str() {
            data.insert("state".to_string(), Value::String(state.to_string()));
        }
        if let Some(country) = hit["components"]["country_code"].as_str() {
            data.insert("country".to_string(), Value::String(country.to_uppercase()));
        }

        Ok(data)
    }

    async fn geocode_geoapify(&self, address: &str, key: &str) -> Result<SourceData, EnrichError> {
        let url = format!(
            "https://api.geoapify.com/v1/geocode/search?text={}&apiKey={}&limit=1",
            urlencoding::encode(address),
            key
        );
        let response = self
            .client
            .get_json(&url, &[], Duration::from_secs(8))
            .await?;

        let props = &response["features"][0]["properties"];
        if props.is_null() {
            return Err(EnrichError::NotFound(format!("no geoapify match for '{}'", address)));
        }

        let mut data = SourceData::new();
        for (from, to) in
            [("lat", "latitude"), ("lon", "longitude")]
        {
            if let Some(v) = props[from].as_f64() {
                data.insert(to.to_string(), Value::String(v.to_string()));
            }
        }
        for (from, to) in [
            ("formatted", "address"),
            ("city", "city"),
            ("state", "state"),
            ("country_code", "country"),
        ] {
            if let Some(v) = props[from].as_str() {
                data.insert(to.to_string(), Value::String(v.to_string()));
            }
        }

        Ok(data)
    }
}

#[async_trait]
impl EnrichmentSource for FreeGeocodingSource {
    fn name(&self) -> &'static str {
        "free_geocoding"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::Free
    }

    fn timeout(&self) -> Duration {
        // Throttle wait plus three possible backends.
        Duration::from_secs(30)
    }

    fn provided_fields(&self) -> &'static [&'static str] {
        &["latitude", "longitude", "address", "city", "state", "country"]
    }

    async fn enrich(&self, domain: &str, ctx: &EnrichContext) -> Result<SourceData, EnrichError> {
        let address = ctx
            .address
            .as_deref()
            .ok_or_else(|| EnrichError::NotFound(format!("no address known for {}", domain)))?;

        match self.geocode_nominatim(address).await {
            Ok(data) => return Ok(data),
            Err(e) => tracing::debug!("nominatim failed for '{}': {}", address, e),
        }

        if let Some(key) = self.opencage_key.clone() {
            match self.geocode_opencage(address, &key).await {
                Ok(data) => return Ok(data),
                Err(e) => tracing::debug!("opencage failed for '{}': {}", address, e),
            }
        }

        if let Some(key) = self.geoapify_key.clone() {
            match self.geocode_geoapify(address, &key).await {
                Ok(data) => return Ok(data),
                Err(e) => tracing::debug!("geoapify failed for '{}': {}", address, e),
            }
        }

        Err(EnrichError::NotFound(format!("all geocoders failed for '{}'", address)))
    }
}

/// Enforce the 1 req/s Nominatim policy across any burst of callers.
async fn throttle_nominatim() {
    let mut last = LAST_NOMINATIM_REQUEST.lock().await;
    if let Some(previous) = *last {
        let elapsed = previous.elapsed();
        if elapsed < NOMINATIM_MIN_INTERVAL {
            tokio::time::sleep(NOMINATIM_MIN_INTERVAL - elapsed).await;
        }
    }
    *last = Some(Instant::now());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_throttle_enforces_one_request_per_second() {
        // Reset shared state so other tests cannot interfere.
        *LAST_NOMINATIM_REQUEST.lock().await = None;

        let start = Instant::now();
        throttle_nominatim().await;
        throttle_nominatim().await;
        throttle_nominatim().await;

        // Three acquisitions = at least two full intervals.
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
