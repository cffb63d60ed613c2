//! IP Geolocation Source
//!
//! Free adapter: resolves the domain's A record, then asks a free IP info
//! API for approximate location. Low trust, but always available.

use async_trait::async_trait;
use serde_json::Value;
use std::net::ToSocketAddrs;
use std::time::Duration;

use super::super::source::{EnrichContext, EnrichError, EnrichmentSource, SourceData, SourceTier};
use crate::services::http_call::RetryingClient;

pub struct IpApiSource {
    client: RetryingClient,
}

impl IpApiSource {
    pub fn new(client: RetryingClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EnrichmentSource for IpApiSource {
    fn name(&self) -> &'static str {
        "ip_api"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::Free
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    fn provided_fields(&self) -> &'static [&'static str] {
        &["ip_location", "timezone", "isp", "country", "city"]
    }

    async fn enrich(&self, domain: &str, _ctx: &EnrichContext) -> Result<SourceData, EnrichError> {
        let ip = resolve_a_record(domain).await?;

        let url = format!("http://ip-api.com/json/{}", ip);
        let response = self
            .client
            .get_json(&url, &[], Duration::from_secs(4))
            .await?;

        if response["status"].as_str() == Some("fail") {
            return Err(EnrichError::NotFound(format!("no geo data for {}", ip)));
        }

        let mut data = SourceData::new();

        let city = response["city"].as_str().unwrap_or_default();
        let country = response["country"].as_str().unwrap_or_default();
        if !city.is_empty() || !country.is_empty() {
            data.insert(
                "ip_location".to_string(),
                Value::String(format!("{}, {}", city, country).trim_matches([',', ' ']).to_string()),
            );
        }
        if !city.is_empty() {
            data.insert("city".to_string(), Value::String(city.to_string()));
        }
        if let Some(country_code) = response["countryCode"].as_str() {
            data.insert("country".to_string(), Value::String(country_code.to_string()));
        }
        if let Some(tz) = response["timezone"].as_str() {
            data.insert("timezone".to_string(), Value::String(tz.to_string()));
        }
        if let Some(isp) = response["isp"].as_str() {
            data.insert("isp".to_string(), Value::String(isp.to_string()));
        }

        Ok(data)
    }
}

async fn resolve_a_record(domain: &str) -> Result<String, EnrichError> {
    let host = format!("{}:443", domain);
    let addrs = tokio::task::spawn_blocking(move || host.to_socket_addrs())
        .await
        .map_err(|e| EnrichError::Other(e.to_string()))?
        .map_err(|e| EnrichError::Dns(e.to_string()))?;

    addrs
        .filter(|a| a.is_ipv4())
        .map(|a| a.ip().to_string())
        .next()
        .ok_or_else(|| EnrichError::Dns(format!("no A record for {}", domain)))
}
