//! Brazilian Company Registry Source
//!
//! Free adapter over a ReceitaWS-class CNPJ API. Government data: highest
//! trust for legal fields, but slow. Needs a CNPJ from context or a prior
//! enrichment layer.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::super::source::{EnrichContext, EnrichError, EnrichmentSource, SourceData, SourceTier};
use crate::services::http_call::RetryingClient;

const API_BASE: &str = "https://receitaws.com.br/v1/cnpj";

pub struct ReceitaSource {
    client: RetryingClient,
}

impl ReceitaSource {
    pub fn new(client: RetryingClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EnrichmentSource for ReceitaSource {
    fn name(&self) -> &'static str {
        "receita_ws"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::Free
    }

    fn timeout(&self) -> Duration {
        // Free tier of the registry is notoriously slow.
        Duration::from_secs(10)
    }

    fn provided_fields(&self) -> &'static [&'static str] {
        &[
            "cnpj",
            "legal_name",
            "registration_status",
            "cnae",
            "founded_year",
            "city",
            "state",
            "phone",
        ]
    }

    async fn enrich(&self, domain: &str, ctx: &EnrichContext) -> Result<SourceData, EnrichError> {
        let cnpj = ctx
            .cnpj
            .as_deref()
            .map(strip_cnpj)
            .filter(|c| c.len() == 14)
            .ok_or_else(|| {
                EnrichError::NotFound(format!("no CNPJ known for {} yet", domain))
            })?;

        let url = format!("{}/{}", API_BASE, cnpj);
        let response = self
            .client
            .get_json(&url, &[], Duration::from_secs(9))
            .await?;

        if response["status"].as_str() == Some("ERROR") {
            let message = response["message"].as_str().unwrap_or("registry error");
            return Err(EnrichError::NotFound(message.to_string()));
        }

        let mut data = SourceData::new();
        data.insert("cnpj".to_string(), Value::String(cnpj));

        if let Some(nome) = response["nome"].as_str() {
            data.insert("legal_name".to_string(), Value::String(nome.to_string()));
        }
        if let Some(situacao) = response["situacao"].as_str() {
            data.insert("registration_status".to_string(), Value::String(situacao.to_string()));
        }
        if let Some(cnae) = response["atividade_principal"][0]["code"].as_str() {
            data.insert("cnae".to_string(), Value::String(cnae.to_string()));
        }
        // "abertura" comes back as dd/mm/yyyy.
        if let Some(abertura) = response["abertura"].as_str()
            && let Some(year) = abertura.rsplit('/').next()
            && year.len() == 4
        {
            data.insert("founded_year".to_string(), Value::String(year.to_string()));
        }
        if let Some(city) = response["municipio"].as_str() {
            data.insert("city".to_string(), Value::String(city.to_string()));
        }
        if let Some(state) = response["uf"].as_str() {
            data.insert("state".to_string(), Value::String(state.to_string()));
        }
        if let Some(phone) = response["telefone"].as_str() {
            data.insert("phone".to_string(), Value::String(phone.to_string()));
        }

        Ok(data)
    }
}

/// Strip punctuation from a CNPJ (`12.345.678/0001-95` -> `12345678000195`).
pub fn strip_cnpj(cnpj: &str) -> String {
    cnpj.chars().filter(|c| c.is_ascii_digit()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_cnpj() {
        assert_eq!(strip_cnpj("12.345.678/0001-95"), "12345678000195");
        assert_eq!(strip_cnpj("12345678000195"), "12345678000195");
        assert_eq!(strip_cnpj("12.345"), "12345");
    }
}
