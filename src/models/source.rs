//! Source Result Model
//!
//! The uniform envelope every data-source adapter emits, successful or not.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Classification of adapter failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceErrorType {
    Timeout,
    Http4xx,
    Http5xx,
    DnsError,
    RateLimit,
    AuthError,
    CircuitOpen,
    NotFound,
    InvalidResponse,
    Unknown,
}

impl SourceErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Http4xx => "http_4xx",
            Self::Http5xx => "http_5xx",
            Self::DnsError => "dns_error",
            Self::RateLimit => "rate_limit",
            Self::AuthError => "auth_error",
            Self::CircuitOpen => "circuit_open",
            Self::NotFound => "not_found",
            Self::InvalidResponse => "invalid_response",
            Self::Unknown => "unknown",
        }
    }
}

/// Standardized result from any enrichment source.
///
/// Invariant: `success == false` implies `cost_usd == 0` and empty `data`.
/// The constructors below are the only way the crate builds these, so the
/// invariant holds everywhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceResult {
    pub source_name: String,
    pub success: bool,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub error_message: Option<String>,
    pub error_type: Option<SourceErrorType>,
    pub duration_ms: u64,
    pub cost_usd: f64,
    pub cached: bool,
}

impl SourceResult {
    pub fn ok(
        source_name: impl Into<String>,
        data: Map<String, Value>,
        duration_ms: u64,
        cost_usd: f64,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            success: true,
            data,
            error_message: None,
            error_type: None,
            duration_ms,
            cost_usd,
            cached: false,
        }
    }

    pub fn failure(
        source_name: impl Into<String>,
        error_type: SourceErrorType,
        message: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            success: false,
            data: Map::new(),
            error_message: Some(message.into()),
            error_type: Some(error_type),
            duration_ms,
            cost_usd: 0.0,
            cached: false,
        }
    }

    pub fn into_cached(mut self) -> Self {
        self.cached = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_has_no_cost_and_no_data() {
        let r = SourceResult::failure("clearbit", SourceErrorType::Http4xx, "404", 120);
        assert!(!r.success);
        assert_eq!(r.cost_usd, 0.0);
        assert!(r.data.is_empty());
        assert_eq!(r.error_type, Some(SourceErrorType::Http4xx));
    }

    #[test]
    fn test_error_type_serializes_snake_case() {
        let json = serde_json::to_string(&SourceErrorType::CircuitOpen).unwrap();
        assert_eq!(json, "\"circuit_open\"");
        assert_eq!(SourceErrorType::Http5xx.as_str(), "http_5xx");
    }
}
