//! Enrichment Source Trait
//!
//! Every external data provider implements `EnrichmentSource`. The
//! monitoring wrapper checks the circuit breaker, times the call, records
//! breaker outcomes and always produces a `SourceResult` - adapters never
//! leak errors to the fan-out.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::{Duration, Instant};

use crate::models::{SourceErrorType, SourceResult};
use crate::services::circuit_breaker::BreakerRegistry;
use crate::services::http_call::HttpCallError;

/// Normalized field payload produced by an adapter.
pub type SourceData = Map<String, Value>;

/// Budget tier an adapter belongs to. The selection policy decides which
/// tiers are callable under a given budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTier {
    Free,
    Paid,
    Premium,
}

impl SourceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Paid => "paid",
            Self::Premium => "premium",
        }
    }
}

/// Adapter failure, mapped onto the shared error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum EnrichError {
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("rate limited")]
    RateLimited,

    #[error("API key not configured for {0}")]
    MissingApiKey(&'static str),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Other(String),
}

impl EnrichError {
    pub fn error_type(&self) -> SourceErrorType {
        match self {
            Self::Timeout(_) => SourceErrorType::Timeout,
            Self::Http { status, .. } if *status >= 500 => SourceErrorType::Http5xx,
            Self::Http { status, .. } if *status == 401 || *status == 403 => {
                SourceErrorType::AuthError
            },
            Self::Http { status, .. } if *status == 404 => SourceErrorType::NotFound,
            Self::Http { .. } => SourceErrorType::Http4xx,
            Self::Dns(_) => SourceErrorType::DnsError,
            Self::RateLimited => SourceErrorType::RateLimit,
            Self::MissingApiKey(_) => SourceErrorType::AuthError,
            Self::NotFound(_) => SourceErrorType::NotFound,
            Self::InvalidResponse(_) => SourceErrorType::InvalidResponse,
            Self::Other(_) => SourceErrorType::Unknown,
        }
    }
}

impl From<HttpCallError> for EnrichError {
    fn from(e: HttpCallError) -> Self {
        match e {
            HttpCallError::Timeout(s) => Self::Timeout(Duration::from_secs(s)),
            HttpCallError::Connect(msg) => Self::Other(msg),
            HttpCallError::Dns(msg) => Self::Dns(msg),
            HttpCallError::RateLimited { .. } => Self::RateLimited,
            HttpCallError::Status { status, body } => Self::Http { status, body },
            HttpCallError::Decode(msg) => Self::InvalidResponse(msg),
        }
    }
}

/// Context an adapter may need beyond the bare domain.
#[derive(Debug, Clone, Default)]
pub struct EnrichContext {
    pub company: Option<String>,
    pub address: Option<String>,
    pub country: Option<String>,
    pub cnpj: Option<String>,
    pub linkedin_url: Option<String>,
}

/// One external data provider.
#[async_trait]
pub trait EnrichmentSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn tier(&self) -> SourceTier;

    fn cost_per_call(&self) -> f64 {
        0.0
    }

    /// Per-call timeout for this provider.
    fn timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    /// Fields this adapter can fill, from the shared lexicon.
    fn provided_fields(&self) -> &'static [&'static str];

    async fn enrich(&self, domain: &str, ctx: &EnrichContext) -> Result<SourceData, EnrichError>;
}

/// Run one adapter behind its circuit breaker.
///
/// Never returns an error: failures (including breaker short-circuits and
/// the per-call timeout) become structured `SourceResult` failures with
/// zero cost.
pub async fn run_with_monitoring(
    source: &dyn EnrichmentSource,
    breakers: &BreakerRegistry,
    domain: &str,
    ctx: &EnrichContext,
) -> SourceResult {
    let breaker = breakers.get(source.name());

    if !breaker.allow() {
        tracing::warn!("Circuit breaker OPEN for {} - failing fast", source.name());
        return SourceResult::failure(
            source.name(),
            SourceErrorType::CircuitOpen,
            "circuit breaker open - service unavailable",
            0,
        );
    }

    let start = Instant::now();
    tracing::info!("Enriching domain '{}' with source '{}'", domain, source.name());

    let outcome = tokio::time::timeout(source.timeout(), source.enrich(domain, ctx)).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    match outcome {
        Ok(Ok(data)) => {
            breaker.record_success();
            tracing::info!(
                "Enriched '{}' with '{}' in {}ms ({} fields, ${:.4})",
                domain,
                source.name(),
                duration_ms,
                data.len(),
                source.cost_per_call()
            );
            SourceResult::ok(source.name(), data, duration_ms, source.cost_per_call())
        },
        Ok(Err(e)) => {
            breaker.record_failure();
            tracing::error!(
                "Failed to enrich '{}' with '{}': {} ({})",
                domain,
                source.name(),
                e,
                e.error_type().as_str()
            );
            SourceResult::failure(source.name(), e.error_type(), e.to_string(), duration_ms)
        },
        Err(_) => {
            breaker.record_failure();
            tracing::error!(
                "Source '{}' timed out after {:?} for '{}'",
                source.name(),
                source.timeout(),
                domain
            );
            SourceResult::failure(
                source.name(),
                SourceErrorType::Timeout,
                format!("timed out after {:?}", source.timeout()),
                duration_ms,
            )
        },
    }
}
