//! Enrichment Orchestrator
//!
//! Selects data sources by budget tier and domain country, runs them
//! concurrently behind circuit breakers within one overall deadline, then
//! reconciles the results into a single record. Individual source
//! failures never fail the fan-out; they only lower data quality.

use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

use super::reconcile::{self, Reconciled};
use super::session_repository::SessionRepository;
use super::source::{EnrichContext, EnrichmentSource, SourceTier, run_with_monitoring};
use crate::models::SourceResult;
use crate::services::cache::MultiTierCache;
use crate::services::circuit_breaker::BreakerRegistry;

/// Overall wall-clock budget for one fan-out.
const FANOUT_DEADLINE: Duration = Duration::from_secs(120);

/// Rough per-enrichment API spend, used for cache savings accounting.
const CACHE_EST_COST: f64 = 0.05;

/// Enrichment layer the reconciled record belongs to in the tiered cache.
const RECONCILED_LAYER: u8 = 2;

/// Budget tier for source selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetTier {
    Free,
    Paid,
    Premium,
}

impl BudgetTier {
    fn allows(&self, tier: SourceTier) -> bool {
        match self {
            Self::Free => tier == SourceTier::Free,
            Self::Paid => matches!(tier, SourceTier::Free | SourceTier::Paid),
            Self::Premium => true,
        }
    }
}

/// Result of one full enrichment pass.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EnrichedCompany {
    pub domain: String,
    pub data: serde_json::Map<String, Value>,
    pub confidences: std::collections::HashMap<String, f64>,
    pub field_sources: std::collections::HashMap<String, String>,
    pub reconciliation_log: Vec<reconcile::ReconciliationEntry>,
    pub source_results: Vec<SourceResult>,
    pub sources_succeeded: usize,
    pub sources_failed: usize,
    pub total_cost_usd: f64,
    pub total_duration_ms: u64,
}

pub struct EnrichmentOrchestrator {
    sources: Vec<Arc<dyn EnrichmentSource>>,
    breakers: Arc<BreakerRegistry>,
    cache: Option<Arc<MultiTierCache>>,
    repository: Option<Arc<SessionRepository>>,
    deadline: Duration,
}

impl EnrichmentOrchestrator {
    pub fn new(sources: Vec<Arc<dyn EnrichmentSource>>, breakers: Arc<BreakerRegistry>) -> Self {
        Self { sources, breakers, cache: None, repository: None, deadline: FANOUT_DEADLINE }
    }

    /// Serve repeated domains from the tiered cache instead of re-running
    /// the fan-out.
    pub fn with_cache(mut self, cache: Arc<MultiTierCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Apply the learner's per-(source, field) adjustments to reconciled
    /// confidences.
    pub fn with_repository(mut self, repository: Arc<SessionRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    #[cfg(test)]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Sources that may run for this domain under this budget, in the
    /// fixed selection order. The order matters: reconciliation ties break
    /// on first-seen source.
    pub fn select_sources(
        &self,
        domain: &str,
        budget: BudgetTier,
    ) -> Vec<Arc<dyn EnrichmentSource>> {
        let country = detect_country_from_domain(domain);

        self.sources
            .iter()
            .filter(|s| budget.allows(s.tier()))
            .filter(|s| {
                // The Brazilian registry only makes sense for .br domains
                // (or when the country was detected as BR upstream).
                s.name() != "receita_ws" || country == "BR"
            })
            .cloned()
            .collect()
    }

    /// Run the selected sources concurrently and collect every result.
    pub async fn gather(
        &self,
        domain: &str,
        ctx: &EnrichContext,
        budget: BudgetTier,
    ) -> Vec<SourceResult> {
        let selected = self.select_sources(domain, budget);
        tracing::info!(
            "Fanning out {} sources for {} (budget {:?}): {:?}",
            selected.len(),
            domain,
            budget,
            selected.iter().map(|s| s.name()).collect::<Vec<_>>()
        );

        let mut join_set = JoinSet::new();
        for source in &selected {
            let source = source.clone();
            let breakers = self.breakers.clone();
            let domain = domain.to_string();
            let ctx = ctx.clone();
            join_set.spawn(async move {
                run_with_monitoring(source.as_ref(), &breakers, &domain, &ctx).await
            });
        }

        let mut results = Vec::with_capacity(selected.len());
        let deadline = tokio::time::sleep(self.deadline);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = join_set.join_next() => {
                    match joined {
                        Some(Ok(result)) => results.push(result),
                        Some(Err(e)) => tracing::error!("source task panicked: {}", e),
                        None => break,
                    }
                },
                _ = &mut deadline => {
                    tracing::warn!(
                        "Fan-out deadline of {:?} hit for {} with {} sources pending",
                        self.deadline,
                        domain,
                        join_set.len()
                    );
                    join_set.abort_all();
                    break;
                },
            }
        }

        // Keep the fixed selection order for deterministic reconciliation.
        results.sort_by_key(|r| {
            selected
                .iter()
                .position(|s| s.name() == r.source_name)
                .unwrap_or(usize::MAX)
        });

        results
    }

    /// Fan out, reconcile, infer gaps and validate. The single entry point
    /// the pipeline uses during Stage 1. Repeated domains are answered
    /// from the tiered cache when one is attached.
    pub async fn enrich_reconciled(
        &self,
        domain: &str,
        ctx: &EnrichContext,
        budget: BudgetTier,
    ) -> EnrichedCompany {
        if let Some(cache) = &self.cache {
            let cached = cache
                .get_or_enrich(domain, RECONCILED_LAYER, CACHE_EST_COST, || async {
                    let enriched = self.enrich_uncached(domain, ctx, budget).await;
                    Ok::<_, std::convert::Infallible>(
                        serde_json::to_value(&enriched).unwrap_or(Value::Null),
                    )
                })
                .await
                .unwrap_or_else(|e| match e {});

            if let Ok(enriched) = serde_json::from_value::<EnrichedCompany>(cached) {
                return enriched;
            }
            tracing::warn!("cached enrichment for {} unreadable, re-running fan-out", domain);
        }

        self.enrich_uncached(domain, ctx, budget).await
    }

    async fn enrich_uncached(
        &self,
        domain: &str,
        ctx: &EnrichContext,
        budget: BudgetTier,
    ) -> EnrichedCompany {
        let start = Instant::now();
        let source_results = self.gather(domain, ctx, budget).await;

        let successful: Vec<(String, serde_json::Map<String, Value>)> = source_results
            .iter()
            .filter(|r| r.success)
            .map(|r| (r.source_name.clone(), r.data.clone()))
            .collect();

        let mut reconciled: Reconciled = reconcile::reconcile(&successful);

        if let Some(repository) = &self.repository {
            match repository.learned_adjustments().await {
                Ok(adjustments) if !adjustments.is_empty() => {
                    reconcile::apply_learned_adjustments(&mut reconciled, &adjustments);
                },
                Ok(_) => {},
                Err(e) => tracing::warn!("could not load learned adjustments: {}", e),
            }
        }

        reconcile::infer_missing_fields(&mut reconciled);
        reconcile::validate_cnpj(&mut reconciled);

        let sources_succeeded = successful.len();
        let sources_failed = source_results.len() - sources_succeeded;
        let total_cost_usd = source_results.iter().map(|r| r.cost_usd).sum();

        EnrichedCompany {
            domain: domain.to_string(),
            data: reconciled.data,
            confidences: reconciled.confidences,
            field_sources: reconciled.field_sources,
            reconciliation_log: reconciled.log,
            source_results,
            sources_succeeded,
            sources_failed,
            total_cost_usd,
            total_duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

fn detect_country_from_domain(domain: &str) -> &'static str {
    if domain.ends_with(".br") {
        "BR"
    } else if domain.ends_with(".uk") {
        "UK"
    } else if domain.ends_with(".de") {
        "DE"
    } else {
        "default"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::enrichment::source::{EnrichError, SourceData};
    use async_trait::async_trait;
    use serde_json::json;

    struct StubSource {
        name: &'static str,
        tier: SourceTier,
        fields: Vec<(&'static str, Value)>,
        fail: bool,
        delay: Duration,
    }

    impl StubSource {
        fn ok(name: &'static str, tier: SourceTier, fields: Vec<(&'static str, Value)>) -> Arc<Self> {
            Arc::new(Self { name, tier, fields, fail: false, delay: Duration::ZERO })
        }

        fn failing(name: &'static str, tier: SourceTier) -> Arc<Self> {
            Arc::new(Self { name, tier, fields: vec![], fail: true, delay: Duration::ZERO })
        }
    }

    #[async_trait]
    impl EnrichmentSource for StubSource {
        fn name(&self) -> &'static str {
            self.name
        }

        fn tier(&self) -> SourceTier {
            self.tier
        }

        fn cost_per_call(&self) -> f64 {
            match self.tier {
                SourceTier::Free => 0.0,
                SourceTier::Paid => 0.02,
                SourceTier::Premium => 0.01,
            }
        }

        fn provided_fields(&self) -> &'static [&'static str] {
            &[]
        }

        async fn enrich(
            &self,
            _domain: &str,
            _ctx: &EnrichContext,
        ) -> Result<SourceData, EnrichError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(EnrichError::Http { status: 402, body: "payment required".into() });
            }
            Ok(self
                .fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect())
        }
    }

    fn orchestrator(sources: Vec<Arc<dyn EnrichmentSource>>) -> EnrichmentOrchestrator {
        EnrichmentOrchestrator::new(sources, Arc::new(BreakerRegistry::default()))
    }

    #[test]
    fn test_budget_filters_tiers() {
        let sources: Vec<Arc<dyn EnrichmentSource>> = vec![
            StubSource::ok("metadata", SourceTier::Free, vec![]),
            StubSource::ok("clearbit", SourceTier::Paid, vec![]),
            StubSource::ok("openai_gpt", SourceTier::Premium, vec![]),
        ];
        let orch = orchestrator(sources);

        let free: Vec<_> = orch
            .select_sources("acme.com", BudgetTier::Free)
            .iter()
            .map(|s| s.name())
            .collect();
        assert_eq!(free, vec!["metadata"]);

        let paid: Vec<_> = orch
            .select_sources("acme.com", BudgetTier::Paid)
            .iter()
            .map(|s| s.name())
            .collect();
        assert_eq!(paid, vec!["metadata", "clearbit"]);

        let premium = orch.select_sources("acme.com", BudgetTier::Premium);
        assert_eq!(premium.len(), 3);
    }

    #[test]
    fn test_receita_only_for_brazilian_domains() {
        let sources: Vec<Arc<dyn EnrichmentSource>> =
            vec![StubSource::ok("receita_ws", SourceTier::Free, vec![])];
        let orch = orchestrator(sources);

        assert!(orch.select_sources("acme.com", BudgetTier::Free).is_empty());
        assert_eq!(orch.select_sources("acme.com.br", BudgetTier::Free).len(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_source() {
        let sources: Vec<Arc<dyn EnrichmentSource>> = vec![
            StubSource::ok(
                "metadata",
                SourceTier::Free,
                vec![("company_name", json!("Acme"))],
            ),
            StubSource::failing("clearbit", SourceTier::Paid),
        ];
        let orch = orchestrator(sources);

        let enriched = orch
            .enrich_reconciled("acme.com", &EnrichContext::default(), BudgetTier::Paid)
            .await;

        assert_eq!(enriched.sources_succeeded, 1);
        assert_eq!(enriched.sources_failed, 1);
        assert_eq!(enriched.data["company_name"], "Acme");
        // Failed calls cost nothing.
        assert_eq!(enriched.total_cost_usd, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cuts_off_slow_sources() {
        let slow = Arc::new(StubSource {
            name: "slow",
            tier: SourceTier::Free,
            fields: vec![("description", json!("late"))],
            fail: false,
            delay: Duration::from_secs(300),
        });
        let fast = StubSource::ok("metadata", SourceTier::Free, vec![("company_name", json!("A"))]);

        let sources: Vec<Arc<dyn EnrichmentSource>> = vec![fast, slow];
        let orch = orchestrator(sources).with_deadline(Duration::from_secs(2));

        let results = orch
            .gather("acme.com", &EnrichContext::default(), BudgetTier::Free)
            .await;

        // Only the fast source made it back.
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source_name, "metadata");
    }
}
