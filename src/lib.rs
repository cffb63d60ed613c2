//! Bussola Library
//!
//! Core of the strategic-analysis backend: the six-stage LLM pipeline, the
//! data-source fan-out with reconciliation, the tiered caches and the
//! confidence learner. HTTP routing, auth and rendering live in external
//! collaborators; this crate exposes `AnalysisCore::analyse` and the
//! background learner job.

use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

pub mod config;
pub mod db;
pub mod models;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use models::{ProcessingState, Submission};
pub use services::analysis::{AnalyseOptions, Pipeline, PipelineError, StageCache};
pub use services::enrichment::{
    BudgetTier, ConfidenceLearner, EditTracker, EnrichmentOrchestrator, LearnerRefreshTask,
    SessionRepository,
};
pub use services::llm::{LlmClient, LlmError, ModelTable};
pub use services::{BreakerRegistry, MultiTierCache, RetryingClient};

use services::cache::FsObjectStore;
use services::enrichment::sources::{
    ClearbitSource, EnhancedMetadataSource, FreeCompanyDataSource, FreeGeocodingSource,
    GooglePlacesSource, GroqAiSource, IpApiSource, MetadataSource, OpenAiGptSource,
    ProxycurlSource, ReceitaSource,
};
use services::enrichment::{EnrichmentSource, source::SourceTier};
use services::llm::{PerplexityProvider, ResearchProvider};
use utils::scheduled_executor::{ScheduledExecutor, ShutdownHandle};

/// Application shared state
///
/// Rust's type system is the DI container: every service is built once,
/// wrapped in Arc and shared across concurrent pipeline runs.
pub struct AnalysisCore {
    pub db: SqlitePool,
    pub config: Config,
    pub pipeline: Arc<Pipeline>,
    pub repository: Arc<SessionRepository>,
    pub learner: Arc<ConfidenceLearner>,
    pub edit_tracker: Arc<EditTracker>,
    concurrency: Arc<tokio::sync::Semaphore>,
}

impl AnalysisCore {
    pub async fn new(config: Config) -> Result<Self, anyhow::Error> {
        let pool = db::init_database(&config.database.url).await?;

        let breakers = Arc::new(BreakerRegistry::new(
            config.breaker.failure_threshold,
            Duration::from_secs(config.breaker.cooldown_seconds),
        ));
        let http = RetryingClient::new();

        let cold_store = config
            .cache
            .cold_dir
            .as_ref()
            .map(|dir| Arc::new(FsObjectStore::new(dir)) as Arc<dyn services::ObjectStore>);
        let multi_tier = Arc::new(MultiTierCache::new(
            pool.clone(),
            cold_store,
            Duration::from_secs(config.cache.hot_ttl_seconds),
            config.cache.warm_ttl_days,
        ));

        let repository = Arc::new(SessionRepository::new(pool.clone()));
        let enrichment = Arc::new(
            EnrichmentOrchestrator::new(build_sources(&config, &http), breakers)
                .with_cache(multi_tier)
                .with_repository(repository.clone()),
        );

        let llm = LlmClient::open_router(config.llm.api_base.clone(), config.llm.api_key.clone());
        let research: Option<Arc<dyn ResearchProvider>> =
            config.providers.perplexity_api_key.as_ref().map(|key| {
                Arc::new(PerplexityProvider::new(
                    http.clone(),
                    "https://api.perplexity.ai",
                    Some(key.clone()),
                )) as Arc<dyn ResearchProvider>
            });

        let stage_cache = Arc::new(StageCache::new(pool.clone()));
        let pipeline = Arc::new(Pipeline::new(
            llm,
            Arc::new(config.models.clone()),
            stage_cache,
            Some(enrichment),
            research,
            Duration::from_secs(config.analysis.timeout_seconds),
        ));

        let learner = Arc::new(ConfidenceLearner::new(SessionRepository::new(pool.clone())));
        let edit_tracker = Arc::new(EditTracker::new(SessionRepository::new(pool.clone())));
        let concurrency =
            Arc::new(tokio::sync::Semaphore::new(config.analysis.max_concurrent_analyses));

        Ok(Self { db: pool, config, pipeline, repository, learner, edit_tracker, concurrency })
    }

    /// Run one analysis, bounded by the configured concurrency cap.
    pub async fn analyse(
        &self,
        submission: &Submission,
        options: AnalyseOptions,
    ) -> Result<Value, PipelineError> {
        let _permit = self
            .concurrency
            .acquire()
            .await
            .map_err(|_| PipelineError::Configuration("core shutting down".to_string()))?;
        self.pipeline.analyse(submission, options).await
    }

    /// Spawn the periodic confidence-learner refresh. Returns the handle
    /// that stops it.
    pub fn spawn_learner_job(&self) -> ShutdownHandle {
        let executor = ScheduledExecutor::new(
            "confidence-learner-refresh",
            Duration::from_secs(self.config.analysis.learner_interval_seconds),
        );
        let handle = executor.shutdown_handle();
        let task = LearnerRefreshTask::new(self.learner.clone());
        tokio::spawn(executor.start(task));
        handle
    }
}

/// All adapters in the fixed selection order: free tier first, then paid,
/// then premium. Reconciliation ties break on this order.
fn build_sources(config: &Config, http: &RetryingClient) -> Vec<Arc<dyn EnrichmentSource>> {
    let keys = &config.providers;

    let sources: Vec<Arc<dyn EnrichmentSource>> = vec![
        Arc::new(MetadataSource::new(http.clone())),
        Arc::new(EnhancedMetadataSource::new(http.clone())),
        Arc::new(IpApiSource::new(http.clone())),
        Arc::new(ReceitaSource::new(http.clone())),
        Arc::new(FreeCompanyDataSource::new(
            http.clone(),
            keys.opencorporates_api_token.clone(),
        )),
        Arc::new(FreeGeocodingSource::new(
            http.clone(),
            keys.opencage_api_key.clone(),
            keys.geoapify_api_key.clone(),
        )),
        Arc::new(GroqAiSource::new(http.clone(), keys.groq_api_key.clone())),
        Arc::new(ClearbitSource::new(http.clone(), keys.clearbit_api_key.clone())),
        Arc::new(GooglePlacesSource::new(http.clone(), keys.google_places_api_key.clone())),
        Arc::new(ProxycurlSource::new(http.clone(), keys.proxycurl_api_key.clone())),
        Arc::new(OpenAiGptSource::new(http.clone(), keys.openai_api_key.clone())),
    ];

    debug_assert!(is_tier_ordered(&sources));
    sources
}

fn is_tier_ordered(sources: &[Arc<dyn EnrichmentSource>]) -> bool {
    let rank = |t: SourceTier| match t {
        SourceTier::Free => 0,
        SourceTier::Paid => 1,
        SourceTier::Premium => 2,
    };
    sources.windows(2).all(|w| rank(w[0].tier()) <= rank(w[1].tier()))
}
