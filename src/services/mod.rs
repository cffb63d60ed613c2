pub mod analysis;
pub mod cache;
pub mod circuit_breaker;
pub mod enrichment;
pub mod http_call;
pub mod llm;

pub use analysis::{AnalyseOptions, Pipeline, PipelineError, StageCache};
pub use cache::{CacheStatsSnapshot, FsObjectStore, MultiTierCache, ObjectStore};
pub use circuit_breaker::{BreakerRegistry, BreakerState, CircuitBreaker};
pub use enrichment::{
    BudgetTier, ConfidenceLearner, EditTracker, EnrichmentOrchestrator, EnrichmentSource,
    LearnerRefreshTask, SessionRepository,
};
pub use http_call::RetryingClient;
pub use llm::{AnalysisLogger, CostTracker, LlmClient, LlmError, ModelTable, Stage};
