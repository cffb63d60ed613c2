//! Analysis Pipeline
//!
//! The six-stage LLM pipeline: orchestration, stage caching, input
//! sanitisation, quality tiering and hallucination validation.

pub mod cache_wrapper;
pub mod hallucination;
pub mod pipeline;
pub mod quality;
pub mod sanitize;
pub mod stages;

#[cfg(test)]
mod tests;

pub use cache_wrapper::{StageCache, StageCacheStats, run_stage_with_cache};
pub use hallucination::{CompanySize, insufficient_data_sentinel, validate_market_sizing};
pub use pipeline::{AnalyseOptions, Pipeline, PipelineError};
pub use quality::{CoverageSignals, QualityTier, assess_quality, enabled_sections};
pub use sanitize::sanitize_value;
