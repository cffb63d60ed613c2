//! Pipeline Orchestrator
//!
//! Sequences the six analysis stages with per-stage caching, quality
//! tiering, partial-failure tolerance and cost accounting. Stages 1 and 3
//! are fatal; everything else degrades the report instead of failing the
//! run. The orchestrator owns no submission-specific mutable state and is
//! safe to share across concurrent runs.

use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::cache_wrapper::{StageCache, StageCacheStats, run_stage_with_cache};
use super::quality::{CoverageSignals, assess_quality, enabled_sections};
use super::stages;
use super::stages::read_usage;
use crate::models::{ProcessingState, Submission};
use crate::services::enrichment::{BudgetTier, EnrichContext, EnrichmentOrchestrator};
use crate::services::llm::{
    AnalysisLogger, CostTracker, LlmClient, LlmError, ModelTable, ResearchProvider, Stage,
};

/// Per-stage cost estimates used for cache-savings reporting. Actual spend
/// comes from the cost tracker.
const EST_COST_EXTRACTION: f64 = 0.002;
const EST_COST_GAP: f64 = 0.005;
const EST_COST_STRATEGY: f64 = 0.15;
const EST_COST_COMPETITIVE: f64 = 0.05;
const EST_COST_RISK: f64 = 0.04;
const EST_COST_POLISH: f64 = 0.01;

/// Internal bookkeeping key for the model that produced a cached output.
const MODEL_KEY: &str = "_model";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("analysis timed out after {0}s")]
    Timeout(u64),

    #[error("fatal stage '{stage}': {source}")]
    FatalStage {
        stage: &'static str,
        #[source]
        source: LlmError,
    },
}

/// Per-run options.
#[derive(Default)]
pub struct AnalyseOptions {
    /// False runs only the core stages (1, 3, 6).
    pub run_all_stages: bool,
    /// Pre-fetched external data; when absent and the submission has a
    /// website, the enrichment fan-out runs instead.
    pub external_data: Option<Value>,
    /// Pre-fetched real-time research data.
    pub research_data: Option<Value>,
    /// Budget for the enrichment fan-out.
    pub budget: Option<BudgetTier>,
}

type StateSink = Box<dyn Fn(ProcessingState) + Send + Sync>;

pub struct Pipeline {
    llm: LlmClient,
    models: Arc<ModelTable>,
    stage_cache: Arc<StageCache>,
    enrichment: Option<Arc<EnrichmentOrchestrator>>,
    research: Option<Arc<dyn ResearchProvider>>,
    timeout: Duration,
    state_sink: Option<StateSink>,
}

impl Pipeline {
    pub fn new(
        llm: LlmClient,
        models: Arc<ModelTable>,
        stage_cache: Arc<StageCache>,
        enrichment: Option<Arc<EnrichmentOrchestrator>>,
        research: Option<Arc<dyn ResearchProvider>>,
        timeout: Duration,
    ) -> Self {
        Self { llm, models, stage_cache, enrichment, research, timeout, state_sink: None }
    }

    /// Observe processing-state transitions (written to the external
    /// submission store by the caller).
    pub fn with_state_sink(mut self, sink: StateSink) -> Self {
        self.state_sink = Some(sink);
        self
    }

    pub fn cache_stats(&self) -> StageCacheStats {
        self.stage_cache.stats()
    }

    fn set_state(&self, state: ProcessingState) {
        tracing::info!("processing state -> {}", state.as_str());
        if let Some(sink) = &self.state_sink {
            sink(state);
        }
    }

    /// Run the full analysis for one submission.
    pub async fn analyse(
        &self,
        submission: &Submission,
        options: AnalyseOptions,
    ) -> Result<Value, PipelineError> {
        if submission.company.trim().is_empty() {
            return Err(PipelineError::InvalidSubmission("company must not be empty".into()));
        }

        let timeout_secs = self.timeout.as_secs();
        match tokio::time::timeout(self.timeout, self.analyse_inner(submission, options)).await {
            Ok(result) => result,
            Err(_) => {
                self.set_state(ProcessingState::Failed);
                Err(PipelineError::Timeout(timeout_secs))
            },
        }
    }

    async fn analyse_inner(
        &self,
        submission: &Submission,
        options: AnalyseOptions,
    ) -> Result<Value, PipelineError> {
        let started = Instant::now();
        let company = submission.company.as_str();
        let industry = submission.industry.as_str();

        tracing::info!(
            "[pipeline] starting {} analysis for {} in {}",
            if options.run_all_stages { "FULL" } else { "CORE" },
            company,
            industry
        );

        let logger = AnalysisLogger::new(submission.id, company);
        let tracker = CostTracker::new(self.models.clone());

        // ===== External data: pre-fetched or gathered now =====
        self.set_state(ProcessingState::DataGathering);
        let external_data = match options.external_data {
            Some(data) => Some(data),
            None => self.gather_external_data(submission, options.budget).await,
        };
        let research_data = options.research_data;

        let mut stages_completed: Vec<String> = Vec::new();
        let mut models_used = serde_json::Map::new();

        // ===== Stage 1: extraction (fatal) =====
        self.set_state(ProcessingState::AiAnalyzing);
        let stage1_input = json!({
            "company": company,
            "industry": industry,
            "website": submission.website,
            "challenge": submission.challenge,
            "external_hash": external_data.as_ref().map(crate::services::cache::content_hash),
            "research_hash": research_data.as_ref().map(crate::services::cache::content_hash),
        });

        let config_model = self.models.for_stage(Stage::Extraction).primary.clone();
        logger.log_stage_start(Stage::Extraction, &config_model, "Extract structured facts");
        let stage1_start = Instant::now();

        let extracted = run_stage_with_cache(
            &self.stage_cache,
            Stage::Extraction.as_str(),
            company,
            industry,
            &stage1_input,
            EST_COST_EXTRACTION,
            || async {
                let run = stages::extraction::run(
                    &self.llm,
                    &self.models,
                    &tracker,
                    company,
                    industry,
                    submission.website.as_deref(),
                    submission.challenge.as_deref(),
                    external_data.as_ref(),
                    research_data.as_ref(),
                )
                .await?;
                Ok(with_model_key(run.output, &run.model))
            },
        )
        .await;

        let extracted = match extracted {
            Ok(value) => value,
            Err(e) => {
                logger.log_stage_complete(Stage::Extraction, 0.0, 0, 0, 0.0, false, Some(&e.to_string()));
                self.set_state(ProcessingState::Failed);
                return Err(PipelineError::FatalStage { stage: "extraction", source: e });
            },
        };

        self.complete_stage(&logger, Stage::Extraction, stage1_start, &extracted);
        stages_completed.push("extraction".to_string());
        models_used.insert(
            "stage1_extraction".to_string(),
            Value::String(model_of(&extracted, &config_model)),
        );

        // ===== Data quality assessment =====
        let signals = CoverageSignals {
            website_provided: submission.website.is_some(),
            enrichment_succeeded: external_data
                .as_ref()
                .map(has_external_data)
                .unwrap_or(false),
            research_succeeded: research_data.is_some(),
            challenge_provided: submission.challenge.is_some(),
            financial_data_found: has_financial_data(&extracted),
        };
        let tier = assess_quality(signals);
        tracing::info!("[pipeline] data quality tier: {}", tier.as_str());

        // ===== Stage 2: gap analysis + follow-up (optional, non-fatal) =====
        let mut follow_up = json!({"follow_up_completed": false});
        if options.run_all_stages && let Some(research) = &self.research {
            let stage2_input = json!({
                "company": company,
                "industry": industry,
                "extracted_hash": stage_fingerprint(&extracted),
            });

            let model = self.models.for_stage(Stage::GapAnalysis).primary.clone();
            logger.log_stage_start(Stage::GapAnalysis, &model, "Fill data gaps via research");
            let stage_start = Instant::now();

            let result = run_stage_with_cache(
                &self.stage_cache,
                Stage::GapAnalysis.as_str(),
                company,
                industry,
                &stage2_input,
                EST_COST_GAP,
                || async {
                    let run = stages::gap_analysis::run(
                        &self.llm,
                        &self.models,
                        &tracker,
                        research.as_ref(),
                        company,
                        industry,
                        &extracted,
                    )
                    .await?;
                    Ok(with_model_key(run.output, &run.model))
                },
            )
            .await;

            match result {
                Ok(value) => {
                    self.complete_stage(&logger, Stage::GapAnalysis, stage_start, &value);
                    stages_completed.push("gap_analysis_followup".to_string());
                    models_used.insert(
                        "stage2_gap_analysis".to_string(),
                        Value::String(model_of(&value, &model)),
                    );
                    follow_up = value;
                },
                Err(e) => {
                    tracing::warn!("[pipeline] stage 2 failed (non-critical): {}", e);
                    logger.log_stage_complete(
                        Stage::GapAnalysis, 0.0, 0, 0, 0.0, false, Some(&e.to_string()),
                    );
                },
            }
        }

        // ===== Stage 3: strategic frameworks (fatal) =====
        let stage3_input = json!({
            "company": company,
            "industry": industry,
            "challenge": submission.challenge,
            "extracted_hash": stage_fingerprint(&extracted),
            "enabled_sections": enabled_sections(tier),
            "data_quality_tier": tier.as_str(),
        });

        let config_model = self.models.for_stage(Stage::Strategy).primary.clone();
        logger.log_stage_start(Stage::Strategy, &config_model, "Apply strategic frameworks");
        let stage3_start = Instant::now();

        let strategic = run_stage_with_cache(
            &self.stage_cache,
            Stage::Strategy.as_str(),
            company,
            industry,
            &stage3_input,
            EST_COST_STRATEGY,
            || async {
                let result = stages::strategy::run(
                    &self.llm,
                    &self.models,
                    &tracker,
                    company,
                    industry,
                    submission.challenge.as_deref(),
                    &extracted,
                    tier,
                )
                .await?;
                for warning in &result.validation_warnings {
                    logger.log_validation_warning(warning.clone());
                }
                Ok(with_model_key(result.run.output, &result.run.model))
            },
        )
        .await;

        let strategic = match strategic {
            Ok(value) => value,
            Err(e) => {
                logger.log_stage_complete(Stage::Strategy, 0.0, 0, 0, 0.0, false, Some(&e.to_string()));
                self.set_state(ProcessingState::Failed);
                return Err(PipelineError::FatalStage { stage: "strategy", source: e });
            },
        };

        self.complete_stage(&logger, Stage::Strategy, stage3_start, &strategic);
        stages_completed.push("strategic_analysis".to_string());
        models_used.insert(
            "stage3_strategy".to_string(),
            Value::String(model_of(&strategic, &config_model)),
        );

        // ===== Stage 4: competitive matrix (optional, non-fatal) =====
        let mut competitive_intel = Value::Null;
        if options.run_all_stages {
            let stage4_input = json!({
                "company": company,
                "industry": industry,
                "extracted_hash": stage_fingerprint(&extracted),
                "strategic_hash": stage_fingerprint(&strategic),
            });

            let model = self.models.for_stage(Stage::Competitive).primary.clone();
            logger.log_stage_start(Stage::Competitive, &model, "Build competitive matrix");
            let stage_start = Instant::now();

            let result = run_stage_with_cache(
                &self.stage_cache,
                Stage::Competitive.as_str(),
                company,
                industry,
                &stage4_input,
                EST_COST_COMPETITIVE,
                || async {
                    let run = stages::competitive::run(
                        &self.llm,
                        &self.models,
                        &tracker,
                        company,
                        industry,
                        &extracted,
                        &strategic,
                    )
                    .await?;
                    Ok(with_model_key(run.output, &run.model))
                },
            )
            .await;

            match result {
                Ok(value) => {
                    self.complete_stage(&logger, Stage::Competitive, stage_start, &value);
                    stages_completed.push("competitive_matrix".to_string());
                    models_used.insert(
                        "stage4_competitive".to_string(),
                        Value::String(model_of(&value, &model)),
                    );
                    competitive_intel = value;
                },
                Err(e) => {
                    tracing::warn!("[pipeline] stage 4 failed (non-critical): {}", e);
                    logger.log_stage_complete(
                        Stage::Competitive, 0.0, 0, 0, 0.0, false, Some(&e.to_string()),
                    );
                },
            }
        }

        // ===== Stage 5: risk + priority (optional, non-fatal) =====
        let mut risk_priority = Value::Null;
        if options.run_all_stages {
            let stage5_input = json!({
                "company": company,
                "strategic_hash": stage_fingerprint(&strategic),
            });

            let model = self.models.for_stage(Stage::RiskScoring).primary.clone();
            logger.log_stage_start(Stage::RiskScoring, &model, "Quantify risks and priorities");
            let stage_start = Instant::now();

            let result = run_stage_with_cache(
                &self.stage_cache,
                Stage::RiskScoring.as_str(),
                company,
                industry,
                &stage5_input,
                EST_COST_RISK,
                || async {
                    let run = stages::risk_priority::run(
                        &self.llm,
                        &self.models,
                        &tracker,
                        company,
                        &strategic,
                    )
                    .await?;
                    Ok(with_model_key(run.output, &run.model))
                },
            )
            .await;

            match result {
                Ok(value) => {
                    self.complete_stage(&logger, Stage::RiskScoring, stage_start, &value);
                    stages_completed.push("risk_priority_scoring".to_string());
                    models_used.insert(
                        "stage5_risk".to_string(),
                        Value::String(model_of(&value, &model)),
                    );
                    risk_priority = value;
                },
                Err(e) => {
                    tracing::warn!("[pipeline] stage 5 failed (non-critical): {}", e);
                    logger.log_stage_complete(
                        Stage::RiskScoring, 0.0, 0, 0, 0.0, false, Some(&e.to_string()),
                    );
                },
            }
        }

        // ===== Stage 6: executive polish (graceful degradation) =====
        self.set_state(ProcessingState::Finalizing);
        let stage6_input = json!({
            "company": company,
            "strategic_hash": stage_fingerprint(&strategic),
        });

        let model = self.models.for_stage(Stage::Polish).primary.clone();
        logger.log_stage_start(Stage::Polish, &model, "Polish for executive readability");
        let stage_start = Instant::now();

        let polish_result = run_stage_with_cache(
            &self.stage_cache,
            Stage::Polish.as_str(),
            company,
            industry,
            &stage6_input,
            EST_COST_POLISH,
            || async {
                let run = stages::polish::run(
                    &self.llm,
                    &self.models,
                    &tracker,
                    company,
                    &strategic,
                )
                .await?;
                Ok(with_model_key(run.output, &run.model))
            },
        )
        .await;

        let mut final_analysis = match polish_result {
            Ok(value) => {
                self.complete_stage(&logger, Stage::Polish, stage_start, &value);
                stages_completed.push("executive_polish".to_string());
                models_used
                    .insert("stage6_polish".to_string(), Value::String(model_of(&value, &model)));
                value
            },
            Err(e) => {
                tracing::warn!(
                    "[pipeline] stage 6 failed (non-critical), using unpolished analysis: {}",
                    e
                );
                logger.log_stage_complete(Stage::Polish, 0.0, 0, 0, 0.0, false, Some(&e.to_string()));
                strategic.clone()
            },
        };

        // ===== Merge advanced analysis under fixed keys =====
        if !competitive_intel.is_null() {
            final_analysis["inteligencia_competitiva"] = strip_model_key(competitive_intel);
        }
        if !risk_priority.is_null() {
            final_analysis["analise_risco_prioridade"] = strip_model_key(risk_priority);
        }
        if follow_up["follow_up_completed"].as_bool().unwrap_or(false) {
            final_analysis["pesquisa_adicional"] = strip_model_key(follow_up.clone());
        }

        if let Some(map) = final_analysis.as_object_mut() {
            map.remove(MODEL_KEY);
        }

        // ===== Metadata =====
        let processing_time = started.elapsed().as_secs_f64();
        let (input_tokens, output_tokens) = tracker.total_tokens();

        final_analysis["_metadata"] = json!({
            "generated_at": Utc::now().to_rfc3339(),
            "processing_time_seconds": (processing_time * 100.0).round() / 100.0,
            "pipeline": if options.run_all_stages { "multi-stage-full" } else { "multi-stage-core" },
            "stages_completed": stages_completed,
            "models_used": models_used,
            "quality_tier": tier.as_str(),
            "data_gaps_identified": extracted["data_gaps"].as_array().map(Vec::len).unwrap_or(0),
            "data_gaps_filled": follow_up["data_gaps_filled"].as_i64().unwrap_or(0),
            "total_cost_actual_usd": tracker.total_cost_usd(),
            "total_input_tokens": input_tokens,
            "total_output_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens,
            "logging_summary": logger.summary(&tracker),
        });

        self.set_state(ProcessingState::Completed);
        tracing::info!(
            "[pipeline] {}-stage analysis complete in {:.1}s (${:.4})",
            final_analysis["_metadata"]["stages_completed"].as_array().map(Vec::len).unwrap_or(0),
            processing_time,
            tracker.total_cost_usd()
        );

        Ok(final_analysis)
    }

    async fn gather_external_data(
        &self,
        submission: &Submission,
        budget: Option<BudgetTier>,
    ) -> Option<Value> {
        let enrichment = self.enrichment.as_ref()?;
        let domain = submission.domain()?;

        let ctx = EnrichContext {
            company: Some(submission.company.clone()),
            linkedin_url: submission.linkedin_company.clone(),
            ..Default::default()
        };

        let enriched = enrichment
            .enrich_reconciled(&domain, &ctx, budget.unwrap_or(BudgetTier::Paid))
            .await;

        tracing::info!(
            "[pipeline] enrichment: {}/{} sources succeeded (${:.4})",
            enriched.sources_succeeded,
            enriched.sources_succeeded + enriched.sources_failed,
            enriched.total_cost_usd
        );

        serde_json::to_value(&enriched).ok()
    }

    fn complete_stage(
        &self,
        logger: &AnalysisLogger,
        stage: Stage,
        started: Instant,
        output: &Value,
    ) {
        let usage = read_usage(output);
        let cost = self
            .models
            .estimated_cost(stage, usage.input_tokens, usage.output_tokens);
        logger.log_stage_complete(
            stage,
            started.elapsed().as_secs_f64(),
            usage.input_tokens,
            usage.output_tokens,
            cost,
            true,
            None,
        );
    }
}

fn with_model_key(mut output: Value, model: &str) -> Value {
    if let Some(map) = output.as_object_mut() {
        map.insert(MODEL_KEY.to_string(), Value::String(model.to_string()));
    }
    output
}

fn strip_model_key(mut output: Value) -> Value {
    if let Some(map) = output.as_object_mut() {
        map.remove(MODEL_KEY);
    }
    output
}

/// Content hash of a stage output with the bookkeeping keys removed.
/// `_usage_stats` is zeroed on cache hits, so hashing it would make the
/// downstream cache keys differ between a fresh run and a cached one.
fn stage_fingerprint(output: &Value) -> String {
    let mut v = output.clone();
    if let Some(map) = v.as_object_mut() {
        map.remove("_usage_stats");
        map.remove(MODEL_KEY);
    }
    crate::services::cache::content_hash(&v)
}

fn model_of(output: &Value, configured: &str) -> String {
    output[MODEL_KEY]
        .as_str()
        .unwrap_or(configured)
        .to_string()
}

fn has_financial_data(extracted: &Value) -> bool {
    let revenue = extracted["company_facts"]["revenue"].as_str().unwrap_or("");
    !revenue.is_empty() && revenue != "N/A"
}

/// Whether pre-fetched or gathered external data actually carries fields.
fn has_external_data(d: &Value) -> bool {
    match d.get("data") {
        Some(Value::Object(map)) => !map.is_empty(),
        _ => d.as_object().map(|m| !m.is_empty()).unwrap_or(false),
    }
}
