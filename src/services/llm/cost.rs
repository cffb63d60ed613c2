//! Cost Tracker & Analysis Logger
//!
//! Per-stage token and USD accounting. The tracker is injected into every
//! LLM call; its running sum is what `_metadata.total_cost_actual_usd`
//! reports. The analysis logger captures per-stage start/end records and
//! produces the structured `logging_summary` block.

use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::models::{ModelTable, Stage};

// ============================================================================
// Cost Tracker
// ============================================================================

/// One entry in the append-only cost trace.
#[derive(Debug, Clone, Serialize)]
pub struct StageCostRecord {
    pub stage: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub success: bool,
}

/// Append-only per-run cost trace. Shared by reference into every LLM call
/// of one pipeline run; the critical section is a push, never held across
/// a network call.
pub struct CostTracker {
    table: Arc<ModelTable>,
    records: Mutex<Vec<StageCostRecord>>,
}

impl CostTracker {
    pub fn new(table: Arc<ModelTable>) -> Self {
        Self { table, records: Mutex::new(Vec::new()) }
    }

    pub fn log_usage(
        &self,
        stage: Stage,
        model: &str,
        input_tokens: i64,
        output_tokens: i64,
        duration_ms: u64,
        success: bool,
    ) {
        let cost_usd = if success {
            self.table.estimated_cost(stage, input_tokens, output_tokens)
        } else {
            0.0
        };

        tracing::info!(
            "[cost] {} via {} - {} in / {} out tokens, ${:.6}",
            stage.as_str(),
            model,
            input_tokens,
            output_tokens,
            cost_usd
        );

        let record = StageCostRecord {
            stage: stage.as_str().to_string(),
            model: model.to_string(),
            input_tokens,
            output_tokens,
            cost_usd,
            duration_ms,
            success,
        };

        self.records.lock().expect("cost tracker lock").push(record);
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.records
            .lock()
            .expect("cost tracker lock")
            .iter()
            .map(|r| r.cost_usd)
            .sum()
    }

    pub fn total_tokens(&self) -> (i64, i64) {
        let records = self.records.lock().expect("cost tracker lock");
        let input = records.iter().map(|r| r.input_tokens).sum();
        let output = records.iter().map(|r| r.output_tokens).sum();
        (input, output)
    }

    pub fn records(&self) -> Vec<StageCostRecord> {
        self.records.lock().expect("cost tracker lock").clone()
    }
}

// ============================================================================
// Analysis Logger
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct StageLogEntry {
    stage: String,
    model: String,
    task: String,
    status: String,
    start_time: String,
    end_time: Option<String>,
    duration_seconds: f64,
    input_tokens: i64,
    output_tokens: i64,
    cost_usd: f64,
    error: Option<String>,
}

/// Structured per-analysis logger. One instance per pipeline run.
pub struct AnalysisLogger {
    run_id: String,
    submission_id: i64,
    company: String,
    started: Instant,
    stages: Mutex<Vec<StageLogEntry>>,
    warnings: Mutex<Vec<String>>,
}

impl AnalysisLogger {
    pub fn new(submission_id: i64, company: impl Into<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            submission_id,
            company: company.into(),
            started: Instant::now(),
            stages: Mutex::new(Vec::new()),
            warnings: Mutex::new(Vec::new()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn log_stage_start(&self, stage: Stage, model: &str, task: &str) {
        tracing::info!(
            submission_id = self.submission_id,
            stage = stage.as_str(),
            model,
            "[stage start] {}",
            task
        );

        self.stages.lock().expect("logger lock").push(StageLogEntry {
            stage: stage.as_str().to_string(),
            model: model.to_string(),
            task: task.to_string(),
            status: "started".to_string(),
            start_time: Utc::now().to_rfc3339(),
            end_time: None,
            duration_seconds: 0.0,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            error: None,
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_stage_complete(
        &self,
        stage: Stage,
        duration_seconds: f64,
        input_tokens: i64,
        output_tokens: i64,
        cost_usd: f64,
        success: bool,
        error: Option<&str>,
    ) {
        let mut stages = self.stages.lock().expect("logger lock");
        let Some(entry) = stages
            .iter_mut()
            .rev()
            .find(|e| e.stage == stage.as_str())
        else {
            tracing::warn!("Stage {} completed without a start entry", stage.as_str());
            return;
        };

        entry.status = if success { "completed" } else { "failed" }.to_string();
        entry.end_time = Some(Utc::now().to_rfc3339());
        entry.duration_seconds = (duration_seconds * 1000.0).round() / 1000.0;
        entry.input_tokens = input_tokens;
        entry.output_tokens = output_tokens;
        entry.cost_usd = cost_usd;
        entry.error = error.map(String::from);

        tracing::info!(
            submission_id = self.submission_id,
            stage = stage.as_str(),
            "[stage complete] success={} {:.2}s {} tokens ${:.4}",
            success,
            duration_seconds,
            input_tokens + output_tokens,
            cost_usd
        );

        if let Some(err) = error {
            tracing::error!(
                submission_id = self.submission_id,
                stage = stage.as_str(),
                "[stage error] {}",
                err
            );
        }
    }

    /// Record a validation warning (hallucination scans, attribution gaps).
    /// Warnings go into the summary instead of mutating the report.
    pub fn log_validation_warning(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(submission_id = self.submission_id, "[validation] {}", message);
        self.warnings.lock().expect("logger lock").push(message);
    }

    pub fn log_cache_hit(&self, cache_type: &str, cost_saved: f64) {
        tracing::info!(
            submission_id = self.submission_id,
            "[cache hit] {} - saved ${:.4}",
            cache_type,
            cost_saved
        );
    }

    pub fn log_cache_miss(&self, cache_type: &str) {
        tracing::info!(submission_id = self.submission_id, "[cache miss] {}", cache_type);
    }

    /// Structured summary for `_metadata.logging_summary`.
    pub fn summary(&self, tracker: &CostTracker) -> Value {
        let stages = self.stages.lock().expect("logger lock");
        let warnings = self.warnings.lock().expect("logger lock");
        let (input_tokens, output_tokens) = tracker.total_tokens();

        json!({
            "run_id": self.run_id,
            "submission_id": self.submission_id,
            "company": self.company,
            "total_duration_seconds": (self.started.elapsed().as_secs_f64() * 100.0).round() / 100.0,
            "total_cost_usd": tracker.total_cost_usd(),
            "total_input_tokens": input_tokens,
            "total_output_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens,
            "stages_completed": stages.iter().filter(|s| s.status == "completed").count(),
            "stages_failed": stages.iter().filter(|s| s.status == "failed").count(),
            "stages": serde_json::to_value(&*stages).unwrap_or_else(|_| json!([])),
            "validation_warnings": serde_json::to_value(&*warnings).unwrap_or_else(|_| json!([])),
            "cost_trace": serde_json::to_value(tracker.records()).unwrap_or_else(|_| json!([])),
            "timestamp": Utc::now().to_rfc3339(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_cost_is_sum_of_records() {
        let tracker = CostTracker::new(Arc::new(ModelTable::default()));

        tracker.log_usage(Stage::Extraction, "m1", 10_000, 2_000, 900, true);
        tracker.log_usage(Stage::Strategy, "m2", 30_000, 4_000, 4_000, true);

        let expected: f64 = tracker.records().iter().map(|r| r.cost_usd).sum();
        assert!((tracker.total_cost_usd() - expected).abs() < 1e-9);
        assert!(tracker.total_cost_usd() > 0.0);
    }

    #[test]
    fn test_failed_calls_cost_nothing() {
        let tracker = CostTracker::new(Arc::new(ModelTable::default()));
        tracker.log_usage(Stage::Strategy, "m", 30_000, 0, 1_000, false);
        assert_eq!(tracker.total_cost_usd(), 0.0);
    }

    #[test]
    fn test_logger_summary_counts_stages() {
        let tracker = CostTracker::new(Arc::new(ModelTable::default()));
        let logger = AnalysisLogger::new(1, "TechStart");

        logger.log_stage_start(Stage::Extraction, "m1", "extract");
        logger.log_stage_complete(Stage::Extraction, 1.2, 100, 50, 0.001, true, None);
        logger.log_stage_start(Stage::Competitive, "m2", "matrix");
        logger.log_stage_complete(Stage::Competitive, 0.0, 0, 0, 0.0, false, Some("boom"));

        let summary = logger.summary(&tracker);
        assert_eq!(summary["stages_completed"], 1);
        assert_eq!(summary["stages_failed"], 1);
        assert_eq!(summary["company"], "TechStart");
    }
}
