//! Pipeline Stages
//!
//! Each stage is a pure async function: build a prompt from its inputs,
//! call the LLM with the stage's model chain, validate or repair the JSON,
//! attach `_usage_stats` and return. Stage functions know nothing about
//! caching or ordering - that is the orchestrator's job.

pub mod competitive;
pub mod extraction;
pub mod gap_analysis;
pub mod polish;
pub mod risk_priority;
pub mod strategy;

use serde_json::{Value, json};

use crate::services::llm::UsageStats;

/// A stage result plus the model that actually produced it (fallbacks may
/// differ from the configured primary).
#[derive(Debug, Clone)]
pub struct StageRun {
    pub output: Value,
    pub model: String,
}

/// Attach `_usage_stats` to a stage output object.
pub(crate) fn attach_usage(output: &mut Value, usage: UsageStats) {
    if let Some(map) = output.as_object_mut() {
        map.insert(
            "_usage_stats".to_string(),
            json!({
                "input_tokens": usage.input_tokens,
                "output_tokens": usage.output_tokens,
            }),
        );
    }
}

/// Read the `_usage_stats` header back from a stage output.
pub fn read_usage(output: &Value) -> UsageStats {
    UsageStats {
        input_tokens: output["_usage_stats"]["input_tokens"].as_i64().unwrap_or(0),
        output_tokens: output["_usage_stats"]["output_tokens"].as_i64().unwrap_or(0),
    }
}
