//! LLM Data Models
//!
//! Stage identifiers, per-stage model selection with fallback chains and
//! token rates, usage stats, and the LLM error taxonomy.

use serde::{Deserialize, Serialize};

// ============================================================================
// Pipeline Stage Identity
// ============================================================================

/// Analysis pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extraction,
    GapAnalysis,
    Strategy,
    Competitive,
    RiskScoring,
    Polish,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::GapAnalysis => "gap_analysis",
            Self::Strategy => "strategy",
            Self::Competitive => "competitive",
            Self::RiskScoring => "risk_scoring",
            Self::Polish => "polish",
        }
    }

    pub const ALL: [Stage; 6] = [
        Stage::Extraction,
        Stage::GapAnalysis,
        Stage::Strategy,
        Stage::Competitive,
        Stage::RiskScoring,
        Stage::Polish,
    ];
}

// ============================================================================
// Model Selection Table
// ============================================================================

/// USD per million tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelRates {
    pub input: f64,
    pub output: f64,
}

impl ModelRates {
    pub fn cost(&self, input_tokens: i64, output_tokens: i64) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input
            + (output_tokens as f64 / 1_000_000.0) * self.output
    }
}

/// Model chain for one stage: primary, cheaper paid fallback and an
/// optional free fallback for stages that must always produce something.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageModels {
    pub primary: String,
    pub paid_fallback: String,
    pub free_fallback: Option<String>,
    pub rates: ModelRates,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Per-stage model configuration. Exact model ids are configuration, not
/// contract; this is the default table, overridable from the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelTable {
    pub extraction: StageModels,
    pub gap_analysis: StageModels,
    pub strategy: StageModels,
    pub competitive: StageModels,
    pub risk_scoring: StageModels,
    pub polish: StageModels,
}

impl ModelTable {
    pub fn for_stage(&self, stage: Stage) -> &StageModels {
        match stage {
            Stage::Extraction => &self.extraction,
            Stage::GapAnalysis => &self.gap_analysis,
            Stage::Strategy => &self.strategy,
            Stage::Competitive => &self.competitive,
            Stage::RiskScoring => &self.risk_scoring,
            Stage::Polish => &self.polish,
        }
    }

    pub fn estimated_cost(&self, stage: Stage, input_tokens: i64, output_tokens: i64) -> f64 {
        self.for_stage(stage).rates.cost(input_tokens, output_tokens)
    }
}

impl Default for ModelTable {
    fn default() -> Self {
        let budget = ModelRates { input: 0.075, output: 0.30 };
        let premium_gemini = ModelRates { input: 1.25, output: 5.00 };
        let premium_claude = ModelRates { input: 3.00, output: 15.00 };

        Self {
            extraction: StageModels {
                primary: "google/gemini-2.5-flash".to_string(),
                paid_fallback: "meta-llama/llama-4-scout:free".to_string(),
                free_fallback: None,
                rates: budget,
                temperature: 0.3,
                max_tokens: 4000,
            },
            gap_analysis: StageModels {
                primary: "google/gemini-2.5-flash".to_string(),
                paid_fallback: "meta-llama/llama-4-scout:free".to_string(),
                free_fallback: None,
                rates: budget,
                temperature: 0.3,
                max_tokens: 2000,
            },
            strategy: StageModels {
                primary: "google/gemini-2.5-pro".to_string(),
                paid_fallback: "anthropic/claude-3.5-sonnet".to_string(),
                free_fallback: Some("google/gemini-2.0-flash-exp:free".to_string()),
                rates: premium_gemini,
                temperature: 0.8,
                max_tokens: 32000,
            },
            competitive: StageModels {
                primary: "google/gemini-2.5-pro".to_string(),
                paid_fallback: "anthropic/claude-3.5-sonnet".to_string(),
                free_fallback: Some("google/gemini-2.0-flash-exp:free".to_string()),
                rates: premium_gemini,
                temperature: 0.4,
                max_tokens: 4000,
            },
            risk_scoring: StageModels {
                primary: "anthropic/claude-3.5-sonnet".to_string(),
                paid_fallback: "openai/gpt-4o".to_string(),
                free_fallback: Some("google/gemini-2.0-flash-exp:free".to_string()),
                rates: premium_claude,
                temperature: 0.4,
                max_tokens: 4000,
            },
            polish: StageModels {
                primary: "anthropic/claude-3.5-sonnet".to_string(),
                paid_fallback: "openai/gpt-4o".to_string(),
                free_fallback: Some("google/gemini-2.0-flash-exp:free".to_string()),
                rates: premium_claude,
                temperature: 0.6,
                max_tokens: 16000,
            },
        }
    }
}

// ============================================================================
// Usage Stats
// ============================================================================

/// Token usage attached to every stage output as `_usage_stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

impl UsageStats {
    pub fn zero() -> Self {
        Self::default()
    }
}

// ============================================================================
// LLM Error Types
// ============================================================================

/// LLM service errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM API key not configured")]
    MissingApiKey,

    #[error("LLM API error: {0}")]
    Api(String),

    #[error("LLM response parsing error: {0}")]
    Parse(String),

    #[error("LLM timeout after {0}s")]
    Timeout(u64),

    #[error("LLM rate limited, retry after {0}s")]
    RateLimited(u64),

    #[error("content policy refusal: {0}")]
    ContentPolicyRefusal(String),

    #[error("{stage} failed after {attempts} attempts: {message}")]
    ExternalService { stage: String, attempts: u32, message: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LlmError {
    pub fn is_refusal(&self) -> bool {
        matches!(self, Self::ContentPolicyRefusal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_cost() {
        let rates = ModelRates { input: 3.00, output: 15.00 };
        let cost = rates.cost(1_000_000, 1_000_000);
        assert!((cost - 18.0).abs() < 1e-9);

        let cost = rates.cost(10_000, 2_000);
        assert!((cost - 0.06).abs() < 1e-9);
    }

    #[test]
    fn test_table_covers_all_stages() {
        let table = ModelTable::default();
        for stage in Stage::ALL {
            let models = table.for_stage(stage);
            assert!(!models.primary.is_empty());
            assert!(!models.paid_fallback.is_empty());
        }
        // Only premium stages carry a free fallback.
        assert!(table.extraction.free_fallback.is_none());
        assert!(table.strategy.free_fallback.is_some());
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::RiskScoring.as_str(), "risk_scoring");
        assert_eq!(Stage::GapAnalysis.as_str(), "gap_analysis");
    }
}
