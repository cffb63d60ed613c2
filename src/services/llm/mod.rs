//! LLM Service
//!
//! OpenRouter-style chat client with retry and refusal handling, per-stage
//! model selection, cost accounting and the optional real-time research
//! provider.

pub mod client;
pub mod cost;
pub mod models;
pub mod research;

pub use client::{ChatMessage, ChatOutcome, ChatRequest, ChatTransport, LlmClient, clean_json_response};
pub use cost::{AnalysisLogger, CostTracker, StageCostRecord};
pub use models::{LlmError, ModelRates, ModelTable, Stage, StageModels, UsageStats};
pub use research::{PerplexityProvider, ResearchProvider};
