//! LLM Client
//!
//! Chat-completion client for an OpenRouter-style API with retry logic:
//! progressive temperature decay, markdown fence stripping, balanced-brace
//! JSON extraction, content-policy-refusal detection and per-call cost
//! logging. The HTTP transport sits behind a trait so tests can script
//! responses without a network.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::cost::CostTracker;
use super::models::{LlmError, Stage, UsageStats};

const LLM_TIMEOUT_SECS: u64 = 120;
const MAX_RETRIES: u32 = 3;
const RETRY_TEMPERATURE_DECAY: f64 = 0.7;

/// Content policy refusal patterns, scanned lowercase.
const REFUSAL_PATTERNS: [&str; 6] = [
    "i'm sorry, i can't assist",
    "i cannot assist",
    "i can't help with that",
    "i cannot help with that",
    "desculpe, não posso ajudar",
    "não posso ajudar com isso",
];

const STRICT_JSON_SUFFIX: &str = "\n\n**CRITICAL: Output ONLY valid JSON. No markdown, no code \
     blocks, no explanations. Start with { and end with }.**";

// ============================================================================
// Chat Transport
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub content: String,
    pub usage: UsageStats,
}

/// Seam between the retry logic and the wire. Production uses the
/// OpenRouter-style HTTP transport; tests inject a scripted mock.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatOutcome, LlmError>;
}

/// HTTP transport for OpenRouter-compatible chat completion endpoints.
pub struct OpenRouterTransport {
    http_client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
}

impl OpenRouterTransport {
    pub fn new(api_base: impl Into<String>, api_key: Option<String>) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(LLM_TIMEOUT_SECS))
            .build()
            .expect("Failed to create HTTP client");

        Self { http_client, api_base: api_base.into(), api_key }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: i64,
    completion_tokens: i64,
}

#[async_trait]
impl ChatTransport for OpenRouterTransport {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatOutcome, LlmError> {
        let api_key = self.api_key.as_ref().ok_or(LlmError::MissingApiKey)?;

        let url = format!("{}/chat/completions", self.api_base.trim_end_matches('/'));

        tracing::debug!("Calling LLM API: {} with model {}", url, request.model);

        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(LLM_TIMEOUT_SECS)
                } else {
                    LlmError::Api(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(LlmError::RateLimited(retry_after));
        }

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LlmError::Api(format!("API error {}: {}", status, error_text)));
        }

        let chat_response: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        let content = chat_response
            .choices
            .first()
            .and_then(|c| c.message.content.as_ref())
            .ok_or_else(|| LlmError::Parse("Empty response from LLM".to_string()))?
            .trim()
            .to_string();

        let usage = chat_response
            .usage
            .map(|u| UsageStats { input_tokens: u.prompt_tokens, output_tokens: u.completion_tokens })
            .unwrap_or_default();

        Ok(ChatOutcome { content, usage })
    }
}

// ============================================================================
// LLM Client
// ============================================================================

/// Centralized LLM client. Cheap to clone; shared by all stages.
#[derive(Clone)]
pub struct LlmClient {
    transport: Arc<dyn ChatTransport>,
}

impl LlmClient {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self { transport }
    }

    pub fn open_router(api_base: impl Into<String>, api_key: Option<String>) -> Self {
        Self::new(Arc::new(OpenRouterTransport::new(api_base, api_key)))
    }

    /// Call the LLM and insist on valid JSON back.
    ///
    /// Each retry lowers the temperature by a factor of 0.7 and appends a
    /// stricter JSON-only suffix to the prompt. A content-policy refusal is
    /// surfaced as `LlmError::ContentPolicyRefusal` so stages can switch to
    /// a fallback model; everything else exhausts into
    /// `LlmError::ExternalService`.
    #[allow(clippy::too_many_arguments)]
    pub async fn call_with_retry(
        &self,
        stage: Stage,
        model: &str,
        prompt: &str,
        system_prompt: &str,
        temperature: f64,
        max_tokens: u32,
        cost_tracker: Option<&CostTracker>,
    ) -> Result<(String, UsageStats), LlmError> {
        let mut last_error: Option<LlmError> = None;

        for attempt in 0..MAX_RETRIES {
            let current_temp = temperature * RETRY_TEMPERATURE_DECAY.powi(attempt as i32);

            let strict_prompt;
            let effective_prompt = if attempt > 0 {
                tracing::warn!(
                    "[{}] Retry {}/{} with temperature {:.2}",
                    stage.as_str(),
                    attempt + 1,
                    MAX_RETRIES,
                    current_temp
                );
                strict_prompt = format!("{}{}", prompt, STRICT_JSON_SUFFIX);
                strict_prompt.as_str()
            } else {
                prompt
            };

            let system = if system_prompt.is_empty() {
                "Output JSON ONLY. No markdown. No explanations."
            } else {
                system_prompt
            };

            let request = ChatRequest {
                model: model.to_string(),
                messages: vec![
                    ChatMessage { role: "system".to_string(), content: system.to_string() },
                    ChatMessage { role: "user".to_string(), content: effective_prompt.to_string() },
                ],
                temperature: current_temp,
                max_tokens,
            };

            let start = Instant::now();
            let outcome = match self.transport.chat(&request).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(
                        "[{}] LLM call failed on attempt {}: {}",
                        stage.as_str(),
                        attempt + 1,
                        e
                    );
                    last_error = Some(e);
                    continue;
                },
            };
            let duration_ms = start.elapsed().as_millis() as u64;

            // Refusal check comes before JSON validation: a refusal must
            // trigger the fallback chain, not a parse retry.
            if let Some(pattern) = detect_refusal(&outcome.content) {
                tracing::warn!(
                    "[{}] Content policy refusal detected (pattern '{}'): {}",
                    stage.as_str(),
                    pattern,
                    truncate(&outcome.content, 100)
                );
                last_error =
                    Some(LlmError::ContentPolicyRefusal(truncate(&outcome.content, 100)));
                continue;
            }

            let cleaned = clean_json_response(&outcome.content);
            match serde_json::from_str::<Value>(&cleaned) {
                Ok(_) => {
                    if let Some(tracker) = cost_tracker {
                        tracker.log_usage(
                            stage,
                            model,
                            outcome.usage.input_tokens,
                            outcome.usage.output_tokens,
                            duration_ms,
                            true,
                        );
                    }
                    tracing::info!(
                        "[{}] Valid JSON received (attempt {}, {} in / {} out tokens)",
                        stage.as_str(),
                        attempt + 1,
                        outcome.usage.input_tokens,
                        outcome.usage.output_tokens
                    );
                    return Ok((cleaned, outcome.usage));
                },
                Err(e) => {
                    tracing::error!(
                        "[{}] JSON parse error on attempt {}: {} (preview: {})",
                        stage.as_str(),
                        attempt + 1,
                        e,
                        truncate(&cleaned, 200)
                    );
                    last_error = Some(LlmError::Parse(e.to_string()));
                },
            }
        }

        match last_error {
            Some(e @ LlmError::ContentPolicyRefusal(_)) => Err(e),
            Some(e) => Err(LlmError::ExternalService {
                stage: stage.as_str().to_string(),
                attempts: MAX_RETRIES,
                message: e.to_string(),
            }),
            None => Err(LlmError::ExternalService {
                stage: stage.as_str().to_string(),
                attempts: MAX_RETRIES,
                message: "no attempts executed".to_string(),
            }),
        }
    }
}

// ============================================================================
// Response Cleaning
// ============================================================================

/// Strip markdown fences and trim to the outermost balanced `{...}` block.
pub fn clean_json_response(content: &str) -> String {
    let mut content = content.trim();

    if let Some(start) = content.find("```json") {
        let after = &content[start + 7..];
        if let Some(end) = after.find("```") {
            content = after[..end].trim();
        }
    } else if let Some(start) = content.find("```") {
        let after = &content[start + 3..];
        if let Some(end) = after.find("```") {
            content = after[..end].trim();
        }
    }

    // Locate the first opening brace if the model wrapped JSON in prose.
    let content = match content.find('{') {
        Some(idx) => &content[idx..],
        None => content,
    };

    // Cut at the matching closing brace of the outermost object.
    if content.starts_with('{') {
        let mut depth = 0i32;
        let mut in_string = false;
        let mut escaped = false;
        for (i, ch) in content.char_indices() {
            if escaped {
                escaped = false;
                continue;
            }
            match ch {
                '\\' if in_string => escaped = true,
                '"' => in_string = !in_string,
                '{' if !in_string => depth += 1,
                '}' if !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        return content[..=i].to_string();
                    }
                },
                _ => {},
            }
        }
    }

    content.to_string()
}

fn detect_refusal(content: &str) -> Option<&'static str> {
    let lower = content.to_lowercase();
    REFUSAL_PATTERNS
        .iter()
        .find(|pattern| lower.contains(**pattern))
        .copied()
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingTransport {
        responses: Mutex<Vec<&'static str>>,
        seen: Mutex<Vec<(f64, String)>>,
    }

    impl RecordingTransport {
        fn new(mut responses: Vec<&'static str>) -> Arc<Self> {
            responses.reverse();
            Arc::new(Self { responses: Mutex::new(responses), seen: Mutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl ChatTransport for RecordingTransport {
        async fn chat(&self, request: &ChatRequest) -> Result<ChatOutcome, LlmError> {
            self.seen
                .lock()
                .unwrap()
                .push((request.temperature, request.messages[1].content.clone()));
            let content = self
                .responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or("{\"ok\": true}")
                .to_string();
            Ok(ChatOutcome {
                content,
                usage: UsageStats { input_tokens: 100, output_tokens: 10 },
            })
        }
    }

    #[tokio::test]
    async fn test_retries_decay_temperature_and_tighten_prompt() {
        let transport =
            RecordingTransport::new(vec!["not json", "still not json", "{\"ok\": true}"]);
        let client = LlmClient::new(transport.clone());

        let (response, usage) = client
            .call_with_retry(
                super::super::models::Stage::Strategy,
                "test-model",
                "analyse this",
                "system",
                0.8,
                1000,
                None,
            )
            .await
            .unwrap();

        assert_eq!(response, "{\"ok\": true}");
        assert_eq!(usage.input_tokens, 100);

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!((seen[0].0 - 0.8).abs() < 1e-9);
        assert!((seen[1].0 - 0.8 * 0.7).abs() < 1e-9);
        assert!((seen[2].0 - 0.8 * 0.49).abs() < 1e-9);

        // First attempt is the bare prompt; retries carry the strict suffix.
        assert_eq!(seen[0].1, "analyse this");
        assert!(seen[1].1.contains("CRITICAL: Output ONLY valid JSON"));
        assert!(seen[2].1.ends_with("Start with { and end with }.**"));
    }

    #[tokio::test]
    async fn test_refusal_exhausts_into_refusal_error() {
        let transport = RecordingTransport::new(vec![
            "I cannot assist with that request.",
            "I cannot assist with that request.",
            "I cannot assist with that request.",
        ]);
        let client = LlmClient::new(transport);

        let err = client
            .call_with_retry(
                super::super::models::Stage::Strategy,
                "test-model",
                "prompt",
                "",
                0.7,
                1000,
                None,
            )
            .await
            .unwrap_err();

        assert!(err.is_refusal(), "expected refusal, got {}", err);
    }

    #[tokio::test]
    async fn test_parse_exhaustion_is_external_service_error() {
        let transport = RecordingTransport::new(vec!["a", "b", "c"]);
        let client = LlmClient::new(transport);

        let err = client
            .call_with_retry(
                super::super::models::Stage::Extraction,
                "test-model",
                "prompt",
                "",
                0.7,
                1000,
                None,
            )
            .await
            .unwrap_err();

        match err {
            LlmError::ExternalService { stage, attempts, .. } => {
                assert_eq!(stage, "extraction");
                assert_eq!(attempts, 3);
            },
            other => panic!("expected external service error, got {}", other),
        }
    }

    #[test]
    fn test_clean_json_fenced_block() {
        let content = "Here is the result:\n```json\n{\"a\": 1}\n```\nHope that helps!";
        assert_eq!(clean_json_response(content), "{\"a\": 1}");
    }

    #[test]
    fn test_clean_json_bare_fences() {
        let content = "```\n{\"a\": 1}\n```";
        assert_eq!(clean_json_response(content), "{\"a\": 1}");
    }

    #[test]
    fn test_clean_json_embedded_in_prose() {
        let content = "Sure! {\"a\": {\"b\": 2}} trailing commentary";
        assert_eq!(clean_json_response(content), "{\"a\": {\"b\": 2}}");
    }

    #[test]
    fn test_clean_json_braces_inside_strings() {
        let content = "{\"text\": \"curly } inside\", \"n\": 1} extra";
        assert_eq!(clean_json_response(content), "{\"text\": \"curly } inside\", \"n\": 1}");
    }

    #[test]
    fn test_refusal_detection() {
        assert!(detect_refusal("I'm sorry, I can't assist with that.").is_some());
        assert!(detect_refusal("Desculpe, não posso ajudar com esse pedido.").is_some());
        assert!(detect_refusal("{\"ok\": true}").is_none());
    }
}
