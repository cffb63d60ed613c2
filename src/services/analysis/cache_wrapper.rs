//! Stage Cache
//!
//! Content-hashed memoisation for the expensive LLM stages. Keys are
//! `(stage, company, industry, content_hash(inputs))`; values are the
//! stage output verbatim plus cost attribution. A cache hit zeroes
//! `_usage_stats` before returning. Cache errors never fail a stage: on
//! any read or write problem the stage simply runs uncached.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{Value, json};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::services::cache::content_hash::content_hash;
use crate::services::llm::LlmError;

/// TTL per cache kind, in minutes.
fn ttl_minutes(stage: &str) -> i64 {
    match stage {
        // Whole-report cache.
        "analysis" => 30 * 24 * 60,
        // Rendered exports live the longest.
        "pdf" => 90 * 24 * 60,
        "dashboard" => 5,
        // All LLM stages share one week.
        _ => 7 * 24 * 60,
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StageCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_percent: f64,
    pub cost_saved_usd: f64,
}

/// Per-stage LLM cache: hot in-process map in front of a warm database
/// table, both keyed by the same content hash.
pub struct StageCache {
    pool: SqlitePool,
    hot: RwLock<HashMap<String, (Value, DateTime<Utc>)>>,
    hits: AtomicU64,
    misses: AtomicU64,
    saved_microusd: AtomicU64,
}

impl StageCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            hot: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            saved_microusd: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> StageCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 { hits as f64 / total as f64 * 100.0 } else { 0.0 };

        StageCacheStats {
            hits,
            misses,
            hit_rate_percent: (hit_rate * 100.0).round() / 100.0,
            cost_saved_usd: self.saved_microusd.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }

    pub fn cache_key(stage: &str, company: &str, industry: &str, input: &Value) -> String {
        format!("{}:{}:{}:{}", stage, company, industry, content_hash(input))
    }

    pub async fn get(
        &self,
        stage: &str,
        company: &str,
        industry: &str,
        input: &Value,
    ) -> Option<Value> {
        let key = Self::cache_key(stage, company, industry, input);

        if let Ok(guard) = self.hot.read()
            && let Some((value, expires_at)) = guard.get(&key)
            && *expires_at > Utc::now()
        {
            return Some(value.clone());
        }

        let row: (String, String) = sqlx::query_as(
            "SELECT response_json, expires_at FROM stage_cache WHERE cache_key = ?",
        )
        .bind(&key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| tracing::warn!("stage cache read failed for '{}': {}", stage, e))
        .ok()??;

        let (response_json, expires_at) = row;
        let expires_at: DateTime<Utc> = expires_at.parse().ok()?;
        if expires_at <= Utc::now() {
            return None;
        }

        let value: Value = serde_json::from_str(&response_json).ok()?;

        sqlx::query("UPDATE stage_cache SET hit_count = hit_count + 1 WHERE cache_key = ?")
            .bind(&key)
            .execute(&self.pool)
            .await
            .ok();

        if let Ok(mut guard) = self.hot.write() {
            guard.insert(key, (value.clone(), expires_at));
        }

        Some(value)
    }

    pub async fn put(
        &self,
        stage: &str,
        company: &str,
        industry: &str,
        input: &Value,
        result: &Value,
        cost_usd: f64,
    ) {
        let key = Self::cache_key(stage, company, industry, input);
        let expires_at = Utc::now() + ChronoDuration::minutes(ttl_minutes(stage));

        let outcome = sqlx::query(
            r#"INSERT INTO stage_cache (stage, cache_key, response_json, cost_usd, created_at, expires_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(cache_key) DO UPDATE SET
               response_json = excluded.response_json,
               cost_usd = excluded.cost_usd,
               expires_at = excluded.expires_at"#,
        )
        .bind(stage)
        .bind(&key)
        .bind(result.to_string())
        .bind(cost_usd)
        .bind(Utc::now().to_rfc3339())
        .bind(expires_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        if let Err(e) = outcome {
            tracing::warn!("stage cache write failed for '{}': {}", stage, e);
        }

        if let Ok(mut guard) = self.hot.write() {
            guard.insert(key, (result.clone(), expires_at));
        }
    }

    /// Drop one entry (manual invalidation).
    pub async fn invalidate(&self, stage: &str, company: &str, industry: &str, input: &Value) {
        let key = Self::cache_key(stage, company, industry, input);
        if let Ok(mut guard) = self.hot.write() {
            guard.remove(&key);
        }
        sqlx::query("DELETE FROM stage_cache WHERE cache_key = ?")
            .bind(&key)
            .execute(&self.pool)
            .await
            .ok();
    }

    fn record_hit(&self, estimated_cost: f64) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.saved_microusd
            .fetch_add((estimated_cost * 1_000_000.0) as u64, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }
}

/// Execute a stage with transparent caching.
///
/// Checks the cache first; on miss runs `stage_fn` and stores the result.
/// On a hit, `_usage_stats` is replaced with zeros - tokens were only
/// spent on the original run.
pub async fn run_stage_with_cache<F, Fut>(
    cache: &StageCache,
    stage: &str,
    company: &str,
    industry: &str,
    input: &Value,
    estimated_cost: f64,
    stage_fn: F,
) -> Result<Value, LlmError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<Value, LlmError>>,
{
    if let Some(mut cached) = cache.get(stage, company, industry, input).await {
        cache.record_hit(estimated_cost);
        tracing::info!("[cache hit] stage '{}' loaded from cache (saves ${:.4})", stage, estimated_cost);

        if let Some(map) = cached.as_object_mut() {
            map.insert("_usage_stats".to_string(), json!({"input_tokens": 0, "output_tokens": 0}));
        }
        return Ok(cached);
    }

    cache.record_miss();
    tracing::info!("[cache miss] stage '{}' - executing fresh", stage);

    let result = stage_fn().await?;

    cache
        .put(stage, company, industry, input, &result, estimated_cost)
        .await;

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_hit_zeroes_usage_stats() {
        let cache = StageCache::new(db::connect_memory().await);
        let input = json!({"company": "TechStart"});

        let calls = AtomicU32::new(0);
        let run = || async {
            calls.fetch_add(1, Ordering::Relaxed);
            Ok(json!({
                "company_facts": {"name": "TechStart"},
                "_usage_stats": {"input_tokens": 1200, "output_tokens": 300}
            }))
        };

        let first = run_stage_with_cache(&cache, "extraction", "TechStart", "Tech", &input, 0.002, run)
            .await
            .unwrap();
        assert_eq!(first["_usage_stats"]["input_tokens"], 1200);

        let run2 = || async {
            calls.fetch_add(1, Ordering::Relaxed);
            Ok(json!({"never": "called"}))
        };
        let second =
            run_stage_with_cache(&cache, "extraction", "TechStart", "Tech", &input, 0.002, run2)
                .await
                .unwrap();

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(second["_usage_stats"]["input_tokens"], 0);
        assert_eq!(second["_usage_stats"]["output_tokens"], 0);
        assert_eq!(second["company_facts"]["name"], "TechStart");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!(stats.hit_rate_percent >= 50.0);
    }

    #[tokio::test]
    async fn test_key_depends_on_input_hash() {
        let cache = StageCache::new(db::connect_memory().await);

        let run_a = || async { Ok(json!({"v": "a"})) };
        run_stage_with_cache(&cache, "strategy", "X", "Y", &json!({"h": 1}), 0.15, run_a)
            .await
            .unwrap();

        let run_b = || async { Ok(json!({"v": "b"})) };
        let out = run_stage_with_cache(&cache, "strategy", "X", "Y", &json!({"h": 2}), 0.15, run_b)
            .await
            .unwrap();
        assert_eq!(out["v"], "b");
        assert_eq!(cache.stats().misses, 2);
    }

    #[tokio::test]
    async fn test_key_reorder_is_same_entry() {
        let cache = StageCache::new(db::connect_memory().await);

        let input_a: Value = serde_json::from_str(r#"{"a": 1, "b": 2}"#).unwrap();
        let input_b: Value = serde_json::from_str(r#"{"b": 2, "a": 1}"#).unwrap();

        let run = || async { Ok(json!({"v": "cached"})) };
        run_stage_with_cache(&cache, "strategy", "X", "Y", &input_a, 0.15, run)
            .await
            .unwrap();

        let hit = cache.get("strategy", "X", "Y", &input_b).await;
        assert!(hit.is_some());
    }

    #[tokio::test]
    async fn test_stage_errors_propagate_and_are_not_cached() {
        let cache = StageCache::new(db::connect_memory().await);
        let input = json!({"x": 1});

        let failing = || async {
            Err(LlmError::ExternalService {
                stage: "strategy".into(),
                attempts: 3,
                message: "boom".into(),
            })
        };
        let result =
            run_stage_with_cache(&cache, "strategy", "X", "Y", &input, 0.15, failing).await;
        assert!(result.is_err());

        assert!(cache.get("strategy", "X", "Y", &input).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_forces_fresh_run() {
        let cache = StageCache::new(db::connect_memory().await);
        let input = json!({"x": 1});

        let run = || async { Ok(json!({"v": 1})) };
        run_stage_with_cache(&cache, "polish", "X", "Y", &input, 0.01, run)
            .await
            .unwrap();

        cache.invalidate("polish", "X", "Y", &input).await;
        assert!(cache.get("polish", "X", "Y", &input).await.is_none());
    }
}
