//! Multi-Tier Enrichment Cache
//!
//! Three layers queried hot -> warm -> cold, each with its own TTL:
//! - Hot: in-process map, 1 hour. Recent enrichment per domain-layer.
//! - Warm: `enrichment_sessions` row with per-layer sub-blobs, 30 days.
//! - Cold: object store at `static/{domain}/company_data.json`, forever,
//!   holding only fields that never change (legal name, founded year, ...).
//!
//! A hit at tier k promotes the value into all hotter tiers. Cache errors
//! never fail an enrichment: any tier failure is treated as a miss.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{Map, Value, json};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::content_hash::short_hash;

/// Fields that never change for a registered company. Only these go to the
/// cold tier.
const STATIC_FIELDS: [&str; 6] = [
    "legal_name",
    "founded_year",
    "company_number",
    "jurisdiction",
    "registration_status",
    "opencorporates_url",
];

// ============================================================================
// Cache Statistics
// ============================================================================

/// Process-wide cache counters. Mutated under atomics only; safe to share
/// across concurrent pipelines.
#[derive(Debug, Default)]
pub struct CacheStats {
    hot_hits: AtomicU64,
    warm_hits: AtomicU64,
    cold_hits: AtomicU64,
    misses: AtomicU64,
    savings_microusd: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatsSnapshot {
    pub hot_hits: u64,
    pub warm_hits: u64,
    pub cold_hits: u64,
    pub misses: u64,
    pub total_requests: u64,
    pub hit_rate_percent: f64,
    pub total_savings_usd: f64,
}

impl CacheStats {
    fn record_hit(&self, counter: &AtomicU64, saved_usd: f64) {
        counter.fetch_add(1, Ordering::Relaxed);
        self.savings_microusd
            .fetch_add((saved_usd * 1_000_000.0) as u64, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let hot = self.hot_hits.load(Ordering::Relaxed);
        let warm = self.warm_hits.load(Ordering::Relaxed);
        let cold = self.cold_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hot + warm + cold + misses;
        let hits = hot + warm + cold;

        let hit_rate = if total > 0 { (hits as f64 / total as f64) * 100.0 } else { 0.0 };

        CacheStatsSnapshot {
            hot_hits: hot,
            warm_hits: warm,
            cold_hits: cold,
            misses,
            total_requests: total,
            hit_rate_percent: (hit_rate * 100.0).round() / 100.0,
            total_savings_usd: self.savings_microusd.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

// ============================================================================
// Cold Tier: Object Store
// ============================================================================

/// Opaque object store behind the cold tier. Production deployments bind
/// this to a bucket; the bundled implementation writes to local disk.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> std::io::Result<Option<String>>;
    async fn put(&self, key: &str, body: &str) -> std::io::Result<()>;
}

/// Filesystem-backed object store.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> std::io::Result<Option<String>> {
        let path = self.root.join(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn put(&self, key: &str, body: &str) -> std::io::Result<()> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, body).await
    }
}

// ============================================================================
// Multi-Tier Cache
// ============================================================================

#[derive(Debug, Clone)]
struct HotEntry {
    value: Value,
    expires_at: Instant,
}

pub struct MultiTierCache {
    hot: RwLock<HashMap<String, HotEntry>>,
    pool: SqlitePool,
    cold: Option<std::sync::Arc<dyn ObjectStore>>,
    stats: CacheStats,
    hot_ttl: Duration,
    warm_ttl_days: i64,
    // Serialises warm read-modify-write per process; the store itself is
    // externally serialised per session_id.
    warm_write: tokio::sync::Mutex<()>,
}

impl MultiTierCache {
    pub fn new(
        pool: SqlitePool,
        cold: Option<std::sync::Arc<dyn ObjectStore>>,
        hot_ttl: Duration,
        warm_ttl_days: i64,
    ) -> Self {
        Self {
            hot: RwLock::new(HashMap::new()),
            pool,
            cold,
            stats: CacheStats::default(),
            hot_ttl,
            warm_ttl_days,
            warm_write: tokio::sync::Mutex::new(()),
        }
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Look up cached enrichment data or run `enrich` on miss.
    pub async fn get_or_enrich<F, Fut, E>(
        &self,
        domain: &str,
        layer: u8,
        estimated_cost: f64,
        enrich: F,
    ) -> Result<Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Value, E>>,
    {
        let domain = normalize_domain(domain);
        let key = hot_key(&domain, layer);

        if let Some(value) = self.get_hot(&key) {
            self.stats.record_hit(&self.stats.hot_hits, estimated_cost);
            tracing::info!("[cache] HOT hit: {} L{} (saved ${:.4})", domain, layer, estimated_cost);
            return Ok(value);
        }

        if let Some(value) = self.get_warm(&domain, layer).await {
            self.stats.record_hit(&self.stats.warm_hits, estimated_cost);
            tracing::info!("[cache] WARM hit: {} L{} (saved ${:.4})", domain, layer, estimated_cost);
            self.set_hot(&key, &value);
            return Ok(value);
        }

        // Cold tier only holds static company data, filled from layer 2.
        if layer == 2
            && let Some(value) = self.get_cold(&domain).await
        {
            self.stats.record_hit(&self.stats.cold_hits, estimated_cost);
            tracing::info!("[cache] COLD hit: {} L{} (saved ${:.4})", domain, layer, estimated_cost);
            self.set_warm(&domain, layer, &value).await;
            self.set_hot(&key, &value);
            return Ok(value);
        }

        self.stats.record_miss();
        tracing::info!("[cache] MISS: {} L{} - enriching (est ${:.4})", domain, layer, estimated_cost);

        let result = enrich().await?;

        self.set_hot(&key, &result);
        self.set_warm(&domain, layer, &result).await;
        if layer == 2 && has_static_fields(&result) {
            self.set_cold(&domain, &result).await;
        }

        Ok(result)
    }

    fn get_hot(&self, key: &str) -> Option<Value> {
        let guard = self.hot.read().ok()?;
        let entry = guard.get(key)?;
        if entry.expires_at > Instant::now() {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    fn set_hot(&self, key: &str, value: &Value) {
        if let Ok(mut guard) = self.hot.write() {
            guard.insert(
                key.to_string(),
                HotEntry { value: value.clone(), expires_at: Instant::now() + self.hot_ttl },
            );
        }
    }

    async fn get_warm(&self, domain: &str, layer: u8) -> Option<Value> {
        let cache_key = warm_key(domain);
        let row: (String, String) = sqlx::query_as(
            "SELECT session_data, expires_at FROM enrichment_sessions WHERE cache_key = ?",
        )
        .bind(&cache_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| tracing::debug!("warm cache read failed: {}", e))
        .ok()??;

        let (session_data, expires_at) = row;
        let expires_at: DateTime<Utc> = expires_at.parse().ok()?;
        if expires_at <= Utc::now() {
            return None;
        }

        let session: Value = serde_json::from_str(&session_data).ok()?;
        session
            .get(format!("layer{}", layer))
            .and_then(|l| l.get("data"))
            .cloned()
    }

    async fn set_warm(&self, domain: &str, layer: u8, data: &Value) {
        let _guard = self.warm_write.lock().await;
        let cache_key = warm_key(domain);

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT session_data FROM enrichment_sessions WHERE cache_key = ?")
                .bind(&cache_key)
                .fetch_optional(&self.pool)
                .await
                .unwrap_or(None);

        let mut session: Value = existing
            .and_then(|(s,)| serde_json::from_str(&s).ok())
            .unwrap_or_else(|| json!({}));

        session[format!("layer{}", layer)] = json!({
            "data": data,
            "cached_at": Utc::now().to_rfc3339(),
        });

        let expires_at = (Utc::now() + ChronoDuration::days(self.warm_ttl_days)).to_rfc3339();
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            r#"INSERT INTO enrichment_sessions
               (cache_key, website_url, session_data, status, expires_at, created_at, updated_at)
               VALUES (?, ?, ?, 'cached', ?, ?, ?)
               ON CONFLICT(cache_key) DO UPDATE SET
               session_data = excluded.session_data,
               expires_at = excluded.expires_at,
               updated_at = excluded.updated_at"#,
        )
        .bind(&cache_key)
        .bind(format!("https://{}", domain))
        .bind(session.to_string())
        .bind(&expires_at)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::debug!("warm cache write failed: {}", e);
        }
    }

    async fn get_cold(&self, domain: &str) -> Option<Value> {
        let store = self.cold.as_ref()?;
        let key = cold_key(domain);
        match store.get(&key).await {
            Ok(Some(body)) => serde_json::from_str(&body).ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::debug!("cold cache read failed: {}", e);
                None
            },
        }
    }

    async fn set_cold(&self, domain: &str, data: &Value) {
        let Some(store) = self.cold.as_ref() else { return };

        let static_data = extract_static_fields(data);
        if static_data.is_empty() {
            return;
        }

        let key = cold_key(domain);
        if let Err(e) = store.put(&key, &Value::Object(static_data).to_string()).await {
            tracing::debug!("cold cache write failed: {}", e);
        }
    }
}

fn normalize_domain(domain: &str) -> String {
    domain
        .trim()
        .to_lowercase()
        .trim_start_matches("www.")
        .to_string()
}

fn hot_key(domain: &str, layer: u8) -> String {
    format!("enrich:{}:{}:{}", layer, domain, short_hash(domain))
}

fn warm_key(domain: &str) -> String {
    format!("progressive_enrichment:{}", domain)
}

fn cold_key(domain: &str) -> String {
    format!("static/{}/company_data.json", domain)
}

/// Static fields may sit at the top level or under a `data` sub-object
/// (the reconciled-record envelope).
fn static_field_map(value: &Value) -> Option<&Map<String, Value>> {
    match value.get("data") {
        Some(Value::Object(inner)) => Some(inner),
        _ => value.as_object(),
    }
}

fn has_static_fields(data: &Value) -> bool {
    static_field_map(data)
        .map(|map| STATIC_FIELDS.iter().any(|f| map.contains_key(*f)))
        .unwrap_or(false)
}

fn extract_static_fields(data: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    if let Some(map) = static_field_map(data) {
        for field in STATIC_FIELDS {
            if let Some(v) = map.get(field) {
                out.insert(field.to_string(), v.clone());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::convert::Infallible;
    use std::sync::atomic::AtomicBool;

    async fn test_cache() -> MultiTierCache {
        let pool = db::connect_memory().await;
        MultiTierCache::new(pool, None, Duration::from_secs(3600), 30)
    }

    async fn lookup(cache: &MultiTierCache, domain: &str, layer: u8, fresh: Value) -> (Value, bool) {
        let called = AtomicBool::new(false);
        let value = cache
            .get_or_enrich(domain, layer, 0.05, || async {
                called.store(true, Ordering::Relaxed);
                Ok::<_, Infallible>(fresh)
            })
            .await
            .unwrap();
        (value, called.load(Ordering::Relaxed))
    }

    #[tokio::test]
    async fn test_miss_then_hot_hit() {
        let cache = test_cache().await;

        let (v1, called) =
            lookup(&cache, "TechStart.com.br", 1, json!({"company_name": "TechStart"})).await;
        assert!(called);
        assert_eq!(v1["company_name"], "TechStart");

        // Second call must not invoke the enrich function.
        let (v2, called) =
            lookup(&cache, "techstart.com.br", 1, json!({"company_name": "fresh"})).await;
        assert!(!called);
        assert_eq!(v2, v1);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hot_hits, 1);
        assert!(stats.hit_rate_percent >= 50.0);
        assert!((stats.total_savings_usd - 0.05).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_warm_hit_promotes_to_hot() {
        let cache = test_cache().await;

        lookup(&cache, "acme.com", 2, json!({"legal_name": "Acme Ltda"})).await;

        // Drop the hot tier, keep the warm row.
        cache.hot.write().unwrap().clear();

        let (value, called) = lookup(&cache, "acme.com", 2, json!({"legal_name": "wrong"})).await;
        assert!(!called);
        assert_eq!(value["legal_name"], "Acme Ltda");
        assert_eq!(cache.stats().warm_hits, 1);

        // Promotion: the next read is a hot hit.
        let (_, called) = lookup(&cache, "acme.com", 2, json!({})).await;
        assert!(!called);
        assert_eq!(cache.stats().hot_hits, 1);
    }

    #[tokio::test]
    async fn test_cold_tier_round_trip() {
        let dir = std::env::temp_dir().join(format!("bussola-cold-{}", uuid::Uuid::new_v4()));
        let store: std::sync::Arc<dyn ObjectStore> =
            std::sync::Arc::new(FsObjectStore::new(&dir));

        let pool = db::connect_memory().await;
        let cache =
            MultiTierCache::new(pool, Some(store.clone()), Duration::from_secs(3600), 30);

        lookup(
            &cache,
            "acme.com",
            2,
            json!({
                "legal_name": "Acme Ltda",
                "founded_year": 1999,
                "description": "volatile field, not static"
            }),
        )
        .await;

        let body = store.get("static/acme.com/company_data.json").await.unwrap().unwrap();
        let stored: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(stored["legal_name"], "Acme Ltda");
        assert_eq!(stored["founded_year"], 1999);
        assert!(stored.get("description").is_none());

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[test]
    fn test_static_field_detection() {
        assert!(has_static_fields(&json!({"legal_name": "X"})));
        assert!(!has_static_fields(&json!({"description": "Y"})));
    }
}
