//! Session Store Repository
//!
//! Database operations over the opaque session store: progressive
//! enrichment sessions, auto-fill suggestions, field validation history
//! and the learned source-performance table. All timestamps are stored as
//! UTC ISO-8601 text.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

// ============================================================================
// Three-Valued Column Update
// ============================================================================

/// Update intent for an optional column: leave it alone, clear it, or set
/// it. Distinguishes "unset" from "set to NULL" at the store boundary.
#[derive(Debug, Clone, Default)]
pub enum FieldUpdate<T> {
    #[default]
    Unchanged,
    Clear,
    Set(T),
}

impl<T> FieldUpdate<T> {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Self::Unchanged)
    }

    fn as_option(&self) -> Option<Option<&T>> {
        match self {
            Self::Unchanged => None,
            Self::Clear => Some(None),
            Self::Set(v) => Some(Some(v)),
        }
    }
}

// ============================================================================
// Rows
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EnrichmentSession {
    pub id: i64,
    pub cache_key: String,
    pub website_url: String,
    pub user_email: Option<String>,
    pub session_data: String,
    pub total_cost_usd: f64,
    pub total_duration_ms: i64,
    pub status: String,
    pub expires_at: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SourcePerformance {
    pub source: String,
    pub field_name: String,
    pub confidence_score: f64,
    pub success_rate: f64,
    pub total_attempts: i64,
    pub successful_fills: i64,
    pub learned_adjustment: f64,
    pub last_updated: String,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AutoFillSuggestion {
    pub id: i64,
    pub session_id: String,
    pub field_name: String,
    pub source: String,
    pub suggested_value: String,
    pub confidence_score: f64,
    pub was_edited: bool,
    pub final_value: Option<String>,
    pub edited_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub id: i64,
    pub session_id: String,
    pub field_name: String,
    pub original_value: String,
    pub edited_value: String,
    pub source: String,
    pub original_confidence: f64,
    pub edit_distance: i64,
    pub edit_type: String,
    pub user_id: Option<String>,
    pub created_at: String,
}

/// Aggregates the learner reads. Suggestion counts come from
/// `auto_fill_suggestions`; edit statistics from
/// `field_validation_history`. Two explicit queries, joined in Rust.
#[derive(Debug, Clone, Default)]
pub struct EditRateStats {
    pub total_suggestions: i64,
    pub total_edits: i64,
    pub significant_edits: i64,
    pub avg_edit_distance: f64,
}

impl EditRateStats {
    pub fn edit_rate(&self) -> f64 {
        if self.total_suggestions > 0 {
            self.total_edits as f64 / self.total_suggestions as f64
        } else {
            0.0
        }
    }

    pub fn significant_edit_rate(&self) -> f64 {
        if self.total_edits > 0 {
            self.significant_edits as f64 / self.total_edits as f64
        } else {
            0.0
        }
    }
}

// ============================================================================
// Repository
// ============================================================================

pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Enrichment sessions
    // ------------------------------------------------------------------

    pub async fn get_session(
        &self,
        cache_key: &str,
    ) -> Result<Option<EnrichmentSession>, sqlx::Error> {
        sqlx::query_as::<_, EnrichmentSession>(
            "SELECT * FROM enrichment_sessions WHERE cache_key = ?",
        )
        .bind(cache_key)
        .fetch_optional(&self.pool)
        .await
    }

    /// Upsert a session row. Optional columns follow the three-valued
    /// update: `Unchanged` keeps whatever the row has.
    pub async fn upsert_session(
        &self,
        cache_key: &str,
        website_url: &str,
        status: &str,
        user_email: FieldUpdate<String>,
        total_cost_usd: Option<f64>,
        total_duration_ms: Option<i64>,
        ttl_days: i64,
    ) -> Result<(), sqlx::Error> {
        let now = Utc::now().to_rfc3339();
        let expires_at = (Utc::now() + ChronoDuration::days(ttl_days)).to_rfc3339();

        sqlx::query(
            r#"INSERT INTO enrichment_sessions
               (cache_key, website_url, status, expires_at, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(cache_key) DO UPDATE SET
               status = excluded.status,
               expires_at = excluded.expires_at,
               updated_at = excluded.updated_at"#,
        )
        .bind(cache_key)
        .bind(website_url)
        .bind(status)
        .bind(&expires_at)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        if let Some(email) = user_email.as_option() {
            sqlx::query("UPDATE enrichment_sessions SET user_email = ? WHERE cache_key = ?")
                .bind(email.map(|s| s.as_str()))
                .bind(cache_key)
                .execute(&self.pool)
                .await?;
        }
        if let Some(cost) = total_cost_usd {
            sqlx::query("UPDATE enrichment_sessions SET total_cost_usd = ? WHERE cache_key = ?")
                .bind(cost)
                .bind(cache_key)
                .execute(&self.pool)
                .await?;
        }
        if let Some(duration) = total_duration_ms {
            sqlx::query("UPDATE enrichment_sessions SET total_duration_ms = ? WHERE cache_key = ?")
                .bind(duration)
                .bind(cache_key)
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Auto-fill suggestions
    // ------------------------------------------------------------------

    pub async fn record_suggestion(
        &self,
        session_id: &str,
        field_name: &str,
        source: &str,
        suggested_value: &str,
        confidence_score: f64,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            r#"INSERT INTO auto_fill_suggestions
               (session_id, field_name, source, suggested_value, confidence_score, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(session_id)
        .bind(field_name)
        .bind(source)
        .bind(suggested_value)
        .bind(confidence_score)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn mark_suggestion_edited(
        &self,
        session_id: &str,
        field_name: &str,
        final_value: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"UPDATE auto_fill_suggestions
               SET was_edited = 1, final_value = ?, edited_at = ?
               WHERE session_id = ? AND field_name = ?"#,
        )
        .bind(final_value)
        .bind(Utc::now().to_rfc3339())
        .bind(session_id)
        .bind(field_name)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Validation history
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_validation_record(
        &self,
        session_id: &str,
        field_name: &str,
        original_value: &str,
        edited_value: &str,
        source: &str,
        original_confidence: f64,
        edit_distance: i64,
        edit_type: &str,
        user_id: Option<&str>,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            r#"INSERT INTO field_validation_history
               (session_id, field_name, original_value, edited_value, source,
                original_confidence, edit_distance, edit_type, user_id, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(session_id)
        .bind(field_name)
        .bind(original_value)
        .bind(edited_value)
        .bind(source)
        .bind(original_confidence)
        .bind(edit_distance)
        .bind(edit_type)
        .bind(user_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    // ------------------------------------------------------------------
    // Learner reads
    // ------------------------------------------------------------------

    /// Edit statistics for one (source, field) over the lookback window.
    pub async fn fetch_edit_stats(
        &self,
        source: &str,
        field_name: &str,
        since: DateTime<Utc>,
    ) -> Result<EditRateStats, sqlx::Error> {
        let since = since.to_rfc3339();

        let (total_suggestions, total_edits): (i64, i64) = sqlx::query_as(
            r#"SELECT COUNT(*), COALESCE(SUM(was_edited), 0)
               FROM auto_fill_suggestions
               WHERE source = ? AND field_name = ? AND created_at >= ?"#,
        )
        .bind(source)
        .bind(field_name)
        .bind(&since)
        .fetch_one(&self.pool)
        .await?;

        let (significant_edits, avg_edit_distance): (i64, f64) = sqlx::query_as(
            r#"SELECT
               COALESCE(SUM(CASE WHEN edit_type IN ('major', 'complete_rewrite') THEN 1 ELSE 0 END), 0),
               COALESCE(AVG(edit_distance), 0.0)
               FROM field_validation_history
               WHERE source = ? AND field_name = ? AND created_at >= ?"#,
        )
        .bind(source)
        .bind(field_name)
        .bind(&since)
        .fetch_one(&self.pool)
        .await?;

        Ok(EditRateStats { total_suggestions, total_edits, significant_edits, avg_edit_distance })
    }

    /// All (source, field) pairs with enough suggestions to learn from.
    pub async fn pairs_with_min_suggestions(
        &self,
        min_suggestions: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, String)>, sqlx::Error> {
        sqlx::query_as(
            r#"SELECT source, field_name FROM auto_fill_suggestions
               WHERE created_at >= ?
               GROUP BY source, field_name
               HAVING COUNT(*) >= ?
               ORDER BY source, field_name"#,
        )
        .bind(since.to_rfc3339())
        .bind(min_suggestions)
        .fetch_all(&self.pool)
        .await
    }

    // ------------------------------------------------------------------
    // Source performance
    // ------------------------------------------------------------------

    /// The learner's multiplicative adjustments, keyed (source, field).
    /// Reconciliation multiplies raw trust by these.
    pub async fn learned_adjustments(
        &self,
    ) -> Result<std::collections::HashMap<(String, String), f64>, sqlx::Error> {
        let rows: Vec<(String, String, f64)> = sqlx::query_as(
            "SELECT source, field_name, learned_adjustment FROM enrichment_source_performance",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(source, field, adjustment)| ((source, field), adjustment))
            .collect())
    }

    pub async fn get_source_performance(
        &self,
        source: &str,
        field_name: &str,
    ) -> Result<Option<SourcePerformance>, sqlx::Error> {
        sqlx::query_as::<_, SourcePerformance>(
            "SELECT * FROM enrichment_source_performance WHERE source = ? AND field_name = ?",
        )
        .bind(source)
        .bind(field_name)
        .fetch_optional(&self.pool)
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_source_performance(
        &self,
        source: &str,
        field_name: &str,
        confidence_score: f64,
        success_rate: f64,
        new_attempts: i64,
        new_fills: i64,
        learned_adjustment: f64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO enrichment_source_performance
               (source, field_name, confidence_score, success_rate,
                total_attempts, successful_fills, learned_adjustment, last_updated)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(source, field_name) DO UPDATE SET
               confidence_score = excluded.confidence_score,
               success_rate = excluded.success_rate,
               total_attempts = enrichment_source_performance.total_attempts + excluded.total_attempts,
               successful_fills = enrichment_source_performance.successful_fills + excluded.successful_fills,
               learned_adjustment = excluded.learned_adjustment,
               last_updated = excluded.last_updated"#,
        )
        .bind(source)
        .bind(field_name)
        .bind(confidence_score)
        .bind(success_rate)
        .bind(new_attempts)
        .bind(new_fills)
        .bind(learned_adjustment)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
