//! Database Initialization
//!
//! Opens the SQLite session store and creates the logical tables the core
//! relies on: enrichment sessions (warm cache), source performance and
//! edit-tracking tables (learner), and the per-stage LLM cache.
//! All timestamps are stored as UTC ISO-8601 text.

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;

pub async fn init_database(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    // SQLite creates the file, not the directory.
    if let Some(path) = database_url.strip_prefix("sqlite://")
        && let Some(parent) = std::path::Path::new(path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).ok();
    }

    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    create_tables(&pool).await?;

    tracing::info!("Database initialized at {}", database_url);
    Ok(pool)
}

/// In-memory pool with the full schema, for tests.
pub async fn connect_memory() -> SqlitePool {
    let pool = SqlitePool::connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    create_tables(&pool)
        .await
        .expect("Failed to create tables");
    pool
}

async fn create_tables(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS enrichment_sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cache_key TEXT NOT NULL UNIQUE,
            website_url TEXT NOT NULL,
            user_email TEXT,
            session_data TEXT NOT NULL DEFAULT '{}',
            total_cost_usd REAL NOT NULL DEFAULT 0,
            total_duration_ms INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            expires_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS enrichment_source_performance (
            source TEXT NOT NULL,
            field_name TEXT NOT NULL,
            confidence_score REAL NOT NULL,
            success_rate REAL NOT NULL,
            total_attempts INTEGER NOT NULL DEFAULT 0,
            successful_fills INTEGER NOT NULL DEFAULT 0,
            learned_adjustment REAL NOT NULL DEFAULT 1.0,
            last_updated TEXT NOT NULL,
            PRIMARY KEY (source, field_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS auto_fill_suggestions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            field_name TEXT NOT NULL,
            source TEXT NOT NULL,
            suggested_value TEXT NOT NULL,
            confidence_score REAL NOT NULL,
            was_edited INTEGER NOT NULL DEFAULT 0,
            final_value TEXT,
            edited_at TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS field_validation_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            field_name TEXT NOT NULL,
            original_value TEXT NOT NULL,
            edited_value TEXT NOT NULL,
            source TEXT NOT NULL,
            original_confidence REAL NOT NULL,
            edit_distance INTEGER NOT NULL,
            edit_type TEXT NOT NULL,
            user_id TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stage_cache (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            stage TEXT NOT NULL,
            cache_key TEXT NOT NULL UNIQUE,
            response_json TEXT NOT NULL,
            cost_usd REAL NOT NULL DEFAULT 0,
            hit_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
