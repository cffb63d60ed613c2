//! Confidence Learner
//!
//! Background job that adjusts per-(source, field) confidence scores from
//! user edit history. High edit rates reduce confidence, near-zero edit
//! rates boost it; scores are clamped to [0.10, 0.98] and never reach 1.0.
//! Idempotent and safe to cancel at any step.

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::session_repository::{EditRateStats, SessionRepository};
use crate::utils::scheduled_executor::ScheduledTask;

const HIGH_EDIT_THRESHOLD: f64 = 0.30;
const LOW_EDIT_THRESHOLD: f64 = 0.05;
const MAX_CONFIDENCE: f64 = 0.98;
const MIN_CONFIDENCE: f64 = 0.10;
const BOOST_MULTIPLIER: f64 = 1.2;
const PENALTY_FLOOR: f64 = 0.7;
const MIN_SAMPLE_SIZE: i64 = 10;
const DEFAULT_LOOKBACK_DAYS: i64 = 30;
const DEFAULT_CONFIDENCE: f64 = 0.70;

/// Result of one (source, field) learning pass.
#[derive(Debug, Clone, Serialize)]
pub struct LearnOutcome {
    pub source: String,
    pub field_name: String,
    pub updated: bool,
    pub sample_size: i64,
    pub multiplier: f64,
    pub old_confidence: f64,
    pub new_confidence: f64,
    pub new_success_rate: f64,
}

pub struct ConfidenceLearner {
    repo: SessionRepository,
    lookback_days: i64,
}

impl ConfidenceLearner {
    pub fn new(repo: SessionRepository) -> Self {
        Self { repo, lookback_days: DEFAULT_LOOKBACK_DAYS }
    }

    pub fn with_lookback_days(mut self, days: i64) -> Self {
        self.lookback_days = days;
        self
    }

    /// Refresh every (source, field) pair with enough recent suggestions.
    pub async fn refresh_source_confidences(&self) -> Result<Vec<LearnOutcome>, sqlx::Error> {
        let since = Utc::now() - ChronoDuration::days(self.lookback_days);
        let pairs = self
            .repo
            .pairs_with_min_suggestions(MIN_SAMPLE_SIZE, since)
            .await?;

        tracing::info!("Confidence learner: {} (source, field) pairs eligible", pairs.len());

        let mut outcomes = Vec::with_capacity(pairs.len());
        for (source, field_name) in pairs {
            let outcome = self
                .update_confidence_for_source(&source, &field_name)
                .await?;
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    /// Update the confidence score for one (source, field) combination.
    pub async fn update_confidence_for_source(
        &self,
        source: &str,
        field_name: &str,
    ) -> Result<LearnOutcome, sqlx::Error> {
        let since = Utc::now() - ChronoDuration::days(self.lookback_days);
        let stats = self
            .repo
            .fetch_edit_stats(source, field_name, since)
            .await?;

        let old_confidence = self
            .repo
            .get_source_performance(source, field_name)
            .await?
            .map(|p| p.confidence_score)
            .unwrap_or(DEFAULT_CONFIDENCE);

        if stats.total_suggestions < MIN_SAMPLE_SIZE {
            tracing::info!(
                "Insufficient data for {}/{}: {} suggestions (need {})",
                source,
                field_name,
                stats.total_suggestions,
                MIN_SAMPLE_SIZE
            );
            return Ok(LearnOutcome {
                source: source.to_string(),
                field_name: field_name.to_string(),
                updated: false,
                sample_size: stats.total_suggestions,
                multiplier: 1.0,
                old_confidence,
                new_confidence: old_confidence,
                new_success_rate: 0.0,
            });
        }

        let multiplier = confidence_multiplier(&stats);
        let new_confidence = (old_confidence * multiplier).clamp(MIN_CONFIDENCE, MAX_CONFIDENCE);
        let new_success_rate = 1.0 - stats.edit_rate();

        self.repo
            .upsert_source_performance(
                source,
                field_name,
                new_confidence,
                new_success_rate,
                stats.total_suggestions,
                stats.total_suggestions - stats.total_edits,
                multiplier.clamp(PENALTY_FLOOR, BOOST_MULTIPLIER),
            )
            .await?;

        tracing::info!(
            "Confidence updated for {}/{}: {:.2} -> {:.2} (multiplier {:.3}, edit rate {:.1}%)",
            source,
            field_name,
            old_confidence,
            new_confidence,
            multiplier,
            stats.edit_rate() * 100.0
        );

        Ok(LearnOutcome {
            source: source.to_string(),
            field_name: field_name.to_string(),
            updated: true,
            sample_size: stats.total_suggestions,
            multiplier,
            old_confidence,
            new_confidence,
            new_success_rate,
        })
    }
}

/// Multiplier from edit patterns; starts at 1.0.
fn confidence_multiplier(stats: &EditRateStats) -> f64 {
    let mut multiplier = 1.0;
    let edit_rate = stats.edit_rate();

    if edit_rate > HIGH_EDIT_THRESHOLD {
        let penalty = 1.0 - (edit_rate - HIGH_EDIT_THRESHOLD) / (1.0 - HIGH_EDIT_THRESHOLD);
        multiplier *= penalty.max(PENALTY_FLOOR);
    } else if edit_rate < LOW_EDIT_THRESHOLD {
        multiplier *= BOOST_MULTIPLIER;
    }

    if stats.significant_edit_rate() > 0.5 {
        multiplier *= 0.85;
    }

    if stats.avg_edit_distance > 10.0 {
        multiplier *= 0.90;
    } else if stats.avg_edit_distance < 2.0 && edit_rate > 0.0 {
        multiplier *= 1.05;
    }

    multiplier
}

/// Scheduled wrapper so the learner can run on the executor.
pub struct LearnerRefreshTask {
    learner: Arc<ConfidenceLearner>,
}

impl LearnerRefreshTask {
    pub fn new(learner: Arc<ConfidenceLearner>) -> Self {
        Self { learner }
    }
}

impl ScheduledTask for LearnerRefreshTask {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
        Box::pin(async move {
            let outcomes = self.learner.refresh_source_confidences().await?;
            let updated = outcomes.iter().filter(|o| o.updated).count();
            tracing::info!("Confidence learner refreshed {} pairs", updated);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn stats(
        total_suggestions: i64,
        total_edits: i64,
        significant_edits: i64,
        avg_edit_distance: f64,
    ) -> EditRateStats {
        EditRateStats { total_suggestions, total_edits, significant_edits, avg_edit_distance }
    }

    #[test]
    fn test_high_edit_rate_penalty() {
        // 45% edit rate: max(0.7, 1 - (0.45 - 0.30)/0.70) = 0.7857...
        let m = confidence_multiplier(&stats(100, 45, 0, 5.0));
        assert!((m - (1.0 - 0.15 / 0.70)).abs() < 1e-9);
    }

    #[test]
    fn test_penalty_floor() {
        // 95% edit rate would give 0.071 raw; floor holds at 0.7.
        let m = confidence_multiplier(&stats(100, 95, 0, 5.0));
        assert!((m - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_low_edit_rate_boost() {
        let m = confidence_multiplier(&stats(100, 2, 0, 5.0));
        assert!((m - 1.2).abs() < 1e-9);
    }

    #[test]
    fn test_significant_and_distance_factors() {
        // 40% edits, 60% significant, large distances.
        let m = confidence_multiplier(&stats(100, 40, 24, 15.0));
        let expected = (1.0 - 0.10 / 0.70) * 0.85 * 0.90;
        assert!((m - expected).abs() < 1e-9);

        // Tiny distances with some edits get the small boost.
        let m = confidence_multiplier(&stats(100, 10, 0, 1.0));
        assert!((m - 1.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_learner_adjustment_scenario() {
        // 100 suggestions, 45 edited, base confidence 0.80.
        let repo = SessionRepository::new(db::connect_memory().await);
        repo.upsert_source_performance("metadata_enhanced", "industry", 0.80, 0.9, 0, 0, 1.0)
            .await
            .unwrap();

        for i in 0..100 {
            let session = format!("s{}", i);
            repo.record_suggestion(&session, "industry", "metadata_enhanced", "Tech", 0.8)
                .await
                .unwrap();
            if i < 45 {
                repo.mark_suggestion_edited(&session, "industry", "Fintech")
                    .await
                    .unwrap();
                repo.insert_validation_record(
                    &session,
                    "industry",
                    "Tech",
                    "Fintech",
                    "metadata_enhanced",
                    0.8,
                    4,
                    "correction",
                    None,
                )
                .await
                .unwrap();
            }
        }

        let learner = ConfidenceLearner::new(SessionRepository::new(repo.pool().clone()));
        let outcome = learner
            .update_confidence_for_source("metadata_enhanced", "industry")
            .await
            .unwrap();

        assert!(outcome.updated);
        // 0.80 * max(0.7, 1 - (0.45 - 0.30)/0.70) ~= 0.629
        assert!((outcome.new_confidence - 0.80 * (1.0 - 0.15 / 0.70)).abs() < 1e-6);
        assert!((outcome.new_success_rate - 0.55).abs() < 1e-9);

        let perf = repo
            .get_source_performance("metadata_enhanced", "industry")
            .await
            .unwrap()
            .unwrap();
        assert!((perf.confidence_score - outcome.new_confidence).abs() < 1e-9);
        assert!((0.10..=0.98).contains(&perf.confidence_score));
    }

    #[tokio::test]
    async fn test_confidence_clamped_to_bounds() {
        let repo = SessionRepository::new(db::connect_memory().await);
        // Base already near the ceiling; a 1.2 boost must clamp to 0.98.
        repo.upsert_source_performance("google_places", "rating", 0.95, 0.99, 0, 0, 1.0)
            .await
            .unwrap();

        for i in 0..20 {
            repo.record_suggestion(&format!("s{}", i), "rating", "google_places", "4.7", 0.95)
                .await
                .unwrap();
        }

        let learner = ConfidenceLearner::new(SessionRepository::new(repo.pool().clone()));
        let outcome = learner
            .update_confidence_for_source("google_places", "rating")
            .await
            .unwrap();

        assert!((outcome.new_confidence - 0.98).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_insufficient_data_skips_update() {
        let repo = SessionRepository::new(db::connect_memory().await);
        for i in 0..5 {
            repo.record_suggestion(&format!("s{}", i), "phone", "google_places", "x", 0.9)
                .await
                .unwrap();
        }

        let learner = ConfidenceLearner::new(SessionRepository::new(repo.pool().clone()));
        let outcome = learner
            .update_confidence_for_source("google_places", "phone")
            .await
            .unwrap();

        assert!(!outcome.updated);
        assert_eq!(outcome.sample_size, 5);
        assert!(
            repo.get_source_performance("google_places", "phone")
                .await
                .unwrap()
                .is_none()
        );
    }
}
