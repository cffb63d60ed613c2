//! Edit Tracker
//!
//! Records user edits to auto-filled fields: marks the suggestion edited,
//! computes the Levenshtein distance, classifies the edit and appends a
//! validation-history record. This history is what the confidence learner
//! consumes.

use super::session_repository::SessionRepository;
use crate::utils::text::levenshtein;

/// Edit classification bands by similarity = 1 - distance/max_length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditType {
    NoChange,
    Minor,
    Correction,
    Major,
    CompleteRewrite,
}

impl EditType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoChange => "no_change",
            Self::Minor => "minor",
            Self::Correction => "correction",
            Self::Major => "major",
            Self::CompleteRewrite => "complete_rewrite",
        }
    }
}

/// Classify an edit. Total over all (original, edited) pairs; equal pairs
/// map to `NoChange`.
pub fn classify_edit(original: &str, edited: &str) -> (EditType, usize) {
    if original == edited {
        return (EditType::NoChange, 0);
    }
    if original.is_empty() || edited.is_empty() {
        let distance = levenshtein(original, edited);
        return (EditType::CompleteRewrite, distance);
    }

    let distance = levenshtein(original, edited);
    let max_length = original.chars().count().max(edited.chars().count());
    let similarity = 1.0 - (distance as f64 / max_length as f64);

    let edit_type = if similarity > 0.9 {
        EditType::Minor
    } else if similarity > 0.7 {
        EditType::Correction
    } else if similarity > 0.4 {
        EditType::Major
    } else {
        EditType::CompleteRewrite
    };

    (edit_type, distance)
}

pub struct EditTracker {
    repo: SessionRepository,
}

impl EditTracker {
    pub fn new(repo: SessionRepository) -> Self {
        Self { repo }
    }

    /// Record one user edit end to end.
    #[allow(clippy::too_many_arguments)]
    pub async fn track_edit(
        &self,
        session_id: &str,
        field_name: &str,
        original_value: &str,
        edited_value: &str,
        source: &str,
        original_confidence: f64,
        user_id: Option<&str>,
    ) -> Result<EditType, sqlx::Error> {
        let (edit_type, distance) = classify_edit(original_value, edited_value);

        if edit_type != EditType::NoChange {
            self.repo
                .mark_suggestion_edited(session_id, field_name, edited_value)
                .await?;
        }

        self.repo
            .insert_validation_record(
                session_id,
                field_name,
                original_value,
                edited_value,
                source,
                original_confidence,
                distance as i64,
                edit_type.as_str(),
                user_id,
            )
            .await?;

        tracing::info!(
            "Tracked edit for {}/{}: {} (distance {})",
            source,
            field_name,
            edit_type.as_str(),
            distance
        );

        Ok(edit_type)
    }
}
