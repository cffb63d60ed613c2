//! Data Quality Tiers
//!
//! Five-level quality label derived from input coverage, gating which
//! Stage-3 sections are produced. The enabled-section table lives here and
//! only here; the orchestrator and the strategy prompt both read it.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Minimal,
    Partial,
    Good,
    Full,
    Legendary,
}

impl QualityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legendary => "legendary",
            Self::Full => "full",
            Self::Good => "good",
            Self::Partial => "partial",
            Self::Minimal => "minimal",
        }
    }
}

/// Coverage signals observed after Stage 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoverageSignals {
    pub website_provided: bool,
    pub enrichment_succeeded: bool,
    pub research_succeeded: bool,
    pub challenge_provided: bool,
    pub financial_data_found: bool,
}

/// One coverage point per signal: 5 -> legendary, 4 -> full, 3 -> good,
/// 2 -> partial, otherwise minimal.
pub fn assess_quality(signals: CoverageSignals) -> QualityTier {
    let score = [
        signals.website_provided,
        signals.enrichment_succeeded,
        signals.research_succeeded,
        signals.challenge_provided,
        signals.financial_data_found,
    ]
    .iter()
    .filter(|b| **b)
    .count();

    match score {
        5 => QualityTier::Legendary,
        4 => QualityTier::Full,
        3 => QualityTier::Good,
        2 => QualityTier::Partial,
        _ => QualityTier::Minimal,
    }
}

const ALL_SECTIONS: &[&str] = &[
    "pestel",
    "porter",
    "swot",
    "blue_ocean",
    "positioning",
    "tam_sam_som",
    "balanced_scorecard",
    "okrs",
    "roadmap",
    "growth_loops",
    "scenarios",
    "recommendations",
    "decision_matrix",
    "integration_map",
    "case_references",
    "review_cycle",
];

const GOOD_SECTIONS: &[&str] = &[
    "pestel",
    "porter",
    "swot",
    "blue_ocean",
    "positioning",
    "tam_sam_som",
    "okrs_q1",
    "roadmap",
    "scenarios",
    "recommendations",
];

const PARTIAL_SECTIONS: &[&str] =
    &["pestel", "porter", "swot", "positioning", "roadmap", "recommendations"];

const MINIMAL_SECTIONS: &[&str] = &["pestel_brief", "swot", "positioning", "recommendations"];

/// The canonical enabled-section set per tier.
pub fn enabled_sections(tier: QualityTier) -> &'static [&'static str] {
    match tier {
        QualityTier::Legendary | QualityTier::Full => ALL_SECTIONS,
        QualityTier::Good => GOOD_SECTIONS,
        QualityTier::Partial => PARTIAL_SECTIONS,
        QualityTier::Minimal => MINIMAL_SECTIONS,
    }
}

/// Whether the tier allows quantitative market sizing at all.
pub fn allows_market_sizing(tier: QualityTier) -> bool {
    enabled_sections(tier).contains(&"tam_sam_som")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals(n: usize) -> CoverageSignals {
        CoverageSignals {
            website_provided: n >= 1,
            enrichment_succeeded: n >= 2,
            research_succeeded: n >= 3,
            challenge_provided: n >= 4,
            financial_data_found: n >= 5,
        }
    }

    #[test]
    fn test_tier_from_coverage_score() {
        assert_eq!(assess_quality(signals(5)), QualityTier::Legendary);
        assert_eq!(assess_quality(signals(4)), QualityTier::Full);
        assert_eq!(assess_quality(signals(3)), QualityTier::Good);
        assert_eq!(assess_quality(signals(2)), QualityTier::Partial);
        assert_eq!(assess_quality(signals(1)), QualityTier::Minimal);
        assert_eq!(assess_quality(signals(0)), QualityTier::Minimal);
    }

    #[test]
    fn test_partial_excludes_market_sizing_and_okrs() {
        let sections = enabled_sections(QualityTier::Partial);
        assert!(!sections.contains(&"tam_sam_som"));
        assert!(!sections.iter().any(|s| s.starts_with("okrs")));
        assert!(!allows_market_sizing(QualityTier::Partial));
    }

    #[test]
    fn test_good_keeps_market_sizing_with_q1_okrs() {
        let sections = enabled_sections(QualityTier::Good);
        assert!(sections.contains(&"tam_sam_som"));
        assert!(sections.contains(&"okrs_q1"));
        assert!(!sections.contains(&"okrs"));
    }

    #[test]
    fn test_full_gets_everything() {
        assert_eq!(enabled_sections(QualityTier::Full), ALL_SECTIONS);
        assert_eq!(enabled_sections(QualityTier::Legendary), ALL_SECTIONS);
    }

    #[test]
    fn test_minimal_is_the_short_list() {
        assert_eq!(
            enabled_sections(QualityTier::Minimal),
            &["pestel_brief", "swot", "positioning", "recommendations"]
        );
    }
}
