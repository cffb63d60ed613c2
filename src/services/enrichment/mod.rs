//! Data Enrichment
//!
//! The data-source fan-out and reconciliation engine: adapters behind
//! circuit breakers, trust-weighted merge, session persistence, edit
//! tracking and the confidence learner.

pub mod edit_tracker;
pub mod learner;
pub mod orchestrator;
pub mod reconcile;
pub mod session_repository;
pub mod source;
pub mod sources;

pub use edit_tracker::{EditTracker, EditType, classify_edit};
pub use learner::{ConfidenceLearner, LearnOutcome, LearnerRefreshTask};
pub use orchestrator::{BudgetTier, EnrichedCompany, EnrichmentOrchestrator};
pub use reconcile::{Reconciled, ReconciliationEntry, reconcile};
pub use session_repository::{FieldUpdate, SessionRepository, SourcePerformance};
pub use source::{EnrichContext, EnrichError, EnrichmentSource, SourceData, SourceTier};
