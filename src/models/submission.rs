//! Submission Model
//!
//! The immutable per-run input to the analysis pipeline.

use serde::{Deserialize, Serialize};

/// A business submission to be analysed.
///
/// Created once per pipeline run and discarded afterwards. Only `company`
/// and `industry` are mandatory; everything else improves data quality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: i64,
    pub company: String,
    pub industry: String,
    pub website: Option<String>,
    pub challenge: Option<String>,
    pub linkedin_company: Option<String>,
    pub linkedin_founder: Option<String>,
}

impl Submission {
    pub fn new(id: i64, company: impl Into<String>, industry: impl Into<String>) -> Self {
        Self {
            id,
            company: company.into(),
            industry: industry.into(),
            website: None,
            challenge: None,
            linkedin_company: None,
            linkedin_founder: None,
        }
    }

    /// Extract the bare domain from the website URL, if any.
    ///
    /// `https://www.techstart.com.br/about` -> `techstart.com.br`
    pub fn domain(&self) -> Option<String> {
        let url = self.website.as_deref()?.trim();
        if url.is_empty() {
            return None;
        }

        let without_scheme = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .unwrap_or(url);

        let host = without_scheme
            .split(['/', '?', '#'])
            .next()
            .unwrap_or(without_scheme);

        let host = host.strip_prefix("www.").unwrap_or(host);
        let host = host.split(':').next().unwrap_or(host);

        if host.is_empty() {
            None
        } else {
            Some(host.to_lowercase())
        }
    }
}

/// User-visible processing state, written to the external submission store
/// by the caller of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    Queued,
    DataGathering,
    AiAnalyzing,
    Finalizing,
    Completed,
    Failed,
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::DataGathering => "data_gathering",
            Self::AiAnalyzing => "ai_analyzing",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse_state(s: &str) -> Self {
        match s {
            "queued" => Self::Queued,
            "data_gathering" => Self::DataGathering,
            "ai_analyzing" => Self::AiAnalyzing,
            "finalizing" => Self::Finalizing,
            "completed" => Self::Completed,
            _ => Self::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_extraction() {
        let mut sub = Submission::new(1, "TechStart", "Tecnologia");
        assert_eq!(sub.domain(), None);

        sub.website = Some("https://www.techstart.com.br/about?x=1".to_string());
        assert_eq!(sub.domain(), Some("techstart.com.br".to_string()));

        sub.website = Some("http://Example.COM:8080".to_string());
        assert_eq!(sub.domain(), Some("example.com".to_string()));

        sub.website = Some("techstart.com.br".to_string());
        assert_eq!(sub.domain(), Some("techstart.com.br".to_string()));
    }

    #[test]
    fn test_processing_state_round_trip() {
        for state in [
            ProcessingState::Queued,
            ProcessingState::DataGathering,
            ProcessingState::AiAnalyzing,
            ProcessingState::Finalizing,
            ProcessingState::Completed,
            ProcessingState::Failed,
        ] {
            assert_eq!(ProcessingState::parse_state(state.as_str()), state);
        }
    }
}
