//! Reconciliation Engine
//!
//! Turns the per-source field values from the parallel fan-out into one
//! winning value per field with a confidence score, resolving conflicts by
//! source trust. After merging, infers fields the sources could not fill
//! (company size band, digital maturity) and validates CNPJ format.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;

use super::source::SourceData;

/// Fields that hold lists and are merged by ordered union.
const LIST_FIELDS: [&str; 4] = ["specialties", "tags", "key_differentiators", "website_tech"];

const LIST_MERGE_LIMIT: usize = 5;

/// Technologies counted as "modern" for the digital-maturity inference.
const MODERN_TECH: [&str; 8] =
    ["React", "Next.js", "Vue.js", "Angular", "Vercel", "Tailwind", "GraphQL", "Node.js"];

/// Per-(source, field) trust scores, 0-100.
static SOURCE_TRUST: Lazy<HashMap<&'static str, HashMap<&'static str, f64>>> = Lazy::new(|| {
    let mut table = HashMap::new();

    table.insert(
        "receita_ws",
        HashMap::from([
            ("cnpj", 100.0),
            ("legal_name", 95.0),
            ("registration_status", 95.0),
            ("cnae", 90.0),
        ]),
    );
    table.insert(
        "clearbit",
        HashMap::from([
            ("employee_count", 90.0),
            ("annual_revenue", 85.0),
            ("founded_year", 90.0),
            ("industry", 80.0),
        ]),
    );
    table.insert(
        "google_places",
        HashMap::from([
            ("rating", 95.0),
            ("reviews_count", 95.0),
            ("phone", 90.0),
            ("address", 90.0),
            ("place_id", 100.0),
        ]),
    );
    table.insert(
        "proxycurl",
        HashMap::from([
            ("linkedin_url", 95.0),
            ("linkedin_followers", 85.0),
            ("specialties", 80.0),
        ]),
    );
    table.insert(
        "metadata_enhanced",
        HashMap::from([
            ("company_name", 70.0),
            ("description", 65.0),
            ("website_tech", 80.0),
            ("social_media", 75.0),
        ]),
    );
    table.insert("ip_api", HashMap::from([("ip_location", 60.0), ("timezone", 70.0)]));

    table
});

/// Default trust by source when no per-field score exists.
fn default_trust(source: &str) -> f64 {
    match source {
        "receita_ws" => 90.0,
        "clearbit" => 85.0,
        "google_places" => 85.0,
        "proxycurl" => 80.0,
        "openai_gpt" => 75.0,
        "free_company_data" => 75.0,
        "free_geocoding" => 80.0,
        "groq_ai" => 65.0,
        "metadata" | "metadata_enhanced" => 70.0,
        "ip_api" => 60.0,
        _ => 50.0,
    }
}

pub fn trust_score(source: &str, field: &str) -> f64 {
    SOURCE_TRUST
        .get(source)
        .and_then(|fields| fields.get(field))
        .copied()
        .unwrap_or_else(|| default_trust(source))
}

// ============================================================================
// Reconciliation
// ============================================================================

/// One logged conflict resolution (only written when >= 2 sources competed).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReconciliationEntry {
    pub field: String,
    pub sources: Vec<String>,
    pub winner: String,
    pub confidence: f64,
}

/// Output of the reconciliation pass.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Reconciled {
    pub data: Map<String, Value>,
    /// Per-field confidence, 0-100.
    pub confidences: HashMap<String, f64>,
    /// The winning source for every field.
    pub field_sources: HashMap<String, String>,
    pub log: Vec<ReconciliationEntry>,
}

struct Contribution {
    value: Value,
    source: String,
    trust: f64,
}

/// Merge per-source data into a single record.
///
/// `source_results` must be in the fixed selection order: ties break on
/// first-seen source, which keeps the output deterministic for a given
/// input set and trust table.
pub fn reconcile(source_results: &[(String, SourceData)]) -> Reconciled {
    let mut out = Reconciled::default();

    // Collect fields preserving first-seen order.
    let mut fields: Vec<String> = Vec::new();
    for (_, data) in source_results {
        for key in data.keys() {
            if !fields.iter().any(|f| f == key) {
                fields.push(key.clone());
            }
        }
    }

    for field in fields {
        let contributions: Vec<Contribution> = source_results
            .iter()
            .filter_map(|(source, data)| {
                data.get(&field)
                    .filter(|v| !v.is_null())
                    .map(|v| Contribution {
                        value: v.clone(),
                        source: source.clone(),
                        trust: trust_score(source, &field),
                    })
            })
            .collect();

        if contributions.is_empty() {
            continue;
        }

        if contributions.len() == 1 {
            let c = &contributions[0];
            out.confidences.insert(field.clone(), c.trust);
            out.field_sources.insert(field.clone(), c.source.clone());
            out.data.insert(field, c.value.clone());
            continue;
        }

        let (value, winner, confidence) = resolve_conflict(&field, &contributions);

        out.log.push(ReconciliationEntry {
            field: field.clone(),
            sources: contributions.iter().map(|c| c.source.clone()).collect(),
            winner: winner.clone(),
            confidence,
        });
        out.confidences.insert(field.clone(), confidence);
        out.field_sources.insert(field.clone(), winner);
        out.data.insert(field, value);
    }

    tracing::info!(
        "Reconciled {} fields from {} sources ({} conflicts resolved)",
        out.data.len(),
        source_results.len(),
        out.log.len()
    );

    out
}

fn resolve_conflict(field: &str, contributions: &[Contribution]) -> (Value, String, f64) {
    if LIST_FIELDS.contains(&field) || contributions[0].value.is_array() {
        return merge_lists(contributions);
    }

    // Numeric ranges (employee_count, annual_revenue) and plain strings
    // both take the highest-trust value. The strict `>` keeps ties on the
    // first-seen source.
    let mut winner = &contributions[0];
    for c in &contributions[1..] {
        if c.trust > winner.trust {
            winner = c;
        }
    }
    (winner.value.clone(), winner.source.clone(), winner.trust)
}

/// Union preserving first-seen order, truncated to five entries.
/// Confidence is the average trust of all contributing sources.
fn merge_lists(contributions: &[Contribution]) -> (Value, String, f64) {
    let mut merged: Vec<Value> = Vec::new();
    for c in contributions {
        if let Some(items) = c.value.as_array() {
            for item in items {
                if !merged.contains(item) {
                    merged.push(item.clone());
                }
            }
        }
    }
    merged.truncate(LIST_MERGE_LIMIT);

    let avg_trust = contributions.iter().map(|c| c.trust).sum::<f64>() / contributions.len() as f64;
    let sources = contributions
        .iter()
        .map(|c| c.source.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    (Value::Array(merged), sources, avg_trust)
}

// ============================================================================
// Learned Adjustments
// ============================================================================

/// Apply the learner's per-(source, field) multiplicative adjustments to
/// the field confidences. Raw trust times learned adjustment is the
/// effective confidence, capped at 98 - never full certainty.
pub fn apply_learned_adjustments(
    reconciled: &mut Reconciled,
    adjustments: &HashMap<(String, String), f64>,
) {
    for (field, confidence) in reconciled.confidences.iter_mut() {
        let Some(source) = reconciled.field_sources.get(field) else {
            continue;
        };
        if let Some(adjustment) = adjustments.get(&(source.clone(), field.clone())) {
            *confidence = (*confidence * adjustment).clamp(0.0, 98.0);
        }
    }
}

// ============================================================================
// Gap Inference
// ============================================================================

static NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("number regex"));

/// Fill fields no source provided, from what the merge produced.
pub fn infer_missing_fields(reconciled: &mut Reconciled) {
    if !reconciled.data.contains_key("company_size")
        && let Some(count) = reconciled.data.get("employee_count").cloned()
    {
        let count_str = value_to_string(&count);
        let size = infer_company_size(&count_str);
        reconciled.data.insert("company_size".to_string(), Value::String(size.to_string()));
        reconciled.confidences.insert("company_size".to_string(), 60.0);
        reconciled
            .field_sources
            .insert("company_size".to_string(), "inference".to_string());
    }

    if !reconciled.data.contains_key("digital_maturity")
        && let Some(tech) = reconciled.data.get("website_tech").cloned()
    {
        let technologies: Vec<String> = tech
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        let maturity = infer_digital_maturity(&technologies);
        reconciled
            .data
            .insert("digital_maturity".to_string(), Value::String(maturity.to_string()));
        reconciled.confidences.insert("digital_maturity".to_string(), 60.0);
        reconciled
            .field_sources
            .insert("digital_maturity".to_string(), "inference".to_string());
    }
}

/// Brazilian size bands: Micro <10, Pequena <50, Média <250, Grande >=250.
/// Ranges like "25-50" count as their midpoint.
pub fn infer_company_size(employee_count: &str) -> &'static str {
    let numbers: Vec<f64> = NUMBER_RE
        .find_iter(employee_count)
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .collect();

    let count = match numbers.len() {
        0 => return "Pequena",
        1 => numbers[0],
        _ => (numbers[0] + numbers[1]) / 2.0,
    };

    if count < 10.0 {
        "Micro"
    } else if count < 50.0 {
        "Pequena"
    } else if count < 250.0 {
        "Média"
    } else {
        "Grande"
    }
}

/// Alta with >= 3 modern technologies, Média with >= 1, Baixa otherwise.
pub fn infer_digital_maturity(technologies: &[String]) -> &'static str {
    let modern_count = technologies
        .iter()
        .filter(|t| MODERN_TECH.contains(&t.as_str()))
        .count();

    if modern_count >= 3 {
        "Alta"
    } else if modern_count >= 1 {
        "Média"
    } else {
        "Baixa"
    }
}

// ============================================================================
// Validation
// ============================================================================

/// A CNPJ must be exactly 14 digits once punctuation is stripped. Invalid
/// formats cost the field 10 confidence points.
pub fn validate_cnpj(reconciled: &mut Reconciled) {
    let Some(cnpj) = reconciled.data.get("cnpj").map(value_to_string) else {
        return;
    };

    let digits: String = cnpj.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() != 14 {
        tracing::warn!("Invalid CNPJ format '{}' - penalizing confidence", cnpj);
        if let Some(confidence) = reconciled.confidences.get_mut("cnpj") {
            *confidence = (*confidence - 10.0).max(0.0);
        }
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
