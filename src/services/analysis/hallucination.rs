//! Hallucination Validator
//!
//! Post-hoc sanity checks over Stage-3 output: market-sizing coherence
//! (SOM <= SAM <= TAM plus size-band plausibility), source-attribution
//! scanning for quantitative claims, and an English-giveaway language
//! check for stages that must answer in Portuguese. Market sizing is the
//! only check that auto-repairs; everything else only logs.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};

use super::super::enrichment::reconcile::infer_company_size;

pub const INSUFFICIENT_DATA_STATUS: &str = "dados_insuficientes";

/// Size classification for the SOM/TAM plausibility bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompanySize {
    Small,
    Medium,
    Large,
}

impl CompanySize {
    /// Allowed SOM/TAM ratio band.
    pub fn som_tam_band(&self) -> (f64, f64) {
        match self {
            Self::Small => (0.0001, 0.005),
            Self::Medium => (0.005, 0.02),
            Self::Large => (0.02, 0.10),
        }
    }
}

static CURRENCY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)R\$\s*([\d.,]+)\s*(trilh(?:ão|ões|oes|ao)|bilh(?:ão|ões|oes|ao)|milh(?:ão|ões|oes|ao)|mil|bi|mi|tri)?")
        .expect("currency regex")
});

static CLAIM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)R\$\s*[\d.,]+\s*(?:bilh|milh)|\d+(?:[.,]\d+)?\s*%").expect("claim regex")
});

static ATTRIBUTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\((?:fonte|estimativa)[:\s]").expect("attribution regex"));

/// Parse a Brazilian currency string ("R$ 2,5 bilhões") to a plain number.
pub fn parse_currency_brl(text: &str) -> Option<f64> {
    let cap = CURRENCY_RE.captures(text)?;

    let raw = cap[1].to_string();
    // Brazilian notation: '.' thousands, ',' decimal.
    let normalized = raw.replace('.', "").replace(',', ".");
    let base: f64 = normalized.parse().ok()?;

    let multiplier = match cap.get(2).map(|m| m.as_str().to_lowercase()) {
        Some(unit) if unit.starts_with("trilh") || unit == "tri" => 1e12,
        Some(unit) if unit.starts_with("bilh") || unit == "bi" => 1e9,
        Some(unit) if unit.starts_with("milh") || unit == "mi" => 1e6,
        Some(unit) if unit == "mil" => 1e3,
        _ => 1.0,
    };

    Some(base * multiplier)
}

/// Detect company size from employee count or revenue.
pub fn detect_company_size(company_facts: &Value) -> CompanySize {
    if let Some(count) = company_facts
        .get("team_size")
        .or_else(|| company_facts.get("employee_count"))
        .and_then(|v| v.as_str())
    {
        return match infer_company_size(count) {
            "Micro" | "Pequena" => CompanySize::Small,
            "Média" => CompanySize::Medium,
            _ => CompanySize::Large,
        };
    }

    if let Some(revenue) = company_facts
        .get("revenue")
        .or_else(|| company_facts.get("annual_revenue"))
        .and_then(|v| v.as_str())
        && let Some(value) = parse_currency_brl(revenue)
    {
        return if value < 4_800_000.0 {
            // ME ceiling under Brazilian tax law.
            CompanySize::Small
        } else if value < 300_000_000.0 {
            CompanySize::Medium
        } else {
            CompanySize::Large
        };
    }

    CompanySize::Small
}

// ============================================================================
// Market Sizing
// ============================================================================

#[derive(Debug, Clone)]
pub struct MarketSizingVerdict {
    pub is_valid: bool,
    pub issues: Vec<String>,
}

/// Validate a TAM/SAM/SOM triple.
pub fn validate_market_sizing(
    tam: &str,
    sam: &str,
    som: &str,
    company_size: CompanySize,
) -> MarketSizingVerdict {
    let mut issues = Vec::new();

    let (Some(tam_v), Some(sam_v), Some(som_v)) =
        (parse_currency_brl(tam), parse_currency_brl(sam), parse_currency_brl(som))
    else {
        return MarketSizingVerdict {
            is_valid: false,
            issues: vec!["valores de mercado não numéricos".to_string()],
        };
    };

    if som_v > sam_v {
        issues.push(format!("SOM (R$ {:.0}) maior que SAM (R$ {:.0})", som_v, sam_v));
    }
    if sam_v > tam_v {
        issues.push(format!("SAM (R$ {:.0}) maior que TAM (R$ {:.0})", sam_v, tam_v));
    }

    if tam_v > 0.0 {
        let ratio = som_v / tam_v;
        let (min, max) = company_size.som_tam_band();
        if ratio < min || ratio > max {
            issues.push(format!(
                "SOM/TAM de {:.4}% fora da faixa plausível [{:.2}%, {:.2}%] para o porte detectado",
                ratio * 100.0,
                min * 100.0,
                max * 100.0
            ));
        }
    }

    MarketSizingVerdict { is_valid: issues.is_empty(), issues }
}

/// The replacement block used whenever quantitative sizing cannot be
/// trusted.
pub fn insufficient_data_sentinel() -> Value {
    json!({
        "status": INSUFFICIENT_DATA_STATUS,
        "mensagem": "Análise TAM/SAM/SOM requer dados adicionais para evitar estimativas imprecisas",
        "o_que_fornecer": [
            "Faturamento anual aproximado e ticket médio",
            "Número de clientes ativos e segmento-alvo",
            "Relatórios setoriais ou estimativas de mercado da indústria"
        ]
    })
}

/// Validate the `tam_sam_som` block inside a Stage-3 output and replace it
/// with the sentinel when it fails. Returns the issues found (empty when
/// nothing was wrong or the block was already the sentinel).
pub fn repair_market_sizing(strategy: &mut Value, company_size: CompanySize) -> Vec<String> {
    let Some(block) = strategy
        .get_mut("parte_2_onde_queremos_ir")
        .and_then(|p| p.get_mut("tam_sam_som"))
    else {
        return Vec::new();
    };

    if block.get("status").and_then(|s| s.as_str()) == Some(INSUFFICIENT_DATA_STATUS) {
        return Vec::new();
    }

    let tam = extract_market_value(block, "tam_total_market");
    let sam = extract_market_value(block, "sam_available_market");
    let som = extract_market_value(block, "som_obtainable_market");

    let verdict = validate_market_sizing(&tam, &sam, &som, company_size);
    if verdict.is_valid {
        return Vec::new();
    }

    tracing::warn!(
        "Market sizing failed validation, replacing with sentinel: {:?}",
        verdict.issues
    );
    *block = insufficient_data_sentinel();
    verdict.issues
}

/// The value may come as `{"valor": "R$ X"}` or as a plain string.
fn extract_market_value(block: &Value, key: &str) -> String {
    match block.get(key) {
        Some(Value::Object(map)) => map
            .get("valor")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

// ============================================================================
// Numeric Claim Attribution
// ============================================================================

/// Scan every string in the tree for quantitative claims lacking a
/// `(fonte: ...)` or `(estimativa: ...)` annotation. Violations are
/// reported, never auto-fixed.
pub fn scan_unattributed_claims(value: &Value) -> Vec<String> {
    let mut violations = Vec::new();
    walk_strings(value, &mut |path, text| {
        if CLAIM_RE.is_match(text) && !ATTRIBUTION_RE.is_match(text) {
            violations.push(format!("{}: '{}'", path, truncate(text, 120)));
        }
    });
    violations
}

// ============================================================================
// Language Check
// ============================================================================

/// Standalone English words that should not survive in Portuguese output.
const ENGLISH_GIVEAWAYS: [&str; 10] =
    ["the", "and", "with", "this", "that", "however", "therefore", "should", "market", "growth"];

/// Count English giveaway words across all strings in the tree.
pub fn count_english_giveaways(value: &Value) -> usize {
    let mut count = 0;
    walk_strings(value, &mut |_path, text| {
        for word in text.split(|c: char| !c.is_alphanumeric()) {
            let lower = word.to_lowercase();
            // Only the lowercase form counts: capitalized occurrences are
            // usually proper nouns or English brand names.
            if word == lower && ENGLISH_GIVEAWAYS.contains(&lower.as_str()) {
                count += 1;
            }
        }
    });
    count
}

/// Whether the output reads as English rather than Portuguese.
pub fn fails_language_check(value: &Value, threshold: usize) -> bool {
    count_english_giveaways(value) > threshold
}

fn walk_strings(value: &Value, visit: &mut impl FnMut(&str, &str)) {
    fn inner(value: &Value, path: &str, visit: &mut impl FnMut(&str, &str)) {
        match value {
            Value::String(s) => visit(path, s),
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    inner(item, &format!("{}[{}]", path, i), visit);
                }
            },
            Value::Object(map) => {
                for (k, v) in map {
                    let child = if path.is_empty() { k.clone() } else { format!("{}.{}", path, k) };
                    inner(v, &child, visit);
                }
            },
            _ => {},
        }
    }
    inner(value, "", visit);
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_parsing() {
        assert_eq!(parse_currency_brl("R$ 100 bilhões"), Some(100e9));
        assert_eq!(parse_currency_brl("R$ 2,5 milhões"), Some(2.5e6));
        assert_eq!(parse_currency_brl("R$ 1.200 mil"), Some(1_200_000.0));
        assert_eq!(parse_currency_brl("TAM estimado: R$ 5 bi no Brasil"), Some(5e9));
        assert_eq!(parse_currency_brl("sem valores"), None);
    }

    #[test]
    fn test_ordering_violation_detected() {
        // SAM > TAM and SOM > SAM.
        let verdict = validate_market_sizing(
            "R$ 100 bilhões",
            "R$ 200 bilhões",
            "R$ 50 bilhões",
            CompanySize::Small,
        );
        assert!(!verdict.is_valid);
        assert!(verdict.issues.iter().any(|i| i.contains("SAM")));
    }

    #[test]
    fn test_size_band_violation_for_small_company() {
        // Ordering fine, but SOM is 5% of TAM - absurd for a small company.
        let verdict = validate_market_sizing(
            "R$ 100 bilhões",
            "R$ 20 bilhões",
            "R$ 5 bilhões",
            CompanySize::Small,
        );
        assert!(!verdict.is_valid);

        // The same ratio is fine for a large company.
        let verdict = validate_market_sizing(
            "R$ 100 bilhões",
            "R$ 20 bilhões",
            "R$ 5 bilhões",
            CompanySize::Large,
        );
        assert!(verdict.is_valid);
    }

    #[test]
    fn test_plausible_sizing_passes() {
        let verdict = validate_market_sizing(
            "R$ 100 bilhões",
            "R$ 10 bilhões",
            "R$ 100 milhões",
            CompanySize::Small,
        );
        assert!(verdict.is_valid, "{:?}", verdict.issues);
    }

    #[test]
    fn test_repair_replaces_block_with_sentinel() {
        let mut strategy = serde_json::json!({
            "parte_2_onde_queremos_ir": {
                "tam_sam_som": {
                    "tam_total_market": {"valor": "R$ 100 bilhões"},
                    "sam_available_market": {"valor": "R$ 200 bilhões"},
                    "som_obtainable_market": {"valor": "R$ 50 bilhões"}
                }
            }
        });

        let issues = repair_market_sizing(&mut strategy, CompanySize::Small);
        assert!(!issues.is_empty());

        let block = &strategy["parte_2_onde_queremos_ir"]["tam_sam_som"];
        assert_eq!(block["status"], INSUFFICIENT_DATA_STATUS);
        assert!(block["mensagem"].is_string());
        assert_eq!(block["o_que_fornecer"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_repair_leaves_sentinel_alone() {
        let mut strategy = serde_json::json!({
            "parte_2_onde_queremos_ir": { "tam_sam_som": insufficient_data_sentinel() }
        });
        let issues = repair_market_sizing(&mut strategy, CompanySize::Small);
        assert!(issues.is_empty());
        assert_eq!(
            strategy["parte_2_onde_queremos_ir"]["tam_sam_som"]["status"],
            INSUFFICIENT_DATA_STATUS
        );
    }

    #[test]
    fn test_detect_company_size() {
        let facts = serde_json::json!({"team_size": "10-25"});
        assert_eq!(detect_company_size(&facts), CompanySize::Small);

        let facts = serde_json::json!({"team_size": "120"});
        assert_eq!(detect_company_size(&facts), CompanySize::Medium);

        let facts = serde_json::json!({"revenue": "R$ 500 milhões"});
        assert_eq!(detect_company_size(&facts), CompanySize::Large);

        assert_eq!(detect_company_size(&serde_json::json!({})), CompanySize::Small);
    }

    #[test]
    fn test_unattributed_claims_found() {
        let value = serde_json::json!({
            "ok": "Mercado de R$ 5 bilhões (fonte: ABFintechs 2025)",
            "also_ok": "Crescimento de 15% (estimativa: análise setorial)",
            "bad": "Receita projetada de R$ 300 milhões em 2026"
        });

        let violations = scan_unattributed_claims(&value);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].starts_with("bad:"));
    }

    #[test]
    fn test_language_check() {
        let portuguese = serde_json::json!({
            "resumo": "A empresa deve priorizar o crescimento sustentável do mercado interno."
        });
        assert!(!fails_language_check(&portuguese, 5));

        let english = serde_json::json!({
            "summary": "the company should expand the market and grow the revenue and the team \
                        with this strategy and that roadmap however the market growth should \
                        continue and the team should deliver"
        });
        assert!(fails_language_check(&english, 5));
    }
}
