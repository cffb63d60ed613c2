//! Stage 5 - Risk Quantification + Priority Scoring
//!
//! Premium reasoning model. Quantifies risks (probability x impact),
//! scores recommendations by effort/impact efficiency, builds the priority
//! matrix and the month-by-month critical path. Output must be Portuguese:
//! an English-giveaway check triggers a stricter rerun and then the free
//! fallback. Non-fatal.

use serde_json::Value;

use super::super::hallucination::fails_language_check;
use super::{StageRun, attach_usage};
use crate::services::llm::{CostTracker, LlmClient, LlmError, ModelTable, Stage};

const SYSTEM_PROMPT: &str = "Você é um especialista em gestão de riscos e priorização \
     estratégica. Quantifique com rigor. Responda somente JSON em português brasileiro.";

const STRICT_SYSTEM_PROMPT: &str = "RESPONDA EXCLUSIVAMENTE EM PORTUGUÊS BRASILEIRO. Qualquer \
     palavra em inglês invalida a resposta. Você é um especialista em gestão de riscos. \
     Somente JSON.";

/// Giveaway-word budget before a response is treated as English.
const ENGLISH_THRESHOLD: usize = 15;

pub async fn run(
    llm: &LlmClient,
    models: &ModelTable,
    tracker: &CostTracker,
    company: &str,
    strategic: &Value,
) -> Result<StageRun, LlmError> {
    tracing::info!("[stage 5] quantifying risks for {}", company);

    let prompt = build_prompt(company, strategic);
    let config = models.for_stage(Stage::RiskScoring);

    // First pass with the primary model.
    let (response, usage) = llm
        .call_with_retry(
            Stage::RiskScoring,
            &config.primary,
            &prompt,
            SYSTEM_PROMPT,
            config.temperature,
            config.max_tokens,
            Some(tracker),
        )
        .await?;

    let mut parsed: Value = serde_json::from_str(&response)?;
    let mut usage_total = usage;
    let mut model = config.primary.clone();

    if fails_language_check(&parsed, ENGLISH_THRESHOLD) {
        tracing::warn!("[stage 5] output reads as English, rerunning with strict system prompt");

        let retry = llm
            .call_with_retry(
                Stage::RiskScoring,
                &config.primary,
                &prompt,
                STRICT_SYSTEM_PROMPT,
                config.temperature * 0.7,
                config.max_tokens,
                Some(tracker),
            )
            .await;

        match retry {
            Ok((response, usage)) => {
                let reparsed: Value = serde_json::from_str(&response)?;
                usage_total.input_tokens += usage.input_tokens;
                usage_total.output_tokens += usage.output_tokens;
                if fails_language_check(&reparsed, ENGLISH_THRESHOLD) {
                    // Fall through to the free model.
                    if let Some(free) = &config.free_fallback {
                        tracing::warn!("[stage 5] still English, falling back to {}", free);
                        let (response, usage) = llm
                            .call_with_retry(
                                Stage::RiskScoring,
                                free,
                                &prompt,
                                STRICT_SYSTEM_PROMPT,
                                config.temperature * 0.7,
                                config.max_tokens,
                                Some(tracker),
                            )
                            .await?;
                        parsed = serde_json::from_str(&response)?;
                        usage_total.input_tokens += usage.input_tokens;
                        usage_total.output_tokens += usage.output_tokens;
                        model = free.clone();
                    } else {
                        parsed = reparsed;
                    }
                } else {
                    parsed = reparsed;
                }
            },
            Err(e) => {
                tracing::warn!("[stage 5] strict rerun failed, keeping first answer: {}", e);
            },
        }
    }

    validate_scores(&mut parsed);

    let risks = parsed["risk_analysis"].as_array().map(Vec::len).unwrap_or(0);
    tracing::info!("[stage 5] quantified {} risks via {}", risks, model);

    attach_usage(&mut parsed, usage_total);
    Ok(StageRun { output: parsed, model })
}

/// Recompute derived scores so arithmetic in the report is always
/// internally consistent, whatever the model returned.
fn validate_scores(output: &mut Value) {
    if let Some(risks) = output
        .get_mut("risk_analysis")
        .and_then(|v| v.as_array_mut())
    {
        for risk in risks {
            let probability = risk["probability"].as_f64().unwrap_or(0.0).clamp(0.0, 1.0);
            let impact = risk["impact"].as_f64().unwrap_or(1.0).clamp(1.0, 10.0);
            let score = probability * impact;
            risk["probability"] = Value::from(probability);
            risk["impact"] = Value::from(impact);
            risk["risk_score"] = Value::from((score * 100.0).round() / 100.0);
            risk["severidade"] = Value::from(severity_band(score));
        }
    }

    if let Some(recs) = output
        .get_mut("recommendation_scoring")
        .and_then(|v| v.as_array_mut())
    {
        for rec in recs {
            let effort = risk_clamp(rec["effort"].as_f64().unwrap_or(1.0));
            let impact = risk_clamp(rec["impact"].as_f64().unwrap_or(1.0));
            rec["effort"] = Value::from(effort);
            rec["impact"] = Value::from(impact);
            rec["efficiency_ratio"] = Value::from(((impact / effort) * 100.0).round() / 100.0);
        }
    }
}

fn risk_clamp(v: f64) -> f64 {
    v.clamp(1.0, 10.0)
}

fn severity_band(score: f64) -> &'static str {
    if score >= 7.0 {
        "crítica"
    } else if score >= 4.0 {
        "alta"
    } else if score >= 2.0 {
        "média"
    } else {
        "baixa"
    }
}

fn build_prompt(company: &str, strategic: &Value) -> String {
    let recommendations = serde_json::to_string_pretty(
        &strategic["parte_4_o_que_fazer_agora"]["recomendacoes_prioritarias"],
    )
    .unwrap_or_default();
    let swot = serde_json::to_string_pretty(&strategic["parte_1_onde_estamos"]["analise_swot"])
        .unwrap_or_default();
    let scenarios = serde_json::to_string_pretty(
        &strategic["parte_4_o_que_fazer_agora"]["planejamento_cenarios"],
    )
    .unwrap_or_default();

    format!(
        r#"**ATENÇÃO CRÍTICA: TODO O OUTPUT EM PORTUGUÊS BRASILEIRO PERFEITO E PROFISSIONAL.**
**NÃO USE INGLÊS EM HIPÓTESE ALGUMA.**

---

Para {company}, quantifique riscos e pontue recomendações por prioridade.

Recomendações estratégicas:
{recommendations}

Análise SWOT:
{swot}

Cenários:
{scenarios}

Retorne JSON:

{{
  "risk_analysis": [
    {{
      "risco": "...",
      "probability": 0.4,
      "impact": 7,
      "risk_score": 2.8,
      "severidade": "alta",
      "mitigacao": "..."
    }}
  ],
  "recommendation_scoring": [
    {{
      "recomendacao": "...",
      "effort": 4,
      "impact": 8,
      "efficiency_ratio": 2.0,
      "roi_estimado": {{"prazo_meses": 6, "retorno_esperado": "...", "premissas": []}},
      "prioridade": "alta"
    }}
  ],
  "priority_matrix": {{
    "quick_wins": [],
    "strategic_investments": [],
    "fill_ins": [],
    "avoid": []
  }},
  "critical_path": [
    {{"mes": 1, "foco": "...", "entregaveis": []}}
  ]
}}

Regras:
1. probability em [0,1]; impact e effort em [1,10]
2. risk_score = probability x impact; efficiency_ratio = impact / effort
3. priority_matrix classifica cada recomendação por esforço/impacto
4. critical_path mês a mês para os próximos 6 meses
5. Português brasileiro em todos os campos de texto"#,
        company = company,
        recommendations = recommendations,
        swot = swot,
        scenarios = scenarios,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scores_recomputed_consistently() {
        let mut output = json!({
            "risk_analysis": [
                {"risco": "câmbio", "probability": 0.5, "impact": 8, "risk_score": 99.0},
                {"risco": "regulatório", "probability": 1.4, "impact": 20, "risk_score": 0}
            ],
            "recommendation_scoring": [
                {"recomendacao": "expandir", "effort": 4, "impact": 8, "efficiency_ratio": 0}
            ]
        });

        validate_scores(&mut output);

        assert_eq!(output["risk_analysis"][0]["risk_score"], 4.0);
        assert_eq!(output["risk_analysis"][0]["severidade"], "alta");

        // Out-of-range values are clamped before scoring.
        assert_eq!(output["risk_analysis"][1]["probability"], 1.0);
        assert_eq!(output["risk_analysis"][1]["impact"], 10.0);
        assert_eq!(output["risk_analysis"][1]["risk_score"], 10.0);
        assert_eq!(output["risk_analysis"][1]["severidade"], "crítica");

        assert_eq!(output["recommendation_scoring"][0]["efficiency_ratio"], 2.0);
    }

    #[test]
    fn test_severity_bands() {
        assert_eq!(severity_band(8.0), "crítica");
        assert_eq!(severity_band(5.0), "alta");
        assert_eq!(severity_band(2.5), "média");
        assert_eq!(severity_band(0.5), "baixa");
    }
}
