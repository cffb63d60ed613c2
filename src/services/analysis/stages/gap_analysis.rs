//! Stage 2 - Gap Analysis + Follow-Up Research
//!
//! Budget-tier model generates up to three targeted research queries from
//! the extraction's `data_gaps`; each query goes to the real-time research
//! provider. Failures downgrade to `follow_up_completed: false` - this
//! stage never blocks the pipeline.

use serde_json::{Value, json};

use super::{StageRun, attach_usage};
use crate::services::llm::{
    CostTracker, LlmClient, LlmError, ModelTable, ResearchProvider, Stage, UsageStats,
};

const SYSTEM_PROMPT: &str =
    "You are a research analyst. Generate targeted queries to fill data gaps. Output JSON only.";

const MAX_FOLLOW_UPS: usize = 3;
const FOLLOW_UP_MAX_TOKENS: u32 = 1000;

pub async fn run(
    llm: &LlmClient,
    models: &ModelTable,
    tracker: &CostTracker,
    research: &dyn ResearchProvider,
    company: &str,
    industry: &str,
    extracted: &Value,
) -> Result<StageRun, LlmError> {
    let config = models.for_stage(Stage::GapAnalysis);

    let data_gaps = extracted["data_gaps"].as_array().cloned().unwrap_or_default();
    if data_gaps.is_empty() {
        tracing::info!("[stage 2] no data gaps identified, skipping follow-up");
        let mut output = json!({
            "follow_up_completed": false,
            "follow_up_research": {},
            "data_gaps_filled": 0,
        });
        attach_usage(&mut output, UsageStats::zero());
        return Ok(StageRun { output, model: config.primary.clone() });
    }

    let prompt = build_prompt(company, industry, &data_gaps, extracted);

    let (response, usage) = llm
        .call_with_retry(
            Stage::GapAnalysis,
            &config.primary,
            &prompt,
            SYSTEM_PROMPT,
            config.temperature,
            config.max_tokens,
            Some(tracker),
        )
        .await?;

    let gap_analysis: Value = serde_json::from_str(&response)?;
    let queries: Vec<String> = gap_analysis["follow_up_queries"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .take(MAX_FOLLOW_UPS)
                .collect()
        })
        .unwrap_or_default();

    if queries.is_empty() {
        let mut output = json!({
            "follow_up_completed": false,
            "follow_up_research": {},
            "data_gaps_filled": 0,
        });
        attach_usage(&mut output, usage);
        return Ok(StageRun { output, model: config.primary.clone() });
    }

    tracing::info!("[stage 2] running {} follow-up research queries", queries.len());

    let mut follow_up_results = serde_json::Map::new();
    for (i, query) in queries.iter().enumerate() {
        match research.research(query, FOLLOW_UP_MAX_TOKENS).await {
            Ok(answer) => {
                follow_up_results.insert(
                    format!("followup_{}", i + 1),
                    json!({"query": query, "research": answer}),
                );
                tracing::info!("[stage 2] follow-up {} completed", i + 1);
            },
            Err(e) => {
                tracing::warn!("[stage 2] follow-up {} failed: {}", i + 1, e);
            },
        }
    }

    tracing::info!(
        "[stage 2] completed {}/{} follow-up queries",
        follow_up_results.len(),
        queries.len()
    );

    let gaps_filled = follow_up_results.len();
    let mut output = json!({
        "follow_up_completed": true,
        "follow_up_research": follow_up_results,
        "data_gaps_filled": gaps_filled,
        "priority_gaps": gap_analysis["priority_gaps"].clone(),
    });
    attach_usage(&mut output, usage);
    Ok(StageRun { output, model: config.primary.clone() })
}

fn build_prompt(company: &str, industry: &str, data_gaps: &[Value], extracted: &Value) -> String {
    let gaps_json = serde_json::to_string_pretty(data_gaps).unwrap_or_default();
    let context: String = extracted.to_string().chars().take(2000).collect();

    format!(
        r#"Com base nestas lacunas de dados para {company} no setor de {industry}, gere de 2 a 3 consultas de pesquisa direcionadas:

Lacunas identificadas:
{gaps_json}

Dados atuais (resumo):
{context}

Gere consultas específicas e acionáveis que preencham as lacunas mais importantes.

**ATRIBUIÇÃO DE FONTE:**
- Todo achado quantitativo da pesquisa deve citar a fonte
- Formato: "R$ X milhões (fonte: Relatório Y)" ou "(estimativa: análise de mercado)"

Retorne JSON:

{{
  "follow_up_queries": [
    "Consulta específica 1",
    "Consulta específica 2"
  ],
  "priority_gaps": [
    "Lacuna mais crítica",
    "Segunda prioridade"
  ]
}}

Foque em lacunas de alto impacto (dados de concorrentes, tamanho de mercado, métricas financeiras)."#,
    )
}
