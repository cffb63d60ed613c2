//! Stage 4 - Competitive Intelligence Matrix
//!
//! Premium model with a Portuguese-enforcing system prompt. Produces the
//! detailed competitor matrix (at least five real players), positioning
//! map, per-competitor SWOT, gaps and threats. Non-fatal: the orchestrator
//! drops this block when the stage fails.

use serde_json::Value;

use super::{StageRun, attach_usage};
use crate::services::llm::{CostTracker, LlmClient, LlmError, ModelTable, Stage};

const SYSTEM_PROMPT: &str = "Você é um analista de inteligência competitiva do mercado \
     brasileiro. Crie matrizes estruturadas baseadas em dados. Liste TODOS os concorrentes \
     relevantes (mínimo 5). Output somente JSON em português.";

pub async fn run(
    llm: &LlmClient,
    models: &ModelTable,
    tracker: &CostTracker,
    company: &str,
    industry: &str,
    extracted: &Value,
    strategic: &Value,
) -> Result<StageRun, LlmError> {
    tracing::info!("[stage 4] generating competitive matrix for {}", company);

    let prompt = build_prompt(company, industry, extracted, strategic);
    let config = models.for_stage(Stage::Competitive);

    let attempt = llm
        .call_with_retry(
            Stage::Competitive,
            &config.primary,
            &prompt,
            SYSTEM_PROMPT,
            config.temperature,
            config.max_tokens,
            Some(tracker),
        )
        .await;

    let (response, usage, model) = match attempt {
        Ok((response, usage)) => (response, usage, config.primary.clone()),
        Err(e) => {
            tracing::warn!("[stage 4] primary model failed, trying free fallback: {}", e);
            let fallback = config
                .free_fallback
                .as_deref()
                .unwrap_or(config.paid_fallback.as_str());
            let (response, usage) = llm
                .call_with_retry(
                    Stage::Competitive,
                    fallback,
                    &prompt,
                    SYSTEM_PROMPT,
                    config.temperature,
                    config.max_tokens,
                    Some(tracker),
                )
                .await?;
            (response, usage, fallback.to_string())
        },
    };

    let mut matrix: Value = serde_json::from_str(&response)?;

    let competitors = matrix["analise_competitiva_detalhada"]
        .as_array()
        .map(Vec::len)
        .unwrap_or(0);
    tracing::info!("[stage 4] competitive matrix with {} competitors via {}", competitors, model);

    attach_usage(&mut matrix, usage);
    Ok(StageRun { output: matrix, model })
}

fn build_prompt(company: &str, industry: &str, extracted: &Value, strategic: &Value) -> String {
    let competitors = serde_json::to_string_pretty(&extracted["competitors"]).unwrap_or_default();
    let positioning = serde_json::to_string_pretty(
        &strategic["parte_2_onde_queremos_ir"]["posicionamento_competitivo"],
    )
    .unwrap_or_default();

    format!(
        r#"**TAREFA:** Matriz de inteligência competitiva COMPLETA para {company} no setor de {industry} no Brasil.

**REQUISITO CRÍTICO: mínimo de 5 concorrentes relevantes (grandes, médios e emergentes).**

Concorrentes já identificados:
{competitors}

Posicionamento atual:
{positioning}

**INSTRUÇÃO:** Use os dados fornecidos, MAS inclua também players conhecidos do mercado
brasileiro de {industry} ausentes dos dados. Para esses, marque os campos como
"(estimativa: conhecimento de mercado)" ou "N/A - dados não disponíveis".

Retorne JSON em português brasileiro:

{{
  "analise_competitiva_detalhada": [
    {{
      "empresa": "{company}",
      "posicionamento": "...",
      "market_share_estimado": "X% (fonte: ...) ou (estimativa: ...)",
      "pontos_fortes": [],
      "pontos_fracos": [],
      "preco_medio": "...",
      "tecnologia_destaque": "...",
      "crescimento_anual": "...",
      "fonte_dados": "Dados fornecidos / Conhecimento de mercado / Estimativa"
    }}
  ],
  "mapa_posicionamento": {{
    "eixo_x": "Preço (Baixo -> Alto)",
    "eixo_y": "Recursos (Básico -> Avançado)",
    "posicoes": [{{"empresa": "...", "x": 5, "y": 7}}],
    "quadrantes": {{}}
  }},
  "swot_por_concorrente": [
    {{"empresa": "...", "forcas": [], "fraquezas": [], "oportunidades": [], "ameacas": []}}
  ],
  "gaps_competitivos": [
    {{"gap": "...", "oportunidade_para_empresa": "...", "tamanho_mercado_estimado": "...", "dificuldade": "..."}}
  ],
  "ameacas_competitivas": [
    {{"ameaca": "...", "origem": "...", "prazo": "...", "impacto": "...", "mitigacao": "..."}}
  ]
}}

**REQUISITOS:**
1. MÍNIMO 5 concorrentes reais do mercado brasileiro
2. Fonte obrigatória em todo número: "(fonte: ...)" ou "(estimativa: ...)"
3. NUNCA fabricar números sem base; prefira "N/A"
4. TODO o texto em português brasileiro
5. Sem aspas duplas dentro de strings"#,
        company = company,
        industry = industry,
        competitors = competitors,
        positioning = positioning,
    )
}
