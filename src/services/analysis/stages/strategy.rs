//! Stage 3 - Strategic Frameworks
//!
//! The client-facing core of the report: a four-part Portuguese JSON
//! applying PESTEL, Porter, SWOT, Blue Ocean, market sizing, OKRs and the
//! rest, gated by the data-quality tier. The only stage with the full
//! triple-model fallback (primary -> paid fallback -> free fallback), and
//! the only one whose output goes through hallucination repair.

use serde_json::Value;

use super::super::hallucination::{
    detect_company_size, repair_market_sizing, scan_unattributed_claims,
};
use super::super::quality::{QualityTier, enabled_sections};
use super::{StageRun, attach_usage};
use crate::services::llm::{CostTracker, LlmClient, LlmError, ModelTable, Stage, UsageStats};

const SYSTEM_PROMPT: &str = "Você é um consultor estratégico sênior especializado no mercado \
     brasileiro. Aplique frameworks consagrados com rigor analítico. Responda SOMENTE com JSON \
     válido em português brasileiro.";

/// Stage-3 result: the output plus the validation warnings the
/// orchestrator records in the logging summary.
#[derive(Debug, Clone)]
pub struct StrategyRun {
    pub run: StageRun,
    pub validation_warnings: Vec<String>,
}

#[allow(clippy::too_many_arguments)]
pub async fn run(
    llm: &LlmClient,
    models: &ModelTable,
    tracker: &CostTracker,
    company: &str,
    industry: &str,
    challenge: Option<&str>,
    extracted: &Value,
    tier: QualityTier,
) -> Result<StrategyRun, LlmError> {
    tracing::info!(
        "[stage 3] strategic analysis for {} (tier {})",
        company,
        tier.as_str()
    );

    let sections = enabled_sections(tier);
    let prompt = build_prompt(company, industry, challenge, extracted, tier, sections);
    let config = models.for_stage(Stage::Strategy);

    // Full fallback chain: premium primary, cheaper paid model, free model.
    let mut chain: Vec<&str> = vec![config.primary.as_str(), config.paid_fallback.as_str()];
    if let Some(free) = &config.free_fallback {
        chain.push(free.as_str());
    }

    let (response, usage, model) =
        call_chain(llm, tracker, &chain, &prompt, config.temperature, config.max_tokens).await?;

    let mut strategic: Value = serde_json::from_str(&response)?;

    // Post-hoc hallucination validation.
    let mut warnings = Vec::new();

    let company_size = detect_company_size(&extracted["company_facts"]);
    for issue in repair_market_sizing(&mut strategic, company_size) {
        warnings.push(format!("tam_sam_som auto-reparado: {}", issue));
    }

    for violation in scan_unattributed_claims(&strategic) {
        warnings.push(format!("afirmação quantitativa sem fonte em {}", violation));
    }

    let okrs = strategic["parte_3_como_chegar_la"]["okrs_propostos"]
        .as_array()
        .map(Vec::len)
        .unwrap_or(0);
    tracing::info!("[stage 3] generated strategic analysis with {} OKRs via {}", okrs, model);

    attach_usage(&mut strategic, usage);
    Ok(StrategyRun {
        run: StageRun { output: strategic, model },
        validation_warnings: warnings,
    })
}

/// Walk the model chain; a refusal or exhausted retries moves to the next
/// model, anything else ends the stage.
async fn call_chain(
    llm: &LlmClient,
    tracker: &CostTracker,
    chain: &[&str],
    prompt: &str,
    temperature: f64,
    max_tokens: u32,
) -> Result<(String, UsageStats, String), LlmError> {
    let mut last_error = None;

    for (i, model) in chain.iter().enumerate() {
        if i > 0 {
            tracing::warn!("[stage 3] falling back to model {} ({}/{})", model, i + 1, chain.len());
        }

        match llm
            .call_with_retry(
                Stage::Strategy,
                model,
                prompt,
                SYSTEM_PROMPT,
                temperature,
                max_tokens,
                Some(tracker),
            )
            .await
        {
            Ok((response, usage)) => return Ok((response, usage, model.to_string())),
            Err(e) => {
                tracing::warn!("[stage 3] model {} failed: {}", model, e);
                last_error = Some(e);
            },
        }
    }

    Err(last_error.unwrap_or(LlmError::ExternalService {
        stage: Stage::Strategy.as_str().to_string(),
        attempts: 0,
        message: "empty model chain".to_string(),
    }))
}

fn build_prompt(
    company: &str,
    industry: &str,
    challenge: Option<&str>,
    extracted: &Value,
    tier: QualityTier,
    sections: &[&str],
) -> String {
    let facts = serde_json::to_string_pretty(&extracted["company_facts"]).unwrap_or_default();
    let competitors = serde_json::to_string_pretty(&extracted["competitors"]).unwrap_or_default();
    let market =
        serde_json::to_string_pretty(&extracted["market_intelligence"]).unwrap_or_default();
    let trends = serde_json::to_string_pretty(&extracted["industry_trends"]).unwrap_or_default();

    let market_sizing_rules = if sections.contains(&"tam_sam_som") {
        r#"### TAM/SAM/SOM (Dimensionamento de Mercado)
- Hierarquia obrigatória: SOM <= SAM <= TAM
- SOM para empresa PEQUENA: 0,01-0,5% do TAM; MÉDIA: 0,5-2%; GRANDE: 2-10%
- Todo valor exige fonte: "R$ X bilhões (fonte: ...)" ou "(estimativa: ...)"
- SEM dados suficientes: use {"status": "dados_insuficientes", "mensagem": "...",
  "o_que_fornecer": ["...", "...", "..."]}"#
    } else {
        r#"### TAM/SAM/SOM
- NÃO produza dimensionamento quantitativo de mercado neste relatório:
  retorne {"status": "dados_insuficientes", "mensagem": "...",
  "o_que_fornecer": ["...", "...", "..."]}"#
    };

    let okr_rules = if sections.contains(&"okrs") {
        "- okrs_propostos: no mínimo 3 OKRs, um por trimestre (Q1-Q4), com key results mensuráveis"
    } else if sections.contains(&"okrs_q1") {
        "- okrs_propostos: apenas OKRs de Q1 (dados insuficientes para trimestres posteriores)"
    } else {
        "- okrs_propostos: NÃO produzir OKRs neste nível de dados; retorne lista vazia"
    };

    format!(
        r#"**ATENÇÃO: TODO O OUTPUT EM PORTUGUÊS BRASILEIRO PROFISSIONAL. SOMENTE JSON.**

Gere a análise estratégica completa de {company} ({industry}) no Brasil.

Desafio declarado: {challenge}

## Dados estruturados (Stage 1)
### Fatos da empresa
{facts}
### Concorrentes
{competitors}
### Inteligência de mercado
{market}
### Tendências
{trends}

## Nível de dados: {tier}
Seções habilitadas: {sections:?}
Produza SOMENTE as seções habilitadas; para as demais, omita a chave ou use o formato
"dados_insuficientes" indicado.

## Frameworks
- PESTEL (fatores político, econômico, social, tecnológico, ecológico, legal no Brasil)
- 7 Forças de Porter (as 5 clássicas + complementadores + novos modelos digitais)
- SWOT com evidências dos dados fornecidos
- Blue Ocean (curva de valor e movimentos de diferenciação)
- Posicionamento competitivo
{market_sizing_rules}
- Balanced Scorecard (financeira, clientes, processos, aprendizado)
{okr_rules}
- Roadmap de implementação (30/60/90 dias e 6-12 meses)
- Growth loops aplicáveis
- Cenários (otimista/base/pessimista com probabilidades somando 1,0)
- Recomendações prioritárias (3 a 5, específicas e acionáveis)
- Matriz de decisão multicritério quando houver alternativas estratégicas concorrentes
- Mapa de integração entre frameworks (como cada análise alimenta a próxima)
- Casos de referência brasileiros comparáveis (empresa, setor, lição aplicável)
- Ciclo de revisão (frequência e gatilhos de reavaliação)

## Estrutura de saída (JSON, 4 partes)
{{
  "parte_1_onde_estamos": {{
    "analise_pestel": {{...}},
    "forcas_porter": {{...}},
    "analise_swot": {{"forcas": [], "fraquezas": [], "oportunidades": [], "ameacas": []}}
  }},
  "parte_2_onde_queremos_ir": {{
    "oceano_azul": {{...}},
    "posicionamento_competitivo": {{...}},
    "tam_sam_som": {{
      "tam_total_market": {{"valor": "R$ ... (fonte: ...)", "descricao": "..."}},
      "sam_available_market": {{"valor": "...", "descricao": "..."}},
      "som_obtainable_market": {{"valor": "...", "descricao": "...", "percentual_tam": "..."}}
    }}
  }},
  "parte_3_como_chegar_la": {{
    "balanced_scorecard": {{...}},
    "okrs_propostos": [],
    "roadmap_implementacao": {{...}},
    "growth_loops": []
  }},
  "parte_4_o_que_fazer_agora": {{
    "planejamento_cenarios": {{...}},
    "recomendacoes_prioritarias": [],
    "matriz_decisao_multicriterio": {{...}},
    "mapa_integracao": {{...}},
    "casos_referencia_brasil": [],
    "ciclo_revisao": {{...}}
  }}
}}

## Regras finais
1. Hierarquia TAM/SAM/SOM sempre: SOM <= SAM <= TAM
2. Números sem fonte são proibidos: use "(fonte: ...)" ou "(estimativa: ...)"
3. Nunca use aspas duplas dentro de strings; prefira aspas simples
4. Específico e acionável, nunca genérico"#,
        company = company,
        industry = industry,
        challenge = challenge.unwrap_or("N/A"),
        facts = facts,
        competitors = competitors,
        market = market,
        trends = trends,
        tier = tier.as_str(),
        sections = sections,
        market_sizing_rules = market_sizing_rules,
        okr_rules = okr_rules,
    )
}
