//! Stage 1 - Data Extraction & Structuring
//!
//! Budget-tier model. Takes the raw company facts plus sanitized external
//! data and produces the structured fact base every later stage consumes.

use serde_json::Value;

use super::super::sanitize::sanitize_value;
use super::{StageRun, attach_usage};
use crate::services::llm::{CostTracker, LlmClient, LlmError, ModelTable, Stage};

const SYSTEM_PROMPT: &str =
    "You are a data extraction specialist. Extract facts, skip fluff. Output JSON only.";

#[allow(clippy::too_many_arguments)]
pub async fn run(
    llm: &LlmClient,
    models: &ModelTable,
    tracker: &CostTracker,
    company: &str,
    industry: &str,
    website: Option<&str>,
    challenge: Option<&str>,
    external_data: Option<&Value>,
    research_data: Option<&Value>,
) -> Result<StageRun, LlmError> {
    tracing::info!("[stage 1] extracting structured data for {}", company);

    let safe_external = external_data.map(sanitize_value);
    let safe_research = research_data.map(sanitize_value);

    let prompt = build_prompt(
        company,
        industry,
        website,
        challenge,
        safe_external.as_ref(),
        safe_research.as_ref(),
    );

    let config = models.for_stage(Stage::Extraction);

    let attempt = llm
        .call_with_retry(
            Stage::Extraction,
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
            tracing::warn!("[stage 1] primary model failed, trying fallback: {}", e);
            let (response, usage) = llm
                .call_with_retry(
                    Stage::Extraction,
                    &config.paid_fallback,
                    &prompt,
                    SYSTEM_PROMPT,
                    config.temperature,
                    config.max_tokens,
                    Some(tracker),
                )
                .await?;
            (response, usage, config.paid_fallback.clone())
        },
    };

    let mut extracted: Value = serde_json::from_str(&response)?;

    tracing::info!(
        "[stage 1] extracted {} competitors, {} trends, {} gaps",
        extracted["competitors"].as_array().map(Vec::len).unwrap_or(0),
        extracted["industry_trends"].as_array().map(Vec::len).unwrap_or(0),
        extracted["data_gaps"].as_array().map(Vec::len).unwrap_or(0),
    );

    attach_usage(&mut extracted, usage);
    Ok(StageRun { output: extracted, model })
}

fn build_prompt(
    company: &str,
    industry: &str,
    website: Option<&str>,
    challenge: Option<&str>,
    external_data: Option<&Value>,
    research_data: Option<&Value>,
) -> String {
    let external = external_data
        .map(|v| serde_json::to_string_pretty(v).unwrap_or_default())
        .unwrap_or_else(|| "Sem dados externos".to_string());
    let research = research_data
        .map(|v| serde_json::to_string_pretty(v).unwrap_or_default())
        .unwrap_or_else(|| "Sem pesquisa em tempo real".to_string());

    format!(
        r#"# FONTES DE DADOS BRUTOS

## Informações da Empresa
- Nome: {company}
- Setor: {industry}
- Website: {website}
- Desafio: {challenge}

## Dados Externos (web scraping, sanitizados)
{external}

## Pesquisa em Tempo Real (sanitizada)
{research}

# SUA TAREFA

Extraia e estruture TODOS os fatos relevantes acima em JSON limpo.

**O que extrair:**
1. Fatos da empresa (porte, localização, equipe, produtos, receita se mencionada)
2. Concorrentes com dados-chave (preço, funcionalidades, market share)
3. Números de tamanho de mercado (TAM, SAM, SOM se mencionados)
4. Tendências do setor (com datas e dados concretos)
5. Métricas quantitativas (crescimento, percentuais, valores em R$)
6. Notícias e desenvolvimentos recentes (com datas)
7. Sentimento de clientes
8. Stack tecnológico ou modelo de negócio

**ATRIBUIÇÃO DE FONTE (obrigatória):**
- Toda afirmação quantitativa deve citar a fonte: "R$ X milhões (fonte: ...)"
- Sem fonte concreta: usar "(estimativa: ...)" ou "N/A - dados insuficientes"
- NUNCA inventar números sem base

**Lacunas de dados:**
Liste informações críticas ausentes que ajudariam a análise estratégica.

**Formato de saída (somente JSON):**

{{
  "company_facts": {{
    "name": "{company}",
    "industry": "{industry}",
    "description": "...",
    "founded": "...",
    "location": "...",
    "team_size": "...",
    "revenue": "...",
    "business_model": "...",
    "products_services": [],
    "key_metrics": {{}}
  }},
  "competitors": [
    {{"name": "...", "positioning": "...", "market_share": "...", "pricing": "...",
      "strengths": [], "weaknesses": [], "recent_news": "..."}}
  ],
  "market_intelligence": {{
    "tam_total_market": "...",
    "sam_available_market": "...",
    "som_obtainable_market": "...",
    "market_growth_rate": "...",
    "market_maturity": "..."
  }},
  "industry_trends": [],
  "news_and_developments": [],
  "customer_intelligence": {{}},
  "data_gaps": []
}}

**IMPORTANTE:** Retorne SOMENTE JSON válido. Sem markdown, sem explicações."#,
        company = company,
        industry = industry,
        website = website.unwrap_or("N/A"),
        challenge = challenge.unwrap_or("N/A"),
        external = external,
        research = research,
    )
}
