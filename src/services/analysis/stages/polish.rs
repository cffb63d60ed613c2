//! Stage 6 - Executive Polish
//!
//! Rewrites the strategic analysis prose for tone and clarity without
//! touching numbers, dates or recommendations. On failure the orchestrator
//! keeps Stage 3's output unchanged.

use serde_json::Value;

use super::{StageRun, attach_usage};
use crate::services::llm::{CostTracker, LlmClient, LlmError, ModelTable, Stage};

const SYSTEM_PROMPT: &str = "Você é um editor executivo sênior. Reescreva com clareza e tom \
     profissional SEM alterar números, datas, fontes ou recomendações. Responda somente com o \
     JSON completo revisado, em português brasileiro.";

pub async fn run(
    llm: &LlmClient,
    models: &ModelTable,
    tracker: &CostTracker,
    company: &str,
    strategic: &Value,
) -> Result<StageRun, LlmError> {
    tracing::info!("[stage 6] executive polish for {}", company);

    // Bookkeeping headers are not content to rewrite.
    let mut input = strategic.clone();
    if let Some(map) = input.as_object_mut() {
        map.retain(|key, _| !key.starts_with('_'));
    }

    let prompt = build_prompt(company, &input);
    let config = models.for_stage(Stage::Polish);

    let attempt = llm
        .call_with_retry(
            Stage::Polish,
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
            tracing::warn!("[stage 6] primary model failed, trying paid fallback: {}", e);
            let (response, usage) = llm
                .call_with_retry(
                    Stage::Polish,
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

    let mut polished: Value = serde_json::from_str(&response)?;

    // The polish must preserve the report skeleton; a response that lost
    // the four-part structure is worse than no polish at all.
    if !has_report_skeleton(&polished) {
        tracing::warn!("[stage 6] polished output lost the report structure, keeping original");
        polished = input;
    }

    attach_usage(&mut polished, usage);
    Ok(StageRun { output: polished, model })
}

fn has_report_skeleton(value: &Value) -> bool {
    ["parte_1_onde_estamos", "parte_4_o_que_fazer_agora"]
        .iter()
        .all(|key| value.get(key).is_some())
}

fn build_prompt(company: &str, strategic: &Value) -> String {
    format!(
        r#"Revise o relatório estratégico de {company} abaixo para consumo executivo.

## O que melhorar
- Clareza e concisão do texto
- Tom profissional e direto, em português brasileiro
- Consistência de terminologia entre as seções

## O que é PROIBIDO alterar
- Qualquer número, valor em R$, percentual ou data
- As anotações de fonte "(fonte: ...)" e "(estimativa: ...)"
- O conteúdo das recomendações e a estrutura de chaves do JSON

## Relatório
{report}

Retorne o MESMO JSON com os textos revisados. Somente JSON."#,
        company = company,
        report = serde_json::to_string_pretty(strategic).unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_skeleton_detection() {
        let good = json!({
            "parte_1_onde_estamos": {},
            "parte_2_onde_queremos_ir": {},
            "parte_3_como_chegar_la": {},
            "parte_4_o_que_fazer_agora": {}
        });
        assert!(has_report_skeleton(&good));

        let bad = json!({"resumo": "texto solto"});
        assert!(!has_report_skeleton(&bad));
    }
}
