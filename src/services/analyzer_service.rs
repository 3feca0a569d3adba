//! Адаптер внешнего LLM-сервиса, суммирующего результаты preflight-проверки.
//!
//! Фича опциональна: без ANALYZER_ENDPOINT анализ просто не выполняется.
//! Любая ошибка анализатора — предупреждение на джобе, никогда не фатальна.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::Config;

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisReport {
    /// GO | CAUTION | NO-GO
    pub verdict: String,
    #[serde(default)]
    pub blockers: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub action_plan: Vec<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub token_count: Option<i64>,
}

#[derive(Clone)]
pub struct AnalyzerClient {
    endpoint: String,
    model: Option<String>,
    http: reqwest::Client,
}

impl AnalyzerClient {
    pub fn from_config(config: &Config) -> Option<Self> {
        let endpoint = config.analyzer_endpoint.clone()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .ok()?;
        Some(Self {
            endpoint,
            model: config.analyzer_model.clone(),
            http,
        })
    }

    /// Отправляет структурированный readiness-документ и ждёт вердикт
    pub async fn analyze(&self, readiness: &Value) -> Result<AnalysisReport> {
        let body = json!({
            "model": self.model,
            "readiness": readiness,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .context("analyzer request failed")?;

        if !response.status().is_success() {
            return Err(anyhow!("analyzer returned HTTP {}", response.status()));
        }

        let report: AnalysisReport = response
            .json()
            .await
            .context("malformed analyzer response")?;

        match report.verdict.as_str() {
            "GO" | "CAUTION" | "NO-GO" => Ok(report),
            other => Err(anyhow!("analyzer returned unknown verdict '{}'", other)),
        }
    }
}

/// Markdown-сводка для хранения на джобе
pub fn render_summary(report: &AnalysisReport) -> String {
    let mut out = format!("## Overall Assessment\n\n**{}**\n", report.verdict);

    if !report.blockers.is_empty() {
        out.push_str("\n## Blockers\n");
        for blocker in &report.blockers {
            out.push_str(&format!("- {}\n", blocker));
        }
    }
    if !report.risks.is_empty() {
        out.push_str("\n## Risks\n");
        for risk in &report.risks {
            out.push_str(&format!("- {}\n", risk));
        }
    }
    if !report.action_plan.is_empty() {
        out.push_str("\n## Recommendations\n");
        for step in &report.action_plan {
            out.push_str(&format!("- {}\n", step));
        }
    }
    out
}
