//! Remote status lookup: `doc-analyser status`.

use anyhow::{Context, Result, bail};
use doc_analyser::config::AnalyserConfig;
use doc_analyser_common::JobView;

use super::analyze::print_view;

pub fn status_url(server: &str, job_id: &str) -> String {
    format!(
        "{}/analysis/status/{}",
        server.trim_end_matches('/'),
        job_id.trim()
    )
}

pub async fn cmd_status(config: &AnalyserConfig, job_id: &str, server: Option<&str>) -> Result<()> {
    let server = match server {
        Some(s) => s.to_string(),
        None => format!("http://{}:{}", config.server.host, config.server.port),
    };
    let url = status_url(&server, job_id);

    let resp = reqwest::Client::new()
        .get(&url)
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", server))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or(body);
        bail!("Server returned {}: {}", status, message);
    }

    let view: JobView = resp
        .json()
        .await
        .context("Failed to decode job status")?;
    print_view(&view);
    Ok(())
}
