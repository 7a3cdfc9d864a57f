//! HTTP gateway command: `doc-analyser serve`.

use anyhow::Result;
use doc_analyser::config::AnalyserConfig;

pub async fn cmd_serve(config: &AnalyserConfig) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    doc_analyser::analysis::server::start_server(config).await
}
