use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use doc_analyser::config::AnalyserConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "doc-analyser")]
#[command(version, about = "Verify documentation by running the use cases it describes")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to a config file. Defaults to ./doc-analyser.toml, then the user config dir.
    #[arg(long, global = true, env = "DOC_ANALYSER_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP gateway and job dispatcher
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Enable dev mode (CORS permissive for a local frontend)
        #[arg(long)]
        dev: bool,
    },
    /// Analyse one repository in-process and print a summary
    Analyze {
        /// Repository URL or local path
        url: String,

        /// Branch to check out (defaults to pipeline.default_branch)
        #[arg(short, long)]
        branch: Option<String>,

        /// Documentation folders to read, relative to the repository root
        #[arg(short, long = "include", num_args = 1.., default_value = "docs")]
        include: Vec<String>,

        /// Group the job under a project
        #[arg(long)]
        project_id: Option<String>,
    },
    /// Fetch the status of a job from a running server
    Status {
        job_id: String,

        /// Server base URL (defaults to the configured host and port)
        #[arg(long)]
        server: Option<String>,
    },
    /// Show the effective configuration
    Config {
        /// Only validate; exit non-zero when there are warnings
        #[arg(long)]
        check: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut config = AnalyserConfig::discover(cli.config.as_deref())?;
    let env_warnings = config.apply_env_overrides();
    let _log_guard = doc_analyser::logging::init(&config.logging, cli.verbose)?;
    for warning in &env_warnings {
        tracing::warn!("{}", warning);
    }

    match &cli.command {
        Commands::Serve { port, host, dev } => {
            if let Some(port) = port {
                config.server.port = *port;
            }
            if let Some(host) = host {
                config.server.host = host.clone();
            }
            if *dev {
                config.server.cors_permissive = true;
            }
            cmd::cmd_serve(&config).await?;
        }
        Commands::Analyze {
            url,
            branch,
            include,
            project_id,
        } => {
            cmd::cmd_analyze(
                &config,
                url,
                branch.as_deref(),
                include.clone(),
                project_id.clone(),
            )
            .await?;
        }
        Commands::Status { job_id, server } => {
            cmd::cmd_status(&config, job_id, server.as_deref()).await?;
        }
        Commands::Config { check } => cmd::cmd_config(&config, cli.config.as_deref(), *check)?,
    }

    Ok(())
}
