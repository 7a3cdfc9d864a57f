//! One-shot in-process analysis: `doc-analyser analyze`.

use anyhow::{Result, bail};
use std::time::Duration;

use doc_analyser::analysis::server::build_orchestrator;
use doc_analyser::config::AnalyserConfig;
use doc_analyser_common::{JobStatus, JobView, NewJob, UseCaseStatus};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub async fn cmd_analyze(
    config: &AnalyserConfig,
    url: &str,
    branch: Option<&str>,
    include_folders: Vec<String>,
    project_id: Option<String>,
) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    let job_id = orchestrator
        .submit(NewJob {
            repository_url: url.to_string(),
            branch: branch.unwrap_or_default().to_string(),
            include_folders,
            project_id,
        })
        .await?;

    println!(
        "{} {}",
        console::style("Submitted job").bold().cyan(),
        job_id
    );

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut last_line = String::new();
    let mut cancel_requested = false;
    let view = loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                cancel_requested = true;
                println!("{}", console::style("Cancelling, waiting for running use cases...").yellow());
                if let Err(e) = orchestrator.cancel(job_id).await {
                    tracing::debug!(error = %e, "cancel after finish");
                }
            }
        }

        let view = orchestrator.get_status(job_id).await?;
        let line = progress_line(&view);
        if line != last_line {
            println!("  {}", console::style(&line).dim());
            last_line = line;
        }
        if view.status.is_terminal() {
            break view;
        }
    };

    println!();
    print_view(&view);
    let job = orchestrator.get_job(job_id).await?;
    if let Some(report) = &job.report {
        println!(
            "Documentation score: {:.1}% (grade {})",
            report.documentation_quality.overall_score, report.documentation_quality.grade
        );
    }
    println!(
        "Artifacts: {}",
        orchestrator.layout(job_id).data_dir.display()
    );

    if view.status == JobStatus::Failed {
        bail!(
            "Analysis failed: {}",
            view.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn progress_line(view: &JobView) -> String {
    if view.status == JobStatus::Executing {
        format!(
            "{}: {}/{} done, {} running",
            view.stage,
            view.completed + view.failed,
            view.total_use_cases,
            view.running
        )
    } else {
        view.stage.clone()
    }
}

/// Print a job snapshot, one line per use case.
pub fn print_view(view: &JobView) {
    let status = match view.status {
        JobStatus::Completed => console::style(view.status.as_str()).green().bold(),
        JobStatus::CompletedWithErrors | JobStatus::Cancelled => {
            console::style(view.status.as_str()).yellow().bold()
        }
        JobStatus::Failed => console::style(view.status.as_str()).red().bold(),
        _ => console::style(view.status.as_str()).cyan(),
    };
    println!("Job {} [{}]", view.job_id, status);
    println!("  Repository: {} ({})", view.repository_url, view.branch);
    if let Some(project) = &view.project_id {
        println!("  Project:    {}", project);
    }
    println!(
        "  Use cases:  {} total, {} completed, {} failed, {} running, {} pending",
        view.total_use_cases, view.completed, view.failed, view.running, view.pending
    );
    if let Some(error) = &view.error {
        println!("  {} {}", console::style("Error:").red().bold(), error);
    }
    for uc in &view.use_cases {
        let marker = match uc.status {
            UseCaseStatus::Completed => console::style("✓").green(),
            UseCaseStatus::Failed => console::style("✗").red(),
            UseCaseStatus::Running => console::style("…").cyan(),
            UseCaseStatus::Pending => console::style("·").dim(),
        };
        match &uc.error {
            Some(error) => println!("    {} {:>3} {} ({})", marker, uc.index, uc.name, error),
            None => println!("    {} {:>3} {}", marker, uc.index, uc.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use doc_analyser_common::{Job, UseCaseRecord, UseCaseSpec};

    fn view(status: JobStatus) -> JobView {
        let mut job = Job::new(NewJob {
            repository_url: "https://example.com/r.git".into(),
            branch: "main".into(),
            include_folders: vec!["docs".into()],
            project_id: None,
        });
        job.use_cases.push(UseCaseRecord::new(
            0,
            UseCaseSpec {
                name: "Install".into(),
                description: String::new(),
                success_criteria: Vec::new(),
                difficulty_level: Default::default(),
                documentation_source: Vec::new(),
            },
        ));
        job.status = status;
        job.view()
    }

    #[test]
    fn test_progress_line_counts_while_executing() {
        let line = progress_line(&view(JobStatus::Executing));
        assert_eq!(line, "Executing use cases: 0/1 done, 0 running");
    }

    #[test]
    fn test_progress_line_uses_stage_otherwise() {
        assert_eq!(progress_line(&view(JobStatus::Cloning)), "Cloning repository");
    }
}
