//! Per use case: synthesize code, run it in a sandbox, record the result.
//!
//! Nothing here propagates. Every failure ends up in the written
//! `ExecutionResult` and in the outcome's record status.

use chrono::{DateTime, Utc};
use doc_analyser_common::artifacts::{
    CODE_EXTENSIONS, code_file_name, code_file_stem, log_file_name, result_file_name,
};
use doc_analyser_common::{
    ExecutionResult, ExecutionStatus, JobId, UseCaseSpec, UseCaseStatus, UseCaseUpdate,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::agent::{AgentSelfReport, CodingAgent, SynthesisRequest};
use super::sandbox::{SandboxOutput, SandboxRunner};

/// Output kept in `execution_results` is capped to the last few KiB.
const OUTPUT_TAIL_CHARS: usize = 4000;

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job_id: JobId,
    pub repo_dir: PathBuf,
    pub artifact_dir: PathBuf,
    pub include_folders: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub index: usize,
    pub result: ExecutionResult,
    pub status: UseCaseStatus,
    pub code_file: Option<String>,
    pub result_file: Option<String>,
    pub log_file: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    /// The record update that finalizes this use case.
    pub fn update(&self) -> UseCaseUpdate {
        UseCaseUpdate {
            status: Some(self.status),
            started_at: Some(self.started_at),
            ended_at: Some(self.ended_at),
            container_logs: self.log_file.clone(),
            code_file: self.code_file.clone(),
            result_file: self.result_file.clone(),
            error: self.error.clone(),
        }
    }
}

pub struct UseCaseExecutor {
    agent: Arc<dyn CodingAgent>,
    sandbox: SandboxRunner,
    timeout: Duration,
}

fn tail(text: &str) -> &str {
    let count = text.chars().count();
    if count <= OUTPUT_TAIL_CHARS {
        return text;
    }
    let skip = count - OUTPUT_TAIL_CHARS;
    match text.char_indices().nth(skip) {
        Some((at, _)) => &text[at..],
        None => text,
    }
}

fn render_log(output: &SandboxOutput) -> String {
    let exit = output
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "none".into());
    format!(
        "exit_code: {exit}\ntimed_out: {}\nduration_seconds: {:.3}\n--- stdout ---\n{}\n--- stderr ---\n{}\n",
        output.timed_out,
        output.duration.as_secs_f64(),
        output.stdout,
        output.stderr,
    )
}

/// Build the result purely from what the sandbox and the agent reported.
pub fn assess(
    index: usize,
    use_case: &UseCaseSpec,
    report: &AgentSelfReport,
    output: &SandboxOutput,
    code_file: &str,
    timeout: Duration,
) -> ExecutionResult {
    let error = if output.timed_out {
        Some(format!(
            "execution timed out after {}s",
            timeout.as_secs_f64().round()
        ))
    } else {
        match output.exit_code {
            Some(0) => None,
            Some(code) => Some(format!("execution exited with code {code}")),
            None => Some("execution ended without an exit code".to_string()),
        }
    };
    let mut challenges = report.challenges_encountered.clone();
    if let Some(error) = &error {
        challenges.push(error.clone());
    }

    ExecutionResult {
        use_case_index: index,
        use_case_name: use_case.name.clone(),
        execution_status: if output.succeeded() {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Error
        },
        execution_results: serde_json::json!({
            "exit_code": output.exit_code,
            "timed_out": output.timed_out,
            "duration_seconds": output.duration.as_secs_f64(),
            "stdout": tail(&output.stdout),
            "stderr": tail(&output.stderr),
            "summary": report.summary,
        }),
        documentation_sources_used: if report.documentation_sources_used.is_empty() {
            use_case.documentation_source.clone()
        } else {
            report.documentation_sources_used.clone()
        },
        documentation_usefulness: report.documentation_usefulness.clone(),
        documentation_weaknesses: report.documentation_weaknesses.clone(),
        documentation_improvements: report.documentation_improvements.clone(),
        success_criteria_met: report.success_criteria_met.clone(),
        challenges_encountered: challenges,
        code_file_path: Some(code_file.to_string()),
        error,
        timestamp: Utc::now(),
    }
}

/// Write via a temp file and rename so readers never see a partial result.
pub async fn write_result(path: &Path, result: &ExecutionResult) -> std::io::Result<()> {
    let body = serde_json::to_vec_pretty(result)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    tokio::fs::write(&tmp, body).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// Find `use_case_{index}.{ext}` in the artifact directory, or adopt the file
/// the agent says it wrote elsewhere.
async fn locate_code_file(
    artifact_dir: &Path,
    index: usize,
    reported: Option<&str>,
) -> Option<PathBuf> {
    for ext in CODE_EXTENSIONS {
        let candidate = artifact_dir.join(code_file_name(index, ext));
        if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return Some(candidate);
        }
    }
    // relative paths are relative to the agent's working directory
    let reported = artifact_dir.join(reported?);
    let ext = reported.extension()?.to_str()?.to_ascii_lowercase();
    if !CODE_EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }
    if !tokio::fs::metadata(&reported).await.is_ok_and(|m| m.is_file()) {
        return None;
    }
    let target = artifact_dir.join(code_file_name(index, &ext));
    match tokio::fs::copy(&reported, &target).await {
        Ok(_) => Some(target),
        Err(e) => {
            tracing::warn!(path = %reported.display(), error = %e, "could not adopt reported code file");
            None
        }
    }
}

impl UseCaseExecutor {
    pub fn new(agent: Arc<dyn CodingAgent>, sandbox: SandboxRunner, timeout: Duration) -> Self {
        Self {
            agent,
            sandbox,
            timeout,
        }
    }

    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        index: usize,
        use_case: &UseCaseSpec,
    ) -> ExecutionOutcome {
        let started_at = Utc::now();
        let (result, code_file, log_file) = self.run(ctx, index, use_case).await;

        let result_name = result_file_name(index);
        let written = write_result(&ctx.artifact_dir.join(&result_name), &result).await;
        let ended_at = Utc::now();

        let (status, result_file, error) = match written {
            Ok(()) if result.is_success() => (UseCaseStatus::Completed, Some(result_name), None),
            Ok(()) => (UseCaseStatus::Failed, Some(result_name), result.error.clone()),
            Err(e) => {
                tracing::error!(use_case = index, error = %e, "failed to write result artifact");
                (
                    UseCaseStatus::Failed,
                    None,
                    Some(format!("could not write {result_name}: {e}")),
                )
            }
        };
        tracing::info!(
            job_id = %ctx.job_id,
            use_case = index,
            status = %status,
            "use case finished"
        );

        ExecutionOutcome {
            index,
            result,
            status,
            code_file,
            result_file,
            log_file,
            started_at,
            ended_at,
            error,
        }
    }

    async fn run(
        &self,
        ctx: &ExecutionContext,
        index: usize,
        use_case: &UseCaseSpec,
    ) -> (ExecutionResult, Option<String>, Option<String>) {
        let request = SynthesisRequest {
            index,
            use_case: use_case.clone(),
            repo_dir: ctx.repo_dir.clone(),
            output_dir: ctx.artifact_dir.clone(),
            code_file_stem: code_file_stem(index),
            include_folders: ctx.include_folders.clone(),
        };
        let synthesis = match self.agent.synthesize(&request).await {
            Ok(synthesis) => synthesis,
            Err(e) => {
                let detail = format!("code synthesis failed: {e}");
                return (ExecutionResult::error(index, &use_case.name, detail), None, None);
            }
        };

        let Some(code_path) =
            locate_code_file(&ctx.artifact_dir, index, synthesis.report.code_file.as_deref()).await
        else {
            let detail = format!(
                "agent did not produce {}.{{{}}}",
                code_file_stem(index),
                CODE_EXTENSIONS.join(",")
            );
            return (ExecutionResult::error(index, &use_case.name, detail), None, None);
        };
        let code_name = code_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let sandbox_name = format!(
            "use_case_executor_{}_{index}_{}",
            ctx.job_id.simple(),
            uuid::Uuid::new_v4().simple()
        );
        let output = match self
            .sandbox
            .run(&sandbox_name, &code_path, &ctx.repo_dir, self.timeout)
            .await
        {
            Ok(output) => output,
            Err(e) => {
                let mut result =
                    ExecutionResult::error(index, &use_case.name, format!("sandbox error: {e}"));
                result.code_file_path = Some(code_name.clone());
                return (result, Some(code_name), None);
            }
        };

        let log_name = log_file_name(index);
        let log_file = match tokio::fs::write(ctx.artifact_dir.join(&log_name), render_log(&output)).await
        {
            Ok(()) => Some(log_name),
            Err(e) => {
                tracing::warn!(use_case = index, error = %e, "failed to write execution log");
                None
            }
        };

        let result = assess(
            index,
            use_case,
            &synthesis.report,
            &output,
            &code_name,
            self.timeout,
        );
        (result, Some(code_name), log_file)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::analysis::sandbox::ProcessBackend;
    use crate::analysis::testing::{ScriptedAgent, Synthesis};
    use crate::config::SandboxSection;
    use doc_analyser_common::Difficulty;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn spec(name: &str) -> UseCaseSpec {
        UseCaseSpec {
            name: name.into(),
            description: "d".into(),
            success_criteria: vec!["works".into()],
            difficulty_level: Difficulty::Beginner,
            documentation_source: vec!["docs/index.md".into()],
        }
    }

    fn setup(agent: ScriptedAgent, timeout: Duration) -> (TempDir, ExecutionContext, UseCaseExecutor) {
        let dir = tempdir().unwrap();
        let repo_dir = dir.path().join("repo");
        let artifact_dir = dir.path().join("data");
        fs::create_dir_all(&repo_dir).unwrap();
        fs::create_dir_all(&artifact_dir).unwrap();
        let sandbox = SandboxRunner::new(
            Arc::new(ProcessBackend::new()),
            &SandboxSection::default(),
            dir.path().join("scratch"),
        );
        let ctx = ExecutionContext {
            job_id: uuid::Uuid::new_v4(),
            repo_dir,
            artifact_dir,
            include_folders: vec!["docs".into()],
        };
        (dir, ctx, UseCaseExecutor::new(Arc::new(agent), sandbox, timeout))
    }

    fn read_result(ctx: &ExecutionContext, index: usize) -> ExecutionResult {
        let body = fs::read_to_string(ctx.artifact_dir.join(result_file_name(index))).unwrap();
        serde_json::from_str(&body).unwrap()
    }

    #[tokio::test]
    async fn test_successful_run_writes_all_artifacts() {
        let (_dir, ctx, executor) = setup(ScriptedAgent::default(), Duration::from_secs(10));
        let outcome = executor.execute(&ctx, 0, &spec("Install")).await;

        assert_eq!(outcome.status, UseCaseStatus::Completed);
        assert_eq!(outcome.code_file.as_deref(), Some("use_case_0.sh"));
        assert_eq!(outcome.result_file.as_deref(), Some("use_case_results_0.json"));
        assert_eq!(outcome.log_file.as_deref(), Some("use_case_0.log"));
        assert!(outcome.error.is_none());

        let result = read_result(&ctx, 0);
        assert!(result.is_success());
        assert_eq!(result.execution_results["exit_code"], 0);
        assert_eq!(result.documentation_usefulness, vec!["clear install steps"]);
        let log = fs::read_to_string(ctx.artifact_dir.join("use_case_0.log")).unwrap();
        assert!(log.contains("running"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed_with_result() {
        let agent = ScriptedAgent::default().on(1, Synthesis::exit(4));
        let (_dir, ctx, executor) = setup(agent, Duration::from_secs(10));
        let outcome = executor.execute(&ctx, 1, &spec("Broken")).await;

        assert_eq!(outcome.status, UseCaseStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("execution exited with code 4"));
        let result = read_result(&ctx, 1);
        assert_eq!(result.execution_status, ExecutionStatus::Error);
        assert!(result.challenges_encountered.contains(&"execution exited with code 4".to_string()));
    }

    #[tokio::test]
    async fn test_timeout_is_failed() {
        let agent = ScriptedAgent::default().on(0, Synthesis::Script("exec sleep 30\n".into()));
        let (_dir, ctx, executor) = setup(agent, Duration::from_millis(200));
        let outcome = executor.execute(&ctx, 0, &spec("Slow")).await;

        assert_eq!(outcome.status, UseCaseStatus::Failed);
        assert!(outcome.error.unwrap().contains("timed out"));
        assert_eq!(read_result(&ctx, 0).execution_results["timed_out"], true);
    }

    #[tokio::test]
    async fn test_synthesis_failure_is_recorded() {
        let agent = ScriptedAgent::default().on(0, Synthesis::Fail("rate limited".into()));
        let (_dir, ctx, executor) = setup(agent, Duration::from_secs(10));
        let outcome = executor.execute(&ctx, 0, &spec("X")).await;

        assert_eq!(outcome.status, UseCaseStatus::Failed);
        assert!(outcome.error.unwrap().contains("code synthesis failed"));
        assert!(outcome.code_file.is_none());
        assert!(outcome.result_file.is_some());
    }

    #[tokio::test]
    async fn test_missing_code_file_is_recorded() {
        let agent = ScriptedAgent::default().on(0, Synthesis::NoFile);
        let (_dir, ctx, executor) = setup(agent, Duration::from_secs(10));
        let outcome = executor.execute(&ctx, 0, &spec("X")).await;

        assert_eq!(outcome.status, UseCaseStatus::Failed);
        assert!(outcome.error.unwrap().contains("did not produce use_case_0"));
    }

    #[tokio::test]
    async fn test_reported_relative_code_file_resolves_in_artifact_dir() {
        let dir = tempdir().unwrap();
        let artifact_dir = dir.path().join("data");
        fs::create_dir_all(artifact_dir.join("scripts")).unwrap();
        fs::write(artifact_dir.join("scripts/run.sh"), "echo hi\n").unwrap();

        let found = locate_code_file(&artifact_dir, 4, Some("scripts/run.sh")).await;
        assert_eq!(found, Some(artifact_dir.join("use_case_4.sh")));
        assert_eq!(
            fs::read_to_string(artifact_dir.join("use_case_4.sh")).unwrap(),
            "echo hi\n"
        );

        assert_eq!(locate_code_file(&artifact_dir, 5, Some("scripts/missing.sh")).await, None);
        assert_eq!(locate_code_file(&artifact_dir, 6, Some("notes.txt")).await, None);
    }

    #[tokio::test]
    async fn test_unwritable_result_fails_record() {
        let (_dir, ctx, executor) = setup(ScriptedAgent::default(), Duration::from_secs(10));
        // a directory in the way makes the final rename fail
        fs::create_dir_all(ctx.artifact_dir.join(result_file_name(0)).join("blocker")).unwrap();
        let outcome = executor.execute(&ctx, 0, &spec("X")).await;

        assert_eq!(outcome.status, UseCaseStatus::Failed);
        assert!(outcome.result_file.is_none());
        assert!(outcome.error.unwrap().contains("could not write"));
    }

    #[test]
    fn test_tail_keeps_the_end() {
        let long = "a".repeat(OUTPUT_TAIL_CHARS) + "END";
        let kept = tail(&long);
        assert_eq!(kept.chars().count(), OUTPUT_TAIL_CHARS);
        assert!(kept.ends_with("END"));
        assert_eq!(tail("short"), "short");
    }

    #[test]
    fn test_outcome_update_finalizes_record() {
        let now = Utc::now();
        let outcome = ExecutionOutcome {
            index: 0,
            result: ExecutionResult::error(0, "x", "boom"),
            status: UseCaseStatus::Failed,
            code_file: None,
            result_file: Some("use_case_results_0.json".into()),
            log_file: None,
            started_at: now,
            ended_at: now,
            error: Some("boom".into()),
        };
        let update = outcome.update();
        assert_eq!(update.status, Some(UseCaseStatus::Failed));
        assert_eq!(update.error.as_deref(), Some("boom"));
    }
}
