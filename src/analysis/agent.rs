//! Coding agent capability.
//!
//! The pipeline only needs two things from an agent: turn documentation into
//! a use case list, and write a program for one use case. `CodingAgent` is
//! the seam; `ClaudeAgent` drives the `claude` CLI and tests use fakes.

use async_trait::async_trait;
use doc_analyser_common::UseCaseSpec;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;

use crate::config::AgentSection;
use crate::errors::AgentError;

static FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*\n(.*?)\n?```").unwrap());

fn span(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (start < end).then(|| &text[start..=end])
}

/// Find the JSON payload in free-form agent output: a fenced block, then
/// the outermost `{...}` or `[...]`, whichever opens first. Only candidates
/// that actually parse are returned.
pub fn extract_json(text: &str) -> Option<&str> {
    let is_json = |s: &str| serde_json::from_str::<serde_json::Value>(s).is_ok();

    for caps in FENCED_JSON.captures_iter(text) {
        if let Some(body) = caps.get(1) {
            let body = body.as_str().trim();
            if (body.starts_with('{') || body.starts_with('[')) && is_json(body) {
                return Some(body);
            }
        }
    }

    let object = span(text, '{', '}');
    let array = span(text, '[', ']');
    let array_first = match (text.find('{'), text.find('[')) {
        (Some(brace), Some(bracket)) => bracket < brace,
        (None, Some(_)) => true,
        _ => false,
    };
    let candidates = if array_first {
        [array, object]
    } else {
        [object, array]
    };
    candidates.into_iter().flatten().find(|c| is_json(*c))
}

#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub repo_dir: PathBuf,
    /// Where the agent may drop `use_cases.json`.
    pub work_dir: PathBuf,
    pub include_folders: Vec<String>,
    /// Documentation files, relative to `repo_dir`.
    pub doc_files: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub index: usize,
    pub use_case: UseCaseSpec,
    pub repo_dir: PathBuf,
    /// The job's artifact directory; the code file must be written here.
    pub output_dir: PathBuf,
    /// File name without extension, e.g. `use_case_3`.
    pub code_file_stem: String,
    pub include_folders: Vec<String>,
}

/// The agent's own account of how the documentation served it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSelfReport {
    #[serde(default)]
    pub code_file: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub documentation_sources_used: Vec<String>,
    #[serde(default)]
    pub documentation_usefulness: Vec<String>,
    #[serde(default)]
    pub documentation_weaknesses: Vec<String>,
    #[serde(default)]
    pub documentation_improvements: Vec<String>,
    #[serde(default)]
    pub success_criteria_met: Vec<String>,
    #[serde(default)]
    pub challenges_encountered: Vec<String>,
}

impl AgentSelfReport {
    /// Parse the trailing JSON report out of agent output; absent or
    /// malformed reports yield the default.
    pub fn from_output(output: &str) -> Self {
        extract_json(output)
            .and_then(|json| serde_json::from_str(json).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SynthesisOutput {
    /// Raw agent output.
    pub transcript: String,
    pub report: AgentSelfReport,
}

#[async_trait]
pub trait CodingAgent: Send + Sync {
    /// Ask the agent for a use case list; returns its raw output.
    async fn extract(&self, request: &ExtractionRequest) -> Result<String, AgentError>;

    /// Ask the agent to write `{code_file_stem}.{ext}` into `output_dir`.
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisOutput, AgentError>;
}

const EXTRACTION_SYSTEM_PROMPT: &str = r#"You are a documentation analyst. You read a project's documentation and identify concrete, independently testable use cases that a new user would try. You never invent features that the documentation does not describe."#;

const SYNTHESIS_SYSTEM_PROMPT: &str = r#"You are verifying that a project's documentation is sufficient to accomplish a task. Use ONLY the documentation in the repository as your source of truth; do not rely on prior knowledge of the project. Write a single self-contained program that exercises the use case and exits non-zero if any success criterion is not met."#;

pub fn extraction_prompt(request: &ExtractionRequest) -> String {
    let files = request
        .doc_files
        .iter()
        .map(|f| format!("- {}", f))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"Analyze the documentation of the repository at {repo} in the folders: {folders}.

Documentation files:
{files}

Identify the use cases the documentation teaches. For each use case give a short
name, a description, concrete success criteria, a difficulty level (Beginner,
Intermediate or Advanced) and the documentation files it comes from.

Respond with JSON only, in exactly this shape, and also write it to
{work}/use_cases.json:

{{"use_cases": [{{"name": "...", "description": "...", "success_criteria": ["..."], "difficulty_level": "Beginner", "documentation_source": ["docs/..."]}}]}}"#,
        repo = request.repo_dir.display(),
        folders = request.include_folders.join(", "),
        files = files,
        work = request.work_dir.display(),
    )
}

pub fn synthesis_prompt(request: &SynthesisRequest) -> String {
    let criteria = request
        .use_case
        .success_criteria
        .iter()
        .map(|c| format!("- {}", c))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"Use case #{index}: {name}

{description}

Success criteria:
{criteria}

Relevant documentation: {sources}
The repository is at {repo}; its documentation lives in: {folders}.

Write the implementation to {out}/{stem}.py (or .js / .sh if the documented
language requires it). The program will run in a sandbox with the repository
mounted read-only at the path in the REPO_PATH environment variable.

When done, print a JSON report with these keys:
code_file, summary, documentation_sources_used, documentation_usefulness,
documentation_weaknesses, documentation_improvements, success_criteria_met,
challenges_encountered."#,
        index = request.index,
        name = request.use_case.name,
        description = request.use_case.description,
        criteria = criteria,
        sources = request.use_case.documentation_source.join(", "),
        repo = request.repo_dir.display(),
        folders = request.include_folders.join(", "),
        out = request.output_dir.display(),
        stem = request.code_file_stem,
    )
}

/// `CodingAgent` backed by the `claude` CLI in print mode.
#[derive(Debug, Clone)]
pub struct ClaudeAgent {
    command: String,
    timeout: Duration,
    max_turns: u32,
    extra_args: Vec<String>,
}

impl ClaudeAgent {
    pub fn new(config: &AgentSection) -> Self {
        Self {
            command: config.command.clone(),
            timeout: config.timeout(),
            max_turns: config.max_turns,
            extra_args: config.extra_args.clone(),
        }
    }

    async fn invoke(
        &self,
        prompt: &str,
        system_prompt: &str,
        cwd: &std::path::Path,
        pythonpath: &std::path::Path,
    ) -> Result<String, AgentError> {
        let max_turns = self.max_turns.to_string();
        let mut cmd = Command::new(&self.command);
        cmd.args([
            "--print",
            "--dangerously-skip-permissions",
            "--output-format",
            "text",
            "--max-turns",
            &max_turns,
            "--append-system-prompt",
            system_prompt,
        ])
        .args(&self.extra_args)
        .args(["-p", prompt])
        .current_dir(cwd)
        .env("PYTHONPATH", pythonpath)
        .env_remove("CLAUDECODE")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| AgentError::Spawn {
            command: self.command.clone(),
            source,
        })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| AgentError::Timeout {
                secs: self.timeout.as_secs(),
            })??;

        if !output.status.success() {
            return Err(AgentError::Failed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl CodingAgent for ClaudeAgent {
    async fn extract(&self, request: &ExtractionRequest) -> Result<String, AgentError> {
        tracing::debug!(repo = %request.repo_dir.display(), files = request.doc_files.len(), "invoking agent for extraction");
        self.invoke(
            &extraction_prompt(request),
            EXTRACTION_SYSTEM_PROMPT,
            &request.repo_dir,
            &request.repo_dir,
        )
        .await
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisOutput, AgentError> {
        tracing::debug!(index = request.index, name = %request.use_case.name, "invoking agent for synthesis");
        let transcript = self
            .invoke(
                &synthesis_prompt(request),
                SYNTHESIS_SYSTEM_PROMPT,
                &request.output_dir,
                &request.repo_dir,
            )
            .await?;
        let report = AgentSelfReport::from_output(&transcript);
        Ok(SynthesisOutput { transcript, report })
    }
}
