//! Scriptable fakes for the agent, sandbox and fetch seams.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::agent::{
    AgentSelfReport, CodingAgent, ExtractionRequest, SynthesisOutput, SynthesisRequest,
};
use super::fetch::RepoFetcher;
use super::sandbox::{CapturedOutput, LaunchSpec, SandboxBackend};
use crate::errors::{AgentError, SandboxError, StageError};

/// Poll `cond` for up to two seconds.
pub async fn wait_for(cond: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// What the agent does when asked to synthesize one use case.
#[derive(Debug, Clone)]
pub enum Synthesis {
    /// Write `use_case_{i}.sh` with this body.
    Script(String),
    /// Succeed without writing a code file.
    NoFile,
    Fail(String),
    Panic,
}

impl Synthesis {
    pub fn exit(code: i32) -> Self {
        Synthesis::Script(format!("echo running\nexit {code}\n"))
    }
}

pub struct ScriptedAgent {
    extraction: Result<String, String>,
    synthesis: HashMap<usize, Synthesis>,
    default_synthesis: Synthesis,
    synthesis_delay: Duration,
    extract_calls: AtomicUsize,
    synthesize_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for ScriptedAgent {
    fn default() -> Self {
        Self {
            extraction: Ok(r#"{"use_cases": []}"#.to_string()),
            synthesis: HashMap::new(),
            default_synthesis: Synthesis::exit(0),
            synthesis_delay: Duration::ZERO,
            extract_calls: AtomicUsize::new(0),
            synthesize_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }
}

impl ScriptedAgent {
    pub fn with_extraction(output: &str) -> Self {
        Self {
            extraction: Ok(output.to_string()),
            ..Self::default()
        }
    }

    /// An agent that extracts `n` use cases named `Case 0..n`.
    pub fn with_use_cases(n: usize) -> Self {
        let cases: Vec<serde_json::Value> = (0..n)
            .map(|i| {
                serde_json::json!({
                    "name": format!("Case {i}"),
                    "description": format!("Exercise feature {i}"),
                    "success_criteria": ["exits cleanly"],
                    "difficulty_level": "beginner",
                    "documentation_source": ["docs/index.md"],
                })
            })
            .collect();
        Self::with_extraction(&serde_json::json!({ "use_cases": cases }).to_string())
    }

    pub fn failing_extraction(message: &str) -> Self {
        Self {
            extraction: Err(message.to_string()),
            ..Self::default()
        }
    }

    pub fn on(mut self, index: usize, synthesis: Synthesis) -> Self {
        self.synthesis.insert(index, synthesis);
        self
    }

    pub fn by_default(mut self, synthesis: Synthesis) -> Self {
        self.default_synthesis = synthesis;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.synthesis_delay = delay;
        self
    }

    pub fn extract_calls(&self) -> usize {
        self.extract_calls.load(Ordering::SeqCst)
    }

    pub fn synthesize_calls(&self) -> usize {
        self.synthesize_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CodingAgent for ScriptedAgent {
    async fn extract(&self, _request: &ExtractionRequest) -> Result<String, AgentError> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        self.extraction.clone().map_err(|stderr| AgentError::Failed {
            code: Some(1),
            stderr,
        })
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisOutput, AgentError> {
        self.synthesize_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.synthesis_delay.is_zero() {
            tokio::time::sleep(self.synthesis_delay).await;
        }

        let behaviour = self
            .synthesis
            .get(&request.index)
            .unwrap_or(&self.default_synthesis)
            .clone();
        match behaviour {
            Synthesis::Script(body) => {
                let path = request
                    .output_dir
                    .join(format!("{}.sh", request.code_file_stem));
                tokio::fs::write(&path, body).await?;
                Ok(SynthesisOutput {
                    transcript: "wrote script".into(),
                    report: AgentSelfReport {
                        code_file: Some(path.display().to_string()),
                        documentation_sources_used: request.use_case.documentation_source.clone(),
                        documentation_usefulness: vec!["clear install steps".into()],
                        ..AgentSelfReport::default()
                    },
                })
            }
            Synthesis::NoFile => Ok(SynthesisOutput::default()),
            Synthesis::Fail(stderr) => Err(AgentError::Failed {
                code: Some(2),
                stderr,
            }),
            Synthesis::Panic => panic!("scripted agent panic for use case {}", request.index),
        }
    }
}

#[derive(Debug, Clone)]
pub enum FakeWait {
    Exit(i64),
    Hang,
    Error,
}

#[derive(Debug, Clone)]
pub struct FakeRun {
    pub launch_error: bool,
    pub wait: FakeWait,
    pub stdout: String,
}

impl FakeRun {
    pub fn exit(code: i64, stdout: &str) -> Self {
        Self {
            launch_error: false,
            wait: FakeWait::Exit(code),
            stdout: stdout.to_string(),
        }
    }

    pub fn hang() -> Self {
        Self {
            launch_error: false,
            wait: FakeWait::Hang,
            stdout: String::new(),
        }
    }

    pub fn wait_error() -> Self {
        Self {
            launch_error: false,
            wait: FakeWait::Error,
            stdout: String::new(),
        }
    }

    pub fn launch_error() -> Self {
        Self {
            launch_error: true,
            wait: FakeWait::Exit(0),
            stdout: String::new(),
        }
    }
}

/// Backend that replays `FakeRun`s in launch order and counts lifecycle calls.
#[derive(Default)]
pub struct FakeBackend {
    script: Mutex<VecDeque<FakeRun>>,
    running: Mutex<HashMap<String, FakeRun>>,
    last_spec: Mutex<Option<LaunchSpec>>,
    launches: AtomicUsize,
    kills: AtomicUsize,
    removals: AtomicUsize,
}

impl FakeBackend {
    pub fn new(runs: Vec<FakeRun>) -> Self {
        Self {
            script: Mutex::new(runs.into()),
            ..Self::default()
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn removals(&self) -> usize {
        self.removals.load(Ordering::SeqCst)
    }

    pub fn last_spec(&self) -> Option<LaunchSpec> {
        self.last_spec.lock().unwrap().clone()
    }

    fn run_for(&self, id: &str) -> Result<FakeRun, SandboxError> {
        self.running
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl SandboxBackend for FakeBackend {
    fn kind(&self) -> &'static str {
        "fake"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<String, SandboxError> {
        let run = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| FakeRun::exit(0, ""));
        *self.last_spec.lock().unwrap() = Some(spec.clone());
        if run.launch_error {
            return Err(SandboxError::Launch("scripted launch failure".into()));
        }
        let n = self.launches.fetch_add(1, Ordering::SeqCst);
        let id = format!("fake-{n}");
        self.running.lock().unwrap().insert(id.clone(), run);
        Ok(id)
    }

    async fn wait(&self, id: &str) -> Result<i64, SandboxError> {
        match self.run_for(id)?.wait {
            FakeWait::Exit(code) => Ok(code),
            FakeWait::Hang => std::future::pending().await,
            FakeWait::Error => Err(SandboxError::Wait {
                id: id.to_string(),
                message: "scripted wait failure".into(),
            }),
        }
    }

    async fn logs(&self, id: &str) -> Result<CapturedOutput, SandboxError> {
        Ok(CapturedOutput {
            stdout: self.run_for(id)?.stdout,
            stderr: String::new(),
        })
    }

    async fn kill(&self, _id: &str) -> Result<(), SandboxError> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), SandboxError> {
        self.running
            .lock()
            .unwrap()
            .remove(id)
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))?;
        self.removals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fetcher that materializes a fixed documentation tree instead of cloning.
pub struct FakeFetcher {
    files: Vec<(String, String)>,
    error: Option<String>,
    delay: Duration,
    calls: AtomicUsize,
}

impl FakeFetcher {
    pub fn with_docs() -> Self {
        Self {
            files: vec![
                ("docs/index.md".into(), "# Project\n\nRun `tool --help`.".into()),
                ("README.md".into(), "# Readme".into()),
            ],
            error: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn empty() -> Self {
        Self {
            files: vec![("src/main.c".into(), "int main() {}".into())],
            ..Self::with_docs()
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Self::with_docs()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RepoFetcher for FakeFetcher {
    async fn fetch(&self, _url: &str, _branch: &str, dest: &Path) -> Result<(), StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(message) = &self.error {
            return Err(StageError::Clone(message.clone()));
        }
        for (rel, content) in &self.files {
            let path = dest.join(rel);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.unwrap();
            }
            tokio::fs::write(&path, content).await.unwrap();
        }
        Ok(())
    }
}
