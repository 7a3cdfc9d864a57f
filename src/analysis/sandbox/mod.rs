//! Isolated, ephemeral execution of synthesized code.
//!
//! `SandboxRunner::run` copies the code into a private scratch directory,
//! launches it through a `SandboxBackend` with the repository mounted
//! read-only, enforces the timeout as a hard deadline and tears the
//! environment down again. Teardown is owned by `SandboxHandle`: explicit
//! `release()` on the normal path, `Drop` on every other path (early
//! return, panic, or the future being dropped on cancellation).

mod docker;
mod process;

pub use docker::DockerBackend;
pub use process::ProcessBackend;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

use crate::config::{SandboxKind, SandboxSection};
use crate::errors::SandboxError;

/// Mount point of the repository inside a container.
pub const REPO_MOUNT: &str = "/workspace/repo";
/// Working directory (the scratch copy) inside a container.
pub const RUN_DIR: &str = "/workspace/run";

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub name: String,
    /// Command relative to the scratch directory, e.g. `["python", "use_case_0.py"]`.
    pub command: Vec<String>,
    pub scratch_dir: PathBuf,
    pub repo_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

/// One way of running an isolated process. Implementations must clean up
/// any half-created environment themselves when `launch` fails.
#[async_trait]
pub trait SandboxBackend: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    async fn launch(&self, spec: &LaunchSpec) -> Result<String, SandboxError>;

    /// Wait for the sandbox to exit and return its exit code.
    async fn wait(&self, id: &str) -> Result<i64, SandboxError>;

    async fn logs(&self, id: &str) -> Result<CapturedOutput, SandboxError>;

    async fn kill(&self, id: &str) -> Result<(), SandboxError>;

    /// Force-remove the sandbox and everything it owns.
    async fn remove(&self, id: &str) -> Result<(), SandboxError>;
}

/// A running sandbox. Removal happens exactly once, either through
/// `release()` or when the handle is dropped.
pub struct SandboxHandle {
    backend: Arc<dyn SandboxBackend>,
    id: Option<String>,
    deadline: Instant,
    // removed from disk when the handle goes away
    _scratch: TempDir,
}

impl SandboxHandle {
    pub async fn acquire(
        backend: Arc<dyn SandboxBackend>,
        spec: &LaunchSpec,
        scratch: TempDir,
        timeout: Duration,
    ) -> Result<Self, SandboxError> {
        let id = backend.launch(spec).await?;
        tracing::debug!(sandbox = %id, backend = backend.kind(), "sandbox launched");
        Ok(Self {
            backend,
            id: Some(id),
            deadline: Instant::now() + timeout,
            _scratch: scratch,
        })
    }

    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub async fn release(mut self) {
        if let Some(id) = self.id.take() {
            if let Err(e) = self.backend.remove(&id).await {
                tracing::warn!(sandbox = %id, error = %e, "failed to remove sandbox");
            } else {
                tracing::debug!(sandbox = %id, "sandbox removed");
            }
        }
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let backend = self.backend.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = backend.remove(&id).await {
                        tracing::warn!(sandbox = %id, error = %e, "failed to remove abandoned sandbox");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(sandbox = %id, "no runtime left to remove sandbox");
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxOutput {
    /// `None` when the run was killed at its deadline.
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl SandboxOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

fn default_interpreters() -> HashMap<String, Vec<String>> {
    [
        ("py", vec!["python"]),
        ("js", vec!["node"]),
        ("mjs", vec!["node"]),
        ("sh", vec!["sh"]),
    ]
    .into_iter()
    .map(|(ext, cmd)| {
        (
            ext.to_string(),
            cmd.into_iter().map(String::from).collect(),
        )
    })
    .collect()
}

#[derive(Clone)]
pub struct SandboxRunner {
    backend: Arc<dyn SandboxBackend>,
    interpreters: HashMap<String, Vec<String>>,
    env: Vec<(String, String)>,
    scratch_root: PathBuf,
}

impl SandboxRunner {
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        config: &SandboxSection,
        scratch_root: PathBuf,
    ) -> Self {
        let mut interpreters = default_interpreters();
        for (ext, cmd) in &config.interpreters {
            let parts: Vec<String> = cmd.split_whitespace().map(String::from).collect();
            if !parts.is_empty() {
                interpreters.insert(ext.trim_start_matches('.').to_string(), parts);
            }
        }
        let mut env: Vec<(String, String)> = config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();
        Self {
            backend,
            interpreters,
            env,
            scratch_root,
        }
    }

    /// Build the backend selected in config.
    pub fn from_config(config: &SandboxSection, scratch_root: PathBuf) -> Result<Self, SandboxError> {
        let backend: Arc<dyn SandboxBackend> = match config.backend {
            SandboxKind::Docker => Arc::new(DockerBackend::connect(config)?),
            SandboxKind::Process => Arc::new(ProcessBackend::new()),
        };
        Ok(Self::new(backend, config, scratch_root))
    }

    pub fn backend(&self) -> &Arc<dyn SandboxBackend> {
        &self.backend
    }

    pub fn interpreter_for(&self, code_path: &Path) -> Option<&[String]> {
        let ext = code_path.extension()?.to_str()?;
        self.interpreters.get(ext).map(Vec::as_slice)
    }

    /// Run `code_path` in a fresh sandbox, killing it at `timeout`.
    pub async fn run(
        &self,
        name: &str,
        code_path: &Path,
        repo_dir: &Path,
        timeout: Duration,
    ) -> Result<SandboxOutput, SandboxError> {
        let interpreter = self
            .interpreter_for(code_path)
            .ok_or_else(|| SandboxError::UnsupportedCode(code_path.to_path_buf()))?;
        let file_name = code_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SandboxError::UnsupportedCode(code_path.to_path_buf()))?
            .to_string();

        tokio::fs::create_dir_all(&self.scratch_root).await?;
        let scratch = tempfile::Builder::new()
            .prefix("sandbox-")
            .tempdir_in(&self.scratch_root)?;
        tokio::fs::copy(code_path, scratch.path().join(&file_name)).await?;

        let mut command = interpreter.to_vec();
        command.push(file_name);
        let spec = LaunchSpec {
            name: name.to_string(),
            command,
            scratch_dir: scratch.path().to_path_buf(),
            repo_dir: repo_dir.to_path_buf(),
            env: self.env.clone(),
        };

        let started = Instant::now();
        let handle = SandboxHandle::acquire(self.backend.clone(), &spec, scratch, timeout).await?;

        let waited = tokio::time::timeout_at(handle.deadline(), self.backend.wait(handle.id())).await;
        let (exit_code, timed_out) = match waited {
            Ok(Ok(code)) => (Some(code), false),
            Ok(Err(e)) => {
                handle.release().await;
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(sandbox = %handle.id(), timeout_secs = timeout.as_secs_f64(), "sandbox exceeded its deadline, killing");
                if let Err(e) = self.backend.kill(handle.id()).await {
                    tracing::warn!(sandbox = %handle.id(), error = %e, "failed to kill sandbox");
                }
                (None, true)
            }
        };

        let logs = match self.backend.logs(handle.id()).await {
            Ok(logs) => logs,
            Err(e) => {
                tracing::warn!(sandbox = %handle.id(), error = %e, "failed to collect sandbox logs");
                CapturedOutput::default()
            }
        };
        handle.release().await;

        Ok(SandboxOutput {
            exit_code,
            stdout: logs.stdout,
            stderr: logs.stderr,
            timed_out,
            duration: started.elapsed(),
        })
    }
}
