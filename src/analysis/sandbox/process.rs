use async_trait::async_trait;
use dashmap::DashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{CapturedOutput, LaunchSpec, SandboxBackend};
use crate::errors::SandboxError;

/// How long to keep draining pipes after the child exits. Grandchildren
/// that inherited the pipes can otherwise hold them open indefinitely.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Raw output bytes, decoded only when read so split UTF-8 sequences survive.
type SharedBuffer = Arc<Mutex<Vec<u8>>>;

struct Entry {
    cancel: CancellationToken,
    exit: watch::Receiver<Option<i64>>,
    stdout: SharedBuffer,
    stderr: SharedBuffer,
}

/// Plain child processes confined to the scratch directory. Offers no
/// isolation beyond that; intended for development and tests.
#[derive(Default)]
pub struct ProcessBackend {
    entries: DashMap<String, Entry>,
}

impl ProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R, buffer: SharedBuffer) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut buf) = buffer.lock() {
                    buf.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
}

fn exit_code(status: ExitStatus) -> i64 {
    if let Some(code) = status.code() {
        return i64::from(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + i64::from(signal);
        }
    }
    -1
}

fn snapshot(buffer: &SharedBuffer) -> String {
    buffer
        .lock()
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default()
}

#[async_trait]
impl SandboxBackend for ProcessBackend {
    fn kind(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<String, SandboxError> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| SandboxError::Launch("empty command".into()))?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&spec.scratch_dir)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("REPO_PATH", &spec.repo_dir)
            .env("PYTHONPATH", &spec.repo_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Launch(format!("{program}: {e}")))?;

        let stdout: SharedBuffer = Arc::default();
        let stderr: SharedBuffer = Arc::default();
        let mut readers = Vec::new();
        if let Some(pipe) = child.stdout.take() {
            readers.push(tokio::spawn(drain(pipe, stdout.clone())));
        }
        if let Some(pipe) = child.stderr.take() {
            readers.push(tokio::spawn(drain(pipe, stderr.clone())));
        }

        let id = format!("{}-{}", spec.name, Uuid::new_v4().simple());
        let cancel = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);

        let token = cancel.clone();
        let sandbox = id.clone();
        tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => exit_code(status),
                    Err(e) => {
                        tracing::warn!(sandbox = %sandbox, error = %e, "failed to wait on child");
                        -1
                    }
                },
                _ = token.cancelled() => {
                    let _ = child.kill().await;
                    match child.wait().await {
                        Ok(status) => exit_code(status),
                        Err(_) => -1,
                    }
                }
            };
            let drained = tokio::time::timeout(READER_GRACE, async {
                for reader in readers {
                    let _ = reader.await;
                }
            })
            .await;
            if drained.is_err() {
                tracing::debug!(sandbox = %sandbox, "output pipes still open after exit");
            }
            let _ = exit_tx.send(Some(code));
        });

        self.entries.insert(
            id.clone(),
            Entry {
                cancel,
                exit: exit_rx,
                stdout,
                stderr,
            },
        );
        Ok(id)
    }

    async fn wait(&self, id: &str) -> Result<i64, SandboxError> {
        let mut exit = self
            .entries
            .get(id)
            .map(|entry| entry.exit.clone())
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))?;
        let code = exit
            .wait_for(Option::is_some)
            .await
            .map_err(|e| SandboxError::Wait {
                id: id.to_string(),
                message: e.to_string(),
            })?;
        Ok((*code).unwrap_or(-1))
    }

    async fn logs(&self, id: &str) -> Result<CapturedOutput, SandboxError> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))?;
        Ok(CapturedOutput {
            stdout: snapshot(&entry.stdout),
            stderr: snapshot(&entry.stderr),
        })
    }

    async fn kill(&self, id: &str) -> Result<(), SandboxError> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))?;
        entry.cancel.cancel();
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), SandboxError> {
        let (_, entry) = self
            .entries
            .remove(id)
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))?;
        entry.cancel.cancel();
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::super::SandboxRunner;
    use super::*;
    use crate::config::SandboxSection;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn runner(root: &Path) -> (Arc<ProcessBackend>, SandboxRunner) {
        let backend = Arc::new(ProcessBackend::new());
        let runner = SandboxRunner::new(
            backend.clone(),
            &SandboxSection::default(),
            root.join("scratch"),
        );
        (backend, runner)
    }

    #[tokio::test]
    async fn test_multibyte_char_split_across_reads() {
        // "é" is 0xC3 0xA9; the chain hands them out in separate reads
        let reader = (&b"caf\xc3"[..]).chain(&b"\xa9!"[..]);
        let buffer: SharedBuffer = Arc::default();
        drain(reader, buffer.clone()).await;
        assert_eq!(snapshot(&buffer), "café!");
    }

    #[tokio::test]
    async fn test_script_exit_code_and_output() {
        let dir = tempdir().unwrap();
        let repo = dir.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        let script = dir.path().join("use_case_0.sh");
        fs::write(&script, "echo \"repo=$REPO_PATH\"\necho oops >&2\nexit 3\n").unwrap();

        let (backend, runner) = runner(dir.path());
        let out = runner
            .run("t", &script, &repo, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.timed_out);
        assert_eq!(out.stdout.trim(), format!("repo={}", repo.display()));
        assert_eq!(out.stderr.trim(), "oops");
        assert!(backend.entries.is_empty());
    }

    #[tokio::test]
    async fn test_runs_inside_private_scratch_dir() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("use_case_1.sh");
        fs::write(&script, "touch marker\npwd\n").unwrap();

        let (_, runner) = runner(dir.path());
        let out = runner
            .run("t", &script, dir.path(), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(out.succeeded());
        assert!(out.stdout.trim().starts_with(&dir.path().join("scratch").display().to_string()));
        assert!(!dir.path().join("marker").exists());
        // scratch copy is gone once the run is released
        assert_eq!(fs::read_dir(dir.path().join("scratch")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_deadline_kills_the_process() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("use_case_2.sh");
        fs::write(&script, "exec sleep 30\n").unwrap();

        let (backend, runner) = runner(dir.path());
        let started = std::time::Instant::now();
        let out = runner
            .run("t", &script, dir.path(), Duration::from_millis(200))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert!(!out.succeeded());
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(backend.entries.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let backend = ProcessBackend::new();
        assert!(matches!(
            backend.wait("nope").await,
            Err(SandboxError::NotFound(_))
        ));
        assert!(matches!(
            backend.remove("nope").await,
            Err(SandboxError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_error() {
        let dir = tempdir().unwrap();
        let backend = ProcessBackend::new();
        let spec = LaunchSpec {
            name: "t".into(),
            command: vec!["definitely-not-a-real-interpreter".into()],
            scratch_dir: dir.path().to_path_buf(),
            repo_dir: dir.path().to_path_buf(),
            env: Vec::new(),
        };
        assert!(matches!(
            backend.launch(&spec).await,
            Err(SandboxError::Launch(_))
        ));
    }
}
