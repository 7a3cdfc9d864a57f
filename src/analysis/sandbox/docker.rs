use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, InspectContainerOptions, KillContainerOptions,
    LogsOptionsBuilder, RemoveContainerOptionsBuilder, StartContainerOptions,
    WaitContainerOptionsBuilder,
};
use futures_util::StreamExt;
use std::collections::HashMap;

use super::{CapturedOutput, LaunchSpec, REPO_MOUNT, RUN_DIR, SandboxBackend};
use crate::config::{SandboxSection, parse_memory_bytes};
use crate::errors::SandboxError;

const SANDBOX_LABEL: &str = "doc-analyser.sandbox";

/// One container per run: scratch directory bound read-write as the working
/// directory, repository bound read-only, memory and CPU capped.
pub struct DockerBackend {
    docker: Docker,
    image: String,
    memory: Option<i64>,
    nano_cpus: Option<i64>,
    network: String,
}

impl DockerBackend {
    pub fn connect(config: &SandboxSection) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::with_client(docker, config))
    }

    pub fn with_client(docker: Docker, config: &SandboxSection) -> Self {
        let nano_cpus = (config.cpus > 0.0).then(|| (config.cpus * 1e9) as i64);
        Self {
            docker,
            image: config.image.clone(),
            memory: parse_memory_bytes(&config.memory),
            nano_cpus,
            network: config.network.clone(),
        }
    }

    fn create_body(&self, spec: &LaunchSpec) -> ContainerCreateBody {
        let mut env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        env.push(format!("REPO_PATH={REPO_MOUNT}"));
        env.push(format!("PYTHONPATH={REPO_MOUNT}"));

        ContainerCreateBody {
            image: Some(self.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(env),
            working_dir: Some(RUN_DIR.to_string()),
            network_disabled: Some(self.network == "none"),
            labels: Some(HashMap::from([(SANDBOX_LABEL.to_string(), "true".to_string())])),
            host_config: Some(HostConfig {
                binds: Some(vec![
                    format!("{}:{RUN_DIR}:rw", spec.scratch_dir.display()),
                    format!("{}:{REPO_MOUNT}:ro", spec.repo_dir.display()),
                ]),
                memory: self.memory,
                nano_cpus: self.nano_cpus,
                network_mode: Some(self.network.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn oom_killed(&self, id: &str) -> bool {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info
                .state
                .and_then(|state| state.oom_killed)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn force_remove(&self, id: &str) -> Result<(), SandboxError> {
        let options = RemoveContainerOptionsBuilder::new().force(true).build();
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn kind(&self) -> &'static str {
        "docker"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<String, SandboxError> {
        let options = CreateContainerOptionsBuilder::new().name(&spec.name).build();
        let created = self
            .docker
            .create_container(Some(options), self.create_body(spec))
            .await
            .map_err(|e| SandboxError::Launch(format!("create {}: {e}", spec.name)))?;
        for warning in &created.warnings {
            tracing::warn!(container = %created.id, "{warning}");
        }

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
        {
            if let Err(cleanup) = self.force_remove(&created.id).await {
                tracing::warn!(container = %created.id, error = %cleanup, "failed to remove unstarted container");
            }
            return Err(SandboxError::Launch(format!("start {}: {e}", spec.name)));
        }
        Ok(created.id)
    }

    async fn wait(&self, id: &str) -> Result<i64, SandboxError> {
        let options = WaitContainerOptionsBuilder::new()
            .condition("not-running")
            .build();
        let mut stream = self.docker.wait_container(id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exits surface as an error carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(SandboxError::Wait {
                id: id.to_string(),
                message: e.to_string(),
            }),
            None => Err(SandboxError::Wait {
                id: id.to_string(),
                message: "wait stream ended without an exit status".into(),
            }),
        }
    }

    async fn logs(&self, id: &str) -> Result<CapturedOutput, SandboxError> {
        let options = LogsOptionsBuilder::new()
            .stdout(true)
            .stderr(true)
            .follow(false)
            .build();
        let mut stream = self.docker.logs(id, Some(options));
        let mut out = CapturedOutput::default();
        while let Some(chunk) = stream.next().await {
            match chunk? {
                LogOutput::StdErr { message } => {
                    out.stderr.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    out.stdout.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::StdIn { .. } => {}
            }
        }
        if self.oom_killed(id).await {
            out.stderr.push_str("\n[sandbox] killed: memory limit exceeded\n");
        }
        Ok(out)
    }

    async fn kill(&self, id: &str) -> Result<(), SandboxError> {
        self.docker
            .kill_container(id, None::<KillContainerOptions>)
            .await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), SandboxError> {
        self.force_remove(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn backend() -> DockerBackend {
        let docker = Docker::connect_with_http("http://127.0.0.1:1", 1, bollard::API_DEFAULT_VERSION)
            .unwrap();
        DockerBackend::with_client(docker, &SandboxSection::default())
    }

    fn spec() -> LaunchSpec {
        LaunchSpec {
            name: "use_case_executor_test_0".into(),
            command: vec!["python".into(), "use_case_0.py".into()],
            scratch_dir: PathBuf::from("/data/job/scratch"),
            repo_dir: PathBuf::from("/data/job/repo"),
            env: vec![("API_KEY".into(), "k".into())],
        }
    }

    #[test]
    fn test_limits_from_config() {
        let backend = backend();
        assert_eq!(backend.memory, Some(1024 * 1024 * 1024));
        assert_eq!(backend.nano_cpus, Some(200_000_000));
        assert_eq!(backend.network, "none");
    }

    #[test]
    fn test_create_body_mounts_repo_read_only() {
        let body = backend().create_body(&spec());
        let host = body.host_config.unwrap();
        let binds = host.binds.unwrap();
        assert!(binds.contains(&format!("/data/job/repo:{REPO_MOUNT}:ro")));
        assert!(binds.contains(&format!("/data/job/scratch:{RUN_DIR}:rw")));
        assert_eq!(body.working_dir.as_deref(), Some(RUN_DIR));
        assert_eq!(body.network_disabled, Some(true));

        let env = body.env.unwrap();
        assert!(env.contains(&"API_KEY=k".to_string()));
        assert!(env.contains(&format!("REPO_PATH={REPO_MOUNT}")));
    }

    #[tokio::test]
    async fn test_launch_against_unreachable_daemon_is_launch_error() {
        let err = backend().launch(&spec()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Launch(_)));
    }
}
