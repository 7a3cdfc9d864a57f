//! Configuration for the analysis service.
//!
//! Read from `doc-analyser.toml` in the working directory, falling back to
//! `<config dir>/doc-analyser/config.toml`. Layering is file → environment →
//! CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8000
//!
//! [storage]
//! backend = "sqlite"          # or "memory"
//! data_dir = "./data"
//! keep_repository = false
//!
//! [pipeline]
//! max_concurrent_jobs = 3
//! max_parallel_use_cases = 5
//! clone_timeout_secs = 300
//!
//! [agent]
//! command = "claude"
//! timeout_secs = 3600
//! max_turns = 50
//!
//! [sandbox]
//! backend = "docker"          # or "process"
//! image = "doc-analyser-sandbox:latest"
//! memory = "1g"
//! cpus = 0.2
//! timeout_secs = 600
//! network = "none"
//!
//! [sandbox.interpreters]
//! py = "python3"
//!
//! [logging]
//! level = "info"
//! json = false
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "doc-analyser.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyserConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_permissive: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_permissive: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StoreBackend::Sqlite),
            "memory" => Ok(StoreBackend::Memory),
            _ => Err(format!("Invalid store backend: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/jobs.db`.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default)]
    pub keep_repository: bool,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            data_dir: default_data_dir(),
            db_path: None,
            keep_repository: false,
        }
    }
}

impl StorageSection {
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("jobs.db"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_max_parallel_use_cases")]
    pub max_parallel_use_cases: usize,
    #[serde(default = "default_clone_timeout")]
    pub clone_timeout_secs: u64,
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

fn default_max_concurrent_jobs() -> usize {
    3
}

fn default_max_parallel_use_cases() -> usize {
    5
}

fn default_clone_timeout() -> u64 {
    300
}

fn default_branch() -> String {
    "main".to_string()
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_parallel_use_cases: default_max_parallel_use_cases(),
            clone_timeout_secs: default_clone_timeout(),
            default_branch: default_branch(),
        }
    }
}

impl PipelineSection {
    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_agent_timeout() -> u64 {
    3600
}

fn default_max_turns() -> u32 {
    50
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            timeout_secs: default_agent_timeout(),
            max_turns: default_max_turns(),
            extra_args: Vec::new(),
        }
    }
}

impl AgentSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    #[default]
    Docker,
    Process,
}

impl std::str::FromStr for SandboxKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(SandboxKind::Docker),
            "process" => Ok(SandboxKind::Process),
            _ => Err(format!("Invalid sandbox backend: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSection {
    #[serde(default)]
    pub backend: SandboxKind,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Extension → interpreter overrides, e.g. `py = "python3"`.
    #[serde(default)]
    pub interpreters: HashMap<String, String>,
}

fn default_image() -> String {
    "doc-analyser-sandbox:latest".to_string()
}

fn default_memory() -> String {
    "1g".to_string()
}

fn default_cpus() -> f64 {
    0.2
}

fn default_sandbox_timeout() -> u64 {
    600
}

fn default_network() -> String {
    "none".to_string()
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            backend: SandboxKind::default(),
            image: default_image(),
            memory: default_memory(),
            cpus: default_cpus(),
            timeout_secs: default_sandbox_timeout(),
            network: default_network(),
            env: HashMap::new(),
            interpreters: HashMap::new(),
        }
    }
}

impl SandboxSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// When set, logs also go to a daily rolling file in this directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            directory: None,
        }
    }
}

/// Parse a docker-style memory string ("512m", "1g", "2048") into bytes.
pub fn parse_memory_bytes(value: &str) -> Option<i64> {
    let value = value.trim().to_ascii_lowercase();
    let (digits, multiplier) = match value.chars().last()? {
        'k' => (&value[..value.len() - 1], 1024),
        'm' => (&value[..value.len() - 1], 1024 * 1024),
        'g' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        'b' => (&value[..value.len() - 1], 1),
        _ => (value.as_str(), 1),
    };
    let amount: i64 = digits.trim().parse().ok()?;
    (amount > 0).then(|| amount * multiplier)
}

impl AnalyserConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse doc-analyser config")
    }

    /// Load the explicit path if given, otherwise the first config file found
    /// in the working directory or the user config dir, otherwise defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Self::load(&local);
        }
        if let Some(dir) = dirs::config_dir() {
            let user = dir.join("doc-analyser").join("config.toml");
            if user.exists() {
                return Self::load(&user);
            }
        }
        Ok(Self::default())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Apply environment variable overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Vec<String> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, returning a warning for every value
    /// that could not be parsed.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Vec<String> {
        let mut warnings = Vec::new();

        fn parsed<T: std::str::FromStr>(
            key: &str,
            raw: Option<String>,
            warnings: &mut Vec<String>,
        ) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warnings.push(format!("Ignoring invalid {}='{}'", key, raw));
                    None
                }
            }
        }

        if let Some(dir) = lookup("DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("DB_PATH") {
            self.storage.db_path = Some(PathBuf::from(path));
        }
        if let Some(v) = parsed("STORE_BACKEND", lookup("STORE_BACKEND"), &mut warnings) {
            self.storage.backend = v;
        }
        if let Some(v) = parsed("MAX_CONCURRENT_JOBS", lookup("MAX_CONCURRENT_JOBS"), &mut warnings) {
            self.pipeline.max_concurrent_jobs = v;
        }
        if let Some(v) = parsed(
            "MAX_PARALLEL_USE_CASES",
            lookup("MAX_PARALLEL_USE_CASES"),
            &mut warnings,
        ) {
            self.pipeline.max_parallel_use_cases = v;
        }
        if let Some(v) = parsed("GIT_CLONE_TIMEOUT", lookup("GIT_CLONE_TIMEOUT"), &mut warnings) {
            self.pipeline.clone_timeout_secs = v;
        }
        if let Some(cmd) = lookup("CLAUDE_CMD") {
            self.agent.command = cmd;
        }
        if let Some(v) = parsed("CLAUDE_CODE_TIMEOUT", lookup("CLAUDE_CODE_TIMEOUT"), &mut warnings) {
            self.agent.timeout_secs = v;
        }
        if let Some(v) = parsed("SANDBOX_BACKEND", lookup("SANDBOX_BACKEND"), &mut warnings) {
            self.sandbox.backend = v;
        }
        if let Some(image) = lookup("DOCKER_SANDBOX_IMAGE") {
            self.sandbox.image = image;
        }
        if let Some(memory) = lookup("WORKER_MEMORY_LIMIT") {
            self.sandbox.memory = memory;
        }
        if let Some(v) = parsed("WORKER_CPU_LIMIT", lookup("WORKER_CPU_LIMIT"), &mut warnings) {
            self.sandbox.cpus = v;
        }
        if let Some(v) = parsed("SANDBOX_TIMEOUT", lookup("SANDBOX_TIMEOUT"), &mut warnings) {
            self.sandbox.timeout_secs = v;
        }
        if let Some(network) = lookup("DOCKER_NETWORK") {
            self.sandbox.network = network;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            self.logging.json = format.eq_ignore_ascii_case("json");
        }

        warnings
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.pipeline.max_parallel_use_cases == 0 {
            warnings.push("pipeline.max_parallel_use_cases is 0; treating as 1".to_string());
        }
        if self.pipeline.max_concurrent_jobs == 0 {
            warnings.push("pipeline.max_concurrent_jobs is 0; treating as 1".to_string());
        }
        if parse_memory_bytes(&self.sandbox.memory).is_none() {
            warnings.push(format!(
                "Invalid sandbox.memory '{}': expected a size such as '512m' or '1g'",
                self.sandbox.memory
            ));
        }
        if self.sandbox.cpus <= 0.0 {
            warnings.push(format!(
                "Invalid sandbox.cpus {}: must be positive",
                self.sandbox.cpus
            ));
        }
        if self.sandbox.timeout_secs == 0 {
            warnings.push("sandbox.timeout_secs is 0; every run will time out".to_string());
        }

        warnings
    }
}
