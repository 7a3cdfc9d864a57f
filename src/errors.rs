//! Typed error hierarchy for the analysis pipeline.
//!
//! - `AnalysisError` is what callers of the orchestrator see
//! - `StoreError` comes from job store backends
//! - `StageError` aborts a job and is recorded as its error
//! - `ExtractionError`, `AgentError` and `SandboxError` belong to the
//!   collaborators behind the stages

use doc_analyser_common::{JobId, JobStatus, JobTransitionError};
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced to callers of the orchestrator (API handlers, CLI).
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Job {id} not found")]
    JobNotFound { id: JobId },

    #[error("Artifact {name} not found for job {id}")]
    ArtifactNotFound { id: JobId, name: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Job {id} is {status}: {message}")]
    Conflict {
        id: JobId,
        status: JobStatus,
        message: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job {0} not found")]
    JobNotFound(JobId),

    #[error("Use case {index} not found in job {job_id}")]
    UseCaseNotFound { job_id: JobId, index: usize },

    #[error(transparent)]
    InvalidTransition(#[from] JobTransitionError),

    #[error("Job {id} is already {status} and can no longer change")]
    JobFinished { id: JobId, status: JobStatus },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A failure that ends the job in `failed`.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Failed to clone repository: {0}")]
    Clone(String),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("Job store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to prepare job workspace at {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("no use cases found: no documentation files under {folders:?}")]
    NoDocumentation { folders: Vec<String> },

    #[error("Coding agent failed during extraction: {0}")]
    Agent(#[from] AgentError),

    #[error("Agent output contained no parseable use case list: {0}")]
    Unparseable(String),

    #[error("no use cases found")]
    NoUseCases,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to spawn coding agent '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Coding agent timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Coding agent exited with code {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("Coding agent I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to launch sandbox: {0}")]
    Launch(String),

    #[error("Failed waiting on sandbox {id}: {message}")]
    Wait { id: String, message: String },

    #[error("No interpreter configured for {0}")]
    UnsupportedCode(PathBuf),

    #[error("Unknown sandbox {0}")]
    NotFound(String),

    #[error("Sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
}
