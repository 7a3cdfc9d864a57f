//! Job lifecycle: queue, stage runner, bounded fan-out and aggregation.
//!
//! Submitted job ids go onto an unbounded queue. A dispatcher task runs at
//! most `max_concurrent_jobs` pipelines at once, each pipeline being one
//! long-lived task that walks the job through
//! `cloning → extracting → executing → finished`. Every stage checks the
//! stored status first, so delivering the same id twice (or re-enqueueing
//! unfinished jobs after a restart) resumes instead of repeating work.
//!
//! During execution at most `max_parallel_use_cases` executors run at once.
//! They report to a single writer loop that owns all store updates for the
//! job and broadcasts a progress event after each one.

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use doc_analyser_common::artifacts::{REPORT_FILE, USE_CASES_FILE, parse_artifact_name};
use doc_analyser_common::{
    Job, JobId, JobReport, JobStatus, JobView, NewJob, UseCaseRecord, UseCaseSpec, UseCaseUpdate,
};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::executor::{ExecutionContext, ExecutionOutcome, UseCaseExecutor};
use super::extractor::UseCaseExtractor;
use super::fetch::RepoFetcher;
use super::store::JobStore;
use super::ws::{WsMessage, broadcast_message};
use crate::config::AnalyserConfig;
use crate::errors::{AnalysisError, StageError, StoreError};

pub const CANCELLED_BEFORE_EXECUTION: &str = "job cancelled before execution";
const CANCELLED_BY_REQUEST: &str = "cancelled by request";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub data_dir: PathBuf,
    pub max_concurrent_jobs: usize,
    pub max_parallel_use_cases: usize,
    pub keep_repository: bool,
    pub default_branch: String,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AnalyserConfig) -> Self {
        Self {
            data_dir: config.storage.data_dir.clone(),
            max_concurrent_jobs: config.pipeline.max_concurrent_jobs,
            max_parallel_use_cases: config.pipeline.max_parallel_use_cases,
            keep_repository: config.storage.keep_repository,
            default_branch: config.pipeline.default_branch.clone(),
        }
    }
}

/// On-disk layout of one job: `<data_dir>/<job_id>/{repo,data}`.
#[derive(Debug, Clone)]
pub struct JobLayout {
    pub root: PathBuf,
    pub repo_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl JobLayout {
    pub fn new(data_root: &Path, id: JobId) -> Self {
        let root = data_root.join(id.to_string());
        Self {
            repo_dir: root.join("repo"),
            data_dir: root.join("data"),
            root,
        }
    }
}

/// What the fan-out reports to the writer loop.
enum Progress {
    Started { index: usize },
    Finished(Box<ExecutionOutcome>),
    Crashed { index: usize, message: String },
    Skipped { index: usize },
}

impl Progress {
    fn into_update(self) -> (usize, UseCaseUpdate) {
        match self {
            Progress::Started { index } => (index, UseCaseUpdate::started(Utc::now())),
            Progress::Finished(outcome) => (outcome.index, outcome.update()),
            Progress::Crashed { index, message } => (
                index,
                UseCaseUpdate::failed(format!("executor panicked: {message}")),
            ),
            Progress::Skipped { index } => (index, UseCaseUpdate::failed(CANCELLED_BEFORE_EXECUTION)),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn until_cancelled<F: Future>(token: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        out = fut => Some(out),
    }
}

fn workspace_error(path: &Path) -> impl FnOnce(std::io::Error) -> StageError + '_ {
    move |source| StageError::Workspace {
        path: path.to_path_buf(),
        source,
    }
}

pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    fetcher: Arc<dyn RepoFetcher>,
    extractor: UseCaseExtractor,
    executor: Arc<UseCaseExecutor>,
    settings: OrchestratorSettings,
    active: DashMap<JobId, CancellationToken>,
    events: broadcast::Sender<String>,
    queue: mpsc::UnboundedSender<JobId>,
}

impl Orchestrator {
    /// Build the orchestrator and spawn its dispatcher. Must be called
    /// inside a tokio runtime.
    pub fn start(
        store: Arc<dyn JobStore>,
        fetcher: Arc<dyn RepoFetcher>,
        extractor: UseCaseExtractor,
        executor: UseCaseExecutor,
        settings: OrchestratorSettings,
        events: broadcast::Sender<String>,
    ) -> Arc<Self> {
        let (queue, rx) = mpsc::unbounded_channel();
        let limit = settings.max_concurrent_jobs.max(1);
        let orchestrator = Arc::new(Self {
            store,
            fetcher,
            extractor,
            executor: Arc::new(executor),
            settings,
            active: DashMap::new(),
            events,
            queue,
        });
        tokio::spawn(Self::dispatch(Arc::downgrade(&orchestrator), rx, limit));
        orchestrator
    }

    async fn dispatch(this: Weak<Self>, mut rx: mpsc::UnboundedReceiver<JobId>, limit: usize) {
        let permits = Arc::new(Semaphore::new(limit));
        while let Some(job_id) = rx.recv().await {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let Some(orchestrator) = this.upgrade() else {
                break;
            };
            let span = tracing::info_span!("job", job_id = %job_id);
            tokio::spawn(
                async move {
                    let _permit = permit;
                    orchestrator.run_job(job_id).await;
                }
                .instrument(span),
            );
        }
        tracing::debug!("job dispatcher stopped");
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn events(&self) -> broadcast::Sender<String> {
        self.events.clone()
    }

    pub fn layout(&self, id: JobId) -> JobLayout {
        JobLayout::new(&self.settings.data_dir, id)
    }

    pub fn is_active(&self, id: JobId) -> bool {
        self.active.contains_key(&id)
    }

    fn enqueue(&self, id: JobId) {
        if self.queue.send(id).is_err() {
            tracing::error!(job_id = %id, "job queue closed, job not scheduled");
        }
    }

    fn validate(&self, mut request: NewJob) -> Result<NewJob, AnalysisError> {
        let url = request.repository_url.trim();
        if url.is_empty() {
            return Err(AnalysisError::InvalidRequest(
                "repository url must not be empty".into(),
            ));
        }
        if url.chars().any(char::is_whitespace) {
            return Err(AnalysisError::InvalidRequest(
                "repository url must not contain whitespace".into(),
            ));
        }
        request.repository_url = url.to_string();

        if request.branch.trim().is_empty() {
            request.branch = self.settings.default_branch.clone();
        } else {
            request.branch = request.branch.trim().to_string();
        }

        if request.include_folders.is_empty() {
            return Err(AnalysisError::InvalidRequest(
                "at least one include folder is required".into(),
            ));
        }
        for folder in &mut request.include_folders {
            let trimmed = folder.trim().trim_end_matches('/').to_string();
            let path = Path::new(&trimmed);
            let escapes = path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir));
            if trimmed.is_empty() || path.is_absolute() || escapes {
                return Err(AnalysisError::InvalidRequest(format!(
                    "include folder {folder:?} must be a relative path inside the repository"
                )));
            }
            *folder = trimmed;
        }
        request.project_id = request
            .project_id
            .take()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        Ok(request)
    }

    /// Validate, persist a pending job and queue it.
    pub async fn submit(&self, request: NewJob) -> Result<JobId, AnalysisError> {
        let request = self.validate(request)?;
        let job = Job::new(request);
        self.store.put(&job).await?;
        tracing::info!(job_id = %job.id, repository = %job.repository_url, branch = %job.branch, "job submitted");
        broadcast_message(&self.events, &WsMessage::JobSubmitted { job: job.view() });
        self.enqueue(job.id);
        Ok(job.id)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Job, AnalysisError> {
        self.store
            .get(id)
            .await?
            .ok_or(AnalysisError::JobNotFound { id })
    }

    pub async fn get_status(&self, id: JobId) -> Result<JobView, AnalysisError> {
        Ok(self.get_job(id).await?.view())
    }

    /// Newest first, optionally restricted to one project.
    pub async fn list_jobs(&self, project_id: Option<&str>) -> Result<Vec<Job>, AnalysisError> {
        let jobs = self.store.list().await?;
        Ok(match project_id {
            Some(project) => jobs
                .into_iter()
                .filter(|job| job.project_id.as_deref() == Some(project))
                .collect(),
            None => jobs,
        })
    }

    /// Request cancellation. A running job stops launching executors and
    /// ends `cancelled` once in-flight work drains; a queued job is
    /// cancelled on the spot.
    pub async fn cancel(&self, id: JobId) -> Result<JobView, AnalysisError> {
        let job = self.get_job(id).await?;
        if job.status.is_terminal() {
            return Err(AnalysisError::Conflict {
                id,
                status: job.status,
                message: "job has already finished".into(),
            });
        }
        // Claim the active slot with a cancelled token so a dispatcher that
        // picks the job up meanwhile treats it as already running.
        match self.active.entry(id) {
            Entry::Occupied(entry) => {
                tracing::info!(job_id = %id, "cancellation requested");
                entry.get().cancel();
                return Ok(job.view());
            }
            Entry::Vacant(slot) => {
                let claim = CancellationToken::new();
                claim.cancel();
                slot.insert(claim);
            }
        }
        let result = self.mark_cancelled(id).await;
        self.active.remove(&id);
        match result {
            Ok(job) => Ok(job.view()),
            Err(StoreError::InvalidTransition(_) | StoreError::JobFinished { .. }) => {
                let job = self.get_job(id).await?;
                Err(AnalysisError::Conflict {
                    id,
                    status: job.status,
                    message: "job has already finished".into(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a finished job's record and artifacts.
    pub async fn delete_job(&self, id: JobId) -> Result<(), AnalysisError> {
        let job = self.get_job(id).await?;
        if !job.status.is_terminal() || self.is_active(id) {
            return Err(AnalysisError::Conflict {
                id,
                status: job.status,
                message: "only finished jobs can be deleted".into(),
            });
        }
        let root = self.layout(id).root;
        match tokio::fs::remove_dir_all(&root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("failed to remove {}", root.display()))
                    .into());
            }
        }
        self.store.delete(id).await?;
        tracing::info!(job_id = %id, "job deleted");
        broadcast_message(&self.events, &WsMessage::JobDeleted { job_id: id });
        Ok(())
    }

    /// Resolve an artifact name to its path, refusing anything outside the
    /// artifact naming convention.
    pub async fn artifact_path(&self, id: JobId, name: &str) -> Result<PathBuf, AnalysisError> {
        self.get_job(id).await?;
        if parse_artifact_name(name).is_none() {
            return Err(AnalysisError::InvalidRequest(format!(
                "{name:?} is not a job artifact"
            )));
        }
        let path = self.layout(id).data_dir.join(name);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(AnalysisError::ArtifactNotFound {
                id,
                name: name.to_string(),
            });
        }
        Ok(path)
    }

    /// Re-queue every unfinished job. Returns how many were queued.
    pub async fn resume_incomplete(&self) -> Result<usize, AnalysisError> {
        let jobs = self.store.list().await?;
        let mut resumed = 0;
        // oldest first
        for job in jobs.iter().rev().filter(|j| !j.status.is_terminal()) {
            tracing::info!(job_id = %job.id, status = %job.status, "resuming unfinished job");
            self.enqueue(job.id);
            resumed += 1;
        }
        Ok(resumed)
    }

    async fn publish(&self, id: JobId, make: impl FnOnce(JobView) -> WsMessage) {
        match self.store.get(id).await {
            Ok(Some(job)) => broadcast_message(&self.events, &make(job.view())),
            Ok(None) => {}
            Err(e) => tracing::warn!(job_id = %id, error = %e, "could not read job for event"),
        }
    }

    async fn advance(&self, id: JobId, to: JobStatus) -> Result<Job, StoreError> {
        let job = self.store.transition(id, to, None).await?;
        tracing::info!(status = %to, "{}", to.stage_label());
        broadcast_message(&self.events, &WsMessage::JobStatusChanged { job: job.view() });
        Ok(job)
    }

    async fn finish(&self, id: JobId, to: JobStatus, reason: Option<String>) -> Result<Job, StoreError> {
        let job = self.store.transition(id, to, reason).await?;
        match &job.error {
            Some(error) => tracing::warn!(status = %to, error = %error, "job finished"),
            None => tracing::info!(status = %to, "job finished"),
        }
        broadcast_message(&self.events, &WsMessage::JobFinished { job: job.view() });
        Ok(job)
    }

    async fn mark_cancelled(&self, id: JobId) -> Result<Job, StoreError> {
        if let Some(job) = self.store.get(id).await? {
            for record in job.use_cases.iter().filter(|r| !r.status.is_terminal()) {
                self.store
                    .update_use_case(id, record.index, UseCaseUpdate::failed(CANCELLED_BEFORE_EXECUTION))
                    .await?;
            }
        }
        self.finish(id, JobStatus::Cancelled, Some(CANCELLED_BY_REQUEST.into()))
            .await
    }

    async fn run_job(&self, id: JobId) {
        let token = match self.active.entry(id) {
            Entry::Occupied(_) => {
                tracing::debug!("job already running, ignoring redelivery");
                return;
            }
            Entry::Vacant(slot) => slot.insert(CancellationToken::new()).clone(),
        };

        if let Err(e) = self.run_pipeline(id, &token).await {
            self.record_failure(id, &e).await;
        }
        self.cleanup(id).await;
        self.active.remove(&id);
    }

    async fn record_failure(&self, id: JobId, error: &StageError) {
        let message = error.to_string();
        match self.finish(id, JobStatus::Failed, Some(message.clone())).await {
            Ok(_) => {}
            // someone else (a direct cancel) already finished the job
            Err(e @ (StoreError::InvalidTransition(_) | StoreError::JobFinished { .. })) => {
                tracing::debug!(error = %e, stage_error = %message, "job already finished");
            }
            Err(e) => {
                tracing::error!(error = %e, stage_error = %message, "could not record job failure");
            }
        }
    }

    async fn cleanup(&self, id: JobId) {
        if self.settings.keep_repository {
            return;
        }
        let terminal = matches!(self.store.get(id).await, Ok(Some(job)) if job.status.is_terminal());
        if !terminal {
            return;
        }
        let repo_dir = self.layout(id).repo_dir;
        if let Err(e) = tokio::fs::remove_dir_all(&repo_dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %repo_dir.display(), error = %e, "failed to remove repository clone");
        }
    }

    async fn run_pipeline(&self, id: JobId, token: &CancellationToken) -> Result<(), StageError> {
        let Some(job) = self.store.get(id).await? else {
            tracing::warn!("queued job no longer exists");
            return Ok(());
        };
        if job.status.is_terminal() {
            tracing::debug!(status = %job.status, "job already finished, nothing to do");
            return Ok(());
        }
        let status = job.status;
        let layout = self.layout(id);
        tokio::fs::create_dir_all(&layout.data_dir)
            .await
            .map_err(workspace_error(&layout.data_dir))?;

        // clone
        if status.rank() < JobStatus::Cloning.rank() {
            self.advance(id, JobStatus::Cloning).await?;
        }
        let repo_present = tokio::fs::try_exists(&layout.repo_dir).await.unwrap_or(false);
        if status.rank() <= JobStatus::Cloning.rank() || !repo_present {
            let fetch = self
                .fetcher
                .fetch(&job.repository_url, &job.branch, &layout.repo_dir);
            match until_cancelled(token, fetch).await {
                Some(result) => result?,
                None => return self.stop_cancelled(id).await,
            }
        }

        // extract
        let records = if status.rank() <= JobStatus::Extracting.rank() {
            if status.rank() < JobStatus::Extracting.rank() {
                self.advance(id, JobStatus::Extracting).await?;
            }
            let extract = self.extractor.extract(
                &layout.repo_dir,
                &job.include_folders,
                &layout.data_dir,
            );
            let specs = match until_cancelled(token, extract).await {
                Some(result) => result?,
                None => return self.stop_cancelled(id).await,
            };
            tracing::info!(use_cases = specs.len(), "use cases extracted");
            self.write_use_cases(&layout, &specs).await;
            let records: Vec<UseCaseRecord> = specs
                .into_iter()
                .enumerate()
                .map(|(index, spec)| UseCaseRecord::new(index, spec))
                .collect();
            self.store.set_use_cases(id, records.clone()).await?;
            records
        } else {
            job.use_cases.clone()
        };
        if records.is_empty() {
            return Err(crate::errors::ExtractionError::NoUseCases.into());
        }

        // execute
        if status.rank() < JobStatus::Executing.rank() {
            self.advance(id, JobStatus::Executing).await?;
        }
        if token.is_cancelled() {
            return self.stop_cancelled(id).await;
        }
        let ctx = ExecutionContext {
            job_id: id,
            repo_dir: layout.repo_dir.clone(),
            artifact_dir: layout.data_dir.clone(),
            include_folders: job.include_folders.clone(),
        };
        self.execute_all(id, ctx, records, token).await?;

        // aggregate
        self.aggregate(id, &layout, token.is_cancelled()).await
    }

    async fn stop_cancelled(&self, id: JobId) -> Result<(), StageError> {
        self.mark_cancelled(id).await?;
        Ok(())
    }

    async fn write_use_cases(&self, layout: &JobLayout, specs: &[UseCaseSpec]) {
        let path = layout.data_dir.join(USE_CASES_FILE);
        let body = match serde_json::to_vec_pretty(&serde_json::json!({ "use_cases": specs })) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, "could not serialize use case list");
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&path, body).await {
            tracing::warn!(path = %path.display(), error = %e, "could not write use case list");
        }
    }

    /// Run every non-terminal record with at most `max_parallel_use_cases`
    /// in flight. Store updates happen only in the writer loop below.
    async fn execute_all(
        &self,
        id: JobId,
        ctx: ExecutionContext,
        records: Vec<UseCaseRecord>,
        token: &CancellationToken,
    ) -> Result<(), StoreError> {
        let pending: Vec<UseCaseRecord> = records
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .collect();
        tracing::info!(
            use_cases = pending.len(),
            parallel = self.settings.max_parallel_use_cases,
            "executing use cases"
        );

        let (tx, mut rx) = mpsc::unbounded_channel::<Progress>();
        let semaphore = Arc::new(Semaphore::new(self.settings.max_parallel_use_cases.max(1)));
        let ctx = Arc::new(ctx);
        let executor = self.executor.clone();
        let token = token.clone();

        let launcher = async move {
            let mut tasks = JoinSet::new();
            for record in pending {
                let index = record.index;
                let permit = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    permit = semaphore.clone().acquire_owned() => permit.ok(),
                };
                let Some(permit) = permit else {
                    let _ = tx.send(Progress::Skipped { index });
                    continue;
                };
                let tx = tx.clone();
                let ctx = ctx.clone();
                let executor = executor.clone();
                tasks.spawn(
                    async move {
                        let _permit = permit;
                        let _ = tx.send(Progress::Started { index });
                        let run = AssertUnwindSafe(executor.execute(&ctx, index, &record.spec))
                            .catch_unwind()
                            .await;
                        let progress = match run {
                            Ok(outcome) => Progress::Finished(Box::new(outcome)),
                            Err(payload) => Progress::Crashed {
                                index,
                                message: panic_message(payload.as_ref()),
                            },
                        };
                        let _ = tx.send(progress);
                    }
                    .in_current_span(),
                );
            }
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "executor task failed to join");
                }
            }
        };

        let writer = async {
            let mut first_error = None;
            while let Some(progress) = rx.recv().await {
                let (index, update) = progress.into_update();
                match self.store.update_use_case(id, index, update).await {
                    Ok(_) => {
                        self.publish(id, |job| WsMessage::UseCaseUpdated { index, job })
                            .await
                    }
                    Err(e) => {
                        tracing::error!(use_case = index, error = %e, "failed to record use case progress");
                        first_error.get_or_insert(e);
                    }
                }
            }
            first_error
        };

        let ((), first_error) = tokio::join!(launcher, writer);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn aggregate(&self, id: JobId, layout: &JobLayout, cancelled: bool) -> Result<(), StageError> {
        let job = self
            .store
            .get(id)
            .await?
            .ok_or(StoreError::JobNotFound(id))?;
        let report = JobReport::build(&job);
        let report_path = layout.data_dir.join(REPORT_FILE);
        match serde_json::to_vec_pretty(&report) {
            Ok(body) => {
                if let Err(e) = tokio::fs::write(&report_path, body).await {
                    tracing::warn!(path = %report_path.display(), error = %e, "could not write report");
                }
            }
            Err(e) => tracing::warn!(error = %e, "could not serialize report"),
        }
        self.store.set_report(id, report).await?;

        if cancelled {
            self.mark_cancelled(id).await?;
            return Ok(());
        }
        let counts = job.counts();
        let (status, reason) = if counts.failed == 0 {
            (JobStatus::Completed, None)
        } else if counts.failed < counts.total {
            (JobStatus::CompletedWithErrors, None)
        } else {
            (
                JobStatus::Failed,
                Some(format!("all {} use cases failed", counts.total)),
            )
        };
        self.finish(id, status, reason).await?;
        Ok(())
    }
}
