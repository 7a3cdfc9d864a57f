use async_trait::async_trait;
use dashmap::DashMap;
use doc_analyser_common::{Job, JobId, JobReport, JobStatus, UseCaseRecord, UseCaseUpdate};
use chrono::Utc;

use super::JobStore;
use crate::errors::StoreError;

/// Process-local store. Each job sits behind its own shard lock, so an
/// update holds the entry for the duration of the read-modify-write.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: DashMap<JobId, Job>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn ensure_open(job: &Job) -> Result<(), StoreError> {
    if job.status.is_terminal() {
        return Err(StoreError::JobFinished {
            id: job.id,
            status: job.status,
        });
    }
    Ok(())
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.get(&id).map(|entry| entry.value().clone()))
    }

    async fn put(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_use_case(
        &self,
        id: JobId,
        index: usize,
        update: UseCaseUpdate,
    ) -> Result<UseCaseRecord, StoreError> {
        let mut job = self.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        ensure_open(&job)?;
        let record = job
            .use_cases
            .iter_mut()
            .find(|r| r.index == index)
            .ok_or(StoreError::UseCaseNotFound { job_id: id, index })?;
        record.apply(&update);
        let record = record.clone();
        job.updated_at = Utc::now();
        Ok(record)
    }

    async fn transition(
        &self,
        id: JobId,
        to: JobStatus,
        reason: Option<String>,
    ) -> Result<Job, StoreError> {
        let mut job = self.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        job.transition(to, reason)?;
        Ok(job.clone())
    }

    async fn set_use_cases(
        &self,
        id: JobId,
        records: Vec<UseCaseRecord>,
    ) -> Result<(), StoreError> {
        let mut job = self.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        ensure_open(&job)?;
        job.use_cases = records;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn set_report(&self, id: JobId, report: JobReport) -> Result<(), StoreError> {
        let mut job = self.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        ensure_open(&job)?;
        job.report = Some(report);
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|e| e.value().clone()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        Ok(self.jobs.remove(&id).is_some())
    }
}
