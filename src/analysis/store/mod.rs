//! Job persistence.
//!
//! Both backends guarantee that a use case update is applied atomically
//! with respect to concurrent updates of other use cases in the same job,
//! and that a read after a write observes the write.

mod memory;
mod sqlite;

pub use memory::MemoryJobStore;
pub use sqlite::{DbHandle, JobDb, SqliteJobStore};

use async_trait::async_trait;
use doc_analyser_common::{
    Job, JobId, JobReport, JobStatus, UseCaseRecord, UseCaseUpdate,
};

use crate::errors::StoreError;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Insert or replace a whole job. Only used at creation time; later
    /// changes go through the narrower methods below.
    async fn put(&self, job: &Job) -> Result<(), StoreError>;

    /// Apply a partial update to one use case and return the record as stored.
    async fn update_use_case(
        &self,
        id: JobId,
        index: usize,
        update: UseCaseUpdate,
    ) -> Result<UseCaseRecord, StoreError>;

    /// Validate and apply a status transition, returning the updated job.
    async fn transition(
        &self,
        id: JobId,
        to: JobStatus,
        reason: Option<String>,
    ) -> Result<Job, StoreError>;

    /// Replace the job's use cases with the extraction output.
    async fn set_use_cases(&self, id: JobId, records: Vec<UseCaseRecord>)
    -> Result<(), StoreError>;

    async fn set_report(&self, id: JobId, report: JobReport) -> Result<(), StoreError>;

    /// All jobs, newest first.
    async fn list(&self) -> Result<Vec<Job>, StoreError>;

    async fn delete(&self, id: JobId) -> Result<bool, StoreError>;
}
