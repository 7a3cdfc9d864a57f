//! Shared domain types for the doc-analyser pipeline.
//!
//! The server crate, its store backends and any client polling the API all
//! agree on these shapes.

pub mod artifacts;
pub mod model;
pub mod report;
pub mod result;
pub mod status;

pub use model::{
    Difficulty, Job, JobId, JobView, NewJob, UseCaseCounts, UseCaseRecord, UseCaseSpec,
    UseCaseSummary, UseCaseUpdate,
};
pub use report::JobReport;
pub use result::{ExecutionResult, ExecutionStatus};
pub use status::{JobStatus, JobTransition, JobTransitionError, UseCaseStatus};
