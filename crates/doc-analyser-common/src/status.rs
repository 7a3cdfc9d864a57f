//! Job and use case lifecycle states.
//!
//! A job moves strictly forward through
//! `pending → cloning → extracting → executing` and ends in one of the
//! terminal states. Any non-terminal state may jump straight to `failed`
//! or `cancelled`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Cloning,
    Extracting,
    Executing,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Cloning => "cloning",
            JobStatus::Extracting => "extracting",
            JobStatus::Executing => "executing",
            JobStatus::Completed => "completed",
            JobStatus::CompletedWithErrors => "completed_with_errors",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Human readable label for the current stage, shown while polling.
    pub fn stage_label(&self) -> &'static str {
        match self {
            JobStatus::Pending => "Queued",
            JobStatus::Cloning => "Cloning repository",
            JobStatus::Extracting => "Extracting use cases",
            JobStatus::Executing => "Executing use cases",
            JobStatus::Completed => "Completed",
            JobStatus::CompletedWithErrors => "Completed with errors",
            JobStatus::Failed => "Failed",
            JobStatus::Cancelled => "Cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::CompletedWithErrors
                | JobStatus::Failed
                | JobStatus::Cancelled
        )
    }

    /// Position in the stage sequence. Terminal states share the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Cloning => 1,
            JobStatus::Extracting => 2,
            JobStatus::Executing => 3,
            _ => 4,
        }
    }

    pub fn valid_transitions(&self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            Pending => &[Cloning, Failed, Cancelled],
            Cloning => &[Extracting, Failed, Cancelled],
            Extracting => &[Executing, Failed, Cancelled],
            Executing => &[Completed, CompletedWithErrors, Failed, Cancelled],
            Completed | CompletedWithErrors | Failed | Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        self.valid_transitions().contains(&target)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "cloning" => Ok(JobStatus::Cloning),
            "extracting" => Ok(JobStatus::Extracting),
            "executing" => Ok(JobStatus::Executing),
            "completed" => Ok(JobStatus::Completed),
            "completed_with_errors" => Ok(JobStatus::CompletedWithErrors),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UseCaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl UseCaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UseCaseStatus::Pending => "pending",
            UseCaseStatus::Running => "running",
            UseCaseStatus::Completed => "completed",
            UseCaseStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UseCaseStatus::Completed | UseCaseStatus::Failed)
    }

    /// Records only move forward; a terminal record never changes status.
    pub fn can_advance_to(&self, target: UseCaseStatus) -> bool {
        match self {
            UseCaseStatus::Pending => target != UseCaseStatus::Pending,
            UseCaseStatus::Running => target.is_terminal(),
            UseCaseStatus::Completed | UseCaseStatus::Failed => false,
        }
    }
}

impl fmt::Display for UseCaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UseCaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UseCaseStatus::Pending),
            "running" => Ok(UseCaseStatus::Running),
            "completed" => Ok(UseCaseStatus::Completed),
            "failed" => Ok(UseCaseStatus::Failed),
            _ => Err(format!("Invalid use case status: {}", s)),
        }
    }
}

/// One entry of a job's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTransition {
    pub from: JobStatus,
    pub to: JobStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid job transition from {from} to {to}")]
pub struct JobTransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}
