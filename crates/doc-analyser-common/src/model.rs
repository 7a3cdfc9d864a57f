use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::status::{JobStatus, JobTransition, JobTransitionError, UseCaseStatus};

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Beginner,
    #[default]
    Intermediate,
    Advanced,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Beginner => "beginner",
            Difficulty::Intermediate => "intermediate",
            Difficulty::Advanced => "advanced",
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Difficulty {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "beginner" => Ok(Difficulty::Beginner),
            "intermediate" => Ok(Difficulty::Intermediate),
            "advanced" => Ok(Difficulty::Advanced),
            _ => Err(format!("Invalid difficulty level: {}", s)),
        }
    }
}

// Agents answer "Beginner", "ADVANCED" and so on.
impl<'de> Deserialize<'de> for Difficulty {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A use case as produced by extraction, before any execution state exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UseCaseSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub difficulty_level: Difficulty,
    #[serde(default)]
    pub documentation_source: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UseCaseRecord {
    pub index: usize,
    #[serde(flatten)]
    pub spec: UseCaseSpec,
    pub status: UseCaseStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_time_seconds: Option<f64>,
    #[serde(default)]
    pub container_logs: Option<String>,
    #[serde(default)]
    pub code_file: Option<String>,
    #[serde(default)]
    pub result_file: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl UseCaseRecord {
    pub fn new(index: usize, spec: UseCaseSpec) -> Self {
        Self {
            index,
            spec,
            status: UseCaseStatus::Pending,
            started_at: None,
            ended_at: None,
            execution_time_seconds: None,
            container_logs: None,
            code_file: None,
            result_file: None,
            error: None,
        }
    }

    /// Apply a partial update field by field. Returns false when the record
    /// is already terminal and the update was ignored.
    pub fn apply(&mut self, update: &UseCaseUpdate) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if let Some(status) = update.status
            && self.status.can_advance_to(status)
        {
            self.status = status;
        }
        if let Some(at) = update.started_at {
            self.started_at = Some(at);
        }
        if let Some(at) = update.ended_at {
            self.ended_at = Some(at);
        }
        if let Some(logs) = &update.container_logs {
            self.container_logs = Some(logs.clone());
        }
        if let Some(file) = &update.code_file {
            self.code_file = Some(file.clone());
        }
        if let Some(file) = &update.result_file {
            self.result_file = Some(file.clone());
        }
        if let Some(error) = &update.error {
            self.error = Some(error.clone());
        }
        if let (Some(start), Some(end)) = (self.started_at, self.ended_at) {
            let millis = (end - start).num_milliseconds().max(0);
            self.execution_time_seconds = Some(millis as f64 / 1000.0);
        }
        true
    }
}

/// Partial update for one use case record. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UseCaseUpdate {
    pub status: Option<UseCaseStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub container_logs: Option<String>,
    pub code_file: Option<String>,
    pub result_file: Option<String>,
    pub error: Option<String>,
}

impl UseCaseUpdate {
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(UseCaseStatus::Running),
            started_at: Some(at),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(UseCaseStatus::Failed),
            ended_at: Some(Utc::now()),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Parameters accepted at submission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub repository_url: String,
    pub branch: String,
    pub include_folders: Vec<String>,
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub repository_url: String,
    pub branch: String,
    pub include_folders: Vec<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub use_cases: Vec<UseCaseRecord>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub transitions: Vec<JobTransition>,
    #[serde(default)]
    pub report: Option<crate::report::JobReport>,
}

impl Job {
    pub fn new(params: NewJob) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            repository_url: params.repository_url,
            branch: params.branch,
            include_folders: params.include_folders,
            project_id: params.project_id,
            created_at: now,
            updated_at: now,
            use_cases: Vec::new(),
            error: None,
            transitions: Vec::new(),
            report: None,
        }
    }

    /// Move to `to`, recording the transition. A reason given for a move
    /// into `failed` or `cancelled` becomes the job's error.
    pub fn transition(
        &mut self,
        to: JobStatus,
        reason: Option<String>,
    ) -> Result<(), JobTransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(JobTransitionError {
                from: self.status,
                to,
            });
        }
        let now = Utc::now();
        if matches!(to, JobStatus::Failed | JobStatus::Cancelled) && reason.is_some() {
            self.error = reason.clone();
        }
        self.transitions.push(JobTransition {
            from: self.status,
            to,
            at: now,
            reason,
        });
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    pub fn counts(&self) -> UseCaseCounts {
        let mut counts = UseCaseCounts {
            total: self.use_cases.len(),
            ..Default::default()
        };
        for record in &self.use_cases {
            match record.status {
                UseCaseStatus::Pending => counts.pending += 1,
                UseCaseStatus::Running => counts.running += 1,
                UseCaseStatus::Completed => counts.completed += 1,
                UseCaseStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn view(&self) -> JobView {
        let counts = self.counts();
        JobView {
            job_id: self.id,
            status: self.status,
            stage: self.status.stage_label().to_string(),
            repository_url: self.repository_url.clone(),
            branch: self.branch.clone(),
            project_id: self.project_id.clone(),
            total_use_cases: counts.total,
            completed: counts.completed,
            failed: counts.failed,
            running: counts.running,
            pending: counts.pending,
            use_cases: self
                .use_cases
                .iter()
                .map(|r| UseCaseSummary {
                    index: r.index,
                    name: r.spec.name.clone(),
                    status: r.status,
                    error: r.error.clone(),
                })
                .collect(),
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UseCaseCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl UseCaseCounts {
    pub fn finished(&self) -> usize {
        self.completed + self.failed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UseCaseSummary {
    pub index: usize,
    pub name: String,
    pub status: UseCaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Polling snapshot of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub stage: String,
    pub repository_url: String,
    pub branch: String,
    #[serde(default)]
    pub project_id: Option<String>,
    pub total_use_cases: usize,
    pub completed: usize,
    pub failed: usize,
    pub running: usize,
    pub pending: usize,
    pub use_cases: Vec<UseCaseSummary>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn spec(name: &str) -> UseCaseSpec {
        UseCaseSpec {
            name: name.to_string(),
            description: format!("{} description", name),
            success_criteria: vec!["runs".into()],
            difficulty_level: Difficulty::Beginner,
            documentation_source: vec!["docs/intro.md".into()],
        }
    }

    fn new_job() -> Job {
        Job::new(NewJob {
            repository_url: "https://example.com/repo.git".into(),
            branch: "main".into(),
            include_folders: vec!["docs".into()],
            project_id: None,
        })
    }

    #[test]
    fn test_difficulty_is_case_insensitive() {
        let d: Difficulty = serde_json::from_str("\"Advanced\"").unwrap();
        assert_eq!(d, Difficulty::Advanced);
        assert_eq!(serde_json::to_string(&d).unwrap(), "\"advanced\"");
        assert!(serde_json::from_str::<Difficulty>("\"expert\"").is_err());
    }

    #[test]
    fn test_record_flattens_spec_fields() {
        let record = UseCaseRecord::new(0, spec("Install"));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["name"], "Install");
        assert_eq!(json["difficulty_level"], "beginner");
        assert_eq!(json["status"], "pending");
    }

    #[test]
    fn test_apply_derives_execution_time() {
        let mut record = UseCaseRecord::new(0, spec("a"));
        let start = Utc::now();
        record.apply(&UseCaseUpdate::started(start));
        assert_eq!(record.status, UseCaseStatus::Running);

        record.apply(&UseCaseUpdate {
            status: Some(UseCaseStatus::Completed),
            ended_at: Some(start + Duration::milliseconds(2500)),
            ..Default::default()
        });
        assert_eq!(record.status, UseCaseStatus::Completed);
        assert_eq!(record.execution_time_seconds, Some(2.5));
    }

    #[test]
    fn test_apply_ignores_updates_after_terminal() {
        let mut record = UseCaseRecord::new(0, spec("a"));
        assert!(record.apply(&UseCaseUpdate::failed("boom")));
        assert!(!record.apply(&UseCaseUpdate::started(Utc::now())));
        assert_eq!(record.status, UseCaseStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("boom"));
        assert!(record.started_at.is_none());
    }

    #[test]
    fn test_job_transition_records_history_and_error() {
        let mut job = new_job();
        job.transition(JobStatus::Cloning, None).unwrap();
        job.transition(JobStatus::Failed, Some("clone failed".into()))
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("clone failed"));
        assert_eq!(job.transitions.len(), 2);
        assert_eq!(job.transitions[0].from, JobStatus::Pending);

        let err = job.transition(JobStatus::Cloning, None).unwrap_err();
        assert_eq!(err.from, JobStatus::Failed);
    }

    #[test]
    fn test_view_counts_match_records() {
        let mut job = new_job();
        job.use_cases = (0..4).map(|i| UseCaseRecord::new(i, spec("x"))).collect();
        job.use_cases[0].apply(&UseCaseUpdate::started(Utc::now()));
        job.use_cases[1].apply(&UseCaseUpdate::failed("nope"));
        job.use_cases[2].apply(&UseCaseUpdate {
            status: Some(UseCaseStatus::Completed),
            ..Default::default()
        });

        let view = job.view();
        assert_eq!(view.total_use_cases, 4);
        assert_eq!(view.running, 1);
        assert_eq!(view.failed, 1);
        assert_eq!(view.completed, 1);
        assert_eq!(view.pending, 1);
        assert_eq!(view.stage, "Queued");
        assert_eq!(view.use_cases[1].error.as_deref(), Some("nope"));
    }
}
