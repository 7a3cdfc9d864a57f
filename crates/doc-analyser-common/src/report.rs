//! Aggregate report produced once every use case of a job is terminal.
//!
//! Each use case is scored out of 10:
//!
//! | Signal                          | Points |
//! |---------------------------------|--------|
//! | non-empty description           | 2      |
//! | at least one success criterion  | 2      |
//! | executed successfully           | 3      |
//! | documentation source referenced | 1      |
//! | difficulty level assigned       | 2      |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Job;
use crate::status::UseCaseStatus;

pub const MAX_USE_CASE_SCORE: u32 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub summary: ReportSummary,
    pub documentation_quality: DocumentationQuality,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total_use_cases: usize,
    pub successful: usize,
    pub failed: usize,
    /// Percentage, 0 to 100.
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentationQuality {
    pub overall_score: f64,
    pub grade: String,
    pub use_cases: Vec<UseCaseScore>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UseCaseScore {
    pub index: usize,
    pub name: String,
    pub score: u32,
    pub max_score: u32,
    pub executed_successfully: bool,
}

pub fn grade_for(score: f64) -> &'static str {
    match score {
        s if s >= 90.0 => "A",
        s if s >= 80.0 => "B",
        s if s >= 70.0 => "C",
        s if s >= 60.0 => "D",
        _ => "F",
    }
}

impl JobReport {
    pub fn build(job: &Job) -> Self {
        let counts = job.counts();
        let success_rate = if counts.total == 0 {
            0.0
        } else {
            counts.completed as f64 * 100.0 / counts.total as f64
        };

        let mut issues = Vec::new();
        let scores: Vec<UseCaseScore> = job
            .use_cases
            .iter()
            .map(|record| {
                let spec = &record.spec;
                let succeeded = record.status == UseCaseStatus::Completed;
                let mut score = 2; // difficulty is always assigned by extraction
                if !spec.description.trim().is_empty() {
                    score += 2;
                }
                if !spec.success_criteria.is_empty() {
                    score += 2;
                }
                if succeeded {
                    score += 3;
                }
                if !spec.documentation_source.is_empty() {
                    score += 1;
                } else {
                    issues.push(format!(
                        "Use case {} ({}) does not reference any documentation source",
                        record.index, spec.name
                    ));
                }
                if record.status == UseCaseStatus::Failed {
                    issues.push(format!(
                        "Use case {} ({}) failed: {}",
                        record.index,
                        spec.name,
                        record.error.as_deref().unwrap_or("unknown error")
                    ));
                }
                UseCaseScore {
                    index: record.index,
                    name: spec.name.clone(),
                    score,
                    max_score: MAX_USE_CASE_SCORE,
                    executed_successfully: succeeded,
                }
            })
            .collect();

        let overall_score = if scores.is_empty() {
            0.0
        } else {
            let total: u32 = scores.iter().map(|s| s.score).sum();
            let max = MAX_USE_CASE_SCORE * scores.len() as u32;
            (total as f64 * 1000.0 / max as f64).round() / 10.0
        };

        let mut recommendations = Vec::new();
        if counts.failed > 0 {
            recommendations.push(format!(
                "Review the {} failing use case(s); their examples did not run as documented",
                counts.failed
            ));
        }
        if success_rate < 50.0 && counts.total > 0 {
            recommendations.push(
                "Most examples failed to run; add complete, copy-pasteable setup instructions"
                    .to_string(),
            );
        }
        if issues.iter().any(|i| i.contains("documentation source")) {
            recommendations.push(
                "Link each example to the page it comes from so readers can trace it".to_string(),
            );
        }
        if recommendations.is_empty() {
            recommendations.push("Documentation examples executed as described".to_string());
        }

        JobReport {
            summary: ReportSummary {
                total_use_cases: counts.total,
                successful: counts.completed,
                failed: counts.failed,
                success_rate,
            },
            documentation_quality: DocumentationQuality {
                overall_score,
                grade: grade_for(overall_score).to_string(),
                use_cases: scores,
            },
            issues,
            recommendations,
            generated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Difficulty, NewJob, UseCaseRecord, UseCaseSpec, UseCaseUpdate};

    fn job_with(records: Vec<(UseCaseSpec, Option<UseCaseStatus>)>) -> Job {
        let mut job = Job::new(NewJob {
            repository_url: "https://example.com/r.git".into(),
            branch: "main".into(),
            include_folders: vec!["docs".into()],
            project_id: None,
        });
        job.use_cases = records
            .into_iter()
            .enumerate()
            .map(|(i, (spec, status))| {
                let mut r = UseCaseRecord::new(i, spec);
                if let Some(status) = status {
                    r.apply(&UseCaseUpdate {
                        status: Some(status),
                        error: (status == UseCaseStatus::Failed).then(|| "exit 1".to_string()),
                        ..Default::default()
                    });
                }
                r
            })
            .collect();
        job
    }

    fn full_spec(name: &str) -> UseCaseSpec {
        UseCaseSpec {
            name: name.into(),
            description: "does a thing".into(),
            success_criteria: vec!["prints ok".into()],
            difficulty_level: Difficulty::Intermediate,
            documentation_source: vec!["docs/a.md".into()],
        }
    }

    #[test]
    fn test_grade_boundaries() {
        assert_eq!(grade_for(100.0), "A");
        assert_eq!(grade_for(90.0), "A");
        assert_eq!(grade_for(89.9), "B");
        assert_eq!(grade_for(70.0), "C");
        assert_eq!(grade_for(60.0), "D");
        assert_eq!(grade_for(12.0), "F");
    }

    #[test]
    fn test_all_successful_scores_full_marks() {
        let job = job_with(vec![
            (full_spec("a"), Some(UseCaseStatus::Completed)),
            (full_spec("b"), Some(UseCaseStatus::Completed)),
        ]);
        let report = JobReport::build(&job);
        assert_eq!(report.summary.success_rate, 100.0);
        assert_eq!(report.documentation_quality.overall_score, 100.0);
        assert_eq!(report.documentation_quality.grade, "A");
        assert!(report.issues.is_empty());
    }

    #[test]
    fn test_failures_and_missing_sources_become_issues() {
        let mut bare = full_spec("bare");
        bare.documentation_source.clear();
        let job = job_with(vec![
            (full_spec("ok"), Some(UseCaseStatus::Completed)),
            (bare, Some(UseCaseStatus::Failed)),
        ]);
        let report = JobReport::build(&job);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.success_rate, 50.0);
        // 10 + 6 out of 20
        assert_eq!(report.documentation_quality.overall_score, 80.0);
        assert_eq!(report.documentation_quality.grade, "B");
        assert_eq!(report.issues.len(), 2);
        assert!(report.issues.iter().any(|i| i.contains("failed: exit 1")));
        assert!(report.recommendations.len() >= 2);
    }
}
