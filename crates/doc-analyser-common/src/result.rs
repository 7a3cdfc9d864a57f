use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Error,
}

/// Outcome of one use case execution, persisted as `use_case_results_{index}.json`.
///
/// Written once by the executor and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub use_case_index: usize,
    pub use_case_name: String,
    pub execution_status: ExecutionStatus,
    #[serde(default)]
    pub execution_results: serde_json::Value,
    #[serde(default)]
    pub documentation_sources_used: Vec<String>,
    #[serde(default)]
    pub documentation_usefulness: Vec<String>,
    #[serde(default)]
    pub documentation_weaknesses: Vec<String>,
    #[serde(default)]
    pub documentation_improvements: Vec<String>,
    #[serde(default)]
    pub success_criteria_met: Vec<String>,
    #[serde(default)]
    pub challenges_encountered: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionResult {
    /// An error result carrying only the failure detail.
    pub fn error(index: usize, name: &str, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            use_case_index: index,
            use_case_name: name.to_string(),
            execution_status: ExecutionStatus::Error,
            execution_results: serde_json::Value::Null,
            documentation_sources_used: Vec::new(),
            documentation_usefulness: Vec::new(),
            documentation_weaknesses: Vec::new(),
            documentation_improvements: Vec::new(),
            success_criteria_met: Vec::new(),
            challenges_encountered: vec![detail.clone()],
            code_file_path: None,
            error: Some(detail),
            timestamp: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.execution_status == ExecutionStatus::Success
    }
}
