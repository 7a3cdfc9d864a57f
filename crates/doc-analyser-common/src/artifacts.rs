//! Artifact naming convention.
//!
//! Every job owns a data directory holding, per use case index `i`:
//!
//! ```text
//! use_case_{i}.{ext}            synthesized code
//! use_case_results_{i}.json     ExecutionResult
//! use_case_{i}.log              captured sandbox output
//! ```
//!
//! plus `use_cases.json` (extraction output) and `analysis_report.json`.
//! The file endpoint serves nothing outside this set.

pub const USE_CASES_FILE: &str = "use_cases.json";
pub const REPORT_FILE: &str = "analysis_report.json";

/// Extensions the executor knows how to run.
pub const CODE_EXTENSIONS: &[&str] = &["py", "js", "mjs", "sh"];

pub fn code_file_name(index: usize, ext: &str) -> String {
    format!("use_case_{}.{}", index, ext)
}

pub fn code_file_stem(index: usize) -> String {
    format!("use_case_{}", index)
}

pub fn result_file_name(index: usize) -> String {
    format!("use_case_results_{}.json", index)
}

pub fn log_file_name(index: usize) -> String {
    format!("use_case_{}.log", index)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactKind {
    Code { index: usize, ext: String },
    Result { index: usize },
    Log { index: usize },
    UseCaseList,
    Report,
}

/// Classify a file name, returning `None` for anything that is not a job artifact.
pub fn parse_artifact_name(name: &str) -> Option<ArtifactKind> {
    match name {
        USE_CASES_FILE => return Some(ArtifactKind::UseCaseList),
        REPORT_FILE => return Some(ArtifactKind::Report),
        _ => {}
    }

    if let Some(rest) = name.strip_prefix("use_case_results_") {
        let index = parse_index(rest.strip_suffix(".json")?)?;
        return Some(ArtifactKind::Result { index });
    }

    let rest = name.strip_prefix("use_case_")?;
    let (digits, ext) = rest.split_once('.')?;
    let index = parse_index(digits)?;
    if ext == "log" {
        return Some(ArtifactKind::Log { index });
    }
    if CODE_EXTENSIONS.contains(&ext) {
        return Some(ArtifactKind::Code {
            index,
            ext: ext.to_string(),
        });
    }
    None
}

fn parse_index(digits: &str) -> Option<usize> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_follow_convention() {
        assert_eq!(code_file_name(3, "py"), "use_case_3.py");
        assert_eq!(result_file_name(0), "use_case_results_0.json");
        assert_eq!(log_file_name(12), "use_case_12.log");
    }

    #[test]
    fn test_parse_known_artifacts() {
        assert_eq!(
            parse_artifact_name("use_case_4.js"),
            Some(ArtifactKind::Code {
                index: 4,
                ext: "js".into()
            })
        );
        assert_eq!(
            parse_artifact_name("use_case_results_10.json"),
            Some(ArtifactKind::Result { index: 10 })
        );
        assert_eq!(
            parse_artifact_name("use_case_2.log"),
            Some(ArtifactKind::Log { index: 2 })
        );
        assert_eq!(
            parse_artifact_name("use_cases.json"),
            Some(ArtifactKind::UseCaseList)
        );
        assert_eq!(
            parse_artifact_name("analysis_report.json"),
            Some(ArtifactKind::Report)
        );
    }

    #[test]
    fn test_parse_rejects_everything_else() {
        for name in [
            "../etc/passwd",
            "use_case_.py",
            "use_case_1.exe",
            "use_case_1.py/../../x",
            "use_case_results_x.json",
            "use_case_-1.py",
            "notes.md",
            "",
        ] {
            assert_eq!(parse_artifact_name(name), None, "{name}");
        }
    }
}
