//! Turn a cloned repository's documentation into an ordered use case list.

use doc_analyser_common::{Difficulty, UseCaseSpec, artifacts::USE_CASES_FILE};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use super::agent::{CodingAgent, ExtractionRequest, extract_json};
use crate::errors::ExtractionError;

const DOC_EXTENSIONS: &[&str] = &["md", "mdx", "rst", "txt"];

/// Agents are inconsistent about list-valued fields; accept a bare string too.
fn string_or_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
        Null(()),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) if s.trim().is_empty() => Vec::new(),
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
        OneOrMany::Null(()) => Vec::new(),
    })
}

#[derive(Debug, Deserialize)]
struct RawUseCase {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, deserialize_with = "string_or_list")]
    success_criteria: Vec<String>,
    #[serde(default)]
    difficulty_level: Option<String>,
    #[serde(default, deserialize_with = "string_or_list")]
    documentation_source: Vec<String>,
}

impl RawUseCase {
    fn into_spec(self) -> UseCaseSpec {
        let difficulty_level = match self.difficulty_level.as_deref() {
            Some(raw) => raw.parse::<Difficulty>().unwrap_or_else(|_| {
                tracing::warn!(use_case = %self.name, difficulty = raw, "unknown difficulty level, using intermediate");
                Difficulty::Intermediate
            }),
            None => Difficulty::Intermediate,
        };
        UseCaseSpec {
            name: self.name.trim().to_string(),
            description: self.description,
            success_criteria: self.success_criteria,
            difficulty_level,
            documentation_source: self.documentation_source,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawResponse {
    Wrapped { use_cases: Vec<RawUseCase> },
    Bare(Vec<RawUseCase>),
}

/// Parse agent output into use cases, in the order given.
pub fn parse_use_cases(output: &str) -> Result<Vec<UseCaseSpec>, ExtractionError> {
    let json = extract_json(output).ok_or_else(|| {
        ExtractionError::Unparseable(format!(
            "no JSON found in agent output ({} bytes)",
            output.len()
        ))
    })?;
    let response: RawResponse = serde_json::from_str(json)
        .map_err(|e| ExtractionError::Unparseable(e.to_string()))?;
    let raw = match response {
        RawResponse::Wrapped { use_cases } => use_cases,
        RawResponse::Bare(use_cases) => use_cases,
    };
    let specs: Vec<UseCaseSpec> = raw
        .into_iter()
        .map(RawUseCase::into_spec)
        .filter(|spec| !spec.name.is_empty())
        .collect();
    if specs.is_empty() {
        return Err(ExtractionError::NoUseCases);
    }
    Ok(specs)
}

/// Documentation files under the include folders, relative to `repo_dir`, sorted.
pub fn discover_docs(repo_dir: &Path, include_folders: &[String]) -> Vec<String> {
    let mut files = Vec::new();
    for folder in include_folders {
        let root = repo_dir.join(folder);
        if !root.exists() {
            tracing::debug!(folder = %folder, "include folder missing from repository");
            continue;
        }
        for entry in WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let is_doc = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| DOC_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
            if !is_doc {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(repo_dir) {
                files.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    files.sort();
    files.dedup();
    files
}

pub struct UseCaseExtractor {
    agent: Arc<dyn CodingAgent>,
}

impl UseCaseExtractor {
    pub fn new(agent: Arc<dyn CodingAgent>) -> Self {
        Self { agent }
    }

    /// Run extraction. `work_dir` is where the agent may leave
    /// `use_cases.json`; it is read back only when stdout has no usable list.
    pub async fn extract(
        &self,
        repo_dir: &Path,
        include_folders: &[String],
        work_dir: &Path,
    ) -> Result<Vec<UseCaseSpec>, ExtractionError> {
        let doc_files = discover_docs(repo_dir, include_folders);
        if doc_files.is_empty() {
            return Err(ExtractionError::NoDocumentation {
                folders: include_folders.to_vec(),
            });
        }
        tracing::info!(docs = doc_files.len(), "extracting use cases");

        let request = ExtractionRequest {
            repo_dir: repo_dir.to_path_buf(),
            work_dir: work_dir.to_path_buf(),
            include_folders: include_folders.to_vec(),
            doc_files,
        };
        let output = self.agent.extract(&request).await?;

        match parse_use_cases(&output) {
            Ok(specs) => Ok(specs),
            Err(ExtractionError::Unparseable(reason)) => {
                let fallback: PathBuf = work_dir.join(USE_CASES_FILE);
                match tokio::fs::read_to_string(&fallback).await {
                    Ok(content) => {
                        tracing::debug!(path = %fallback.display(), "stdout unparseable, using agent-written file");
                        parse_use_cases(&content)
                    }
                    Err(_) => Err(ExtractionError::Unparseable(reason)),
                }
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::testing::ScriptedAgent;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_parse_wrapped_response() {
        let output = r#"{"use_cases": [
            {"name": "Install", "description": "pip install", "success_criteria": ["imports"],
             "difficulty_level": "Beginner", "documentation_source": ["docs/install.md"]},
            {"name": "Stream", "description": "streams", "success_criteria": "prints chunks",
             "difficulty_level": "ADVANCED", "documentation_source": "docs/stream.md"}
        ]}"#;
        let specs = parse_use_cases(output).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "Install");
        assert_eq!(specs[0].difficulty_level, Difficulty::Beginner);
        assert_eq!(specs[1].success_criteria, vec!["prints chunks"]);
        assert_eq!(specs[1].documentation_source, vec!["docs/stream.md"]);
        assert_eq!(specs[1].difficulty_level, Difficulty::Advanced);
    }

    #[test]
    fn test_parse_markdown_wrapped_bare_array() {
        let output = "Here are the use cases:\n```json\n[{\"name\": \"A\"}, {\"name\": \"B\"}]\n```";
        let specs = parse_use_cases(output).unwrap();
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
        assert_eq!(specs[0].difficulty_level, Difficulty::Intermediate);
    }

    #[test]
    fn test_unknown_difficulty_defaults() {
        let specs =
            parse_use_cases(r#"[{"name": "A", "difficulty_level": "expert"}]"#).unwrap();
        assert_eq!(specs[0].difficulty_level, Difficulty::Intermediate);
    }

    #[test]
    fn test_empty_list_is_no_use_cases() {
        let err = parse_use_cases(r#"{"use_cases": []}"#).unwrap_err();
        assert!(matches!(err, ExtractionError::NoUseCases));
    }

    #[test]
    fn test_nameless_entries_are_dropped() {
        let err = parse_use_cases(r#"[{"name": "  "}]"#).unwrap_err();
        assert!(matches!(err, ExtractionError::NoUseCases));
    }

    #[test]
    fn test_prose_is_unparseable() {
        let err = parse_use_cases("I found nothing useful.").unwrap_err();
        assert!(matches!(err, ExtractionError::Unparseable(_)));
    }

    #[test]
    fn test_discover_docs_only_scans_include_folders() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("docs/guide")).unwrap();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join("docs/index.md"), "# Hi").unwrap();
        fs::write(root.join("docs/guide/usage.RST"), "Usage").unwrap();
        fs::write(root.join("docs/logo.png"), [0u8; 4]).unwrap();
        fs::write(root.join("src/notes.md"), "not included").unwrap();
        fs::write(root.join("README.md"), "not included").unwrap();

        let docs = discover_docs(root, &["docs".to_string(), "missing".to_string()]);
        assert_eq!(docs, vec!["docs/guide/usage.RST", "docs/index.md"]);
    }

    #[tokio::test]
    async fn test_extract_without_docs_fails_before_calling_agent() {
        let dir = tempdir().unwrap();
        let agent = Arc::new(ScriptedAgent::default());
        let extractor = UseCaseExtractor::new(agent.clone());
        let err = extractor
            .extract(dir.path(), &["docs".to_string()], dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::NoDocumentation { .. }));
        assert_eq!(agent.extract_calls(), 0);
    }

    #[tokio::test]
    async fn test_extract_falls_back_to_agent_written_file() {
        let repo = tempdir().unwrap();
        let work = tempdir().unwrap();
        fs::create_dir_all(repo.path().join("docs")).unwrap();
        fs::write(repo.path().join("docs/a.md"), "# A").unwrap();
        fs::write(
            work.path().join(USE_CASES_FILE),
            r#"{"use_cases": [{"name": "From file"}]}"#,
        )
        .unwrap();

        let agent = Arc::new(ScriptedAgent::with_extraction("Done, see the file."));
        let extractor = UseCaseExtractor::new(agent);
        let specs = extractor
            .extract(repo.path(), &["docs".to_string()], work.path())
            .await
            .unwrap();
        assert_eq!(specs[0].name, "From file");
    }
}
