//! Loading stage definitions from JSON.
//!
//! Two document shapes are accepted: a bare list of stage records, or an
//! object with a `stages` list. Record order is the declaration order used
//! for tie-breaking.

use super::definition::StageDefinition;
use crate::errors::BuildflowError;
use serde::Deserialize;
use std::path::Path;

#[derive(Deserialize)]
#[serde(untagged)]
enum StageDocument {
    List(Vec<StageDefinition>),
    Wrapped { stages: Vec<StageDefinition> },
}

impl StageDocument {
    fn into_definitions(self) -> Vec<StageDefinition> {
        match self {
            Self::List(stages) | Self::Wrapped { stages } => stages,
        }
    }
}

/// Parses stage definitions from a JSON string.
///
/// Only the document shape is checked here; graph validation happens in
/// [`StageGraph::load`](super::StageGraph::load).
pub fn definitions_from_json_str(json: &str) -> Result<Vec<StageDefinition>, BuildflowError> {
    let doc: StageDocument = serde_json::from_str(json)?;
    Ok(doc.into_definitions())
}

/// Reads and parses stage definitions from a JSON file.
pub fn definitions_from_json_file(path: impl AsRef<Path>) -> Result<Vec<StageDefinition>, BuildflowError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    tracing::debug!(path = %path.display(), "Loading stage definitions");
    definitions_from_json_str(&content)
}

/// Serializes definitions into the canonical `{"stages": [...]}` document.
pub fn definitions_to_json(definitions: &[StageDefinition]) -> Result<String, BuildflowError> {
    Ok(serde_json::to_string_pretty(&serde_json::json!({ "stages": definitions }))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_list_document() {
        let defs = definitions_from_json_str(
            r#"[
                {"name": "a", "order": 1, "command": "true"},
                {"name": "b", "order": 2, "command": "true", "dependencies": ["a"]}
            ]"#,
        )
        .unwrap();

        assert_eq!(defs.len(), 2);
        assert_eq!(defs[1].dependencies, vec!["a".to_string()]);
    }

    #[test]
    fn test_load_wrapped_document() {
        let defs = definitions_from_json_str(
            r#"{"stages": [
                {"name": "a", "command": "true", "rollback_command": "echo undo",
                 "requires_elevation": true, "resources": {"memory_mb": 512}}
            ]}"#,
        )
        .unwrap();

        assert_eq!(defs.len(), 1);
        assert!(defs[0].requires_elevation);
        assert_eq!(defs[0].resources.memory_mb, 512);
        assert_eq!(defs[0].rollback_command.as_deref(), Some("echo undo"));
    }

    #[test]
    fn test_load_rejects_missing_command() {
        let result = definitions_from_json_str(r#"[{"name": "a"}]"#);
        assert!(matches!(result, Err(BuildflowError::Serialization(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let defs = vec![StageDefinition::new("a", "true").with_order(1)];
        write!(file, "{}", definitions_to_json(&defs).unwrap()).unwrap();

        let loaded = definitions_from_json_file(file.path()).unwrap();
        assert_eq!(loaded, defs);
    }

    #[test]
    fn test_load_missing_file() {
        let result = definitions_from_json_file("/nonexistent/stages.json");
        assert!(matches!(result, Err(BuildflowError::Io(_))));
    }
}
