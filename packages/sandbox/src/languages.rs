// ABOUTME: Language runtime registry for loading supported languages and their sandbox images
// ABOUTME: Loads definitions from config/languages.json, or an override file at startup

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Placeholder in a command template replaced by the submitted source
pub const CODE_PLACEHOLDER: &str = "{code}";

#[derive(Error, Debug)]
pub enum LanguageError {
    #[error("Failed to load languages config: {0}")]
    LoadError(String),
    #[error("Invalid language configuration: {0}")]
    InvalidConfig(String),
}

type Result<T> = std::result::Result<T, LanguageError>;

/// One supported language: which image runs it and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageRuntime {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub image: String,
    pub command: Vec<String>,
}

impl LanguageRuntime {
    /// Command line with the placeholder argument replaced by `source_code`
    pub fn render_command(&self, source_code: &str) -> Vec<String> {
        self.command
            .iter()
            .map(|arg| {
                if arg == CODE_PLACEHOLDER {
                    source_code.to_string()
                } else {
                    arg.clone()
                }
            })
            .collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesConfig {
    version: String,
    languages: Vec<LanguageRuntime>,
}

#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    languages: HashMap<String, LanguageRuntime>,
    aliases: HashMap<String, String>,
}

impl LanguageRegistry {
    /// Create a registry from the embedded language definitions
    pub fn new() -> Result<Self> {
        Self::from_json(include_str!("../config/languages.json"))
    }

    /// Create a registry from a JSON file on disk
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_json = std::fs::read_to_string(path)
            .map_err(|e| LanguageError::LoadError(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&config_json)
    }

    pub fn from_json(config_json: &str) -> Result<Self> {
        let config: LanguagesConfig = serde_json::from_str(config_json)
            .map_err(|e| LanguageError::LoadError(e.to_string()))?;

        if config.languages.is_empty() {
            return Err(LanguageError::InvalidConfig(
                "at least one language is required".to_string(),
            ));
        }

        let mut languages = HashMap::new();
        let mut aliases = HashMap::new();

        for language in config.languages {
            let id = language.id.to_lowercase();
            let placeholders = language
                .command
                .iter()
                .filter(|arg| *arg == CODE_PLACEHOLDER)
                .count();
            if placeholders != 1 {
                return Err(LanguageError::InvalidConfig(format!(
                    "command for '{}' must contain exactly one {} argument",
                    id, CODE_PLACEHOLDER
                )));
            }
            if language.image.trim().is_empty() {
                return Err(LanguageError::InvalidConfig(format!(
                    "image for '{}' is empty",
                    id
                )));
            }

            for name in std::iter::once(&id).chain(language.aliases.iter()) {
                let name = name.to_lowercase();
                if aliases.insert(name.clone(), id.clone()).is_some() {
                    return Err(LanguageError::InvalidConfig(format!(
                        "language name '{}' is defined twice",
                        name
                    )));
                }
            }
            languages.insert(id, language);
        }

        Ok(Self { languages, aliases })
    }

    /// Look up a language by id or alias, ignoring case
    pub fn get(&self, name: &str) -> Option<&LanguageRuntime> {
        self.aliases
            .get(&name.trim().to_lowercase())
            .and_then(|id| self.languages.get(id))
    }

    pub fn is_supported(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// All languages, sorted by id
    pub fn list(&self) -> Vec<&LanguageRuntime> {
        let mut languages: Vec<_> = self.languages.values().collect();
        languages.sort_by(|a, b| a.id.cmp(&b.id));
        languages
    }

    /// Sorted canonical ids, for error messages
    pub fn supported_ids(&self) -> Vec<String> {
        self.list().into_iter().map(|l| l.id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn test_registry_loads() {
        let registry = LanguageRegistry::new();
        assert!(registry.is_ok());
        let registry = registry.unwrap();
        assert_eq!(
            registry.supported_ids(),
            vec!["bash".to_string(), "javascript".to_string(), "python".to_string()]
        );
    }

    #[rstest]
    #[case("python", "python")]
    #[case("Python", "python")]
    #[case("python3", "python")]
    #[case("javascript", "javascript")]
    #[case("node", "javascript")]
    #[case("JS", "javascript")]
    #[case("bash", "bash")]
    #[case("sh", "bash")]
    fn test_lookup_by_id_and_alias(#[case] name: &str, #[case] expected: &str) {
        let registry = LanguageRegistry::new().unwrap();
        assert_eq!(registry.get(name).map(|l| l.id.as_str()), Some(expected));
    }

    #[test]
    fn test_unknown_language() {
        let registry = LanguageRegistry::new().unwrap();
        assert!(registry.get("ruby").is_none());
        assert!(!registry.is_supported(""));
    }

    #[test]
    fn test_render_command_substitutes_code() {
        let registry = LanguageRegistry::new().unwrap();
        let python = registry.get("python").unwrap();
        assert_eq!(
            python.render_command("print(1+1)"),
            vec!["python".to_string(), "-c".to_string(), "print(1+1)".to_string()]
        );
    }

    #[test]
    fn test_rejects_command_without_placeholder() {
        let json = r#"{"version": "1", "languages": [
            {"id": "ruby", "display_name": "Ruby", "image": "ruby:3", "command": ["ruby", "-e"]}
        ]}"#;
        assert!(matches!(
            LanguageRegistry::from_json(json),
            Err(LanguageError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_duplicate_alias() {
        let json = r#"{"version": "1", "languages": [
            {"id": "python", "display_name": "Python", "image": "python:3", "command": ["python", "-c", "{code}"]},
            {"id": "pypy", "display_name": "PyPy", "aliases": ["python"], "image": "pypy:3", "command": ["pypy", "-c", "{code}"]}
        ]}"#;
        assert!(matches!(
            LanguageRegistry::from_json(json),
            Err(LanguageError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_from_file_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("languages.json");
        std::fs::write(
            &path,
            r#"{"version": "1", "languages": [
                {"id": "ruby", "display_name": "Ruby 3.3", "aliases": ["rb"], "image": "ruby:3.3-alpine", "command": ["ruby", "-e", "{code}"]}
            ]}"#,
        )
        .unwrap();

        let registry = LanguageRegistry::from_file(&path).unwrap();
        assert_eq!(registry.get("rb").unwrap().image, "ruby:3.3-alpine");
        assert!(registry.get("python").is_none());
    }

    #[test]
    fn test_from_missing_file() {
        let result = LanguageRegistry::from_file("/nonexistent/languages.json");
        assert!(matches!(result, Err(LanguageError::LoadError(_))));
    }
}
