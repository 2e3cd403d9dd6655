//! Resource loader and response parser for analysis prompt templates.
//! The engine never parses prompt files itself — it asks this module for
//! the compiled body, generation config, and the structured result.

use serde::{Deserialize, Serialize};

use crate::error::{ComputeError, Result};
use eve_provider::GenerationConfig;

/// A loaded prompt template: body text plus the default generation config
/// to use when calling the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptTemplate {
    pub id: String,
    pub body: String,
    #[serde(default)]
    pub generation_config: PromptGenerationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptGenerationConfig {
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for PromptGenerationConfig {
    fn default() -> Self {
        Self { max_output_tokens: default_max_output_tokens(), temperature: default_temperature() }
    }
}

fn default_max_output_tokens() -> u32 {
    4096
}
fn default_temperature() -> f32 {
    0.2
}

impl From<&PromptGenerationConfig> for GenerationConfig {
    fn from(cfg: &PromptGenerationConfig) -> Self {
        GenerationConfig { max_output_tokens: cfg.max_output_tokens, temperature: cfg.temperature }
    }
}

/// Load `<app_dir>/prompts/<prompt_id>.json`.
pub fn load_prompt_template(app_dir: &str, prompt_id: &str) -> Result<PromptTemplate> {
    let path = format!("{app_dir}/prompts/{prompt_id}.json");
    let data = std::fs::read_to_string(&path)
        .map_err(|_| ComputeError::PromptNotFound(prompt_id.to_string()))?;
    serde_json::from_str(&data).map_err(|e| ComputeError::PromptIo(e.to_string()))
}

/// Resolves a prompt template by id. The engine depends on this trait
/// rather than [`load_prompt_template`] directly so tests can swap in
/// in-memory templates instead of touching the filesystem.
pub trait PromptResolver: Send + Sync {
    fn resolve(&self, prompt_id: &str) -> Result<PromptTemplate>;
}

/// Loads templates from `<app_dir>/prompts/<prompt_id>.json`.
pub struct FilePromptResolver {
    app_dir: String,
}

impl FilePromptResolver {
    pub fn new(app_dir: String) -> Self {
        Self { app_dir }
    }
}

impl PromptResolver for FilePromptResolver {
    fn resolve(&self, prompt_id: &str) -> Result<PromptTemplate> {
        load_prompt_template(&self.app_dir, prompt_id)
    }
}

/// Substitute the `{{conversation}}` placeholder with the encoded transcript.
pub fn compile_prompt(template: &PromptTemplate, conversation_text: &str) -> String {
    template.body.replace("{{conversation}}", conversation_text)
}

/// Structured analysis result the provider is asked to return as JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub emotions: Vec<String>,
    #[serde(default)]
    pub humor_items: Vec<String>,
}

/// Parse the provider's raw text response as the declared JSON schema,
/// tolerating a markdown code fence around it (a permissible repair before
/// the response is counted as a non-retryable validation failure).
pub fn parse_analysis_response(raw: &str) -> Result<AnalysisResult> {
    let trimmed = strip_code_fence(raw.trim());
    serde_json::from_str(trimmed).map_err(|e| ComputeError::InvalidAnalysisResponse(e.to_string()))
}

fn strip_code_fence(text: &str) -> &str {
    let text = text.strip_prefix("```json").or_else(|| text.strip_prefix("```")).unwrap_or(text);
    text.strip_suffix("```").unwrap_or(text).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_prompt_substitutes_placeholder() {
        let template = PromptTemplate {
            id: "t1".into(),
            body: "Analyze:\n{{conversation}}\nEnd.".into(),
            generation_config: PromptGenerationConfig::default(),
        };
        let out = compile_prompt(&template, "[1] me: hi");
        assert_eq!(out, "Analyze:\n[1] me: hi\nEnd.");
    }

    #[test]
    fn parses_plain_json() {
        let raw = r#"{"summary":"chat about plans","entities":["Alice"],"topics":["trip"],"emotions":["excited"],"humor_items":[]}"#;
        let parsed = parse_analysis_response(raw).unwrap();
        assert_eq!(parsed.summary.as_deref(), Some("chat about plans"));
        assert_eq!(parsed.entities, vec!["Alice"]);
    }

    #[test]
    fn strips_markdown_code_fence() {
        let raw = "```json\n{\"summary\":\"x\"}\n```";
        let parsed = parse_analysis_response(raw).unwrap();
        assert_eq!(parsed.summary.as_deref(), Some("x"));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let result = parse_analysis_response("not json at all");
        assert!(result.is_err());
    }
}

/// In-memory [`PromptResolver`] for tests, avoiding a fixture directory on
/// disk.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;

    pub struct StaticPromptResolver {
        templates: HashMap<String, PromptTemplate>,
    }

    impl StaticPromptResolver {
        pub fn new(templates: Vec<PromptTemplate>) -> Self {
            Self { templates: templates.into_iter().map(|t| (t.id.clone(), t)).collect() }
        }
    }

    impl PromptResolver for StaticPromptResolver {
        fn resolve(&self, prompt_id: &str) -> Result<PromptTemplate> {
            self.templates
                .get(prompt_id)
                .cloned()
                .ok_or_else(|| ComputeError::PromptNotFound(prompt_id.to_string()))
        }
    }
}
