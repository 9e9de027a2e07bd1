use crate::retry::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_output")]
    pub output_folder: String,

    #[serde(default = "default_build")]
    pub build_folder: String,

    #[serde(default = "default_book_file")]
    pub book_file: String,

    #[serde(default)]
    pub unattended: bool,

    pub llm: LlmConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String, // "gemini" or "openai"
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Pause before asking again once the API reports an exhausted quota.
    #[serde(default = "default_quota_wait")]
    pub quota_wait_seconds: u64,
    /// Unattended runs give up on a request after this many quota pauses.
    #[serde(default = "default_quota_max_waits")]
    pub quota_max_waits: u32,
    pub gemini: Option<GeminiConfig>,
    pub openai: Option<OpenAIConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiConfig {
    /// Falls back to GEMINI_API_KEY when empty.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_gemini_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_gemini_model(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Mark the sub-chapter failed and keep writing.
    #[default]
    Skip,
    /// Stop the whole run.
    Abort,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_max_chapters")]
    pub max_chapters: usize,
    #[serde(default = "default_max_sub_chapters")]
    pub max_sub_chapters: usize,

    /// Number of preceding sub-chapter texts fed back into each prompt.
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// Only the tail of each context text is sent.
    #[serde(default = "default_context_chars")]
    pub context_chars: usize,

    /// Overrides target_total_words / total_sub_chapters.
    #[serde(default)]
    pub words_per_sub_chapter: Option<usize>,
    #[serde(default = "default_length_multiplier")]
    pub prompt_length_multiplier: f64,
    #[serde(default = "default_true")]
    pub regenerate_short: bool,
    #[serde(default = "default_undershoot_margin")]
    pub undershoot_margin: f64,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    #[serde(default)]
    pub request_delay_seconds: u64,

    #[serde(default = "default_outline_chunk_threshold")]
    pub outline_chunk_threshold: usize,
    #[serde(default = "default_chapters_per_outline_chunk")]
    pub chapters_per_outline_chunk: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_chapters: default_max_chapters(),
            max_sub_chapters: default_max_sub_chapters(),
            context_window: default_context_window(),
            context_chars: default_context_chars(),
            words_per_sub_chapter: None,
            prompt_length_multiplier: default_length_multiplier(),
            regenerate_short: true,
            undershoot_margin: default_undershoot_margin(),
            failure_policy: FailurePolicy::Skip,
            request_delay_seconds: 0,
            outline_chunk_threshold: default_outline_chunk_threshold(),
            chapters_per_outline_chunk: default_chapters_per_outline_chunk(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_true")]
    pub include_header: bool,
    #[serde(default)]
    pub include_outline: bool,
    #[serde(default = "default_chapter_separator")]
    pub chapter_separator: String,
    #[serde(default = "default_sub_chapter_separator")]
    pub sub_chapter_separator: String,
    /// `{chapter}` and `{sub_chapter}` are replaced with one-based numbers.
    #[serde(default = "default_failed_placeholder")]
    pub failed_placeholder: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            include_header: true,
            include_outline: false,
            chapter_separator: default_chapter_separator(),
            sub_chapter_separator: default_sub_chapter_separator(),
            failed_placeholder: default_failed_placeholder(),
        }
    }
}

fn default_output() -> String {
    "books".to_string()
}
fn default_build() -> String {
    "build".to_string()
}
fn default_book_file() -> String {
    "book.yml".to_string()
}
fn default_retry_count() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    300
}
fn default_quota_wait() -> u64 {
    60
}
fn default_quota_max_waits() -> u32 {
    10
}
fn default_gemini_model() -> String {
    "gemini-2.0-flash-001".to_string()
}
fn default_temperature() -> f32 {
    0.8
}
fn default_max_output_tokens() -> u32 {
    8192
}
fn default_max_chapters() -> usize {
    200
}
fn default_max_sub_chapters() -> usize {
    20
}
fn default_context_window() -> usize {
    2
}
fn default_context_chars() -> usize {
    2000
}
fn default_length_multiplier() -> f64 {
    1.0
}
fn default_true() -> bool {
    true
}
fn default_undershoot_margin() -> f64 {
    0.2
}
fn default_outline_chunk_threshold() -> usize {
    15
}
fn default_chapters_per_outline_chunk() -> usize {
    3
}
fn default_chapter_separator() -> String {
    "\n\n\n".to_string()
}
fn default_sub_chapter_separator() -> String {
    "\n\n".to_string()
}
fn default_failed_placeholder() -> String {
    "[Sub-chapter {chapter}.{sub_chapter} could not be generated and needs to be written by hand.]"
        .to_string()
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("config.yml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.output_folder)?;
        fs::create_dir_all(&self.build_folder)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let g = &self.generation;
        if !(0.0..1.0).contains(&g.undershoot_margin) {
            anyhow::bail!("generation.undershoot_margin must be in [0, 1)");
        }
        if g.prompt_length_multiplier <= 0.0 {
            anyhow::bail!("generation.prompt_length_multiplier must be positive");
        }
        if g.chapters_per_outline_chunk == 0 {
            anyhow::bail!("generation.chapters_per_outline_chunk must be at least 1");
        }
        if self.llm.retry_count == 0 {
            anyhow::bail!("llm.retry_count must be at least 1");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.llm.retry_count,
            Duration::from_secs(self.llm.retry_delay_seconds),
        )
    }
}
