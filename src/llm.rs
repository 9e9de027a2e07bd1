use crate::config::{Config, GeminiConfig, OpenAIConfig};
use crate::error::LlmError;
use crate::quota::{AskForKey, QuotaGuard, QuotaPolicy, WaitForQuota};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::sync::RwLock;
use std::time::Duration;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const SAFETY_CATEGORIES: &[&str] = &[
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn chat(&self, system: &str, user: &str) -> Result<String>;

    /// Swaps the credential used by later requests. Returns false when unsupported.
    fn set_api_key(&self, _key: &str) -> bool {
        false
    }
}

pub fn create_llm(config: &Config) -> Result<Box<dyn LlmClient>> {
    let timeout = Duration::from_secs(config.llm.request_timeout_seconds);
    let client: Box<dyn LlmClient> = match config.llm.provider.as_str() {
        "gemini" => {
            let cfg = config.llm.gemini.clone().unwrap_or_default();
            Box::new(GeminiClient::new(&cfg, timeout)?)
        }
        "openai" => {
            let cfg = config.llm.openai.as_ref().context("OpenAI config missing")?;
            Box::new(OpenAIClient::new(cfg, timeout)?)
        }
        _ => return Err(anyhow!("Unknown LLM provider: {}", config.llm.provider)),
    };

    let wait = Duration::from_secs(config.llm.quota_wait_seconds);
    let policy: Box<dyn QuotaPolicy> = if config.unattended {
        Box::new(WaitForQuota {
            wait,
            max_waits: config.llm.quota_max_waits,
        })
    } else {
        Box::new(AskForKey { wait })
    };
    Ok(Box::new(QuotaGuard::new(client, policy)))
}

fn read_key(key: &RwLock<String>) -> Result<String> {
    key.read()
        .map(|k| k.clone())
        .map_err(|_| anyhow!("API key lock poisoned"))
}

fn replace_key(slot: &RwLock<String>, key: &str) -> bool {
    match slot.write() {
        Ok(mut current) => {
            *current = key.to_string();
            true
        }
        Err(_) => false,
    }
}

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")
}

// --- Gemini ---
struct GeminiClient {
    api_key: RwLock<String>,
    model: String,
    temperature: f32,
    max_output_tokens: u32,
    client: reqwest::Client,
}

impl GeminiClient {
    fn new(cfg: &GeminiConfig, timeout: Duration) -> Result<Self> {
        let api_key = if cfg.api_key.trim().is_empty() {
            std::env::var("GEMINI_API_KEY")
                .context("Gemini api_key is empty and GEMINI_API_KEY is not set")?
        } else {
            cfg.api_key.trim().to_string()
        };
        Ok(Self {
            api_key: RwLock::new(api_key),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_output_tokens: cfg.max_output_tokens,
            client: http_client(timeout)?,
        })
    }

    /// The key travels in a header, never in the URL.
    fn endpoint(&self) -> String {
        format!("{}/{}:generateContent", GEMINI_BASE_URL, self.model)
    }
}

impl Debug for GeminiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiClient")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    generation_config: GeminiGenerationConfig,
    safety_settings: Vec<GeminiSafetySetting>,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
    top_p: f32,
    top_k: u32,
}

#[derive(Serialize)]
struct GeminiSafetySetting {
    category: &'static str,
    threshold: &'static str,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
struct GeminiPartResponse {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    #[serde(default)]
    code: Option<u16>,
    message: String,
}

impl GeminiResponse {
    /// Pulls the generated text out of a decoded body, classifying every way it can be missing.
    fn into_text(self) -> Result<String, LlmError> {
        if let Some(err) = self.error {
            return Err(LlmError::from_status(err.code.unwrap_or(500), err.message));
        }

        let candidate = self
            .candidates
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| LlmError::Malformed("response has no candidates".into()))?;

        let reason = candidate
            .finish_reason
            .unwrap_or_else(|| "UNKNOWN".to_string());
        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();

        match reason.as_str() {
            "STOP" | "MAX_TOKENS" if !text.trim().is_empty() => {
                if reason == "MAX_TOKENS" {
                    warn!("Gemini hit the output token limit; text may be truncated");
                }
                Ok(text)
            }
            _ => Err(LlmError::Blocked { reason }),
        }
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = self.endpoint();
        let api_key = read_key(&self.api_key)?;

        let request_body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart { text: user.to_string() }],
            }],
            system_instruction: Some(GeminiSystemInstruction {
                parts: vec![GeminiPart { text: system.to_string() }],
            }),
            generation_config: GeminiGenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_output_tokens,
                top_p: 0.95,
                top_k: 40,
            },
            safety_settings: SAFETY_CATEGORIES
                .iter()
                .map(|category| GeminiSafetySetting {
                    category: *category,
                    threshold: "BLOCK_NONE",
                })
                .collect(),
        };

        debug!("Gemini request: model={}, prompt_chars={}", self.model, user.len());

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(LlmError::from)?;

        let status = resp.status();
        let response_text = resp.text().await.map_err(LlmError::from)?;
        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), response_text).into());
        }

        let result: GeminiResponse = serde_json::from_str(&response_text).map_err(|e| {
            LlmError::Malformed(format!("{}. Body: {}", e, response_text))
        })?;

        Ok(result.into_text()?)
    }

    fn set_api_key(&self, key: &str) -> bool {
        replace_key(&self.api_key, key)
    }
}

// --- OpenAI-compatible ---

struct OpenAIClient {
    api_key: RwLock<String>,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    fn new(cfg: &OpenAIConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            api_key: RwLock::new(cfg.api_key.clone()),
            model: cfg.model.clone(),
            base_url: cfg
                .base_url
                .as_deref()
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            client: http_client(timeout)?,
        })
    }
}

impl Debug for OpenAIClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAIClient")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
}

#[derive(Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessageResponse,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIMessageResponse {
    content: Option<String>,
}

impl OpenAIResponse {
    fn into_text(self) -> Result<String, LlmError> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Malformed("response has no choices".into()))?;
        match choice.message.content {
            Some(content) if !content.trim().is_empty() => Ok(content),
            _ => Err(LlmError::Blocked {
                reason: choice.finish_reason.unwrap_or_else(|| "UNKNOWN".to_string()),
            }),
        }
    }
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let api_key = read_key(&self.api_key)?;

        let request_body = OpenAIRequest {
            model: self.model.clone(),
            messages: vec![
                OpenAIMessage { role: "system".to_string(), content: system.to_string() },
                OpenAIMessage { role: "user".to_string(), content: user.to_string() },
            ],
        };

        let resp = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(LlmError::from)?;

        let status = resp.status();
        if !status.is_success() {
            let error_text = resp.text().await.map_err(LlmError::from)?;
            return Err(LlmError::from_status(status.as_u16(), error_text).into());
        }

        let result: OpenAIResponse = resp.json().await.map_err(LlmError::from)?;
        Ok(result.into_text()?)
    }

    fn set_api_key(&self, key: &str) -> bool {
        replace_key(&self.api_key, key)
    }
}
