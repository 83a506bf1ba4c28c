use std::env;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::{Context, Result, anyhow, ensure};

pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_OLLAMA_MODEL: &str = "qwen2.5:3b";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4.1-mini";
pub const DEFAULT_MODEL_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_MODEL_MAX_RETRIES: u32 = 0;
pub const DEFAULT_MAX_IDEA_CHARS: usize = 4_000;
pub const DEFAULT_MAX_RESPONSE_CHARS: usize = 256 * 1024;
pub const DEFAULT_DIAGRAM_RENDER_URL: &str = "https://kroki.io";
pub const DEFAULT_RENDER_TIMEOUT_MS: u64 = 15_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelProvider {
    Gemini,
    OpenAi,
    Ollama,
}

impl ModelProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::Gemini => DEFAULT_GEMINI_MODEL,
            Self::OpenAi => DEFAULT_OPENAI_MODEL,
            Self::Ollama => DEFAULT_OLLAMA_MODEL,
        }
    }
}

impl Display for ModelProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelProvider {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(Self::Gemini),
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(anyhow!(
                "invalid MODEL_PROVIDER `{other}`; expected `gemini`, `openai` or `ollama`"
            )),
        }
    }
}

/// Input and output size guards applied around the model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefinementLimits {
    pub max_idea_chars: usize,
    pub max_response_chars: usize,
}

impl Default for RefinementLimits {
    fn default() -> Self {
        Self {
            max_idea_chars: DEFAULT_MAX_IDEA_CHARS,
            max_response_chars: DEFAULT_MAX_RESPONSE_CHARS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSettings {
    pub model_provider: ModelProvider,
    pub model: String,
    pub ollama_base_url: String,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub model_timeout_ms: u64,
    pub model_max_retries: u32,
    pub limits: RefinementLimits,
    pub diagram_render_url: String,
    pub render_timeout_ms: u64,
}

impl AppSettings {
    pub fn from_env() -> Result<Self> {
        // Load .env if present, but do not fail if file does not exist.
        let _ = dotenvy::dotenv();

        Self::from_vars(|name| env::var(name).ok())
    }

    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let model_provider = lookup("MODEL_PROVIDER")
            .unwrap_or_else(|| ModelProvider::Gemini.as_str().to_owned())
            .parse::<ModelProvider>()
            .context("failed to parse MODEL_PROVIDER")?;

        let model = lookup("MODEL").unwrap_or_else(|| model_provider.default_model().to_owned());
        ensure!(!model.trim().is_empty(), "MODEL cannot be empty");

        let ollama_base_url =
            lookup("OLLAMA_BASE_URL").unwrap_or_else(|| DEFAULT_OLLAMA_BASE_URL.to_owned());
        ensure!(
            !ollama_base_url.trim().is_empty(),
            "OLLAMA_BASE_URL cannot be empty"
        );

        let openai_api_key = non_blank(lookup("OPENAI_API_KEY"));
        let gemini_api_key = non_blank(lookup("GEMINI_API_KEY"));
        match model_provider {
            ModelProvider::OpenAi => ensure!(
                openai_api_key.is_some(),
                "OPENAI_API_KEY must be set when MODEL_PROVIDER is `openai`"
            ),
            ModelProvider::Gemini => ensure!(
                gemini_api_key.is_some(),
                "GEMINI_API_KEY must be set when MODEL_PROVIDER is `gemini`"
            ),
            ModelProvider::Ollama => {}
        }

        let model_timeout_ms =
            parse_env(&lookup, "MODEL_TIMEOUT_MS", DEFAULT_MODEL_TIMEOUT_MS)?;
        ensure!(
            model_timeout_ms > 0,
            "MODEL_TIMEOUT_MS must be greater than 0"
        );

        let model_max_retries =
            parse_env(&lookup, "MODEL_MAX_RETRIES", DEFAULT_MODEL_MAX_RETRIES)?;

        let max_idea_chars = parse_env(&lookup, "MAX_IDEA_CHARS", DEFAULT_MAX_IDEA_CHARS)?;
        ensure!(max_idea_chars > 0, "MAX_IDEA_CHARS must be greater than 0");

        let max_response_chars =
            parse_env(&lookup, "MAX_RESPONSE_CHARS", DEFAULT_MAX_RESPONSE_CHARS)?;
        ensure!(
            max_response_chars > 0,
            "MAX_RESPONSE_CHARS must be greater than 0"
        );

        let diagram_render_url = lookup("DIAGRAM_RENDER_URL")
            .unwrap_or_else(|| DEFAULT_DIAGRAM_RENDER_URL.to_owned());
        ensure!(
            !diagram_render_url.trim().is_empty(),
            "DIAGRAM_RENDER_URL cannot be empty"
        );

        let render_timeout_ms =
            parse_env(&lookup, "RENDER_TIMEOUT_MS", DEFAULT_RENDER_TIMEOUT_MS)?;
        ensure!(
            render_timeout_ms > 0,
            "RENDER_TIMEOUT_MS must be greater than 0"
        );

        Ok(Self {
            model_provider,
            model,
            ollama_base_url,
            openai_api_key,
            gemini_api_key,
            model_timeout_ms,
            model_max_retries,
            limits: RefinementLimits {
                max_idea_chars,
                max_response_chars,
            },
            diagram_render_url,
            render_timeout_ms,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_owned())
        }
    })
}

fn parse_env<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("failed to parse {name}")),
        None => Ok(default),
    }
}
