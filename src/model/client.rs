use std::future::Future;
use std::time::Duration;

use reqwest::{RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::TextGenerator;
use crate::config::{AppSettings, ModelProvider};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const RETRY_BASE_DELAY_MS: u64 = 250;
const RETRY_MAX_EXPONENT: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ModelClientError {
    #[error("model request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("provider returned HTTP {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("response missing field: {field}")]
    MissingField { field: &'static str },

    #[error("provider reported an error: {0}")]
    ResponseFormat(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ModelClientError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Transport(error) => {
                error.is_timeout() || error.is_connect() || error.is_request()
            }
            Self::HttpStatus { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            Self::MissingField { .. } | Self::ResponseFormat(_) | Self::Configuration(_) => false,
        }
    }
}

/// One system instruction plus one user turn; every provider call is built from this.
#[derive(Debug, Clone, Copy)]
struct Prompts<'a> {
    system: &'a str,
    user: &'a str,
}

/// HTTP model client. Returns the provider's text exactly as sent: blank or padded
/// replies are left for extraction to judge.
#[derive(Debug, Clone)]
pub struct ModelClient {
    http_client: reqwest::Client,
    settings: AppSettings,
}

impl ModelClient {
    pub fn new(settings: AppSettings) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            settings,
        }
    }

    pub async fn generate_text(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, ModelClientError> {
        let prompts = Prompts {
            system: system_prompt,
            user: user_prompt,
        };
        let total_attempts = self.settings.model_max_retries.saturating_add(1);
        let mut attempt: u32 = 1;

        loop {
            let error = match self.attempt(prompts).await {
                Ok(text) => return Ok(text),
                Err(error) => error,
            };
            if attempt >= total_attempts || !error.is_retryable() {
                return Err(error);
            }

            let delay_ms = retry_delay_ms(attempt);
            warn!(
                attempt,
                total_attempts,
                delay_ms,
                provider = %self.settings.model_provider,
                error = %error,
                "model call failed; retrying"
            );
            sleep(Duration::from_millis(delay_ms)).await;
            attempt = attempt.saturating_add(1);
        }
    }

    async fn attempt(&self, prompts: Prompts<'_>) -> Result<String, ModelClientError> {
        let timeout_ms = self.settings.model_timeout_ms;
        let call = async {
            match self.settings.model_provider {
                ModelProvider::Gemini => self.generate_gemini(prompts).await,
                ModelProvider::OpenAi => self.generate_openai(prompts).await,
                ModelProvider::Ollama => self.generate_ollama(prompts).await,
            }
        };
        timeout(Duration::from_millis(timeout_ms), call)
            .await
            .unwrap_or(Err(ModelClientError::Timeout { timeout_ms }))
    }

    async fn generate_gemini(&self, prompts: Prompts<'_>) -> Result<String, ModelClientError> {
        let api_key = self.settings.gemini_api_key.as_deref().ok_or_else(|| {
            ModelClientError::Configuration("GEMINI_API_KEY is required".to_owned())
        })?;
        let url = format!(
            "{GEMINI_BASE_URL}/models/{}:generateContent",
            self.settings.model
        );
        debug!(url = %url, model = %self.settings.model, "sending generate request to gemini");

        let request = self
            .http_client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&GeminiRequest::new(prompts));
        let reply: GeminiReply = self.send(request).await?.json().await?;
        reply.into_text()
    }

    async fn generate_openai(&self, prompts: Prompts<'_>) -> Result<String, ModelClientError> {
        let api_key = self.settings.openai_api_key.as_deref().ok_or_else(|| {
            ModelClientError::Configuration("OPENAI_API_KEY is required".to_owned())
        })?;
        let url = format!("{OPENAI_BASE_URL}/chat/completions");
        debug!(url = %url, model = %self.settings.model, "sending chat request to openai");

        let request = self
            .http_client
            .post(&url)
            .bearer_auth(api_key)
            .json(&RoleMessagesRequest::new(&self.settings.model, prompts, None));
        let reply: OpenAiReply = self.send(request).await?.json().await?;
        reply.into_text()
    }

    async fn generate_ollama(&self, prompts: Prompts<'_>) -> Result<String, ModelClientError> {
        let url = format!(
            "{}/api/chat",
            self.settings.ollama_base_url.trim_end_matches('/')
        );
        debug!(url = %url, model = %self.settings.model, "sending chat request to ollama");

        let request = self.http_client.post(&url).json(&RoleMessagesRequest::new(
            &self.settings.model,
            prompts,
            Some(false),
        ));
        let reply: OllamaReply = self.send(request).await?.json().await?;
        reply.into_text()
    }

    /// Sends the request and turns a non-2xx status into `HttpStatus` with the body text.
    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, ModelClientError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|error| format!("<unreadable error body: {error}>"));
        Err(ModelClientError::HttpStatus { status, body })
    }
}

impl TextGenerator for ModelClient {
    fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> impl Future<Output = Result<String, ModelClientError>> + Send {
        self.generate_text(system_prompt, user_prompt)
    }
}

fn retry_delay_ms(attempt: u32) -> u64 {
    let exponent = attempt.saturating_sub(1).min(RETRY_MAX_EXPONENT);
    RETRY_BASE_DELAY_MS.saturating_mul(1_u64 << exponent)
}

#[derive(Debug, Serialize)]
struct RoleMessage<'a> {
    role: &'static str,
    content: &'a str,
}

/// Body shared by OpenAI chat completions and Ollama `/api/chat`.
#[derive(Debug, Serialize)]
struct RoleMessagesRequest<'a> {
    model: &'a str,
    messages: [RoleMessage<'a>; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

impl<'a> RoleMessagesRequest<'a> {
    fn new(model: &'a str, prompts: Prompts<'a>, stream: Option<bool>) -> Self {
        Self {
            model,
            messages: [
                RoleMessage {
                    role: "system",
                    content: prompts.system,
                },
                RoleMessage {
                    role: "user",
                    content: prompts.user,
                },
            ],
            stream,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OllamaReply {
    message: Option<OllamaMessage>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    content: Option<String>,
}

impl OllamaReply {
    fn into_text(self) -> Result<String, ModelClientError> {
        if let Some(error) = self.error {
            return Err(ModelClientError::ResponseFormat(error));
        }
        self.message
            .and_then(|message| message.content)
            .ok_or(ModelClientError::MissingField {
                field: "message.content",
            })
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiReply {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: Option<OpenAiContent>,
}

/// `content` is either a plain string or a list of typed parts.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OpenAiContent {
    Text(String),
    Parts(Vec<OpenAiContentPart>),
}

#[derive(Debug, Deserialize)]
struct OpenAiContentPart {
    text: Option<String>,
}

impl OpenAiReply {
    fn into_text(self) -> Result<String, ModelClientError> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or(ModelClientError::MissingField {
                field: "choices[0]",
            })?;
        match choice.message.content {
            Some(OpenAiContent::Text(text)) => Ok(text),
            Some(OpenAiContent::Parts(parts)) => Ok(parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect::<Vec<_>>()
                .join("\n")),
            None => Err(ModelClientError::MissingField {
                field: "choices[0].message.content",
            }),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest<'a> {
    system_instruction: GeminiContent<'a>,
    contents: [GeminiContent<'a>; 1],
}

impl<'a> GeminiRequest<'a> {
    fn new(prompts: Prompts<'a>) -> Self {
        Self {
            system_instruction: GeminiContent {
                role: None,
                parts: [GeminiTextPart {
                    text: prompts.system,
                }],
            },
            contents: [GeminiContent {
                role: Some("user"),
                parts: [GeminiTextPart { text: prompts.user }],
            }],
        }
    }
}

#[derive(Debug, Serialize)]
struct GeminiContent<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: [GeminiTextPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct GeminiTextPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GeminiReply {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiReplyContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiReplyContent {
    #[serde(default)]
    parts: Vec<GeminiReplyPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiReplyPart {
    text: Option<String>,
}

impl GeminiReply {
    /// Concatenates the text parts of the first candidate.
    fn into_text(self) -> Result<String, ModelClientError> {
        let candidate = self
            .candidates
            .into_iter()
            .next()
            .ok_or(ModelClientError::MissingField {
                field: "candidates[0]",
            })?;
        let content = candidate.content.ok_or(ModelClientError::MissingField {
            field: "candidates[0].content",
        })?;
        Ok(content
            .parts
            .into_iter()
            .filter_map(|part| part.text)
            .collect())
    }
}
