use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use reqwest::StatusCode;
use tokio::sync::oneshot;

use crate::diagram::{DiagramEngine, DiagramEngineError, RenderedSvg};
use crate::model::{ModelClientError, TextGenerator};

pub fn temp_path(prefix: &str) -> PathBuf {
    let now_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::env::temp_dir().join(format!(
        "pulse_idea_{prefix}_{}_{}",
        std::process::id(),
        now_ns
    ))
}

pub fn remove_dir_if_exists(path: &Path) {
    let _ = std::fs::remove_dir_all(path);
}

/// Points the binary at an Ollama endpoint and a render service that may not exist.
pub fn apply_ollama_test_env(
    command: &mut Command,
    log_dir: &Path,
    max_idea_chars: u32,
    ollama_base_url: &str,
) {
    command.env("MODEL_PROVIDER", "ollama");
    command.env("MODEL", "qwen2.5:3b");
    command.env("OLLAMA_BASE_URL", ollama_base_url);
    command.env("MODEL_TIMEOUT_MS", "500");
    command.env("MODEL_MAX_RETRIES", "0");
    command.env("MAX_IDEA_CHARS", max_idea_chars.to_string());
    command.env("DIAGRAM_RENDER_URL", "http://127.0.0.1:9");
    command.env("RENDER_TIMEOUT_MS", "500");
    command.env("RUST_LOG", "error");
    command.env("PULSE_FILE_LOG", "error");
    command.env("PULSE_LOG_DIR", log_dir.as_os_str());
}

/// Generator that replies with a fixed text (or fails) and records every prompt.
#[derive(Debug, Clone)]
pub struct ScriptedGenerator {
    reply: Result<String, String>,
    prompts: Arc<Mutex<Vec<(String, String)>>>,
}

impl ScriptedGenerator {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Ok(text.to_owned()),
            prompts: Arc::default(),
        }
    }

    pub fn failing(body: &str) -> Self {
        Self {
            reply: Err(body.to_owned()),
            prompts: Arc::default(),
        }
    }

    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TextGenerator for ScriptedGenerator {
    fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> impl Future<Output = Result<String, ModelClientError>> + Send {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((system_prompt.to_owned(), user_prompt.to_owned()));
        let reply = self.reply.clone();

        async move {
            reply.map_err(|body| ModelClientError::HttpStatus {
                status: StatusCode::TOO_MANY_REQUESTS,
                body,
            })
        }
    }
}

/// Generator whose replies are released by the test, one gate per user prompt, so
/// completions can be made to arrive in any order.
#[derive(Debug, Clone, Default)]
pub struct GatedGenerator {
    gates: Arc<Mutex<HashMap<String, oneshot::Receiver<String>>>>,
}

impl GatedGenerator {
    /// Registers a gate for `user_prompt`; sending on the returned handle releases the reply.
    pub fn gate(&self, user_prompt: &str) -> oneshot::Sender<String> {
        let (sender, receiver) = oneshot::channel();
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_prompt.to_owned(), receiver);
        sender
    }
}

impl TextGenerator for GatedGenerator {
    fn generate(
        &self,
        _system_prompt: &str,
        user_prompt: &str,
    ) -> impl Future<Output = Result<String, ModelClientError>> + Send {
        let receiver = self
            .gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(user_prompt);

        async move {
            let receiver = receiver.ok_or_else(|| {
                ModelClientError::Configuration("no gate registered for prompt".to_owned())
            })?;
            receiver.await.map_err(|_| {
                ModelClientError::ResponseFormat("gate dropped before reply".to_owned())
            })
        }
    }
}

/// Engine that returns a fixed SVG (or rejects) and records `(render_id, source)` pairs.
#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    reply: Result<String, String>,
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl ScriptedEngine {
    pub fn succeeding(svg: &str) -> Self {
        Self {
            reply: Ok(svg.to_owned()),
            calls: Arc::default(),
        }
    }

    pub fn rejecting(message: &str) -> Self {
        Self {
            reply: Err(message.to_owned()),
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl DiagramEngine for ScriptedEngine {
    fn render_diagram(
        &self,
        render_id: &str,
        source: &str,
    ) -> impl Future<Output = Result<RenderedSvg, DiagramEngineError>> + Send {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((render_id.to_owned(), source.to_owned()));
        let reply = self.reply.clone();

        async move {
            reply
                .map(|svg_markup| RenderedSvg { svg_markup })
                .map_err(|message| DiagramEngineError::Rejected { message })
        }
    }
}
