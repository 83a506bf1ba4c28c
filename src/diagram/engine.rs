use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use tokio::time::timeout;
use tracing::debug;

use crate::config::AppSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedSvg {
    pub svg_markup: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DiagramEngineError {
    #[error("{message}")]
    Rejected { message: String },

    #[error("render request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("render service unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("render service returned HTTP {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("render engine produced no SVG output")]
    EmptyOutput,
}

/// Turns flowchart source into SVG markup, or rejects it.
///
/// `render_id` is unique per invocation; engines that keep an internal registry of
/// rendered elements key it by this id.
pub trait DiagramEngine {
    fn render_diagram(
        &self,
        render_id: &str,
        source: &str,
    ) -> impl Future<Output = Result<RenderedSvg, DiagramEngineError>> + Send;
}

/// Renders through a Kroki-compatible HTTP service (`POST {base}/mermaid/svg`).
#[derive(Debug, Clone)]
pub struct KrokiEngine {
    http_client: reqwest::Client,
    base_url: String,
    timeout_ms: u64,
}

impl KrokiEngine {
    pub fn new(base_url: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout_ms,
        }
    }

    pub fn from_settings(settings: &AppSettings) -> Self {
        Self::new(
            settings.diagram_render_url.clone(),
            settings.render_timeout_ms,
        )
    }

    fn endpoint(&self) -> String {
        format!("{}/mermaid/svg", self.base_url.trim_end_matches('/'))
    }

    async fn post_source(
        &self,
        render_id: &str,
        source: &str,
    ) -> Result<RenderedSvg, DiagramEngineError> {
        let url = self.endpoint();
        debug!(url = %url, render_id, source_chars = source.len(), "sending diagram to render service");

        let response = self
            .http_client
            .post(&url)
            .header(CONTENT_TYPE, "text/plain")
            .body(source.to_owned())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        classify_response(status, body)
    }
}

impl DiagramEngine for KrokiEngine {
    fn render_diagram(
        &self,
        render_id: &str,
        source: &str,
    ) -> impl Future<Output = Result<RenderedSvg, DiagramEngineError>> + Send {
        async move {
            let timeout_duration = Duration::from_millis(self.timeout_ms);
            match timeout(timeout_duration, self.post_source(render_id, source)).await {
                Ok(result) => result,
                Err(_) => Err(DiagramEngineError::Timeout {
                    timeout_ms: self.timeout_ms,
                }),
            }
        }
    }
}

fn classify_response(status: StatusCode, body: String) -> Result<RenderedSvg, DiagramEngineError> {
    if status == StatusCode::BAD_REQUEST {
        let message = body.trim();
        return Err(DiagramEngineError::Rejected {
            message: if message.is_empty() {
                "diagram source was rejected by the render engine".to_owned()
            } else {
                message.to_owned()
            },
        });
    }

    if !status.is_success() {
        return Err(DiagramEngineError::HttpStatus { status, body });
    }

    if !body.contains("<svg") {
        return Err(DiagramEngineError::EmptyOutput);
    }

    Ok(RenderedSvg { svg_markup: body })
}
