use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::AppSettings;
use crate::model::{ModelClient, TextGenerator};
use crate::refine::{RefinementError, Refiner};

const PROMPT_REQUIRED: &str = "Prompt is required";
const REFINE_FAILED: &str = "Failed to refine prompt";

struct AppState<G> {
    refiner: Refiner<G>,
}

impl<G: Clone> Clone for AppState<G> {
    fn clone(&self) -> Self {
        Self {
            refiner: self.refiner.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefineBody {
    prompt: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
}

pub fn build_router<G>(refiner: Refiner<G>) -> Router
where
    G: TextGenerator + Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/health", get(handle_health))
        .route("/api/refine", post(handle_refine::<G>))
        .with_state(AppState { refiner })
}

pub async fn run_http_server(settings: &AppSettings, bind: &str) -> Result<()> {
    let refiner = Refiner::new(ModelClient::new(settings.clone()), settings.limits);
    let app = build_router(refiner);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind HTTP server to `{bind}`"))?;
    let local_addr = listener.local_addr().ok();

    info!(
        provider = %settings.model_provider,
        model = %settings.model,
        requested_bind = %bind,
        bound_addr = local_addr.map(|addr| addr.to_string()),
        "starting HTTP server"
    );

    axum::serve(listener, app)
        .await
        .context("HTTP server exited with an error")
}

async fn handle_health() -> Json<HealthBody> {
    Json(HealthBody { status: "ok" })
}

async fn handle_refine<G>(State(state): State<AppState<G>>, Json(body): Json<RefineBody>) -> Response
where
    G: TextGenerator + Clone + Send + Sync + 'static,
{
    let prompt = body.prompt.unwrap_or_default();
    match state.refiner.refine(&prompt).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(error) => {
            let status = status_code_for_error(&error);
            warn!(
                status = status.as_u16(),
                error = %error,
                "HTTP refine request failed"
            );
            (status, Json(error_body(&error))).into_response()
        }
    }
}

fn status_code_for_error(error: &RefinementError) -> StatusCode {
    match error {
        RefinementError::EmptyIdea | RefinementError::IdeaTooLong { .. } => {
            StatusCode::BAD_REQUEST
        }
        RefinementError::ModelInvocation(_) => StatusCode::BAD_GATEWAY,
    }
}

fn error_body(error: &RefinementError) -> ErrorBody {
    match error {
        RefinementError::EmptyIdea => ErrorBody {
            error: PROMPT_REQUIRED.to_owned(),
            message: None,
        },
        RefinementError::IdeaTooLong { .. } => ErrorBody {
            error: error.to_string(),
            message: None,
        },
        RefinementError::ModelInvocation(source) => ErrorBody {
            error: REFINE_FAILED.to_owned(),
            message: Some(source.to_string()),
        },
    }
}
