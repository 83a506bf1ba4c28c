use std::fs;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command, Output, Stdio};
use std::time::Duration;

use axum::http::StatusCode as AxumStatus;
use axum::routing::post;
use axum::{Json, Router};
use pulse_idea::config::{AppSettings, RefinementLimits};
use pulse_idea::diagram::{DiagramRenderer, KrokiEngine, RenderApplied, RenderState, sanitize};
use pulse_idea::model::ModelClient;
use pulse_idea::refine::{RefinementApplied, RefinementSession, Refiner};
use pulse_idea::server::build_router;
use pulse_idea::test_support::{
    GatedGenerator, ScriptedGenerator, apply_ollama_test_env, remove_dir_if_exists, temp_path,
};
use reqwest::StatusCode;
use serde_json::json;
use tokio::time::sleep;

struct RunningServer {
    child: Child,
    bind_addr: String,
    log_dir: PathBuf,
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        remove_dir_if_exists(&self.log_dir);
    }
}

async fn serve_in_process(router: Router) -> Option<String> {
    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(error) if error.kind() == std::io::ErrorKind::PermissionDenied => return None,
        Err(error) => panic!("ephemeral port should be available for bind: {error}"),
    };
    let addr = listener
        .local_addr()
        .expect("listener should have local address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Some(addr.to_string())
}

#[tokio::test]
async fn http_refine_returns_structured_result() {
    let generator = ScriptedGenerator::replying(
        "```json\n{\"improvedIdea\":\"A shared grocery list\",\"diagram\":\"graph TD;A-->B;\"}\n```",
    );
    let router = build_router(Refiner::new(generator.clone(), RefinementLimits::default()));
    let Some(addr) = serve_in_process(router).await else {
        eprintln!("skipping: local TCP bind is not permitted in this environment");
        return;
    };

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/api/refine"))
        .json(&json!({ "prompt": "grocery app" }))
        .send()
        .await
        .expect("HTTP request should complete");

    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response
        .json()
        .await
        .expect("HTTP body should be valid JSON");
    assert_eq!(
        body,
        json!({ "improvedIdea": "A shared grocery list", "diagram": "graph TD;A-->B;" })
    );
    assert_eq!(generator.prompts()[0].1, "Raw Idea: grocery app");
}

#[tokio::test]
async fn http_rejects_missing_or_blank_prompt() {
    let generator = ScriptedGenerator::replying("unused");
    let router = build_router(Refiner::new(generator.clone(), RefinementLimits::default()));
    let Some(addr) = serve_in_process(router).await else {
        eprintln!("skipping: local TCP bind is not permitted in this environment");
        return;
    };
    let client = reqwest::Client::new();

    for payload in [json!({ "prompt": "   " }), json!({})] {
        let response = client
            .post(format!("http://{addr}/api/refine"))
            .json(&payload)
            .send()
            .await
            .expect("HTTP request should complete");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = response
            .json()
            .await
            .expect("HTTP error body should be valid JSON");
        assert_eq!(body, json!({ "error": "Prompt is required" }));
    }
    assert!(generator.prompts().is_empty());
}

#[tokio::test]
async fn unstructured_ollama_reply_is_returned_verbatim_with_extra_body_fields() {
    for content in ["  Sorry, I cannot comply.\n", "   "] {
        let fake_ollama = Router::new().route(
            "/api/chat",
            post(move || async move {
                Json(json!({ "message": { "role": "assistant", "content": content } }))
            }),
        );
        let Some(ollama_addr) = serve_in_process(fake_ollama).await else {
            eprintln!("skipping: local TCP bind is not permitted in this environment");
            return;
        };
        let ollama_url = format!("http://{ollama_addr}");
        let settings = AppSettings::from_vars(|key| match key {
            "MODEL_PROVIDER" => Some("ollama".to_owned()),
            "OLLAMA_BASE_URL" => Some(ollama_url.clone()),
            _ => None,
        })
        .expect("settings should load");
        let refiner = Refiner::new(ModelClient::new(settings), RefinementLimits::default());
        let router = build_router(refiner);
        let Some(addr) = serve_in_process(router).await else {
            eprintln!("skipping: local TCP bind is not permitted in this environment");
            return;
        };

        let response = reqwest::Client::new()
            .post(format!("http://{addr}/api/refine"))
            .json(&json!({ "prompt": "todo app", "clientVersion": 2 }))
            .send()
            .await
            .expect("HTTP request should complete");

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = response
            .json()
            .await
            .expect("HTTP body should be valid JSON");
        assert_eq!(body, json!({ "improvedIdea": content, "diagram": "" }));
    }
}

#[tokio::test]
async fn http_returns_bad_gateway_for_unreachable_model() {
    let Some(server) = start_server(4000).await else {
        eprintln!("skipping: local TCP bind is not permitted in this environment");
        return;
    };

    let response = reqwest::Client::new()
        .post(format!("http://{}/api/refine", server.bind_addr))
        .json(&json!({ "prompt": "hi" }))
        .send()
        .await
        .expect("HTTP request should complete");

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = response
        .json()
        .await
        .expect("HTTP error body should be valid JSON");
    assert_eq!(
        body.get("error").and_then(|value| value.as_str()),
        Some("Failed to refine prompt")
    );
    assert!(
        body.get("message")
            .and_then(|value| value.as_str())
            .is_some_and(|message| !message.is_empty()),
        "expected upstream detail in message, got: {body}"
    );
}

#[tokio::test]
async fn cli_and_http_share_oversized_idea_guardrail() {
    let Some(server) = start_server(4).await else {
        eprintln!("skipping: local TCP bind is not permitted in this environment");
        return;
    };

    let response = reqwest::Client::new()
        .post(format!("http://{}/api/refine", server.bind_addr))
        .json(&json!({ "prompt": "hello" }))
        .send()
        .await
        .expect("HTTP request should complete");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response
        .json()
        .await
        .expect("HTTP error body should be valid JSON");
    let error = body
        .get("error")
        .and_then(|value| value.as_str())
        .expect("error field should be a string");
    assert!(error.contains("max 4"), "expected limit in error, got: {error}");

    let output = run_cli_refine_json("hello", 4);
    assert!(
        !output.status.success(),
        "CLI should fail for oversized input"
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("max 4"),
        "expected limit in CLI stderr, got: {stderr}"
    );
}

#[tokio::test]
async fn superseded_refinement_never_reaches_the_session() {
    let limits = RefinementLimits::default();
    let generator = GatedGenerator::default();
    let first_gate = generator.gate("Raw Idea: first idea");
    let second_gate = generator.gate("Raw Idea: second idea");
    let refiner = Refiner::new(generator, limits);
    let mut session = RefinementSession::new();

    let first = session
        .begin_refinement("first idea", &limits)
        .expect("first idea is valid");
    let second = session
        .begin_refinement("second idea", &limits)
        .expect("second idea is valid");

    let first_task = tokio::spawn({
        let refiner = refiner.clone();
        let request = first.request.clone();
        async move { refiner.refine_request(&request).await }
    });
    let second_task = tokio::spawn({
        let refiner = refiner.clone();
        let request = second.request.clone();
        async move { refiner.refine_request(&request).await }
    });

    second_gate
        .send(r#"{"improvedIdea":"second","diagram":"graph TD;B-->C;"}"#.to_owned())
        .expect("second gate should be open");
    let second_outcome = second_task.await.expect("second task should join");
    assert_eq!(
        session.finish_refinement(&second, second_outcome),
        RefinementApplied::Applied
    );

    first_gate
        .send(r#"{"improvedIdea":"first","diagram":""}"#.to_owned())
        .expect("first gate should be open");
    let first_outcome = first_task.await.expect("first task should join");
    assert_eq!(
        session.finish_refinement(&first, first_outcome),
        RefinementApplied::Stale
    );

    let result = session.result().expect("latest result should be visible");
    assert_eq!(result.description, "second");
    assert_eq!(result.diagram_source, "graph TD;B-->C;");
}

#[tokio::test]
async fn kroki_engine_renders_and_surfaces_rejections() {
    let fake_kroki = Router::new().route(
        "/mermaid/svg",
        post(|source: String| async move {
            if source.contains("broken") {
                (AxumStatus::BAD_REQUEST, "Parse error on line 2".to_owned())
            } else {
                (
                    AxumStatus::OK,
                    r#"<svg xmlns="http://www.w3.org/2000/svg" width="200px" height="100px" viewBox="0 0 200 100"><g/></svg>"#
                        .to_owned(),
                )
            }
        }),
    );
    let Some(addr) = serve_in_process(fake_kroki).await else {
        eprintln!("skipping: local TCP bind is not permitted in this environment");
        return;
    };
    let engine = KrokiEngine::new(format!("http://{addr}/"), 2_000);
    let mut renderer = DiagramRenderer::new();

    let applied = renderer
        .render(&engine, &sanitize("graph TD;A-->B;"))
        .await;
    assert_eq!(applied, RenderApplied::Rendered);
    let RenderState::Rendered(artifact) = renderer.state() else {
        panic!("expected rendered state, got {:?}", renderer.state());
    };
    assert_eq!(artifact.intrinsic_size, Some((200.0, 100.0)));
    assert!(artifact.svg.contains(r#"width="100%""#));
    assert!(artifact.svg.contains("max-width: 100%"));
    assert!(!artifact.svg.contains("200px"));

    let applied = renderer
        .render(&engine, &sanitize("graph TD;A-->broken"))
        .await;
    assert_eq!(applied, RenderApplied::Failed);
    assert_eq!(
        renderer.state(),
        &RenderState::Failed {
            message: "Parse error on line 2".to_owned()
        }
    );
    assert!(renderer.container_markup().contains("Render Failed"));
}

async fn start_server(max_idea_chars: u32) -> Option<RunningServer> {
    let port = find_available_port()?;
    let bind_addr = format!("127.0.0.1:{port}");
    let log_dir = temp_path("integration-logs");
    fs::create_dir_all(&log_dir).expect("log dir should be creatable");

    let mut command = Command::new(bin_path());
    command
        .args(["serve", "--bind", &bind_addr])
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    apply_ollama_test_env(&mut command, &log_dir, max_idea_chars, "http://127.0.0.1:9");

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(error) if error.kind() == std::io::ErrorKind::PermissionDenied => return None,
        Err(error) => panic!("server should start: {error}"),
    };

    let health_url = format!("http://{bind_addr}/health");
    let client = reqwest::Client::new();
    for _ in 0..100 {
        if let Some(status) = child.try_wait().expect("failed to poll server process") {
            panic!("server exited before becoming healthy: {status}");
        }

        if let Ok(response) = client.get(&health_url).send().await
            && response.status().is_success()
        {
            return Some(RunningServer {
                child,
                bind_addr,
                log_dir,
            });
        }

        sleep(Duration::from_millis(50)).await;
    }

    let _ = child.kill();
    let _ = child.wait();
    panic!("server did not become healthy at {health_url}");
}

fn run_cli_refine_json(idea: &str, max_idea_chars: u32) -> Output {
    let log_dir = temp_path("integration-cli-logs");
    fs::create_dir_all(&log_dir).expect("log dir should be creatable");

    let mut command = Command::new(bin_path());
    command.args(["refine", idea, "--json"]);
    apply_ollama_test_env(&mut command, &log_dir, max_idea_chars, "http://127.0.0.1:9");

    let output = command.output().expect("CLI command should execute");

    remove_dir_if_exists(&log_dir);
    output
}

fn find_available_port() -> Option<u16> {
    let listener = match TcpListener::bind("127.0.0.1:0") {
        Ok(listener) => listener,
        Err(error) if error.kind() == std::io::ErrorKind::PermissionDenied => return None,
        Err(error) => panic!("ephemeral port should be available for bind: {error}"),
    };
    let port = listener
        .local_addr()
        .expect("ephemeral listener should have local address")
        .port();
    drop(listener);
    Some(port)
}

fn bin_path() -> &'static str {
    env!("CARGO_BIN_EXE_pulse_idea")
}
