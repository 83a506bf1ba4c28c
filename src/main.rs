use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use pulse_idea::config::AppSettings;
use pulse_idea::diagram::{DiagramRenderer, KrokiEngine, RenderApplied, RenderState, sanitize};
use pulse_idea::model::ModelClient;
use pulse_idea::refine::{RefinementError, Refiner};
use pulse_idea::server::run_http_server;
use pulse_idea::studio::run_studio;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer};

const DEFAULT_STDERR_FILTER: &str = "info,pulse_idea=debug";
const DEFAULT_FILE_FILTER: &str = "info";
const LOG_FILE_PREFIX: &str = "pulse_idea.log";

#[derive(Debug, Parser)]
#[command(
    name = "pulse_idea",
    about = "Refine raw app ideas into specifications with architecture diagrams"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Refine an idea and print the improved description.
    Refine {
        idea: String,
        /// Print the full result (description and diagram source) as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Sanitize and render flowchart source from FILE (or stdin) to SVG.
    Render {
        file: Option<PathBuf>,
        /// Write the SVG here instead of printing the container markup.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Serve the refine API over HTTP.
    Serve {
        #[arg(long, default_value = "127.0.0.1:3000")]
        bind: String,
    },
    /// Open the native studio window.
    Studio,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = init_tracing()?;

    let cli = Cli::parse();
    let settings = AppSettings::from_env().context("failed to load configuration")?;

    match cli.command {
        Commands::Refine { idea, json } => run_refine(&settings, &idea, json).await?,
        Commands::Render { file, out } => run_render(&settings, file, out).await?,
        Commands::Serve { bind } => run_http_server(&settings, &bind).await?,
        Commands::Studio => run_studio(&settings)?,
    }

    Ok(())
}

async fn run_refine(settings: &AppSettings, idea: &str, json: bool) -> Result<()> {
    let refiner = Refiner::new(ModelClient::new(settings.clone()), settings.limits);
    let result = match refiner.refine(idea).await {
        Ok(result) => result,
        Err(error @ RefinementError::ModelInvocation(_)) => {
            eprintln!("{}", error.user_message());
            return Err(error).context("model invocation failed");
        }
        Err(error) => return Err(error).context("invalid idea"),
    };

    if json {
        let body =
            serde_json::to_string_pretty(&result).context("failed to serialize refinement")?;
        println!("{body}");
    } else {
        println!("{}", result.description);
        if result.has_diagram() {
            println!();
            println!("{}", result.diagram_source);
        }
    }
    Ok(())
}

async fn run_render(
    settings: &AppSettings,
    file: Option<PathBuf>,
    out: Option<PathBuf>,
) -> Result<()> {
    let source = match &file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read diagram source `{}`", path.display()))?,
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("failed to read diagram source from stdin")?;
            buffer
        }
    };

    let engine = KrokiEngine::from_settings(settings);
    let mut renderer = DiagramRenderer::new();
    let applied = renderer.render(&engine, &sanitize(&source)).await;

    match (applied, renderer.state()) {
        (RenderApplied::Rendered, RenderState::Rendered(artifact)) => {
            match out {
                Some(path) => std::fs::write(&path, &artifact.raw_svg).with_context(|| {
                    format!("failed to write SVG to `{}`", path.display())
                })?,
                None => println!("{}", artifact.svg),
            }
            Ok(())
        }
        (_, RenderState::Failed { message }) => {
            println!("{}", renderer.container_markup());
            bail!("diagram render failed: {message}")
        }
        _ => bail!("diagram source is empty after sanitizing"),
    }
}

fn init_tracing() -> Result<Option<WorkerGuard>> {
    let stderr_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_STDERR_FILTER));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .with_filter(stderr_filter);

    let (file_layer, guard) = match std::env::var_os("PULSE_LOG_DIR") {
        Some(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_filter = EnvFilter::try_from_env("PULSE_FILE_LOG")
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILE_FILTER));
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(file_filter);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;

    Ok(guard)
}
