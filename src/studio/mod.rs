use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use eframe::egui;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{AppSettings, RefinementLimits};
use crate::diagram::{DiagramEngine, KrokiEngine, RenderState};
use crate::model::ModelClient;
use crate::refine::{RefinementSession, Refiner, ViewMode};

pub mod canvas;
pub mod events;

use self::canvas::render_diagram_pane;
use self::events::{StudioCommand, StudioEvent};

const APP_TITLE: &str = "pulse_idea studio";
const COPIED_NOTICE_DURATION: Duration = Duration::from_secs(2);
const ERROR_COLOR: egui::Color32 = egui::Color32::from_rgb(173, 33, 33);

pub fn run_studio(settings: &AppSettings) -> Result<()> {
    let runtime_handle = Handle::try_current().context("studio requires a tokio runtime")?;

    let (command_tx, command_rx) = unbounded_channel::<StudioCommand>();
    let (event_tx, event_rx) = unbounded_channel::<StudioEvent>();
    let refiner = Refiner::new(ModelClient::new(settings.clone()), settings.limits);
    let engine = KrokiEngine::from_settings(settings);
    let app_settings = settings.clone();

    spawn_runtime_worker(&runtime_handle, refiner, engine, command_rx, event_tx);
    info!(
        provider = %settings.model_provider,
        model = %settings.model,
        render_url = %settings.diagram_render_url,
        "starting native studio shell"
    );

    eframe::run_native(
        APP_TITLE,
        eframe::NativeOptions::default(),
        Box::new(move |cc| {
            egui_extras::install_image_loaders(&cc.egui_ctx);
            Ok(Box::new(StudioApp::new(
                app_settings,
                command_tx,
                event_rx,
            )))
        }),
    )
    .map_err(|error| anyhow::anyhow!("studio UI exited with error: {error}"))
}

/// Runs refinements and renders off the UI thread. A new command of either kind
/// aborts the task it replaces; the session's tickets still guard against late results.
fn spawn_runtime_worker<E>(
    handle: &Handle,
    refiner: Refiner<ModelClient>,
    engine: E,
    mut command_rx: UnboundedReceiver<StudioCommand>,
    event_tx: UnboundedSender<StudioEvent>,
) where
    E: DiagramEngine + Clone + Send + Sync + 'static,
{
    let _task = handle.spawn(async move {
        let mut refine_task: Option<JoinHandle<()>> = None;
        let mut render_task: Option<JoinHandle<()>> = None;

        while let Some(command) = command_rx.recv().await {
            match command {
                StudioCommand::Refine { ticket } => {
                    abort_in_flight(&mut refine_task);
                    abort_in_flight(&mut render_task);
                    let refiner = refiner.clone();
                    let event_tx = event_tx.clone();
                    refine_task = Some(tokio::spawn(async move {
                        let outcome = refiner.refine_request(&ticket.request).await;
                        let _ = event_tx.send(StudioEvent::RefinementFinished { ticket, outcome });
                    }));
                }
                StudioCommand::RenderDiagram { ticket } => {
                    abort_in_flight(&mut render_task);
                    let engine = engine.clone();
                    let event_tx = event_tx.clone();
                    render_task = Some(tokio::spawn(async move {
                        let result = engine
                            .render_diagram(&ticket.render_id, &ticket.source)
                            .await;
                        let _ = event_tx.send(StudioEvent::RenderFinished { ticket, result });
                    }));
                }
                StudioCommand::CancelAll => {
                    abort_in_flight(&mut refine_task);
                    abort_in_flight(&mut render_task);
                }
                StudioCommand::Shutdown => break,
            }
        }

        abort_in_flight(&mut refine_task);
        abort_in_flight(&mut render_task);
    });
}

fn abort_in_flight(task: &mut Option<JoinHandle<()>>) {
    if let Some(task) = task.take() {
        task.abort();
    }
}

struct StudioApp {
    settings: AppSettings,
    limits: RefinementLimits,
    command_tx: UnboundedSender<StudioCommand>,
    event_rx: UnboundedReceiver<StudioEvent>,
    input_buffer: String,
    session: RefinementSession,
    input_notice: Option<String>,
    copied_at: Option<Instant>,
    runtime_disconnected: bool,
}

impl StudioApp {
    fn new(
        settings: AppSettings,
        command_tx: UnboundedSender<StudioCommand>,
        event_rx: UnboundedReceiver<StudioEvent>,
    ) -> Self {
        Self {
            limits: settings.limits,
            settings,
            command_tx,
            event_rx,
            input_buffer: String::new(),
            session: RefinementSession::new(),
            input_notice: None,
            copied_at: None,
            runtime_disconnected: false,
        }
    }

    fn drain_events(&mut self) {
        loop {
            match self.event_rx.try_recv() {
                Ok(event) => self.apply_event(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !self.runtime_disconnected {
                        warn!("studio runtime worker disconnected");
                    }
                    self.runtime_disconnected = true;
                    break;
                }
            }
        }
    }

    fn apply_event(&mut self, event: StudioEvent) {
        let label = event.label();
        let applied = match event {
            StudioEvent::RefinementFinished { ticket, outcome } => {
                format!("{:?}", self.session.finish_refinement(&ticket, outcome))
            }
            StudioEvent::RenderFinished { ticket, result } => {
                format!("{:?}", self.session.finish_render(&ticket, result))
            }
        };
        debug!(event = label, applied = %applied, "applied studio event");
    }

    fn submit_idea(&mut self) {
        self.input_notice = None;
        let ticket = match self.session.begin_refinement(&self.input_buffer, &self.limits) {
            Ok(ticket) => ticket,
            Err(error) => {
                self.input_notice = Some(error.user_message());
                return;
            }
        };
        self.copied_at = None;
        self.send_command(StudioCommand::Refine { ticket });
    }

    fn reset(&mut self) {
        self.session.reset();
        self.input_buffer.clear();
        self.input_notice = None;
        self.copied_at = None;
        self.send_command(StudioCommand::CancelAll);
    }

    fn show_diagram(&mut self) {
        if let Some(ticket) = self.session.activate_diagram_view() {
            self.send_command(StudioCommand::RenderDiagram { ticket });
        }
    }

    fn send_command(&mut self, command: StudioCommand) {
        if let Err(error) = self.command_tx.send(command) {
            warn!(error = %error, "failed to reach studio runtime worker");
            self.runtime_disconnected = true;
        }
    }

    fn render_input_pane(&mut self, ui: &mut egui::Ui) {
        ui.heading("Your idea");
        ui.label(format!(
            "Provider: {} | Model: {}",
            self.settings.model_provider, self.settings.model
        ));
        ui.separator();

        ui.add(
            egui::TextEdit::multiline(&mut self.input_buffer)
                .hint_text("Describe the app you want to build...")
                .desired_rows(12)
                .desired_width(f32::INFINITY),
        );
        ui.label(format!(
            "{} / {} characters",
            self.input_buffer.trim().chars().count(),
            self.limits.max_idea_chars
        ));

        ui.horizontal(|ui| {
            let can_refine = !self.session.is_refining()
                && !self.runtime_disconnected
                && !self.input_buffer.trim().is_empty();
            if ui
                .add_enabled(can_refine, egui::Button::new("Refine"))
                .clicked()
            {
                self.submit_idea();
            }
            if ui.button("Reset").clicked() {
                self.reset();
            }
        });

        if self.session.is_refining() {
            ui.horizontal(|ui| {
                ui.spinner();
                ui.label("Refining...");
            });
        }
        if let Some(notice) = &self.input_notice {
            ui.colored_label(ERROR_COLOR, notice);
        }
        if self.runtime_disconnected {
            ui.colored_label(ERROR_COLOR, "Runtime worker is disconnected.");
        }
    }

    fn render_result_pane(&mut self, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            ui.heading("Refined idea");
            ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                self.render_view_switch(ui);
            });
        });
        ui.separator();

        if let Some(message) = self.session.error_message() {
            ui.colored_label(ERROR_COLOR, message);
            return;
        }
        let Some(result) = self.session.result() else {
            ui.label("Refined output will appear here.");
            return;
        };

        match self.session.view_mode() {
            ViewMode::Text => {
                let description = result.description.clone();
                let copied = self
                    .copied_at
                    .is_some_and(|at| at.elapsed() < COPIED_NOTICE_DURATION);
                if ui
                    .button(if copied { "Copied!" } else { "Copy" })
                    .clicked()
                {
                    ui.ctx().copy_text(description.clone());
                    self.copied_at = Some(Instant::now());
                }
                egui::ScrollArea::vertical().show(ui, |ui| {
                    ui.label(description);
                });
            }
            ViewMode::Diagram => {
                let state = self.session.render_state().clone();
                render_diagram_pane(ui, &state, self.session.viewport_mut());
            }
        }
    }

    fn render_view_switch(&mut self, ui: &mut egui::Ui) {
        let diagram_enabled = self.session.diagram_view_enabled();
        let in_diagram = self.session.view_mode() == ViewMode::Diagram;

        if ui
            .add_enabled(
                diagram_enabled,
                egui::SelectableLabel::new(in_diagram, "Diagram"),
            )
            .clicked()
            && !in_diagram
        {
            self.show_diagram();
        }
        if ui
            .add_enabled(
                self.session.result().is_some(),
                egui::SelectableLabel::new(!in_diagram, "Text"),
            )
            .clicked()
        {
            self.session.show_text_view();
        }
    }

    fn wants_fast_repaint(&self) -> bool {
        self.session.is_refining()
            || matches!(self.session.render_state(), RenderState::Loading { .. })
    }
}

impl Drop for StudioApp {
    fn drop(&mut self) {
        let _ = self.command_tx.send(StudioCommand::Shutdown);
    }
}

impl eframe::App for StudioApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.drain_events();

        egui::SidePanel::left("studio_idea_pane")
            .resizable(true)
            .default_width(420.0)
            .show(ctx, |ui| self.render_input_pane(ui));

        egui::CentralPanel::default().show(ctx, |ui| self.render_result_pane(ui));

        let repaint_after = if self.wants_fast_repaint() {
            Duration::from_millis(60)
        } else {
            Duration::from_millis(250)
        };
        ctx.request_repaint_after(repaint_after);
    }
}
