use eframe::egui;

use crate::diagram::{RenderArtifact, RenderState, ViewportController};

const ERROR_FILL: egui::Color32 = egui::Color32::from_rgb(254, 242, 242);
const ERROR_TEXT: egui::Color32 = egui::Color32::from_rgb(185, 28, 28);
const CANVAS_FILL: egui::Color32 = egui::Color32::from_rgb(250, 250, 250);

/// Draws the diagram container for the current render state. Zoom and pan only touch
/// the viewport transform, never the artifact.
pub fn render_diagram_pane(
    ui: &mut egui::Ui,
    state: &RenderState,
    viewport: &mut ViewportController,
) {
    match state {
        RenderState::Idle => {
            ui.label("No diagram available.");
        }
        RenderState::Loading { .. } => {
            ui.horizontal(|ui| {
                ui.spinner();
                ui.label("Rendering...");
            });
        }
        RenderState::Failed { message } => {
            egui::Frame::group(ui.style())
                .fill(ERROR_FILL)
                .show(ui, |ui| {
                    ui.label(egui::RichText::new("Render Failed").strong().color(ERROR_TEXT));
                    ui.label(egui::RichText::new(message).monospace().color(ERROR_TEXT));
                });
        }
        RenderState::Rendered(artifact) => {
            render_viewport_controls(ui, viewport);
            render_artifact(ui, artifact, viewport);
        }
    }
}

fn render_viewport_controls(ui: &mut egui::Ui, viewport: &mut ViewportController) {
    ui.horizontal(|ui| {
        if ui.button("-").on_hover_text("Zoom out").clicked() {
            viewport.zoom_out();
        }
        ui.label(format!("{}%", viewport.scale_percent()));
        if ui.button("+").on_hover_text("Zoom in").clicked() {
            viewport.zoom_in();
        }
        if ui.button("Reset view").clicked() {
            viewport.reset();
        }
        ui.weak("Scroll to zoom, drag to pan, double-click to reset.");
    });
}

fn render_artifact(ui: &mut egui::Ui, artifact: &RenderArtifact, viewport: &mut ViewportController) {
    let (rect, response) =
        ui.allocate_exact_size(ui.available_size(), egui::Sense::click_and_drag());
    ui.painter().rect_filled(rect, 4.0, CANVAS_FILL);

    if response.dragged() {
        let delta = response.drag_delta();
        viewport.pan_by(delta.x, delta.y);
    }
    if response.hovered() {
        let scroll = ui.input(|input| input.smooth_scroll_delta.y);
        if scroll != 0.0 {
            viewport.zoom_by_wheel(scroll);
        }
    }
    if response.double_clicked() {
        viewport.reset();
    }

    let transform = viewport.transform();
    let (width, height) = artifact
        .fitted_size(rect.width())
        .unwrap_or((rect.width(), rect.height()));
    let size = egui::vec2(width, height) * transform.scale;
    let center = rect.center() + egui::vec2(transform.translate_x, transform.translate_y);
    let image_rect = egui::Rect::from_center_size(center, size);

    let image = egui::Image::from_bytes(
        format!("bytes://{}.svg", artifact.render_id),
        artifact.svg_bytes.clone(),
    );
    let mut clipped = ui.new_child(egui::UiBuilder::new().max_rect(rect));
    clipped.set_clip_rect(rect);
    image.paint_at(&clipped, image_rect);
}
