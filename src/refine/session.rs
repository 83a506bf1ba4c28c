use tracing::debug;

use super::{RefinementError, RefinementRequest, RefinementResult};
use crate::config::RefinementLimits;
use crate::diagram::{
    DiagramEngineError, DiagramRenderer, RenderApplied, RenderState, RenderTicket, RenderedSvg,
    ViewportController, sanitize,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewMode {
    #[default]
    Text,
    Diagram,
}

/// Issued per submission. A finished refinement is only applied while its ticket is
/// the most recent one, so a slow stale response cannot overwrite a newer result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefinementTicket {
    pub request: RefinementRequest,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefinementApplied {
    Applied,
    Stale,
}

/// Visible state for one user: the latest result, the diagram container and its viewport.
#[derive(Debug, Default)]
pub struct RefinementSession {
    generation: u64,
    pending: Option<u64>,
    result: Option<RefinementResult>,
    error_message: Option<String>,
    view_mode: ViewMode,
    renderer: DiagramRenderer,
    viewport: ViewportController,
}

impl RefinementSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn result(&self) -> Option<&RefinementResult> {
        self.result.as_ref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn view_mode(&self) -> ViewMode {
        self.view_mode
    }

    pub fn is_refining(&self) -> bool {
        self.pending.is_some()
    }

    pub fn render_state(&self) -> &RenderState {
        self.renderer.state()
    }

    pub fn viewport(&self) -> &ViewportController {
        &self.viewport
    }

    pub fn viewport_mut(&mut self) -> &mut ViewportController {
        &mut self.viewport
    }

    /// True only when the diagram still has content after sanitizing.
    pub fn diagram_view_enabled(&self) -> bool {
        self.sanitized_diagram().is_some()
    }

    fn sanitized_diagram(&self) -> Option<String> {
        self.result
            .as_ref()
            .map(|result| sanitize(&result.diagram_source))
            .filter(|source| !source.is_empty())
    }

    /// Validates the idea and discards every piece of state left by earlier requests.
    /// A request still in flight is superseded rather than waited for.
    pub fn begin_refinement(
        &mut self,
        idea_text: &str,
        limits: &RefinementLimits,
    ) -> Result<RefinementTicket, RefinementError> {
        let request = RefinementRequest::new(idea_text, limits)?;

        self.generation = self.generation.saturating_add(1);
        if self.pending.is_some() {
            debug!(generation = self.generation, "superseding in-flight refinement");
        }
        self.pending = Some(self.generation);
        self.clear_visible_state();

        Ok(RefinementTicket {
            request,
            generation: self.generation,
        })
    }

    pub fn finish_refinement(
        &mut self,
        ticket: &RefinementTicket,
        outcome: Result<RefinementResult, RefinementError>,
    ) -> RefinementApplied {
        if self.pending != Some(ticket.generation) {
            debug!(
                generation = ticket.generation,
                current = self.generation,
                "dropping stale refinement result"
            );
            return RefinementApplied::Stale;
        }
        self.pending = None;

        match outcome {
            Ok(result) => {
                self.result = Some(result);
                self.error_message = None;
            }
            Err(error) => {
                self.result = None;
                self.error_message = Some(error.user_message());
            }
        }
        RefinementApplied::Applied
    }

    /// Switches to the diagram view and restarts rendering from `Loading`. Returns
    /// `None` when there is no diagram to show; the view stays on text in that case.
    pub fn activate_diagram_view(&mut self) -> Option<RenderTicket> {
        let source = self.sanitized_diagram()?;

        self.view_mode = ViewMode::Diagram;
        let ticket = self.renderer.begin(&source);
        if ticket.is_none() {
            self.view_mode = ViewMode::Text;
        }
        ticket
    }

    pub fn show_text_view(&mut self) {
        self.view_mode = ViewMode::Text;
    }

    /// Applies an engine result; a fresh artifact always starts at the identity transform.
    pub fn finish_render(
        &mut self,
        ticket: &RenderTicket,
        result: Result<RenderedSvg, DiagramEngineError>,
    ) -> RenderApplied {
        let applied = self.renderer.complete(ticket, result);
        if applied == RenderApplied::Rendered {
            self.viewport.reset();
        }
        applied
    }

    /// Start over: forget the result, any in-flight work and the view state.
    pub fn reset(&mut self) {
        self.generation = self.generation.saturating_add(1);
        self.pending = None;
        self.clear_visible_state();
    }

    fn clear_visible_state(&mut self) {
        self.result = None;
        self.error_message = None;
        self.view_mode = ViewMode::Text;
        self.renderer.clear();
        self.viewport.reset();
    }
}
