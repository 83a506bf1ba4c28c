use crate::diagram::{DiagramEngineError, RenderTicket, RenderedSvg};
use crate::refine::{RefinementError, RefinementResult, RefinementTicket};

#[derive(Debug)]
pub enum StudioCommand {
    Refine { ticket: RefinementTicket },
    RenderDiagram { ticket: RenderTicket },
    /// Abandon any in-flight refine or render task.
    CancelAll,
    Shutdown,
}

#[derive(Debug)]
pub enum StudioEvent {
    RefinementFinished {
        ticket: RefinementTicket,
        outcome: Result<RefinementResult, RefinementError>,
    },
    RenderFinished {
        ticket: RenderTicket,
        result: Result<RenderedSvg, DiagramEngineError>,
    },
}

impl StudioEvent {
    pub fn label(&self) -> &'static str {
        match self {
            Self::RefinementFinished { .. } => "refinement_finished",
            Self::RenderFinished { .. } => "render_finished",
        }
    }
}
