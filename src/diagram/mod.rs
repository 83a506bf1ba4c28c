pub mod engine;
pub mod render;
pub mod sanitize;
pub mod viewport;

pub use self::engine::{DiagramEngine, DiagramEngineError, KrokiEngine, RenderedSvg};
pub use self::render::{
    DiagramRenderer, RenderApplied, RenderArtifact, RenderState, RenderTicket,
};
pub use self::sanitize::sanitize;
pub use self::viewport::{ViewportController, ViewportTransform};
