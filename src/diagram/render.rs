use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use regex::{Captures, Regex};
use tracing::{debug, warn};

use super::engine::{DiagramEngine, DiagramEngineError, RenderedSvg};

static NEXT_RENDERER_INSTANCE: AtomicU64 = AtomicU64::new(1);

const LOADING_MARKUP: &str = "<div class=\"diagram-loading\" aria-busy=\"true\"><span class=\"diagram-spinner\"></span><span>Rendering...</span></div>";
const UNKNOWN_RENDER_ERROR: &str = "the render engine failed without an error message";

/// Rendered SVG plus its intrinsic size, used to keep the aspect ratio when the
/// artifact is scaled to the width of its container.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderArtifact {
    pub render_id: String,
    pub raw_svg: String,
    /// `raw_svg` as shared bytes for image loaders keyed by `render_id`.
    pub svg_bytes: Arc<[u8]>,
    pub svg: String,
    pub intrinsic_size: Option<(f32, f32)>,
}

impl RenderArtifact {
    pub fn from_engine_output(render_id: String, rendered: RenderedSvg) -> Self {
        let intrinsic_size = intrinsic_svg_size(&rendered.svg_markup);
        let svg = normalize_svg_sizing(&rendered.svg_markup);
        Self {
            render_id,
            svg_bytes: Arc::from(rendered.svg_markup.as_bytes()),
            raw_svg: rendered.svg_markup,
            svg,
            intrinsic_size,
        }
    }

    /// Size that fills `container_width` while keeping the intrinsic aspect ratio.
    pub fn fitted_size(&self, container_width: f32) -> Option<(f32, f32)> {
        let (width, height) = self.intrinsic_size?;
        if width <= 0.0 || container_width <= 0.0 {
            return None;
        }
        Some((container_width, height * container_width / width))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderState {
    Idle,
    Loading { render_id: String },
    Rendered(RenderArtifact),
    Failed { message: String },
}

impl RenderState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading { .. } => "loading",
            Self::Rendered(_) => "rendered",
            Self::Failed { .. } => "failed",
        }
    }

    /// Container content for this state as an HTML fragment.
    pub fn container_markup(&self) -> String {
        match self {
            Self::Idle => String::new(),
            Self::Loading { .. } => LOADING_MARKUP.to_owned(),
            Self::Rendered(artifact) => artifact.svg.clone(),
            Self::Failed { message } => format!(
                "<div class=\"diagram-error\" role=\"alert\"><strong>Render Failed</strong><br/>{}</div>",
                escape_html(message)
            ),
        }
    }
}

/// Issued by [`DiagramRenderer::begin`]; the engine result is only applied when the
/// ticket is still the latest one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderTicket {
    pub render_id: String,
    pub source: String,
    token: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderApplied {
    Rendered,
    Failed,
    Stale,
    /// Nothing to render; the container was left empty.
    Empty,
}

#[derive(Debug)]
pub struct DiagramRenderer {
    instance: u64,
    issued: u64,
    current: Option<u64>,
    state: RenderState,
}

impl Default for DiagramRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagramRenderer {
    pub fn new() -> Self {
        Self {
            instance: NEXT_RENDERER_INSTANCE.fetch_add(1, Ordering::Relaxed),
            issued: 0,
            current: None,
            state: RenderState::Idle,
        }
    }

    pub fn state(&self) -> &RenderState {
        &self.state
    }

    pub fn container_markup(&self) -> String {
        self.state.container_markup()
    }

    /// Starts a render of already sanitized source. Empty source leaves the
    /// container empty and issues no ticket. Any earlier ticket becomes stale.
    pub fn begin(&mut self, sanitized_source: &str) -> Option<RenderTicket> {
        self.issued = self.issued.saturating_add(1);
        if sanitized_source.trim().is_empty() {
            self.current = None;
            self.state = RenderState::Idle;
            return None;
        }

        let render_id = format!("diagram-{:x}-{}", self.instance, self.issued);
        self.current = Some(self.issued);
        self.state = RenderState::Loading {
            render_id: render_id.clone(),
        };

        Some(RenderTicket {
            render_id,
            source: sanitized_source.to_owned(),
            token: self.issued,
        })
    }

    pub fn complete(
        &mut self,
        ticket: &RenderTicket,
        result: Result<RenderedSvg, DiagramEngineError>,
    ) -> RenderApplied {
        if self.current != Some(ticket.token) {
            debug!(render_id = %ticket.render_id, "dropping stale diagram render");
            return RenderApplied::Stale;
        }
        self.current = None;

        match result {
            Ok(rendered) => {
                self.state = RenderState::Rendered(RenderArtifact::from_engine_output(
                    ticket.render_id.clone(),
                    rendered,
                ));
                RenderApplied::Rendered
            }
            Err(error) => {
                warn!(render_id = %ticket.render_id, error = %error, "diagram render failed");
                let message = error.to_string();
                self.state = RenderState::Failed {
                    message: if message.trim().is_empty() {
                        UNKNOWN_RENDER_ERROR.to_owned()
                    } else {
                        message
                    },
                };
                RenderApplied::Failed
            }
        }
    }

    /// Convenience for callers that own the renderer across the engine call.
    pub async fn render<E: DiagramEngine>(
        &mut self,
        engine: &E,
        sanitized_source: &str,
    ) -> RenderApplied {
        let Some(ticket) = self.begin(sanitized_source) else {
            return RenderApplied::Empty;
        };
        let result = engine
            .render_diagram(&ticket.render_id, &ticket.source)
            .await;
        self.complete(&ticket, result)
    }

    /// Tears down the artifact; in-flight renders become stale.
    pub fn clear(&mut self) {
        self.issued = self.issued.saturating_add(1);
        self.current = None;
        self.state = RenderState::Idle;
    }
}

/// Rewrites the root `<svg>` tag so width follows the container and height scales with it.
pub fn normalize_svg_sizing(svg: &str) -> String {
    let Some(root) = root_svg_tag_re().find(svg) else {
        return svg.to_owned();
    };
    let tag = root.as_str();
    let style = tag_attributes(tag)
        .into_iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("style"))
        .map(|(_, value)| value);

    let stripped = attribute_re().replace_all(tag, |caps: &Captures<'_>| {
        if is_sizing_attribute(&caps[1]) {
            String::new()
        } else {
            caps[0].to_owned()
        }
    });
    let (head, closer) = match stripped.strip_suffix("/>") {
        Some(head) => (head, "/>"),
        None => (stripped.strip_suffix('>').unwrap_or(&*stripped), ">"),
    };

    let rebuilt = format!(
        "{} width=\"100%\" height=\"auto\" style=\"{}\"{closer}",
        head.trim_end(),
        merge_max_width(style).replace('"', "&quot;")
    );
    format!("{}{}{}", &svg[..root.start()], rebuilt, &svg[root.end()..])
}

/// Reads the intrinsic size from `viewBox`, falling back to numeric width/height.
/// Markup that is not well-formed XML is read from the root tag alone.
pub fn intrinsic_svg_size(svg: &str) -> Option<(f32, f32)> {
    let options = roxmltree::ParsingOptions {
        allow_dtd: true,
        ..roxmltree::ParsingOptions::default()
    };
    let attributes = match roxmltree::Document::parse_with_options(svg, options) {
        Ok(document) => {
            let root = document.root_element();
            if root.tag_name().name() != "svg" {
                return None;
            }
            root.attributes()
                .map(|attribute| (attribute.name().to_owned(), attribute.value().to_owned()))
                .collect::<Vec<_>>()
        }
        Err(error) => {
            debug!(error = %error, "svg is not well-formed; reading root tag attributes");
            let root = root_svg_tag_re().find(svg)?;
            tag_attributes(root.as_str())
                .into_iter()
                .map(|(name, value)| (name.to_owned(), value.to_owned()))
                .collect()
        }
    };
    let lookup = |wanted: &str| {
        attributes
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(wanted))
            .map(|(_, value)| value.as_str())
    };

    if let Some(view_box) = lookup("viewBox") {
        let numbers = view_box
            .split(|ch: char| ch.is_whitespace() || ch == ',')
            .filter(|part| !part.is_empty())
            .map(str::parse::<f32>)
            .collect::<Result<Vec<_>, _>>()
            .ok()?;
        if let [_, _, width, height] = numbers.as_slice()
            && *width > 0.0
            && *height > 0.0
        {
            return Some((*width, *height));
        }
    }

    let width = lookup("width").and_then(parse_length)?;
    let height = lookup("height").and_then(parse_length)?;
    Some((width, height))
}

fn root_svg_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"<svg\b(?:[^>"']|"[^"]*"|'[^']*')*>"#).expect("root tag pattern is valid")
    })
}

fn attribute_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\s([A-Za-z_:][-\w:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'/>]+))"#)
            .expect("attribute pattern is valid")
    })
}

fn max_width_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:^|;)\s*max-width\s*:[^;]*").expect("max-width pattern is valid")
    })
}

fn tag_attributes(tag: &str) -> Vec<(&str, &str)> {
    attribute_re()
        .captures_iter(tag)
        .filter_map(|caps| {
            let name = caps.get(1)?.as_str();
            let value = caps.get(2).or(caps.get(3)).or(caps.get(4))?.as_str();
            Some((name, value))
        })
        .collect()
}

fn is_sizing_attribute(name: &str) -> bool {
    ["width", "height", "style"]
        .iter()
        .any(|sizing| name.eq_ignore_ascii_case(sizing))
}

fn merge_max_width(style: Option<&str>) -> String {
    let remaining = max_width_re().replace_all(style.unwrap_or_default(), "");
    let remaining = remaining.trim().trim_matches(';').trim();
    if remaining.is_empty() {
        "max-width: 100%;".to_owned()
    } else {
        format!("{remaining}; max-width: 100%;")
    }
}

fn parse_length(value: &str) -> Option<f32> {
    let number = value.trim().trim_end_matches("px");
    number.parse::<f32>().ok().filter(|parsed| *parsed > 0.0)
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}
