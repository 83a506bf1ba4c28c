pub const MIN_SCALE: f32 = 0.5;
pub const MAX_SCALE: f32 = 4.0;
pub const ZOOM_STEP: f32 = 0.1;
/// Scale change per unit of scroll-wheel delta.
pub const WHEEL_ZOOM_PER_UNIT: f32 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportTransform {
    pub scale: f32,
    pub translate_x: f32,
    pub translate_y: f32,
}

impl ViewportTransform {
    pub const IDENTITY: Self = Self {
        scale: 1.0,
        translate_x: 0.0,
        translate_y: 0.0,
    };
}

impl Default for ViewportTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Zoom and pan over a rendered artifact. Only scale is bounded; the artifact may be
/// dragged fully out of view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewportController {
    transform: ViewportTransform,
}

impl ViewportController {
    pub fn transform(&self) -> ViewportTransform {
        self.transform
    }

    pub fn zoom_in(&mut self) {
        self.zoom_by(ZOOM_STEP);
    }

    pub fn zoom_out(&mut self) {
        self.zoom_by(-ZOOM_STEP);
    }

    /// Continuous zoom, e.g. from a wheel gesture. Positive deltas zoom in.
    pub fn zoom_by_wheel(&mut self, wheel_delta: f32) {
        self.zoom_by(wheel_delta * WHEEL_ZOOM_PER_UNIT);
    }

    pub fn zoom_by(&mut self, delta: f32) {
        if !delta.is_finite() {
            return;
        }
        self.transform.scale = (self.transform.scale + delta).clamp(MIN_SCALE, MAX_SCALE);
    }

    pub fn pan_by(&mut self, dx: f32, dy: f32) {
        if !dx.is_finite() || !dy.is_finite() {
            return;
        }
        self.transform.translate_x += dx;
        self.transform.translate_y += dy;
    }

    pub fn reset(&mut self) {
        self.transform = ViewportTransform::IDENTITY;
    }

    pub fn scale_percent(&self) -> u32 {
        (self.transform.scale * 100.0).round() as u32
    }
}
