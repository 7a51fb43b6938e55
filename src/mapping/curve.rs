//! Axis curve engine
//!
//! Pure transform of a normalized axis value, applied in four steps:
//!
//! ```text
//! x ──► |x| < deadzone? ──► rescale [deadzone, saturation] → [0, 1] ──► shape(u) ──► sign(x)·shape(u)
//!            │ yes                (inputs past saturation clamp to 1)
//!            ▼
//!            0
//! ```
//!
//! The result is an odd function of `x`, zero at zero, and reaches ±1 at
//! `|x| >= saturation`. Evaluation allocates nothing and holds no state, so
//! one curve can be shared across any number of concurrent resolutions.

use crate::mapping::error::MappingError;
use serde::{Deserialize, Serialize};

/// Smallest gap kept between deadzone and saturation
const MIN_ACTIVE_RANGE: f32 = 1e-4;

/// Largest exponent used by [`CurveKind::Exponential`] (at curvature ±1 the
/// exponent is `4` or `1/4`)
const EXPONENT_BASE: f32 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CurveKind {
    #[default]
    Linear,
    SCurve,
    Exponential,
    Custom,
}

/// Response curve of one axis mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisCurve {
    #[serde(rename = "type", default)]
    pub kind: CurveKind,
    /// -1..=1; positive flattens the center, negative sharpens it
    #[serde(default)]
    pub curvature: f32,
    /// 0..1; inputs below are suppressed to exactly zero
    #[serde(default)]
    pub deadzone: f32,
    /// (0, 1]; inputs at or beyond produce full output
    #[serde(default = "default_saturation")]
    pub saturation: f32,
    /// `(input, output)` pairs sorted by input, used by `Custom`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_points: Option<Vec<(f32, f32)>>,
}

fn default_saturation() -> f32 {
    1.0
}

impl Default for AxisCurve {
    fn default() -> Self {
        Self {
            kind: CurveKind::Linear,
            curvature: 0.0,
            deadzone: 0.0,
            saturation: default_saturation(),
            control_points: None,
        }
    }
}

impl AxisCurve {
    pub fn linear() -> Self {
        Self::default()
    }

    pub fn with_kind(kind: CurveKind, curvature: f32) -> Self {
        Self {
            kind,
            curvature,
            ..Self::default()
        }
    }

    pub fn custom(control_points: Vec<(f32, f32)>) -> Self {
        Self {
            kind: CurveKind::Custom,
            control_points: Some(control_points),
            ..Self::default()
        }
    }

    pub fn deadzone(mut self, deadzone: f32) -> Self {
        self.deadzone = deadzone;
        self
    }

    pub fn saturation(mut self, saturation: f32) -> Self {
        self.saturation = saturation;
        self
    }

    /// Transforms a raw axis value in `[-1, 1]`.
    pub fn apply(&self, x: f32) -> f32 {
        if !x.is_finite() || x == 0.0 {
            return 0.0;
        }
        let x = x.clamp(-1.0, 1.0);
        let magnitude = x.abs();

        let saturation = if self.saturation.is_finite() {
            self.saturation.clamp(MIN_ACTIVE_RANGE, 1.0)
        } else {
            1.0
        };
        // A deadzone at or past saturation would divide by zero below
        let deadzone = if self.deadzone.is_finite() {
            self.deadzone.clamp(0.0, saturation - MIN_ACTIVE_RANGE)
        } else {
            0.0
        };

        if magnitude < deadzone {
            return 0.0;
        }

        let u = (magnitude.min(saturation) - deadzone) / (saturation - deadzone);
        let shaped = self.shape(u.clamp(0.0, 1.0)).clamp(0.0, 1.0);
        shaped.copysign(x)
    }

    /// Maps `u` in `[0, 1]` onto `[0, 1]` with `shape(0) = 0` and `shape(1) = 1`.
    fn shape(&self, u: f32) -> f32 {
        let curvature = if self.curvature.is_finite() {
            self.curvature.clamp(-1.0, 1.0)
        } else {
            0.0
        };

        match self.kind {
            CurveKind::Linear => u,
            CurveKind::SCurve => s_curve(u, curvature),
            CurveKind::Exponential => u.powf(EXPONENT_BASE.powf(curvature)),
            CurveKind::Custom => match self.control_points.as_deref() {
                Some(points) if points.len() >= 2 => piecewise_linear(u, points),
                _ => u,
            },
        }
    }

    /// Checks parameter ranges. `apply` clamps bad values anyway; this is
    /// for rejecting a profile before it goes live.
    pub fn validate(&self) -> Result<(), MappingError> {
        let invalid = |reason: String| Err(MappingError::InvalidCurve(reason));

        if !(-1.0..=1.0).contains(&self.curvature) {
            return invalid(format!("curvature {} outside [-1, 1]", self.curvature));
        }
        if !(0.0..1.0).contains(&self.deadzone) {
            return invalid(format!("deadzone {} outside [0, 1)", self.deadzone));
        }
        if !(self.saturation > 0.0 && self.saturation <= 1.0) {
            return invalid(format!("saturation {} outside (0, 1]", self.saturation));
        }
        if self.deadzone >= self.saturation {
            return invalid(format!(
                "deadzone {} must be below saturation {}",
                self.deadzone, self.saturation
            ));
        }
        if let Some(points) = &self.control_points {
            if points
                .iter()
                .any(|(i, o)| !(0.0..=1.0).contains(i) || !(0.0..=1.0).contains(o))
            {
                return invalid("control points must lie within [0, 1]".to_string());
            }
            if points.windows(2).any(|w| w[0].0 > w[1].0) {
                return invalid("control points must be sorted by input".to_string());
            }
        }
        Ok(())
    }
}

/// Cubic blend. Positive curvature mixes in `u³` (flat center), negative
/// mixes in `1 - (1 - u)³` (steep center). Both terms are monotonic on
/// `[0, 1]` with matching endpoints, so the blend is too.
fn s_curve(u: f32, curvature: f32) -> f32 {
    if curvature >= 0.0 {
        (1.0 - curvature) * u + curvature * u * u * u
    } else {
        let weight = -curvature;
        let inv = 1.0 - u;
        (1.0 - weight) * u + weight * (1.0 - inv * inv * inv)
    }
}

/// Linear interpolation through `points`, pinned at `(0, 0)` and `(1, 1)`.
///
/// Points whose input lies on or outside the endpoints are ignored.
fn piecewise_linear(u: f32, points: &[(f32, f32)]) -> f32 {
    let interior = points.iter().copied().filter(|(i, _)| *i > 0.0 && *i < 1.0);

    let mut prev = (0.0_f32, 0.0_f32);
    for point in interior.chain(std::iter::once((1.0, 1.0))) {
        if u <= point.0 {
            let span = point.0 - prev.0;
            if span <= f32::EPSILON {
                return point.1;
            }
            let t = (u - prev.0) / span;
            return prev.1 + t * (point.1 - prev.1);
        }
        prev = point;
    }
    1.0
}
