use crate::enums::{AlignmentMode, ResamplingPreference};
use crate::geometry::VolumeGeometry;

use tracing::info;

/// The fast path needs direction matrices closer than this, entry by entry.
pub const ORIENTATION_DIVERGENCE_LIMIT: f64 = 0.1;

/// The fast path needs through-plane spacings within this ratio.
pub const SPACING_RATIO_LIMIT: f64 = 2.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ModeDecision {
    pub mode: AlignmentMode,
    /// Why `mode` was chosen, for display.
    pub reason: String,
    /// What the geometry alone calls for, regardless of user preference.
    pub recommended: AlignmentMode,
    pub recommended_reason: String,
    pub orientation_divergence: f64,
    pub spacing_ratio: f64,
}

impl ModeDecision {
    /// The user forced the fast path although the geometry calls for resampling.
    pub fn is_forced_against_geometry(&self) -> bool {
        self.mode == AlignmentMode::Fast2D && self.recommended == AlignmentMode::Accurate3D
    }
}

pub struct ResamplingModeSelector;

impl ResamplingModeSelector {
    /// Choose between the fast 2D and the accurate 3D path.
    ///
    /// Pure in its inputs; callers re-run it whenever either series changes.
    pub fn select(
        base: &VolumeGeometry,
        overlay: &VolumeGeometry,
        preference: ResamplingPreference,
    ) -> ModeDecision {
        let orientation_divergence = orientation_divergence(base, overlay);
        let spacing_ratio = spacing_ratio(base, overlay);

        let mut problems = Vec::new();
        if !(orientation_divergence < ORIENTATION_DIVERGENCE_LIMIT) {
            problems.push("different orientation detected".to_string());
        }
        if !(spacing_ratio < SPACING_RATIO_LIMIT) {
            problems.push(format!("slice thickness ratio {}", format_ratio(spacing_ratio)));
        }
        let (recommended, recommended_reason) = if problems.is_empty() {
            (
                AlignmentMode::Fast2D,
                "matching orientation and slice spacing".to_string(),
            )
        } else {
            (AlignmentMode::Accurate3D, problems.join(", "))
        };

        let (mode, reason) = match preference {
            ResamplingPreference::Auto => (recommended, recommended_reason.clone()),
            ResamplingPreference::Force2D => (AlignmentMode::Fast2D, "user override".to_string()),
            ResamplingPreference::Force3D => {
                (AlignmentMode::Accurate3D, "user override".to_string())
            }
        };
        info!(
            %mode,
            %preference,
            orientation_divergence,
            spacing_ratio,
            reason = recommended_reason.as_str(),
            "Selected alignment mode"
        );

        ModeDecision {
            mode,
            reason,
            recommended,
            recommended_reason,
            orientation_divergence,
            spacing_ratio,
        }
    }
}

/// Largest absolute difference between corresponding direction-matrix entries.
pub fn orientation_divergence(base: &VolumeGeometry, overlay: &VolumeGeometry) -> f64 {
    (base.direction - overlay.direction).amax()
}

/// Ratio of the through-plane spacings, folded to be at least 1.
pub fn spacing_ratio(base: &VolumeGeometry, overlay: &VolumeGeometry) -> f64 {
    let ratio = overlay.slice_spacing() / base.slice_spacing();
    if !ratio.is_finite() || ratio <= 0.0 {
        return f64::INFINITY;
    }
    if ratio < 1.0 { 1.0 / ratio } else { ratio }
}

fn format_ratio(ratio: f64) -> String {
    if !ratio.is_finite() {
        return "undefined".to_string();
    }
    if (ratio - ratio.round()).abs() < 0.05 {
        format!("{}:1", ratio.round() as u64)
    } else {
        format!("{ratio:.1}:1")
    }
}
