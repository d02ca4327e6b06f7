//! Per-frame orchestration of one base/overlay fusion.
//!
//! A [`FusionSession`] owns the derived geometry of both series, the current
//! alignment decision and the resampled-volume cache. The display layer calls
//! [`FusionSession::get_composite`] on every navigation event.

use crate::blender::{BlendParams, FusionBlender, WindowLevel};
use crate::colormap::DEFAULT_COLORMAP;
use crate::enums::{AlignmentMode, Interpolation, ResamplingPreference};
use crate::error::{AlignmentWarning, FusionError, SeriesRole};
use crate::geometry::VolumeGeometry;
use crate::matcher::{DEFAULT_MATCH_TOLERANCE, InPlaneTransform, PixelOffset, SpatialMatcher};
use crate::mode::{ModeDecision, ResamplingModeSelector};
use crate::resampler::{CacheKey, ResampleRequest, ResampledVolume, VolumeResampler};
use crate::series::{ImageSeries, Slice};
use crate::volume_builder::{BuiltVolume, VolumeGeometryBuilder};

use image::RgbImage;
use nalgebra::Vector3;
use ndarray::{Array2, Axis};
use std::sync::Arc;
use tracing::{debug, warn};

const DEFAULT_OPACITY: f32 = 0.5;
const DEFAULT_THRESHOLD: f32 = 0.0;

/// Half a voxel either side of the first and last overlay slice counts as covered.
const COVERAGE_MARGIN: f64 = 0.5;

fn clamp_unit(value: f32, default: f32) -> f32 {
    if value.is_finite() { value.clamp(0.0, 1.0) } else { default }
}

/// User-facing fusion parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct FusionSettings {
    pub opacity: f32,
    pub threshold: f32,
    pub colormap: String,
    /// Overlay window; derived from the overlay's data range when `None`.
    pub overlay_window: Option<WindowLevel>,
    /// Base window; derived from each base slice when `None`.
    pub base_window: Option<WindowLevel>,
    pub preference: ResamplingPreference,
    pub interpolation: Interpolation,
    /// Replaces the translation computed from slice positions.
    pub manual_offset: Option<PixelOffset>,
    /// Resample on a worker and serve the 2D path meanwhile.
    pub background_resample: bool,
    pub tolerance: f64,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self {
            opacity: DEFAULT_OPACITY,
            threshold: DEFAULT_THRESHOLD,
            colormap: DEFAULT_COLORMAP.to_string(),
            overlay_window: None,
            base_window: None,
            preference: ResamplingPreference::Auto,
            interpolation: Interpolation::Linear,
            manual_offset: None,
            background_resample: true,
            tolerance: DEFAULT_MATCH_TOLERANCE,
        }
    }
}

impl FusionSettings {
    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.opacity = clamp_unit(opacity, DEFAULT_OPACITY);
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = clamp_unit(threshold, DEFAULT_THRESHOLD);
        self
    }

    pub fn with_colormap(mut self, colormap: impl Into<String>) -> Self {
        self.colormap = colormap.into();
        self
    }

    pub fn with_overlay_window(mut self, window: WindowLevel) -> Self {
        self.overlay_window = Some(window);
        self
    }

    pub fn with_base_window(mut self, window: WindowLevel) -> Self {
        self.base_window = Some(window);
        self
    }

    pub fn with_preference(mut self, preference: ResamplingPreference) -> Self {
        self.preference = preference;
        self
    }

    pub fn with_interpolation(mut self, interpolation: Interpolation) -> Self {
        self.interpolation = interpolation;
        self
    }

    pub fn with_manual_offset(mut self, offset: PixelOffset) -> Self {
        self.manual_offset = Some(offset);
        self
    }

    pub fn with_background_resample(mut self, background: bool) -> Self {
        self.background_resample = background;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        if tolerance.is_finite() && tolerance >= 0.0 {
            self.tolerance = tolerance;
        }
        self
    }
}

/// One rendered frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Composite {
    Fused { image: RgbImage, mode: AlignmentMode },
    /// No overlay data at this base slice; show the base image alone.
    NoOverlay,
}

impl Composite {
    pub fn image(&self) -> Option<&RgbImage> {
        match self {
            Composite::Fused { image, .. } => Some(image),
            Composite::NoOverlay => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentStatus {
    pub mode: AlignmentMode,
    pub reason: String,
    pub frame_of_reference_mismatch: bool,
    pub warnings: Vec<AlignmentWarning>,
    /// A 3D resample is in flight; frames come from the 2D path until it lands.
    pub resample_pending: bool,
}

/// Geometry and decision derived from a (base, overlay) pair
struct Derived {
    base_volume: Arc<BuiltVolume>,
    overlay_volume: Arc<BuiltVolume>,
    decision: ModeDecision,
    auto_overlay_window: Option<WindowLevel>,
}

pub struct FusionSession {
    base: Arc<ImageSeries>,
    overlay: Arc<ImageSeries>,
    settings: FusionSettings,
    builder: VolumeGeometryBuilder,
    derived: Derived,
    resampler: Arc<VolumeResampler>,
    blender: FusionBlender,
}

impl FusionSession {
    /// Build a session for `base` and `overlay`
    ///
    /// # Errors
    ///
    /// Returns an error if either series has no usable geometry
    pub fn new(
        base: Arc<ImageSeries>,
        overlay: Arc<ImageSeries>,
        settings: FusionSettings,
    ) -> Result<Self, FusionError> {
        Self::with_resampler(base, overlay, settings, Arc::new(VolumeResampler::new()))
    }

    /// Like [`FusionSession::new`] but sharing an existing resampler.
    pub fn with_resampler(
        base: Arc<ImageSeries>,
        overlay: Arc<ImageSeries>,
        settings: FusionSettings,
        resampler: Arc<VolumeResampler>,
    ) -> Result<Self, FusionError> {
        let builder = VolumeGeometryBuilder::new();
        let derived = Self::derive(&builder, &base, &overlay, settings.preference)?;
        resampler.activate(base.id(), overlay.id());
        Ok(Self {
            base,
            overlay,
            settings,
            builder,
            derived,
            resampler,
            blender: FusionBlender::default(),
        })
    }

    fn derive(
        builder: &VolumeGeometryBuilder,
        base: &ImageSeries,
        overlay: &ImageSeries,
        preference: ResamplingPreference,
    ) -> Result<Derived, FusionError> {
        let base_volume = builder.build(base).map_err(|source| FusionError::Geometry {
            series: SeriesRole::Base,
            source,
        })?;
        let overlay_volume = builder.build(overlay).map_err(|source| FusionError::Geometry {
            series: SeriesRole::Overlay,
            source,
        })?;
        if base.frame_of_reference() != overlay.frame_of_reference() {
            warn!(
                base = base.frame_of_reference(),
                overlay = overlay.frame_of_reference(),
                "Series claim different frames of reference"
            );
        }
        let decision =
            ResamplingModeSelector::select(&base_volume.geometry, &overlay_volume.geometry, preference);
        let auto_overlay_window = overlay
            .value_range()
            .map(|(min, max)| WindowLevel::from_range(min, max));
        Ok(Derived {
            base_volume: Arc::new(base_volume),
            overlay_volume: Arc::new(overlay_volume),
            decision,
            auto_overlay_window,
        })
    }

    pub fn base(&self) -> &Arc<ImageSeries> {
        &self.base
    }

    pub fn overlay(&self) -> &Arc<ImageSeries> {
        &self.overlay
    }

    pub fn settings(&self) -> &FusionSettings {
        &self.settings
    }

    pub fn base_volume(&self) -> &BuiltVolume {
        &self.derived.base_volume
    }

    pub fn overlay_volume(&self) -> &BuiltVolume {
        &self.derived.overlay_volume
    }

    pub fn decision(&self) -> &ModeDecision {
        &self.derived.decision
    }

    pub fn resampler(&self) -> &Arc<VolumeResampler> {
        &self.resampler
    }

    pub fn blender_mut(&mut self) -> &mut FusionBlender {
        &mut self.blender
    }

    /// Number of navigable base slices.
    pub fn len(&self) -> usize {
        self.derived.base_volume.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_opacity(&mut self, opacity: f32) {
        self.settings.opacity = clamp_unit(opacity, DEFAULT_OPACITY);
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.settings.threshold = clamp_unit(threshold, DEFAULT_THRESHOLD);
    }

    pub fn set_colormap(&mut self, colormap: impl Into<String>) {
        self.settings.colormap = colormap.into();
    }

    pub fn set_overlay_window(&mut self, window: Option<WindowLevel>) {
        self.settings.overlay_window = window;
    }

    pub fn set_base_window(&mut self, window: Option<WindowLevel>) {
        self.settings.base_window = window;
    }

    pub fn set_manual_offset(&mut self, offset: Option<PixelOffset>) {
        self.settings.manual_offset = offset;
    }

    pub fn set_interpolation(&mut self, interpolation: Interpolation) {
        self.settings.interpolation = interpolation;
    }

    pub fn set_background_resample(&mut self, background: bool) {
        self.settings.background_resample = background;
    }

    /// Change the mode preference and re-run mode selection.
    pub fn set_preference(&mut self, preference: ResamplingPreference) {
        self.settings.preference = preference;
        self.derived.decision = ResamplingModeSelector::select(
            &self.derived.base_volume.geometry,
            &self.derived.overlay_volume.geometry,
            preference,
        );
    }

    /// Replace one of the two series. The session is left untouched when the
    /// new series has no usable geometry.
    ///
    /// # Errors
    ///
    /// Returns an error if geometry cannot be built for the new pair
    pub fn set_series(&mut self, role: SeriesRole, series: Arc<ImageSeries>) -> Result<(), FusionError> {
        let (base, overlay) = match role {
            SeriesRole::Base => (series, Arc::clone(&self.overlay)),
            SeriesRole::Overlay => (Arc::clone(&self.base), series),
        };
        self.derived = Self::derive(&self.builder, &base, &overlay, self.settings.preference)?;
        debug!(%role, base = base.uid(), overlay = overlay.uid(), "Replaced series");
        self.base = base;
        self.overlay = overlay;
        self.resampler.clear();
        self.resampler.activate(self.base.id(), self.overlay.id());
        Ok(())
    }

    /// Rebuild geometry for the current pair and drop every resampled volume.
    ///
    /// # Errors
    ///
    /// Returns an error if either series has no usable geometry
    pub fn invalidate(&mut self) -> Result<(), FusionError> {
        self.resampler.clear();
        self.derived = Self::derive(&self.builder, &self.base, &self.overlay, self.settings.preference)?;
        self.resampler.activate(self.base.id(), self.overlay.id());
        Ok(())
    }

    pub fn get_alignment_status(&self) -> AlignmentStatus {
        let decision = &self.derived.decision;
        let resample_pending =
            decision.mode == AlignmentMode::Accurate3D && self.resampler.is_pending(&self.cache_key());
        AlignmentStatus {
            mode: decision.mode,
            reason: decision.reason.clone(),
            frame_of_reference_mismatch: self.frame_of_reference_mismatch(),
            warnings: self.warnings(),
            resample_pending,
        }
    }

    fn frame_of_reference_mismatch(&self) -> bool {
        self.base.frame_of_reference() != self.overlay.frame_of_reference()
    }

    fn warnings(&self) -> Vec<AlignmentWarning> {
        let mut warnings = Vec::new();
        for (series, volume) in [
            (SeriesRole::Base, &self.derived.base_volume),
            (SeriesRole::Overlay, &self.derived.overlay_volume),
        ] {
            if volume.dropped > 0 {
                warnings.push(AlignmentWarning::DroppedSlices {
                    series,
                    count: volume.dropped,
                });
            }
        }
        if self.frame_of_reference_mismatch() {
            warnings.push(AlignmentWarning::FrameOfReferenceMismatch {
                base: self.base.frame_of_reference().to_string(),
                overlay: self.overlay.frame_of_reference().to_string(),
            });
        }
        if self.derived.decision.is_forced_against_geometry() {
            warnings.push(AlignmentWarning::ForcedFastPathDivergence {
                reason: self.derived.decision.recommended_reason.clone(),
            });
        }
        warnings
    }

    fn cache_key(&self) -> CacheKey {
        CacheKey {
            overlay: self.overlay.id(),
            base: self.base.id(),
            method: self.settings.interpolation,
        }
    }

    fn resample_request(&self) -> ResampleRequest {
        ResampleRequest {
            base: self.base.id(),
            base_geometry: self.derived.base_volume.geometry.clone(),
            overlay: Arc::clone(&self.overlay),
            overlay_volume: Arc::clone(&self.derived.overlay_volume),
            method: self.settings.interpolation,
        }
    }

    /// Wait for the resampled overlay volume of the current settings.
    ///
    /// Starts the resample if nothing is in flight. Resolves to `None` on
    /// the fast path, or when the cache was invalidated in the meantime.
    pub async fn ready(&self) -> Option<ResampledVolume> {
        if self.derived.decision.mode != AlignmentMode::Accurate3D {
            return None;
        }
        self.resampler.spawn(self.resample_request()).await
    }

    fn base_slice(&self, index: usize) -> Option<&Slice> {
        let &slice = self.derived.base_volume.order.get(index)?;
        self.base.slices().get(slice)
    }

    /// Base slice at `index` normalized for display
    fn base_display(&self, slice: &Slice) -> Array2<f32> {
        let pixels = slice.pixels.view();
        match self
            .settings
            .base_window
            .or_else(|| WindowLevel::from_values(&pixels))
        {
            Some(window) => window.normalize_slice(&pixels),
            None => Array2::zeros(pixels.dim()),
        }
    }

    /// Unblended base image at `index`.
    pub fn base_image(&self, index: usize) -> Option<RgbImage> {
        let slice = self.base_slice(index)?;
        Some(FusionBlender::grayscale(&self.base_display(slice).view()))
    }

    fn blend_params(&self) -> BlendParams {
        BlendParams {
            opacity: self.settings.opacity,
            threshold: self.settings.threshold,
            colormap: self.settings.colormap.clone(),
            window: self
                .settings
                .overlay_window
                .or(self.derived.auto_overlay_window)
                .unwrap_or(WindowLevel::new(0.0, 0.0)),
        }
    }

    /// Fused frame for the base slice at sorted position `index`
    ///
    /// # Errors
    ///
    /// Returns an error if aligned arrays disagree in shape, which indicates
    /// inconsistent series rather than bad user input
    pub fn get_composite(&self, index: usize) -> Result<Composite, FusionError> {
        let Some(slice) = self.base_slice(index) else {
            debug!(index, "Base slice index out of range");
            return Ok(Composite::NoOverlay);
        };

        let mode = self.derived.decision.mode;
        let (aligned, mode) = match mode {
            AlignmentMode::Fast2D => (self.align_2d(index, slice)?, AlignmentMode::Fast2D),
            AlignmentMode::Accurate3D => match self.resampled_volume() {
                Some(volume) => (self.align_3d(index, &volume), AlignmentMode::Accurate3D),
                None => (self.align_2d(index, slice)?, AlignmentMode::Fast2D),
            },
        };
        let Some(aligned) = aligned else {
            return Ok(Composite::NoOverlay);
        };

        let base = self.base_display(slice);
        let image = self
            .blender
            .blend(&base.view(), &aligned.view(), &self.blend_params())?;
        Ok(Composite::Fused { image, mode })
    }

    /// The cached volume, computing it inline when background resampling is
    /// off. `None` while a background resample is still running.
    fn resampled_volume(&self) -> Option<ResampledVolume> {
        let key = self.cache_key();
        if let Some(volume) = self.resampler.cached(&key) {
            return Some(volume);
        }
        if !self.settings.background_resample {
            return Some(self.resampler.resample(&self.resample_request()));
        }
        if !self.resampler.is_pending(&key) {
            // the handle is dropped; the result still lands in the cache
            drop(self.resampler.spawn(self.resample_request()));
        }
        None
    }

    fn align_2d(&self, index: usize, slice: &Slice) -> Result<Option<Array2<f32>>, FusionError> {
        let location = self.derived.base_volume.locations[index];
        let matcher = SpatialMatcher::new(self.settings.tolerance);
        let Some(matched) = matcher.match_slice(location, &self.overlay, &self.derived.overlay_volume)? else {
            return Ok(None);
        };
        let mut transform = InPlaneTransform::between(&slice.geometry, matched.geometry);
        if let Some(offset) = self.settings.manual_offset {
            transform = transform.with_offset(offset);
        }
        Ok(Some(transform.apply(&matched.pixels.view(), slice.dim())))
    }

    fn align_3d(&self, index: usize, volume: &ResampledVolume) -> Option<Array2<f32>> {
        if index >= volume.len_of(Axis(0))
            || !covers(
                &self.derived.base_volume.geometry,
                &self.derived.overlay_volume.geometry,
                index,
            )
        {
            return None;
        }
        Some(volume.index_axis(Axis(0), index).to_owned())
    }
}

/// Whether the centre of base slice `index` falls inside the overlay volume
/// along the overlay's through-plane axis.
fn covers(base: &VolumeGeometry, overlay: &VolumeGeometry, index: usize) -> bool {
    let (columns, rows, _) = base.dimensions;
    let centre = Vector3::new(
        columns.saturating_sub(1) as f64 / 2.0,
        rows.saturating_sub(1) as f64 / 2.0,
        index as f64,
    );
    let k = overlay.physical_to_index(&base.index_to_physical(&centre)).z;
    let depth = overlay.dimensions.2 as f64;
    k.is_finite() && k >= -COVERAGE_MARGIN && k <= depth - 1.0 + COVERAGE_MARGIN
}
