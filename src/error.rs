use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryError {
    #[error("No slice of {total} carries a usable position signal")]
    NoPositionedSlices { total: usize },

    #[error("Through-plane spacing could not be determined")]
    NoThroughPlaneSpacing,

    #[error("In-plane direction cosines are degenerate")]
    DegenerateOrientation,

    #[error("Invalid pixel spacing: row {row}, column {column}")]
    InvalidPixelSpacing { row: f64, column: f64 },
}

#[derive(Debug, Error)]
pub enum FusionError {
    #[error("Geometry of the {series} series is unusable: {source}")]
    Geometry {
        series: SeriesRole,
        #[source]
        source: GeometryError,
    },

    #[error("Array shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Image series contains no slices")]
    EmptySeries,

    #[error("Inconsistent image dimensions at slice {index}: expected {expected:?}, found {found:?}")]
    InconsistentDimensions {
        index: usize,
        expected: (usize, usize),
        found: (usize, usize),
    },
}

/// Which side of the fusion a series plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesRole {
    Base,
    Overlay,
}

impl fmt::Display for SeriesRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeriesRole::Base => write!(f, "base"),
            SeriesRole::Overlay => write!(f, "overlay"),
        }
    }
}

/// Non-fatal conditions surfaced to the display layer as status text.
#[derive(Debug, Clone, PartialEq)]
pub enum AlignmentWarning {
    /// The series claim different frames of reference but are resampled with
    /// an identity transform anyway.
    FrameOfReferenceMismatch { base: String, overlay: String },
    /// The fast path was forced although the geometry calls for resampling.
    ForcedFastPathDivergence { reason: String },
    /// Slices without any position signal were left out of the volume.
    DroppedSlices { series: SeriesRole, count: usize },
}

impl fmt::Display for AlignmentWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlignmentWarning::FrameOfReferenceMismatch { base, overlay } => write!(
                f,
                "frame of reference mismatch (base {base}, overlay {overlay}); alignment assumes a shared patient space"
            ),
            AlignmentWarning::ForcedFastPathDivergence { reason } => {
                write!(f, "fast 2D path forced despite {reason}")
            }
            AlignmentWarning::DroppedSlices { series, count } => {
                write!(f, "{count} {series} slice(s) without position were dropped")
            }
        }
    }
}
