use std::fmt;

/// Sampling kernel used when the overlay volume is resampled onto the base grid.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Interpolation {
    Nearest,
    #[default]
    Linear,
    Cubic,
}

impl fmt::Display for Interpolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Interpolation::Nearest => "nearest",
            Interpolation::Linear => "linear",
            Interpolation::Cubic => "cubic",
        };
        write!(f, "{name}")
    }
}

/// User preference for the alignment path.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ResamplingPreference {
    #[default]
    Auto,
    #[value(name = "force-2d")]
    Force2D,
    #[value(name = "force-3d")]
    Force3D,
}

impl fmt::Display for ResamplingPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResamplingPreference::Auto => "auto",
            ResamplingPreference::Force2D => "force-2d",
            ResamplingPreference::Force3D => "force-3d",
        };
        write!(f, "{name}")
    }
}

/// The alignment path actually used to produce an overlay slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentMode {
    /// Per-slice location matching plus an in-plane transform.
    Fast2D,
    /// Full volume resampling onto the base grid.
    Accurate3D,
}

impl fmt::Display for AlignmentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlignmentMode::Fast2D => write!(f, "fast-2d"),
            AlignmentMode::Accurate3D => write!(f, "accurate-3d"),
        }
    }
}

/// Which signal produced a slice's through-plane ordering key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationSource {
    /// Image position projected onto the slice normal.
    ProjectedPosition,
    /// Patient z coordinate, used when the series normal is degenerate.
    PositionZ,
    /// Declared slice location.
    SliceLocation,
    /// Instance number multiplied by the declared slice thickness.
    InstanceThickness,
}

/// Which tier of the spacing fallback chain produced the through-plane spacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpacingSource {
    NormalProjection,
    EuclideanDistance,
    LocationDifference,
    DeclaredThickness,
}

impl fmt::Display for SpacingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpacingSource::NormalProjection => "normal projection",
            SpacingSource::EuclideanDistance => "euclidean distance",
            SpacingSource::LocationDifference => "location difference",
            SpacingSource::DeclaredThickness => "declared thickness",
        };
        write!(f, "{name}")
    }
}
