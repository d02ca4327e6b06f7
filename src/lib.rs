//! # DICOM-fusion library
//!
//! This crate aligns and color-blends two already-loaded image series of the
//! same patient, typically an anatomical CT or MR series (the base) and a
//! functional PET or SPECT series (the overlay).
//!
//! Alignment is metadata-driven only: every slice carries its patient
//! position, direction cosines and pixel spacing, and both series are assumed
//! to share one patient coordinate system when they share a frame of
//! reference. Two alignment paths exist:
//!  - Fast 2D: pick or interpolate the overlay slice at the base slice's
//!    location, then scale and translate it into the base pixel grid
//!  - Accurate 3D: resample the whole overlay volume onto the base grid once
//!    (nearest, trilinear or Catmull-Rom cubic) and cache the result
//!
//! The path is chosen from the orientation and slice-spacing similarity of
//! the two series and can be overridden by the user. Resampling runs on the
//! rayon pool in the background while frames keep coming from the fast path.
//! DICOM parsing, rendering and any registration beyond the metadata are out
//! of scope; series are handed over as ndarray pixel arrays with their
//! geometry.
//!
//! # Examples
//!
//! ## Fusing two series
//!
//! Build two small axial series and request the fused frame of the first
//! base slice.
//!
//! ```
//! # use dicom_fusion::{FusionSession, FusionSettings, ImageSeries, PixelSpacing, Slice, SliceGeometry};
//! # use ndarray::Array2;
//! # use std::sync::Arc;
//! let series = |uid: &str, value: f32| {
//!     let slices = (0..4)
//!         .map(|z| {
//!             let geometry = SliceGeometry::axial(z as f64, PixelSpacing::isotropic(1.0), "1.2.3");
//!             Slice::new(geometry, Array2::from_elem((8, 8), value))
//!         })
//!         .collect();
//!     ImageSeries::new(uid, slices).map(Arc::new)
//! };
//! let session = FusionSession::new(
//!     series("ct", 40.0)?,
//!     series("pet", 3.5)?,
//!     FusionSettings::default().with_opacity(0.6),
//! )?;
//! let composite = session.get_composite(0)?;
//! assert!(composite.image().is_some());
//! # Ok::<(), dicom_fusion::FusionError>(())
//! ```

pub mod blender;
pub mod colormap;
pub mod enums;
pub mod error;
pub mod geometry;
mod interpolator;
pub mod matcher;
pub mod mode;
pub mod resampler;
pub mod series;
pub mod session;
pub mod volume_builder;

pub use blender::{BlendParams, FusionBlender, WindowLevel};
pub use colormap::ColormapRegistry;
pub use enums::{AlignmentMode, Interpolation, ResamplingPreference};
pub use error::{AlignmentWarning, FusionError, GeometryError, SeriesRole};
pub use geometry::{PixelSpacing, SliceGeometry, VolumeGeometry};
pub use matcher::PixelOffset;
pub use series::{ImageSeries, Rescale, SeriesId, Slice};
pub use session::{AlignmentStatus, Composite, FusionSession, FusionSettings};
