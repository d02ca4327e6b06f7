use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dicom_fusion::{
    Composite, FusionError, FusionSession, FusionSettings, ImageSeries, Interpolation, PixelSpacing,
    ResamplingPreference, Rescale, Slice, SliceGeometry, WindowLevel,
};
use nalgebra::Vector3;
use ndarray::Array2;
use thiserror::Error;
use tracing::{Level, error, info, warn};

const FRAME_OF_REFERENCE: &str = "1.2.826.0.1.3680043.2.1125.1";

#[derive(Debug, Error)]
enum DemoError {
    #[error(transparent)]
    Fusion(#[from] FusionError),

    #[error("Could not write {}: {source}", path.display())]
    Save {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

#[derive(Parser, Debug)]
#[command(author = "David Peherstorfer", version = env!("CARGO_PKG_VERSION"), about = "Fuse a synthetic CT/PET phantom pair into a PNG", long_about = None)]
struct Args {
    #[arg(help = "Output PNG path", default_value = "fusion.png")]
    output: PathBuf,

    #[arg(help = "Overlay opacity in [0, 1]", long = "opacity", short = 'o', default_value_t = 0.5)]
    opacity: f32,

    #[arg(
        help = "Normalized overlay values below this are not blended",
        long = "threshold",
        short = 't',
        default_value_t = 0.1
    )]
    threshold: f32,

    #[arg(help = "Overlay colormap", long = "colormap", short = 'c', default_value = "hot")]
    colormap: String,

    #[arg(
        help = "Alignment mode preference",
        long = "mode",
        short = 'm',
        value_enum,
        default_value_t = ResamplingPreference::Auto
    )]
    mode: ResamplingPreference,

    #[arg(
        help = "Interpolation for 3D resampling",
        long = "interpolation",
        short = 'i',
        value_enum,
        default_value_t = Interpolation::Linear
    )]
    interpolation: Interpolation,

    #[arg(help = "Base slice index, defaults to the centre slice", long = "slice", short = 's')]
    slice: Option<usize>,

    #[arg(help = "Log level", long = "log-level", default_value_t = Level::INFO)]
    log_level: Level,
}

/// Body ellipse with a denser spine, in Hounsfield units.
fn ct_phantom() -> Result<ImageSeries, FusionError> {
    let (rows, columns) = (128, 128);
    let spacing = PixelSpacing::isotropic(2.0);
    let slices = (0..48)
        .map(|k| {
            let z = k as f64 * 2.0;
            let pixels = Array2::from_shape_fn((rows, columns), |(r, c)| {
                let x = (c as f32 - 64.0) / 52.0;
                let y = (r as f32 - 64.0) / 40.0;
                let spine = ((c as f32 - 64.0).powi(2) + (r as f32 - 92.0).powi(2)).sqrt() < 8.0;
                match (x * x + y * y <= 1.0, spine) {
                    (_, true) => 700.0,
                    (true, false) => 40.0,
                    (false, false) => -1000.0,
                }
            });
            let geometry = SliceGeometry::new(
                Some(Vector3::new(-128.0, -128.0, z)),
                Vector3::x(),
                Vector3::y(),
                spacing,
                FRAME_OF_REFERENCE,
            )
            .with_slice_thickness(2.0)
            .with_instance_number(k + 1);
            Slice::new(geometry, pixels)
        })
        .collect();
    ImageSeries::new("ct-phantom", slices)
}

/// Coarser grid with an uptake hotspot, stored as scaled integers.
fn pet_phantom() -> Result<ImageSeries, FusionError> {
    let (rows, columns) = (64, 64);
    let spacing = PixelSpacing::isotropic(4.0);
    let slices = (0..16)
        .map(|k| {
            let z = k as f64 * 6.0;
            let pixels = Array2::from_shape_fn((rows, columns), |(r, c)| {
                let dx = (c as f32 - 40.0) * 4.0;
                let dy = (r as f32 - 28.0) * 4.0;
                let dz = z as f32 - 48.0;
                let d2 = dx * dx + dy * dy + dz * dz;
                (1000.0 * (-d2 / 400.0).exp() + 50.0).round()
            });
            let geometry = SliceGeometry::new(
                Some(Vector3::new(-128.0, -128.0, z)),
                Vector3::x(),
                Vector3::y(),
                spacing,
                FRAME_OF_REFERENCE,
            )
            .with_slice_thickness(6.0);
            Slice::new(geometry, pixels).with_rescale(Rescale::new(0.01, 0.0))
        })
        .collect();
    ImageSeries::new("pet-phantom", slices)
}

async fn run(args: Args) -> Result<(), DemoError> {
    let base = Arc::new(ct_phantom()?);
    let overlay = Arc::new(pet_phantom()?);

    let settings = FusionSettings::default()
        .with_opacity(args.opacity)
        .with_threshold(args.threshold)
        .with_colormap(args.colormap)
        .with_preference(args.mode)
        .with_interpolation(args.interpolation)
        .with_base_window(WindowLevel::new(400.0, 40.0));
    let session = FusionSession::new(base, overlay, settings)?;

    let status = session.get_alignment_status();
    info!(mode = %status.mode, reason = status.reason.as_str(), "Alignment");
    for warning in &status.warnings {
        warn!("{warning}");
    }

    // wait for the resampled volume so the frame comes from the selected path
    session.ready().await;

    let index = args.slice.unwrap_or(session.len() / 2);
    let image = match session.get_composite(index)? {
        Composite::Fused { image, mode } => {
            info!(index, %mode, "Fused slice");
            image
        }
        Composite::NoOverlay => {
            warn!(index, "No overlay at this slice, writing the base image");
            match session.base_image(index) {
                Some(image) => image,
                None => return Ok(()),
            }
        }
    };
    image.save(&args.output).map_err(|source| DemoError::Save {
        path: args.output.clone(),
        source,
    })?;
    info!(path = %args.output.display(), "Wrote fused slice");
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    if let Err(e) = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(args.log_level)
            .finish(),
    ) {
        eprintln!("[ERROR] Could not set up global logging subscriber: {e}");
    }

    if let Err(e) = run(args).await {
        error!("{e}");
        std::process::exit(1);
    }
}
