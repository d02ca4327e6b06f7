//! Accurate 3D alignment: resample the whole overlay volume onto the base grid.
//!
//! The transform between the grids is the identity in patient space, so both
//! series are assumed to share one frame of reference. The result is kept in
//! a cache owned by the [`VolumeResampler`] and keyed by
//! (overlay identity, base identity, interpolation method). Base voxels
//! more than half a voxel outside the overlay volume hold [`NO_OVERLAY`];
//! kernel taps past the overlay edge read as zero.

use crate::enums::Interpolation;
use crate::geometry::VolumeGeometry;
use crate::interpolator::Interpolator;
use crate::matcher::NO_OVERLAY;
use crate::series::{ImageSeries, SeriesId};
use crate::volume_builder::BuiltVolume;

use futures::channel::oneshot;
use nalgebra::{Matrix3, Vector3};
use ndarray::{Array3, ArrayView3, Zip};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tracing::{debug, info};
use web_time::Instant;

pub type ResampledVolume = Arc<Array3<f32>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub overlay: SeriesId,
    pub base: SeriesId,
    pub method: Interpolation,
}

/// Everything one resample needs, owned so it can move to a worker thread.
#[derive(Debug, Clone)]
pub struct ResampleRequest {
    pub base: SeriesId,
    pub base_geometry: VolumeGeometry,
    pub overlay: Arc<ImageSeries>,
    pub overlay_volume: Arc<BuiltVolume>,
    pub method: Interpolation,
}

impl ResampleRequest {
    pub fn key(&self) -> CacheKey {
        CacheKey {
            overlay: self.overlay.id(),
            base: self.base,
            method: self.method,
        }
    }
}

/// Resample `overlay_data`, laid out on `overlay`, onto the `base` grid.
///
/// Output has the base shape (slices, rows, columns).
pub fn resample_volume(
    base: &VolumeGeometry,
    overlay: &VolumeGeometry,
    overlay_data: &ArrayView3<f32>,
    method: Interpolation,
) -> Array3<f32> {
    // base index -> overlay continuous index, as one affine map
    let to_overlay = Matrix3::from_diagonal(&overlay.spacing.map(|s| 1.0 / s))
        * overlay.direction.transpose();
    let linear = to_overlay * base.direction * Matrix3::from_diagonal(&base.spacing);
    let translation = to_overlay * (base.origin - overlay.origin);

    let (depth, height, width) = overlay_data.dim();
    let inside = |index: f64, len: usize| index >= -0.5 && index <= len as f64 - 0.5;

    let mut output = Array3::<f32>::zeros(base.shape());
    Zip::indexed(&mut output).par_for_each(|(k, j, i), value| {
        let q = translation + linear * Vector3::new(i as f64, j as f64, k as f64);
        *value = if inside(q.x, width) && inside(q.y, height) && inside(q.z, depth) {
            Interpolator::sample(overlay_data, q.z, q.y, q.x, method)
        } else {
            NO_OVERLAY
        };
    });
    output
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, ResampledVolume>,
    /// Keys with a resample in flight, and who is waiting for them.
    pending: HashMap<CacheKey, Vec<oneshot::Sender<ResampledVolume>>>,
    /// (base, overlay) pair writes are accepted for, once set.
    active: Option<(SeriesId, SeriesId)>,
    /// Bumped on every invalidation; results from an older epoch are dropped.
    epoch: u64,
}

impl CacheState {
    fn accepts(&self, key: &CacheKey, epoch: u64) -> bool {
        epoch == self.epoch
            && self
                .active
                .is_none_or(|(base, overlay)| base == key.base && overlay == key.overlay)
    }

    fn invalidate(&mut self) {
        self.entries.clear();
        // dropping the senders cancels every waiting handle
        self.pending.clear();
        self.epoch += 1;
    }
}

/// Owner of the resampled-volume cache.
///
/// The cache is the only shared mutable state of the fusion engine; every
/// read-check-write and every invalidation happens under one lock, so a
/// reader sees either a complete volume or none.
#[derive(Default)]
pub struct VolumeResampler {
    state: Mutex<CacheState>,
    computations: AtomicUsize,
    discarded: AtomicUsize,
}

impl VolumeResampler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Restrict cache writes to one (base, overlay) pair, dropping everything
    /// cached for any other pair.
    pub fn activate(&self, base: SeriesId, overlay: SeriesId) {
        let mut state = self.lock();
        if state.active != Some((base, overlay)) {
            debug!(%base, %overlay, "Activating series pair");
            state.invalidate();
            state.active = Some((base, overlay));
        }
    }

    /// Drop every cached volume and cancel in-flight resamples.
    pub fn clear(&self) {
        debug!("Clearing resampled volume cache");
        self.lock().invalidate();
    }

    pub fn cached(&self, key: &CacheKey) -> Option<ResampledVolume> {
        self.lock().entries.get(key).cloned()
    }

    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.lock().pending.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of full-volume resamples performed so far.
    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::Relaxed)
    }

    /// Number of finished resamples dropped because the cache moved on.
    pub fn discarded(&self) -> usize {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Resample on the calling thread, served from the cache when possible.
    pub fn resample(&self, request: &ResampleRequest) -> ResampledVolume {
        let key = request.key();
        let epoch = {
            let state = self.lock();
            if let Some(volume) = state.entries.get(&key) {
                debug!(?key, "Resample cache hit");
                return volume.clone();
            }
            state.epoch
        };
        let volume = Arc::new(self.compute(request));
        self.finish(key, epoch, volume)
    }

    /// Resample on the rayon pool. The returned handle resolves to the volume,
    /// or to `None` when the cache was invalidated before the result landed.
    pub fn spawn(self: &Arc<Self>, request: ResampleRequest) -> ResampleHandle {
        let (handle, job) = self.register(request.key());
        if let Some(epoch) = job {
            let resampler = Arc::clone(self);
            rayon::spawn(move || {
                let volume = Arc::new(resampler.compute(&request));
                resampler.finish(request.key(), epoch, volume);
            });
        }
        handle
    }

    /// Register interest in `key`. Returns the epoch to compute under when
    /// the caller is the first to ask and must start the work.
    fn register(&self, key: CacheKey) -> (ResampleHandle, Option<u64>) {
        let mut state = self.lock();
        if let Some(volume) = state.entries.get(&key) {
            debug!(?key, "Resample cache hit");
            return (ResampleHandle::ready(volume.clone()), None);
        }
        let epoch = state.epoch;
        let (sender, receiver) = oneshot::channel();
        let waiters = state.pending.entry(key).or_default();
        let first = waiters.is_empty();
        waiters.push(sender);
        debug!(?key, first, "Resample cache miss");
        (ResampleHandle::waiting(receiver), first.then_some(epoch))
    }

    /// Store a finished volume unless it became stale while computing.
    fn finish(&self, key: CacheKey, epoch: u64, volume: ResampledVolume) -> ResampledVolume {
        let mut state = self.lock();
        if !state.accepts(&key, epoch) {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            debug!(?key, "Discarding stale resample result");
            return volume;
        }
        let volume = state.entries.entry(key).or_insert(volume).clone();
        for waiter in state.pending.remove(&key).unwrap_or_default() {
            let _ = waiter.send(volume.clone());
        }
        volume
    }

    fn compute(&self, request: &ResampleRequest) -> Array3<f32> {
        self.computations.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let stack = request.overlay.stack(&request.overlay_volume.order);
        let volume = resample_volume(
            &request.base_geometry,
            &request.overlay_volume.geometry,
            &stack.view(),
            request.method,
        );
        info!(
            overlay = request.overlay.uid(),
            method = %request.method,
            shape = ?volume.dim(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Resampled overlay volume"
        );
        volume
    }
}

enum HandleState {
    Ready(Option<ResampledVolume>),
    Waiting(oneshot::Receiver<ResampledVolume>),
}

/// Completion of a background resample.
pub struct ResampleHandle {
    state: HandleState,
}

impl ResampleHandle {
    fn ready(volume: ResampledVolume) -> Self {
        Self {
            state: HandleState::Ready(Some(volume)),
        }
    }

    fn waiting(receiver: oneshot::Receiver<ResampledVolume>) -> Self {
        Self {
            state: HandleState::Waiting(receiver),
        }
    }
}

impl Future for ResampleHandle {
    type Output = Option<ResampledVolume>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            HandleState::Ready(volume) => Poll::Ready(volume.take()),
            HandleState::Waiting(receiver) => Pin::new(receiver).poll(cx).map(Result::ok),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{PixelSpacing, SliceGeometry};
    use crate::series::Slice;
    use crate::volume_builder::VolumeGeometryBuilder;
    use ndarray::{Array2, s};
    use rstest::rstest;

    fn series(dim: (usize, usize, usize), spacing: f64, thickness: f64, z0: f64) -> Arc<ImageSeries> {
        let (depth, height, width) = dim;
        let slices = (0..depth)
            .map(|k| {
                let pixels = Array2::from_shape_fn((height, width), |(j, i)| (k * 100 + j * 10 + i) as f32);
                Slice::new(
                    SliceGeometry::axial(z0 + k as f64 * thickness, PixelSpacing::isotropic(spacing), "1.2.3"),
                    pixels,
                )
            })
            .collect();
        Arc::new(ImageSeries::new("series", slices).unwrap())
    }

    fn request(base: &ImageSeries, overlay: &Arc<ImageSeries>, method: Interpolation) -> ResampleRequest {
        let builder = VolumeGeometryBuilder::new();
        ResampleRequest {
            base: base.id(),
            base_geometry: builder.build(base).unwrap().geometry,
            overlay: Arc::clone(overlay),
            overlay_volume: Arc::new(builder.build(overlay).unwrap()),
            method,
        }
    }

    #[rstest]
    #[case(Interpolation::Nearest)]
    #[case(Interpolation::Linear)]
    #[case(Interpolation::Cubic)]
    fn test_identical_grids_reproduce_overlay(#[case] method: Interpolation) {
        let base = series((3, 4, 5), 1.0, 2.0, 0.0);
        let overlay = series((3, 4, 5), 1.0, 2.0, 0.0);
        let req = request(&base, &overlay, method);
        let stack = overlay.stack(&req.overlay_volume.order);
        let result = resample_volume(&req.base_geometry, &req.overlay_volume.geometry, &stack.view(), method);
        assert_eq!(result, stack);
    }

    #[test]
    fn test_shifted_grid_outside_is_no_overlay() {
        let base = series((4, 2, 2), 1.0, 1.0, 0.0);
        let overlay = series((2, 2, 2), 1.0, 1.0, 1.0);
        let req = request(&base, &overlay, Interpolation::Linear);
        let stack = overlay.stack(&req.overlay_volume.order);
        let result = resample_volume(&req.base_geometry, &req.overlay_volume.geometry, &stack.view(), Interpolation::Linear);
        assert_eq!(result.dim(), (4, 2, 2));
        assert!(result.slice(s![0, .., ..]).iter().all(|v| v.is_nan()));
        assert_eq!(result.slice(s![1, .., ..]), stack.slice(s![0, .., ..]));
        assert_eq!(result.slice(s![2, .., ..]), stack.slice(s![1, .., ..]));
        assert!(result.slice(s![3, .., ..]).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_small_overlay_marks_uncovered_pixels() {
        // 2x2 overlay in the corner of a 4x4 base
        let base = series((2, 4, 4), 1.0, 1.0, 0.0);
        let overlay = series((2, 2, 2), 1.0, 1.0, 0.0);
        let req = request(&base, &overlay, Interpolation::Linear);
        let stack = overlay.stack(&req.overlay_volume.order);
        let result = resample_volume(&req.base_geometry, &req.overlay_volume.geometry, &stack.view(), Interpolation::Linear);
        assert_eq!(result.slice(s![.., ..2, ..2]), stack);
        assert!(result[[0, 3, 3]].is_nan());
        assert!(result[[1, 0, 2]].is_nan());
        assert!(result[[1, 2, 0]].is_nan());
    }

    #[test]
    fn test_coarse_overlay_on_fine_base() {
        // overlay at 2 mm in every direction, base at 1 mm
        let base = series((5, 6, 6), 1.0, 1.0, 0.0);
        let overlay = series((3, 3, 3), 2.0, 2.0, 0.0);
        let req = request(&base, &overlay, Interpolation::Linear);
        let stack = overlay.stack(&req.overlay_volume.order);
        let result = resample_volume(&req.base_geometry, &req.overlay_volume.geometry, &stack.view(), Interpolation::Linear);
        assert_eq!(result[[2, 2, 4]], stack[[1, 1, 2]]);
        assert_eq!(result[[1, 0, 0]], (stack[[0, 0, 0]] + stack[[1, 0, 0]]) / 2.0);
    }

    #[rstest]
    #[case(Interpolation::Nearest)]
    #[case(Interpolation::Linear)]
    #[case(Interpolation::Cubic)]
    fn test_resample_is_deterministic(#[case] method: Interpolation) {
        let base = series((4, 5, 5), 0.8, 1.5, 0.3);
        let overlay = series((3, 4, 4), 1.9, 2.5, 0.0);
        let req = request(&base, &overlay, method);
        let stack = overlay.stack(&req.overlay_volume.order);
        let first = resample_volume(&req.base_geometry, &req.overlay_volume.geometry, &stack.view(), method);
        let second = resample_volume(&req.base_geometry, &req.overlay_volume.geometry, &stack.view(), method);
        assert!(first.iter().all(|v| v.is_finite()));
        assert_eq!(first, second);
    }

    #[test]
    fn test_cache_hit_skips_computation() {
        let base = series((3, 4, 4), 1.0, 1.0, 0.0);
        let overlay = series((3, 4, 4), 1.0, 2.0, 0.0);
        let resampler = VolumeResampler::new();
        let req = request(&base, &overlay, Interpolation::Linear);

        let first = resampler.resample(&req);
        let second = resampler.resample(&req);
        assert_eq!(resampler.computations(), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*first, *second);
    }

    #[test]
    fn test_methods_are_cached_separately() {
        let base = series((3, 4, 4), 1.0, 1.0, 0.0);
        let overlay = series((3, 4, 4), 1.0, 2.0, 0.0);
        let resampler = VolumeResampler::new();
        resampler.resample(&request(&base, &overlay, Interpolation::Linear));
        resampler.resample(&request(&base, &overlay, Interpolation::Nearest));
        assert_eq!(resampler.computations(), 2);
        assert_eq!(resampler.len(), 2);
    }

    #[test]
    fn test_clear_forces_recompute() {
        let base = series((3, 4, 4), 1.0, 1.0, 0.0);
        let overlay = series((3, 4, 4), 1.0, 2.0, 0.0);
        let resampler = VolumeResampler::new();
        let req = request(&base, &overlay, Interpolation::Linear);
        let first = resampler.resample(&req);
        resampler.clear();
        assert!(resampler.is_empty());
        let second = resampler.resample(&req);
        assert_eq!(resampler.computations(), 2);
        assert_eq!(*first, *second);
    }

    #[test]
    fn test_activating_new_pair_invalidates() {
        let base = series((3, 4, 4), 1.0, 1.0, 0.0);
        let overlay = series((3, 4, 4), 1.0, 2.0, 0.0);
        let other = series((3, 4, 4), 1.0, 2.0, 0.0);
        let resampler = VolumeResampler::new();
        resampler.activate(base.id(), overlay.id());
        let req = request(&base, &overlay, Interpolation::Linear);
        resampler.resample(&req);
        assert!(resampler.cached(&req.key()).is_some());

        resampler.activate(base.id(), other.id());
        assert!(resampler.cached(&req.key()).is_none());

        // results for the old pair are no longer stored
        resampler.resample(&req);
        assert!(resampler.cached(&req.key()).is_none());
    }

    #[test]
    fn test_stale_epoch_is_rejected() {
        let base = series((2, 2, 2), 1.0, 1.0, 0.0);
        let overlay = series((2, 2, 2), 1.0, 1.0, 0.0);
        let resampler = VolumeResampler::new();
        let key = request(&base, &overlay, Interpolation::Nearest).key();

        let (_handle, epoch) = resampler.register(key);
        let epoch = epoch.unwrap();
        resampler.clear();
        resampler.finish(key, epoch, Arc::new(Array3::zeros((2, 2, 2))));
        assert!(resampler.cached(&key).is_none());
        assert_eq!(resampler.discarded(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_cancelled_handle_resolves_to_none() {
        let base = series((2, 2, 2), 1.0, 1.0, 0.0);
        let overlay = series((2, 2, 2), 1.0, 1.0, 0.0);
        let resampler = VolumeResampler::new();
        let key = request(&base, &overlay, Interpolation::Nearest).key();

        let (handle, _) = resampler.register(key);
        resampler.clear();
        assert!(handle.await.is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_background_resample_populates_cache() {
        let base = series((3, 4, 4), 1.0, 1.0, 0.0);
        let overlay = series((3, 4, 4), 1.0, 2.0, 0.0);
        let resampler = Arc::new(VolumeResampler::new());
        let req = request(&base, &overlay, Interpolation::Cubic);

        let first = resampler.spawn(req.clone());
        let also_first = resampler.spawn(req.clone());
        let volume = first.await.unwrap();
        let shared = also_first.await.unwrap();
        assert!(Arc::ptr_eq(&volume, &shared));

        let cached = resampler.spawn(req.clone()).await.unwrap();
        assert!(Arc::ptr_eq(&volume, &cached));
        assert_eq!(resampler.computations(), 1);
        assert_eq!(*volume, *resampler.resample(&req));
    }
}
