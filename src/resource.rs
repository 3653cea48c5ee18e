//! An [ImageResource] represents one loadable image in the viewer: it
//! orchestrates cache lookup, single-flight decoding and out-of-memory
//! recovery, and carries the calibration metadata that is independent of
//! cache state.
//!
//! Loading is lazy and exactly-once-in-flight per resource.  The first
//! caller to move the resource from `Idle` to `Loading` submits a decode
//! task and blocks for its result; concurrent callers observe the
//! in-flight load and report absent for this attempt rather than piling
//! up behind the single decode worker.  A decode failure is terminal: the
//! resource flips unreadable and no further task is ever submitted for it.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use crate::decoded::DecodedImage;
use crate::load_task::LoadTask;
use crate::scheduler::{DecodeScheduler, TaskError};
use crate::soft_cache::{EvictionListener, SoftCache};
use crate::traits::{LoadError, LutShape, MediaReader, RenderOptions, RenderParams, Renderer};

/// Process-unique identity of one resource.
///
/// Identity semantics are deliberate: two resources describing the same
/// underlying bytes are still distinct cache keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(u64);

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(0);

impl ResourceId {
    fn next() -> ResourceId {
        ResourceId(NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// The decoded-image cache shared by the resources of one viewer.
pub type ImageCache = SoftCache<ResourceId, DecodedImage>;

/// Physical spacing unit of a pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Unit {
    #[default]
    Pixel,
    Micrometer,
    Millimeter,
    Centimeter,
    Meter,
}

impl Unit {
    pub fn abbreviation(&self) -> &'static str {
        match self {
            Unit::Pixel => "pix",
            Unit::Micrometer => "um",
            Unit::Millimeter => "mm",
            Unit::Centimeter => "cm",
            Unit::Meter => "m",
        }
    }
}

/// Retry behavior after an allocation failure.
#[derive(Debug, Clone, derive_builder::Builder)]
pub struct LoadPolicy {
    /// Pause between compacting the cache and the single retry, giving
    /// freed buffers time to actually return to the allocator.
    #[builder(default = "Duration::from_millis(100)")]
    pub oom_backoff: Duration,
}

impl Default for LoadPolicy {
    fn default() -> Self {
        LoadPolicy {
            oom_backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct PixelStats {
    min: f32,
    max: f32,
}

/// State shared between the resource, its queued load tasks and the
/// cache's eviction callback.
pub(crate) struct ResourceState<R: MediaReader> {
    reader: Arc<R>,
    /// Sticky failure flag: once a decode fails terminally this goes
    /// false and the resource never submits another task.
    readable: AtomicBool,
    /// Idle/Loading.  Entered only through compare-and-swap, which is
    /// what makes at-most-one-task-in-flight hold per resource.
    loading: AtomicBool,
    cached: AtomicBool,
    /// Min/max pixel values.  Both stay at the zero sentinel until the
    /// first successful computation and are never recomputed, even if the
    /// cached image is evicted and decoded again.
    stats: Mutex<PixelStats>,
}

impl<R: MediaReader> ResourceState<R> {
    pub(crate) fn reader(&self) -> &R {
        &self.reader
    }

    fn close_reader(&self) {
        if let Err(e) = self.reader.close() {
            log::warn!("failed to close media stream: {}", e);
        }
    }

    /// Memoized statistics computation, called from the decode worker.
    ///
    /// Byte-depth images skip the scan and use the fixed [0, 255] range;
    /// other depths take the rounded global extrema across all bands.
    pub(crate) fn find_min_max(&self, img: &DecodedImage) {
        let mut stats = self.stats.lock().unwrap();
        if stats.min != 0.0 || stats.max != 0.0 {
            return;
        }
        if img.is_byte_depth() {
            *stats = PixelStats {
                min: 0.0,
                max: 255.0,
            };
            return;
        }
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for (lo, hi) in img.band_extrema() {
            min = min.min(lo);
            max = max.max(hi);
        }
        if min.is_finite() && max.is_finite() {
            *stats = PixelStats {
                min: min.round() as f32,
                max: max.round() as f32,
            };
        }
    }
}

impl<R: MediaReader> EvictionListener for ResourceState<R> {
    fn evicted(&self) {
        self.cached.store(false, Ordering::Release);
        self.close_reader();
    }
}

pub struct ImageResource<R: MediaReader> {
    id: ResourceId,
    state: Arc<ResourceState<R>>,
    cache: Arc<ImageCache>,
    scheduler: Arc<DecodeScheduler>,
    policy: LoadPolicy,
    pixel_size_x: f64,
    pixel_size_y: f64,
    pixel_spacing_unit: Unit,
    pixel_value_unit: Option<String>,
    calibration_description: Option<String>,
}

impl<R: MediaReader> ImageResource<R> {
    pub fn new(reader: R, cache: Arc<ImageCache>, scheduler: Arc<DecodeScheduler>) -> ImageResource<R> {
        ImageResource {
            id: ResourceId::next(),
            state: Arc::new(ResourceState {
                reader: Arc::new(reader),
                readable: AtomicBool::new(true),
                loading: AtomicBool::new(false),
                cached: AtomicBool::new(false),
                stats: Mutex::new(PixelStats::default()),
            }),
            cache,
            scheduler,
            policy: LoadPolicy::default(),
            pixel_size_x: 1.0,
            pixel_size_y: 1.0,
            pixel_spacing_unit: Unit::Pixel,
            pixel_value_unit: None,
            calibration_description: None,
        }
    }

    pub fn with_load_policy(mut self, policy: LoadPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Top-level load entry point.
    ///
    /// A large decode can fail transiently while reclaimable cache
    /// entries still hold memory, so an allocation failure gets one
    /// bounded recovery attempt: compact the cache, pause briefly, try
    /// again.  A second allocation failure propagates to the caller; all
    /// other failures are absorbed into state flags and `Ok(None)`.
    pub fn image(&self) -> Result<Option<Arc<DecodedImage>>, LoadError> {
        match self.acquire_decoded_image() {
            Err(LoadError::Allocation(reason)) => {
                log::warn!("out of memory loading image {:?}: {}", self.id, reason);
                self.cache.release_and_compact();
                thread::sleep(self.policy.oom_backoff);
                self.acquire_decoded_image()
            }
            other => other,
        }
    }

    fn acquire_decoded_image(&self) -> Result<Option<Arc<DecodedImage>>, LoadError> {
        if let Some(img) = self.cache.get(&self.id) {
            return Ok(Some(img));
        }
        if !self.state.readable.load(Ordering::Acquire) {
            return Ok(None);
        }
        // Single flight: only the caller winning the Idle -> Loading
        // transition submits work.  Losers report absent for this attempt
        // and pick the image up from the cache on a later call.
        if self
            .state
            .loading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(None);
        }

        log::debug!("asking to read image {:?}", self.id);
        let task = LoadTask::new(self.state.clone());
        let handle = self.scheduler.submit(move || task.run());
        let result = match handle.wait() {
            Ok(Ok(img)) => {
                self.state.readable.store(true, Ordering::Release);
                // Flag first: installing the entry can evict it again
                // synchronously when it alone exceeds the budget, and that
                // eviction must find the flag set so it can clear it.
                self.state.cached.store(true, Ordering::Release);
                let listener = Arc::downgrade(&self.state) as Weak<dyn EvictionListener>;
                self.cache.put(self.id, img.clone(), listener);
                Ok(Some(img))
            }
            Ok(Err(LoadError::Allocation(e))) => Err(LoadError::Allocation(e)),
            Ok(Err(LoadError::Decode(e))) => {
                self.state.readable.store(false, Ordering::Release);
                log::error!("cannot read pixel data for image {:?}: {}", self.id, e);
                Ok(None)
            }
            // A cancelled wait is caller-local and non-terminal; the
            // resource stays readable and a later call may retry.
            Err(TaskError::Cancelled) => Ok(None),
            Err(TaskError::Panicked) => {
                self.state.readable.store(false, Ordering::Release);
                log::error!("decoder panicked for image {:?}", self.id);
                Ok(None)
            }
        };
        self.state.loading.store(false, Ordering::Release);
        result
    }

    pub fn is_in_cache(&self) -> bool {
        self.cache.get(&self.id).is_some()
    }

    /// Last known cached-state flag, kept in sync by successful loads and
    /// by the eviction callback.  [ImageResource::is_in_cache] asks the
    /// cache itself.
    pub fn is_cached(&self) -> bool {
        self.state.cached.load(Ordering::Acquire)
    }

    /// Reclaim this resource's cache entry, routing through the cache's
    /// cleanup path (which closes the reader).
    pub fn evict_from_cache(&self) {
        self.cache.remove_key(&self.id);
    }

    pub fn is_readable(&self) -> bool {
        self.state.readable.load(Ordering::Acquire)
    }

    /// Release the reader.  Does not force-evict the cache entry; that is
    /// left to the reclamation mechanism.
    pub fn dispose(&self) {
        self.state.close_reader();
    }

    pub fn min_value(&self) -> f32 {
        self.state.stats.lock().unwrap().min
    }

    pub fn max_value(&self) -> f32 {
        self.state.stats.lock().unwrap().max
    }

    pub fn default_window(&self) -> f32 {
        self.max_value() - self.min_value()
    }

    pub fn default_level(&self) -> f32 {
        let min = self.min_value();
        min + (self.max_value() - min) / 2.0
    }

    pub fn default_lut_shape(&self) -> LutShape {
        LutShape::Linear
    }

    pub fn default_pixel_padding(&self) -> bool {
        true
    }

    /// Resolve defaults and delegate to the display pipeline seam.
    pub fn rendered_image(
        &self,
        renderer: &dyn Renderer,
        source: &DecodedImage,
        options: RenderOptions,
    ) -> DecodedImage {
        let params = RenderParams {
            window: options.window.unwrap_or_else(|| self.default_window()),
            level: options.level.unwrap_or_else(|| self.default_level()),
            lut_shape: options.lut_shape.unwrap_or_else(|| self.default_lut_shape()),
            pixel_padding: options
                .pixel_padding
                .unwrap_or_else(|| self.default_pixel_padding()),
        };
        renderer.render(source, &params)
    }

    /// True when both images load and their rescaled dimensions match.
    pub fn has_same_size<R2: MediaReader>(&self, other: &ImageResource<R2>) -> bool {
        let (a, b) = match (self.image(), other.image()) {
            (Ok(Some(a)), Ok(Some(b))) => (a, b),
            _ => return false,
        };
        self.rescale_width(a.width()) == other.rescale_width(b.width())
            && self.rescale_height(a.height()) == other.rescale_height(b.height())
    }

    // Calibration. Pixel spacing is independent of cache and loading
    // state; the display always keeps a 1:1 aspect ratio, so the smaller
    // spacing keeps the pixel size and the larger axis is stretched.

    pub fn pixel_size(&self) -> f64 {
        self.pixel_size_x.min(self.pixel_size_y)
    }

    /// Set a uniform pixel size, preserving any existing anisotropy.
    pub fn set_pixel_size(&mut self, pixel_size: f64) {
        if self.pixel_size_x == self.pixel_size_y {
            self.set_pixel_size_xy(pixel_size, pixel_size);
        } else if self.pixel_size_x < self.pixel_size_y {
            let ratio = self.pixel_size_y / self.pixel_size_x;
            self.set_pixel_size_xy(pixel_size, ratio * pixel_size);
        } else {
            let ratio = self.pixel_size_x / self.pixel_size_y;
            self.set_pixel_size_xy(ratio * pixel_size, pixel_size);
        }
    }

    /// Non-positive spacings are replaced by 1.0.
    pub fn set_pixel_size_xy(&mut self, pixel_size_x: f64, pixel_size_y: f64) {
        self.pixel_size_x = if pixel_size_x <= 0.0 { 1.0 } else { pixel_size_x };
        self.pixel_size_y = if pixel_size_y <= 0.0 { 1.0 } else { pixel_size_y };
    }

    pub fn rescale_x(&self) -> f64 {
        if self.pixel_size_x <= self.pixel_size_y {
            1.0
        } else {
            self.pixel_size_x / self.pixel_size_y
        }
    }

    pub fn rescale_y(&self) -> f64 {
        if self.pixel_size_y <= self.pixel_size_x {
            1.0
        } else {
            self.pixel_size_y / self.pixel_size_x
        }
    }

    pub fn rescale_width(&self, width: u32) -> u32 {
        (width as f64 * self.rescale_x() - 0.5).ceil() as u32
    }

    pub fn rescale_height(&self, height: u32) -> u32 {
        (height as f64 * self.rescale_y() - 0.5).ceil() as u32
    }

    pub fn pixel_spacing_unit(&self) -> Unit {
        self.pixel_spacing_unit
    }

    pub fn set_pixel_spacing_unit(&mut self, unit: Unit) {
        self.pixel_spacing_unit = unit;
    }

    pub fn pixel_value_unit(&self) -> Option<&str> {
        self.pixel_value_unit.as_deref()
    }

    pub fn set_pixel_value_unit(&mut self, unit: Option<String>) {
        self.pixel_value_unit = unit;
    }

    pub fn calibration_description(&self) -> Option<&str> {
        self.calibration_description.as_deref()
    }

    pub fn set_calibration_description(&mut self, description: Option<String>) {
        self.calibration_description = description;
    }
}
