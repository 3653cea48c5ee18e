//! Collaborator seams consumed by the cache and resources.
//!
//! The [MediaReader] trait is responsible for turning an underlying source
//! (file, network stream, archive entry) into a [DecodedImage], and for
//! releasing whatever it holds open when the cached image is reclaimed.
//! The [Renderer] trait is the narrow seam to the display pipeline; its
//! internals (window/level lookup tables and so on) live elsewhere.
use std::io::Error as IoError;

use crate::decoded::DecodedImage;

/// Failures surfaced by a load attempt.
///
/// Only [LoadError::Allocation] is recoverable: the top-level load entry
/// point reacts to it by compacting the cache and retrying once.  A
/// [LoadError::Decode] permanently marks the owning resource unreadable.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    /// The decoder or statistics pass could not allocate enough memory.
    #[error("allocation failure while decoding: {0}")]
    Allocation(String),
    /// The pixel data is malformed or unsupported.
    #[error("cannot read pixel data: {0}")]
    Decode(String),
}

/// Produces decoded pixel data for one resource.
///
/// Implementations need not be safe under concurrent `fetch_fragment`
/// calls from multiple threads; all decoding is serialized through the
/// [DecodeScheduler](crate::DecodeScheduler), so a fetch is never invoked
/// reentrantly.  `close` may race with a fetch and must cope.
pub trait MediaReader: Send + Sync + 'static {
    /// Decode the image from the underlying source.
    fn fetch_fragment(&self) -> Result<DecodedImage, LoadError>;

    /// Release the underlying stream or buffer.  Must be idempotent: it is
    /// called both on cache eviction and on resource disposal, and a later
    /// fetch may reopen the source.
    fn close(&self) -> Result<(), IoError>;
}

/// Estimate the in-memory cost of a cached item, in bytes.
///
/// The [SoftCache](crate::SoftCache) keeps entries up to a configured total
/// cost, then evicts oldest-first.
pub trait EstimateCost {
    fn estimate_cost(&self) -> usize;
}

/// Shape of the lookup table applied by the display pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LutShape {
    #[default]
    Linear,
    Sigmoid,
    Log,
}

/// Per-call overrides for [Renderer::render].
///
/// Unset fields are filled from the owning resource's defaults
/// (`default_window`, `default_level`, and friends).
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderOptions {
    pub window: Option<f32>,
    pub level: Option<f32>,
    pub lut_shape: Option<LutShape>,
    pub pixel_padding: Option<bool>,
}

/// Resolved rendering parameters, with every field filled in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderParams {
    pub window: f32,
    pub level: f32,
    pub lut_shape: LutShape,
    pub pixel_padding: bool,
}

/// The display pipeline seam: turns a decoded image into a display-ready
/// one given fully resolved parameters.
pub trait Renderer {
    fn render(&self, source: &DecodedImage, params: &RenderParams) -> DecodedImage;
}
