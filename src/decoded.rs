//! The [DecodedImage] value type: an in-memory pixel buffer plus the
//! per-band statistics scan used to derive display defaults.
//!
//! Buffers are band-interleaved by pixel, so a 3-band image stores
//! `r0 g0 b0 r1 g1 b1 ...`.  The sample depth is carried by the
//! [PixelData] variant rather than a separate tag; byte-depth images get
//! special treatment in statistics computation (a fixed [0, 255] range).
use crate::traits::EstimateCost;

/// Raw samples at one of the supported depths.
#[derive(Debug, Clone)]
pub enum PixelData {
    U8(Vec<u8>),
    U16(Vec<u16>),
    F32(Vec<f32>),
}

impl PixelData {
    fn sample_count(&self) -> usize {
        match self {
            PixelData::U8(s) => s.len(),
            PixelData::U16(s) => s.len(),
            PixelData::F32(s) => s.len(),
        }
    }

    fn bytes_per_sample(&self) -> usize {
        match self {
            PixelData::U8(_) => 1,
            PixelData::U16(_) => 2,
            PixelData::F32(_) => 4,
        }
    }
}

/// A fully decoded image as produced by a [MediaReader](crate::MediaReader).
#[derive(Debug, Clone)]
pub struct DecodedImage {
    width: u32,
    height: u32,
    bands: u32,
    data: PixelData,
}

impl DecodedImage {
    /// Build an image from raw samples.
    ///
    /// Panics if the sample count does not match `width * height * bands`;
    /// readers are expected to produce consistent buffers.
    pub fn new(width: u32, height: u32, bands: u32, data: PixelData) -> DecodedImage {
        assert_eq!(
            data.sample_count(),
            width as usize * height as usize * bands as usize,
            "sample count must match width * height * bands"
        );
        DecodedImage {
            width,
            height,
            bands,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bands(&self) -> u32 {
        self.bands
    }

    pub fn data(&self) -> &PixelData {
        &self.data
    }

    /// Byte-depth images skip the statistics scan and use the fixed
    /// [0, 255] range.
    pub fn is_byte_depth(&self) -> bool {
        matches!(self.data, PixelData::U8(_))
    }

    /// Single-band images are treated as grayscale.
    pub fn is_gray(&self) -> bool {
        self.bands == 1
    }

    /// In-memory size of the sample buffer.
    pub fn byte_size(&self) -> usize {
        self.data.sample_count() * self.data.bytes_per_sample()
    }

    /// `(min, max)` per band, scanning every sample.
    ///
    /// An empty image reports `(0.0, 0.0)` for every band.
    pub fn band_extrema(&self) -> Vec<(f64, f64)> {
        match &self.data {
            PixelData::U8(s) => band_extrema_of(s.iter().map(|v| *v as f64), self.bands),
            PixelData::U16(s) => band_extrema_of(s.iter().map(|v| *v as f64), self.bands),
            PixelData::F32(s) => band_extrema_of(s.iter().map(|v| *v as f64), self.bands),
        }
    }
}

fn band_extrema_of(samples: impl Iterator<Item = f64>, bands: u32) -> Vec<(f64, f64)> {
    let bands = bands.max(1) as usize;
    let mut out = vec![(f64::INFINITY, f64::NEG_INFINITY); bands];
    let mut band = 0;
    let mut seen = false;
    for v in samples {
        seen = true;
        let e = &mut out[band];
        if v < e.0 {
            e.0 = v;
        }
        if v > e.1 {
            e.1 = v;
        }
        band += 1;
        if band == bands {
            band = 0;
        }
    }
    if !seen {
        out.iter_mut().for_each(|e| *e = (0.0, 0.0));
    }
    out
}

impl EstimateCost for DecodedImage {
    fn estimate_cost(&self) -> usize {
        self.byte_size()
    }
}
