//! A file-backed [MediaReader] decoding through the `image` crate.
//!
//! The encoded bytes are buffered between fetches so that `close` has a
//! real resource to release; a fetch after a close simply reads the file
//! again.
use std::io::Error as IoError;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::decoded::{DecodedImage, PixelData};
use crate::traits::{LoadError, MediaReader};

pub struct FileMediaReader {
    path: PathBuf,
    /// Encoded bytes of the source file, dropped on `close`.
    bytes: Mutex<Option<Vec<u8>>>,
}

impl FileMediaReader {
    pub fn new(path: impl AsRef<Path>) -> FileMediaReader {
        FileMediaReader {
            path: path.as_ref().to_path_buf(),
            bytes: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_error(path: &Path, e: IoError) -> LoadError {
    if e.kind() == std::io::ErrorKind::OutOfMemory {
        LoadError::Allocation(format!("{}: {}", path.display(), e))
    } else {
        LoadError::Decode(format!("{}: {}", path.display(), e))
    }
}

fn convert(img: image::DynamicImage) -> DecodedImage {
    use image::DynamicImage::*;
    match img {
        ImageLuma8(buf) => {
            DecodedImage::new(buf.width(), buf.height(), 1, PixelData::U8(buf.into_raw()))
        }
        ImageRgb8(buf) => {
            DecodedImage::new(buf.width(), buf.height(), 3, PixelData::U8(buf.into_raw()))
        }
        ImageLuma16(buf) => {
            DecodedImage::new(buf.width(), buf.height(), 1, PixelData::U16(buf.into_raw()))
        }
        ImageRgb16(buf) => {
            DecodedImage::new(buf.width(), buf.height(), 3, PixelData::U16(buf.into_raw()))
        }
        ImageRgb32F(buf) => {
            DecodedImage::new(buf.width(), buf.height(), 3, PixelData::F32(buf.into_raw()))
        }
        // Alpha channels and exotic layouts are flattened to plain RGB.
        other => {
            let buf = other.into_rgb8();
            DecodedImage::new(buf.width(), buf.height(), 3, PixelData::U8(buf.into_raw()))
        }
    }
}

impl MediaReader for FileMediaReader {
    fn fetch_fragment(&self) -> Result<DecodedImage, LoadError> {
        let mut bytes = self.bytes.lock().unwrap();
        if bytes.is_none() {
            let read = std::fs::read(&self.path).map_err(|e| read_error(&self.path, e))?;
            *bytes = Some(read);
        }
        let data = bytes.as_ref().expect("Just filled");
        let decoded = image::load_from_memory(data)
            .map_err(|e| LoadError::Decode(format!("{}: {}", self.path.display(), e)))?;
        Ok(convert(decoded))
    }

    fn close(&self) -> Result<(), IoError> {
        // Idempotent: dropping an already empty buffer is a no-op.
        self.bytes.lock().unwrap().take();
        Ok(())
    }
}
