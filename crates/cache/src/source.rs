//! Source reader for raw, uncompressed raster files.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{CacheError, CacheResult};
use crate::geometry::{DataInfo, GeoReference, RasterRect};
use crate::reader::{BufferResult, SourceReader};

/// A raster stored as row-major, band-interleaved pixels without a header.
pub struct RawRasterSource {
    path: PathBuf,
    width: u32,
    height: u32,
    data_info: DataInfo,
    geo_reference: GeoReference,
    /// Opened on first read, released by `dispose`
    file: Mutex<Option<File>>,
}

impl RawRasterSource {
    /// Opens a raw raster. The file must hold at least `width * height`
    /// pixels.
    pub fn open(path: impl Into<PathBuf>, width: u32, height: u32, data_info: DataInfo) -> CacheResult<Self> {
        let path = path.into();
        if width == 0 || height == 0 {
            return Err(CacheError::InvalidGeometry(format!("empty raster {width}x{height}")));
        }
        let expected = width as u64 * height as u64 * data_info.sample_size() as u64;
        let actual = std::fs::metadata(&path)?.len();
        if actual < expected {
            return Err(CacheError::Source(format!(
                "{} holds {actual} bytes, a {width}x{height} raster needs {expected}",
                path.display()
            )));
        }
        debug!(path = %path.display(), width, height, "Opened raw raster");
        Ok(Self {
            path,
            width,
            height,
            data_info,
            geo_reference: GeoReference::default(),
            file: Mutex::new(None),
        })
    }

    pub fn with_geo_reference(mut self, geo_reference: GeoReference) -> Self {
        self.geo_reference = geo_reference;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SourceReader for RawRasterSource {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn data_info(&self) -> DataInfo {
        self.data_info
    }

    fn geo_reference(&self) -> GeoReference {
        self.geo_reference
    }

    fn read(&self, rect: &RasterRect, buffer: Option<Vec<u8>>) -> CacheResult<BufferResult> {
        let raster = RasterRect::new(0, 0, self.width as i64, self.height as i64);
        let rect = rect
            .intersection(&raster)
            .ok_or_else(|| CacheError::Source(format!("{rect} is outside of the raster")))?;
        let sample_size = self.data_info.sample_size();
        let line = rect.width as usize * sample_size;

        let mut data = buffer.unwrap_or_default();
        data.clear();
        data.resize(rect.area() * sample_size, 0);

        let mut guard = self.file.lock();
        let file = match guard.take() {
            Some(file) => file,
            None => File::open(&self.path)?,
        };
        let file = guard.insert(file);
        for (row, chunk) in data.chunks_exact_mut(line).enumerate() {
            let y = rect.y as u64 + row as u64;
            let offset = (y * self.width as u64 + rect.x as u64) * sample_size as u64;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(chunk)?;
        }
        trace!(path = %self.path.display(), %rect, "Read from raw raster");
        Ok(BufferResult::new(rect, data))
    }

    fn modification_time(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }

    fn data_location_id(&self) -> Option<String> {
        Some(self.path.display().to_string())
    }

    fn dispose(&self) {
        self.file.lock().take();
    }
}

impl std::fmt::Debug for RawRasterSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawRasterSource")
            .field("path", &self.path)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("data_info", &self.data_info)
            .finish()
    }
}
