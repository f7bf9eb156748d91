//! Cache reader: serves pixel rectangles from a tiled, memory-bounded cache.
//!
//! A [`CacheReader`] keeps one [`TileEntry`] per grid cell. Tiles are filled
//! lazily, from the tile storage file when the sidecar says they are on file
//! and from the [`SourceReader`] otherwise. Resident tiles are written back to
//! the storage file on flush, after which the sidecar is rewritten.
//!
//! Lock order: manager registry, reader maintenance lock, tile lock. Buffers
//! are allocated with no lock held, since allocating may evict tiles of any
//! reader, this one included.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::ByteBufferAllocator;
use crate::error::{CacheError, CacheResult};
use crate::geometry::{copy_values, DataInfo, GeoReference, GridGeometry, RasterRect};
use crate::grid_file::{GridFile, StorageBatch, TileReadResult, TileStorage};
use crate::manager::CacheManager;
use crate::meta::{sidecar_path, CacheInfo, CacheInfoFile, TileBitmap};
use crate::stats::{ReaderCounters, ReaderStats};

/// Pixels of a rectangle together with the rectangle they cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferResult {
    rect: RasterRect,
    data: Vec<u8>,
}

impl BufferResult {
    pub fn new(rect: RasterRect, data: Vec<u8>) -> Self {
        Self { rect, data }
    }

    /// The rectangle actually covered, which may be smaller than requested.
    pub fn rect(&self) -> RasterRect {
        self.rect
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// The data a cache reader caches.
///
/// Implementations may be slow; the cache reader only asks for one tile
/// rectangle at a time.
pub trait SourceReader: Send + Sync {
    fn width(&self) -> u32;

    fn height(&self) -> u32;

    fn data_info(&self) -> DataInfo;

    fn geo_reference(&self) -> GeoReference {
        GeoReference::default()
    }

    /// Reads the pixels of `rect`, row-major with `data_info().sample_size()`
    /// bytes per pixel. The result reports the rectangle actually read. `buffer`
    /// may be reused for the result.
    fn read(&self, rect: &RasterRect, buffer: Option<Vec<u8>>) -> CacheResult<BufferResult>;

    /// Last modification of the data behind this source, if known.
    fn modification_time(&self) -> Option<SystemTime> {
        None
    }

    /// Identifier of the data location, used to name cache files.
    fn data_location_id(&self) -> Option<String> {
        None
    }

    /// Whether tiles of this source should be persisted in a cache file.
    fn should_create_cache_file(&self) -> bool {
        true
    }

    /// Releases resources such as open files. The source must stay usable.
    fn dispose(&self) {}
}

/// Residency of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum TileState {
    Unpopulated,
    ResidentOnly,
    OnFileOnly,
    ResidentAndOnFile,
}

impl TileState {
    pub fn is_resident(&self) -> bool {
        matches!(self, TileState::ResidentOnly | TileState::ResidentAndOnFile)
    }

    pub fn is_on_file(&self) -> bool {
        matches!(self, TileState::OnFileOnly | TileState::ResidentAndOnFile)
    }
}

/// Runtime state of one grid cell.
#[derive(Debug)]
struct TileEntry {
    /// Pixel rectangle covered by the tile
    rect: RasterRect,
    /// Resident pixels, read only once installed
    buffer: Option<Arc<Vec<u8>>>,
    /// Whether the storage file holds this tile
    on_file: bool,
}

impl TileEntry {
    fn state(&self) -> TileState {
        match (self.buffer.is_some(), self.on_file) {
            (false, false) => TileState::Unpopulated,
            (true, false) => TileState::ResidentOnly,
            (false, true) => TileState::OnFileOnly,
            (true, true) => TileState::ResidentAndOnFile,
        }
    }

    fn resident_bytes(&self) -> usize {
        self.buffer.as_ref().map_or(0, |b| b.capacity())
    }

    /// Drops the resident buffer, returning its size. `forget_file` also
    /// clears the on-file flag.
    fn clear(&mut self, forget_file: bool) -> usize {
        if forget_file {
            self.on_file = false;
        }
        self.buffer.take().map_or(0, |b| b.capacity())
    }
}

pub(crate) fn now_millis() -> u64 {
    to_millis(SystemTime::now())
}

fn to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Builder for a [`CacheReader`].
#[derive(Default)]
pub struct CacheReaderBuilder {
    width: Option<u32>,
    height: Option<u32>,
    data_info: Option<DataInfo>,
    geo_reference: Option<GeoReference>,
    source: Option<Box<dyn SourceReader>>,
    cache_file: Option<PathBuf>,
    storage: Option<Box<dyn TileStorage>>,
    disk_caching: Option<bool>,
    filled_buffer: Option<Vec<u8>>,
    tile_size: Option<u32>,
    tile_dimensions: Option<(u32, u32)>,
}

impl CacheReaderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raster size, required when there is no source.
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn data_info(mut self, data_info: DataInfo) -> Self {
        self.data_info = Some(data_info);
        self
    }

    pub fn geo_reference(mut self, geo_reference: GeoReference) -> Self {
        self.geo_reference = Some(geo_reference);
        self
    }

    pub fn source(mut self, source: Box<dyn SourceReader>) -> Self {
        self.source = Some(source);
        self
    }

    /// Cache file to use instead of one named by the manager.
    pub fn cache_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_file = Some(path.into());
        self
    }

    /// Tile storage to use instead of a [`GridFile`]. Its geometry defines the grid.
    pub fn storage(mut self, storage: Box<dyn TileStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Enables or disables the cache file. Defaults to what the source asks for.
    pub fn disk_caching(mut self, enabled: bool) -> Self {
        self.disk_caching = Some(enabled);
        self
    }

    /// Full raster, row-major, used to fill every tile at construction.
    pub fn filled_buffer(mut self, buffer: Vec<u8>) -> Self {
        self.filled_buffer = Some(buffer);
        self
    }

    /// Target tile edge for the approximate tiling.
    pub fn tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = Some(tile_size);
        self
    }

    /// Exact tile dimensions, overriding the approximate tiling.
    pub fn tile_dimensions(mut self, tile_width: u32, tile_height: u32) -> Self {
        self.tile_dimensions = Some((tile_width, tile_height));
        self
    }

    /// Creates the reader and registers it with `manager`.
    ///
    /// # Errors
    /// Fails for an unknown or empty raster size, for a filled buffer that is
    /// too small, and when tile buffers cannot be allocated.
    pub fn build(self, manager: Arc<CacheManager>) -> CacheResult<Arc<CacheReader>> {
        let source = self.source;
        let (width, height) = match (self.width, self.height, source.as_deref()) {
            (Some(width), Some(height), _) => (width, height),
            (_, _, Some(source)) => (source.width(), source.height()),
            _ => {
                return Err(CacheError::InvalidGeometry(
                    "raster size unknown without a source".to_string(),
                ))
            }
        };
        let data_info = self
            .data_info
            .or_else(|| source.as_ref().map(|s| s.data_info()))
            .unwrap_or_default();
        let geo_reference = self
            .geo_reference
            .or_else(|| source.as_ref().map(|s| s.geo_reference()))
            .unwrap_or_default();
        let disk_caching = self
            .disk_caching
            .unwrap_or_else(|| source.as_ref().map_or(true, |s| s.should_create_cache_file()));

        if let Some(storage) = self.storage {
            let stored = CacheInfoFile::read(&sidecar_path(storage.path()))
                .filter(|info| info.geometry() == storage.geometry());
            let from_disk = stored.is_some();
            let info = match stored {
                Some(info) => info,
                None => CacheInfo::new(*storage.geometry(), width, height, None, None)?,
            };
            return CacheReader::assemble(info, from_disk, source, Some(storage), self.filled_buffer, manager);
        }

        if !disk_caching {
            if self.cache_file.is_some() {
                debug!("Disk caching disabled, ignoring cache file");
            }
            let info = fresh_info(
                width,
                height,
                data_info,
                geo_reference,
                self.tile_size,
                self.tile_dimensions,
                &manager,
            )?;
            return CacheReader::assemble(info, false, source, None, self.filled_buffer, manager);
        }

        let path = match self.cache_file {
            Some(path) => path,
            None => {
                let id = CacheManager::create_id(width, height, &data_info, &geo_reference);
                manager.create_cache_file(Some(&id))
            }
        };
        let stored = CacheInfoFile::read(&sidecar_path(&path)).filter(|info| {
            let matches = info.raster_width() == width
                && info.raster_height() == height
                && info.geometry().data_info == data_info;
            if !matches {
                warn!(path = %path.display(), "Cache info does not describe this raster, rebuilding");
            }
            matches
        });
        let from_disk = stored.is_some();
        let info = match stored {
            Some(info) => info,
            None => fresh_info(
                width,
                height,
                data_info,
                geo_reference,
                self.tile_size,
                self.tile_dimensions,
                &manager,
            )?,
        };
        let storage: Box<dyn TileStorage> = Box::new(GridFile::create(path, *info.geometry()));
        CacheReader::assemble(info, from_disk, source, Some(storage), self.filled_buffer, manager)
    }
}

fn fresh_info(
    width: u32,
    height: u32,
    data_info: DataInfo,
    geo_reference: GeoReference,
    tile_size: Option<u32>,
    tile_dimensions: Option<(u32, u32)>,
    manager: &CacheManager,
) -> CacheResult<CacheInfo> {
    match tile_dimensions {
        Some((tile_width, tile_height)) => {
            if tile_width == 0 || tile_height == 0 || width == 0 || height == 0 {
                return Err(CacheError::InvalidGeometry(format!(
                    "raster {width}x{height} with tiles of {tile_width}x{tile_height}"
                )));
            }
            let geometry = GridGeometry::new(
                geo_reference.to_outer(),
                data_info,
                height.div_ceil(tile_height),
                width.div_ceil(tile_width),
                tile_width,
                tile_height,
            )?;
            CacheInfo::new(geometry, width, height, None, None)
        }
        None => {
            let tile_size = tile_size.unwrap_or_else(|| manager.config().tile_size);
            CacheInfo::fresh(width, height, tile_size, data_info, geo_reference)
        }
    }
}

/// Tiled, memory-bounded cache in front of a [`SourceReader`].
pub struct CacheReader {
    info: CacheInfo,
    geometry: GridGeometry,
    tiles: Box<[Mutex<TileEntry>]>,
    source: Option<Box<dyn SourceReader>>,
    storage: Option<Box<dyn TileStorage>>,
    manager: Arc<CacheManager>,
    allocator: ByteBufferAllocator,
    /// Serializes flush, clear and invalidation
    maintenance: Mutex<()>,
    /// Bytes of resident tile buffers, only changed under a tile lock
    in_memory_size: AtomicUsize,
    /// Milliseconds since the epoch
    last_read_access: AtomicU64,
    counters: ReaderCounters,
}

impl CacheReader {
    /// Cache reader over `source`, with a cache file named by the manager
    /// unless `cache_file` is given.
    pub fn new(
        source: Box<dyn SourceReader>,
        cache_file: Option<PathBuf>,
        manager: Arc<CacheManager>,
    ) -> CacheResult<Arc<Self>> {
        let mut builder = CacheReaderBuilder::new().source(source);
        if let Some(path) = cache_file {
            builder = builder.cache_file(path);
        }
        builder.build(manager)
    }

    /// Re-opens an existing cache file. Returns `None` if its sidecar is
    /// missing or unreadable, or describes a raster other than `source`.
    pub fn from_cache_file(
        source: Option<Box<dyn SourceReader>>,
        cache_file: impl Into<PathBuf>,
        manager: Arc<CacheManager>,
    ) -> CacheResult<Option<Arc<Self>>> {
        let path = cache_file.into();
        let Some(info) = CacheInfoFile::read(&sidecar_path(&path)) else {
            return Ok(None);
        };
        if let Some(source) = source.as_deref() {
            let matches = info.raster_width() == source.width()
                && info.raster_height() == source.height()
                && info.geometry().data_info == source.data_info();
            if !matches {
                warn!(path = %path.display(), "Cache info does not describe the source raster, ignoring it");
                return Ok(None);
            }
        }
        let storage: Box<dyn TileStorage> = Box::new(GridFile::create(path, *info.geometry()));
        Self::assemble(info, true, source, Some(storage), None, manager).map(Some)
    }

    fn assemble(
        info: CacheInfo,
        from_disk: bool,
        source: Option<Box<dyn SourceReader>>,
        storage: Option<Box<dyn TileStorage>>,
        filled_buffer: Option<Vec<u8>>,
        manager: Arc<CacheManager>,
    ) -> CacheResult<Arc<Self>> {
        let geometry = *info.geometry();
        let counters = ReaderCounters::default();
        let mut on_file = info.tiles_on_file().clone();

        if let (true, Some(storage)) = (from_disk, storage.as_deref()) {
            let source_time = source.as_ref().and_then(|s| s.modification_time());
            if let (Some(source_time), Some(info_time)) = (source_time, info.modification_time()) {
                if source_time > info_time {
                    info!(path = %storage.path().display(), "Source is newer than the cache file, discarding it");
                    if let Err(e) = storage.delete() {
                        warn!(path = %storage.path().display(), error = %e, "Failed to delete stale cache file");
                    }
                    on_file = TileBitmap::empty(geometry.rows, geometry.columns);
                    counters.record_invalidation();
                }
            }
        }

        let tiles = (0..geometry.tile_count())
            .map(|id| {
                let (column, row) = geometry.tile_position(id);
                Mutex::new(TileEntry {
                    rect: geometry.tile_rect(column, row),
                    buffer: None,
                    on_file: on_file.get(column, row),
                })
            })
            .collect();

        let reader = CacheReader {
            info: info.with_tiles_on_file(on_file),
            geometry,
            tiles,
            source,
            storage,
            allocator: ByteBufferAllocator::new(Arc::clone(&manager)),
            manager: Arc::clone(&manager),
            maintenance: Mutex::new(()),
            in_memory_size: AtomicUsize::new(0),
            last_read_access: AtomicU64::new(now_millis()),
            counters,
        };
        if let Some(filled) = &filled_buffer {
            reader.check_filled_buffer(filled)?;
        }
        debug!(
            width = reader.width(),
            height = reader.height(),
            rows = geometry.rows,
            columns = geometry.columns,
            cache_file = ?reader.path(),
            "Created cache reader"
        );

        let reader = Arc::new(reader);
        manager.add_reader(&reader);
        if let Some(filled) = filled_buffer {
            reader.fill_from_buffer(&filled)?;
        }
        Ok(reader)
    }

    fn raster_rect(&self) -> RasterRect {
        RasterRect::new(0, 0, self.width() as i64, self.height() as i64)
    }

    fn check_filled_buffer(&self, filled: &[u8]) -> CacheResult<()> {
        let expected = self.raster_rect().area() * self.geometry.sample_size();
        if filled.len() < expected {
            return Err(CacheError::BufferSize {
                expected,
                actual: filled.len(),
            });
        }
        Ok(())
    }

    /// Installs every tile from a full raster buffer.
    ///
    /// Runs after the reader is registered, so tiles installed early may
    /// already be evicted by the time the last one is allocated.
    fn fill_from_buffer(&self, filled: &[u8]) -> CacheResult<()> {
        let sample_size = self.geometry.sample_size();
        let raster = self.raster_rect();
        for lock in self.tiles.iter() {
            let mut buffer = self.allocator.allocate(self.geometry.tile_bytes(), false, true)?;
            let mut entry = lock.lock();
            copy_values(&raster, &entry.rect, filled, &mut buffer, sample_size);
            self.install(&mut entry, buffer);
        }
        Ok(())
    }

    /// Width of the raster in pixels.
    pub fn width(&self) -> u32 {
        self.info.raster_width()
    }

    pub fn height(&self) -> u32 {
        self.info.raster_height()
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn data_info(&self) -> DataInfo {
        self.geometry.data_info
    }

    pub fn geo_reference(&self) -> GeoReference {
        self.geometry.geo_reference
    }

    /// Location of the cache file, if disk caching is enabled.
    pub fn path(&self) -> Option<&Path> {
        self.storage.as_deref().map(|s| s.path())
    }

    pub fn data_location_id(&self) -> Option<String> {
        self.source.as_ref().and_then(|s| s.data_location_id())
    }

    /// Snapshot of the cache info with the current on-file flags.
    pub fn info(&self) -> CacheInfo {
        let bitmap = TileBitmap::from_fn(self.geometry.rows, self.geometry.columns, |c, r| {
            self.tile_state(c, r).is_some_and(|s| s.is_on_file())
        });
        self.info.with_tiles_on_file(bitmap)
    }

    pub fn tile_state(&self, column: u32, row: u32) -> Option<TileState> {
        if !self.geometry.contains_tile(column, row) {
            return None;
        }
        let id = self.geometry.tile_id(column, row);
        self.tiles.get(id).map(|lock| lock.lock().state())
    }

    /// Bytes held by resident tiles.
    pub fn in_memory_size(&self) -> usize {
        self.in_memory_size.load(Ordering::Acquire)
    }

    /// Sum of the capacities of all resident tile buffers, counted tile by tile.
    pub fn resident_buffer_bytes(&self) -> usize {
        self.tiles.iter().map(|lock| lock.lock().resident_bytes()).sum()
    }

    /// Milliseconds since the epoch of the last read.
    pub fn last_read_access(&self) -> u64 {
        self.last_read_access.load(Ordering::Acquire)
    }

    pub fn cache_file_size(&self) -> u64 {
        self.storage.as_deref().map_or(0, |s| s.size_on_disk())
    }

    pub fn can_create_cache_file(&self) -> bool {
        self.storage.is_some()
    }

    pub fn stats(&self) -> ReaderStats {
        self.counters.snapshot()
    }

    /// Reads the pixels of `rect`.
    ///
    /// The rectangle is clipped to the raster; `Ok(None)` means it does not
    /// intersect the raster at all. `buffer` is reused for the result when it
    /// is large enough. Tiles that can neither be loaded from the cache file
    /// nor from the source read as zeros.
    ///
    /// # Errors
    /// Only allocation failures are reported.
    pub fn read(&self, rect: &RasterRect, buffer: Option<Vec<u8>>) -> CacheResult<Option<BufferResult>> {
        self.invalidate_if_stale();
        self.last_read_access.fetch_max(now_millis(), Ordering::AcqRel);

        let Some(rect) = self.geometry.snap_to_raster(rect, self.width(), self.height()) else {
            return Ok(None);
        };
        let Some(range) = self.geometry.intersecting_tiles(&rect) else {
            return Ok(None);
        };
        let sample_size = self.geometry.sample_size();
        let size = rect.area() * sample_size;
        let mut result = match buffer {
            Some(mut buffer) if buffer.capacity() >= size => {
                buffer.clear();
                buffer.resize(size, 0);
                buffer
            }
            _ => self.allocator.allocate(size, false, false)?,
        };

        let _batch = self.storage.as_deref().map(StorageBatch::begin);
        for (column, row) in range.iter() {
            let tile = self.tile_buffer(column, row)?;
            copy_values(&self.geometry.tile_rect(column, row), &rect, &tile, &mut result, sample_size);
        }
        trace!(%rect, tiles = range.tile_count(), "Read rectangle");
        Ok(Some(BufferResult::new(rect, result)))
    }

    /// Resident buffer of a tile, loading it if needed.
    fn tile_buffer(&self, column: u32, row: u32) -> CacheResult<Arc<Vec<u8>>> {
        let lock = self
            .tiles
            .get(self.geometry.tile_id(column, row))
            .ok_or(CacheError::TileOutOfRange { column, row })?;
        if let Some(buffer) = &lock.lock().buffer {
            self.counters.record_memory_hit();
            return Ok(Arc::clone(buffer));
        }

        let mut fresh = self.allocator.allocate(self.geometry.tile_bytes(), false, true)?;
        let charged = fresh.capacity();
        let mut entry = lock.lock();
        if let Some(buffer) = entry.buffer.clone() {
            // another thread loaded it meanwhile
            drop(entry);
            self.allocator.release(charged);
            self.counters.record_memory_hit();
            return Ok(buffer);
        }

        if entry.on_file {
            match self.storage.as_deref().map(|s| s.read_tile(column, row, &mut fresh)) {
                Some(TileReadResult::Read) => {
                    self.counters.record_file_read();
                    return Ok(self.install(&mut entry, fresh));
                }
                Some(TileReadResult::NotOnFile) => {
                    warn!(column, row, "Tile missing from cache file, reading from source");
                }
                Some(TileReadResult::IoError(e)) => {
                    warn!(column, row, error = %e, "Failed to read tile from cache file, reading from source");
                }
                None => {}
            }
            self.counters.record_failed_file_read();
            entry.on_file = false;
            fresh.fill(0);
        }

        if self.fill_from_source(&entry.rect, &mut fresh) {
            self.counters.record_source_read();
            Ok(self.install(&mut entry, fresh))
        } else {
            drop(entry);
            self.allocator.release(charged);
            Ok(Arc::new(fresh))
        }
    }

    /// Copies the source pixels of `tile_rect` into `tile`. False if there is
    /// no source or it failed.
    fn fill_from_source(&self, tile_rect: &RasterRect, tile: &mut [u8]) -> bool {
        let Some(source) = self.source.as_deref() else {
            trace!(rect = %tile_rect, "No source, serving empty tile");
            return false;
        };
        let raster = RasterRect::new(0, 0, self.width() as i64, self.height() as i64);
        let Some(request) = tile_rect.intersection(&raster) else {
            return false;
        };
        match source.read(&request, None) {
            Ok(result) => {
                copy_values(&result.rect(), tile_rect, result.data(), tile, self.geometry.sample_size());
                true
            }
            Err(e) => {
                error!(rect = %request, error = %e, "Unable to read from source, creating empty tile");
                self.counters.record_source_failure();
                false
            }
        }
    }

    fn install(&self, entry: &mut TileEntry, buffer: Vec<u8>) -> Arc<Vec<u8>> {
        let buffer = Arc::new(buffer);
        self.in_memory_size.fetch_add(buffer.capacity(), Ordering::AcqRel);
        entry.buffer = Some(Arc::clone(&buffer));
        buffer
    }

    fn source_modified_millis(&self) -> Option<u64> {
        self.source
            .as_ref()
            .and_then(|s| s.modification_time())
            .map(to_millis)
    }

    fn is_stale(&self) -> bool {
        self.source_modified_millis()
            .is_some_and(|modified| modified > self.last_read_access())
    }

    fn invalidate_if_stale(&self) {
        if !self.is_stale() {
            return;
        }
        let _guard = self.maintenance.lock();
        self.invalidate_locked();
    }

    /// Full invalidation, caller holds the maintenance lock.
    fn invalidate_locked(&self) -> usize {
        let Some(modified) = self.source_modified_millis() else {
            return 0;
        };
        if modified <= self.last_read_access() {
            return 0;
        }
        info!(cache_file = ?self.path(), "Source changed, invalidating the whole cache");
        self.counters.record_invalidation();
        let freed = self.clear_locked(true);
        self.last_read_access.fetch_max(modified, Ordering::AcqRel);
        freed
    }

    /// Drops all resident buffers, returning the freed bytes. With
    /// `delete_file` the cache file is removed as well.
    pub fn clear(&self, delete_file: bool) -> usize {
        let _guard = self.maintenance.lock();
        self.clear_locked(delete_file)
    }

    fn clear_locked(&self, delete_file: bool) -> usize {
        let mut freed = 0;
        for lock in self.tiles.iter() {
            let mut entry = lock.lock();
            let bytes = entry.clear(delete_file);
            self.in_memory_size.fetch_sub(bytes, Ordering::AcqRel);
            freed += bytes;
        }
        self.allocator.release(freed);
        if delete_file {
            self.delete_cache_file_locked();
        }
        debug!(freed, delete_file, "Cleared cache reader");
        freed
    }

    /// Deletes the cache file and its sidecar. True if no cache file remains.
    pub fn delete_cache_file(&self) -> bool {
        let _guard = self.maintenance.lock();
        self.delete_cache_file_locked()
    }

    fn delete_cache_file_locked(&self) -> bool {
        let Some(storage) = self.storage.as_deref() else {
            return true;
        };
        for lock in self.tiles.iter() {
            lock.lock().on_file = false;
        }
        let size = storage.size_on_disk();
        if let Err(e) = storage.delete() {
            warn!(path = %storage.path().display(), error = %e, "Could not delete cache file");
        }
        let deleted = !storage.path().exists();
        if deleted {
            self.manager.release_disk(size as usize);
        }
        deleted
    }

    /// Writes resident tiles that are not on file yet. Returns the number of
    /// tiles written.
    pub fn flush(&self) -> usize {
        self.write_cache(false).0
    }

    /// Writes tiles to the cache file if there is one and frees the buffers
    /// of every tile that is safely on file. Without a cache file all
    /// buffers are dropped. Returns the freed bytes.
    pub fn release_memory(&self) -> usize {
        if self.storage.is_some() {
            self.write_cache(true).1
        } else {
            self.clear(false)
        }
    }

    /// Releases the source, writes the cache file and closes it. Without a
    /// cache file, `free_buffers` drops the resident tiles. Returns the freed
    /// bytes.
    pub fn dispose(&self, free_buffers: bool) -> usize {
        if let Some(source) = self.source.as_deref() {
            source.dispose();
        }
        let freed = match self.storage.as_deref() {
            Some(storage) => {
                let freed = self.write_cache(true).1;
                storage.close();
                freed
            }
            None if free_buffers => self.clear(false),
            None => 0,
        };
        debug!(freed, "Disposed cache reader");
        freed
    }

    /// Returns `(tiles written, bytes freed)`.
    fn write_cache(&self, clear_buffers: bool) -> (usize, usize) {
        let Some(storage) = self.storage.as_deref() else {
            return (0, 0);
        };
        let _guard = self.maintenance.lock();
        if self.is_stale() {
            return (0, self.invalidate_locked());
        }

        let size_before = storage.size_on_disk();
        let mut written = 0;
        {
            let _batch = StorageBatch::begin(storage);
            for (id, lock) in self.tiles.iter().enumerate() {
                let mut entry = lock.lock();
                if entry.on_file {
                    continue;
                }
                let Some(buffer) = entry.buffer.as_ref() else {
                    continue;
                };
                let (column, row) = self.geometry.tile_position(id);
                match storage.write_tile(column, row, buffer) {
                    Ok(()) => {
                        entry.on_file = true;
                        written += 1;
                        self.counters.record_tile_written();
                    }
                    Err(e) => {
                        warn!(column, row, error = %e, "Failed to write tile to cache file, keeping it in memory");
                        self.counters.record_failed_write();
                    }
                }
            }
        }
        let size_after = storage.size_on_disk();
        if size_after > size_before {
            self.manager.record_disk((size_after - size_before) as usize);
        }

        if written > 0 {
            let info = self.info();
            let sidecar = sidecar_path(storage.path());
            if let Err(e) = CacheInfoFile::write(&sidecar, &info) {
                warn!(path = %sidecar.display(), error = %e, "Failed to write cache info, deleting the cache file");
                self.delete_cache_file_locked();
                written = 0;
            }
        }

        let mut freed = 0;
        if clear_buffers {
            for lock in self.tiles.iter() {
                let mut entry = lock.lock();
                if entry.on_file {
                    let bytes = entry.clear(false);
                    self.in_memory_size.fetch_sub(bytes, Ordering::AcqRel);
                    freed += bytes;
                }
            }
            self.allocator.release(freed);
        }
        debug!(written, freed, cache_file = %storage.path().display(), "Flushed cache reader");
        (written, freed)
    }
}

impl Drop for CacheReader {
    fn drop(&mut self) {
        let resident = self.in_memory_size.swap(0, Ordering::AcqRel);
        self.allocator.release(resident);
        if let Some(storage) = self.storage.as_deref() {
            storage.close();
        }
    }
}

impl fmt::Debug for CacheReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheReader")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("geometry", &self.geometry)
            .field("cache_file", &self.path())
            .field("in_memory_size", &self.in_memory_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::geometry::DataType;
    use std::io;
    use std::sync::atomic::AtomicBool;

    /// Source where every pixel holds `(x + y) % 251`.
    struct GradientSource {
        width: u32,
        height: u32,
        reads: AtomicUsize,
        fail: AtomicBool,
    }

    impl GradientSource {
        fn new(width: u32, height: u32) -> Self {
            Self {
                width,
                height,
                reads: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            }
        }

        fn pixel(x: i64, y: i64) -> u8 {
            ((x + y) % 251) as u8
        }
    }

    impl SourceReader for Arc<GradientSource> {
        fn width(&self) -> u32 {
            self.width
        }

        fn height(&self) -> u32 {
            self.height
        }

        fn data_info(&self) -> DataInfo {
            DataInfo::default()
        }

        fn read(&self, rect: &RasterRect, _buffer: Option<Vec<u8>>) -> CacheResult<BufferResult> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(CacheError::Source("unavailable".to_string()));
            }
            let mut data = Vec::with_capacity(rect.area());
            for y in rect.y..rect.bottom() {
                for x in rect.x..rect.right() {
                    data.push(GradientSource::pixel(x, y));
                }
            }
            Ok(BufferResult::new(*rect, data))
        }
    }

    /// Storage that accepts nothing.
    struct RejectingStorage {
        geometry: GridGeometry,
        path: PathBuf,
    }

    impl TileStorage for RejectingStorage {
        fn path(&self) -> &Path {
            &self.path
        }

        fn geometry(&self) -> &GridGeometry {
            &self.geometry
        }

        fn write_tile(&self, _column: u32, _row: u32, _buffer: &[u8]) -> CacheResult<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "read only").into())
        }

        fn read_tile(&self, _column: u32, _row: u32, _buffer: &mut [u8]) -> TileReadResult {
            TileReadResult::NotOnFile
        }

        fn begin_batch(&self) {}

        fn end_batch(&self) {}

        fn delete(&self) -> io::Result<()> {
            Ok(())
        }

        fn size_on_disk(&self) -> u64 {
            0
        }

        fn close(&self) {}
    }

    fn manager(dir: &Path) -> Arc<CacheManager> {
        CacheManager::new(CacheConfig::default().with_cache_dir(dir).with_memory_budget(64 << 20))
    }

    fn gradient_reader(dir: &Path, source: &Arc<GradientSource>) -> Arc<CacheReader> {
        CacheReaderBuilder::new()
            .source(Box::new(Arc::clone(source)))
            .tile_dimensions(10, 10)
            .build(manager(dir))
            .unwrap()
    }

    #[test]
    fn test_read_clips_and_copies() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(GradientSource::new(25, 15));
        let reader = gradient_reader(dir.path(), &source);
        assert_eq!((reader.geometry().columns, reader.geometry().rows), (3, 2));

        let result = reader.read(&RasterRect::new(20, 10, 20, 20), None).unwrap().unwrap();
        assert_eq!(result.rect(), RasterRect::new(20, 10, 5, 5));
        assert_eq!(result.data().len(), 25);
        assert_eq!(result.data()[0], GradientSource::pixel(20, 10));
        assert_eq!(result.data()[24], GradientSource::pixel(24, 14));

        assert!(reader.read(&RasterRect::new(30, 0, 5, 5), None).unwrap().is_none());
    }

    #[test]
    fn test_far_rect_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(GradientSource::new(100, 100));
        let reader = gradient_reader(dir.path(), &source);

        let far = RasterRect::new(i64::MAX - 5, 0, 10, 10);
        assert!(reader.read(&far, None).unwrap().is_none());
        let far_up = RasterRect::new(0, i64::MIN, 10, i64::MAX);
        assert!(reader.read(&far_up, None).unwrap().is_none());
        assert_eq!(source.reads.load(Ordering::SeqCst), 0);
        assert_eq!(reader.in_memory_size(), 0);
    }

    #[test]
    fn test_tile_state_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(GradientSource::new(20, 20));
        let reader = gradient_reader(dir.path(), &source);

        assert_eq!(reader.tile_state(0, 0), Some(TileState::Unpopulated));
        assert_eq!(reader.tile_state(2, 0), None);

        reader.read(&RasterRect::new(0, 0, 5, 5), None).unwrap();
        assert_eq!(reader.tile_state(0, 0), Some(TileState::ResidentOnly));
        assert_eq!(reader.tile_state(1, 0), Some(TileState::Unpopulated));

        assert_eq!(reader.flush(), 1);
        assert_eq!(reader.tile_state(0, 0), Some(TileState::ResidentAndOnFile));

        reader.clear(false);
        assert_eq!(reader.tile_state(0, 0), Some(TileState::OnFileOnly));
        assert_eq!(reader.in_memory_size(), 0);

        let reads_before = source.reads.load(Ordering::SeqCst);
        let result = reader.read(&RasterRect::new(0, 0, 10, 10), None).unwrap().unwrap();
        assert_eq!(source.reads.load(Ordering::SeqCst), reads_before);
        assert_eq!(result.data()[11], GradientSource::pixel(1, 1));
        assert_eq!(reader.tile_state(0, 0), Some(TileState::ResidentAndOnFile));
        assert_eq!(reader.stats().file_reads, 1);

        reader.clear(true);
        assert_eq!(reader.tile_state(0, 0), Some(TileState::Unpopulated));
        assert!(reader.path().is_some_and(|p| !p.exists()));
    }

    #[test]
    fn test_memory_hits_do_not_touch_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(GradientSource::new(20, 20));
        let reader = gradient_reader(dir.path(), &source);

        reader.read(&RasterRect::new(0, 0, 20, 20), None).unwrap();
        assert_eq!(source.reads.load(Ordering::SeqCst), 4);
        reader.read(&RasterRect::new(5, 5, 10, 10), None).unwrap();
        assert_eq!(source.reads.load(Ordering::SeqCst), 4);

        let stats = reader.stats();
        assert_eq!(stats.source_reads, 4);
        assert_eq!(stats.memory_hits, 4);
        assert_eq!(reader.in_memory_size(), reader.resident_buffer_bytes());
        assert_eq!(reader.in_memory_size(), 4 * 100);
    }

    #[test]
    fn test_source_failure_yields_uncached_zero_tile() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(GradientSource::new(20, 20));
        source.fail.store(true, Ordering::SeqCst);
        let reader = gradient_reader(dir.path(), &source);

        let result = reader.read(&RasterRect::new(0, 0, 10, 10), None).unwrap().unwrap();
        assert!(result.data().iter().all(|b| *b == 0));
        assert_eq!(reader.tile_state(0, 0), Some(TileState::Unpopulated));
        assert_eq!(reader.in_memory_size(), 0);
        assert_eq!(reader.stats().source_failures, 1);
        assert_eq!(reader.flush(), 0);

        source.fail.store(false, Ordering::SeqCst);
        let result = reader.read(&RasterRect::new(0, 0, 10, 10), None).unwrap().unwrap();
        assert_eq!(result.data()[99], GradientSource::pixel(9, 9));
    }

    #[test]
    fn test_reuses_caller_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(GradientSource::new(20, 20));
        let reader = gradient_reader(dir.path(), &source);

        let buffer = vec![0xaa; 1000];
        let result = reader
            .read(&RasterRect::new(1, 1, 4, 4), Some(buffer))
            .unwrap()
            .unwrap();
        assert_eq!(result.data().len(), 16);
        assert!(result.into_data().capacity() >= 1000);
    }

    #[test]
    fn test_filled_buffer_without_source() {
        let dir = tempfile::tempdir().unwrap();
        let raster: Vec<u8> = (0..15 * 12).map(|i| (i % 200) as u8).collect();
        let reader = CacheReaderBuilder::new()
            .size(15, 12)
            .filled_buffer(raster.clone())
            .tile_dimensions(8, 8)
            .disk_caching(false)
            .build(manager(dir.path()))
            .unwrap();

        assert!(!reader.can_create_cache_file());
        for row in 0..2 {
            for column in 0..2 {
                assert_eq!(reader.tile_state(column, row), Some(TileState::ResidentOnly));
            }
        }
        let result = reader.read(&RasterRect::new(0, 0, 15, 12), None).unwrap().unwrap();
        assert_eq!(result.data(), raster.as_slice());

        // dropping memory without a cache file loses the data
        assert_eq!(reader.release_memory(), 4 * 64);
        let result = reader.read(&RasterRect::new(0, 0, 15, 12), None).unwrap().unwrap();
        assert!(result.data().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_filled_buffer_is_evictable_while_filling() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CacheManager::new(
            CacheConfig::default().with_cache_dir(dir.path()).with_memory_budget(250),
        );
        let raster: Vec<u8> = (0..20 * 20).map(|i| (i % 199) as u8).collect();
        let reader = CacheReaderBuilder::new()
            .size(20, 20)
            .filled_buffer(raster.clone())
            .tile_dimensions(10, 10)
            .cache_file(dir.path().join("filled.rcache"))
            .build(Arc::clone(&manager))
            .unwrap();

        assert!(manager.currently_used_memory() <= 250);
        assert_eq!(manager.stats().evictions, 1);
        assert!(reader.tile_state(0, 0).is_some_and(|s| s == TileState::OnFileOnly));

        let result = reader.read(&RasterRect::new(0, 0, 20, 20), None).unwrap().unwrap();
        assert_eq!(result.data(), raster.as_slice());
    }

    #[test]
    fn test_from_cache_file_rejects_other_raster() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(GradientSource::new(20, 20));
        let reader = gradient_reader(dir.path(), &source);
        reader.read(&RasterRect::new(0, 0, 20, 20), None).unwrap();
        assert_eq!(reader.flush(), 4);
        let path = reader.path().unwrap().to_path_buf();
        drop(reader);

        let other: Box<dyn SourceReader> = Box::new(Arc::new(GradientSource::new(30, 20)));
        let reopened = CacheReader::from_cache_file(Some(other), &path, manager(dir.path())).unwrap();
        assert!(reopened.is_none());
        assert!(path.exists());

        let same: Box<dyn SourceReader> = Box::new(Arc::clone(&source));
        let reopened = CacheReader::from_cache_file(Some(same), &path, manager(dir.path()))
            .unwrap()
            .unwrap();
        assert_eq!(reopened.tile_state(1, 1), Some(TileState::OnFileOnly));
    }

    #[test]
    fn test_filled_buffer_too_small() {
        let dir = tempfile::tempdir().unwrap();
        let err = CacheReaderBuilder::new()
            .size(10, 10)
            .filled_buffer(vec![0; 99])
            .build(manager(dir.path()))
            .unwrap_err();
        assert!(matches!(err, CacheError::BufferSize { expected: 100, actual: 99 }));
    }

    #[test]
    fn test_size_required_without_source() {
        let dir = tempfile::tempdir().unwrap();
        let err = CacheReaderBuilder::new().build(manager(dir.path())).unwrap_err();
        assert!(matches!(err, CacheError::InvalidGeometry(_)));
    }

    #[test]
    fn test_failed_writes_keep_tiles_resident() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(GradientSource::new(20, 20));
        let geometry =
            GridGeometry::new(GeoReference::default(), DataInfo::default(), 2, 2, 10, 10).unwrap();
        let reader = CacheReaderBuilder::new()
            .source(Box::new(Arc::clone(&source)))
            .storage(Box::new(RejectingStorage {
                geometry,
                path: dir.path().join("rejecting.rcache"),
            }))
            .build(manager(dir.path()))
            .unwrap();

        reader.read(&RasterRect::new(0, 0, 20, 20), None).unwrap();
        assert_eq!(reader.flush(), 0);
        assert_eq!(reader.stats().failed_writes, 4);
        assert_eq!(reader.release_memory(), 0);
        assert_eq!(reader.tile_state(1, 1), Some(TileState::ResidentOnly));
        assert!(!sidecar_path(&dir.path().join("rejecting.rcache")).exists());
    }

    #[test]
    fn test_sidecar_failure_deletes_cache_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.rcache");
        // a directory where the sidecar should go makes writing it fail
        std::fs::create_dir(sidecar_path(&path)).unwrap();

        let source = Arc::new(GradientSource::new(20, 20));
        let reader = CacheReaderBuilder::new()
            .source(Box::new(Arc::clone(&source)))
            .cache_file(&path)
            .tile_dimensions(10, 10)
            .build(manager(dir.path()))
            .unwrap();

        reader.read(&RasterRect::new(0, 0, 20, 20), None).unwrap();
        assert_eq!(reader.flush(), 0);
        assert!(!path.exists());
        assert_eq!(reader.tile_state(0, 0), Some(TileState::ResidentOnly));
        assert_eq!(reader.info().tiles_on_file().count(), 0);
    }

    #[test]
    fn test_concurrent_reads_install_each_tile_once() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(GradientSource::new(40, 40));
        let reader = gradient_reader(dir.path(), &source);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let reader = Arc::clone(&reader);
                std::thread::spawn(move || {
                    for j in 0..20 {
                        let offset = ((i + j) % 30) as i64;
                        let result = reader
                            .read(&RasterRect::new(offset, offset, 10, 10), None)
                            .unwrap()
                            .unwrap();
                        assert_eq!(result.data()[0], GradientSource::pixel(offset, offset));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(reader.in_memory_size(), reader.resident_buffer_bytes());
        let resident = (0..4)
            .flat_map(|r| (0..4).map(move |c| (c, r)))
            .filter(|(c, r)| reader.tile_state(*c, *r).is_some_and(|s| s.is_resident()))
            .count();
        assert_eq!(source.reads.load(Ordering::SeqCst), resident);
    }

    #[test]
    fn test_drop_returns_memory_to_manager() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let source = Arc::new(GradientSource::new(20, 20));
        let reader = CacheReaderBuilder::new()
            .source(Box::new(Arc::clone(&source)))
            .tile_dimensions(10, 10)
            .build(Arc::clone(&manager))
            .unwrap();

        reader.read(&RasterRect::new(0, 0, 20, 20), None).unwrap();
        assert_eq!(manager.currently_used_memory(), 400);
        assert_eq!(manager.size(), 1);

        drop(reader);
        assert_eq!(manager.currently_used_memory(), 0);
        assert_eq!(manager.size(), 0);
    }

    #[test]
    fn test_multi_band_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let raster: Vec<u8> = (0..6 * 4 * 2).map(|i| i as u8).collect();
        let reader = CacheReaderBuilder::new()
            .size(6, 4)
            .data_info(DataInfo::new(2, DataType::Byte))
            .filled_buffer(raster.clone())
            .tile_dimensions(4, 4)
            .build(manager(dir.path()))
            .unwrap();

        let result = reader.read(&RasterRect::new(3, 1, 2, 2), None).unwrap().unwrap();
        // pixel (3,1) starts at byte (1 * 6 + 3) * 2
        assert_eq!(&result.data()[0..4], &raster[18..22]);
        assert_eq!(&result.data()[4..8], &raster[30..34]);
    }
}
