//! Tile storage file: a flat binary file of fixed-size tile slots.
//!
//! Slot size is `tile_width * tile_height * sample_size` bytes and the slot of
//! tile `(column, row)` starts at `(row * columns + column) * slot_size`.
//! Slots that were never written may contain anything; presence is tracked by
//! the metadata sidecar only.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{CacheError, CacheResult};
use crate::geometry::GridGeometry;
use crate::meta::sidecar_path;

/// Outcome of reading one tile slot.
#[derive(Debug)]
pub enum TileReadResult {
    /// The slot was read into the buffer.
    Read,
    /// The storage file does not contain the slot.
    NotOnFile,
    /// The slot could not be read.
    IoError(io::Error),
}

impl TileReadResult {
    pub fn is_read(&self) -> bool {
        matches!(self, TileReadResult::Read)
    }
}

/// Fixed-slot tile storage used by a cache reader.
pub trait TileStorage: Send + Sync {
    /// Location of the storage file.
    fn path(&self) -> &Path;

    fn geometry(&self) -> &GridGeometry;

    /// Bytes in one tile slot.
    fn tile_bytes(&self) -> usize {
        self.geometry().tile_bytes()
    }

    /// Writes the first `tile_bytes()` bytes of `buffer` into the slot of `(column, row)`.
    fn write_tile(&self, column: u32, row: u32, buffer: &[u8]) -> CacheResult<()>;

    /// Reads the slot of `(column, row)` into the first `tile_bytes()` bytes of `buffer`.
    fn read_tile(&self, column: u32, row: u32, buffer: &mut [u8]) -> TileReadResult;

    /// Keeps the file handle open until the matching [`end_batch`](Self::end_batch).
    fn begin_batch(&self);

    fn end_batch(&self);

    /// Removes the storage file and its sidecar.
    fn delete(&self) -> io::Result<()>;

    /// Current size of the storage file, 0 if it does not exist.
    fn size_on_disk(&self) -> u64;

    /// Releases any open file handle.
    fn close(&self);
}

/// Scoped batch on a [`TileStorage`]; the handle is released when the guard drops.
pub struct StorageBatch<'a> {
    storage: &'a dyn TileStorage,
}

impl<'a> StorageBatch<'a> {
    pub fn begin(storage: &'a dyn TileStorage) -> Self {
        storage.begin_batch();
        Self { storage }
    }
}

impl Drop for StorageBatch<'_> {
    fn drop(&mut self) {
        self.storage.end_batch();
    }
}

/// Open-handle bookkeeping of a [`GridFile`].
struct HandleState {
    /// Handle shared by all operations of the current batch
    file: Option<File>,
    /// Nesting depth of open batches
    batch_depth: usize,
    /// Whether the handle has unsynced writes
    dirty: bool,
}

impl HandleState {
    fn handle(&mut self, path: &Path, create: bool) -> io::Result<&mut File> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(create)
                .truncate(false)
                .open(path)?;
            trace!(path = %path.display(), "Opened tile storage file");
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("tile storage handle missing"))
    }

    fn release(&mut self, path: &Path) {
        if let Some(file) = self.file.take() {
            if self.dirty {
                if let Err(e) = file.sync_data() {
                    warn!(path = %path.display(), error = %e, "Failed to sync tile storage file");
                }
            }
            self.dirty = false;
        }
    }
}

/// [`TileStorage`] backed by a single file on the local filesystem.
///
/// The file is created lazily on the first tile write. Outside of a batch
/// every operation opens and releases its own handle.
pub struct GridFile {
    path: PathBuf,
    geometry: GridGeometry,
    state: Mutex<HandleState>,
}

impl GridFile {
    pub fn create(path: impl Into<PathBuf>, geometry: GridGeometry) -> Self {
        Self {
            path: path.into(),
            geometry,
            state: Mutex::new(HandleState {
                file: None,
                batch_depth: 0,
                dirty: false,
            }),
        }
    }

    /// Whether a file handle is currently held.
    pub fn is_open(&self) -> bool {
        self.state.lock().file.is_some()
    }

    fn slot_offset(&self, column: u32, row: u32) -> u64 {
        self.geometry.tile_id(column, row) as u64 * self.geometry.tile_bytes() as u64
    }

    fn finish_op(&self, state: &mut HandleState) {
        if state.batch_depth == 0 {
            state.release(&self.path);
        }
    }
}

impl TileStorage for GridFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    fn write_tile(&self, column: u32, row: u32, buffer: &[u8]) -> CacheResult<()> {
        if !self.geometry.contains_tile(column, row) {
            return Err(CacheError::TileOutOfRange { column, row });
        }
        let tile_bytes = self.tile_bytes();
        if buffer.len() < tile_bytes {
            return Err(CacheError::BufferSize {
                expected: tile_bytes,
                actual: buffer.len(),
            });
        }
        let offset = self.slot_offset(column, row);

        let mut state = self.state.lock();
        let result = state.handle(&self.path, true).and_then(|file| {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&buffer[..tile_bytes])
        });
        if result.is_ok() {
            state.dirty = true;
        }
        self.finish_op(&mut state);
        result?;
        trace!(column, row, offset, "Wrote tile");
        Ok(())
    }

    fn read_tile(&self, column: u32, row: u32, buffer: &mut [u8]) -> TileReadResult {
        if !self.geometry.contains_tile(column, row) {
            return TileReadResult::IoError(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("tile ({column}, {row}) is outside of the grid"),
            ));
        }
        let tile_bytes = self.tile_bytes();
        if buffer.len() < tile_bytes {
            return TileReadResult::IoError(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("buffer of {} bytes cannot hold a tile of {tile_bytes}", buffer.len()),
            ));
        }
        let offset = self.slot_offset(column, row);

        let mut state = self.state.lock();
        if state.file.is_none() && !self.path.exists() {
            return TileReadResult::NotOnFile;
        }
        let result = state.handle(&self.path, false).and_then(|file| {
            let len = file.metadata()?.len();
            if offset + tile_bytes as u64 > len {
                return Ok(false);
            }
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buffer[..tile_bytes])?;
            Ok(true)
        });
        self.finish_op(&mut state);
        match result {
            Ok(true) => TileReadResult::Read,
            Ok(false) => TileReadResult::NotOnFile,
            Err(e) if e.kind() == io::ErrorKind::NotFound => TileReadResult::NotOnFile,
            Err(e) => TileReadResult::IoError(e),
        }
    }

    fn begin_batch(&self) {
        self.state.lock().batch_depth += 1;
    }

    fn end_batch(&self) {
        let mut state = self.state.lock();
        state.batch_depth = state.batch_depth.saturating_sub(1);
        self.finish_op(&mut state);
    }

    fn delete(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.release(&self.path);
        for path in [self.path.clone(), sidecar_path(&self.path)] {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Deleted cache file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn size_on_disk(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.batch_depth = 0;
        state.release(&self.path);
    }
}

impl std::fmt::Debug for GridFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridFile")
            .field("path", &self.path)
            .field("geometry", &self.geometry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{DataInfo, DataType, GeoReference};
    use proptest::prelude::*;

    fn geometry(rows: u32, columns: u32) -> GridGeometry {
        GridGeometry::new(
            GeoReference::default(),
            DataInfo::new(2, DataType::Byte),
            rows,
            columns,
            8,
            4,
        )
        .unwrap()
    }

    fn tile(fill: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| fill.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let grid = GridFile::create(dir.path().join("t.rcache"), geometry(3, 3));
        let bytes = grid.tile_bytes();
        assert_eq!(bytes, 64);

        grid.write_tile(2, 1, &tile(7, bytes)).unwrap();
        let mut out = vec![0u8; bytes];
        assert!(grid.read_tile(2, 1, &mut out).is_read());
        assert_eq!(out, tile(7, bytes));

        // slot (2,1) is id 5, so the file ends right after it
        assert_eq!(grid.size_on_disk(), 6 * 64);
        assert!(!grid.is_open());
    }

    #[test]
    fn test_missing_file_is_not_on_file() {
        let dir = tempfile::tempdir().unwrap();
        let grid = GridFile::create(dir.path().join("none.rcache"), geometry(2, 2));
        let mut out = vec![0u8; grid.tile_bytes()];
        assert!(matches!(grid.read_tile(0, 0, &mut out), TileReadResult::NotOnFile));
        assert!(!dir.path().join("none.rcache").exists());
    }

    #[test]
    fn test_slot_past_end_is_not_on_file() {
        let dir = tempfile::tempdir().unwrap();
        let grid = GridFile::create(dir.path().join("short.rcache"), geometry(2, 2));
        grid.write_tile(0, 0, &tile(1, grid.tile_bytes())).unwrap();

        let mut out = vec![0u8; grid.tile_bytes()];
        assert!(matches!(grid.read_tile(1, 1, &mut out), TileReadResult::NotOnFile));
    }

    #[test]
    fn test_invalid_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let grid = GridFile::create(dir.path().join("bad.rcache"), geometry(2, 2));

        let err = grid.write_tile(0, 0, &[0u8; 3]).unwrap_err();
        assert!(matches!(err, CacheError::BufferSize { expected: 64, actual: 3 }));

        let err = grid.write_tile(2, 0, &tile(0, 64)).unwrap_err();
        assert!(matches!(err, CacheError::TileOutOfRange { column: 2, row: 0 }));

        let mut small = [0u8; 10];
        assert!(matches!(grid.read_tile(0, 0, &mut small), TileReadResult::IoError(_)));
    }

    #[test]
    fn test_write_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let grid = GridFile::create(dir.path().join("gone").join("x.rcache"), geometry(1, 1));
        let err = grid.write_tile(0, 0, &tile(0, 64)).unwrap_err();
        assert!(matches!(err, CacheError::Io(_)));
    }

    #[test]
    fn test_batch_keeps_handle_open() {
        let dir = tempfile::tempdir().unwrap();
        let grid = GridFile::create(dir.path().join("batch.rcache"), geometry(2, 2));
        {
            let _batch = StorageBatch::begin(&grid);
            grid.write_tile(0, 0, &tile(1, 64)).unwrap();
            assert!(grid.is_open());
            {
                let _nested = StorageBatch::begin(&grid);
                grid.write_tile(1, 0, &tile(2, 64)).unwrap();
            }
            assert!(grid.is_open());
        }
        assert!(!grid.is_open());

        let mut out = vec![0u8; 64];
        assert!(grid.read_tile(1, 0, &mut out).is_read());
        assert_eq!(out, tile(2, 64));
    }

    #[test]
    fn test_failed_operation_inside_batch_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let grid = GridFile::create(dir.path().join("f.rcache"), geometry(1, 1));
        {
            let _batch = StorageBatch::begin(&grid);
            grid.write_tile(0, 0, &tile(1, 64)).unwrap();
            assert!(grid.write_tile(5, 5, &tile(1, 64)).is_err());
        }
        assert!(!grid.is_open());
    }

    #[test]
    fn test_delete_removes_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.rcache");
        let grid = GridFile::create(&path, geometry(1, 1));
        grid.write_tile(0, 0, &tile(1, 64)).unwrap();
        fs::write(sidecar_path(&path), "x").unwrap();

        grid.delete().unwrap();
        assert!(!path.exists());
        assert!(!sidecar_path(&path).exists());
        assert_eq!(grid.size_on_disk(), 0);

        // deleting twice is fine
        grid.delete().unwrap();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Every slot reads back exactly what was written to it.
        #[test]
        fn prop_tile_roundtrip(
            rows in 1u32..5,
            columns in 1u32..5,
            seed in any::<u8>(),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let grid = GridFile::create(dir.path().join("p.rcache"), geometry(rows, columns));
            let bytes = grid.tile_bytes();
            let _batch = StorageBatch::begin(&grid);
            for row in 0..rows {
                for column in 0..columns {
                    let fill = seed.wrapping_add((row * columns + column) as u8);
                    grid.write_tile(column, row, &tile(fill, bytes)).unwrap();
                }
            }
            for row in 0..rows {
                for column in 0..columns {
                    let fill = seed.wrapping_add((row * columns + column) as u8);
                    let mut out = vec![0u8; bytes];
                    prop_assert!(grid.read_tile(column, row, &mut out).is_read());
                    prop_assert_eq!(out, tile(fill, bytes));
                }
            }
        }
    }
}
