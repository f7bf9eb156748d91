//! Metadata sidecar for cache files.
//!
//! Every cache (tile storage) file has a line-oriented text sidecar next to it
//! with the same base name and the `info` extension. Layout:
//!
//! ```text
//! OUTER            origin location           \
//! 0                origin x                  |
//! 0                origin y                  |
//! 1                resolution x              |
//! -1               resolution y              |
//! 0                rotation x                 > grid-meta header
//! 0                rotation y                |
//! 2                rows                      |
//! 2                columns                   |
//! 500              tile width                |
//! 500              tile height               |
//! 1                bands                     |
//! BYTE             data type                 /
//! 1000             original raster width
//! 1000             original raster height
//! 10               one line per tile row, '1' = tile present in the cache file
//! 01
//! ```
//!
//! Reading is best effort: a missing or malformed sidecar reads as `None`, so a
//! damaged cache costs a rebuild and never an error.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};
use crate::geometry::{
    DataInfo, GeoReference, GridGeometry, OriginLocation, RasterRect, DEFAULT_TILE_SIZE,
};

/// Extension of the metadata sidecar.
pub const SIDECAR_EXTENSION: &str = "info";

/// Path of the sidecar belonging to a cache file.
pub fn sidecar_path(cache_file: &Path) -> PathBuf {
    cache_file.with_extension(SIDECAR_EXTENSION)
}

/// Writes the grid-meta header lines for `geometry`.
pub fn write_grid_meta<W: Write>(writer: &mut W, geometry: &GridGeometry) -> io::Result<()> {
    let geo = &geometry.geo_reference;
    writeln!(writer, "{}", geo.location)?;
    writeln!(writer, "{}", geo.origin_x)?;
    writeln!(writer, "{}", geo.origin_y)?;
    writeln!(writer, "{}", geo.resolution_x)?;
    writeln!(writer, "{}", geo.resolution_y)?;
    writeln!(writer, "{}", geo.rotation_x)?;
    writeln!(writer, "{}", geo.rotation_y)?;
    writeln!(writer, "{}", geometry.rows)?;
    writeln!(writer, "{}", geometry.columns)?;
    writeln!(writer, "{}", geometry.tile_width)?;
    writeln!(writer, "{}", geometry.tile_height)?;
    writeln!(writer, "{}", geometry.data_info.bands)?;
    writeln!(writer, "{}", geometry.data_info.data_type)?;
    Ok(())
}

/// Reads the grid-meta header from `lines`, `None` if it is incomplete or malformed.
pub fn read_grid_meta<'a, I>(lines: &mut I) -> Option<GridGeometry>
where
    I: Iterator<Item = &'a str>,
{
    let location: OriginLocation = lines.next()?.parse().ok()?;
    let mut next_f64 = || lines.next().and_then(|l| l.trim().parse::<f64>().ok());
    let geo_reference = GeoReference {
        location,
        origin_x: next_f64()?,
        origin_y: next_f64()?,
        resolution_x: next_f64()?,
        resolution_y: next_f64()?,
        rotation_x: next_f64()?,
        rotation_y: next_f64()?,
    };
    let rows = parse_u32(lines.next())?;
    let columns = parse_u32(lines.next())?;
    let tile_width = parse_u32(lines.next())?;
    let tile_height = parse_u32(lines.next())?;
    let bands = parse_u32(lines.next())?;
    let data_type = lines.next()?.parse().ok()?;
    GridGeometry::new(
        geo_reference,
        DataInfo::new(bands, data_type),
        rows,
        columns,
        tile_width,
        tile_height,
    )
    .ok()
}

fn parse_u32(line: Option<&str>) -> Option<u32> {
    line?.trim().parse().ok()
}

/// Immutable `rows x columns` grid of per-tile flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TileBitmap {
    rows: u32,
    columns: u32,
    bits: Box<[bool]>,
}

impl TileBitmap {
    /// A bitmap with every flag cleared.
    pub fn empty(rows: u32, columns: u32) -> Self {
        Self::from_fn(rows, columns, |_, _| false)
    }

    /// Builds a bitmap by asking `f(column, row)` for every cell.
    pub fn from_fn<F>(rows: u32, columns: u32, mut f: F) -> Self
    where
        F: FnMut(u32, u32) -> bool,
    {
        let mut bits = Vec::with_capacity(rows as usize * columns as usize);
        for row in 0..rows {
            for column in 0..columns {
                bits.push(f(column, row));
            }
        }
        Self {
            rows,
            columns,
            bits: bits.into_boxed_slice(),
        }
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn columns(&self) -> u32 {
        self.columns
    }

    /// Flag of the tile at `(column, row)`; out of range reads as false.
    pub fn get(&self, column: u32, row: u32) -> bool {
        if column >= self.columns || row >= self.rows {
            return false;
        }
        self.bits[row as usize * self.columns as usize + column as usize]
    }

    /// Number of set flags.
    pub fn count(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    /// The `'0'`/`'1'` text line of a row.
    fn row_line(&self, row: u32) -> String {
        (0..self.columns)
            .map(|c| if self.get(c, row) { '1' } else { '0' })
            .collect()
    }
}

/// Content of a sidecar: grid geometry plus raster size and tile presence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheInfo {
    geometry: GridGeometry,
    raster_width: u32,
    raster_height: u32,
    tiles_on_file: TileBitmap,
    /// Modification time of the sidecar when it was read.
    modification_time: Option<SystemTime>,
}

impl CacheInfo {
    pub fn new(
        geometry: GridGeometry,
        raster_width: u32,
        raster_height: u32,
        tiles_on_file: Option<TileBitmap>,
        modification_time: Option<SystemTime>,
    ) -> CacheResult<Self> {
        if raster_width == 0 || raster_height == 0 {
            return Err(CacheError::InvalidGeometry(format!(
                "empty raster {raster_width}x{raster_height}"
            )));
        }
        if !geometry.covers(raster_width, raster_height) {
            return Err(CacheError::InvalidGeometry(format!(
                "grid of {}x{} tiles does not cover a {raster_width}x{raster_height} raster",
                geometry.columns, geometry.rows
            )));
        }
        let tiles_on_file = match tiles_on_file {
            Some(bitmap)
                if bitmap.rows() == geometry.rows && bitmap.columns() == geometry.columns =>
            {
                bitmap
            }
            _ => TileBitmap::empty(geometry.rows, geometry.columns),
        };
        Ok(Self {
            geometry,
            raster_width,
            raster_height,
            tiles_on_file,
            modification_time,
        })
    }

    /// A fresh info with no tiles on file, deriving the grid from the raster size.
    pub fn fresh(
        raster_width: u32,
        raster_height: u32,
        tile_size: u32,
        data_info: DataInfo,
        geo_reference: GeoReference,
    ) -> CacheResult<Self> {
        let tile_size = if tile_size == 0 { DEFAULT_TILE_SIZE } else { tile_size };
        let geometry =
            GridGeometry::for_raster(raster_width, raster_height, tile_size, data_info, geo_reference)?;
        Self::new(geometry, raster_width, raster_height, None, None)
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn raster_width(&self) -> u32 {
        self.raster_width
    }

    pub fn raster_height(&self) -> u32 {
        self.raster_height
    }

    pub fn tiles_on_file(&self) -> &TileBitmap {
        &self.tiles_on_file
    }

    pub fn modification_time(&self) -> Option<SystemTime> {
        self.modification_time
    }

    /// A copy of this info with a different presence bitmap.
    pub fn with_tiles_on_file(&self, tiles_on_file: TileBitmap) -> Self {
        let tiles_on_file = if tiles_on_file.rows() == self.geometry.rows
            && tiles_on_file.columns() == self.geometry.columns
        {
            tiles_on_file
        } else {
            TileBitmap::empty(self.geometry.rows, self.geometry.columns)
        };
        Self {
            tiles_on_file,
            ..self.clone()
        }
    }

    /// Clips `rect` to the raster bounds.
    pub fn snap_to_grid(&self, rect: &RasterRect) -> Option<RasterRect> {
        self.geometry.snap_to_raster(rect, self.raster_width, self.raster_height)
    }
}

/// Reader and writer of sidecar files.
pub struct CacheInfoFile;

impl CacheInfoFile {
    /// Writes `info` to `path`, creating or truncating the file.
    ///
    /// A failed write leaves the sidecar in an undefined state; callers must
    /// treat the cache file it describes as untrustworthy.
    pub fn write(path: &Path, info: &CacheInfo) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        write_grid_meta(&mut writer, &info.geometry)?;
        writeln!(writer, "{}", info.raster_width)?;
        writeln!(writer, "{}", info.raster_height)?;
        for row in 0..info.tiles_on_file.rows() {
            writeln!(writer, "{}", info.tiles_on_file.row_line(row))?;
        }
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        debug!(path = %path.display(), tiles_on_file = info.tiles_on_file.count(), "Wrote cache info");
        Ok(())
    }

    /// Reads a sidecar, `None` if it does not exist or cannot be parsed.
    pub fn read(path: &Path) -> Option<CacheInfo> {
        if !path.exists() {
            debug!(path = %path.display(), "No cache info file present");
            return None;
        }
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not read cache info file");
                return None;
            }
        };
        let modification_time = fs::metadata(path).and_then(|m| m.modified()).ok();
        let info = Self::parse(&contents, modification_time);
        if info.is_none() {
            warn!(path = %path.display(), "Ignoring malformed cache info file, the cache will be rebuilt");
        }
        info
    }

    fn parse(contents: &str, modification_time: Option<SystemTime>) -> Option<CacheInfo> {
        let mut lines = contents.lines();
        let geometry = read_grid_meta(&mut lines)?;
        let width = parse_u32(lines.next())?;
        let height = parse_u32(lines.next())?;

        let mut bits = Vec::with_capacity(geometry.tile_count());
        for _ in 0..geometry.rows {
            let line = lines.next()?.trim_end();
            if line.len() != geometry.columns as usize {
                return None;
            }
            for c in line.chars() {
                match c {
                    '1' => bits.push(true),
                    '0' => bits.push(false),
                    _ => return None,
                }
            }
        }
        let bitmap = TileBitmap {
            rows: geometry.rows,
            columns: geometry.columns,
            bits: bits.into_boxed_slice(),
        };
        CacheInfo::new(geometry, width, height, Some(bitmap), modification_time).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::DataType;

    fn sample_info() -> CacheInfo {
        let geo = GeoReference::new(1000.5, 2000.25, 0.5, -0.5);
        let geometry =
            GridGeometry::new(geo, DataInfo::new(3, DataType::UShort), 3, 4, 100, 80).unwrap();
        let bitmap = TileBitmap::from_fn(3, 4, |c, r| (c + r) % 2 == 0);
        CacheInfo::new(geometry, 390, 230, Some(bitmap), None).unwrap()
    }

    #[test]
    fn test_sidecar_path() {
        let path = Path::new("/tmp/cache/raster_1.rcache");
        assert_eq!(sidecar_path(path), PathBuf::from("/tmp/cache/raster_1.info"));
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.info");
        let info = sample_info();

        CacheInfoFile::write(&path, &info).unwrap();
        let read = CacheInfoFile::read(&path).unwrap();

        assert_eq!(read.geometry(), info.geometry());
        assert_eq!(read.raster_width(), 390);
        assert_eq!(read.raster_height(), 230);
        assert_eq!(read.tiles_on_file(), info.tiles_on_file());
        assert!(read.modification_time().is_some());
    }

    #[test]
    fn test_written_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layout.info");
        CacheInfoFile::write(&path, &sample_info()).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 13 + 2 + 3);
        assert_eq!(lines[0], "OUTER");
        assert_eq!(lines[13], "390");
        assert_eq!(lines[14], "230");
        assert_eq!(lines[15], "1010");
        assert_eq!(lines[16], "0101");
        assert_eq!(lines[17], "1010");
    }

    #[test]
    fn test_missing_file_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CacheInfoFile::read(&dir.path().join("nope.info")).is_none());
    }

    #[test]
    fn test_malformed_files_read_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.info");
        CacheInfoFile::write(&path, &sample_info()).unwrap();
        let good = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = good.lines().collect();

        // wrong row length
        let mut broken = lines.clone();
        broken[16] = "010";
        fs::write(&path, broken.join("\n")).unwrap();
        assert!(CacheInfoFile::read(&path).is_none());

        // unparsable width
        let mut broken = lines.clone();
        broken[13] = "wide";
        fs::write(&path, broken.join("\n")).unwrap();
        assert!(CacheInfoFile::read(&path).is_none());

        // missing rows
        fs::write(&path, lines[..16].join("\n")).unwrap();
        assert!(CacheInfoFile::read(&path).is_none());

        // grid does not cover the raster
        let mut broken = lines.clone();
        broken[13] = "100000";
        fs::write(&path, broken.join("\n")).unwrap();
        assert!(CacheInfoFile::read(&path).is_none());

        fs::write(&path, "").unwrap();
        assert!(CacheInfoFile::read(&path).is_none());
    }

    #[test]
    fn test_write_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("x.info");
        assert!(CacheInfoFile::write(&path, &sample_info()).is_err());
    }

    #[test]
    fn test_with_tiles_on_file_is_a_copy() {
        let info = sample_info();
        let updated = info.with_tiles_on_file(TileBitmap::from_fn(3, 4, |_, _| true));
        assert_eq!(updated.tiles_on_file().count(), 12);
        assert_eq!(info.tiles_on_file().count(), 6);

        let mismatched = info.with_tiles_on_file(TileBitmap::from_fn(2, 2, |_, _| true));
        assert_eq!(mismatched.tiles_on_file().count(), 0);
    }

    #[test]
    fn test_fresh_info() {
        let info =
            CacheInfo::fresh(1000, 1000, 500, DataInfo::default(), GeoReference::default()).unwrap();
        assert_eq!(info.geometry().rows, 2);
        assert_eq!(info.geometry().columns, 2);
        assert_eq!(info.tiles_on_file().count(), 0);
        assert_eq!(
            info.snap_to_grid(&RasterRect::new(900, 900, 500, 500)),
            Some(RasterRect::new(900, 900, 100, 100))
        );
    }
}
