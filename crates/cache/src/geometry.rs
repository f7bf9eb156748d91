//! Grid geometry: pixel rectangles and the pixel-to-tile mapping.
//!
//! A raster is divided into `rows x columns` tiles of `tile_width x tile_height`
//! pixels. The grid always covers the whole raster, so tiles on the right and
//! bottom edge may be padded. All types in this module are plain values with
//! no interior mutability and can be shared freely between threads.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{CacheError, CacheResult};

/// Default target edge length (in pixels) used when deriving a tile grid.
pub const DEFAULT_TILE_SIZE: u32 = 500;

/// A rectangle in raster (pixel) coordinates.
///
/// `x`/`y` may be negative for requests that start before the raster origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RasterRect {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

impl RasterRect {
    pub fn new(x: i64, y: i64, width: i64, height: i64) -> Self {
        Self { x, y, width, height }
    }

    /// Exclusive right edge.
    pub fn right(&self) -> i64 {
        self.x.saturating_add(self.width)
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> i64 {
        self.y.saturating_add(self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Number of pixels covered by this rectangle.
    pub fn area(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            (self.width * self.height) as usize
        }
    }

    /// The overlapping part of two rectangles, `None` if they do not overlap.
    pub fn intersection(&self, other: &RasterRect) -> Option<RasterRect> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        let rect = RasterRect::new(x, y, right.saturating_sub(x), bottom.saturating_sub(y));
        if rect.is_empty() {
            None
        } else {
            Some(rect)
        }
    }
}

impl fmt::Display for RasterRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.x, self.y, self.width, self.height)
    }
}

impl FromStr for RasterRect {
    type Err = CacheError;

    /// Parses `x,y,width,height`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<i64> = s
            .split(',')
            .map(|p| p.trim().parse::<i64>())
            .collect::<Result<_, _>>()
            .map_err(|_| CacheError::InvalidGeometry(format!("not a rectangle: {s}")))?;
        match parts.as_slice() {
            [x, y, w, h] => Ok(RasterRect::new(*x, *y, *w, *h)),
            _ => Err(CacheError::InvalidGeometry(format!("not a rectangle: {s}"))),
        }
    }
}

/// Where the origin of a georeference sits inside the first pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OriginLocation {
    /// Origin at the outer corner of the upper-left pixel.
    Outer,
    /// Origin at the center of the upper-left pixel.
    Center,
}

impl fmt::Display for OriginLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OriginLocation::Outer => write!(f, "OUTER"),
            OriginLocation::Center => write!(f, "CENTER"),
        }
    }
}

impl FromStr for OriginLocation {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OUTER" => Ok(OriginLocation::Outer),
            "CENTER" => Ok(OriginLocation::Center),
            other => Err(CacheError::InvalidGeometry(format!("unknown origin location: {other}"))),
        }
    }
}

/// Affine georeference of a raster: origin, resolution and rotation.
///
/// No coordinate transforms are performed with it; the cache only persists it
/// and uses it to derive cache identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoReference {
    pub location: OriginLocation,
    pub origin_x: f64,
    pub origin_y: f64,
    pub resolution_x: f64,
    pub resolution_y: f64,
    pub rotation_x: f64,
    pub rotation_y: f64,
}

impl Default for GeoReference {
    fn default() -> Self {
        Self {
            location: OriginLocation::Outer,
            origin_x: 0.0,
            origin_y: 0.0,
            resolution_x: 1.0,
            resolution_y: -1.0,
            rotation_x: 0.0,
            rotation_y: 0.0,
        }
    }
}

impl GeoReference {
    pub fn new(origin_x: f64, origin_y: f64, resolution_x: f64, resolution_y: f64) -> Self {
        Self {
            origin_x,
            origin_y,
            resolution_x,
            resolution_y,
            ..Default::default()
        }
    }

    /// The same reference with its origin moved to the outer pixel corner.
    pub fn to_outer(&self) -> Self {
        match self.location {
            OriginLocation::Outer => *self,
            OriginLocation::Center => Self {
                location: OriginLocation::Outer,
                origin_x: self.origin_x - self.resolution_x * 0.5,
                origin_y: self.origin_y - self.resolution_y * 0.5,
                ..*self
            },
        }
    }
}

impl fmt::Display for GeoReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{location={},orig_0={},orig_1={},xRes={},yRes={},xRot={},yRot={}}}",
            self.location,
            self.origin_x,
            self.origin_y,
            self.resolution_x,
            self.resolution_y,
            self.rotation_x,
            self.rotation_y
        )
    }
}

/// Sample data type of a single band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DataType {
    Byte,
    Short,
    UShort,
    Int,
    Float,
    Double,
}

impl DataType {
    /// Size of one sample in bytes.
    pub fn size(&self) -> usize {
        match self {
            DataType::Byte => 1,
            DataType::Short | DataType::UShort => 2,
            DataType::Int | DataType::Float => 4,
            DataType::Double => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::Byte => "BYTE",
            DataType::Short => "SHORT",
            DataType::UShort => "USHORT",
            DataType::Int => "INT",
            DataType::Float => "FLOAT",
            DataType::Double => "DOUBLE",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DataType {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BYTE" => Ok(DataType::Byte),
            "SHORT" => Ok(DataType::Short),
            "USHORT" => Ok(DataType::UShort),
            "INT" => Ok(DataType::Int),
            "FLOAT" => Ok(DataType::Float),
            "DOUBLE" => Ok(DataType::Double),
            other => Err(CacheError::InvalidGeometry(format!("unknown data type: {other}"))),
        }
    }
}

/// Band layout of the raster samples (pixel interleaved).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DataInfo {
    pub bands: u32,
    pub data_type: DataType,
}

impl DataInfo {
    pub fn new(bands: u32, data_type: DataType) -> Self {
        Self { bands, data_type }
    }

    /// Bytes per pixel across all bands.
    pub fn sample_size(&self) -> usize {
        self.bands as usize * self.data_type.size()
    }
}

impl Default for DataInfo {
    fn default() -> Self {
        Self::new(1, DataType::Byte)
    }
}

/// Approximate number of tiles per axis for a raster, aiming at `tile_size`
/// pixels per tile edge.
pub fn calc_approx_tiles(width: u32, height: u32, tile_size: u32) -> u32 {
    let largest = width.max(height) as f64;
    let tiles = (largest / tile_size.max(1) as f64).ceil() as u32;
    tiles.max(1)
}

/// Tile edge length needed to cover `size` pixels with `tiles` tiles.
pub fn calc_tile_size(size: u32, tiles: u32) -> u32 {
    let tile = (size as f64 / tiles.max(1) as f64).ceil() as u32;
    tile.max(1)
}

/// Inclusive range of tile indices, iterated in row-major order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub min_column: u32,
    pub min_row: u32,
    pub max_column: u32,
    pub max_row: u32,
}

impl TileRange {
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        (self.min_row..=self.max_row)
            .flat_map(move |row| (self.min_column..=self.max_column).map(move |col| (col, row)))
    }

    pub fn tile_count(&self) -> usize {
        (self.max_column - self.min_column + 1) as usize * (self.max_row - self.min_row + 1) as usize
    }
}

/// The tile layout of a raster.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GridGeometry {
    pub geo_reference: GeoReference,
    pub data_info: DataInfo,
    pub rows: u32,
    pub columns: u32,
    pub tile_width: u32,
    pub tile_height: u32,
}

impl GridGeometry {
    pub fn new(
        geo_reference: GeoReference,
        data_info: DataInfo,
        rows: u32,
        columns: u32,
        tile_width: u32,
        tile_height: u32,
    ) -> CacheResult<Self> {
        if rows == 0 || columns == 0 || tile_width == 0 || tile_height == 0 {
            return Err(CacheError::InvalidGeometry(format!(
                "grid of {rows}x{columns} tiles of {tile_width}x{tile_height} pixels"
            )));
        }
        if data_info.bands == 0 {
            return Err(CacheError::InvalidGeometry("raster without bands".to_string()));
        }
        Ok(Self {
            geo_reference,
            data_info,
            rows,
            columns,
            tile_width,
            tile_height,
        })
    }

    /// Derives a grid for a raster of `width x height` pixels with tiles of
    /// roughly `tile_size` pixels per edge.
    pub fn for_raster(
        width: u32,
        height: u32,
        tile_size: u32,
        data_info: DataInfo,
        geo_reference: GeoReference,
    ) -> CacheResult<Self> {
        if width == 0 || height == 0 {
            return Err(CacheError::InvalidGeometry(format!("empty raster {width}x{height}")));
        }
        let tiles = calc_approx_tiles(width, height, tile_size);
        let tile_width = calc_tile_size(width, tiles);
        let tile_height = calc_tile_size(height, tiles);
        let columns = width.div_ceil(tile_width);
        let rows = height.div_ceil(tile_height);
        Self::new(geo_reference.to_outer(), data_info, rows, columns, tile_width, tile_height)
    }

    pub fn sample_size(&self) -> usize {
        self.data_info.sample_size()
    }

    /// Size of one tile slot in bytes.
    pub fn tile_bytes(&self) -> usize {
        self.tile_width as usize * self.tile_height as usize * self.sample_size()
    }

    pub fn tile_count(&self) -> usize {
        self.rows as usize * self.columns as usize
    }

    /// Width of the area covered by the grid, including edge padding.
    pub fn grid_width(&self) -> i64 {
        self.columns as i64 * self.tile_width as i64
    }

    pub fn grid_height(&self) -> i64 {
        self.rows as i64 * self.tile_height as i64
    }

    /// Whether the grid covers a raster of the given size.
    pub fn covers(&self, width: u32, height: u32) -> bool {
        self.grid_width() >= width as i64 && self.grid_height() >= height as i64
    }

    pub fn contains_tile(&self, column: u32, row: u32) -> bool {
        column < self.columns && row < self.rows
    }

    /// Stable, collision-free id of the tile at `(column, row)`.
    pub fn tile_id(&self, column: u32, row: u32) -> usize {
        row as usize * self.columns as usize + column as usize
    }

    /// Inverse of [`tile_id`](Self::tile_id).
    pub fn tile_position(&self, tile_id: usize) -> (u32, u32) {
        let columns = self.columns as usize;
        ((tile_id % columns) as u32, (tile_id / columns) as u32)
    }

    /// Pixel rectangle covered by the tile at `(column, row)`.
    pub fn tile_rect(&self, column: u32, row: u32) -> RasterRect {
        RasterRect::new(
            column as i64 * self.tile_width as i64,
            row as i64 * self.tile_height as i64,
            self.tile_width as i64,
            self.tile_height as i64,
        )
    }

    /// Clips a rectangle to the area covered by the grid.
    pub fn snap_to_grid(&self, rect: &RasterRect) -> Option<RasterRect> {
        rect.intersection(&RasterRect::new(0, 0, self.grid_width(), self.grid_height()))
    }

    /// Clips a rectangle to the (un-padded) raster bounds.
    pub fn snap_to_raster(&self, rect: &RasterRect, width: u32, height: u32) -> Option<RasterRect> {
        let bounds = RasterRect::new(0, 0, width as i64, height as i64);
        self.snap_to_grid(rect)?.intersection(&bounds)
    }

    /// Inclusive tile bounding box covering `rect`, clamped to the grid.
    pub fn intersecting_tiles(&self, rect: &RasterRect) -> Option<TileRange> {
        let rect = self.snap_to_grid(rect)?;
        let tw = self.tile_width as i64;
        let th = self.tile_height as i64;
        let clamp_col = |v: i64| v.clamp(0, self.columns as i64 - 1) as u32;
        let clamp_row = |v: i64| v.clamp(0, self.rows as i64 - 1) as u32;
        Some(TileRange {
            min_column: clamp_col(rect.x / tw),
            min_row: clamp_row(rect.y / th),
            max_column: clamp_col((rect.right() - 1) / tw),
            max_row: clamp_row((rect.bottom() - 1) / th),
        })
    }
}

/// Copies the overlap of `src_rect` and `dst_rect` from `src` into `dst`.
///
/// Both buffers are row-major with `sample_size` bytes per pixel and are laid
/// out exactly as their rectangles. Returns false if the rectangles do not
/// overlap.
pub fn copy_values(
    src_rect: &RasterRect,
    dst_rect: &RasterRect,
    src: &[u8],
    dst: &mut [u8],
    sample_size: usize,
) -> bool {
    let Some(inter) = src_rect.intersection(dst_rect) else {
        return false;
    };
    let line = inter.width as usize * sample_size;
    let src_x = (inter.x - src_rect.x) as usize;
    let src_y = (inter.y - src_rect.y) as usize;
    let dst_x = (inter.x - dst_rect.x) as usize;
    let dst_y = (inter.y - dst_rect.y) as usize;
    let src_width = src_rect.width as usize;
    let dst_width = dst_rect.width as usize;

    for r in 0..inter.height as usize {
        let src_pos = (src_x + (src_y + r) * src_width) * sample_size;
        let dst_pos = (dst_x + (dst_y + r) * dst_width) * sample_size;
        if src_pos + line > src.len() || dst_pos + line > dst.len() {
            // short buffer, copy what is there
            break;
        }
        dst[dst_pos..dst_pos + line].copy_from_slice(&src[src_pos..src_pos + line]);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_2x2() -> GridGeometry {
        GridGeometry::new(GeoReference::default(), DataInfo::default(), 2, 2, 500, 500).unwrap()
    }

    #[test]
    fn test_rect_intersection() {
        let a = RasterRect::new(0, 0, 10, 10);
        let b = RasterRect::new(5, 5, 10, 10);
        assert_eq!(a.intersection(&b), Some(RasterRect::new(5, 5, 5, 5)));

        let c = RasterRect::new(10, 0, 5, 5);
        assert_eq!(a.intersection(&c), None);
    }

    #[test]
    fn test_far_rect_is_empty() {
        let raster = RasterRect::new(0, 0, 100, 100);
        let far_right = RasterRect::new(i64::MAX - 5, 0, 10, 10);
        assert_eq!(far_right.right(), i64::MAX);
        assert_eq!(raster.intersection(&far_right), None);
        assert_eq!(far_right.intersection(&raster), None);

        let far_left = RasterRect::new(i64::MIN, i64::MIN, 10, 10);
        assert_eq!(raster.intersection(&far_left), None);

        let grid = grid_2x2();
        assert_eq!(grid.snap_to_raster(&far_right, 1000, 1000), None);
        assert!(grid.intersecting_tiles(&far_right).is_none());
    }

    #[test]
    fn test_rect_parse() {
        let rect: RasterRect = "400, 400,300,300".parse().unwrap();
        assert_eq!(rect, RasterRect::new(400, 400, 300, 300));
        assert!("1,2,3".parse::<RasterRect>().is_err());
        assert!("a,b,c,d".parse::<RasterRect>().is_err());
    }

    #[test]
    fn test_tile_id_is_collision_free() {
        let grid = GridGeometry::new(GeoReference::default(), DataInfo::default(), 7, 13, 10, 10)
            .unwrap();
        let mut seen = std::collections::HashSet::new();
        for row in 0..grid.rows {
            for col in 0..grid.columns {
                let id = grid.tile_id(col, row);
                assert!(seen.insert(id));
                assert_eq!(grid.tile_position(id), (col, row));
            }
        }
        assert_eq!(seen.len(), grid.tile_count());
    }

    #[test]
    fn test_snap_to_grid() {
        let grid = grid_2x2();
        assert_eq!(
            grid.snap_to_grid(&RasterRect::new(-100, -100, 300, 300)),
            Some(RasterRect::new(0, 0, 200, 200))
        );
        assert_eq!(grid.snap_to_grid(&RasterRect::new(1000, 0, 10, 10)), None);
        assert_eq!(grid.snap_to_grid(&RasterRect::new(-20, 0, 10, 10)), None);
    }

    #[test]
    fn test_snap_to_raster_uses_unpadded_bounds() {
        let grid = GridGeometry::for_raster(
            900,
            700,
            500,
            DataInfo::default(),
            GeoReference::default(),
        )
        .unwrap();
        assert!(grid.covers(900, 700));
        let snapped = grid.snap_to_raster(&RasterRect::new(800, 600, 500, 500), 900, 700);
        assert_eq!(snapped, Some(RasterRect::new(800, 600, 100, 100)));
    }

    #[test]
    fn test_intersecting_tiles() {
        let grid = grid_2x2();
        let range = grid.intersecting_tiles(&RasterRect::new(400, 400, 300, 300)).unwrap();
        assert_eq!(
            range,
            TileRange { min_column: 0, min_row: 0, max_column: 1, max_row: 1 }
        );
        assert_eq!(range.iter().collect::<Vec<_>>(), vec![(0, 0), (1, 0), (0, 1), (1, 1)]);

        let range = grid.intersecting_tiles(&RasterRect::new(0, 0, 500, 500)).unwrap();
        assert_eq!(range.tile_count(), 1);

        let range = grid.intersecting_tiles(&RasterRect::new(499, 500, 1, 5000)).unwrap();
        assert_eq!(range.iter().collect::<Vec<_>>(), vec![(0, 1)]);
    }

    #[test]
    fn test_for_raster_heuristic() {
        let grid =
            GridGeometry::for_raster(1000, 1000, 500, DataInfo::default(), GeoReference::default())
                .unwrap();
        assert_eq!((grid.rows, grid.columns, grid.tile_width, grid.tile_height), (2, 2, 500, 500));

        let grid =
            GridGeometry::for_raster(1200, 300, 500, DataInfo::default(), GeoReference::default())
                .unwrap();
        assert_eq!((grid.columns, grid.tile_width), (3, 400));
        assert_eq!((grid.rows, grid.tile_height), (3, 100));
        assert!(grid.covers(1200, 300));

        let grid = GridGeometry::for_raster(17, 3, 500, DataInfo::default(), GeoReference::default())
            .unwrap();
        assert_eq!((grid.rows, grid.columns), (1, 1));

        assert!(GridGeometry::for_raster(0, 3, 500, DataInfo::default(), GeoReference::default())
            .is_err());
    }

    #[test]
    fn test_tile_bytes_uses_sample_size() {
        let info = DataInfo::new(3, DataType::Float);
        assert_eq!(info.sample_size(), 12);
        let grid = GridGeometry::new(GeoReference::default(), info, 1, 1, 4, 2).unwrap();
        assert_eq!(grid.tile_bytes(), 4 * 2 * 12);
    }

    #[test]
    fn test_copy_values() {
        // 4x4 source with value = y * 4 + x
        let src_rect = RasterRect::new(0, 0, 4, 4);
        let src: Vec<u8> = (0..16).collect();
        let dst_rect = RasterRect::new(2, 2, 4, 4);
        let mut dst = vec![0xffu8; 16];

        assert!(copy_values(&src_rect, &dst_rect, &src, &mut dst, 1));
        assert_eq!(&dst[0..2], &[10, 11]);
        assert_eq!(&dst[4..6], &[14, 15]);
        assert_eq!(dst[2], 0xff);
        assert_eq!(dst[8], 0xff);

        let far = RasterRect::new(100, 100, 2, 2);
        assert!(!copy_values(&src_rect, &far, &src, &mut dst, 1));
    }

    #[test]
    fn test_geo_reference_display_and_relocation() {
        let geo = GeoReference {
            location: OriginLocation::Center,
            ..GeoReference::new(10.0, 20.0, 2.0, -2.0)
        };
        let outer = geo.to_outer();
        assert_eq!(outer.location, OriginLocation::Outer);
        assert_eq!(outer.origin_x, 9.0);
        assert_eq!(outer.origin_y, 21.0);
        assert!(outer.to_string().starts_with("{location=OUTER,orig_0=9,"));
    }
}
