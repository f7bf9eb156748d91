//! Error types for the raster cache.

use std::io;

use crate::config::ConfigError;

/// Errors surfaced by the raster cache.
///
/// Most cache-layer failures (tile reads, tile writes, sidecar parsing) are
/// recovered locally and never reach this type. What remains are the failures
/// a caller has to see: allocation failures, invalid geometry and real source
/// reader errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("could not allocate a buffer of {size} bytes")]
    Allocation { size: usize },
    #[error("invalid raster geometry: {0}")]
    InvalidGeometry(String),
    #[error("buffer has the wrong size: expected {expected} bytes, got {actual}")]
    BufferSize { expected: usize, actual: usize },
    #[error("tile ({column}, {row}) is outside of the grid")]
    TileOutOfRange { column: u32, row: u32 },
    #[error("source reader failed: {0}")]
    Source(String),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type CacheResult<T> = Result<T, CacheError>;
